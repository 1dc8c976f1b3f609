use serde::{Deserialize, Serialize};

/// Lifecycle state of a job run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl RunState {
    /// Completed, Failed, and Stopped are final; nothing transitions out of them.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Stopped)
    }

    /// A run counts against the single-active-run invariant while Running or Paused.
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The exhaustive legality table for run state changes.
pub fn can_transition(from: RunState, to: RunState) -> bool {
    use RunState::*;
    matches!(
        (from, to),
        (Queued, Running)
            | (Queued, Stopped)
            | (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Stopped)
            | (Paused, Running)
            | (Paused, Stopped)
    )
}
