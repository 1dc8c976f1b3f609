use std::{
    sync::atomic::{AtomicBool, Ordering},
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;

use crate::BrokerError;

/// Lifecycle state of a supervised child.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Exited,
    Failed,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Exited => "exited",
            ProcessStatus::Failed => "failed",
        }
    }
}

/// Auto-restart budget for children spawned with restart supervision.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
}

/// Owned, point-in-time copy of a process record. Lookups never hand out pipe handles.
#[derive(Clone, Debug)]
pub struct ProcessSnapshot {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub restarts: u32,
}

#[derive(Debug)]
pub(crate) struct ProcessState {
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub restarts: u32,
}

/// Per-child bookkeeping owned by the broker. The stdin writer lives behind an async
/// mutex so concurrent senders serialize per recipient; the stdout/stderr readers are
/// taken by the reader tasks at spawn time and never stored here.
pub(crate) struct ProcessEntry {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub rpc_peer: bool,
    pub restart: Option<RestartPolicy>,
    pub state: Mutex<ProcessState>,
    pub stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    /// Cancelled by `Broker::kill` to ask the waiter task to tear the child down.
    pub kill_requested: CancellationToken,
    /// Cancelled by the waiter once the record is finalized; `kill` waits on this.
    pub exit_done: CancellationToken,
    /// Set on explicit kill so the supervisor does not treat the exit as restartable.
    pub killed: AtomicBool,
}

impl ProcessEntry {
    pub fn new(
        id: String,
        command: String,
        args: Vec<String>,
        pid: Option<u32>,
        rpc_peer: bool,
        restart: Option<RestartPolicy>,
        restarts: u32,
        stdin: ChildStdin,
    ) -> Self {
        Self {
            id,
            command,
            args,
            rpc_peer,
            restart,
            state: Mutex::new(ProcessState {
                pid,
                status: ProcessStatus::Running,
                exit_code: None,
                start_time: Utc::now(),
                end_time: None,
                restarts,
            }),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            kill_requested: CancellationToken::new(),
            exit_done: CancellationToken::new(),
            killed: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ProcessSnapshot {
            id: self.id.clone(),
            pid: state.pid,
            command: self.command.clone(),
            args: self.args.clone(),
            status: state.status,
            exit_code: state.exit_code,
            start_time: state.start_time,
            end_time: state.end_time,
            restarts: state.restarts,
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).status
    }

    pub fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Finalizes the record after the child has been reaped.
    pub fn mark_exited(&self, exit_code: Option<i32>, failed: bool) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.status = if failed { ProcessStatus::Failed } else { ProcessStatus::Exited };
        state.exit_code = exit_code;
        state.end_time = Some(Utc::now());
    }
}

/// Spawns a child, retrying briefly when the executable is momentarily busy
/// (text file busy right after an install or copy).
pub(crate) fn spawn_with_retry(command: &mut Command, program: &str) -> Result<Child, BrokerError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(BrokerError::Spawn {
                    command: program.to_string(),
                    source,
                });
            }
        }
    }

    unreachable!("spawn_with_retry should return before exhausting retries")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reflects_exit() {
        let mut command = Command::new("true");
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        let mut child = spawn_with_retry(&mut command, "true").unwrap();
        let stdin = child.stdin.take().unwrap();
        let entry = ProcessEntry::new(
            "t".into(),
            "true".into(),
            Vec::new(),
            child.id(),
            false,
            None,
            0,
            stdin,
        );
        assert_eq!(entry.status(), ProcessStatus::Running);

        let status = child.wait().await.unwrap();
        entry.mark_exited(status.code(), !status.success());
        let snap = entry.snapshot();
        assert_eq!(snap.status, ProcessStatus::Exited);
        assert_eq!(snap.exit_code, Some(0));
        assert!(snap.end_time.is_some());
    }

    #[test]
    fn spawn_failure_names_the_command() {
        let mut command = Command::new("/definitely/not/a/binary");
        let err = spawn_with_retry(&mut command, "/definitely/not/a/binary").unwrap_err();
        match err {
            BrokerError::Spawn { command, .. } => assert!(command.contains("not/a/binary")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
