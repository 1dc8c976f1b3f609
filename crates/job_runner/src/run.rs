use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RunState;

/// Per-data-type slice of a run's progress, with the same cumulative counter semantics
/// as the top-level counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TypeProgress {
    pub fetched_count: u64,
    pub stored_count: u64,
    pub error_count: u64,
}

/// One durable instance of the fetch→store pipeline.
///
/// Counters only ever grow: progress updates add deltas, never replace, so a run's
/// history stays monotonic across pauses, crashes, and resumes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub state: RunState,
    pub data_type: String,
    pub start_index: u64,
    pub results_per_batch: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub fetched_count: u64,
    #[serde(default)]
    pub stored_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub progress: BTreeMap<String, TypeProgress>,
}

impl JobRun {
    pub(crate) fn new(
        id: String,
        start_index: u64,
        results_per_batch: u64,
        data_type: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: RunState::Queued,
            data_type,
            start_index,
            results_per_batch,
            created_at: now,
            updated_at: now,
            fetched_count: 0,
            stored_count: 0,
            error_count: 0,
            error_message: None,
            progress: BTreeMap::new(),
        }
    }

    /// Adds deltas to the run counters and the per-type sub-record for its data type.
    pub(crate) fn apply_progress(&mut self, fetched: u64, stored: u64, errors: u64) {
        self.fetched_count += fetched;
        self.stored_count += stored;
        self.error_count += errors;
        let slice = self.progress.entry(self.data_type.clone()).or_default();
        slice.fetched_count += fetched;
        slice.stored_count += stored;
        slice.error_count += errors;
    }
}
