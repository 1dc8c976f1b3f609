use thiserror::Error;

use crate::RunState;

/// Errors surfaced by the run store and the executor's control operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("run `{id}` not found")]
    RunNotFound { id: String },
    #[error("run `{id}` already exists")]
    DuplicateRun { id: String },
    #[error("illegal transition {from} -> {to} for run `{id}`")]
    IllegalTransition {
        id: String,
        from: RunState,
        to: RunState,
    },
    #[error("a run is already active (`{id}`)")]
    AlreadyActive { id: String },
    #[error("run `{id}` is {actual}, expected {expected}")]
    StateMismatch {
        id: String,
        expected: RunState,
        actual: RunState,
    },
    #[error("results_per_batch must be greater than zero")]
    InvalidBatchSize,
    #[error("run store error: {0}")]
    Store(#[from] sled::Error),
    #[error("failed to serialize run `{id}`: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode stored run `{id}`: {source}")]
    Decode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}
