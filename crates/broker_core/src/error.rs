use thiserror::Error;

use crate::CodecError;

/// Errors surfaced by the broker's public operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("process id `{id}` already exists")]
    DuplicateId { id: String },
    #[error("unknown process `{id}`")]
    UnknownProcess { id: String },
    #[error("process `{id}` already exited")]
    AlreadyExited { id: String },
    #[error("`{command}` could not be spawned: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child `{id}` stdin unavailable")]
    StdinUnavailable { id: String },
    #[error("child `{id}` stdout unavailable")]
    StdoutUnavailable { id: String },
    #[error("child `{id}` stderr unavailable")]
    StderrUnavailable { id: String },
    #[error("failed to write to `{id}` stdin: {source}")]
    StdinWrite {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("broker is shut down")]
    ShutDown,
    #[error("receive cancelled")]
    Cancelled,
    #[error(transparent)]
    Codec(#[from] CodecError),
}
