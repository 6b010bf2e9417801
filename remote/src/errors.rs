use thiserror::Error;
use tonic::Status;

/// Errors of the remote execution clients.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] rexec_castore::Error),

    /// Connection-level failures of execution calls, including exceeded
    /// deadlines.
    #[error("transport error: {0}")]
    Transport(Status),

    #[error("unable to connect: {0}")]
    Channel(#[from] rexec_castore::tonic::Error),

    /// The channel couldn't be closed, even after retrying once.
    #[error("unable to close channel to {authority}")]
    ChannelClose { authority: String },

    /// The execution engine reported the action as failed to run. This is
    /// different from the action running and exiting non-zero.
    #[error("execution failed: {0}")]
    Execution(Status),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation stream ended before the execution completed")]
    IncompleteExecution,
}

impl From<Status> for Error {
    fn from(value: Status) -> Self {
        Self::Transport(value)
    }
}
