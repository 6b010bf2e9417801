use thiserror::Error;
use tonic::Status;

use crate::Digest;

/// Errors related to talking to the content-addressed storage.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-level failures, including exceeded deadlines. Never
    /// retried in here.
    #[error("transport error: {0}")]
    Transport(#[from] Status),

    /// A blob stream completed, but what arrived doesn't match the
    /// requested digest.
    #[error(
        "digest of received bytes {observed_hash}:{observed_size} doesn't match expected digest {expected}"
    )]
    Integrity {
        expected: Digest,
        observed_hash: String,
        observed_size: u64,
    },

    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] crate::digests::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to upload {digest}: {status}")]
    Upload { digest: Digest, status: Status },

    /// Failures of the local side, like a sink refusing bytes.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this is a deadline-exceeded transport error.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::Transport(status) if status.code() == tonic::Code::DeadlineExceeded)
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            Error::InvalidRequest(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            Error::Integrity { .. } => Self::new(std::io::ErrorKind::InvalidData, value),
            e => Self::other(e),
        }
    }
}
