use std::io;

use thiserror::Error;

use crate::WorkerToolState;

#[derive(Debug, Error)]
pub enum Error {
    /// The environment variable pointing to the worker artifact isn't set.
    #[error("{0} is not set, don't know which worker to launch")]
    LaunchArtifactUnset(&'static str),

    #[error("launch command is empty")]
    EmptyLaunchCommand,

    #[error("unable to launch worker: {0}")]
    Launch(#[source] io::Error),

    #[error("worker tool is {0}, not running")]
    NotRunning(WorkerToolState),

    #[error("worker tool is {0}, can't be launched")]
    AlreadyStarted(WorkerToolState),

    #[error("i/o error talking to worker: {0}")]
    Io(#[from] io::Error),

    #[error("unable to decode message from worker: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("worker exited before sending a result")]
    WorkerExited,

    #[error("expected result for action {expected}, got one for {got}")]
    UnexpectedActionId { expected: String, got: String },

    #[error("worker sent an event of unknown type")]
    UnexpectedEvent,
}
