//! Running commands on persistent worker tools.
//!
//! A worker is a long-lived process reading [proto::WorkerCommand]s from its
//! stdin and writing [proto::WorkerEvent]s to its stdout. [WorkerTool] drives
//! one from the executor side, [serve] implements the worker side.

mod connection;
mod errors;
mod executor;
mod launch;
pub mod proto;
mod server;
mod step;

pub use connection::Connection;
pub use errors::Error;
pub use executor::{WorkerTool, WorkerToolExecutor, WorkerToolState, SHUTDOWN_GRACE_PERIOD};
pub use launch::{
    LaunchCommand, LaunchedWorker, WorkerLauncher, WorkerReader, WorkerWriter,
    LAUNCH_ARTIFACT_ENV,
};
pub use server::{serve, WorkerResponse};
pub use step::{StepExecutionResult, WorkerToolStep, ERROR_EXIT_CODE};
