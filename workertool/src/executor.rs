use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Child;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::connection::Connection;
use crate::launch::{LaunchedWorker, WorkerLauncher, WorkerReader, WorkerWriter};
use crate::proto::{worker_event, LogEvent, LogLevel, ResultEvent, WorkerCommand, WorkerEvent};
use crate::Error;

/// How long a worker gets to exit on its own after being asked to shut down.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerToolState {
    NotStarted,
    Running,
    ShutDown,
}

impl fmt::Display for WorkerToolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerToolState::NotStarted => write!(f, "not started"),
            WorkerToolState::Running => write!(f, "running"),
            WorkerToolState::ShutDown => write!(f, "shut down"),
        }
    }
}

/// Drives one persistent worker through its lifecycle.
///
/// `NotStarted` becomes `Running` through [WorkerToolExecutor::launch],
/// and `ShutDown` through [WorkerToolExecutor::shutdown] or a failing
/// [WorkerToolExecutor::execute_command]. Nothing leaves `ShutDown`.
#[async_trait]
pub trait WorkerToolExecutor: Send {
    fn state(&self) -> WorkerToolState;

    /// Starts the worker. Only valid if not started yet.
    async fn launch(&mut self) -> Result<(), Error>;

    /// Sends `command` to the worker, and waits for its result, however long
    /// that takes. Only valid while running.
    async fn execute_command(&mut self, action_id: &str, command: Bytes)
        -> Result<ResultEvent, Error>;

    /// Stops the worker, if it's running. Never fails, and can be called
    /// any number of times.
    async fn shutdown(&mut self);
}

/// A running worker.
struct Session {
    connection: Connection<WorkerReader, WorkerWriter>,
    child: Option<Child>,
}

impl Session {
    async fn execute(&mut self, action_id: &str, command: Bytes) -> Result<ResultEvent, Error> {
        self.connection
            .send(&WorkerCommand::execute(action_id, command))
            .await?;

        loop {
            let event = self
                .connection
                .recv::<WorkerEvent>()
                .await?
                .ok_or(Error::WorkerExited)?;

            match event.event {
                Some(worker_event::Event::Result(result)) => {
                    if result.action_id != action_id {
                        return Err(Error::UnexpectedActionId {
                            expected: action_id.to_string(),
                            got: result.action_id,
                        });
                    }
                    return Ok(result);
                }
                Some(worker_event::Event::Log(log)) => emit_log(&log),
                None => return Err(Error::UnexpectedEvent),
            }
        }
    }

    /// Asks the worker to exit, closes its stdin, and kills it if it's
    /// still around after the grace period.
    async fn shutdown(mut self) {
        if let Err(e) = self.connection.send(&WorkerCommand::shutdown()).await {
            debug!(err = %e, "unable to send shutdown command");
        }
        if let Err(e) = self.connection.close_writer().await {
            debug!(err = %e, "unable to close worker stdin");
        }

        let Some(mut child) = self.child.take() else {
            return;
        };

        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "worker exited"),
            Ok(Err(e)) => warn!(err = %e, "unable to wait for worker"),
            Err(_) => {
                warn!(grace_period = ?SHUTDOWN_GRACE_PERIOD, "worker didn't exit, killing it");
                if let Err(e) = child.kill().await {
                    warn!(err = %e, "unable to kill worker");
                }
            }
        }
    }
}

// Worker logs end up in our own log, at the level the worker chose.
fn emit_log(log: &LogEvent) {
    let action_id = log.action_id.as_str();
    let message = log.message.as_str();

    match log.level() {
        LogLevel::Error => error!(worker.action_id = action_id, "{}", message),
        LogLevel::Warn => warn!(worker.action_id = action_id, "{}", message),
        LogLevel::Info | LogLevel::Unknown => info!(worker.action_id = action_id, "{}", message),
        LogLevel::Debug => debug!(worker.action_id = action_id, "{}", message),
        LogLevel::Trace => trace!(worker.action_id = action_id, "{}", message),
    }
}

enum State {
    NotStarted,
    Running(Session),
    ShutDown,
}

/// The [WorkerToolExecutor] for workers started by a [WorkerLauncher].
pub struct WorkerTool {
    launcher: Arc<dyn WorkerLauncher>,
    state: State,
}

impl WorkerTool {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            state: State::NotStarted,
        }
    }
}

#[async_trait]
impl WorkerToolExecutor for WorkerTool {
    fn state(&self) -> WorkerToolState {
        match self.state {
            State::NotStarted => WorkerToolState::NotStarted,
            State::Running(_) => WorkerToolState::Running,
            State::ShutDown => WorkerToolState::ShutDown,
        }
    }

    #[instrument(skip_all, err)]
    async fn launch(&mut self) -> Result<(), Error> {
        if !matches!(self.state, State::NotStarted) {
            return Err(Error::AlreadyStarted(self.state()));
        }

        let LaunchedWorker {
            reader,
            writer,
            child,
        } = self.launcher.launch().await?;

        self.state = State::Running(Session {
            connection: Connection::new(reader, writer),
            child,
        });

        Ok(())
    }

    #[instrument(skip(self, command), fields(worker.action_id = action_id), err)]
    async fn execute_command(
        &mut self,
        action_id: &str,
        command: Bytes,
    ) -> Result<ResultEvent, Error> {
        let State::Running(session) = &mut self.state else {
            return Err(Error::NotRunning(self.state()));
        };

        let result = session.execute(action_id, command).await;

        if result.is_err() {
            // the worker is in an unknown state now
            self.shutdown().await;
        }

        result
    }

    async fn shutdown(&mut self) {
        match std::mem::replace(&mut self.state, State::ShutDown) {
            State::Running(session) => {
                session.shutdown().await;
                debug!("worker shut down");
            }
            State::NotStarted => debug!("worker never started"),
            State::ShutDown => {}
        }
    }
}
