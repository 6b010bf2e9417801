use std::sync::Arc;

use bytes::Bytes;
use tracing::{instrument, warn};

use crate::executor::{WorkerTool, WorkerToolExecutor};
use crate::launch::WorkerLauncher;
use crate::Error;

/// The exit code reported for a step whose command couldn't be executed.
pub const ERROR_EXIT_CODE: i32 = 1;

/// The outcome of one [WorkerToolStep].
#[derive(Debug)]
pub struct StepExecutionResult {
    pub exit_code: i32,
    /// The command line of the worker the command was sent to.
    pub executed_command: Vec<String>,
    pub stderr: Option<String>,
    /// Why the command failed, if it did.
    pub cause: Option<Error>,
}

impl StepExecutionResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.cause.is_none()
    }
}

/// Runs a single serialized command on a fresh worker: launch, execute,
/// shut down.
pub struct WorkerToolStep {
    launcher: Arc<dyn WorkerLauncher>,
    command: Bytes,
}

impl WorkerToolStep {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, command: Bytes) -> Self {
        Self { launcher, command }
    }

    pub async fn execute(&self, action_id: &str) -> Result<StepExecutionResult, Error> {
        let mut tool = WorkerTool::new(self.launcher.clone());
        self.execute_with(&mut tool, action_id).await
    }

    /// Like [WorkerToolStep::execute], on an executor that hasn't been
    /// launched yet. The executor is shut down afterwards, whatever happens.
    ///
    /// A worker that can't be launched is an error. A command that can't be
    /// executed is not, it's reported with [ERROR_EXIT_CODE] and its cause.
    #[instrument(skip(self, executor), fields(worker.action_id = action_id), err)]
    pub async fn execute_with(
        &self,
        executor: &mut dyn WorkerToolExecutor,
        action_id: &str,
    ) -> Result<StepExecutionResult, Error> {
        if let Err(e) = executor.launch().await {
            executor.shutdown().await;
            return Err(e);
        }

        let executed_command = self.launcher.command_line();
        let result = match executor
            .execute_command(action_id, self.command.clone())
            .await
        {
            Ok(event) => StepExecutionResult {
                exit_code: event.exit_code,
                executed_command,
                stderr: Some(format!("ResultEvent : {:?}", event)),
                cause: None,
            },
            Err(e) => {
                warn!(err = %e, "unable to execute command");
                StepExecutionResult {
                    exit_code: ERROR_EXIT_CODE,
                    executed_command,
                    stderr: Some(format!("ActionId: {}", action_id)),
                    cause: Some(e),
                }
            }
        };

        executor.shutdown().await;

        Ok(result)
    }
}
