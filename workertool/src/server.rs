use std::future::Future;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument, warn};

use crate::connection::Connection;
use crate::proto::{CommandType, LogEvent, LogLevel, ResultEvent, WorkerCommand, WorkerEvent};
use crate::{Error, ERROR_EXIT_CODE};

/// What a worker reports back for one command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerResponse {
    pub exit_code: i32,
    pub message: String,
    /// Sent ahead of the result, in order.
    pub logs: Vec<(LogLevel, String)>,
}

impl WorkerResponse {
    pub fn exit(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
            logs: vec![],
        }
    }

    pub fn with_log(mut self, level: LogLevel, message: impl Into<String>) -> Self {
        self.logs.push((level, message.into()));
        self
    }
}

/// The worker side of the protocol: reads commands from `reader` and
/// answers each EXECUTE command with the response `handler` produces for
/// its action id and payload.
///
/// Returns once a SHUTDOWN command arrives, or `reader` is at EOF.
#[instrument(skip_all, err)]
pub async fn serve<R, W, H, F>(reader: R, writer: W, mut handler: H) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: FnMut(String, Bytes) -> F,
    F: Future<Output = WorkerResponse>,
{
    let mut connection = Connection::new(reader, writer);

    while let Some(command) = connection.recv::<WorkerCommand>().await? {
        let response = match command.command_type() {
            CommandType::Shutdown => {
                debug!("shutdown requested");
                break;
            }
            CommandType::Execute => {
                debug!(worker.action_id = %command.action_id, "executing command");
                handler(command.action_id.clone(), command.payload).await
            }
            CommandType::Unknown => {
                warn!(
                    worker.action_id = %command.action_id,
                    command_type = command.command_type,
                    "unknown command type"
                );
                WorkerResponse::exit(ERROR_EXIT_CODE, "unknown command type")
            }
        };

        for (level, message) in response.logs {
            let event: WorkerEvent = LogEvent {
                action_id: command.action_id.clone(),
                level: level as i32,
                message,
            }
            .into();
            connection.send(&event).await?;
        }

        let event: WorkerEvent = ResultEvent {
            action_id: command.action_id,
            exit_code: response.exit_code,
            message: response.message,
        }
        .into();
        connection.send(&event).await?;
    }

    connection.close_writer().await
}
