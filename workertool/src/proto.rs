//! Messages exchanged with a worker tool, generated from
//! `protos/rexec/worker/v1/worker.proto`.

use bytes::Bytes;

include!(concat!(env!("OUT_DIR"), "/rexec.worker.v1.rs"));

impl WorkerCommand {
    pub fn execute(action_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            action_id: action_id.into(),
            command_type: CommandType::Execute as i32,
            payload,
        }
    }

    pub fn shutdown() -> Self {
        Self {
            action_id: String::new(),
            command_type: CommandType::Shutdown as i32,
            payload: Bytes::new(),
        }
    }
}

impl From<ResultEvent> for WorkerEvent {
    fn from(value: ResultEvent) -> Self {
        Self {
            event: Some(worker_event::Event::Result(value)),
        }
    }
}

impl From<LogEvent> for WorkerEvent {
    fn from(value: LogEvent) -> Self {
        Self {
            event: Some(worker_event::Event::Log(value)),
        }
    }
}
