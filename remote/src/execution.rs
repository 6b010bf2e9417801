use std::path::{Component, Path};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use rexec_castore::cas::ContentAddressedStorage;
use rexec_castore::proto::{
    self, execute_operation_metadata::Stage, make_untimed_request, operation, AnyExt,
    ExecutionClient, RemoteExecutionMetadata,
};
use rexec_castore::tonic::{ChannelLease, GrpcChannel};
use rexec_castore::Digest;
use tonic::Status;
use tracing::{debug, instrument, warn};

use crate::Error;

type OperationStream = Pin<Box<dyn Stream<Item = Result<proto::Operation, Status>> + Send>>;

/// Where an execution currently is, as reported by the execution engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStage {
    Unknown,
    CacheCheck,
    Queued,
    Executing,
    Completed,
}

impl From<Stage> for ExecutionStage {
    fn from(value: Stage) -> Self {
        match value {
            Stage::Unknown => Self::Unknown,
            Stage::CacheCheck => Self::CacheCheck,
            Stage::Queued => Self::Queued,
            Stage::Executing => Self::Executing,
            Stage::Completed => Self::Completed,
        }
    }
}

/// A file produced by an action, stored in the CAS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputFile {
    pub path: String,
    pub digest: Digest,
    pub is_executable: bool,
}

/// Output of an action on stdout or stderr, either inlined in the response
/// or stored in the CAS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapturedOutput {
    Inline(Bytes),
    Stored(Digest),
}

impl CapturedOutput {
    /// Returns the captured bytes, reading them from `cas` if necessary.
    pub async fn fetch(&self, cas: &dyn ContentAddressedStorage) -> Result<Bytes, Error> {
        match self {
            Self::Inline(data) => Ok(data.clone()),
            Self::Stored(digest) => Ok(cas.fetch(digest).await?),
        }
    }
}

/// The outcome of an action that got run (or was found in the cache).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub output_files: Vec<OutputFile>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub cached: bool,
    /// Free-form message from the execution engine, possibly empty.
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionEvent {
    Stage(ExecutionStage),
    Completed(ExecutionResult),
}

/// Submits actions over one execution engine channel.
///
/// Handed out by [crate::RemoteExecutionClients::remote_execution_service],
/// which picks the channel.
pub struct GrpcRemoteExecutionService {
    channel: Arc<GrpcChannel>,
    instance_name: String,
    idle_timeout: Duration,
    metadata: RemoteExecutionMetadata,
}

impl GrpcRemoteExecutionService {
    pub fn new(
        channel: Arc<GrpcChannel>,
        instance_name: impl Into<String>,
        idle_timeout: Duration,
        metadata: RemoteExecutionMetadata,
    ) -> Self {
        Self {
            channel,
            instance_name: instance_name.into(),
            idle_timeout,
            metadata,
        }
    }

    /// Starts executing the action identified by `action_digest`.
    ///
    /// The returned handle yields progress, and the result once done. The
    /// call itself is not bounded, but every update has to arrive within
    /// the idle timeout.
    #[instrument(skip(self), fields(action.digest = %action_digest), err)]
    pub async fn execute(
        &self,
        action_digest: &Digest,
        skip_cache_lookup: bool,
    ) -> Result<ExecutionHandle, Error> {
        let lease = self.channel.lease()?;

        let request = make_untimed_request(
            proto::ExecuteRequest {
                instance_name: self.instance_name.clone(),
                skip_cache_lookup,
                action_digest: Some(action_digest.into()),
            },
            &self.metadata,
        );

        let mut client = ExecutionClient::new(lease.channel());
        let operations = match tokio::time::timeout(
            self.idle_timeout,
            lease.run(client.execute(request)),
        )
        .await
        {
            Ok(res) => res?.into_inner(),
            Err(_) => return Err(deadline_exceeded(self.idle_timeout)),
        };

        debug!("execution started");

        Ok(ExecutionHandle {
            action_digest: action_digest.clone(),
            operations: Box::pin(operations),
            idle_timeout: self.idle_timeout,
            lease: Some(lease),
            done: false,
        })
    }
}

fn deadline_exceeded(idle_timeout: Duration) -> Error {
    Error::Transport(Status::deadline_exceeded(format!(
        "no update from the execution engine within {:?}",
        idle_timeout
    )))
}

/// An execution in flight.
pub struct ExecutionHandle {
    action_digest: Digest,
    operations: OperationStream,
    idle_timeout: Duration,
    lease: Option<ChannelLease>,
    done: bool,
}

impl ExecutionHandle {
    #[cfg(test)]
    pub(crate) fn from_stream(
        action_digest: Digest,
        operations: impl Stream<Item = Result<proto::Operation, Status>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            action_digest,
            operations: Box::pin(operations),
            idle_timeout,
            lease: None,
            done: false,
        }
    }

    pub fn action_digest(&self) -> &Digest {
        &self.action_digest
    }

    /// Returns the next event of the execution, [ExecutionEvent::Completed]
    /// exactly once and last, followed by `None`.
    pub async fn next_event(&mut self) -> Result<Option<ExecutionEvent>, Error> {
        while !self.done {
            let operation = match self.next_operation().await {
                Ok(Some(operation)) => operation,
                Ok(None) => {
                    self.finish();
                    return Err(Error::IncompleteExecution);
                }
                Err(e) => {
                    self.finish();
                    return Err(e);
                }
            };

            if operation.done {
                self.finish();
                let result = completed(operation)?;
                debug!(
                    action.digest = %self.action_digest,
                    exit_code = result.exit_code,
                    cached = result.cached,
                    "execution completed"
                );
                return Ok(Some(ExecutionEvent::Completed(result)));
            }

            // updates without (decodable) metadata carry no news
            match operation
                .metadata
                .as_ref()
                .map(|any| any.unpack::<proto::ExecuteOperationMetadata>())
            {
                Some(Ok(Some(metadata))) => {
                    return Ok(Some(ExecutionEvent::Stage(metadata.stage().into())));
                }
                Some(Err(e)) => {
                    warn!(err = %e, "unable to decode operation metadata");
                }
                _ => {}
            }
        }

        Ok(None)
    }

    /// Drains the remaining events, returning the result.
    pub async fn wait(mut self) -> Result<ExecutionResult, Error> {
        while let Some(event) = self.next_event().await? {
            if let ExecutionEvent::Completed(result) = event {
                return Ok(result);
            }
        }

        Err(Error::IncompleteExecution)
    }

    /// Nothing is reported after the first terminal outcome.
    fn finish(&mut self) {
        self.done = true;
        self.lease = None;
    }

    async fn next_operation(&mut self) -> Result<Option<proto::Operation>, Error> {
        let Self {
            operations,
            lease,
            idle_timeout,
            ..
        } = self;

        let next = async { operations.next().await.transpose() };
        let next = async {
            match lease {
                Some(lease) => lease.run(next).await,
                None => next.await,
            }
        };

        match tokio::time::timeout(*idle_timeout, next).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(deadline_exceeded(*idle_timeout)),
        }
    }
}

fn completed(operation: proto::Operation) -> Result<ExecutionResult, Error> {
    let response = match operation.result {
        Some(operation::Result::Error(status)) => return Err(Error::Execution(status.into())),
        Some(operation::Result::Response(any)) => any
            .unpack::<proto::ExecuteResponse>()
            .map_err(|e| Error::InvalidResponse(e.to_string()))?
            .ok_or_else(|| Error::InvalidResponse(format!("unexpected type {}", any.type_url)))?,
        None => return Err(Error::IncompleteExecution),
    };

    if let Some(status) = response.status.filter(|s| !s.is_ok()) {
        return Err(Error::Execution(status.into()));
    }

    let result = response
        .result
        .ok_or_else(|| Error::InvalidResponse("execute response without result".into()))?;

    Ok(ExecutionResult {
        exit_code: result.exit_code,
        output_files: result
            .output_files
            .into_iter()
            .map(output_file)
            .collect::<Result<_, _>>()?,
        stdout: captured(result.stdout_raw, result.stdout_digest)?,
        stderr: captured(result.stderr_raw, result.stderr_digest)?,
        cached: response.cached_result,
        message: response.message,
    })
}

/// Output paths are relative to the output root, and must stay below it.
pub(crate) fn check_output_path(path: &str) -> Result<(), Error> {
    let mut components = Path::new(path).components().peekable();
    if components.peek().is_none()
        || !components.all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(Error::InvalidResponse(format!(
            "output path {:?} is not below the output root",
            path
        )));
    }
    Ok(())
}

fn output_file(file: proto::OutputFile) -> Result<OutputFile, Error> {
    check_output_path(&file.path)?;

    let digest = file
        .digest
        .ok_or_else(|| Error::InvalidResponse(format!("output {} has no digest", file.path)))?;

    Ok(OutputFile {
        digest: Digest::try_from(digest).map_err(rexec_castore::Error::from)?,
        path: file.path,
        is_executable: file.is_executable,
    })
}

fn captured(raw: Bytes, digest: Option<proto::Digest>) -> Result<CapturedOutput, Error> {
    match digest {
        // raw bytes win if both are set
        Some(digest) if raw.is_empty() => Ok(CapturedOutput::Stored(
            Digest::try_from(digest).map_err(rexec_castore::Error::from)?,
        )),
        _ => Ok(CapturedOutput::Inline(raw)),
    }
}
