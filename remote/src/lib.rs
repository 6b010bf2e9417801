//! Dispatching build actions to a remote execution service.
//!
//! [RemoteExecutionClients] ties together a [ChannelPool] of execution
//! engine connections, one CAS connection and a [MetadataProvider].

mod channel_pool;
mod clients;
mod config;
mod errors;
mod execution;
mod metadata;

pub use channel_pool::{close_channel, close_channels, ChannelPool, CLOSE_WAIT};
pub use clients::RemoteExecutionClients;
pub use config::RemoteExecutionConfig;
pub use errors::Error;
pub use execution::{
    CapturedOutput, ExecutionEvent, ExecutionHandle, ExecutionResult, ExecutionStage,
    GrpcRemoteExecutionService, OutputFile,
};
pub use metadata::{MetadataProvider, StaticMetadataProvider};
