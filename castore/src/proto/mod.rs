//! Wire messages and gRPC services of the remote execution API subset we
//! speak, generated from `protos/`, plus the metadata envelope attached to
//! every request.

use prost::{DecodeError, Message, Name};
use tonic::metadata::MetadataValue;

pub mod google {
    pub mod bytestream {
        tonic::include_proto!("google.bytestream");
    }
    pub mod longrunning {
        tonic::include_proto!("google.longrunning");
    }
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
}

pub mod build {
    pub mod bazel {
        pub mod remote {
            pub mod execution {
                pub mod v2 {
                    tonic::include_proto!("build.bazel.remote.execution.v2");
                }
            }
        }
    }
}

pub mod rexec {
    pub mod metadata {
        pub mod v1 {
            tonic::include_proto!("rexec.metadata.v1");
        }
    }
}

pub use build::bazel::remote::execution::v2::{
    batch_update_blobs_request, batch_update_blobs_response,
    content_addressable_storage_client::ContentAddressableStorageClient,
    content_addressable_storage_server, execute_operation_metadata,
    execution_client::ExecutionClient, execution_server, ActionResult, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, Digest, ExecuteOperationMetadata, ExecuteRequest, ExecuteResponse,
    FindMissingBlobsRequest, FindMissingBlobsResponse, OutputFile,
};
pub use google::bytestream::{
    byte_stream_client::ByteStreamClient, byte_stream_server, ReadRequest, ReadResponse,
    WriteRequest, WriteResponse,
};
pub use google::longrunning::{operation, Operation};
pub use google::rpc::Status as RpcStatus;
pub use prost_types::Any;
pub use rexec::metadata::v1::{
    BuildInfo, CasClientInfo, CreatorInfo, ExecutionEngineInfo, ReSessionId,
    RemoteExecutionMetadata, TraceInfo, WorkerInfo,
};

/// The binary request header carrying the encoded [RemoteExecutionMetadata].
pub const METADATA_HEADER: &str = "re-metadata-bin";

const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

const REAPI_PACKAGE: &str = "build.bazel.remote.execution.v2";

impl Name for ExecuteOperationMetadata {
    const NAME: &'static str = "ExecuteOperationMetadata";
    const PACKAGE: &'static str = REAPI_PACKAGE;
}

impl Name for ExecuteResponse {
    const NAME: &'static str = "ExecuteResponse";
    const PACKAGE: &'static str = REAPI_PACKAGE;
}

/// Packing messages into, and out of, an [Any].
pub trait AnyExt {
    fn pack<M: Name>(msg: &M) -> Self;

    /// Decodes the contained message, if it's of type `M`.
    /// Returns Ok(None) for any other type.
    fn unpack<M: Name + Default>(&self) -> Result<Option<M>, DecodeError>;
}

impl AnyExt for Any {
    fn pack<M: Name>(msg: &M) -> Self {
        Self {
            type_url: format!("{}{}", TYPE_URL_PREFIX, M::full_name()),
            value: msg.encode_to_vec(),
        }
    }

    fn unpack<M: Name + Default>(&self) -> Result<Option<M>, DecodeError> {
        match self.type_url.rsplit_once('/') {
            Some((_, name)) if name == M::full_name() => Ok(Some(M::decode(self.value.as_slice())?)),
            _ => Ok(None),
        }
    }
}

impl RpcStatus {
    pub fn is_ok(&self) -> bool {
        self.code == tonic::Code::Ok as i32
    }
}

impl From<RpcStatus> for tonic::Status {
    fn from(value: RpcStatus) -> Self {
        tonic::Status::new(tonic::Code::from_i32(value.code), value.message)
    }
}

/// Wraps `msg` into a [tonic::Request] carrying the encoded metadata in the
/// [METADATA_HEADER] header, and a `grpc-timeout` of `deadline`.
pub fn make_request<T>(
    msg: T,
    metadata: &RemoteExecutionMetadata,
    deadline: std::time::Duration,
) -> tonic::Request<T> {
    let mut request = make_untimed_request(msg, metadata);
    request.set_timeout(deadline);
    request
}

/// Like [make_request], but without a `grpc-timeout`, for long-running
/// streaming calls which are bounded by the caller instead.
pub fn make_untimed_request<T>(msg: T, metadata: &RemoteExecutionMetadata) -> tonic::Request<T> {
    let mut request = tonic::Request::new(msg);
    request.metadata_mut().insert_bin(
        METADATA_HEADER,
        MetadataValue::from_bytes(&metadata.encode_to_vec()),
    );
    request
}

/// Decodes the metadata envelope a request carries, if there's a valid one.
pub fn request_metadata<T>(request: &tonic::Request<T>) -> Option<RemoteExecutionMetadata> {
    let value = request.metadata().get_bin(METADATA_HEADER)?;
    let bytes = value.to_bytes().ok()?;
    RemoteExecutionMetadata::decode(bytes).ok()
}

#[cfg(test)]
mod tests;
