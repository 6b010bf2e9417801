use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::cas::GrpcCas;
use crate::fixtures;
use crate::proto::{
    batch_update_blobs_response,
    byte_stream_server::{ByteStream, ByteStreamServer},
    content_addressable_storage_server::{
        ContentAddressableStorage, ContentAddressableStorageServer,
    },
    request_metadata, BatchUpdateBlobsRequest, BatchUpdateBlobsResponse, BuildInfo,
    FindMissingBlobsRequest, FindMissingBlobsResponse, ReadRequest, ReadResponse,
    RemoteExecutionMetadata, RpcStatus, WriteRequest, WriteResponse,
};
use crate::{Digest, Protocol};

/// Chunk size the fake server streams blobs back in.
const READ_CHUNK_SIZE: usize = 1000;

/// What the fake server observed of a single call.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: &'static str,
    pub metadata: Option<RemoteExecutionMetadata>,
    pub has_timeout: bool,
    /// The instance name, or resource name, the call was about.
    pub target: String,
}

/// A CAS server storing whatever it's sent, without verifying anything,
/// and recording the calls made to it.
#[derive(Clone, Default)]
pub struct FakeCasServer {
    pub(super) blobs: Arc<Mutex<HashMap<String, Bytes>>>,
    pub(super) calls: Arc<Mutex<Vec<Call>>>,
    pub(super) write_chunks: Arc<Mutex<Vec<usize>>>,
    /// Reported as committed size by writes instead of the received one.
    pub committed_size: Option<i64>,
    /// Batch updates fail for every blob with this status code.
    pub reject_uploads: Option<tonic::Code>,
}

impl FakeCasServer {
    /// Stores `data` under `digest`, whether it matches or not.
    pub fn insert(&self, digest: &Digest, data: Bytes) {
        self.blobs.lock().insert(digest.to_string(), data);
    }

    pub fn get(&self, digest: &Digest) -> Option<Bytes> {
        self.blobs.lock().get(&digest.to_string()).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// The number of requests each write stream was made of.
    pub fn write_chunks(&self) -> Vec<usize> {
        self.write_chunks.lock().clone()
    }

    fn record<T>(&self, method: &'static str, request: &Request<T>, target: String) {
        self.calls.lock().push(Call {
            method,
            metadata: request_metadata(request),
            has_timeout: request.metadata().get("grpc-timeout").is_some(),
            target,
        });
    }

    /// Serves this over an in-process connection, and returns a [GrpcCas]
    /// talking to it.
    pub fn into_client(self, protocol: Arc<dyn Protocol>) -> GrpcCas {
        let router = Server::builder()
            .add_service(ByteStreamServer::new(self.clone()))
            .add_service(ContentAddressableStorageServer::new(self));

        GrpcCas::new(
            Arc::new(fixtures::in_process_channel(router)),
            protocol,
            "main",
            Duration::from_secs(5),
            metadata(),
        )
    }
}

/// The metadata the clients built by [FakeCasServer::into_client] send.
pub fn metadata() -> RemoteExecutionMetadata {
    RemoteExecutionMetadata {
        build_info: Some(BuildInfo {
            build_id: "build-1".into(),
            rule_name: "//foo:bar".into(),
        }),
        ..Default::default()
    }
}

/// The `hash/size` key at the end of a resource name.
fn blob_key(resource_name: &str) -> Result<String, Status> {
    let mut segments = resource_name.rsplitn(3, '/');
    match (segments.next(), segments.next()) {
        (Some(size), Some(hash)) => Ok(format!("{}/{}", hash, size)),
        _ => Err(Status::invalid_argument(format!(
            "invalid resource name {:?}",
            resource_name
        ))),
    }
}

fn wire_key(digest: Option<&crate::proto::Digest>) -> String {
    digest
        .map(|d| format!("{}/{}", d.hash, d.size_bytes))
        .unwrap_or_default()
}

#[tonic::async_trait]
impl ByteStream for FakeCasServer {
    type ReadStream = BoxStream<'static, Result<ReadResponse, Status>>;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        self.record("Read", &request, request.get_ref().resource_name.clone());

        let key = blob_key(&request.get_ref().resource_name)?;
        let data = self
            .blobs
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("blob {} not found", key)))?;

        let chunks: Vec<Result<ReadResponse, Status>> = data
            .chunks(READ_CHUNK_SIZE)
            .map(|chunk| {
                Ok(ReadResponse {
                    data: Bytes::copy_from_slice(chunk),
                })
            })
            .collect();

        Ok(Response::new(futures::stream::iter(chunks).boxed()))
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let metadata = request_metadata(&request);
        let has_timeout = request.metadata().get("grpc-timeout").is_some();
        let requests: Vec<WriteRequest> = request.into_inner().try_collect().await?;

        let resource_name = requests
            .first()
            .map(|r| r.resource_name.clone())
            .unwrap_or_default();
        self.calls.lock().push(Call {
            method: "Write",
            metadata,
            has_timeout,
            target: resource_name.clone(),
        });
        self.write_chunks.lock().push(requests.len());

        let mut data = BytesMut::new();
        for request in &requests {
            if request.write_offset != data.len() as i64 {
                return Err(Status::invalid_argument("non-contiguous write"));
            }
            data.extend_from_slice(&request.data);
        }

        if !requests.last().is_some_and(|r| r.finish_write) {
            return Err(Status::invalid_argument("write not finished"));
        }

        let committed_size = self.committed_size.unwrap_or(data.len() as i64);
        self.blobs
            .lock()
            .insert(blob_key(&resource_name)?, data.freeze());

        Ok(Response::new(WriteResponse { committed_size }))
    }
}

#[tonic::async_trait]
impl ContentAddressableStorage for FakeCasServer {
    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        self.record(
            "FindMissingBlobs",
            &request,
            request.get_ref().instance_name.clone(),
        );

        let blobs = self.blobs.lock();
        let missing_blob_digests = request
            .into_inner()
            .blob_digests
            .into_iter()
            .filter(|d| !blobs.contains_key(&wire_key(Some(d))))
            .collect();

        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests,
        }))
    }

    async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        self.record(
            "BatchUpdateBlobs",
            &request,
            request.get_ref().instance_name.clone(),
        );

        let mut responses = vec![];
        for blob in request.into_inner().requests {
            let code = match self.reject_uploads {
                Some(code) => code,
                None => {
                    self.blobs
                        .lock()
                        .insert(wire_key(blob.digest.as_ref()), blob.data);
                    tonic::Code::Ok
                }
            };

            responses.push(batch_update_blobs_response::Response {
                digest: blob.digest,
                status: Some(RpcStatus {
                    code: code as i32,
                    message: String::new(),
                    details: vec![],
                }),
            });
        }

        Ok(Response::new(BatchUpdateBlobsResponse { responses }))
    }
}
