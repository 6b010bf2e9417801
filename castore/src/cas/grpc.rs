use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use rexec_tracing::PB_TRANSFER_STYLE;
use tonic::{async_trait, Status};
use tracing::{debug, instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::{read_verified, BlobSink, ContentAddressedStorage};
use crate::proto::{
    self, batch_update_blobs_request, make_request, ByteStreamClient,
    ContentAddressableStorageClient, RemoteExecutionMetadata,
};
use crate::tonic::{GrpcChannel, ManagedChannel};
use crate::{Digest, Error, Protocol};

/// Size of the chunks blobs are streamed to the store in.
const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Talks to a remote CAS over a single [GrpcChannel].
///
/// Every call carries the metadata passed at construction, and fails with a
/// deadline-exceeded transport error if it doesn't complete within the
/// configured deadline.
#[derive(Clone)]
pub struct GrpcCas {
    channel: Arc<GrpcChannel>,
    protocol: Arc<dyn Protocol>,
    instance_name: String,
    deadline: Duration,
    metadata: RemoteExecutionMetadata,
}

impl GrpcCas {
    pub fn new(
        channel: Arc<GrpcChannel>,
        protocol: Arc<dyn Protocol>,
        instance_name: impl Into<String>,
        deadline: Duration,
        metadata: RemoteExecutionMetadata,
    ) -> Self {
        Self {
            channel,
            protocol,
            instance_name: instance_name.into(),
            deadline,
            metadata,
        }
    }

    pub fn channel(&self) -> &Arc<GrpcChannel> {
        &self.channel
    }

    fn request<T>(&self, msg: T) -> tonic::Request<T> {
        make_request(msg, &self.metadata, self.deadline)
    }

    /// Runs `fut` under a lease of the channel, bounded by the deadline.
    async fn call<F, T>(&self, fut: impl FnOnce(tonic::transport::Channel) -> F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        let lease = self.channel.lease()?;

        match tokio::time::timeout(self.deadline, lease.run(fut(lease.channel()))).await {
            Ok(res) => res,
            Err(_) => Err(Status::deadline_exceeded(format!(
                "no response from {} within {:?}",
                self.channel.authority(),
                self.deadline
            ))
            .into()),
        }
    }
}

#[async_trait]
impl ContentAddressedStorage for GrpcCas {
    #[instrument(skip_all, fields(digests = digests.len()), err)]
    async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, Error> {
        let request = self.request(proto::FindMissingBlobsRequest {
            instance_name: self.instance_name.clone(),
            blob_digests: digests.iter().map(Into::into).collect(),
        });

        let response = self
            .call(|channel| async move {
                Ok(ContentAddressableStorageClient::new(channel)
                    .find_missing_blobs(request)
                    .await?
                    .into_inner())
            })
            .await?;

        Ok(response
            .missing_blob_digests
            .into_iter()
            .map(Digest::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }

    #[instrument(skip_all, fields(blobs = blobs.len()), err)]
    async fn upload(&self, blobs: Vec<(Digest, Bytes)>) -> Result<(), Error> {
        for (digest, data) in &blobs {
            check_size(digest, data)?;
        }

        let request = self.request(proto::BatchUpdateBlobsRequest {
            instance_name: self.instance_name.clone(),
            requests: blobs
                .into_iter()
                .map(|(digest, data)| batch_update_blobs_request::Request {
                    digest: Some(digest.into()),
                    data,
                })
                .collect(),
        });

        let response = self
            .call(|channel| async move {
                Ok(ContentAddressableStorageClient::new(channel)
                    .batch_update_blobs(request)
                    .await?
                    .into_inner())
            })
            .await?;

        for blob_response in response.responses {
            let status = blob_response.status.unwrap_or_default();
            if status.is_ok() {
                continue;
            }

            let digest = blob_response
                .digest
                .map(Digest::try_from)
                .transpose()?
                .ok_or_else(|| {
                    Error::InvalidRequest("batch update response without digest".into())
                })?;

            return Err(Error::Upload {
                digest,
                status: status.into(),
            });
        }

        Ok(())
    }

    #[instrument(skip(self, data), fields(blob.digest = %digest, indicatif.pb_show = 1), err)]
    async fn write(&self, digest: &Digest, data: Bytes) -> Result<(), Error> {
        check_size(digest, &data)?;

        let upload_id = uuid::Uuid::new_v4().to_string();
        let resource_name =
            self.protocol
                .write_resource_name(&self.instance_name, &upload_id, digest);

        let requests = write_requests(resource_name, data);
        debug!(chunks = requests.len(), "streaming blob");

        let span = transfer_span("uploading", digest);
        let request = self.request(futures::stream::iter(requests).inspect(move |r| {
            span.pb_inc(r.data.len() as u64);
        }));

        let response = self
            .call(|channel| async move {
                Ok(ByteStreamClient::new(channel)
                    .write(request)
                    .await?
                    .into_inner())
            })
            .await?;

        if response.committed_size != digest.size_bytes() as i64 {
            return Err(Error::Upload {
                digest: digest.clone(),
                status: Status::data_loss(format!(
                    "committed {} bytes, expected {}",
                    response.committed_size,
                    digest.size_bytes()
                )),
            });
        }

        Ok(())
    }

    #[instrument(skip(self, sink), fields(blob.digest = %digest, indicatif.pb_show = 1), err)]
    async fn read(&self, digest: &Digest, sink: &mut BlobSink<'_>) -> Result<(), Error> {
        let request = self.request(proto::ReadRequest {
            resource_name: self
                .protocol
                .read_resource_name(&self.instance_name, digest),
            read_offset: 0,
            read_limit: 0,
        });

        let protocol = self.protocol.as_ref();
        let span = transfer_span("downloading", digest);
        self.call(|channel| async move {
            let chunks = ByteStreamClient::new(channel)
                .read(request)
                .await?
                .into_inner()
                .map_ok(move |response| {
                    span.pb_inc(response.data.len() as u64);
                    response.data
                });

            read_verified(protocol, digest, chunks, sink).await
        })
        .await
    }
}

/// Sets up the progress bar of the current span for moving `digest`.
fn transfer_span(message: &'static str, digest: &Digest) -> Span {
    let span = Span::current();
    span.pb_set_style(&PB_TRANSFER_STYLE);
    span.pb_set_message(message);
    span.pb_set_length(digest.size_bytes());
    span
}

fn check_size(digest: &Digest, data: &Bytes) -> Result<(), Error> {
    if data.len() as u64 != digest.size_bytes() {
        return Err(Error::InvalidRequest(format!(
            "{} has {} bytes of data",
            digest,
            data.len()
        )));
    }
    Ok(())
}

/// Splits `data` into ByteStream write requests. Only the first one carries
/// the resource name, only the last one has `finish_write` set. An empty blob
/// still produces one request.
fn write_requests(resource_name: String, data: Bytes) -> Vec<proto::WriteRequest> {
    let mut requests = Vec::with_capacity(data.len() / WRITE_CHUNK_SIZE + 1);
    let mut offset = 0;

    loop {
        let end = (offset + WRITE_CHUNK_SIZE).min(data.len());
        requests.push(proto::WriteRequest {
            resource_name: if offset == 0 {
                resource_name.clone()
            } else {
                String::new()
            },
            write_offset: offset as i64,
            finish_write: end == data.len(),
            data: data.slice(offset..end),
        });

        if end == data.len() {
            return requests;
        }
        offset = end;
    }
}
