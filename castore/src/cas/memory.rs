use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tonic::async_trait;
use tracing::{instrument, warn};

use super::{read_verified, BlobSink, ContentAddressedStorage};
use crate::{Digest, Error, Protocol};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Keeps blobs in a [HashMap]. Everything stored is checked against its
/// digest, reads are verified the same way a remote read is.
#[derive(Clone)]
pub struct MemoryCas {
    protocol: Arc<dyn Protocol>,
    db: Arc<RwLock<HashMap<Digest, Bytes>>>,
    batch_uploads: Arc<AtomicUsize>,
    stream_writes: Arc<AtomicUsize>,
}

impl MemoryCas {
    pub fn new(protocol: Arc<dyn Protocol>) -> Self {
        Self {
            protocol,
            db: Default::default(),
            batch_uploads: Default::default(),
            stream_writes: Default::default(),
        }
    }

    /// Stores `data` under `digest` without checking it, so reads of it
    /// fail verification. Only useful in tests.
    pub fn insert_unchecked(&self, digest: Digest, data: Bytes) {
        self.db.write().insert(digest, data);
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.db.read().contains_key(digest)
    }

    /// How many [ContentAddressedStorage::upload] calls were made.
    pub fn batch_uploads(&self) -> usize {
        self.batch_uploads.load(Ordering::Relaxed)
    }

    /// How many [ContentAddressedStorage::write] calls were made.
    pub fn stream_writes(&self) -> usize {
        self.stream_writes.load(Ordering::Relaxed)
    }

    fn insert(&self, digest: &Digest, data: Bytes) -> Result<(), Error> {
        let observed = self.protocol.compute_digest(&data);
        if &observed != digest {
            warn!(blob.digest = %digest, observed = %observed, "refusing blob not matching its digest");
            return Err(Error::Upload {
                digest: digest.clone(),
                status: tonic::Status::invalid_argument(format!(
                    "data hashes to {}",
                    observed
                )),
            });
        }

        self.db.write().insert(digest.clone(), data);
        Ok(())
    }
}

#[async_trait]
impl ContentAddressedStorage for MemoryCas {
    #[instrument(skip_all, fields(digests = digests.len()))]
    async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, Error> {
        let db = self.db.read();
        Ok(digests
            .iter()
            .filter(|digest| !db.contains_key(*digest))
            .cloned()
            .collect())
    }

    #[instrument(skip_all, fields(blobs = blobs.len()), err)]
    async fn upload(&self, blobs: Vec<(Digest, Bytes)>) -> Result<(), Error> {
        self.batch_uploads.fetch_add(1, Ordering::Relaxed);
        for (digest, data) in blobs {
            self.insert(&digest, data)?;
        }
        Ok(())
    }

    #[instrument(skip(self, data), fields(blob.digest = %digest), err)]
    async fn write(&self, digest: &Digest, data: Bytes) -> Result<(), Error> {
        self.stream_writes.fetch_add(1, Ordering::Relaxed);
        self.insert(digest, data)
    }

    #[instrument(skip(self, sink), fields(blob.digest = %digest), err)]
    async fn read(&self, digest: &Digest, sink: &mut BlobSink<'_>) -> Result<(), Error> {
        let data = self
            .db
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| tonic::Status::not_found(format!("blob {} not found", digest)))?;

        let chunks: Vec<Result<Bytes, tonic::Status>> = (0..data.len())
            .step_by(READ_CHUNK_SIZE)
            .map(|start| Ok(data.slice(start..(start + READ_CHUNK_SIZE).min(data.len()))))
            .collect();

        read_verified(
            self.protocol.as_ref(),
            digest,
            futures::stream::iter(chunks),
            sink,
        )
        .await
    }
}
