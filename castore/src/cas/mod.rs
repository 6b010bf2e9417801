use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use rexec_tracing::PB_PROGRESS_STYLE;
use tokio::io::AsyncWrite;
use tonic::async_trait;
use tracing::{debug, instrument, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::{Digest, Error};

mod grpc;
mod memory;
mod verify;

pub use self::grpc::GrpcCas;
pub use self::memory::MemoryCas;
pub use self::verify::read_verified;

/// Blobs up to this size are uploaded through batch requests, bigger ones
/// get streamed on their own.
pub const MAX_BATCH_BLOB_SIZE: u64 = 4 * 1024 * 1024;

/// The place bytes read from the store get written to.
pub type BlobSink<'a> = dyn AsyncWrite + Send + Unpin + 'a;

/// The content-addressed storage, as seen by a build tool.
///
/// Blob bytes are never retained beyond a single call.
#[async_trait]
pub trait ContentAddressedStorage: Send + Sync {
    /// Returns the subset of the passed digests the store doesn't have.
    async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, Error>;

    /// Uploads a batch of (small) blobs in one request.
    async fn upload(&self, blobs: Vec<(Digest, Bytes)>) -> Result<(), Error>;

    /// Streams a single blob to the store.
    async fn write(&self, digest: &Digest, data: Bytes) -> Result<(), Error>;

    /// Reads the blob identified by `digest` into `sink`.
    ///
    /// Every chunk is hashed and counted before it's passed on. Once the
    /// stream is complete, size and hash have to match the digest, otherwise
    /// [Error::Integrity] is returned, even though all chunks were delivered.
    /// On error, whatever got written to `sink` so far must be discarded.
    async fn read(&self, digest: &Digest, sink: &mut BlobSink<'_>) -> Result<(), Error>;

    /// Uploads those of the passed blobs the store doesn't have yet.
    /// Returns the digests that were uploaded.
    async fn add_missing(&self, blobs: Vec<(Digest, Bytes)>) -> Result<Vec<Digest>, Error> {
        let digests: Vec<Digest> = blobs.iter().map(|(digest, _)| digest.clone()).collect();
        let missing: HashSet<Digest> = self.find_missing(&digests).await?.into_iter().collect();

        debug!(total = digests.len(), missing = missing.len(), "found missing blobs");

        let mut uploaded = Vec::with_capacity(missing.len());
        let mut batch = Vec::new();
        let mut batch_size = 0;

        for (digest, data) in blobs.into_iter().filter(|(d, _)| missing.contains(d)) {
            uploaded.push(digest.clone());

            if digest.size_bytes() > MAX_BATCH_BLOB_SIZE {
                self.write(&digest, data).await?;
                continue;
            }

            if batch_size + digest.size_bytes() > MAX_BATCH_BLOB_SIZE {
                self.upload(std::mem::take(&mut batch)).await?;
                batch_size = 0;
            }

            batch_size += digest.size_bytes();
            batch.push((digest, data));
        }

        if !batch.is_empty() {
            self.upload(batch).await?;
        }

        Ok(uploaded)
    }

    /// Reads a whole blob into memory.
    async fn fetch(&self, digest: &Digest) -> Result<Bytes, Error> {
        let mut buf = Vec::with_capacity(digest.size_bytes().min(MAX_BATCH_BLOB_SIZE) as usize);
        self.read(digest, &mut buf).await?;
        Ok(buf.into())
    }
}

#[async_trait]
impl<A> ContentAddressedStorage for A
where
    A: AsRef<dyn ContentAddressedStorage> + Send + Sync,
{
    async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, Error> {
        self.as_ref().find_missing(digests).await
    }

    async fn upload(&self, blobs: Vec<(Digest, Bytes)>) -> Result<(), Error> {
        self.as_ref().upload(blobs).await
    }

    async fn write(&self, digest: &Digest, data: Bytes) -> Result<(), Error> {
        self.as_ref().write(digest, data).await
    }

    async fn read(&self, digest: &Digest, sink: &mut BlobSink<'_>) -> Result<(), Error> {
        self.as_ref().read(digest, sink).await
    }

    async fn add_missing(&self, blobs: Vec<(Digest, Bytes)>) -> Result<Vec<Digest>, Error> {
        self.as_ref().add_missing(blobs).await
    }

    async fn fetch(&self, digest: &Digest) -> Result<Bytes, Error> {
        self.as_ref().fetch(digest).await
    }
}

/// Writes each blob to its path, with at most `threads` reads in flight.
///
/// Blobs are first written to a `.partial` sibling and only renamed into
/// place once the read verified, so a failed read never leaves a file at
/// the destination.
#[instrument(skip_all, fields(outputs = outputs.len(), indicatif.pb_show = 1), err)]
pub async fn materialize_outputs(
    cas: &dyn ContentAddressedStorage,
    outputs: Vec<(Digest, PathBuf)>,
    threads: usize,
) -> Result<(), Error> {
    let span = Span::current();
    span.pb_set_style(&PB_PROGRESS_STYLE);
    span.pb_set_message("materializing outputs");
    span.pb_set_length(outputs.len() as u64);

    futures::stream::iter(outputs)
        .map(|(digest, path)| {
            let span = span.clone();
            async move {
                materialize_one(cas, &digest, &path).await?;
                span.pb_inc(1);
                Ok::<_, Error>(())
            }
        })
        .buffer_unordered(threads.max(1))
        .try_collect::<Vec<()>>()
        .await?;

    Ok(())
}

#[instrument(skip(cas), fields(blob.digest = %digest), err)]
async fn materialize_one(
    cas: &dyn ContentAddressedStorage,
    digest: &Digest,
    path: &Path,
) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut partial_name = path.file_name().unwrap_or_default().to_os_string();
    partial_name.push(".partial");
    let partial_path = path.with_file_name(partial_name);

    let mut file = tokio::fs::File::create(&partial_path).await?;

    match cas.read(digest, &mut file).await {
        Ok(()) => {
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&partial_path, path).await?;
            Ok(())
        }
        Err(e) => {
            drop(file);
            if let Err(rm_err) = tokio::fs::remove_file(&partial_path).await {
                warn!(path = ?partial_path, err = %rm_err, "unable to remove partial output");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests;
