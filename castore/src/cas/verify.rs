use std::pin::pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{Digest, Error, Protocol};

/// Consumes `chunks`, which are supposed to make up the blob identified by
/// `digest`, and writes them to `sink`.
///
/// Each chunk is counted and fed into a hasher before being written, in the
/// order received. Once the stream ends, the observed size and hash are
/// compared against the digest.
///
/// A transport error in the middle of the stream is returned as is, and the
/// rest of the stream is not consumed.
pub async fn read_verified<S, W>(
    protocol: &dyn Protocol,
    digest: &Digest,
    chunks: S,
    sink: &mut W,
) -> Result<(), Error>
where
    S: Stream<Item = Result<Bytes, tonic::Status>>,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut chunks = pin!(chunks);
    let mut hasher = protocol.new_hasher();
    let mut size: u64 = 0;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;

        size += chunk.len() as u64;
        hasher.update(&chunk);
        sink.write_all(&chunk).await?;
    }

    sink.flush().await?;

    let observed_hash = hasher.finalize_hex();
    if size == digest.size_bytes() && observed_hash == digest.hash() {
        debug!(blob.digest = %digest, "verified blob");
        Ok(())
    } else {
        warn!(
            blob.digest = %digest,
            observed_hash = %observed_hash,
            observed_size = size,
            "received blob doesn't match digest"
        );
        Err(Error::Integrity {
            expected: digest.clone(),
            observed_hash,
            observed_size: size,
        })
    }
}
