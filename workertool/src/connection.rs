use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::Error;

/// Upper bound for a single message, in either direction.
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Sends and receives protobuf messages as length-delimited frames.
///
/// Used on both ends: the executor sends commands and receives events,
/// a worker does the opposite.
pub struct Connection<R, W> {
    reader: FramedRead<R, LengthDelimitedCodec>,
    writer: Option<FramedWrite<W, LengthDelimitedCodec>>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, codec()),
            writer: Some(FramedWrite::new(writer, codec())),
        }
    }

    /// Fails with a broken pipe error once the writing half is closed.
    pub async fn send<M: Message>(&mut self, msg: &M) -> Result<(), Error> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection closed")
        })?;

        writer.send(Bytes::from(msg.encode_to_vec())).await?;
        Ok(())
    }

    /// Returns the next message, or `None` if the other side closed its end.
    pub async fn recv<M: Message + Default>(&mut self) -> Result<Option<M>, Error> {
        match self.reader.next().await {
            None => Ok(None),
            Some(frame) => Ok(Some(M::decode(frame?)?)),
        }
    }

    /// Flushes and drops the writing half, so the other side sees EOF.
    pub async fn close_writer(&mut self) -> Result<(), Error> {
        if let Some(mut writer) = self.writer.take() {
            SinkExt::<Bytes>::close(&mut writer).await?;
        }
        Ok(())
    }
}
