use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rexec_castore::tonic::ManagedChannel;
use tracing::{debug, warn};

use crate::Error;

/// How long closing a channel waits for it to terminate, per attempt.
pub const CLOSE_WAIT: Duration = Duration::from_secs(3);

/// A fixed set of independent connections to execution engine endpoints,
/// handed out round-robin.
///
/// Selection never blocks and never looks at the health of a channel.
/// Failures of the picked channel surface as errors of the call made over it.
pub struct ChannelPool<C> {
    channels: Vec<C>,
    cursor: AtomicU64,
}

impl<C> ChannelPool<C> {
    pub fn new(channels: Vec<C>) -> Result<Self, Error> {
        if channels.is_empty() {
            return Err(Error::InvalidConfig(
                "need at least one execution engine connection".into(),
            ));
        }

        Ok(Self {
            channels,
            cursor: AtomicU64::new(0),
        })
    }

    /// Returns the next channel, in order, wrapping around at the end.
    pub fn select(&self) -> &C {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.channels[(n % self.channels.len() as u64) as usize]
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[C] {
        &self.channels
    }
}

impl<C: ManagedChannel> ChannelPool<C> {
    /// Closes every channel in the pool, see [close_channels].
    pub async fn close_all(&self, wait: Duration) -> Result<(), Error> {
        close_channels(self.channels.iter().map(|c| c as &dyn ManagedChannel), wait).await
    }
}

/// Shuts `channel` down, waiting up to `wait` for it to terminate.
///
/// If that wait gets interrupted, it's repeated exactly once. A second
/// interruption gives up with [Error::ChannelClose]. A wait running out is
/// not an error, the channel is left to finish terminating on its own.
pub async fn close_channel(channel: &dyn ManagedChannel, wait: Duration) -> Result<(), Error> {
    let authority = channel.authority();

    let terminated = match channel.shutdown_now(wait).await {
        Ok(terminated) => terminated,
        Err(_) => {
            debug!(
                authority,
                "unable to close channel gracefully, trying to close again"
            );
            channel
                .shutdown_now(wait)
                .await
                .map_err(|_| Error::ChannelClose {
                    authority: authority.to_string(),
                })?
        }
    };

    if terminated {
        debug!(authority, "successfully closed channel");
    } else {
        warn!(authority, ?wait, "channel didn't terminate in time");
    }

    Ok(())
}

/// Closes all passed channels in order. A failure to close one doesn't stop
/// the others from being closed. The first failure is returned.
pub async fn close_channels<'a>(
    channels: impl IntoIterator<Item = &'a dyn ManagedChannel>,
    wait: Duration,
) -> Result<(), Error> {
    let mut first_err = None;

    for channel in channels {
        if let Err(e) = close_channel(channel, wait).await {
            warn!(err = %e, "failed to close channel");
            first_err.get_or_insert(e);
        }
    }

    match first_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
