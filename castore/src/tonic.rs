use std::future::Future;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::{task_tracker::TaskTrackerToken, TaskTracker};
use tonic::async_trait;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

fn url_wants_wait_connect(url: &url::Url) -> bool {
    url.query_pairs()
        .filter(|(k, v)| k == "wait-connect" && v == "1")
        .count()
        > 0
}

/// Turn a [url::Url] to a [Channel] if it can be parsed successfully.
/// It supports the following schemes (and URLs):
///  - `grpc+http://[::1]:8000`, connecting over unencrypted HTTP/2 (h2c)
///  - `grpc+https://[::1]:8000`, connecting over encrypted HTTP/2
///  - `grpc+unix:/path/to/socket`, connecting to a unix domain socket
///
/// All URLs support adding `wait-connect=1` as a URL parameter, in which case
/// the connection is established eagerly. Otherwise it's established on first use.
///
/// Every call returns a new, independent connection.
pub async fn channel_from_url(url: &url::Url) -> Result<Channel, self::Error> {
    match url.scheme() {
        "grpc+unix" => {
            if url.host_str().is_some() {
                return Err(Error::HostSetForUnixSocket());
            }

            let connector = tower::service_fn({
                let path = url.path().to_string();
                move |_: tonic::transport::Uri| {
                    let path = path.clone();
                    async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
                }
            });

            // the URL doesn't matter
            let endpoint = Endpoint::from_static("http://[::]:50051");
            if url_wants_wait_connect(url) {
                Ok(endpoint.connect_with_connector(connector).await?)
            } else {
                Ok(endpoint.connect_with_connector_lazy(connector))
            }
        }
        _ => {
            // ensure path is empty, not supported with gRPC.
            if !url.path().is_empty() {
                return Err(Error::PathMayNotBeSet());
            }

            // Stringify the URL and remove the grpc+ prefix.
            // We can't use `url.set_scheme(rest)`, as it disallows
            // setting something http(s) that previously wasn't.
            let unprefixed_url_str = match url.to_string().strip_prefix("grpc+") {
                None => return Err(Error::MissingGRPCPrefix()),
                Some(url_str) => url_str.to_owned(),
            };

            let endpoint = Endpoint::try_from(unprefixed_url_str)?;
            if url_wants_wait_connect(url) {
                Ok(endpoint.connect().await?)
            } else {
                Ok(endpoint.connect_lazy())
            }
        }
    }
}

/// A human-readable name for the endpoint a URL points to, used in logs and errors.
pub fn authority_from_url(url: &url::Url) -> String {
    match (url.host_str().filter(|h| !h.is_empty()), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => url.path().to_string(),
    }
}

/// Errors occuring when trying to connect to a backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("grpc+ prefix is missing from URL")]
    MissingGRPCPrefix(),

    #[error("host may not be set for unix domain sockets")]
    HostSetForUnixSocket(),

    #[error("path may not be set")]
    PathMayNotBeSet(),

    #[error("transport error: {0}")]
    TransportError(tonic::transport::Error),
}

impl From<tonic::transport::Error> for Error {
    fn from(value: tonic::transport::Error) -> Self {
        Self::TransportError(value)
    }
}

/// Returned by [ManagedChannel::shutdown_now] if the wait for termination
/// got interrupted.
#[derive(Debug, thiserror::Error)]
#[error("interrupted while waiting for the channel to terminate")]
pub struct Interrupted;

/// A connection which can be shut down explicitly, waiting a bounded amount
/// of time for it to terminate.
#[async_trait]
pub trait ManagedChannel: Send + Sync {
    fn authority(&self) -> &str;

    /// Cancels all calls in flight and waits up to `wait` for the channel to
    /// terminate.
    /// Returns whether it terminated within that time. Calling this again on
    /// a channel that's already shut down just repeats the wait.
    async fn shutdown_now(&self, wait: Duration) -> Result<bool, Interrupted>;
}

#[async_trait]
impl<T> ManagedChannel for std::sync::Arc<T>
where
    T: ManagedChannel + ?Sized,
{
    fn authority(&self) -> &str {
        self.as_ref().authority()
    }

    async fn shutdown_now(&self, wait: Duration) -> Result<bool, Interrupted> {
        self.as_ref().shutdown_now(wait).await
    }
}

/// A [Channel] with an explicit lifecycle.
///
/// Every call made over it holds a [ChannelLease]. Shutting the channel down
/// cancels the calls holding one, and waits for their leases to be dropped.
pub struct GrpcChannel {
    channel: Channel,
    authority: String,
    leases: TaskTracker,
    cancel: CancellationToken,
}

impl GrpcChannel {
    pub fn new(channel: Channel, authority: impl Into<String>) -> Self {
        Self {
            channel,
            authority: authority.into(),
            leases: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Connects using [channel_from_url].
    pub async fn from_url(url: &url::Url) -> Result<Self, Error> {
        Ok(Self::new(
            channel_from_url(url).await?,
            authority_from_url(url),
        ))
    }

    /// Hands out a lease for one call. Fails once the channel is shut down.
    pub fn lease(&self) -> Result<ChannelLease, tonic::Status> {
        if self.cancel.is_cancelled() {
            return Err(tonic::Status::unavailable(format!(
                "channel to {} is shut down",
                self.authority
            )));
        }

        Ok(ChannelLease {
            channel: self.channel.clone(),
            cancel: self.cancel.clone(),
            _token: self.leases.token(),
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
impl ManagedChannel for GrpcChannel {
    fn authority(&self) -> &str {
        &self.authority
    }

    async fn shutdown_now(&self, wait: Duration) -> Result<bool, Interrupted> {
        self.leases.close();
        self.cancel.cancel();

        debug!(authority = %self.authority, in_flight = self.leases.len(), "shutting down channel");

        tokio::select! {
            res = tokio::time::timeout(wait, self.leases.wait()) => Ok(res.is_ok()),
            _ = interrupted() => Err(Interrupted),
        }
    }
}

/// Resolves when the process receives an interrupt, never if the signal
/// handler can't be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await
    }
}

/// Grants one call access to a [GrpcChannel], and keeps the channel from
/// counting as terminated until dropped.
pub struct ChannelLease {
    channel: Channel,
    cancel: CancellationToken,
    _token: TaskTrackerToken,
}

impl ChannelLease {
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Drives `fut` to completion, unless the channel gets shut down first,
    /// in which case a cancelled status is returned.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<tonic::Status>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(tonic::Status::cancelled("channel shut down").into()),
            res = fut => res,
        }
    }
}
