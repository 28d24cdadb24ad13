//! Byte-range HTTP client for the origin server.
//!
//! The origin is the source of last resort: it serves the media metadata,
//! the head, and any part no peer currently holds. Success is strictly
//! 200 for plain fetches and 206 for ranged ones.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Default timeout for origin connections.
pub const ORIGIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for origin reads.
pub const ORIGIN_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors that can occur while fetching from the origin.
#[derive(Debug, Error)]
pub enum OriginError {
    /// HTTP request failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an unexpected status code.
    #[error("unexpected status: {0}")]
    Status(StatusCode),

    /// The response body was not the expected JSON.
    #[error("invalid body: {0}")]
    Body(String),
}

/// Future type returned by [`OriginFetch`] methods.
pub type OriginFuture<T> = BoxFuture<'static, Result<T, OriginError>>;

/// The origin fetch contract.
///
/// Object-safe so tests can substitute an in-memory origin for the HTTP
/// client.
pub trait OriginFetch: Send + Sync {
    /// Fetches a JSON document; success status is 200.
    fn fetch_json(&self, url: &str) -> OriginFuture<Value>;

    /// Fetches a whole resource; success status is 200.
    fn fetch_bytes(&self, url: &str) -> OriginFuture<Bytes>;

    /// Fetches an inclusive byte range; success status is 206.
    fn fetch_range(&self, url: &str, start: u64, end: u64) -> OriginFuture<Bytes>;
}

/// The `reqwest`-backed origin client.
///
/// # Examples
///
/// ```no_run
/// use swarmcast::origin::{OriginClient, OriginFetch};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let origin = OriginClient::new()?;
/// let head = origin.fetch_range("https://cdn.example/video.webm", 0, 4095).await?;
/// # Ok(())
/// # }
/// ```
pub struct OriginClient {
    client: Client,
}

impl OriginClient {
    pub fn new() -> Result<Self, OriginError> {
        let client = Client::builder()
            .connect_timeout(ORIGIN_CONNECT_TIMEOUT)
            .read_timeout(ORIGIN_READ_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Uses a pre-configured HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl OriginFetch for OriginClient {
    fn fetch_json(&self, url: &str) -> OriginFuture<Value> {
        let client = self.client.clone();
        let url = url.to_string();
        async move {
            let response = client.get(&url).send().await?;
            if response.status() != StatusCode::OK {
                return Err(OriginError::Status(response.status()));
            }
            let bytes = response.bytes().await?;
            serde_json::from_slice(&bytes).map_err(|error| OriginError::Body(error.to_string()))
        }
        .boxed()
    }

    fn fetch_bytes(&self, url: &str) -> OriginFuture<Bytes> {
        let client = self.client.clone();
        let url = url.to_string();
        async move {
            let response = client.get(&url).send().await?;
            if response.status() != StatusCode::OK {
                return Err(OriginError::Status(response.status()));
            }
            Ok(response.bytes().await?)
        }
        .boxed()
    }

    fn fetch_range(&self, url: &str, start: u64, end: u64) -> OriginFuture<Bytes> {
        let client = self.client.clone();
        let url = url.to_string();
        async move {
            debug!(%url, start, end, "fetching range from origin");
            let response = client
                .get(&url)
                .header(header::RANGE, format!("bytes={}-{}", start, end))
                .send()
                .await?;
            if response.status() != StatusCode::PARTIAL_CONTENT {
                return Err(OriginError::Status(response.status()));
            }
            Ok(response.bytes().await?)
        }
        .boxed()
    }
}
