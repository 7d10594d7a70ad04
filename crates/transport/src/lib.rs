//! Range-capable transport for remote artifacts.
//!
//! The core never talks to the network directly; it is handed a
//! [`RangeFetcher`] and stays agnostic of the protocol behind it. The
//! one production implementation is [`HttpFetcher`].

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;
use url::Url;

mod http;

pub use http::HttpFetcher;

/// Conventional sidecar suffix under which the reference tree of an
/// artifact is published.
pub const REFERENCE_SUFFIX: &str = ".mref";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("http request failed")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("range [{lo}, {hi}) returned {got} bytes")]
    ShortBody { lo: u64, hi: u64, got: u64 },

    #[error("response for {url} carries no usable content length")]
    MissingLength { url: String },

    #[error("invalid range [{lo}, {hi})")]
    InvalidRange { lo: u64, hi: u64 },
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Ranged access to an immutable remote artifact.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Total size of the artifact in bytes.
    async fn head(&self, url: &Url) -> Result<u64, TransportError>;

    /// Exactly the bytes of `[lo, hi)`, or an error. Implementations
    /// must never return a short body.
    async fn get_range(&self, url: &Url, lo: u64, hi: u64) -> Result<Bytes, TransportError>;

    /// The bytes of `[lo, hi)` as an async stream.
    async fn get_range_stream(
        &self,
        url: &Url,
        lo: u64,
        hi: u64,
    ) -> Result<ByteStream, TransportError>;
}

/// URL of the reference-tree sidecar for an artifact: the artifact URL
/// with `.mref` appended to its path.
pub fn reference_url(artifact: &Url) -> Url {
    let mut url = artifact.clone();
    let path = format!("{}{REFERENCE_SUFFIX}", url.path());
    url.set_path(&path);
    url
}
