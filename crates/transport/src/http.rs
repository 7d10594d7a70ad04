use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt as _;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, trace};
use url::Url;

use crate::{ByteStream, RangeFetcher, TransportError};

/// HTTP(S) range fetcher over a shared [`reqwest::Client`].
#[derive(Clone, Debug, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a caller-configured client (timeouts, proxies, TLS).
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn ranged(&self, url: &Url, lo: u64, hi: u64) -> Result<Response, TransportError> {
        if lo >= hi {
            return Err(TransportError::InvalidRange { lo, hi });
        }

        trace!(%url, %lo, %hi, "Ranged request");
        let response = self
            .client
            .get(url.clone())
            .header(RANGE, range_header(lo, hi))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

/// `bytes=lo-(hi-1)`, the inclusive wire form of our exclusive range.
fn range_header(lo: u64, hi: u64) -> String {
    format!("bytes={lo}-{}", hi - 1)
}

#[async_trait]
impl RangeFetcher for HttpFetcher {
    async fn head(&self, url: &Url) -> Result<u64, TransportError> {
        let response = self.client.head(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| TransportError::MissingLength {
                url: url.to_string(),
            })?;

        debug!(%url, %length, "Artifact size resolved");
        Ok(length)
    }

    async fn get_range(&self, url: &Url, lo: u64, hi: u64) -> Result<Bytes, TransportError> {
        let response = self.ranged(url, lo, hi).await?;
        let whole = response.status() == StatusCode::OK;
        let body = response.bytes().await?;

        let want = hi - lo;
        if whole {
            // The server ignored the range header and sent the whole
            // resource; carve our window out of it.
            if (body.len() as u64) < hi {
                return Err(TransportError::ShortBody {
                    lo,
                    hi,
                    got: body.len() as u64,
                });
            }
            return Ok(body.slice(lo as usize..hi as usize));
        }

        if body.len() as u64 != want {
            return Err(TransportError::ShortBody {
                lo,
                hi,
                got: body.len() as u64,
            });
        }
        Ok(body)
    }

    async fn get_range_stream(
        &self,
        url: &Url,
        lo: u64,
        hi: u64,
    ) -> Result<ByteStream, TransportError> {
        let response = self.ranged(url, lo, hi).await?;

        let stream = try_stream! {
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                yield chunk?;
            }
        };
        Ok(Box::pin(stream))
    }
}
