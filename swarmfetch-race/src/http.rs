//! HTTP collaborator.
//!
//! The race and the mirror fallback use the same narrow contract: a GET that
//! resolves once the response head arrives, exposing the status and a byte
//! body stream. Dropping the future or the body cancels the request.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use swarmfetch_core::ByteStream;

use crate::error::RaceResult;

/// Default connect timeout for asset requests.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A response head with a streaming body.
pub struct HttpResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Issue a GET for `url`.
    async fn get(&self, url: &str) -> RaceResult<HttpResponse>;
}

/// [`HttpClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(connect_timeout: Duration) -> RaceResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an already configured client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> RaceResult<HttpResponse> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));

        tracing::trace!(url, status, "HTTP response head");
        Ok(HttpResponse {
            status,
            body: Box::pin(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_success_range() {
        let response = |status| HttpResponse {
            status,
            body: Box::pin(stream::empty()),
        };
        assert!(response(200).is_success());
        assert!(response(206).is_success());
        assert!(!response(304).is_success());
        assert!(!response(404).is_success());
    }
}
