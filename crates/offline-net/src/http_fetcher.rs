//! reqwest-backed network access.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{Fetcher, NetError, Request, Response, ResponseSource};

/// Network client configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Timeout applied when the request carries none.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("offline-sw/", env!("CARGO_PKG_VERSION")).to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Fetches requests over HTTP, passing every status through untouched.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching from network");

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .timeout(timeout);

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url,
            status,
            headers,
            body,
            source: ResponseSource::Network,
        })
    }
}
