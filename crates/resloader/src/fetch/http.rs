//! Support to fetch resources over HTTP.

use std::time::Duration;

use reqwest::{Client, StatusCode, Url, header};

use crate::error::{LoadError, LoadResult};
use crate::types::Payload;

use super::{FetchTimeouts, USER_AGENT};

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// The client transparently decompresses response bodies, so cached payloads
/// always hold the decoded representation.
pub fn create_client(timeouts: &FetchTimeouts) -> Client {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.fetch)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}

/// Fetcher implementation for HTTP(S) sources.
#[derive(Debug)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetches a resource hosted on an HTTP server.
    pub async fn fetch_source(&self, url: &Url) -> LoadResult<Payload> {
        tracing::debug!("Fetching resource from `{url}`");

        let request = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT);
        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            let headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    format!("{}: {}", name.as_str(), String::from_utf8_lossy(value.as_bytes()))
                })
                .collect();

            let body = response.bytes().await?;
            Ok(Payload::new(body, headers))
        } else if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
            tracing::debug!("Insufficient permissions to fetch `{url}`: {status}");

            Err(LoadError::PermissionDenied(status.to_string()))
            // If it's a client error, chances are it's a 404.
        } else if status.is_client_error() {
            tracing::debug!("Unexpected client error status code from `{url}`: {status}");

            Err(LoadError::NotFound)
        } else {
            tracing::debug!("Unexpected status code from `{url}`: {status}");

            Err(LoadError::Fetch(status.to_string()))
        }
    }
}
