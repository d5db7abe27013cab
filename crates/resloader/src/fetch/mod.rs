//! Transport for fetching resources from their sources.
//!
//! The [`FetchService`] dispatches a locator to the matching transport,
//! retries transient failures and enforces the whole-fetch timeout. It does
//! no deduplication of its own; every call fetches freshly. Coalescing and
//! caching happen in the layers above.

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{LoadError, LoadResult};
use crate::locator::SourceLocator;
use crate::metric;
use crate::types::Payload;

mod filesystem;
mod http;

pub use http::create_client;

/// HTTP User-Agent string to use.
const USER_AGENT: &str = concat!("resloader/", env!("CARGO_PKG_VERSION"));

impl LoadError {
    fn transport_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::Fetch(error_string)
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(error: reqwest::Error) -> Self {
        Self::transport_error(&error)
    }
}

/// Timeouts applied to every fetch.
#[derive(Copy, Clone, Debug)]
pub struct FetchTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one fetch, headers and body included.
    pub fetch: Duration,
}

impl FetchTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            fetch: config.fetch_timeout,
        }
    }
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            fetch: Duration::from_secs(30),
        }
    }
}

/// A service which fetches resources from their source locations.
#[derive(Debug)]
pub struct FetchService {
    timeouts: FetchTimeouts,
    http: http::HttpFetcher,
    fs: filesystem::FilesystemFetcher,
}

impl FetchService {
    pub fn new(config: &Config) -> Arc<Self> {
        let timeouts = FetchTimeouts::from_config(config);
        let client = create_client(&timeouts);

        Arc::new(Self {
            timeouts,
            http: http::HttpFetcher::new(client),
            fs: filesystem::FilesystemFetcher::new(),
        })
    }

    /// Dispatches the fetch to the transport matching the locator.
    async fn dispatch_fetch(&self, locator: &SourceLocator) -> LoadResult<Payload> {
        let result = retry(|| async {
            match locator {
                SourceLocator::Http(url) => self.http.fetch_source(url).await,
                SourceLocator::Filesystem(path) => self.fs.fetch_source(path).await,
            }
        });

        let result = result.await;

        if let Err(err) = &result {
            tracing::debug!("Resource `{locator}` fetching failed: {err}");
        } else {
            tracing::debug!("Resource `{locator}` fetched successfully");
        }

        result
    }

    /// Fetches a resource from its source.
    ///
    /// Transient failures are retried; the configured whole-fetch timeout
    /// caps the entire attempt including retries.
    pub async fn fetch(&self, locator: &SourceLocator) -> LoadResult<Payload> {
        let timeout = self.timeouts.fetch;
        let start = Instant::now();

        let result = match tokio::time::timeout(timeout, self.dispatch_fetch(locator)).await {
            Ok(result) => result,
            Err(_) => Err(LoadError::Timeout(timeout)),
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        };
        metric!(timer("fetch.duration") = start.elapsed(), "status" => status);
        if let Ok(payload) = &result {
            metric!(time_raw("fetch.size") = payload.len() as u64);
        }
        if matches!(result, Err(LoadError::Fetch(_) | LoadError::Timeout(_))) {
            metric!(counter("fetch.failure") += 1);
        }

        result
    }
}

/// Try to run a future up to 3 times with 20 millisecond delays on failure.
pub async fn retry<G, F, T>(mut task_gen: G) -> LoadResult<T>
where
    G: FnMut() -> F,
    F: Future<Output = LoadResult<T>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        // its highly unlikely we get a different result when retrying these
        let should_not_retry = matches!(
            result,
            Ok(_) | Err(LoadError::NotFound | LoadError::PermissionDenied(_))
        );

        if should_not_retry || tries >= 3 {
            break result;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn retry_skips_permanent_failures() {
        let tries = AtomicUsize::new(0);
        let result: LoadResult<()> = retry(|| {
            tries.fetch_add(1, Ordering::SeqCst);
            async { Err(LoadError::NotFound) }
        })
        .await;

        assert_eq!(result, Err(LoadError::NotFound));
        assert_eq!(tries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_gives_transient_failures_three_tries() {
        let tries = AtomicUsize::new(0);
        let result = retry(|| {
            let attempt = tries.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(LoadError::Fetch("connection reset".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(tries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetch_times_out() {
        resloader_test::setup();

        let server = resloader_test::Server::new();
        let locator = SourceLocator::Http(server.url("/delay/1s/garbage_data/OK"));

        let service = FetchService {
            timeouts: FetchTimeouts {
                connect: Duration::from_secs(1),
                fetch: Duration::from_millis(100),
            },
            http: http::HttpFetcher::new(reqwest::Client::new()),
            fs: filesystem::FilesystemFetcher::new(),
        };

        let result = service.fetch(&locator).await;
        assert_eq!(result, Err(LoadError::Timeout(Duration::from_millis(100))));
    }
}
