use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

/// A fetched resource: the raw body plus the response headers it arrived
/// with.
///
/// Payloads are shared between cache tiers and waiters as `Arc<Payload>`, so
/// every consumer coalesced onto one fetch observes the same allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// The raw resource body.
    pub body: Bytes,
    /// Response headers as `"Name: value"` strings, in response order.
    ///
    /// Empty for filesystem resources and prefetched payloads.
    pub headers: Vec<String>,
}

impl Payload {
    pub fn new(body: Bytes, headers: Vec<String>) -> Self {
        Self { body, headers }
    }

    /// A payload consisting of bare bytes without header metadata.
    pub fn from_body(body: Bytes) -> Self {
        Self::new(body, Vec::new())
    }

    /// The body size in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// The successful outcome of one fetch flight, fanned out to every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded {
    /// The payload, shared across all waiters and the memory tier.
    pub payload: Arc<Payload>,
    /// Whether the payload was served from the disk tier instead of a live
    /// fetch.
    pub from_cache: bool,
}

/// Identifies one `load` call across its lifecycle events.
///
/// Every call to [`Loader::load`](crate::Loader::load) returns a fresh id,
/// and every observer callback for that request carries it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-request load behavior.
///
/// The defaults cache in both tiers forever and never refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Keep the payload in the in-memory tier after a successful load.
    pub cache_in_memory: bool,
    /// Persist the payload in the on-disk tier after a successful fetch.
    pub cache_on_disk: bool,
    /// Maximum age before a disk record goes stale. `None` caches forever.
    pub ttl: Option<Duration>,
    /// After serving a valid disk record, fetch a fresh copy from the source
    /// in the background.
    pub refresh_after_hit: bool,
    /// Deliver a second success once the background refresh finishes.
    ///
    /// Only meaningful together with `refresh_after_hit`; without it the
    /// refreshed payload silently replaces the cached record.
    pub refresh_and_callback_again: bool,
    /// Delivered with the start event while the load is pending.
    pub placeholder_on_loading: Option<Bytes>,
    /// Delivered with the failure event when the load fails.
    pub placeholder_on_failure: Option<Bytes>,
    /// Distinguishes differently processed variants of the same locator in
    /// the cache key. Pure policy flags above do not enter the key.
    pub variant: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            cache_in_memory: true,
            cache_on_disk: true,
            ttl: None,
            refresh_after_hit: false,
            refresh_and_callback_again: false,
            placeholder_on_loading: None,
            placeholder_on_failure: None,
            variant: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_cache_forever() {
        let options = LoadOptions::default();
        assert!(options.cache_in_memory);
        assert!(options.cache_on_disk);
        assert_eq!(options.ttl, None);
        assert!(!options.refresh_after_hit);
        assert!(!options.refresh_and_callback_again);
    }
}
