use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::caching::ResourceKey;
use crate::error::LoadError;
use crate::locator::SourceLocator;
use crate::types::{LoadOptions, Payload, RequestId};

/// Receives the lifecycle events of load requests.
///
/// All callbacks run sequentially on the engine's delivery task, never on a
/// fetch worker. Per request the order is always `on_start`, then success
/// and/or failure, then `on_end`. A request delivers success twice only in
/// the cached-then-refreshed case, with the `from_cache = true` delivery
/// first.
pub trait LoadObserver: Send + Sync {
    /// The request entered the pipeline.
    ///
    /// `placeholder` carries the configured loading placeholder, if any.
    fn on_start(&self, request: RequestId, placeholder: Option<&Bytes>) {
        let _ = (request, placeholder);
    }

    /// A payload is ready.
    ///
    /// `from_cache` tells a cache tier apart from a live fetch.
    /// `will_refresh` announces that a refreshed payload will follow in a
    /// second `on_success` call.
    fn on_success(
        &self,
        request: RequestId,
        payload: &Arc<Payload>,
        from_cache: bool,
        will_refresh: bool,
    );

    /// The load failed.
    ///
    /// `placeholder` carries the configured failure placeholder, if any.
    fn on_failure(&self, request: RequestId, error: &LoadError, placeholder: Option<&Bytes>);

    /// No further events will be delivered for this request.
    fn on_end(&self, request: RequestId) {
        let _ = request;
    }
}

/// The consumer slot a request delivers into.
///
/// A binding remembers the key it is currently aimed at; submitting a load
/// re-aims it. Deliveries for a key the binding has moved away from are
/// suppressed, which is how superseded requests are cancelled. Share one
/// binding between all requests that target the same consumer slot.
#[derive(Debug, Clone, Default)]
pub struct Binding {
    current: Arc<Mutex<Option<ResourceKey>>>,
}

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aims the binding at `key`. Happens automatically when a request
    /// carrying this binding is submitted.
    pub(crate) fn aim(&self, key: ResourceKey) {
        *self.current.lock().unwrap() = Some(key);
    }

    /// Whether the binding is still aimed at `key`.
    pub(crate) fn is_aimed_at(&self, key: &ResourceKey) -> bool {
        self.current.lock().unwrap().as_ref() == Some(key)
    }
}

/// One load call: where to fetch from, how to cache, who to notify.
pub struct LoadRequest {
    /// The resource to load.
    pub locator: SourceLocator,
    /// Cache and refresh behavior.
    pub options: LoadOptions,
    /// Receives this request's lifecycle events.
    pub observer: Arc<dyn LoadObserver>,
    /// The consumer slot delivered into. Without a binding, deliveries are
    /// never suppressed.
    pub binding: Option<Binding>,
    /// An already-available payload body. Skips every fetch tier; the bytes
    /// are delivered and cached directly.
    pub prefetched: Option<Bytes>,
}

impl LoadRequest {
    /// A plain request with default options, no binding and no prefetched
    /// payload.
    pub fn new(locator: SourceLocator, observer: Arc<dyn LoadObserver>) -> Self {
        Self {
            locator,
            options: LoadOptions::default(),
            observer,
            binding: None,
            prefetched: None,
        }
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("locator", &self.locator)
            .field("options", &self.options)
            .field("binding", &self.binding)
            .field("prefetched", &self.prefetched.is_some())
            .finish()
    }
}
