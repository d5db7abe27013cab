//! Serialized delivery of consumer callbacks.
//!
//! All lifecycle events flow through one queue drained by a single task, so
//! observer callbacks never run concurrently and never on a fetch worker.
//! The drain task also performs the stale-binding check: a delivery whose
//! binding has been re-aimed at a different key since the request was
//! submitted is dropped instead of applied.

use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::caching::ResourceKey;
use crate::error::LoadError;
use crate::metric;
use crate::request::{Binding, LoadObserver};
use crate::types::{Payload, RequestId};

/// Everything needed to deliver events for one request.
#[derive(Clone)]
pub(crate) struct RequestHandle {
    pub id: RequestId,
    pub key: ResourceKey,
    observer: Arc<dyn LoadObserver>,
    binding: Option<Binding>,
}

impl RequestHandle {
    pub fn new(
        id: RequestId,
        key: ResourceKey,
        observer: Arc<dyn LoadObserver>,
        binding: Option<Binding>,
    ) -> Self {
        Self {
            id,
            key,
            observer,
            binding,
        }
    }
}

enum Event {
    Started {
        placeholder: Option<Bytes>,
    },
    Succeeded {
        payload: Arc<Payload>,
        from_cache: bool,
        will_refresh: bool,
    },
    Failed {
        error: LoadError,
        placeholder: Option<Bytes>,
    },
    Ended,
}

struct Delivery {
    handle: RequestHandle,
    event: Event,
}

/// Posts lifecycle events onto the single delivery task.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    queue: mpsc::UnboundedSender<Delivery>,
}

impl Dispatcher {
    /// Creates the dispatcher and spawns its drain task on `runtime`.
    ///
    /// The drain task ends once every `Dispatcher` clone is gone and the
    /// queue has run dry.
    pub fn new(runtime: &Handle) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Delivery>();

        runtime.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                deliver(delivery);
            }
        });

        Self { queue }
    }

    pub fn post_start(&self, handle: &RequestHandle, placeholder: Option<Bytes>) {
        self.post(handle, Event::Started { placeholder });
    }

    pub fn post_success(
        &self,
        handle: &RequestHandle,
        payload: Arc<Payload>,
        from_cache: bool,
        will_refresh: bool,
    ) {
        self.post(
            handle,
            Event::Succeeded {
                payload,
                from_cache,
                will_refresh,
            },
        );
    }

    pub fn post_failure(
        &self,
        handle: &RequestHandle,
        error: LoadError,
        placeholder: Option<Bytes>,
    ) {
        self.post(handle, Event::Failed { error, placeholder });
    }

    pub fn post_end(&self, handle: &RequestHandle) {
        self.post(handle, Event::Ended);
    }

    fn post(&self, handle: &RequestHandle, event: Event) {
        let delivery = Delivery {
            handle: handle.clone(),
            event,
        };
        // Failing means the engine is shutting down; events can be dropped.
        self.queue.send(delivery).ok();
    }
}

fn deliver(delivery: Delivery) {
    let Delivery { handle, event } = delivery;

    if let Some(binding) = &handle.binding {
        if !binding.is_aimed_at(&handle.key) {
            // The consumer slot was re-aimed at a different resource while
            // this request was in flight.
            metric!(counter("dispatch.suppressed") += 1);
            tracing::debug!(
                request = %handle.id,
                "Suppressing delivery for a re-aimed consumer slot"
            );
            return;
        }
    }

    match event {
        Event::Started { placeholder } => {
            handle.observer.on_start(handle.id, placeholder.as_ref());
        }
        Event::Succeeded {
            payload,
            from_cache,
            will_refresh,
        } => {
            handle
                .observer
                .on_success(handle.id, &payload, from_cache, will_refresh);
        }
        Event::Failed { error, placeholder } => {
            handle
                .observer
                .on_failure(handle.id, &error, placeholder.as_ref());
        }
        Event::Ended => {
            handle.observer.on_end(handle.id);
        }
    }
}
