//! The load engine.
//!
//! [`Loader`] ties the tiers together: per request it checks the memory
//! tier, falls back to a deduplicated fetch flight (which itself consults
//! the disk tier before going to the source), seeds the caches on
//! completion and fans the outcome out to every waiter through the
//! dispatcher.
//!
//! A loader is an explicitly constructed instance; applications create one
//! per cache universe and share it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::runtime::Handle;

use crate::caching::{DiskCache, MemoryCache, ResourceKey, from_policy};
use crate::config::Config;
use crate::dispatch::{Dispatcher, RequestHandle};
use crate::error::LoadResult;
use crate::fetch::FetchService;
use crate::locator::SourceLocator;
use crate::metric;
use crate::request::LoadRequest;
use crate::scheduling::{DedupTracker, FetchPool, Flight, FlightLead, OutcomeChannel};
use crate::types::{LoadOptions, Loaded, Payload, RequestId};

/// Which leg of a request a fetch flight serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// First pass over the tiers.
    Initial,
    /// Background refresh after a served cache hit, with a second delivery.
    RefreshDeliver,
    /// Background refresh that only updates the caches.
    RefreshSilent,
}

/// The resource loading engine.
///
/// `load` never blocks: it returns a [`RequestId`] immediately and delivers
/// all results through the request's observer on the delivery task.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    memory: Arc<dyn MemoryCache>,
    disk: Option<DiskCache>,
    default_ttl: Option<Duration>,
    dedup: DedupTracker,
    pool: FetchPool,
    fetcher: Arc<FetchService>,
    dispatcher: Dispatcher,
    runtime: Handle,
}

impl Loader {
    /// Creates a loader from the configuration, spawning its background
    /// tasks on the given runtime.
    pub fn new(config: &Config, runtime: Handle) -> anyhow::Result<Self> {
        let memory = from_policy(config.memory_cache_policy, config.memory_cache_max_entries);
        let disk = match config.cache_dir.as_deref() {
            Some(dir) => Some(DiskCache::new(dir).context("failed to open the disk cache")?),
            None => None,
        };

        let inner = LoaderInner {
            memory,
            disk,
            default_ttl: config.default_ttl,
            dedup: DedupTracker::default(),
            pool: FetchPool::new(config.max_workers, config.max_waiting, runtime.clone()),
            fetcher: FetchService::new(config),
            dispatcher: Dispatcher::new(&runtime),
            runtime,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Submits a load request.
    ///
    /// Returns immediately with the id the request's observer events will
    /// carry. All further outcomes, including failures, arrive through the
    /// observer.
    pub fn load(&self, request: LoadRequest) -> RequestId {
        let LoadRequest {
            locator,
            options,
            observer,
            binding,
            prefetched,
        } = request;

        let id = RequestId::new();
        let key = ResourceKey::for_locator(&locator, &options);
        metric!(counter("load.requests") += 1);

        if let Some(binding) = &binding {
            binding.aim(key.clone());
        }
        let handle = RequestHandle::new(id, key.clone(), observer, binding);

        self.inner
            .dispatcher
            .post_start(&handle, options.placeholder_on_loading.clone());

        // An in-hand payload skips every tier; deliver it and seed the
        // caches directly.
        if let Some(body) = prefetched {
            metric!(counter("load.prefetched") += 1);
            let payload = Arc::new(Payload::from_body(body));
            self.inner.seed_caches(&key, &payload, &options);
            self.inner
                .dispatcher
                .post_success(&handle, Arc::clone(&payload), false, false);
            self.inner.dispatcher.post_end(&handle);

            if options.cache_on_disk && self.inner.disk.is_some() {
                let inner = Arc::clone(&self.inner);
                self.inner.runtime.spawn(async move {
                    inner.write_through(&key, &payload, &options);
                });
            }
            return id;
        }

        // Memory tier. A hit means no disk or network access at all; a
        // refresh only ever follows a disk hit.
        if options.cache_in_memory {
            if let Some(payload) = self.inner.memory.get(&key) {
                metric!(counter("cache.memory.hit") += 1);
                self.inner
                    .dispatcher
                    .post_success(&handle, payload, true, false);
                self.inner.dispatcher.post_end(&handle);
                return id;
            }
            metric!(counter("cache.memory.miss") += 1);
        }

        // Disk tier and transport run on the fetch pipeline.
        self.inner
            .submit_flight(handle, locator, options, Phase::Initial);
        id
    }

    /// Drops the resource from both cache tiers.
    ///
    /// The options only contribute the load variant; policy flags do not
    /// change which entry is dropped.
    pub fn invalidate(&self, locator: &SourceLocator, options: &LoadOptions) -> io::Result<()> {
        let key = ResourceKey::for_locator(locator, options);
        self.inner.memory.remove(&key);
        if let Some(disk) = &self.inner.disk {
            disk.invalidate(&key)?;
        }
        Ok(())
    }

    /// Drops every entry from the memory tier.
    pub fn clear_memory(&self) {
        self.inner.memory.clear();
    }

    /// Removes every record from the disk tier.
    pub fn clear_disk(&self) -> io::Result<()> {
        if let Some(disk) = &self.inner.disk {
            disk.clear()?;
        }
        Ok(())
    }

    /// The number of keys currently being fetched.
    pub fn in_flight(&self) -> usize {
        self.inner.dedup.len()
    }

    /// The number of fetch tasks currently occupying a worker slot.
    pub fn running_fetches(&self) -> usize {
        self.inner.pool.running()
    }

    /// The number of fetch tasks held in the overflow ring.
    pub fn waiting_fetches(&self) -> usize {
        self.inner.pool.waiting()
    }
}

impl LoaderInner {
    /// Joins or creates the fetch flight for the request's key and spawns
    /// the per-request waiter delivering its outcome.
    fn submit_flight(
        self: &Arc<Self>,
        handle: RequestHandle,
        locator: SourceLocator,
        options: LoadOptions,
        phase: Phase,
    ) {
        let key = handle.key.clone();

        let channel = match self.dedup.begin(&key) {
            Flight::Follower(channel) => channel,
            Flight::Leader(lead) => self.spawn_flight(lead, key, &locator, &options, phase),
        };

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            inner.run_waiter(handle, locator, options, channel, phase).await;
        });
    }

    /// Submits the leader's fetch task to the pool.
    ///
    /// The flight permit and outcome sender both live inside the task
    /// future. If the pool displaces the task before it runs, dropping the
    /// future evicts the in-flight entry and cancels the outcome channel in
    /// one go.
    fn spawn_flight(
        self: &Arc<Self>,
        lead: FlightLead,
        key: ResourceKey,
        locator: &SourceLocator,
        options: &LoadOptions,
        phase: Phase,
    ) -> OutcomeChannel {
        let FlightLead {
            permit,
            sender,
            channel,
        } = lead;

        let inner = Arc::clone(self);
        let locator = locator.clone();
        let options = options.clone();
        let refresh = phase != Phase::Initial;

        let task = async move {
            let outcome = inner.fetch_once(&key, &locator, &options, refresh).await;
            // Drop the permit first to evict from the in-flight set. This
            // ensures that callers either get a channel that will receive
            // data, or they create a new flight.
            drop(permit);
            sender.send(outcome).ok();
        };
        self.pool.submit(task);

        channel
    }

    /// One full pass of the fetch pipeline: disk tier, then transport,
    /// then the write-through.
    async fn fetch_once(
        &self,
        key: &ResourceKey,
        locator: &SourceLocator,
        options: &LoadOptions,
        refresh: bool,
    ) -> LoadResult<Loaded> {
        // A refresh exists to replace the disk record, so it skips the read.
        if !refresh && options.cache_on_disk {
            if let Some(disk) = &self.disk {
                let ttl = options.ttl.or(self.default_ttl);
                if let Some(payload) = disk.open(key, ttl) {
                    metric!(counter("cache.disk.hit") += 1);
                    return Ok(Loaded {
                        payload: Arc::new(payload),
                        from_cache: true,
                    });
                }
                metric!(counter("cache.disk.miss") += 1);
            }
        }

        let payload = Arc::new(self.fetcher.fetch(locator).await?);
        self.write_through(key, &payload, options);

        Ok(Loaded {
            payload,
            from_cache: false,
        })
    }

    /// Persists a payload to the disk tier per the request's options.
    ///
    /// Write-through is best-effort: failures are logged and the payload is
    /// still delivered.
    fn write_through(&self, key: &ResourceKey, payload: &Payload, options: &LoadOptions) {
        if !options.cache_on_disk {
            return;
        }
        let Some(disk) = &self.disk else { return };

        if let Err(err) = disk.write(key, payload) {
            metric!(counter("cache.disk.write_failure") += 1);
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(error = stderr, "Failed to write cache record");
        }
    }

    /// Awaits a flight's outcome on behalf of one request and delivers it.
    ///
    /// Every coalesced request runs its own waiter, so the memory tier and
    /// the refresh decision follow each request's own options.
    async fn run_waiter(
        self: Arc<Self>,
        handle: RequestHandle,
        locator: SourceLocator,
        options: LoadOptions,
        channel: OutcomeChannel,
        phase: Phase,
    ) {
        let outcome = match channel.await {
            Ok(outcome) => outcome,
            Err(_cancelled) => {
                // The flight was displaced before it ran. Nothing is
                // delivered; a later request for the same consumer slot
                // supersedes this one.
                metric!(counter("load.abandoned") += 1);
                tracing::debug!(request = %handle.id, "Load abandoned, its fetch task was displaced");
                return;
            }
        };

        match outcome {
            Ok(loaded) => {
                self.seed_caches(&handle.key, &loaded.payload, &options);

                match phase {
                    Phase::Initial => {
                        let refresh = loaded.from_cache && options.refresh_after_hit;
                        let will_refresh = refresh && options.refresh_and_callback_again;

                        self.dispatcher.post_success(
                            &handle,
                            loaded.payload,
                            loaded.from_cache,
                            will_refresh,
                        );

                        if refresh {
                            let phase = if will_refresh {
                                Phase::RefreshDeliver
                            } else {
                                Phase::RefreshSilent
                            };
                            self.submit_flight(handle.clone(), locator, options, phase);
                        }
                        if !will_refresh {
                            self.dispatcher.post_end(&handle);
                        }
                    }
                    Phase::RefreshDeliver => {
                        self.dispatcher
                            .post_success(&handle, loaded.payload, false, false);
                        self.dispatcher.post_end(&handle);
                    }
                    Phase::RefreshSilent => {
                        // The caches were updated; the consumer asked for no
                        // second callback.
                    }
                }
            }
            Err(error) => {
                metric!(counter("load.failures") += 1);

                if phase == Phase::RefreshSilent {
                    tracing::debug!(
                        request = %handle.id,
                        "Background refresh failed: {error}"
                    );
                    return;
                }

                self.dispatcher.post_failure(
                    &handle,
                    error,
                    options.placeholder_on_failure.clone(),
                );
                self.dispatcher.post_end(&handle);
            }
        }
    }

    /// Stores a successful payload in the memory tier per the request's
    /// options.
    fn seed_caches(&self, key: &ResourceKey, payload: &Arc<Payload>, options: &LoadOptions) {
        if options.cache_in_memory {
            self.memory.put(key.clone(), Arc::clone(payload));
        }
    }
}
