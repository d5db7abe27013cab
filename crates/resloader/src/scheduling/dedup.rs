use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

use crate::caching::ResourceKey;
use crate::error::LoadResult;
use crate::metric;
use crate::types::Loaded;

/// The channel over which a flight's outcome is fanned out.
///
/// The `Shared` wrapper makes the receiving side clonable, so any number of
/// coalesced requests can await the same fetch. Receiving fails only when
/// the sending side was dropped without resolving, which is how displaced
/// flights surface.
pub type OutcomeChannel = Shared<oneshot::Receiver<LoadResult<Loaded>>>;

type FlightMap = Arc<Mutex<BTreeMap<ResourceKey, OutcomeChannel>>>;

/// Tracks the set of keys currently being fetched.
///
/// Deduplicates concurrent loads: for every key, exactly one concurrent
/// caller becomes the [`Leader`](Flight::Leader) and runs the fetch, all
/// others become [`Follower`](Flight::Follower)s on the same outcome
/// channel. The guarding mutex only ever covers the membership check and
/// insertion, never any I/O.
#[derive(Debug, Clone, Default)]
pub struct DedupTracker {
    flights: FlightMap,
}

/// The result of [`DedupTracker::begin`].
pub enum Flight {
    /// The caller is the first for this key and must run the fetch.
    Leader(FlightLead),
    /// A fetch for this key is already in flight; await its channel.
    Follower(OutcomeChannel),
}

/// Everything the flight leader needs to resolve its flight.
pub struct FlightLead {
    /// Evicts the in-flight entry when dropped. Must move into the fetch
    /// task before the task is queued, so that a task displaced from the
    /// waiting ring still cleans up when its never-polled future is dropped.
    pub permit: FlightPermit,
    /// Resolves the outcome for all waiters.
    pub sender: oneshot::Sender<LoadResult<Loaded>>,
    /// The leader's own copy of the outcome channel.
    pub channel: OutcomeChannel,
}

/// Removes a key from the in-flight set when dropped.
///
/// Dropping the permit before the outcome is sent ensures that callers
/// either get a channel that will receive data, or they create a new flight.
pub struct FlightPermit {
    key: ResourceKey,
    flights: FlightMap,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.flights.lock().unwrap().remove(&self.key);
    }
}

impl DedupTracker {
    /// Joins the flight for `key`, creating it if none is running.
    ///
    /// Exactly one concurrent caller per key observes [`Flight::Leader`];
    /// everyone else gets a [`Flight::Follower`] channel resolving to the
    /// same outcome.
    pub fn begin(&self, key: &ResourceKey) -> Flight {
        let mut flights = self.flights.lock().unwrap();

        if let Some(channel) = flights.get(key) {
            let channel = channel.clone();
            drop(flights);

            // A concurrent load was coalesced onto the running fetch.
            metric!(counter("dedup.flight.joined") += 1);
            return Flight::Follower(channel);
        }

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        let evicted = flights.insert(key.clone(), channel.clone());
        debug_assert!(evicted.is_none());
        drop(flights);

        metric!(counter("dedup.flight.created") += 1);

        Flight::Leader(FlightLead {
            permit: FlightPermit {
                key: key.clone(),
                flights: Arc::clone(&self.flights),
            },
            sender,
            channel,
        })
    }

    /// The number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.flights.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use crate::types::Payload;

    use super::*;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::for_testing(name)
    }

    fn loaded(body: &str) -> Loaded {
        Loaded {
            payload: Arc::new(Payload::from_body(Bytes::copy_from_slice(body.as_bytes()))),
            from_cache: false,
        }
    }

    #[test]
    fn one_leader_per_key() {
        let tracker = DedupTracker::default();

        let first = tracker.begin(&key("a"));
        assert!(matches!(first, Flight::Leader(_)));
        assert!(matches!(tracker.begin(&key("a")), Flight::Follower(_)));
        // A different key gets its own flight.
        let second = tracker.begin(&key("b"));
        assert!(matches!(second, Flight::Leader(_)));
        assert_eq!(tracker.len(), 2);
    }

    #[tokio::test]
    async fn followers_receive_the_leaders_outcome() {
        let tracker = DedupTracker::default();

        let Flight::Leader(lead) = tracker.begin(&key("a")) else {
            panic!("expected a leader");
        };
        let Flight::Follower(follower) = tracker.begin(&key("a")) else {
            panic!("expected a follower");
        };

        drop(lead.permit);
        lead.sender.send(Ok(loaded("body"))).ok();

        assert_eq!(follower.await.unwrap(), Ok(loaded("body")));
        assert_eq!(lead.channel.await.unwrap(), Ok(loaded("body")));
    }

    #[test]
    fn dropping_the_permit_clears_the_flight() {
        let tracker = DedupTracker::default();

        let Flight::Leader(lead) = tracker.begin(&key("a")) else {
            panic!("expected a leader");
        };
        assert_eq!(tracker.len(), 1);

        // The flight resolved (or was displaced); the next caller for the
        // key leads a fresh flight.
        drop(lead);
        assert!(tracker.is_empty());
        assert!(matches!(tracker.begin(&key("a")), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn dropped_flights_cancel_their_followers() {
        let tracker = DedupTracker::default();

        let Flight::Leader(lead) = tracker.begin(&key("a")) else {
            panic!("expected a leader");
        };
        let Flight::Follower(follower) = tracker.begin(&key("a")) else {
            panic!("expected a follower");
        };

        // Sender dropped without resolving, as happens when a queued fetch
        // task is displaced.
        drop(lead);
        assert!(follower.await.is_err());
    }
}
