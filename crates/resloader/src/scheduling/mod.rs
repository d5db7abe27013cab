//! Admission control for fetch work.
//!
//! [`DedupTracker`] coalesces concurrent loads of the same key onto a single
//! flight; [`FetchPool`] bounds how many flights run at once and holds the
//! overflow in a drop-oldest ring.

mod dedup;
mod pool;

pub use dedup::{DedupTracker, Flight, FlightLead, FlightPermit, OutcomeChannel};
pub use pool::{FetchPool, SubmitOutcome};
