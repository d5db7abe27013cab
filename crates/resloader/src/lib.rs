//! Cached, deduplicated loading of remote resources.
//!
//! A [`Loader`] resolves resource locators through a memory tier, a disk
//! tier and finally a live fetch, with concurrent requests for the same
//! resource coalesced into a single fetch. Fetches run on a bounded worker
//! pool whose overflow displaces the oldest waiting task instead of growing
//! a queue. Outcomes are delivered asynchronously through a
//! [`LoadObserver`], in submission order per consumer.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod fetch;
pub mod logging;
pub mod scheduling;

mod dispatch;
mod engine;
mod error;
mod locator;
mod request;
mod types;
mod utils;

pub use config::Config;
pub use engine::Loader;
pub use error::{LoadError, LoadResult};
pub use locator::SourceLocator;
pub use request::{Binding, LoadObserver, LoadRequest};
pub use types::{LoadOptions, Loaded, Payload, RequestId};
