//! The two cache tiers and the key that addresses them.
//!
//! Loaded payloads live in a bounded in-memory tier (see [`MemoryCache`])
//! and a persisted on-disk tier (see [`DiskCache`]). Both tiers are
//! addressed by a [`ResourceKey`] deterministically derived from the source
//! locator and load variant, so equal requests always land on the same
//! entries.

mod disk;
mod key;
mod memory;

pub use disk::{DiskCache, DiskRecord};
pub use key::{KeyBuilder, ResourceKey};
pub(crate) use memory::from_policy;
pub use memory::{LruMemoryCache, MemoryCache, WeakMemoryCache};
