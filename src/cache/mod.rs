//! Request-keyed fetch cache over the entity store.
//!
//! This module provides the deduplicating layer between hooks and the network:
//! - Canonical request keys, hashed into cache slot ids
//! - At most one in-flight request per key, shared by every caller
//! - Resolutions that reference store ids instead of copying entity data
//! - Generation checks so a superseded request never overwrites a newer one
//! - A bounded LRU that never drops an entry with a request in flight

mod entry;
mod key;
mod layer;
mod shape;

pub use entry::{CacheEntry, CacheStatus, Resolution};
pub use key::RequestKey;
pub use layer::{CacheSettings, FetchCache, DEFAULT_CAPACITY};
pub use shape::{decode, Decoded, PageMeta, Shape};
