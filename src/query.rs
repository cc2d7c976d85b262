//! Fetch hook over the fetch cache.
//!
//! Inspired by TanStack Query, a `Query<T>` observes one request key: it
//! triggers the first fetch, exposes loading/data/error state read from the
//! cache and the entity store, and reports when that state may have changed.
//!
//! # Example
//!
//! ```ignore
//! let mut query = session.use_api::<Mesh>(&ApiKey::Meshes { partner_id });
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! let state = query.state();
//! if let Some(meshes) = state.values() {
//!     render(meshes);
//! }
//! ```

use std::fmt;
use std::marker::PhantomData;

use tokio::sync::watch;

use crate::cache::{CacheEntry, CacheStatus, FetchCache, RequestKey, Shape};
use crate::error::FetchError;
use crate::store::{Entity, EntityId, Record, Store};

/// Options accepted by a fetch hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
  /// Gate the request entirely, e.g. while a required id is still unknown
  pub is_invalid: bool,
}

impl FetchOptions {
  pub fn invalid_if(is_invalid: bool) -> Self {
    Self { is_invalid }
  }
}

/// What a fetch hook currently shows.
#[derive(Debug, Clone)]
pub struct FetchState<T> {
  /// Live records, in response order
  pub data: Option<Vec<Record<T>>>,
  pub loading: bool,
  pub error: Option<FetchError>,
}

impl<T> FetchState<T> {
  /// Nothing requested: no data, not loading, no error.
  pub fn idle() -> Self {
    Self {
      data: None,
      loading: false,
      error: None,
    }
  }

  pub fn is_idle(&self) -> bool {
    self.data.is_none() && !self.loading && self.error.is_none()
  }

  /// First record, for single-entity requests.
  pub fn first(&self) -> Option<&Record<T>> {
    self.data.as_ref().and_then(|records| records.first())
  }
}

impl<T: Clone> FetchState<T> {
  /// Clone the current values out of the records.
  pub fn values(&self) -> Option<Vec<T>> {
    self
      .data
      .as_ref()
      .map(|records| records.iter().map(Record::snapshot).collect())
  }
}

/// Live records for resolved ids. Ids dropped by a store clear are skipped.
pub(crate) fn records<T: Entity>(store: &Store, ids: &[EntityId]) -> Vec<Record<T>> {
  ids.iter().filter_map(|id| store.get::<T>(id)).collect()
}

/// Hook state for a cache entry, keeping previous data while revalidating.
pub(crate) fn state_of<T: Entity>(store: &Store, entry: Option<&CacheEntry>) -> FetchState<T> {
  let Some(entry) = entry else {
    return FetchState::idle();
  };
  match &entry.status {
    CacheStatus::Pending { previous } => FetchState {
      data: previous.as_ref().map(|resolution| records(store, &resolution.ids)),
      loading: true,
      error: None,
    },
    CacheStatus::Resolved(resolution) => FetchState {
      data: Some(records(store, &resolution.ids)),
      loading: false,
      error: None,
    },
    CacheStatus::Error(err) => FetchState {
      data: None,
      loading: false,
      error: Some(err.clone()),
    },
  }
}

/// Observer of one request key.
///
/// Dropping a query never cancels its request; the result still lands in the
/// cache and the store for the next observer.
pub struct Query<T> {
  cache: FetchCache,
  key: RequestKey,
  shape: Shape,
  options: FetchOptions,
  cache_changes: watch::Receiver<u64>,
  record_changes: watch::Receiver<u64>,
  _kind: PhantomData<fn() -> T>,
}

impl<T: Entity> Query<T> {
  /// Observe `key`, starting its fetch unless the options gate it.
  pub fn new(cache: FetchCache, key: RequestKey, shape: Shape, options: FetchOptions) -> Self {
    if !options.is_invalid {
      cache.ensure::<T>(&key, &shape);
    }
    let cache_changes = cache.subscribe();
    let record_changes = T::map(&cache.store().domain).subscribe();
    Self {
      cache,
      key,
      shape,
      options,
      cache_changes,
      record_changes,
      _kind: PhantomData,
    }
  }

  pub fn key(&self) -> &RequestKey {
    &self.key
  }

  pub fn is_invalid(&self) -> bool {
    self.options.is_invalid
  }

  /// Get the current state of the query.
  pub fn state(&self) -> FetchState<T> {
    if self.options.is_invalid {
      return FetchState::idle();
    }
    state_of(self.cache.store(), self.cache.peek(&self.key).as_ref())
  }

  /// Force a new request, even if one is in flight or data is fresh.
  pub fn refetch(&self) {
    if self.options.is_invalid {
      return;
    }
    // The request runs on its own task; nothing needs to hold the future.
    drop(self.cache.refetch::<T>(&self.key, &self.shape));
  }

  /// Check for changes since the last poll.
  ///
  /// Returns `true` if the cache or any record of this kind changed.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    if self.options.is_invalid {
      return false;
    }
    let mut changed = false;
    for rx in [&mut self.cache_changes, &mut self.record_changes] {
      if rx.has_changed().unwrap_or(false) {
        let _ = rx.borrow_and_update();
        changed = true;
      }
    }
    changed
  }

  /// Wait for the request in flight, if any, then return the state.
  ///
  /// Never starts a request itself, so a failed key stays failed until
  /// [`Query::refetch`] is called.
  pub async fn settled(&self) -> FetchState<T> {
    if !self.options.is_invalid {
      if let Some(in_flight) = self.cache.in_flight(&self.key) {
        let _ = in_flight.await;
      }
    }
    self.state()
  }
}

impl<T: Entity> fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Query")
      .field("kind", &T::KIND)
      .field("key", &self.key)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
