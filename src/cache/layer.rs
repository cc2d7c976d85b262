//! Fetch cache that deduplicates requests and feeds the entity store.

use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use futures::future::{self, BoxFuture, Either, FutureExt, Shared};
use lru::LruCache;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, CacheStatus, Resolution};
use super::key::RequestKey;
use super::shape::{decode, Decoded, Shape};
use crate::error::FetchError;
use crate::store::{Entity, Store};
use crate::transport::{Credentials, Request, Transport};

/// Default number of request keys kept
pub const DEFAULT_CAPACITY: usize = 256;

/// In-flight request, shared by every caller of the same key.
type SharedFetch = Shared<BoxFuture<'static, Result<Resolution, FetchError>>>;

/// Settings for a [`FetchCache`].
#[derive(Debug, Clone)]
pub struct CacheSettings {
  /// Maximum number of request keys kept (least recently used go first)
  pub capacity: usize,
  /// How long before resolved data is considered stale
  pub stale_time: Duration,
  /// Credentials attached to every request the cache issues
  pub credentials: Credentials,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      capacity: DEFAULT_CAPACITY,
      stale_time: Duration::minutes(5),
      credentials: Credentials::None,
    }
  }
}

impl CacheSettings {
  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  pub fn with_credentials(mut self, credentials: Credentials) -> Self {
    self.credentials = credentials;
    self
  }
}

struct Slot {
  entry: CacheEntry,
  in_flight: Option<SharedFetch>,
}

struct Inner {
  store: Arc<Store>,
  transport: Arc<dyn Transport>,
  settings: CacheSettings,
  slots: Mutex<LruCache<String, Slot>>,
  /// Generations are unique across keys, so a late result can never match a
  /// slot that was evicted and created again.
  sequence: AtomicU64,
  /// Bumped by `clear`; requests issued in an older epoch write nothing.
  epoch: AtomicU64,
  changes: watch::Sender<u64>,
}

impl Inner {
  fn slots(&self) -> MutexGuard<'_, LruCache<String, Slot>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn notify(&self) {
    self.changes.send_modify(|version| *version += 1);
  }

  /// Record the outcome of `generation`, unless a newer request replaced it.
  fn settle(&self, hash: &str, generation: u64, outcome: &Result<Resolution, FetchError>) {
    {
      let mut slots = self.slots();
      match slots.get_mut(hash) {
        Some(slot) if slot.entry.generation == generation => {
          slot.in_flight = None;
          slot.entry.timestamp = Utc::now();
          slot.entry.status = match outcome {
            Ok(resolution) => CacheStatus::Resolved(resolution.clone()),
            Err(err) => CacheStatus::Error(err.clone()),
          };
        }
        Some(slot) => {
          debug!(
            key = %slot.entry.key,
            generation,
            current = slot.entry.generation,
            "discarding superseded result"
          );
          return;
        }
        None => {
          debug!(generation, "entry evicted before its request settled");
          return;
        }
      }
    }
    self.notify();
  }
}

/// Deduplicating fetch cache over one entity store.
///
/// Each request key has at most one request in flight; every caller of that
/// key shares it. Requests run on spawned tasks, so their results land in the
/// store and the cache even when nobody is waiting any more.
///
/// Methods that may start a request must be called inside a tokio runtime.
pub struct FetchCache {
  inner: Arc<Inner>,
}

impl FetchCache {
  pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>, settings: CacheSettings) -> Self {
    let capacity = NonZeroUsize::new(settings.capacity).unwrap_or(NonZeroUsize::MIN);
    let (changes, _rx) = watch::channel(0);
    Self {
      inner: Arc::new(Inner {
        store,
        transport,
        settings,
        slots: Mutex::new(LruCache::new(capacity)),
        sequence: AtomicU64::new(0),
        epoch: AtomicU64::new(0),
        changes,
      }),
    }
  }

  pub fn store(&self) -> &Arc<Store> {
    &self.inner.store
  }

  pub fn transport(&self) -> &Arc<dyn Transport> {
    &self.inner.transport
  }

  pub fn credentials(&self) -> &Credentials {
    &self.inner.settings.credentials
  }

  /// Subscribe to change notifications for any entry.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.inner.changes.subscribe()
  }

  pub fn len(&self) -> usize {
    self.inner.slots().len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.slots().is_empty()
  }

  /// Read an entry without triggering anything.
  pub fn peek(&self, key: &RequestKey) -> Option<CacheEntry> {
    self
      .inner
      .slots()
      .peek(&key.cache_hash())
      .map(|slot| slot.entry.clone())
  }

  /// First observation of a key.
  ///
  /// Starts exactly one request when the entry is missing, failed,
  /// invalidated or stale; otherwise returns the entry as is.
  pub fn ensure<T: Entity>(&self, key: &RequestKey, shape: &Shape) -> CacheEntry {
    let hash = key.cache_hash();
    let entry = {
      let mut slots = self.inner.slots();
      let hit = slots
        .get(&hash)
        .filter(|slot| !self.needs_fetch(&slot.entry))
        .map(|slot| slot.entry.clone());
      if let Some(entry) = hit {
        debug!(key = %key, "cache hit");
        return entry;
      }
      self.start::<T>(&mut slots, hash, key, shape).0
    };
    self.inner.notify();
    entry
  }

  /// Resolve a key: join the in-flight request, reuse a fresh resolution, or
  /// start a new request.
  pub fn fetch<T: Entity>(
    &self,
    key: &RequestKey,
    shape: &Shape,
  ) -> impl Future<Output = Result<Resolution, FetchError>> + Send + 'static {
    let hash = key.cache_hash();
    let shared = {
      let mut slots = self.inner.slots();
      let current = slots.get(&hash).map(|slot| {
        (
          slot.in_flight.clone(),
          self.needs_fetch(&slot.entry),
          slot.entry.status.clone(),
        )
      });
      match current {
        Some((Some(in_flight), _, _)) => {
          debug!(key = %key, "joining in-flight request");
          in_flight
        }
        Some((None, false, CacheStatus::Resolved(resolution))) => {
          debug!(key = %key, "cache hit");
          return Either::Left(future::ready(Ok(resolution)));
        }
        _ => {
          let (_, shared) = self.start::<T>(&mut slots, hash, key, shape);
          drop(slots);
          self.inner.notify();
          shared
        }
      }
    };
    Either::Right(shared)
  }

  /// Manual retry: always issues a new request for the key.
  ///
  /// A request already in flight keeps running, but its outcome no longer
  /// settles the entry.
  pub fn refetch<T: Entity>(
    &self,
    key: &RequestKey,
    shape: &Shape,
  ) -> impl Future<Output = Result<Resolution, FetchError>> + Send + 'static {
    let shared = {
      let mut slots = self.inner.slots();
      self.start::<T>(&mut slots, key.cache_hash(), key, shape).1
    };
    self.inner.notify();
    shared
  }

  /// The request in flight for a key, if any.
  pub fn in_flight(
    &self,
    key: &RequestKey,
  ) -> Option<impl Future<Output = Result<Resolution, FetchError>> + Send + 'static> {
    self
      .inner
      .slots()
      .peek(&key.cache_hash())
      .and_then(|slot| slot.in_flight.clone())
  }

  /// Mark one entry stale. Returns whether the key was cached.
  pub fn invalidate(&self, key: &RequestKey) -> bool {
    let found = match self.inner.slots().peek_mut(&key.cache_hash()) {
      Some(slot) => {
        slot.entry.invalidated = true;
        true
      }
      None => false,
    };
    if found {
      debug!(key = %key, "entry invalidated");
      self.inner.notify();
    }
    found
  }

  /// Mark every entry of a collection path stale, whatever its parameters
  /// (all pages, all filters). Returns the number of entries marked.
  pub fn invalidate_collection(&self, path: &str) -> usize {
    let path = RequestKey::new(path);
    let count = {
      let mut slots = self.inner.slots();
      let mut count = 0;
      for (_, slot) in slots.iter_mut() {
        if slot.entry.key.path() == path.path() {
          slot.entry.invalidated = true;
          count += 1;
        }
      }
      count
    };
    if count > 0 {
      info!(path = path.path(), count, "collection invalidated");
      self.inner.notify();
    }
    count
  }

  /// Forget every entry. In-flight requests finish but no longer settle,
  /// and their payloads are never written to the store.
  pub fn clear(&self) {
    self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    self.inner.slots().clear();
    self.inner.notify();
  }

  fn needs_fetch(&self, entry: &CacheEntry) -> bool {
    match &entry.status {
      CacheStatus::Pending { .. } => false,
      CacheStatus::Error(_) => true,
      CacheStatus::Resolved(_) => {
        entry.invalidated || entry.is_stale(self.inner.settings.stale_time)
      }
    }
  }

  /// Issue a new generation for `key` and store its pending entry.
  fn start<T: Entity>(
    &self,
    slots: &mut LruCache<String, Slot>,
    hash: String,
    key: &RequestKey,
    shape: &Shape,
  ) -> (CacheEntry, SharedFetch) {
    let generation = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
    let epoch = self.inner.epoch.load(Ordering::SeqCst);
    let previous = slots
      .peek(&hash)
      .and_then(|slot| slot.entry.status.resolution().cloned());

    // Issued here, under the slot lock, so requests reach the transport in
    // generation order.
    let request = Request::get(key.clone()).with_credentials(self.inner.settings.credentials.clone());
    let response = self.inner.transport.request(request);
    let shared = run::<T>(
      Arc::clone(&self.inner),
      key.clone(),
      response,
      shape.clone(),
      hash.clone(),
      generation,
      epoch,
    )
    .boxed()
    .shared();
    tokio::spawn(shared.clone());

    let entry = CacheEntry {
      key: key.clone(),
      status: CacheStatus::Pending { previous },
      generation,
      timestamp: Utc::now(),
      invalidated: false,
    };
    if !slots.contains(&hash) {
      make_room(slots);
    }
    slots.put(
      hash,
      Slot {
        entry: entry.clone(),
        in_flight: Some(shared.clone()),
      },
    );
    debug!(key = %key, generation, "request issued");

    (entry, shared)
  }
}

impl Clone for FetchCache {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl fmt::Debug for FetchCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FetchCache")
      .field("entries", &self.len())
      .field("settings", &self.inner.settings)
      .finish_non_exhaustive()
  }
}

/// Evict the least recently used entry that has no request in flight.
///
/// If every entry is in flight the cache grows by one instead, so a shared
/// request is never orphaned.
fn make_room(slots: &mut LruCache<String, Slot>) {
  if slots.len() < slots.cap().get() {
    return;
  }
  let victim = slots
    .iter()
    .rev()
    .find(|(_, slot)| slot.in_flight.is_none())
    .map(|(hash, _)| hash.clone());
  match victim {
    Some(hash) => {
      slots.pop(&hash);
    }
    None => {
      let grown = slots.cap().saturating_add(1);
      debug!(capacity = grown.get(), "all entries in flight, growing cache");
      slots.resize(grown);
    }
  }
}

async fn run<T: Entity>(
  inner: Arc<Inner>,
  key: RequestKey,
  response: BoxFuture<'static, Result<Value, FetchError>>,
  shape: Shape,
  hash: String,
  generation: u64,
  epoch: u64,
) -> Result<Resolution, FetchError> {
  let outcome = match response.await {
    Ok(body) => absorb::<T>(&inner, epoch, body, &shape),
    Err(err) => Err(err),
  };

  match &outcome {
    Ok(resolution) => debug!(key = %key, generation, items = resolution.ids.len(), "request resolved"),
    Err(FetchError::Cleared) => debug!(key = %key, generation, "cache cleared, result dropped"),
    Err(err) => warn!(key = %key, generation, error = %err, "request failed"),
  }
  inner.settle(&hash, generation, &outcome);
  outcome
}

/// Decode a body and upsert its payloads in one mutation scope.
///
/// The epoch is checked inside the scope: a store clear runs in its own scope,
/// so a request from before `clear` either commits first and is wiped, or
/// sees the new epoch and writes nothing.
fn absorb<T: Entity>(inner: &Inner, epoch: u64, body: Value, shape: &Shape) -> Result<Resolution, FetchError> {
  let Decoded { payloads, meta } = decode(body, shape)?;
  let store = &inner.store;
  let records = store.with_mutation(|m| {
    if inner.epoch.load(Ordering::SeqCst) != epoch {
      return Err(FetchError::Cleared);
    }
    Ok(m.upsert_many(T::map(&store.domain), payloads)?)
  })??;
  let ids = records
    .iter()
    .map(|record| record.read().id().to_string())
    .collect();
  Ok(Resolution { ids, meta })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::Mesh;
  use crate::transport::fake::FakeTransport;
  use serde_json::json;

  fn cache_with(transport: Arc<FakeTransport>) -> FetchCache {
    FetchCache::new(Arc::new(Store::new()), transport, CacheSettings::default())
  }

  fn meshes() -> RequestKey {
    RequestKey::new("/meshes")
  }

  #[tokio::test]
  async fn test_concurrent_callers_share_one_request() {
    let transport = FakeTransport::new();
    let gate = transport.gated("/meshes", json!([{"id": "m1"}, {"id": "m2"}]));
    let cache = cache_with(transport.clone());

    let waiters: Vec<_> = (0..5)
      .map(|_| cache.fetch::<Mesh>(&meshes(), &Shape::List))
      .collect();
    assert!(cache.peek(&meshes()).unwrap().status.is_pending());

    gate.send(()).unwrap();
    let results = futures::future::join_all(waiters).await;

    assert_eq!(transport.calls(), 1);
    for result in results {
      assert_eq!(result.unwrap().ids, vec!["m1".to_string(), "m2".to_string()]);
    }
    assert_eq!(cache.store().domain.meshes.len(), 2);
  }

  #[tokio::test]
  async fn test_concurrent_failure_reaches_every_caller() {
    let transport = FakeTransport::new();
    let err = FetchError::Http {
      status: 503,
      message: "maintenance".into(),
    };
    transport.fail("/meshes", err.clone());
    let cache = cache_with(transport.clone());

    let a = cache.fetch::<Mesh>(&meshes(), &Shape::List);
    let b = cache.fetch::<Mesh>(&meshes(), &Shape::List);
    let (a, b) = futures::join!(a, b);

    assert_eq!(transport.calls(), 1);
    assert_eq!(a.unwrap_err(), err);
    assert_eq!(b.unwrap_err(), err);
    assert_eq!(cache.peek(&meshes()).unwrap().status, CacheStatus::Error(err));
  }

  #[tokio::test]
  async fn test_fresh_entry_is_served_from_cache() {
    let transport = FakeTransport::new();
    transport.reply("/meshes", json!([{"id": "m1"}]));
    let cache = cache_with(transport.clone());

    cache.fetch::<Mesh>(&meshes(), &Shape::List).await.unwrap();
    let again = cache.fetch::<Mesh>(&meshes(), &Shape::List).await.unwrap();
    let entry = cache.ensure::<Mesh>(&meshes(), &Shape::List);

    assert_eq!(transport.calls(), 1);
    assert_eq!(again.ids, vec!["m1".to_string()]);
    assert!(matches!(entry.status, CacheStatus::Resolved(_)));
  }

  #[tokio::test]
  async fn test_stale_entry_is_refetched() {
    let transport = FakeTransport::new();
    transport.reply("/meshes", json!([{"id": "m1"}]));
    transport.reply("/meshes", json!([{"id": "m2"}]));
    let store = Arc::new(Store::new());
    let cache = FetchCache::new(
      store,
      transport.clone(),
      CacheSettings::default().with_stale_time(Duration::zero()),
    );

    cache.fetch::<Mesh>(&meshes(), &Shape::List).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = cache.fetch::<Mesh>(&meshes(), &Shape::List).await.unwrap();

    assert_eq!(transport.calls(), 2);
    assert_eq!(second.ids, vec!["m2".to_string()]);
  }

  #[tokio::test]
  async fn test_superseded_generation_is_discarded() {
    let transport = FakeTransport::new();
    let first_gate = transport.gated("/meshes", json!([{"id": "old"}]));
    let second_gate = transport.gated("/meshes", json!([{"id": "new"}]));
    let cache = cache_with(transport.clone());

    let first = cache.fetch::<Mesh>(&meshes(), &Shape::List);
    let second = cache.refetch::<Mesh>(&meshes(), &Shape::List);
    let second_generation = cache.peek(&meshes()).unwrap().generation;

    second_gate.send(()).unwrap();
    second.await.unwrap();
    first_gate.send(()).unwrap();
    let first = first.await.unwrap();

    // The late result still lands in the store, but not in the entry
    assert_eq!(first.ids, vec!["old".to_string()]);
    assert!(cache.store().get::<Mesh>("old").is_some());
    let entry = cache.peek(&meshes()).unwrap();
    assert_eq!(entry.generation, second_generation);
    assert_eq!(
      entry.status.resolution().unwrap().ids,
      vec!["new".to_string()]
    );
  }

  #[tokio::test]
  async fn test_errors_are_not_retried_automatically() {
    let transport = FakeTransport::new();
    transport.fail(
      "/meshes",
      FetchError::Network {
        status: 0,
        message: "unreachable".into(),
      },
    );
    let cache = cache_with(transport.clone());

    assert!(cache.fetch::<Mesh>(&meshes(), &Shape::List).await.is_err());
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(cache.peek(&meshes()).unwrap().status.error().unwrap().status(), Some(0));
  }

  #[tokio::test]
  async fn test_malformed_payload_is_an_error_and_upserts_nothing() {
    let transport = FakeTransport::new();
    transport.reply("/meshes", json!([{"id": "m1"}, {"name": "no id"}]));
    let cache = cache_with(transport.clone());

    let err = cache.fetch::<Mesh>(&meshes(), &Shape::List).await.unwrap_err();

    assert!(matches!(err, FetchError::MalformedPayload(_)));
    assert!(cache.store().domain.meshes.is_empty());
  }

  #[tokio::test]
  async fn test_invalidate_collection_marks_every_page() {
    let transport = FakeTransport::new();
    transport.reply("/meshes?offset=0", json!([{"id": "m1"}]));
    transport.reply("/meshes?offset=20", json!([{"id": "m2"}]));
    transport.reply("/meshes?offset=0", json!([{"id": "m1"}, {"id": "m3"}]));
    let cache = cache_with(transport.clone());
    let first = meshes().param("offset", 0);
    let second = meshes().param("offset", 20);

    cache.fetch::<Mesh>(&first, &Shape::List).await.unwrap();
    cache.fetch::<Mesh>(&second, &Shape::List).await.unwrap();
    assert_eq!(cache.invalidate_collection("meshes/"), 2);
    assert!(cache.peek(&second).unwrap().invalidated);

    let refreshed = cache.fetch::<Mesh>(&first, &Shape::List).await.unwrap();
    assert_eq!(transport.calls(), 3);
    assert_eq!(refreshed.ids.len(), 2);
  }

  #[tokio::test]
  async fn test_lru_keeps_entries_in_flight() {
    let transport = FakeTransport::new();
    let gate = transport.gated("/meshes/a", json!({"id": "a"}));
    transport.reply("/meshes/b", json!({"id": "b"}));
    transport.reply("/meshes/c", json!({"id": "c"}));
    let cache = FetchCache::new(
      Arc::new(Store::new()),
      transport.clone(),
      CacheSettings::default().with_capacity(2),
    );

    let a = cache.fetch::<Mesh>(&RequestKey::new("/meshes/a"), &Shape::entity());
    cache
      .fetch::<Mesh>(&RequestKey::new("/meshes/b"), &Shape::entity())
      .await
      .unwrap();
    cache
      .fetch::<Mesh>(&RequestKey::new("/meshes/c"), &Shape::entity())
      .await
      .unwrap();

    assert!(cache.peek(&RequestKey::new("/meshes/a")).is_some());
    assert!(cache.peek(&RequestKey::new("/meshes/b")).is_none());

    gate.send(()).unwrap();
    a.await.unwrap();
    assert!(matches!(
      cache.peek(&RequestKey::new("/meshes/a")).unwrap().status,
      CacheStatus::Resolved(_)
    ));
  }
}
