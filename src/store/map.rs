//! Per-kind entity maps and the shared record handles they hand out.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use tokio::sync::watch;

use super::traits::EntityId;

/// Shared handle to the single live record of one entity.
///
/// Every fetch or action touching the same id writes into the same
/// allocation, so a handle taken earlier always reads the latest state.
pub struct Record<T> {
  inner: Arc<RwLock<T>>,
}

impl<T> Record<T> {
  pub(crate) fn new(value: T) -> Self {
    Self {
      inner: Arc::new(RwLock::new(value)),
    }
  }

  /// Borrow the current value.
  pub fn read(&self) -> RwLockReadGuard<'_, T> {
    self.inner.read().unwrap_or_else(PoisonError::into_inner)
  }

  /// Whether both handles point at the same live record.
  pub fn ptr_eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Overwrite the value in place. Only mutation scopes call this.
  pub(super) fn replace(&self, value: T) {
    *self.inner.write().unwrap_or_else(PoisonError::into_inner) = value;
  }
}

impl<T: Clone> Record<T> {
  /// Clone the current value out of the record.
  pub fn snapshot(&self) -> T {
    self.read().clone()
  }
}

impl<T> Clone for Record<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: fmt::Debug> fmt::Debug for Record<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Record").field(&*self.read()).finish()
  }
}

/// Version counter observers of one map wait on.
#[derive(Clone)]
pub(crate) struct Notifier {
  tx: Arc<watch::Sender<u64>>,
}

impl Notifier {
  fn new() -> Self {
    let (tx, _rx) = watch::channel(0);
    Self { tx: Arc::new(tx) }
  }

  pub(crate) fn bump(&self) {
    self.tx.send_modify(|version| *version += 1);
  }

  pub(crate) fn same(&self, other: &Notifier) -> bool {
    Arc::ptr_eq(&self.tx, &other.tx)
  }

  fn subscribe(&self) -> watch::Receiver<u64> {
    self.tx.subscribe()
  }

  fn version(&self) -> u64 {
    *self.tx.borrow()
  }
}

/// All records of one entity kind, keyed by id.
///
/// Reads are open to everyone; writes only go through a
/// [`Mutation`](super::Mutation) of the owning store.
pub struct EntityMap<T> {
  store_id: u64,
  records: RwLock<HashMap<EntityId, Record<T>>>,
  notifier: Notifier,
}

impl<T> EntityMap<T> {
  pub(crate) fn new(store_id: u64) -> Self {
    Self {
      store_id,
      records: RwLock::new(HashMap::new()),
      notifier: Notifier::new(),
    }
  }

  /// Get the live record for an id.
  pub fn get(&self, id: &str) -> Option<Record<T>> {
    self.read_records().get(id).cloned()
  }

  pub fn contains(&self, id: &str) -> bool {
    self.read_records().contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.read_records().len()
  }

  pub fn is_empty(&self) -> bool {
    self.read_records().is_empty()
  }

  /// All ids, sorted for stable output.
  pub fn ids(&self) -> Vec<EntityId> {
    let mut ids: Vec<EntityId> = self.read_records().keys().cloned().collect();
    ids.sort();
    ids
  }

  /// All live records, ordered by id.
  pub fn records(&self) -> Vec<Record<T>> {
    let records = self.read_records();
    let mut entries: Vec<(&EntityId, &Record<T>)> = records.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, record)| record.clone()).collect()
  }

  /// Number of committed mutation scopes that changed this map.
  pub fn version(&self) -> u64 {
    self.notifier.version()
  }

  /// Subscribe to change notifications for this map.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.notifier.subscribe()
  }

  pub(crate) fn store_id(&self) -> u64 {
    self.store_id
  }

  pub(crate) fn notifier(&self) -> &Notifier {
    &self.notifier
  }

  pub(crate) fn insert(&self, id: EntityId, record: Record<T>) {
    self
      .records
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, record);
  }

  pub(crate) fn clear(&self) -> usize {
    let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
    let count = records.len();
    records.clear();
    count
  }

  fn read_records(&self) -> RwLockReadGuard<'_, HashMap<EntityId, Record<T>>> {
    self.records.read().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<T: fmt::Debug> fmt::Debug for EntityMap<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EntityMap")
      .field("store_id", &self.store_id)
      .field("len", &self.read_records().len())
      .field("version", &self.notifier.version())
      .finish()
  }
}
