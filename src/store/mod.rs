//! Normalized, observable entity store.
//!
//! This module provides the single source of truth for fetched data:
//! - One live [`Record`] per `(kind, id)`, shared by every reader
//! - Writes only inside [`Store::with_mutation`], one scope committing at a time
//! - Per-kind change notification, deferred until the scope ends

mod map;
mod traits;
pub mod upsert;

pub use map::{EntityMap, Record};
pub use traits::{Entity, EntityId};
pub use upsert::{update_one_entry, Payload};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::domain::Domain;
use crate::error::StoreError;
use map::Notifier;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Entity store for one session.
pub struct Store {
  id: u64,
  /// Per-kind entity maps
  pub domain: Domain,
  commit: Mutex<()>,
  owner: Mutex<Option<ThreadId>>,
}

impl Store {
  pub fn new() -> Self {
    let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
    Self {
      id,
      domain: Domain::new(id),
      commit: Mutex::new(()),
      owner: Mutex::new(None),
    }
  }

  /// Get the live record of kind `T` for an id.
  pub fn get<T: Entity>(&self, id: &str) -> Option<Record<T>> {
    T::map(&self.domain).get(id)
  }

  /// Run `f` as one mutation scope.
  ///
  /// Scopes commit one at a time. Observers of every map written during the
  /// scope are notified once, after `f` returns. Opening a scope from inside
  /// another one is a programming error.
  pub fn with_mutation<R>(&self, f: impl FnOnce(&mut Mutation) -> R) -> Result<R, StoreError> {
    let current = thread::current().id();
    let reentrant = *self.owner.lock().unwrap_or_else(PoisonError::into_inner) == Some(current);
    debug_assert!(!reentrant, "mutation scope opened inside another mutation scope");
    if reentrant {
      return Err(StoreError::Misuse(
        "mutation scope opened inside another mutation scope".to_string(),
      ));
    }

    let mut mutation = Mutation::new(self.id);
    let output = {
      let _commit = self.commit.lock().unwrap_or_else(PoisonError::into_inner);
      let _owner = OwnerGuard::enter(&self.owner, current);
      f(&mut mutation)
    };
    mutation.commit();
    Ok(output)
  }

  /// Drop every record of every kind. Used on session teardown.
  pub fn clear(&self) -> Result<usize, StoreError> {
    self.with_mutation(|m| self.domain.clear(m))?
  }
}

impl Default for Store {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for Store {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Store")
      .field("id", &self.id)
      .field("domain", &self.domain)
      .finish()
  }
}

/// Marks the thread running a scope; cleared even if the scope panics.
struct OwnerGuard<'a> {
  owner: &'a Mutex<Option<ThreadId>>,
}

impl<'a> OwnerGuard<'a> {
  fn enter(owner: &'a Mutex<Option<ThreadId>>, thread: ThreadId) -> Self {
    *owner.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread);
    Self { owner }
  }
}

impl Drop for OwnerGuard<'_> {
  fn drop(&mut self) {
    *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = None;
  }
}

/// Write access to a store for the duration of one scope.
pub struct Mutation {
  store_id: u64,
  dirty: Vec<Notifier>,
  writes: usize,
}

impl Mutation {
  fn new(store_id: u64) -> Self {
    Self {
      store_id,
      dirty: Vec::new(),
      writes: 0,
    }
  }

  /// Create-or-merge one payload using the kind's default factory.
  pub fn upsert<T: Entity>(
    &mut self,
    map: &EntityMap<T>,
    payload: Payload,
  ) -> Result<Record<T>, StoreError> {
    update_one_entry(self, map, T::create, payload)
  }

  /// Create-or-merge a batch of payloads, returning records in payload order.
  ///
  /// Every payload is validated before any is applied.
  pub fn upsert_many<T: Entity>(
    &mut self,
    map: &EntityMap<T>,
    payloads: Vec<Payload>,
  ) -> Result<Vec<Record<T>>, StoreError> {
    self.upsert_with(map, T::create, payloads)
  }

  pub(crate) fn upsert_with<T, F>(
    &mut self,
    map: &EntityMap<T>,
    mut ctor: F,
    payloads: Vec<Payload>,
  ) -> Result<Vec<Record<T>>, StoreError>
  where
    T: Entity,
    F: FnMut(&Payload) -> Result<T, StoreError>,
  {
    self.check(map)?;

    let mut order: Vec<EntityId> = Vec::with_capacity(payloads.len());
    let mut staged: HashMap<EntityId, T> = HashMap::new();
    for raw in &payloads {
      let (id, payload) = upsert::normalize(raw)?;
      let base = match staged.get(&id) {
        Some(value) => Some(value.clone()),
        None => map.get(&id).map(|record| record.snapshot()),
      };
      let next = match base {
        Some(current) => upsert::merge_payload(&current, &payload)?.unwrap_or(current),
        None => ctor(&payload)?,
      };
      if next.id() != id {
        return Err(StoreError::MalformedPayload(format!(
          "{} payload for {} produced record {}",
          T::KIND,
          id,
          next.id()
        )));
      }
      staged.insert(id.clone(), next);
      order.push(id);
    }

    let mut records: HashMap<EntityId, Record<T>> = HashMap::with_capacity(staged.len());
    for (id, value) in staged {
      let record = self.write(map, &id, value);
      records.insert(id, record);
    }
    Ok(order.iter().filter_map(|id| records.get(id).cloned()).collect())
  }

  /// Edit an existing record in place. Returns `None` when the id is unknown.
  pub fn update<T: Entity>(
    &mut self,
    map: &EntityMap<T>,
    id: &str,
    edit: impl FnOnce(&mut T),
  ) -> Result<Option<Record<T>>, StoreError> {
    self.check(map)?;
    let Some(record) = map.get(id) else {
      return Ok(None);
    };

    let mut next = record.snapshot();
    edit(&mut next);
    if next.id() != id {
      return Err(StoreError::Misuse(format!(
        "edit of {} {} changed its id to {}",
        T::KIND,
        id,
        next.id()
      )));
    }
    Ok(Some(self.write(map, id, next)))
  }

  /// Remove every record of one kind.
  pub(crate) fn clear<T: Entity>(&mut self, map: &EntityMap<T>) -> Result<usize, StoreError> {
    self.check(map)?;
    let removed = map.clear();
    if removed > 0 {
      self.mark(map.notifier());
    }
    Ok(removed)
  }

  /// Number of records actually changed so far in this scope.
  pub fn writes(&self) -> usize {
    self.writes
  }

  fn write<T: Entity>(&mut self, map: &EntityMap<T>, id: &str, value: T) -> Record<T> {
    match map.get(id) {
      Some(record) => {
        let changed = *record.read() != value;
        if changed {
          record.replace(value);
          self.mark(map.notifier());
        }
        record
      }
      None => {
        let record = Record::new(value);
        map.insert(id.to_string(), record.clone());
        self.mark(map.notifier());
        record
      }
    }
  }

  fn check<T: Entity>(&self, map: &EntityMap<T>) -> Result<(), StoreError> {
    let foreign = map.store_id() != self.store_id;
    debug_assert!(!foreign, "mutation scope used on a map of another store");
    if foreign {
      return Err(StoreError::Misuse(format!(
        "{} map belongs to another store",
        T::KIND
      )));
    }
    Ok(())
  }

  fn mark(&mut self, notifier: &Notifier) {
    self.writes += 1;
    if !self.dirty.iter().any(|n| n.same(notifier)) {
      self.dirty.push(notifier.clone());
    }
  }

  fn commit(self) {
    if self.writes > 0 {
      debug!(writes = self.writes, maps = self.dirty.len(), "committing mutation");
    }
    for notifier in &self.dirty {
      notifier.bump();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{Mesh, MeshAvailableUpdates};
  use serde_json::{json, Value};

  fn payload(value: Value) -> Payload {
    match value {
      Value::Object(map) => map,
      other => panic!("not an object: {other}"),
    }
  }

  #[test]
  fn test_upsert_creates_then_merges_in_place() {
    let store = Store::new();
    let meshes = &store.domain.meshes;

    let first = store
      .with_mutation(|m| m.upsert(meshes, payload(json!({"id": "a", "name": "edge"}))))
      .unwrap()
      .unwrap();
    let second = store
      .with_mutation(|m| m.upsert(meshes, payload(json!({"id": "a", "nodeCount": 2}))))
      .unwrap()
      .unwrap();

    assert!(first.ptr_eq(&second));
    let mesh = first.read();
    assert_eq!(mesh.name, "edge");
    assert_eq!(mesh.node_count, 2);
    assert_eq!(meshes.len(), 1);
  }

  #[test]
  fn test_identical_upsert_does_not_notify() {
    let store = Store::new();
    let meshes = &store.domain.meshes;
    let data = json!({"id": "a", "name": "edge", "nodeCount": 3});

    let first = store
      .with_mutation(|m| m.upsert(meshes, payload(data.clone())))
      .unwrap()
      .unwrap();
    let version = meshes.version();

    let writes = store
      .with_mutation(|m| {
        m.upsert(meshes, payload(data.clone())).unwrap();
        m.writes()
      })
      .unwrap();

    assert_eq!(writes, 0);
    assert_eq!(meshes.version(), version);
    assert!(store.get::<Mesh>("a").unwrap().ptr_eq(&first));
  }

  #[test]
  fn test_notification_deferred_to_end_of_scope() {
    let store = Store::new();
    let meshes = &store.domain.meshes;

    store
      .with_mutation(|m| {
        m.upsert(meshes, payload(json!({"id": "a"}))).unwrap();
        m.upsert(meshes, payload(json!({"id": "b"}))).unwrap();
        assert_eq!(meshes.version(), 0);
      })
      .unwrap();

    assert_eq!(meshes.version(), 1);
  }

  #[test]
  fn test_upsert_many_rejects_batch_with_malformed_item() {
    let store = Store::new();
    let meshes = &store.domain.meshes;

    let result = store
      .with_mutation(|m| {
        m.upsert_many(
          meshes,
          vec![
            payload(json!({"id": "a", "name": "ok"})),
            payload(json!({"name": "no id"})),
          ],
        )
      })
      .unwrap();

    assert!(matches!(result, Err(StoreError::MalformedPayload(_))));
    assert!(meshes.is_empty());
  }

  #[test]
  fn test_upsert_many_merges_duplicate_ids_into_one_record() {
    let store = Store::new();
    let meshes = &store.domain.meshes;

    let records = store
      .with_mutation(|m| {
        m.upsert_many(
          meshes,
          vec![
            payload(json!({"id": 7, "name": "edge"})),
            payload(json!({"id": "7", "nodeCount": 4})),
          ],
        )
      })
      .unwrap()
      .unwrap();

    assert_eq!(records.len(), 2);
    assert!(records[0].ptr_eq(&records[1]));
    assert_eq!(records[0].read().name, "edge");
    assert_eq!(records[0].read().node_count, 4);
  }

  #[test]
  fn test_update_edits_existing_record() {
    let store = Store::new();
    let updates = &store.domain.mesh_available_updates;
    store
      .with_mutation(|m| {
        m.upsert(
          updates,
          payload(json!({"id": "m1", "updates": [{"packageId": "p1"}]})),
        )
      })
      .unwrap()
      .unwrap();

    let record = store
      .with_mutation(|m| m.update(updates, "m1", |r: &mut MeshAvailableUpdates| r.updates.clear()))
      .unwrap()
      .unwrap()
      .unwrap();
    assert!(record.read().updates.is_empty());

    let missing = store
      .with_mutation(|m| m.update(updates, "nope", |r: &mut MeshAvailableUpdates| r.updates.clear()))
      .unwrap()
      .unwrap();
    assert!(missing.is_none());
  }

  #[test]
  fn test_clear_drops_all_records() {
    let store = Store::new();
    store
      .with_mutation(|m| m.upsert(&store.domain.meshes, payload(json!({"id": "a"}))))
      .unwrap()
      .unwrap();

    assert_eq!(store.clear().unwrap(), 1);
    assert!(store.get::<Mesh>("a").is_none());
  }

  #[test]
  #[cfg(debug_assertions)]
  #[should_panic(expected = "mutation scope opened inside another mutation scope")]
  fn test_nested_scope_is_flagged() {
    let store = Store::new();
    let _ = store.with_mutation(|_| store.with_mutation(|_| ()));
  }

  #[test]
  #[cfg(debug_assertions)]
  #[should_panic(expected = "mutation scope used on a map of another store")]
  fn test_foreign_map_is_flagged() {
    let store = Store::new();
    let other = Store::new();
    let _ = store.with_mutation(|m| m.upsert(&other.domain.meshes, payload(json!({"id": "a"}))));
  }
}
