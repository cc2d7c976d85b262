//! Mutating actions and the cache invalidation they imply.
//!
//! Every action that changes server state either overwrites the affected
//! records directly or invalidates the affected cache entries, so no reader
//! sees pre-mutation data once the action has succeeded.

use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{decode, RequestKey, Shape};
use crate::domain::{mesh_packages_path, ApiKey, MeshAvailableUpdates};
use crate::error::{FetchError, StoreError};
use crate::session::Session;
use crate::store::upsert::payload_id;
use crate::store::{update_one_entry, Entity, Payload, Record, Store};
use crate::transport::{Method, Request};

/// Empty the pending updates of a mesh in one mutation scope.
///
/// The record is created when the mesh has none yet. Readers holding the
/// record see `updates: []` as soon as this returns.
pub fn flush_available_updates(
  store: &Store,
  mesh_id: &str,
) -> Result<Record<MeshAvailableUpdates>, StoreError> {
  let mut payload = Payload::new();
  payload.insert("id".to_string(), Value::String(mesh_id.to_string()));
  payload.insert("updates".to_string(), Value::Array(Vec::new()));

  store.with_mutation(|m| {
    update_one_entry(
      m,
      &store.domain.mesh_available_updates,
      |payload| {
        Ok(MeshAvailableUpdates {
          id: payload_id(payload)?,
          updates: Vec::new(),
        })
      },
      payload,
    )
  })?
}

/// Apply every pending update of a mesh.
///
/// On success the mesh's update list is flushed and its package list and
/// detail are invalidated.
pub async fn apply_available_updates(
  session: &Session,
  mesh_id: &str,
) -> Result<Record<MeshAvailableUpdates>, FetchError> {
  if mesh_id.trim().is_empty() {
    return Err(FetchError::Misuse("cannot apply updates without a mesh id".to_string()));
  }

  let key = RequestKey::new(format!("/meshes/{}/available-updates/apply", mesh_id));
  session
    .cache()
    .transport()
    .request(session.request(Method::Post, key))
    .await?;

  let record = flush_available_updates(session.store(), mesh_id)?;
  let cache = session.cache();
  let packages = cache.invalidate_collection(&mesh_packages_path(mesh_id));
  cache.invalidate(&ApiKey::Mesh { id: mesh_id.to_string() }.request_key());
  info!(mesh_id, packages, "available updates applied");

  Ok(record)
}

/// Perform a write and upsert the entity it returns.
///
/// Each path in `invalidates` is invalidated as a collection as soon as the
/// write succeeded, before the body is decoded. An empty body or an
/// acknowledgement without an `id` yields `None`.
pub async fn mutate<T: Entity>(
  session: &Session,
  request: Request,
  invalidates: &[&str],
) -> Result<Option<Record<T>>, FetchError> {
  let key = request.key.clone();
  let body = session.cache().transport().request(request).await?;

  let mut invalidated = 0;
  for path in invalidates {
    invalidated += session.cache().invalidate_collection(path);
  }

  let record = match body {
    Value::Null => None,
    Value::Object(ack) if !ack.contains_key("id") => None,
    body => {
      let decoded = decode(body, &Shape::entity())?;
      let store = session.store();
      let mut records = store.with_mutation(|m| m.upsert_many(T::map(&store.domain), decoded.payloads))??;
      records.pop()
    }
  };
  debug!(key = %key, kind = T::KIND, invalidated, "mutation applied");

  Ok(record)
}
