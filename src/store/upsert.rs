//! Create-or-merge of raw payloads into entity records.
//!
//! A payload is a JSON object carrying an `id` and any subset of the entity's
//! fields. Merging overlays the payload onto the serialized record field by
//! field, so fields absent from the payload keep their current value.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::map::{EntityMap, Record};
use super::traits::{Entity, EntityId};
use super::Mutation;
use crate::error::StoreError;

/// Raw field map of one entity as received from the API.
pub type Payload = serde_json::Map<String, Value>;

/// Create-or-merge one payload into `map`, building new records with `ctor`.
///
/// This is the entry point for manual and action-driven writes; fetches go
/// through [`Mutation::upsert_many`].
pub fn update_one_entry<T, F>(
  mutation: &mut Mutation,
  map: &EntityMap<T>,
  ctor: F,
  payload: Payload,
) -> Result<Record<T>, StoreError>
where
  T: Entity,
  F: FnMut(&Payload) -> Result<T, StoreError>,
{
  mutation
    .upsert_with(map, ctor, vec![payload])?
    .pop()
    .ok_or_else(|| StoreError::MalformedPayload("upsert produced no record".to_string()))
}

/// Extract the id of a payload. Numeric ids become their decimal string.
pub fn payload_id(payload: &Payload) -> Result<EntityId, StoreError> {
  match payload.get("id") {
    Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
    Some(Value::Number(n)) => Ok(n.to_string()),
    Some(other) => Err(StoreError::MalformedPayload(format!(
      "unusable id: {}",
      other
    ))),
    None => Err(StoreError::MalformedPayload("payload has no id".to_string())),
  }
}

/// Copy of `payload` whose `id` is the normalized string id.
pub(crate) fn normalize(payload: &Payload) -> Result<(EntityId, Payload), StoreError> {
  let id = payload_id(payload)?;
  let mut normalized = payload.clone();
  normalized.insert("id".to_string(), Value::String(id.clone()));
  Ok((id, normalized))
}

/// Build a record straight from a payload.
pub fn create_from_payload<T: DeserializeOwned>(payload: &Payload) -> Result<T, StoreError> {
  serde_json::from_value(Value::Object(payload.clone()))
    .map_err(|e| StoreError::MalformedPayload(e.to_string()))
}

/// Overlay `payload` onto `current`.
///
/// Returns `None` when the payload changes nothing, so callers can skip the
/// write and leave observers alone.
pub fn merge_payload<T>(current: &T, payload: &Payload) -> Result<Option<T>, StoreError>
where
  T: Serialize + DeserializeOwned + PartialEq,
{
  let mut value =
    serde_json::to_value(current).map_err(|e| StoreError::MalformedPayload(e.to_string()))?;
  let fields = value.as_object_mut().ok_or_else(|| {
    StoreError::MalformedPayload("record does not serialize to an object".to_string())
  })?;

  let mut touched = false;
  for (name, incoming) in payload {
    if fields.get(name) != Some(incoming) {
      fields.insert(name.clone(), incoming.clone());
      touched = true;
    }
  }
  if !touched {
    return Ok(None);
  }

  let merged: T =
    serde_json::from_value(value).map_err(|e| StoreError::MalformedPayload(e.to_string()))?;
  if &merged == current {
    Ok(None)
  } else {
    Ok(Some(merged))
  }
}
