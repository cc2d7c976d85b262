//! Core traits for normalized entities.

use serde::{de::DeserializeOwned, Serialize};

use super::map::EntityMap;
use super::upsert::{self, Payload};
use crate::domain::Domain;
use crate::error::StoreError;

/// Opaque identifier, unique within one entity kind.
pub type EntityId = String;

/// Trait for entities held by the normalized store.
///
/// Implementors provide a unique id, a kind name and the map of the
/// [`Domain`] that owns them. Records round-trip through JSON objects so a
/// partial payload can be overlaid field by field.
pub trait Entity:
  Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + std::fmt::Debug + 'static
{
  /// Entity kind name for logs and map organization (e.g., "user", "mesh")
  const KIND: &'static str;

  /// Unique identifier for this entity
  fn id(&self) -> &str;

  /// The map of `domain` holding this kind.
  fn map(domain: &Domain) -> &EntityMap<Self>;

  /// Factory used when no record exists yet for a payload's id.
  fn create(payload: &Payload) -> Result<Self, StoreError> {
    upsert::create_from_payload(payload)
  }
}
