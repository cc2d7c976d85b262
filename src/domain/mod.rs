//! Dashboard entity kinds and the endpoints that return them.

mod cache;
mod types;

pub use cache::ApiKey;
pub(crate) use cache::mesh_packages_path;
pub use types::*;

use crate::error::StoreError;
use crate::store::{EntityMap, Mutation};

/// One map per entity kind, owned by a [`Store`](crate::store::Store).
#[derive(Debug)]
pub struct Domain {
  pub users: EntityMap<User>,
  pub packages: EntityMap<Package>,
  pub subscriptions: EntityMap<Subscription>,
  pub meshes: EntityMap<Mesh>,
  pub mesh_available_updates: EntityMap<MeshAvailableUpdates>,
}

impl Domain {
  pub(crate) fn new(store_id: u64) -> Self {
    Self {
      users: EntityMap::new(store_id),
      packages: EntityMap::new(store_id),
      subscriptions: EntityMap::new(store_id),
      meshes: EntityMap::new(store_id),
      mesh_available_updates: EntityMap::new(store_id),
    }
  }

  /// Drop the records of every kind. Returns the number removed.
  pub(crate) fn clear(&self, m: &mut Mutation) -> Result<usize, StoreError> {
    Ok(
      m.clear(&self.users)?
        + m.clear(&self.packages)?
        + m.clear(&self.subscriptions)?
        + m.clear(&self.meshes)?
        + m.clear(&self.mesh_available_updates)?,
    )
  }
}
