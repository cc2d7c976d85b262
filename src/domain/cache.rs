//! Store wiring and request keys for dashboard types.

use crate::cache::{RequestKey, Shape};
use crate::store::{Entity, EntityMap};

use super::types::{Mesh, MeshAvailableUpdates, Package, Subscription, User};
use super::Domain;

// ============================================================================
// Entity implementations
// ============================================================================

impl Entity for User {
  const KIND: &'static str = "user";

  fn id(&self) -> &str {
    &self.id
  }

  fn map(domain: &Domain) -> &EntityMap<Self> {
    &domain.users
  }
}

impl Entity for Package {
  const KIND: &'static str = "package";

  fn id(&self) -> &str {
    &self.id
  }

  fn map(domain: &Domain) -> &EntityMap<Self> {
    &domain.packages
  }
}

impl Entity for Subscription {
  const KIND: &'static str = "subscription";

  fn id(&self) -> &str {
    &self.id
  }

  fn map(domain: &Domain) -> &EntityMap<Self> {
    &domain.subscriptions
  }
}

impl Entity for Mesh {
  const KIND: &'static str = "mesh";

  fn id(&self) -> &str {
    &self.id
  }

  fn map(domain: &Domain) -> &EntityMap<Self> {
    &domain.meshes
  }
}

impl Entity for MeshAvailableUpdates {
  const KIND: &'static str = "mesh_available_updates";

  fn id(&self) -> &str {
    &self.id
  }

  fn map(domain: &Domain) -> &EntityMap<Self> {
    &domain.mesh_available_updates
  }
}

// ============================================================================
// Request keys
// ============================================================================

/// Typed request keys for dashboard endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiKey {
  /// Users of a partner
  Users { partner_id: String },
  /// A single user
  User { id: String },
  /// Package catalog, optionally searched
  Packages { search: Option<String> },
  /// Packages installed on a mesh
  MeshPackages { mesh_id: String },
  /// Subscriptions of a partner
  Subscriptions { partner_id: String },
  /// Meshes of a partner
  Meshes { partner_id: String },
  /// A single mesh
  Mesh { id: String },
  /// Pending package updates of a mesh
  MeshAvailableUpdates { mesh_id: String },
}

impl ApiKey {
  /// Canonical request key for the endpoint.
  pub fn request_key(&self) -> RequestKey {
    match self {
      Self::Users { partner_id } => RequestKey::new(format!("/partners/{}/users", partner_id)),
      Self::User { id } => RequestKey::new(format!("/users/{}", id)),
      Self::Packages { search } => RequestKey::new("/packages").opt_param("search", search.as_deref()),
      Self::MeshPackages { mesh_id } => RequestKey::new(mesh_packages_path(mesh_id)),
      Self::Subscriptions { partner_id } => {
        RequestKey::new(format!("/partners/{}/subscriptions", partner_id))
      }
      Self::Meshes { partner_id } => RequestKey::new(format!("/partners/{}/meshes", partner_id)),
      Self::Mesh { id } => RequestKey::new(format!("/meshes/{}", id)),
      Self::MeshAvailableUpdates { mesh_id } => {
        RequestKey::new(format!("/meshes/{}/available-updates", mesh_id))
      }
    }
  }

  /// Whether the key cannot be requested yet because a required id is blank.
  pub fn is_invalid(&self) -> bool {
    match self {
      Self::Users { partner_id } | Self::Subscriptions { partner_id } | Self::Meshes { partner_id } => {
        is_blank(partner_id)
      }
      Self::User { id } | Self::Mesh { id } => is_blank(id),
      Self::MeshPackages { mesh_id } | Self::MeshAvailableUpdates { mesh_id } => is_blank(mesh_id),
      Self::Packages { .. } => false,
    }
  }

  /// Expected response shape.
  pub fn shape(&self) -> Shape {
    match self {
      Self::User { .. } | Self::Mesh { .. } => Shape::entity(),
      // The response omits the id; the record is keyed by mesh
      Self::MeshAvailableUpdates { mesh_id } => Shape::entity_with_id(mesh_id.as_str()),
      _ => Shape::List,
    }
  }

  /// Human-readable description for logs and debugging
  pub fn description(&self) -> String {
    match self {
      Self::Users { partner_id } => format!("users of partner {}", partner_id),
      Self::User { id } => format!("user {}", id),
      Self::Packages { search } => {
        if let Some(s) = search {
          format!("packages matching {}", s)
        } else {
          "all packages".to_string()
        }
      }
      Self::MeshPackages { mesh_id } => format!("packages of mesh {}", mesh_id),
      Self::Subscriptions { partner_id } => format!("subscriptions of partner {}", partner_id),
      Self::Meshes { partner_id } => format!("meshes of partner {}", partner_id),
      Self::Mesh { id } => format!("mesh {}", id),
      Self::MeshAvailableUpdates { mesh_id } => format!("available updates of mesh {}", mesh_id),
    }
  }
}

/// Collection path of the packages installed on a mesh.
pub(crate) fn mesh_packages_path(mesh_id: &str) -> String {
  format!("/meshes/{}/packages", mesh_id)
}

fn is_blank(value: &str) -> bool {
  value.trim().is_empty()
}
