use serde::{Deserialize, Serialize};

/// Dashboard user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
  pub id: String,
  pub email: String,
  pub name: Option<String>,
  pub partner_id: Option<String>,
  pub role: Option<String>,
}

/// Installable package
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Package {
  pub id: String,
  pub name: String,
  pub version: String,
  pub description: Option<String>,
}

/// A partner's subscription to a package
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Subscription {
  pub id: String,
  pub partner_id: String,
  pub package_id: String,
  pub status: String, // "active", "paused" or "cancelled"
  pub created_at: Option<String>,
}

/// Mesh summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mesh {
  pub id: String,
  pub name: String,
  pub partner_id: Option<String>,
  pub node_count: u32,
}

/// One package upgrade a mesh could take
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AvailableUpdate {
  pub package_id: String,
  pub current_version: Option<String>,
  pub available_version: Option<String>,
}

/// Pending package updates of a mesh, keyed by mesh id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshAvailableUpdates {
  pub id: String,
  pub updates: Vec<AvailableUpdate>,
}
