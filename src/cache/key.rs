//! Canonical request keys.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};
use url::form_urlencoded;

/// Endpoint path plus effective query parameters.
///
/// Parameters are kept sorted and empty values are dropped, so two logically
/// identical requests always produce the same canonical string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  path: String,
  params: BTreeMap<String, String>,
}

impl RequestKey {
  pub fn new(path: impl AsRef<str>) -> Self {
    Self {
      path: normalize_path(path.as_ref()),
      params: BTreeMap::new(),
    }
  }

  /// Builder form of [`RequestKey::set`].
  pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self.set(name, value);
    self
  }

  /// Set a parameter when a value is present.
  pub fn opt_param(self, name: impl Into<String>, value: Option<impl ToString>) -> Self {
    match value {
      Some(value) => self.param(name, value),
      None => self,
    }
  }

  /// Set (or, for a blank value, remove) a parameter.
  pub fn set(&mut self, name: impl Into<String>, value: impl ToString) {
    let name = name.into();
    let value = value.to_string();
    if value.trim().is_empty() {
      self.params.remove(&name);
    } else {
      self.params.insert(name, value);
    }
  }

  pub fn remove(&mut self, name: &str) -> Option<String> {
    self.params.remove(name)
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn params(&self) -> &BTreeMap<String, String> {
    &self.params
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.params.get(name).map(String::as_str)
  }

  /// URL-encoded query string, without the leading `?`.
  pub fn query(&self) -> String {
    form_urlencoded::Serializer::new(String::new())
      .extend_pairs(self.params.iter())
      .finish()
  }

  /// Canonical `path?query` form.
  pub fn canonical(&self) -> String {
    if self.params.is_empty() {
      self.path.clone()
    } else {
      format!("{}?{}", self.path, self.query())
    }
  }

  /// SHA256 of the canonical form, hex encoded. Used as the cache slot id.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical())
  }
}

/// Leading slash, no trailing slash, no empty segments.
fn normalize_path(path: &str) -> String {
  let segments: Vec<&str> = path
    .trim()
    .split('/')
    .filter(|segment| !segment.is_empty())
    .collect();
  format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_param_order_does_not_matter() {
    let a = RequestKey::new("/users").param("limit", 20).param("search", "bob");
    let b = RequestKey::new("/users").param("search", "bob").param("limit", 20);
    assert_eq!(a, b);
    assert_eq!(a.canonical(), "/users?limit=20&search=bob");
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_path_is_normalized() {
    assert_eq!(RequestKey::new("users/").path(), "/users");
    assert_eq!(RequestKey::new("//partners//p1/users").path(), "/partners/p1/users");
    assert_eq!(RequestKey::new("").path(), "/");
  }

  #[test]
  fn test_blank_values_are_dropped() {
    let key = RequestKey::new("/packages").param("search", "  ");
    assert_eq!(key.canonical(), "/packages");
    assert_eq!(key, RequestKey::new("/packages").opt_param("search", None::<String>));
  }

  #[test]
  fn test_filter_terms_are_url_encoded() {
    let key = RequestKey::new("/packages").param("search", "a&b c");
    assert_eq!(key.canonical(), "/packages?search=a%26b+c");
  }

  #[test]
  fn test_different_params_give_different_hashes() {
    let a = RequestKey::new("/users").param("offset", 0);
    let b = RequestKey::new("/users").param("offset", 20);
    assert_ne!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
  }
}
