//! Paged views over collection endpoints.
//!
//! A `Pager<T>` walks a collection one page at a time. Every page is an
//! ordinary fetch cache entry keyed by the collection path plus filters,
//! limit and offset (or cursor), so pages are deduplicated, reused while
//! fresh and invalidated together with their collection.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::cache::{FetchCache, RequestKey, Shape};
use crate::error::FetchError;
use crate::query::state_of;
use crate::store::{Entity, Record};

/// How pages of a collection are addressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageMode {
  /// `offset = page_index * limit`
  #[default]
  Offset,
  /// Opaque cursor handed out by the previous page
  Cursor,
}

/// Pagination conventions of the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageParams {
  pub mode: PageMode,
  pub default_limit: usize,
  pub limit_param: String,
  pub offset_param: String,
  pub cursor_param: String,
}

impl Default for PageParams {
  fn default() -> Self {
    Self {
      mode: PageMode::Offset,
      default_limit: 20,
      limit_param: "limit".to_string(),
      offset_param: "offset".to_string(),
      cursor_param: "cursor".to_string(),
    }
  }
}

/// Options accepted by a page hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOptions {
  /// Page size; the configured default when unset
  pub limit: Option<usize>,
  pub is_invalid: bool,
}

/// What a page hook currently shows.
#[derive(Debug, Clone)]
pub struct PageState<T> {
  /// Key of the current page, if it can be addressed yet
  pub key: Option<RequestKey>,
  pub items: Vec<Record<T>>,
  pub page_index: usize,
  pub limit: usize,
  pub has_next: bool,
  pub has_prev: bool,
  pub loading: bool,
  pub error: Option<FetchError>,
}

impl<T: Clone> PageState<T> {
  /// Clone the current values out of the page's records.
  pub fn values(&self) -> Vec<T> {
    self.items.iter().map(Record::snapshot).collect()
  }
}

/// Observer of one paged collection.
pub struct Pager<T> {
  cache: FetchCache,
  params: PageParams,
  base: RequestKey,
  filters: BTreeMap<String, String>,
  limit: usize,
  page_index: usize,
  /// `cursors[i]` addresses page `i + 1`
  cursors: Vec<String>,
  is_invalid: bool,
  moved: bool,
  cache_changes: watch::Receiver<u64>,
  record_changes: watch::Receiver<u64>,
  _kind: PhantomData<fn() -> T>,
}

impl<T: Entity> Pager<T> {
  /// Observe page 0 of `base`, fetching it unless the options gate it.
  pub fn new(cache: FetchCache, params: PageParams, base: RequestKey, options: PageOptions) -> Self {
    let limit = options.limit.unwrap_or(params.default_limit).max(1);
    let cache_changes = cache.subscribe();
    let record_changes = T::map(&cache.store().domain).subscribe();
    let pager = Self {
      cache,
      params,
      base,
      filters: BTreeMap::new(),
      limit,
      page_index: 0,
      cursors: Vec::new(),
      is_invalid: options.is_invalid,
      moved: false,
      cache_changes,
      record_changes,
      _kind: PhantomData,
    };
    pager.ensure_current();
    pager
  }

  pub fn page_index(&self) -> usize {
    self.page_index
  }

  pub fn limit(&self) -> usize {
    self.limit
  }

  /// Key of the current page.
  pub fn key(&self) -> Option<RequestKey> {
    self.page_key(self.page_index)
  }

  /// Get the current page.
  pub fn state(&self) -> PageState<T> {
    let key = self.key();
    let mut state = PageState {
      key: key.clone(),
      items: Vec::new(),
      page_index: self.page_index,
      limit: self.limit,
      has_next: false,
      has_prev: self.page_index > 0,
      loading: false,
      error: None,
    };
    if self.is_invalid {
      return state;
    }
    let Some(entry) = key.and_then(|key| self.cache.peek(&key)) else {
      return state;
    };

    let fetched = state_of::<T>(self.cache.store(), Some(&entry));
    if let Some(resolution) = entry.status.resolution() {
      state.has_next = resolution
        .meta
        .has_next(self.offset(), resolution.ids.len());
    }
    state.items = fetched.data.unwrap_or_default();
    state.loading = fetched.loading;
    state.error = fetched.error;
    state
  }

  /// Advance one page.
  ///
  /// Only moves when the current page has a resolution (possibly one being
  /// revalidated) and the server reported more results. Returns whether the index moved.
  pub fn next_page(&mut self) -> bool {
    if self.is_invalid {
      return false;
    }
    let Some(entry) = self.key().and_then(|key| self.cache.peek(&key)) else {
      return false;
    };
    let Some(resolution) = entry.status.resolution() else {
      return false;
    };
    if !resolution.meta.has_next(self.offset(), resolution.ids.len()) {
      return false;
    }
    if self.params.mode == PageMode::Cursor {
      let Some(cursor) = resolution.meta.next_cursor.clone() else {
        debug!(key = %entry.key, "more results reported without a cursor");
        return false;
      };
      self.cursors.truncate(self.page_index);
      self.cursors.push(cursor);
    }
    self.page_index += 1;
    self.moved = true;
    self.ensure_current();
    true
  }

  /// Go back one page, stopping at page 0. Returns whether the index moved.
  pub fn prev_page(&mut self) -> bool {
    if self.is_invalid || self.page_index == 0 {
      return false;
    }
    self.page_index -= 1;
    self.moved = true;
    self.ensure_current();
    true
  }

  /// Set a filter parameter; a blank value clears it.
  ///
  /// Returns to page 0 when the effective filter changed. Pages of the old
  /// filter stay cached and are reused if it comes back.
  pub fn set_filter(&mut self, name: impl Into<String>, value: impl ToString) -> bool {
    let name = name.into();
    let value = value.to_string();
    let value = value.trim();
    let changed = if value.is_empty() {
      self.filters.remove(&name).is_some()
    } else if self.filters.get(&name).map(String::as_str) == Some(value) {
      false
    } else {
      self.filters.insert(name, value.to_string());
      true
    };
    if changed {
      self.reset();
    }
    changed
  }

  pub fn clear_filter(&mut self, name: &str) -> bool {
    self.set_filter(name, "")
  }

  /// Mark every cached page of this collection stale and refetch the
  /// current one. Returns the number of pages marked.
  pub fn invalidate(&self) -> usize {
    let count = self.cache.invalidate_collection(self.base.path());
    self.ensure_current();
    count
  }

  /// Force a new request for the current page.
  pub fn refetch(&self) {
    if self.is_invalid {
      return;
    }
    if let Some(key) = self.key() {
      drop(self.cache.refetch::<T>(&key, &Shape::Page));
    }
  }

  /// Check for changes since the last poll, including navigation.
  pub fn poll(&mut self) -> bool {
    if self.is_invalid {
      return false;
    }
    let mut changed = std::mem::take(&mut self.moved);
    for rx in [&mut self.cache_changes, &mut self.record_changes] {
      if rx.has_changed().unwrap_or(false) {
        let _ = rx.borrow_and_update();
        changed = true;
      }
    }
    changed
  }

  /// Wait for the current page's request in flight, if any.
  pub async fn settled(&self) -> PageState<T> {
    if !self.is_invalid {
      if let Some(in_flight) = self.key().and_then(|key| self.cache.in_flight(&key)) {
        let _ = in_flight.await;
      }
    }
    self.state()
  }

  fn offset(&self) -> usize {
    self.page_index * self.limit
  }

  fn reset(&mut self) {
    self.page_index = 0;
    self.cursors.clear();
    self.moved = true;
    self.ensure_current();
  }

  fn ensure_current(&self) {
    if self.is_invalid {
      return;
    }
    if let Some(key) = self.key() {
      self.cache.ensure::<T>(&key, &Shape::Page);
    }
  }

  fn page_key(&self, index: usize) -> Option<RequestKey> {
    let mut key = self.base.clone();
    for (name, value) in &self.filters {
      key.set(name.as_str(), value);
    }
    key.set(self.params.limit_param.as_str(), self.limit);
    match self.params.mode {
      PageMode::Offset => key.set(self.params.offset_param.as_str(), index * self.limit),
      PageMode::Cursor if index > 0 => {
        let cursor = self.cursors.get(index - 1)?;
        key.set(self.params.cursor_param.as_str(), cursor);
      }
      PageMode::Cursor => {}
    }
    Some(key)
  }
}

impl<T: Entity> fmt::Debug for Pager<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pager")
      .field("kind", &T::KIND)
      .field("base", &self.base)
      .field("filters", &self.filters)
      .field("page_index", &self.page_index)
      .field("limit", &self.limit)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use serde_json::{json, Value};

  use crate::cache::CacheSettings;
  use crate::domain::Package;
  use crate::store::Store;
  use crate::transport::fake::FakeTransport;

  fn cache_with(transport: Arc<FakeTransport>) -> FetchCache {
    FetchCache::new(Arc::new(Store::new()), transport, CacheSettings::default())
  }

  fn packages(range: std::ops::Range<usize>) -> Vec<Value> {
    range.map(|i| json!({"id": format!("p{}", i)})).collect()
  }

  fn pager(cache: &FetchCache, params: PageParams) -> Pager<Package> {
    Pager::new(
      cache.clone(),
      params,
      RequestKey::new("/packages"),
      PageOptions::default(),
    )
  }

  #[tokio::test]
  async fn test_full_last_page_has_no_next() {
    let transport = FakeTransport::new();
    transport.reply(
      "/packages?limit=20&offset=0",
      json!({"items": packages(0..20), "hasMore": false}),
    );
    let cache = cache_with(transport.clone());
    let mut pages = pager(&cache, PageParams::default());

    let state = pages.settled().await;
    assert_eq!(state.items.len(), 20);
    assert!(!state.has_next);
    assert!(!state.has_prev);

    assert!(!pages.next_page());
    assert_eq!(pages.page_index(), 0);
    assert_eq!(transport.calls(), 1);
  }

  #[tokio::test]
  async fn test_navigation_reuses_fresh_pages() {
    let transport = FakeTransport::new();
    transport.reply(
      "/packages?limit=2&offset=0",
      json!({"items": packages(0..2), "total": 3}),
    );
    transport.reply(
      "/packages?limit=2&offset=2",
      json!({"items": packages(2..3), "total": 3}),
    );
    let cache = cache_with(transport.clone());
    let mut pages: Pager<Package> = Pager::new(
      cache.clone(),
      PageParams::default(),
      RequestKey::new("/packages"),
      PageOptions {
        limit: Some(2),
        is_invalid: false,
      },
    );

    assert!(!pages.next_page(), "page 0 not resolved yet");
    assert!(pages.settled().await.has_next);
    assert!(pages.next_page());
    let second = pages.settled().await;
    assert_eq!(second.page_index, 1);
    assert_eq!(second.values()[0].id, "p2");
    assert!(!second.has_next);
    assert!(second.has_prev);

    assert!(pages.prev_page());
    assert!(!pages.prev_page());
    assert_eq!(pages.state().items.len(), 2);
    assert_eq!(transport.calls(), 2);
  }

  #[tokio::test]
  async fn test_filter_change_resets_and_old_pages_are_reused() {
    let transport = FakeTransport::new();
    transport.reply(
      "/packages?limit=20&offset=0",
      json!({"items": packages(0..20), "hasMore": true}),
    );
    transport.reply(
      "/packages?limit=20&offset=20",
      json!({"items": packages(20..25), "hasMore": false}),
    );
    transport.reply(
      "/packages?limit=20&offset=0&search=mesh",
      json!({"items": packages(0..1), "hasMore": false}),
    );
    let cache = cache_with(transport.clone());
    let mut pages = pager(&cache, PageParams::default());

    pages.settled().await;
    assert!(pages.next_page());
    pages.settled().await;

    assert!(pages.set_filter("search", " mesh "));
    assert_eq!(pages.page_index(), 0);
    assert!(!pages.set_filter("search", "mesh"));
    assert_eq!(pages.settled().await.items.len(), 1);

    assert!(pages.clear_filter("search"));
    assert_eq!(pages.settled().await.items.len(), 20);
    assert_eq!(transport.calls(), 3);
  }

  #[tokio::test]
  async fn test_invalidate_marks_every_page_of_the_collection() {
    let transport = FakeTransport::new();
    transport.reply(
      "/packages?limit=20&offset=0",
      json!({"items": packages(0..20), "hasMore": true}),
    );
    transport.reply(
      "/packages?limit=20&offset=20",
      json!({"items": packages(20..22), "hasMore": false}),
    );
    transport.reply(
      "/packages?limit=20&offset=20",
      json!({"items": packages(20..21), "hasMore": false}),
    );
    let cache = cache_with(transport.clone());
    let mut pages = pager(&cache, PageParams::default());

    pages.settled().await;
    assert!(pages.next_page());
    pages.settled().await;

    assert_eq!(pages.invalidate(), 2);
    let page_zero = RequestKey::new("/packages").param("limit", 20).param("offset", 0);
    assert!(cache.peek(&page_zero).unwrap().invalidated);
    assert_eq!(pages.settled().await.items.len(), 1);
    assert_eq!(transport.calls(), 3);
  }

  #[tokio::test]
  async fn test_cursor_mode_follows_and_remembers_cursors() {
    let transport = FakeTransport::new();
    transport.reply(
      "/packages?limit=20",
      json!({"items": packages(0..20), "nextCursor": "c2"}),
    );
    transport.reply(
      "/packages?cursor=c2&limit=20",
      json!({"items": packages(20..23), "nextCursor": null}),
    );
    let cache = cache_with(transport.clone());
    let params = PageParams {
      mode: PageMode::Cursor,
      ..Default::default()
    };
    let mut pages = pager(&cache, params);

    assert!(pages.settled().await.has_next);
    assert!(pages.next_page());
    assert_eq!(pages.key().unwrap().get("cursor"), Some("c2"));
    let last = pages.settled().await;
    assert_eq!(last.items.len(), 3);
    assert!(!last.has_next);

    assert!(pages.prev_page());
    assert!(pages.next_page());
    assert_eq!(pages.key().unwrap().get("cursor"), Some("c2"));
    assert_eq!(transport.calls(), 2);
  }

  #[tokio::test]
  async fn test_page_without_metadata_is_an_error() {
    let transport = FakeTransport::new();
    transport.reply("/packages?limit=20&offset=0", json!({"items": packages(0..3)}));
    let cache = cache_with(transport.clone());
    let pages = pager(&cache, PageParams::default());

    let state = pages.settled().await;
    assert!(state.items.is_empty());
    assert!(matches!(state.error, Some(FetchError::MalformedPayload(_))));
    assert!(cache.store().domain.packages.is_empty());
  }

  #[tokio::test]
  async fn test_invalid_pager_never_fetches() {
    let transport = FakeTransport::new();
    let cache = cache_with(transport.clone());
    let mut pages: Pager<Package> = Pager::new(
      cache,
      PageParams::default(),
      RequestKey::new("/meshes//packages"),
      PageOptions {
        limit: None,
        is_invalid: true,
      },
    );

    assert!(!pages.next_page());
    let state = pages.settled().await;
    assert!(state.items.is_empty());
    assert!(!state.loading);
    assert!(state.error.is_none());
    assert_eq!(transport.calls(), 0);
  }

  #[tokio::test]
  async fn test_revalidating_page_keeps_has_next() {
    let transport = FakeTransport::new();
    transport.reply(
      "/packages?limit=20&offset=0",
      json!({"items": packages(0..20), "hasMore": true}),
    );
    let gate = transport.gated(
      "/packages?limit=20&offset=0",
      json!({"items": packages(0..20), "hasMore": true}),
    );
    transport.reply(
      "/packages?limit=20&offset=20",
      json!({"items": packages(20..25), "hasMore": false}),
    );
    let cache = cache_with(transport.clone());
    let mut pages = pager(&cache, PageParams::default());
    assert!(pages.settled().await.has_next);

    pages.refetch();
    let revalidating = pages.state();
    assert!(revalidating.loading);
    assert_eq!(revalidating.items.len(), 20);
    assert!(revalidating.has_next);

    assert!(pages.next_page());
    let second = pages.settled().await;
    assert_eq!(second.page_index, 1);
    assert_eq!(second.items.len(), 5);
    gate.send(()).unwrap();
  }

  #[tokio::test]
  async fn test_invalid_pager_ignores_resolved_pages() {
    let transport = FakeTransport::new();
    transport.reply(
      "/packages?limit=20&offset=0",
      json!({"items": packages(0..20), "hasMore": true}),
    );
    let cache = cache_with(transport.clone());
    assert!(pager(&cache, PageParams::default()).settled().await.has_next);

    let mut pages: Pager<Package> = Pager::new(
      cache,
      PageParams::default(),
      RequestKey::new("/packages"),
      PageOptions {
        limit: None,
        is_invalid: true,
      },
    );
    pages.refetch();

    let state = pages.state();
    assert!(state.items.is_empty());
    assert!(!state.loading);
    assert!(state.error.is_none());
    assert!(!state.has_next);
    assert!(!pages.next_page());
    assert!(!pages.poll());
    assert_eq!(transport.calls(), 1);
  }
}
