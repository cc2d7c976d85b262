//! Session context owning the entity store, fetch cache and transport.
//!
//! Created once per login and passed to every hook and action; nothing in the
//! data layer is a module-level global.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{CacheSettings, FetchCache, RequestKey, Shape};
use crate::domain::ApiKey;
use crate::page::{PageOptions, PageParams, Pager};
use crate::query::{FetchOptions, Query};
use crate::store::{Entity, Store};
use crate::transport::{Method, Request, Transport};

/// Settings for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
  pub cache: CacheSettings,
  pub pages: PageParams,
}

/// Data layer of one logged-in session.
/// Clone is cheap - the store and cache are shared.
#[derive(Debug, Clone)]
pub struct Session {
  cache: FetchCache,
  pages: PageParams,
}

impl Session {
  pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings) -> Self {
    let store = Arc::new(Store::new());
    info!(
      capacity = settings.cache.capacity,
      stale_secs = settings.cache.stale_time.num_seconds(),
      "session opened"
    );
    Self {
      cache: FetchCache::new(store, transport, settings.cache),
      pages: settings.pages,
    }
  }

  pub fn store(&self) -> &Arc<Store> {
    self.cache.store()
  }

  pub fn cache(&self) -> &FetchCache {
    &self.cache
  }

  pub fn page_params(&self) -> &PageParams {
    &self.pages
  }

  /// Observe a request key.
  pub fn use_fetcher<T: Entity>(&self, key: RequestKey, shape: Shape, options: FetchOptions) -> Query<T> {
    Query::new(self.cache.clone(), key, shape, options)
  }

  /// Observe a typed endpoint, gated while its required ids are blank.
  pub fn use_api<T: Entity>(&self, key: &ApiKey) -> Query<T> {
    self.use_fetcher(
      key.request_key(),
      key.shape(),
      FetchOptions::invalid_if(key.is_invalid()),
    )
  }

  /// Observe a collection page by page.
  pub fn use_page<T: Entity>(&self, base: RequestKey, options: PageOptions) -> Pager<T> {
    Pager::new(self.cache.clone(), self.pages.clone(), base, options)
  }

  /// A request carrying this session's credentials.
  pub fn request(&self, method: Method, key: RequestKey) -> Request {
    Request::new(method, key).with_credentials(self.cache.credentials().clone())
  }

  /// Tear down on logout: forget every cache entry and drop every record.
  pub fn close(&self) {
    self.cache.clear();
    match self.store().clear() {
      Ok(removed) => info!(removed, "session closed"),
      Err(err) => warn!(error = %err, "failed to clear store on close"),
    }
  }
}
