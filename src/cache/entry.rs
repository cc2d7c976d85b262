//! Cache entries and their status.

use chrono::{DateTime, Duration, Utc};

use super::key::RequestKey;
use super::shape::PageMeta;
use crate::error::FetchError;
use crate::store::EntityId;

/// Outcome of a resolved request.
///
/// Holds ids into the entity store, never entity data, so one upsert is
/// visible through every entry that references the id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
  pub ids: Vec<EntityId>,
  pub meta: PageMeta,
}

/// Where a request key stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
  /// A request is in flight; `previous` is the last resolution, if any
  Pending { previous: Option<Resolution> },
  /// The latest request succeeded
  Resolved(Resolution),
  /// The latest request failed
  Error(FetchError),
}

impl CacheStatus {
  pub fn is_pending(&self) -> bool {
    matches!(self, CacheStatus::Pending { .. })
  }

  /// The resolution readers should show: the current one, or while pending
  /// the previous one.
  pub fn resolution(&self) -> Option<&Resolution> {
    match self {
      CacheStatus::Resolved(resolution) => Some(resolution),
      CacheStatus::Pending { previous } => previous.as_ref(),
      CacheStatus::Error(_) => None,
    }
  }

  pub fn error(&self) -> Option<&FetchError> {
    match self {
      CacheStatus::Error(err) => Some(err),
      _ => None,
    }
  }
}

/// Snapshot of one request key's cache slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: RequestKey,
  pub status: CacheStatus,
  /// Sequence number of the request this entry tracks
  pub generation: u64,
  /// When the request was issued, or when it settled
  pub timestamp: DateTime<Utc>,
  /// Marked stale by an invalidation; refetched on next observation
  pub invalidated: bool,
}

impl CacheEntry {
  /// Check if the entry is older than `stale_time`.
  pub fn is_stale(&self, stale_time: Duration) -> bool {
    Utc::now() - self.timestamp > stale_time
  }
}
