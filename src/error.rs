//! Error types for the data layer.
//!
//! Every error is `Clone` because one in-flight request hands the same outcome
//! to every caller waiting on it.

use thiserror::Error;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Status reported for an unreachable host.
pub const STATUS_UNREACHABLE: u16 = 0;

/// Status reported when the transport gave up waiting.
pub const STATUS_TIMEOUT: u16 = 504;

/// Failure of a fetch as seen by hook callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("Network error ({status}): {message}")]
  Network { status: u16, message: String },

  #[error("HTTP {status}: {message}")]
  Http { status: u16, message: String },

  #[error("Malformed payload: {0}")]
  MalformedPayload(String),

  #[error("Store misuse: {0}")]
  Misuse(String),

  /// The cache was cleared while the request was in flight.
  #[error("Request outlived its session")]
  Cleared,
}

impl FetchError {
  /// Status code for presentational mapping (offline, not found, ...).
  ///
  /// Network failures report 0 or 504; payload and misuse errors have none.
  pub fn status(&self) -> Option<u16> {
    match self {
      FetchError::Network { status, .. } | FetchError::Http { status, .. } => Some(*status),
      FetchError::MalformedPayload(_) | FetchError::Misuse(_) | FetchError::Cleared => None,
    }
  }

  /// Build an HTTP error from a response body, preferring a JSON `message` field.
  pub fn from_status(status: u16, body: &str) -> Self {
    let message = serde_json::from_str::<serde_json::Value>(body)
      .ok()
      .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
      .unwrap_or_else(|| truncate_body(body));

    FetchError::Http { status, message }
  }

  pub fn malformed(detail: impl std::fmt::Display) -> Self {
    FetchError::MalformedPayload(detail.to_string())
  }
}

impl From<reqwest::Error> for FetchError {
  fn from(err: reqwest::Error) -> Self {
    if let Some(status) = err.status() {
      return FetchError::Http {
        status: status.as_u16(),
        message: err.to_string(),
      };
    }
    let status = if err.is_timeout() {
      STATUS_TIMEOUT
    } else {
      STATUS_UNREACHABLE
    };
    FetchError::Network {
      status,
      message: err.to_string(),
    }
  }
}

/// Errors raised by the entity store itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  /// Programming error: a write outside of (or across) mutation scopes.
  #[error("Store misuse: {0}")]
  Misuse(String),

  #[error("Malformed payload: {0}")]
  MalformedPayload(String),
}

impl From<StoreError> for FetchError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::Misuse(msg) => FetchError::Misuse(msg),
      StoreError::MalformedPayload(msg) => FetchError::MalformedPayload(msg),
    }
  }
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
  if body.len() <= MAX_ERROR_BODY_LENGTH {
    return body.to_string();
  }
  let mut end = MAX_ERROR_BODY_LENGTH;
  while !body.is_char_boundary(end) {
    end -= 1;
  }
  format!(
    "{}... (truncated, {} total bytes)",
    &body[..end],
    body.len()
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_status_prefers_json_message() {
    let err = FetchError::from_status(404, r#"{"message":"mesh not found"}"#);
    assert_eq!(
      err,
      FetchError::Http {
        status: 404,
        message: "mesh not found".to_string()
      }
    );
    assert_eq!(err.status(), Some(404));
  }

  #[test]
  fn test_from_status_truncates_plain_body() {
    let body = "x".repeat(800);
    match FetchError::from_status(502, &body) {
      FetchError::Http { status, message } => {
        assert_eq!(status, 502);
        assert!(message.starts_with(&"x".repeat(500)));
        assert!(message.ends_with("(truncated, 800 total bytes)"));
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[test]
  fn test_payload_errors_have_no_status() {
    assert_eq!(FetchError::malformed("no id").status(), None);
    let err: FetchError = StoreError::Misuse("nested".into()).into();
    assert_eq!(err, FetchError::Misuse("nested".into()));
  }
}
