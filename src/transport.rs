//! Transport seam between the fetch cache and the network.
//!
//! The cache only ever sees [`Transport`]; [`HttpTransport`] is the reqwest
//! implementation the CLI uses.

use std::fmt;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use url::Url;

use crate::cache::RequestKey;
use crate::error::FetchError;

/// HTTP method of a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// Credentials attached to a request
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
  #[default]
  None,
  Bearer(String),
  Basic { username: String, password: String },
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Credentials::None => f.write_str("None"),
      Credentials::Bearer(_) => f.write_str("Bearer(***)"),
      Credentials::Basic { username, .. } => write!(f, "Basic({}:***)", username),
    }
  }
}

/// One call to the API.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub key: RequestKey,
  pub method: Method,
  pub credentials: Credentials,
  pub body: Option<Value>,
}

impl Request {
  pub fn new(method: Method, key: RequestKey) -> Self {
    Self {
      key,
      method,
      credentials: Credentials::None,
      body: None,
    }
  }

  pub fn get(key: RequestKey) -> Self {
    Self::new(Method::Get, key)
  }

  pub fn with_credentials(mut self, credentials: Credentials) -> Self {
    self.credentials = credentials;
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }
}

/// Anything that can carry a request to the API and hand back its JSON body.
///
/// Failures must arrive as [`FetchError::Network`] or [`FetchError::Http`]
/// (status and message), or [`FetchError::MalformedPayload`] for bodies that
/// are not JSON.
pub trait Transport: Send + Sync {
  fn request(&self, request: Request) -> BoxFuture<'static, Result<Value, FetchError>>;
}

/// reqwest-backed transport rooted at an API base URL.
/// Clone is cheap - reqwest::Client uses Arc internally.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    // Url::join replaces the last segment unless the base ends in '/'
    let mut base = base_url.trim().to_string();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url = Url::parse(&base).map_err(|e| eyre!("Invalid API url {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  /// Absolute URL for a request key.
  pub fn url_for(&self, key: &RequestKey) -> Result<Url, FetchError> {
    let mut url = self
      .base_url
      .join(key.path().trim_start_matches('/'))
      .map_err(|e| FetchError::Misuse(format!("invalid request path {}: {}", key.path(), e)))?;
    if !key.params().is_empty() {
      url.query_pairs_mut().extend_pairs(key.params().iter());
    }
    Ok(url)
  }
}

impl Transport for HttpTransport {
  fn request(&self, request: Request) -> BoxFuture<'static, Result<Value, FetchError>> {
    let client = self.client.clone();
    let url = self.url_for(&request.key);

    async move {
      let url = url?;
      let mut builder = client
        .request(request.method.into(), url)
        .header(ACCEPT, "application/json");

      builder = match &request.credentials {
        Credentials::None => builder,
        Credentials::Bearer(token) => builder.bearer_auth(token),
        Credentials::Basic { username, password } => builder.basic_auth(username, Some(password)),
      };

      if let Some(body) = &request.body {
        let bytes = serde_json::to_vec(body).map_err(FetchError::malformed)?;
        builder = builder.header(CONTENT_TYPE, "application/json").body(bytes);
      }

      let response = builder.send().await?;
      let status = response.status();
      let bytes = response.bytes().await?;

      if !status.is_success() {
        return Err(FetchError::from_status(
          status.as_u16(),
          &String::from_utf8_lossy(&bytes),
        ));
      }
      if bytes.is_empty() {
        return Ok(Value::Null);
      }
      serde_json::from_slice(&bytes).map_err(|e| FetchError::malformed(format!("invalid JSON: {}", e)))
    }
    .boxed()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_url_for_joins_path_and_query() {
    let transport = HttpTransport::new("https://api.example.com/v1", Duration::from_secs(5)).unwrap();
    let key = RequestKey::new("/partners/p1/users")
      .param("limit", 20)
      .param("search", "a b");
    let url = transport.url_for(&key).unwrap();
    assert_eq!(
      url.as_str(),
      "https://api.example.com/v1/partners/p1/users?limit=20&search=a+b"
    );
  }

  #[test]
  fn test_credentials_debug_hides_secrets() {
    let creds = Credentials::Basic {
      username: "ops".into(),
      password: "hunter2".into(),
    };
    assert_eq!(format!("{:?}", creds), "Basic(ops:***)");
    assert_eq!(format!("{:?}", Credentials::Bearer("t".into())), "Bearer(***)");
  }
}
