//! Response shapes and their decoding into entity payloads.

use serde_json::{Map, Value};

use crate::error::FetchError;
use crate::store::{EntityId, Payload};

/// Field names accepted for the items array of an envelope.
const ITEM_FIELDS: [&str; 3] = ["items", "results", "data"];

/// What a request is expected to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
  /// A single entity object. `id` is filled in when the endpoint omits it.
  Entity { id: Option<EntityId> },
  /// A bare array, or an envelope with an items array
  List,
  /// An envelope with an items array plus paging metadata
  Page,
}

impl Shape {
  pub fn entity() -> Self {
    Shape::Entity { id: None }
  }

  pub fn entity_with_id(id: impl Into<EntityId>) -> Self {
    Shape::Entity {
      id: Some(id.into()),
    }
  }
}

/// Paging metadata reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMeta {
  pub has_more: Option<bool>,
  pub total: Option<u64>,
  pub next_cursor: Option<String>,
  /// Whether the response carried a cursor field at all (even `null`)
  pub cursor_reported: bool,
}

impl PageMeta {
  /// Whether a page starting at `offset` with `len` items has a successor.
  ///
  /// Only server-reported metadata counts: `hasMore`, then `total`, then the
  /// presence of a next cursor. A full page alone never implies more.
  pub fn has_next(&self, offset: usize, len: usize) -> bool {
    if let Some(more) = self.has_more {
      return more;
    }
    if let Some(total) = self.total {
      return ((offset + len) as u64) < total;
    }
    self.next_cursor.is_some()
  }

  fn is_reported(&self) -> bool {
    self.has_more.is_some() || self.total.is_some() || self.cursor_reported
  }
}

/// Payloads and metadata extracted from one response body.
#[derive(Debug, Clone, Default)]
pub struct Decoded {
  pub payloads: Vec<Payload>,
  pub meta: PageMeta,
}

/// Decode a response body. Anything not matching `shape` is malformed.
pub fn decode(body: Value, shape: &Shape) -> Result<Decoded, FetchError> {
  match shape {
    Shape::Entity { id } => {
      let Value::Object(mut payload) = body else {
        return Err(FetchError::malformed(format!(
          "expected an object, got {}",
          kind_of(&body)
        )));
      };
      if let Some(id) = id {
        payload
          .entry("id")
          .or_insert_with(|| Value::String(id.clone()));
      }
      Ok(Decoded {
        payloads: vec![payload],
        meta: PageMeta::default(),
      })
    }
    Shape::List => {
      let items = match body {
        Value::Array(items) => items,
        Value::Object(mut envelope) => take_items(&mut envelope)?,
        other => {
          return Err(FetchError::malformed(format!(
            "expected an array, got {}",
            kind_of(&other)
          )))
        }
      };
      Ok(Decoded {
        payloads: objects(items)?,
        meta: PageMeta::default(),
      })
    }
    Shape::Page => {
      let Value::Object(mut envelope) = body else {
        return Err(FetchError::malformed(format!(
          "expected a page envelope, got {}",
          kind_of(&body)
        )));
      };
      let items = take_items(&mut envelope)?;
      let meta = page_meta(&envelope)?;
      if !meta.is_reported() {
        return Err(FetchError::malformed(
          "page response carries no paging metadata",
        ));
      }
      Ok(Decoded {
        payloads: objects(items)?,
        meta,
      })
    }
  }
}

fn take_items(envelope: &mut Map<String, Value>) -> Result<Vec<Value>, FetchError> {
  for field in ITEM_FIELDS {
    if matches!(envelope.get(field), Some(Value::Array(_))) {
      if let Some(Value::Array(items)) = envelope.remove(field) {
        return Ok(items);
      }
    }
  }
  Err(FetchError::malformed("response has no items array"))
}

fn objects(items: Vec<Value>) -> Result<Vec<Payload>, FetchError> {
  items
    .into_iter()
    .enumerate()
    .map(|(index, item)| match item {
      Value::Object(payload) => Ok(payload),
      other => Err(FetchError::malformed(format!(
        "item {} is {}, not an object",
        index,
        kind_of(&other)
      ))),
    })
    .collect()
}

fn page_meta(envelope: &Map<String, Value>) -> Result<PageMeta, FetchError> {
  let has_more = match field(envelope, &["hasMore", "has_more"]) {
    None | Some(Value::Null) => None,
    Some(Value::Bool(more)) => Some(*more),
    Some(other) => {
      return Err(FetchError::malformed(format!(
        "hasMore is {}",
        kind_of(other)
      )))
    }
  };

  let total = match field(envelope, &["total", "count"]) {
    None | Some(Value::Null) => None,
    Some(value) => Some(
      value
        .as_u64()
        .ok_or_else(|| FetchError::malformed(format!("total is {}", kind_of(value))))?,
    ),
  };

  let (cursor_reported, next_cursor) = match field(envelope, &["nextCursor", "next_cursor"]) {
    None => (false, None),
    Some(Value::Null) => (true, None),
    Some(Value::String(cursor)) if cursor.is_empty() => (true, None),
    Some(Value::String(cursor)) => (true, Some(cursor.clone())),
    Some(other) => {
      return Err(FetchError::malformed(format!(
        "nextCursor is {}",
        kind_of(other)
      )))
    }
  };

  Ok(PageMeta {
    has_more,
    total,
    next_cursor,
    cursor_reported,
  })
}

fn field<'a>(envelope: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
  names.iter().find_map(|name| envelope.get(*name))
}

fn kind_of(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}
