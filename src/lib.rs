//! Client-side data layer for the mesh dashboard API.
//!
//! A [`Session`](session::Session) owns a normalized entity store and a
//! deduplicating fetch cache. Hooks ([`Query`](query::Query),
//! [`Pager`](page::Pager)) observe request keys; actions write through the
//! store and invalidate what they change.

pub mod actions;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod page;
pub mod query;
pub mod session;
pub mod store;
pub mod transport;
