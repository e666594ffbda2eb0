//! Store adapters
//!
//! This module provides:
//! - [`KvStore`] - The key-value contract every queue component is built on
//! - [`InMemoryKvStore`] - Clock-driven in-memory store with fault injection (tests)
//! - [`HttpKvStore`] - REST key-value namespace client

mod http;
mod kv;
mod memory;

pub use http::{HttpKvConfig, HttpKvStore};
pub use kv::{get_json, put_json, KvStore, StoreError};
pub use memory::InMemoryKvStore;
