//! Storage Layer - SQLite-backed persistence
//!
//! System of record is SQLite with tables:
//! - oid_lookup(oid, stg_kind, otype)
//! - literals(oid, value, value_hash, value_type)
//! - weakrefs(oid_host, oid_ref)
//! - mappings(tidx, oid_host, oid_key, oid_value) - ordered edges have no key
//! - externals(oid, url)
//! - exports(urlpath, oid_ref) - named roots
//! - odb_metadata(attr, value), odb_sessions(ssid, session, next_oid)

pub mod adapter;
pub mod schema;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{Literal, StorageAdapter, StoreStats, literal_hash};
pub use sqlite::SqliteStorage;
