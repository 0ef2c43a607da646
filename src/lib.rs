//! # Oidstore - Identity-Preserving Object Graph Persistence
//!
//! Stores arbitrary in-memory object graphs (shared references, cycles,
//! weak references, user objects) in SQLite and loads them back with the
//! same shape.
//!
//! Oidstore provides:
//! - Stable oids for every stored node, reused across store calls
//! - Content-addressed literals and identity-addressed containers
//! - Depth-limited loading with transparent lazy proxies
//! - Named roots and mark-and-sweep garbage collection
//! - A single worker thread that serializes all access to a store

pub mod oid;
pub mod value;
pub mod reduce;
pub mod identity;
pub mod lazy;
pub mod storage;
pub mod serialize;
pub mod deserialize;
pub mod gc;
pub mod worker;
pub mod session;
pub mod registry;
pub mod output;
pub mod config;
pub mod ui;

// Re-exports for convenient access
pub use oid::{Entry, Kind, Oid};
pub use value::{DictRef, OpaquePayload, SeqKind, SeqRef, Value};
pub use reduce::{Constructor, FromReduction, Instance, ObjectRef, Reduction, ToReduction, TypeRegistry};
pub use lazy::{OidRef, Proxy};
pub use storage::{SqliteStorage, StorageAdapter, StoreStats};
pub use gc::GcReport;
pub use worker::Worker;
pub use registry::{LoadTarget, Registry, RegistryOptions};

/// Result type alias for Oidstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Oidstore operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Identity conflict for {key}: bound to {existing}, requested {requested}")]
    IdentityConflict {
        key: String,
        existing: Oid,
        requested: Oid,
    },

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Unsupported reduction: {0}")]
    UnsupportedReduction(String),

    #[error("Reduction protocol violated: {0}")]
    ReductionProtocol(String),

    #[error("Unknown storage kind: {0}")]
    UnknownKind(String),

    #[error("Cannot resolve type: {0}")]
    TypeResolution(String),

    #[error("Proxy cycle at {0}")]
    CyclicProxy(Oid),

    #[error("Unhashable type: {0}")]
    Unhashable(String),

    #[error("Oid not found: {0}")]
    NotFound(Oid),

    #[error("Root not found: {0}")]
    RootNotFound(String),

    #[error("Invalid oid: {0}")]
    InvalidOid(String),

    #[error("Proxy {0} has no registry to load from")]
    Detached(Oid),

    #[error("Registry is closed")]
    Closed,

    #[error("Cannot close the worker from its own thread")]
    CloseFromWorker,

    #[error("Worker command panicked: {0}")]
    CommandPanicked(String),
}
