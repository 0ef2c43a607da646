//! Storage adapter contract
//!
//! The narrow set of operations the serializer, deserializer and garbage
//! collector need from a backing store. Rows are addressed by [`Oid`];
//! every oid has one shape (kind + otype) and, depending on its kind, a
//! literal, a weakref edge, ordered edges, mapping edges or an external
//! url.

use crate::oid::{Entry, Kind, Oid};
use crate::value::hash_parts;
use crate::Result;
use std::fmt;

/// A flat literal payload as stored in the literal table.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Literal {
    fn tag(&self) -> &'static [u8] {
        match self {
            Literal::Null => b"null",
            Literal::Integer(_) => b"integer",
            Literal::Real(_) => b"real",
            Literal::Text(_) => b"text",
            Literal::Blob(_) => b"blob",
        }
    }
}

/// Hash stored alongside a literal to narrow dedup lookups
pub fn literal_hash(value_type: &str, value: &Literal) -> i64 {
    match value {
        Literal::Null => hash_parts(&[value_type.as_bytes(), value.tag()]),
        Literal::Integer(i) => hash_parts(&[value_type.as_bytes(), value.tag(), &i.to_le_bytes()]),
        Literal::Real(f) => hash_parts(&[
            value_type.as_bytes(),
            value.tag(),
            &f.to_bits().to_le_bytes(),
        ]),
        Literal::Text(s) => hash_parts(&[value_type.as_bytes(), value.tag(), s.as_bytes()]),
        Literal::Blob(b) => hash_parts(&[value_type.as_bytes(), value.tag(), b]),
    }
}

/// Row counts of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub oids: usize,
    pub literals: usize,
    pub edges: usize,
    pub weakrefs: usize,
    pub externals: usize,
    pub roots: usize,
    pub sessions: usize,
    pub next_oid: i64,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Store Statistics:")?;
        writeln!(f, "  Oids: {}", self.oids)?;
        writeln!(f, "  Literals: {}", self.literals)?;
        writeln!(f, "  Edges: {}", self.edges)?;
        writeln!(f, "  Weakrefs: {}", self.weakrefs)?;
        writeln!(f, "  Externals: {}", self.externals)?;
        writeln!(f, "  Roots: {}", self.roots)?;
        writeln!(f, "  Sessions: {}", self.sessions)?;
        writeln!(f, "  Next oid: {}", self.next_oid)
    }
}

/// Backing store used by a session.
///
/// Reads take `&self`; anything that writes takes `&mut self`. Writes
/// are only durable after [`commit`](StorageAdapter::commit).
pub trait StorageAdapter: Send {
    // ========== Shapes ==========

    /// Hand out a fresh, never used oid
    fn allocate_id(&mut self) -> Result<Oid>;

    fn set_shape(&mut self, oid: Oid, kind: Kind, otype: &str) -> Result<()>;

    /// Kind and otype of `oid`; fails with `NotFound` if absent
    fn get_shape(&self, oid: Oid) -> Result<Entry>;

    fn contains(&self, oid: Oid) -> Result<bool>;

    // ========== Literals ==========

    fn get_literal(&self, oid: Oid) -> Result<Literal>;

    fn find_literal(&self, value: &Literal, hash: i64, value_type: &str) -> Result<Option<Oid>>;

    fn put_literal(&mut self, oid: Oid, value: &Literal, hash: i64, value_type: &str) -> Result<()>;

    /// Store a content-addressed literal, reusing an equal stored one
    fn set_literal(&mut self, value: &Literal, value_type: &str, kind: Kind) -> Result<Oid> {
        let hash = literal_hash(value_type, value);
        if let Some(oid) = self.find_literal(value, hash, value_type)? {
            return Ok(oid);
        }
        let oid = self.allocate_id()?;
        self.set_shape(oid, kind, value_type)?;
        self.put_literal(oid, value, hash, value_type)?;
        Ok(oid)
    }

    // ========== Edges ==========

    fn get_ordered(&self, oid: Oid) -> Result<Vec<Entry>>;

    /// Replace the ordered edges of `oid`
    fn set_ordered(&mut self, oid: Oid, values: &[Oid]) -> Result<()>;

    fn get_mapping(&self, oid: Oid) -> Result<Vec<(Entry, Entry)>>;

    /// Replace the mapping edges of `oid`
    fn set_mapping(&mut self, oid: Oid, pairs: &[(Oid, Oid)]) -> Result<()>;

    /// Target of a weakref; `None` when the target row is gone
    fn get_weakref(&self, oid: Oid) -> Result<Option<Entry>>;

    fn set_weakref(&mut self, oid: Oid, target: Option<Oid>) -> Result<()>;

    fn get_external(&self, oid: Oid) -> Result<Option<String>>;

    fn set_external(&mut self, oid: Oid, url: &str) -> Result<()>;

    // ========== Roots ==========

    fn get_root(&self, name: &str) -> Result<Option<Entry>>;

    fn set_root(&mut self, name: &str, oid: Oid) -> Result<()>;

    fn remove_root(&mut self, name: &str) -> Result<bool>;

    fn all_roots(&self) -> Result<Vec<(String, Oid)>>;

    fn root_count(&self) -> Result<usize>;

    // ========== Lifecycle ==========

    /// Delete the shape of `oid` with its literal and edge rows
    fn remove_id(&mut self, oid: Oid) -> Result<bool>;

    /// Durability boundary
    fn commit(&mut self) -> Result<()>;

    /// Discard uncommitted writes and release the store
    fn close(&mut self) -> Result<()>;

    // ========== Garbage collection ==========

    /// Clear the mark set and seed it with every root; returns the seed count
    fn mark_reset(&mut self) -> Result<usize>;

    /// Mark edge targets of marked oids; returns how many were newly marked
    fn mark_step(&mut self) -> Result<usize>;

    fn marked_count(&self) -> Result<usize>;

    /// Delete every row whose oid is unmarked; returns the number of oids removed
    fn reap_unmarked(&mut self) -> Result<usize>;

    fn stats(&self) -> Result<StoreStats>;
}
