//! Storage test double that counts payload reads

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::oid::{Entry, Kind, Oid};
use crate::Result;
use super::adapter::{Literal, StorageAdapter, StoreStats};
use super::sqlite::SqliteStorage;

/// In-memory SQLite wrapper counting literal and edge reads.
pub struct CountingStorage {
    inner: SqliteStorage,
    reads: Arc<AtomicUsize>,
}

impl CountingStorage {
    /// Storage plus a handle on its read counter
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let storage = Self {
            inner: SqliteStorage::open_in_memory().expect("in-memory sqlite"),
            reads: reads.clone(),
        };
        (storage, reads)
    }

    fn hit(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

impl StorageAdapter for CountingStorage {
    fn allocate_id(&mut self) -> Result<Oid> {
        self.inner.allocate_id()
    }

    fn set_shape(&mut self, oid: Oid, kind: Kind, otype: &str) -> Result<()> {
        self.inner.set_shape(oid, kind, otype)
    }

    fn get_shape(&self, oid: Oid) -> Result<Entry> {
        self.inner.get_shape(oid)
    }

    fn contains(&self, oid: Oid) -> Result<bool> {
        self.inner.contains(oid)
    }

    fn get_literal(&self, oid: Oid) -> Result<Literal> {
        self.hit();
        self.inner.get_literal(oid)
    }

    fn find_literal(&self, value: &Literal, hash: i64, value_type: &str) -> Result<Option<Oid>> {
        self.inner.find_literal(value, hash, value_type)
    }

    fn put_literal(&mut self, oid: Oid, value: &Literal, hash: i64, value_type: &str) -> Result<()> {
        self.inner.put_literal(oid, value, hash, value_type)
    }

    fn get_ordered(&self, oid: Oid) -> Result<Vec<Entry>> {
        self.hit();
        self.inner.get_ordered(oid)
    }

    fn set_ordered(&mut self, oid: Oid, values: &[Oid]) -> Result<()> {
        self.inner.set_ordered(oid, values)
    }

    fn get_mapping(&self, oid: Oid) -> Result<Vec<(Entry, Entry)>> {
        self.hit();
        self.inner.get_mapping(oid)
    }

    fn set_mapping(&mut self, oid: Oid, pairs: &[(Oid, Oid)]) -> Result<()> {
        self.inner.set_mapping(oid, pairs)
    }

    fn get_weakref(&self, oid: Oid) -> Result<Option<Entry>> {
        self.hit();
        self.inner.get_weakref(oid)
    }

    fn set_weakref(&mut self, oid: Oid, target: Option<Oid>) -> Result<()> {
        self.inner.set_weakref(oid, target)
    }

    fn get_external(&self, oid: Oid) -> Result<Option<String>> {
        self.hit();
        self.inner.get_external(oid)
    }

    fn set_external(&mut self, oid: Oid, url: &str) -> Result<()> {
        self.inner.set_external(oid, url)
    }

    fn get_root(&self, name: &str) -> Result<Option<Entry>> {
        self.inner.get_root(name)
    }

    fn set_root(&mut self, name: &str, oid: Oid) -> Result<()> {
        self.inner.set_root(name, oid)
    }

    fn remove_root(&mut self, name: &str) -> Result<bool> {
        self.inner.remove_root(name)
    }

    fn all_roots(&self) -> Result<Vec<(String, Oid)>> {
        self.inner.all_roots()
    }

    fn root_count(&self) -> Result<usize> {
        self.inner.root_count()
    }

    fn remove_id(&mut self, oid: Oid) -> Result<bool> {
        self.inner.remove_id(oid)
    }

    fn commit(&mut self) -> Result<()> {
        self.inner.commit()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn mark_reset(&mut self) -> Result<usize> {
        self.inner.mark_reset()
    }

    fn mark_step(&mut self) -> Result<usize> {
        self.inner.mark_step()
    }

    fn marked_count(&self) -> Result<usize> {
        self.inner.marked_count()
    }

    fn reap_unmarked(&mut self) -> Result<usize> {
        self.inner.reap_unmarked()
    }

    fn stats(&self) -> Result<StoreStats> {
        self.inner.stats()
    }
}
