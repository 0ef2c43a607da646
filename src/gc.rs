//! Mark-and-sweep collection over the stored graph
//!
//! The mark set lives in the backing store, not in memory. Marking is
//! seeded from the named roots and grows along mapping and ordered edges
//! until a fixpoint; weakref edges do not keep their target alive.
//! Reaping deletes every shape row outside the mark set together with its
//! payload rows.

use crate::storage::StorageAdapter;
use crate::Result;
use std::fmt;

/// Collector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle,
    Marking,
    Reaping,
}

/// Outcome of one reap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub reclaimed: usize,
    pub marked: usize,
}

impl fmt::Display for GcReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Collection Statistics:")?;
        writeln!(f, "  Marked: {}", self.marked)?;
        write!(f, "  Reclaimed: {}", self.reclaimed)
    }
}

/// Mark iterations run by one incremental step
pub const DEFAULT_MARK_BUDGET: usize = 8;

pub struct GarbageCollector {
    phase: GcPhase,
    mark_budget: usize,
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MARK_BUDGET)
    }
}

impl GarbageCollector {
    pub fn new(mark_budget: usize) -> Self {
        Self {
            phase: GcPhase::Idle,
            mark_budget: mark_budget.max(1),
        }
    }

    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Clear the mark set and seed it with the roots
    pub fn restart(&mut self, storage: &mut dyn StorageAdapter) -> Result<usize> {
        let seeded = storage.mark_reset()?;
        self.phase = GcPhase::Marking;
        tracing::debug!("GC restarted with {} roots", seeded);
        Ok(seeded)
    }

    /// One fixpoint iteration; returns the number of newly marked oids
    pub fn mark_step(&mut self, storage: &mut dyn StorageAdapter) -> Result<usize> {
        if self.phase != GcPhase::Marking {
            self.restart(storage)?;
        }
        let marked = storage.mark_step()?;
        if marked == 0 {
            self.phase = GcPhase::Reaping;
            tracing::debug!("GC mark phase reached fixpoint");
        }
        Ok(marked)
    }

    /// Full mark phase; returns the size of the mark set
    pub fn collect(&mut self, storage: &mut dyn StorageAdapter) -> Result<usize> {
        self.restart(storage)?;
        while self.mark_step(storage)? > 0 {}
        storage.marked_count()
    }

    /// Delete everything outside the mark set
    ///
    /// Skipped when the mark set holds no more than the roots themselves,
    /// which is also the case before any marking has happened. A store
    /// with no roots left therefore keeps all of its rows; they become
    /// reclaimable once any root with an outgoing edge exists again.
    pub fn reap(&mut self, storage: &mut dyn StorageAdapter) -> Result<GcReport> {
        let marked = storage.marked_count()?;
        let roots = storage.root_count()?;
        self.phase = GcPhase::Idle;

        if marked <= roots {
            tracing::debug!("GC reap skipped: {} marked, {} roots", marked, roots);
            return Ok(GcReport {
                reclaimed: 0,
                marked,
            });
        }

        let reclaimed = storage.reap_unmarked()?;
        tracing::info!("GC reclaimed {} oids ({} live)", reclaimed, marked);
        Ok(GcReport { reclaimed, marked })
    }

    /// Mark to fixpoint, then reap
    pub fn full(&mut self, storage: &mut dyn StorageAdapter) -> Result<GcReport> {
        self.collect(storage)?;
        self.reap(storage)
    }

    /// Advance the collector by a bounded amount of work
    ///
    /// Returns a report once a cycle finishes with a reap.
    pub fn step(&mut self, storage: &mut dyn StorageAdapter) -> Result<Option<GcReport>> {
        if self.phase == GcPhase::Idle {
            self.restart(storage)?;
        }
        for _ in 0..self.mark_budget {
            if self.phase != GcPhase::Marking {
                break;
            }
            self.mark_step(storage)?;
        }
        if self.phase == GcPhase::Reaping {
            return self.reap(storage).map(Some);
        }
        Ok(None)
    }

    /// Drop an in-progress cycle after the graph changed under it
    pub fn invalidate(&mut self) {
        if self.phase != GcPhase::Idle {
            tracing::debug!("GC cycle invalidated in {:?}", self.phase);
            self.phase = GcPhase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::{Kind, Oid};
    use crate::storage::{Literal, SqliteStorage};

    fn literal(store: &mut SqliteStorage, n: i64) -> Oid {
        store.set_literal(&Literal::Integer(n), "int", Kind::Literal).unwrap()
    }

    fn list(store: &mut SqliteStorage, items: &[Oid]) -> Oid {
        let oid = store.allocate_id().unwrap();
        store.set_shape(oid, Kind::ListLike, "list").unwrap();
        store.set_ordered(oid, items).unwrap();
        oid
    }

    /// root "keep" -> [1, [2]]; unnamed [3, 4] is garbage
    fn sample() -> SqliteStorage {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let one = literal(&mut store, 1);
        let two = literal(&mut store, 2);
        let inner = list(&mut store, &[two]);
        let outer = list(&mut store, &[one, inner]);
        store.set_root("keep", outer).unwrap();

        let three = literal(&mut store, 3);
        let four = literal(&mut store, 4);
        list(&mut store, &[three, four]);
        store.commit().unwrap();
        store
    }

    #[test]
    fn test_collect_reaches_fixpoint() {
        let mut store = sample();
        let mut gc = GarbageCollector::default();
        let marked = gc.collect(&mut store).unwrap();
        assert_eq!(marked, 4);
        assert_eq!(gc.phase(), GcPhase::Reaping);
    }

    #[test]
    fn test_full_reclaims_unreachable() {
        let mut store = sample();
        let mut gc = GarbageCollector::default();
        let report = gc.full(&mut store).unwrap();
        assert_eq!(report, GcReport { reclaimed: 3, marked: 4 });
        assert_eq!(store.stats().unwrap().oids, 4);
        assert_eq!(gc.phase(), GcPhase::Idle);

        let again = gc.full(&mut store).unwrap();
        assert_eq!(again.reclaimed, 0);
    }

    #[test]
    fn test_reap_guard_skips_flat_graph() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let one = literal(&mut store, 1);
        literal(&mut store, 2);
        store.set_root("one", one).unwrap();
        store.commit().unwrap();

        let mut gc = GarbageCollector::default();
        let report = gc.full(&mut store).unwrap();
        assert_eq!(report.reclaimed, 0);
        assert_eq!(store.stats().unwrap().oids, 2);
    }

    #[test]
    fn test_step_finishes_cycle() {
        let mut store = sample();
        let mut gc = GarbageCollector::new(1);
        let mut report = None;
        for _ in 0..10 {
            report = gc.step(&mut store).unwrap();
            if report.is_some() {
                break;
            }
        }
        assert_eq!(report.map(|r| r.reclaimed), Some(3));
    }

    #[test]
    fn test_invalidate_resets_phase() {
        let mut store = sample();
        let mut gc = GarbageCollector::new(1);
        gc.step(&mut store).unwrap();
        assert_eq!(gc.phase(), GcPhase::Marking);
        gc.invalidate();
        assert_eq!(gc.phase(), GcPhase::Idle);
    }

    #[test]
    fn test_weakref_does_not_keep_target() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let target_item = literal(&mut store, 7);
        let target = list(&mut store, &[target_item]);
        let weak = store.allocate_id().unwrap();
        store.set_shape(weak, Kind::Weakref, "weakref").unwrap();
        store.set_weakref(weak, Some(target)).unwrap();
        let extra = literal(&mut store, 8);
        let holder = list(&mut store, &[weak, extra]);
        store.set_root("holder", holder).unwrap();
        store.commit().unwrap();

        let mut gc = GarbageCollector::default();
        let report = gc.full(&mut store).unwrap();
        assert_eq!(report.reclaimed, 2);
        assert!(store.get_weakref(weak).unwrap().is_none());
    }

    #[test]
    fn test_store_without_roots_is_not_reaped() {
        let mut store = sample();
        assert!(store.remove_root("keep").unwrap());
        store.commit().unwrap();

        let mut gc = GarbageCollector::default();
        let report = gc.full(&mut store).unwrap();
        assert_eq!(report, GcReport { reclaimed: 0, marked: 0 });
        assert_eq!(store.stats().unwrap().oids, 7);

        let five = literal(&mut store, 5);
        let fresh = list(&mut store, &[five]);
        store.set_root("fresh", fresh).unwrap();
        store.commit().unwrap();
        let report = gc.full(&mut store).unwrap();
        assert_eq!(report, GcReport { reclaimed: 7, marked: 2 });
    }
}
