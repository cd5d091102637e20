use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;
use parking_lot::{
    RawRwLock, RwLock,
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
};

/// Reference counted reader/writer lock for one record offset.
#[derive(Default)]
struct RecordLock {
    rw: Arc<RwLock<()>>,
    refs: AtomicU32,
}

/// Keyed reader/writer locks over record offsets.
///
/// Entries are created on first acquisition and erased once the last guard
/// referencing an offset is dropped, so the table only holds locks for
/// records somebody is actively touching. The map itself is sharded
/// (`DashMap`), keeping the critical section to the map operation and the
/// counter bump.
pub struct LockTable {
    locks: DashMap<u64, Arc<RecordLock>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Blocks until a shared lock on `offset` is held.
    pub fn lock_shared(&self, offset: u64) -> SharedRecordGuard<'_> {
        let lock = self.acquire_entry(offset);
        let guard = lock.rw.read_arc();

        SharedRecordGuard {
            table: self,
            offset,
            guard: Some(guard),
        }
    }

    /// Blocks until the exclusive lock on `offset` is held.
    pub fn lock_exclusive(&self, offset: u64) -> ExclusiveRecordGuard<'_> {
        let lock = self.acquire_entry(offset);
        let guard = lock.rw.write_arc();

        ExclusiveRecordGuard {
            table: self,
            offset,
            guard: Some(guard),
        }
    }

    /// Number of offsets currently holding a lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn acquire_entry(&self, offset: u64) -> Arc<RecordLock> {
        let entry = self.locks.entry(offset).or_default();
        // The reference count must move while the map shard is still held,
        // otherwise a concurrent release could erase the entry in between
        // and a later acquire would mint a second lock for the same offset.
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Arc::clone(entry.value())
    }

    fn release_entry(&self, offset: u64) {
        self.locks
            .remove_if(&offset, |_, lock| lock.refs.fetch_sub(1, Ordering::AcqRel) == 1);
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SharedRecordGuard<'a> {
    table: &'a LockTable,
    offset: u64,
    guard: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
}

impl Drop for SharedRecordGuard<'_> {
    fn drop(&mut self) {
        // Unlock before the table entry can be erased.
        let _ = self.guard.take();
        self.table.release_entry(self.offset);
    }
}

pub struct ExclusiveRecordGuard<'a> {
    table: &'a LockTable,
    offset: u64,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, ()>>,
}

impl Drop for ExclusiveRecordGuard<'_> {
    fn drop(&mut self) {
        let _ = self.guard.take();
        self.table.release_entry(self.offset);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn entry_created_and_removed() {
        let table = LockTable::new();
        assert!(table.is_empty());

        {
            let _guard = table.lock_shared(64);
            assert_eq!(table.len(), 1);
        }

        assert!(table.is_empty());
    }

    #[test]
    fn shared_locks_coexist() {
        let table = LockTable::new();
        let _a = table.lock_shared(64);
        let _b = table.lock_shared(64);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn exclusive_lock_serializes_writers() -> anyhow::Result<()> {
        let table = Arc::new(LockTable::new());
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let table = Arc::clone(&table);
            let counter = Arc::clone(&counter);

            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = table.lock_exclusive(128);
                    let seen = counter.load(Ordering::Relaxed);
                    counter.store(seen + 1, Ordering::Relaxed);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 8000);
        assert!(table.is_empty());

        Ok(())
    }

    #[test]
    fn distinct_offsets_do_not_contend() {
        let table = LockTable::new();
        let _a = table.lock_exclusive(64);
        let _b = table.lock_exclusive(128);
        assert_eq!(table.len(), 2);
    }
}
