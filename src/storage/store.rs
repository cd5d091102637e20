use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::utils::checksum::adler32;

use super::{
    Error, NOT_FOUND, Result,
    cache::PagedCache,
    cursor::RecordCursor,
    locks::LockTable,
    record::{
        RECORD_DELETED_FLAG, RECORD_HEADER_SIZE, RecordHeader, STORAGE_HEADER_SIZE, StorageHeader,
    },
};

/// Minimal number of free records inspected per allocation.
pub const FREE_RECORD_LOOKUP_DEPTH: u64 = 64;
/// The lookup depth grows to this fraction of the free list length.
pub const FREE_RECORD_LOOKUP_RATIO: u64 = 10;

/// Where a newly allocated record slot gets wired into the live list.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Placement {
    /// Link at the tail of the live list, updating head/tail and count.
    Tail,
    /// Take over the given neighbour links; the caller rewires the
    /// neighbours and the storage header itself (record relocation).
    Linked { previous: u64, next: u64 },
}

/// Record storage over a single page-cached file.
///
/// Records live in a doubly linked list persisted in the file; removed
/// records stay in place and are chained into a second, free list whose
/// slots get recycled by later allocations. Record headers and payloads
/// carry Adler-32 checksums that are verified on every read.
///
/// # Locking
///
/// Three lock kinds exist: the storage header lock, per-record locks from
/// the [`LockTable`], and the cache's internal latches below both.
/// Structural mutations (create, remove, relocate, free list maintenance)
/// hold the header lock exclusively for their whole critical section and
/// take the exclusive record lock of every record header they rewrite, in
/// ascending offset order when two are held at once. Readers take shared
/// record locks only and never acquire the header lock while holding one,
/// so the lock graph stays acyclic.
pub struct RecordStore {
    cache: PagedCache,
    header: RwLock<StorageHeader>,
    locks: LockTable,
    free_lookup_depth: AtomicU64,
}

impl RecordStore {
    /// Opens a record storage file. An empty writable file is initialized
    /// with a fresh storage header; anything else must carry a valid
    /// header or the open fails with [`Error::HeaderCorrupt`].
    pub fn open(path: impl AsRef<Path>, read_only: bool, cache_bytes: usize) -> Result<Self> {
        let cache = PagedCache::open(path, read_only, cache_bytes)?;

        let store = Self {
            cache,
            header: RwLock::new(StorageHeader::new()),
            locks: LockTable::new(),
            free_lookup_depth: AtomicU64::new(FREE_RECORD_LOOKUP_DEPTH),
        };

        if store.cache.file_size()? == 0 && !store.cache.is_read_only() {
            let header = store.header.read();
            store.write_storage_header(&header)?;
        } else {
            store.load_storage_header()?;
        }

        Ok(store)
    }

    /// Writes the storage header back, flushes and closes the underlying
    /// cache. Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.cache.is_open() {
            return Ok(());
        }

        if !self.cache.is_read_only() {
            let header = self.header.read();
            self.write_storage_header(&header)?;
        }

        self.cache.close()
    }

    /// Persists all dirty cache pages.
    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }

    pub fn is_open(&self) -> bool {
        self.cache.is_open()
    }

    pub fn is_read_only(&self) -> bool {
        self.cache.is_read_only()
    }

    /// Length of the underlying file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        self.cache.file_size()
    }

    /// Number of live records.
    pub fn total_records(&self) -> u64 {
        self.header.read().total_records
    }

    /// Number of records on the free list.
    pub fn total_free_records(&self) -> u64 {
        self.header.read().total_free_records
    }

    /// Offset of the first byte past the last allocated record slot.
    pub fn end_of_data(&self) -> u64 {
        self.header.read().end_of_data
    }

    /// Creates a record holding `data`, linked at the tail of the live
    /// list, and returns a cursor pointing at it. The slot capacity is at
    /// least `data.len()`; a recycled slot may be larger.
    pub fn create_record(&self, data: &[u8]) -> Result<RecordCursor<'_>> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if data.is_empty() {
            return Err(Error::ZeroLength);
        }
        if data.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument("record larger than 4 GiB"));
        }

        let mut header = self.header.write();
        let (offset, record) = self.allocate_record(&mut header, data, Placement::Tail)?;
        drop(header);

        Ok(RecordCursor::new(self, record, offset))
    }

    /// Returns a cursor for the record at `offset`. Fails when the offset
    /// lies outside the allocated area, the header checksum does not match
    /// or the record is deleted.
    pub fn record_at(&self, offset: u64) -> Result<RecordCursor<'_>> {
        let end_of_data = self.header.read().end_of_data;
        if offset < STORAGE_HEADER_SIZE as u64 || offset >= end_of_data {
            return Err(Error::NotFound);
        }

        let record = {
            let _guard = self.locks.lock_shared(offset);
            self.read_record_header(offset)?
        };
        if record.is_deleted() {
            return Err(Error::RecordDeleted(offset));
        }

        Ok(RecordCursor::new(self, record, offset))
    }

    /// Cursor at the head of the live list, `None` when the store is empty.
    pub fn first_record(&self) -> Result<Option<RecordCursor<'_>>> {
        let first = self.header.read().first_record;
        if first == NOT_FOUND {
            return Ok(None);
        }
        self.record_at(first).map(Some)
    }

    /// Cursor at the tail of the live list, `None` when the store is empty.
    pub fn last_record(&self) -> Result<Option<RecordCursor<'_>>> {
        let last = self.header.read().last_record;
        if last == NOT_FOUND {
            return Ok(None);
        }
        self.record_at(last).map(Some)
    }

    /// Removes the cursor's record: unlinks it from the live list, chains
    /// it onto the free list and advances the cursor to its former right
    /// neighbour, else its left neighbour, else invalidates it.
    pub fn remove_record(&self, cursor: &mut RecordCursor<'_>) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let position = cursor.position();
        if position == NOT_FOUND {
            return Err(Error::NotFound);
        }

        let mut header = self.header.write();

        // Brief exclusive hold so an in-place update can't tear the read.
        let record = {
            let _guard = self.locks.lock_exclusive(position);
            self.read_record_header(position)?
        };
        if record.is_deleted() {
            return Err(Error::RecordDeleted(position));
        }

        let left = record.previous;
        let right = record.next;

        let neighbour = match (left != NOT_FOUND, right != NOT_FOUND) {
            (true, true) => {
                // removing in the middle
                if left == right {
                    return Err(Error::RecordHeaderCorrupt(position));
                }
                let (lo, hi) = (left.min(right), left.max(right));
                let _lo_guard = self.locks.lock_exclusive(lo);
                let _hi_guard = self.locks.lock_exclusive(hi);

                let mut left_header = self.read_record_header(left)?;
                let mut right_header = self.read_record_header(right)?;
                left_header.next = right;
                right_header.previous = left;
                self.write_record_header(left, &mut left_header)?;
                self.write_record_header(right, &mut right_header)?;

                Some((right, right_header))
            }
            (true, false) => {
                // removing the tail
                let _guard = self.locks.lock_exclusive(left);
                let mut left_header = self.read_record_header(left)?;
                left_header.next = NOT_FOUND;
                self.write_record_header(left, &mut left_header)?;

                header.last_record = left;
                Some((left, left_header))
            }
            (false, true) => {
                // removing the head
                let _guard = self.locks.lock_exclusive(right);
                let mut right_header = self.read_record_header(right)?;
                right_header.previous = NOT_FOUND;
                self.write_record_header(right, &mut right_header)?;

                header.first_record = right;
                Some((right, right_header))
            }
            (false, false) => {
                // removing the only record
                header.first_record = NOT_FOUND;
                header.last_record = NOT_FOUND;
                None
            }
        };

        self.add_to_free_list(&mut header, position)?;
        header.total_records -= 1;
        self.write_storage_header(&header)?;

        match neighbour {
            Some((offset, record)) => cursor.reposition(offset, record),
            None => cursor.invalidate(),
        }

        Ok(())
    }

    //
    // Storage header io
    //

    fn load_storage_header(&self) -> Result<()> {
        let mut bytes = [0u8; STORAGE_HEADER_SIZE];
        let read = self.cache.read(0, &mut bytes)?;
        if read != STORAGE_HEADER_SIZE {
            return Err(Error::HeaderCorrupt);
        }

        let header = StorageHeader::decode(&bytes);
        if !header.is_valid() {
            return Err(Error::HeaderCorrupt);
        }

        self.adjust_lookup_depth(&header);
        *self.header.write() = header;

        Ok(())
    }

    pub(crate) fn write_storage_header(&self, header: &StorageHeader) -> Result<()> {
        let bytes = header.encode();
        let written = self.cache.write(0, &bytes)?;
        if written != STORAGE_HEADER_SIZE {
            return Err(Error::IoShort {
                op: "storage header write",
                expected: STORAGE_HEADER_SIZE,
                actual: written,
            });
        }

        self.adjust_lookup_depth(header);
        Ok(())
    }

    /// Bounds allocation latency while keeping fragmentation in check: the
    /// free list scan depth scales with the free list itself.
    fn adjust_lookup_depth(&self, header: &StorageHeader) {
        let depth =
            FREE_RECORD_LOOKUP_DEPTH.max(header.total_free_records / FREE_RECORD_LOOKUP_RATIO);
        self.free_lookup_depth.store(depth, Ordering::Release);
    }

    //
    // Record header io
    //

    /// Reads and checksum-verifies the record header at `offset`. The
    /// caller holds whatever record lock the context requires.
    pub(crate) fn read_record_header(&self, offset: u64) -> Result<RecordHeader> {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        let read = self.cache.read(offset, &mut bytes)?;
        if read != RECORD_HEADER_SIZE {
            return Err(Error::NotFound);
        }

        let header = RecordHeader::decode(&bytes);
        if !header.verify() {
            return Err(Error::RecordHeaderCorrupt(offset));
        }

        Ok(header)
    }

    /// Seals and writes a record header at `offset`. The caller holds the
    /// exclusive record lock.
    pub(crate) fn write_record_header(&self, offset: u64, header: &mut RecordHeader) -> Result<()> {
        header.seal();
        let bytes = header.encode();

        let written = self.cache.write(offset, &bytes)?;
        if written != RECORD_HEADER_SIZE {
            return Err(Error::IoShort {
                op: "record header write",
                expected: RECORD_HEADER_SIZE,
                actual: written,
            });
        }

        Ok(())
    }

    /// Writes a sealed header plus payload under the record's exclusive
    /// lock.
    fn write_record(&self, offset: u64, header: &mut RecordHeader, data: &[u8]) -> Result<()> {
        let _guard = self.locks.lock_exclusive(offset);

        self.write_record_header(offset, header)?;

        let written = self.cache.write(offset + RECORD_HEADER_SIZE as u64, data)?;
        if written != data.len() {
            return Err(Error::IoShort {
                op: "record data write",
                expected: data.len(),
                actual: written,
            });
        }

        Ok(())
    }

    //
    // Allocation
    //

    /// Allocates a record slot for `data` and writes header plus payload.
    /// Tries, in order: the very first record of an empty store, a free
    /// list slot of sufficient capacity, a fresh slot appended at the end
    /// of data. The caller holds the exclusive header lock.
    pub(crate) fn allocate_record(
        &self,
        header: &mut StorageHeader,
        data: &[u8],
        placement: Placement,
    ) -> Result<(u64, RecordHeader)> {
        if header.first_free_record == NOT_FOUND && header.last_record == NOT_FOUND {
            if let Placement::Tail = placement {
                return self.create_first_record(header, data);
            }
        }

        if let Some(found) = self.take_from_free_list(header, data, placement)? {
            return Ok(found);
        }

        self.append_record(header, data, placement)
    }

    fn new_record_header(&self, data: &[u8], capacity: u32) -> RecordHeader {
        RecordHeader {
            next: NOT_FOUND,
            previous: NOT_FOUND,
            bit_flags: 0,
            record_capacity: capacity,
            data_length: data.len() as u32,
            data_checksum: adler32(data),
            head_checksum: 0,
        }
    }

    /// First record of an empty store goes right after the storage header.
    fn create_first_record(
        &self,
        header: &mut StorageHeader,
        data: &[u8],
    ) -> Result<(u64, RecordHeader)> {
        let offset = STORAGE_HEADER_SIZE as u64;
        let mut record = self.new_record_header(data, data.len() as u32);

        self.write_record(offset, &mut record, data)?;

        header.first_record = offset;
        header.last_record = offset;
        header.end_of_data = offset + RECORD_HEADER_SIZE as u64 + data.len() as u64;
        header.total_records += 1;
        self.write_storage_header(header)?;

        Ok((offset, record))
    }

    /// Appends a fresh slot of exactly `data.len()` capacity at end of
    /// data.
    fn append_record(
        &self,
        header: &mut StorageHeader,
        data: &[u8],
        placement: Placement,
    ) -> Result<(u64, RecordHeader)> {
        let offset = header.end_of_data;
        let mut record = self.new_record_header(data, data.len() as u32);

        match placement {
            Placement::Tail => {
                record.previous = header.last_record;
                record.next = NOT_FOUND;
            }
            Placement::Linked { previous, next } => {
                record.previous = previous;
                record.next = next;
            }
        }

        self.write_record(offset, &mut record, data)?;

        if let Placement::Tail = placement {
            let last_offset = header.last_record;
            if last_offset != NOT_FOUND {
                let _guard = self.locks.lock_exclusive(last_offset);
                let mut last = self.read_record_header(last_offset)?;
                last.next = offset;
                self.write_record_header(last_offset, &mut last)?;
            } else {
                // live list was empty, the new record is head and tail
                header.first_record = offset;
            }

            header.last_record = offset;
            header.total_records += 1;
        }

        header.end_of_data = offset + RECORD_HEADER_SIZE as u64 + data.len() as u64;
        self.write_storage_header(header)?;

        Ok((offset, record))
    }

    /// Scans up to `free_lookup_depth` free records for one whose capacity
    /// fits, unchains it and turns it back into a live record. The free
    /// list is only ever rewritten under the exclusive header lock the
    /// caller holds, so the scan needs no record locks of its own.
    fn take_from_free_list(
        &self,
        header: &mut StorageHeader,
        data: &[u8],
        placement: Placement,
    ) -> Result<Option<(u64, RecordHeader)>> {
        if header.total_free_records == 0 {
            return Ok(None);
        }

        let capacity = data.len() as u32;
        let depth = self.free_lookup_depth.load(Ordering::Acquire);

        let mut offset = header.first_free_record;
        let mut iterations = 0u64;

        while offset != NOT_FOUND && iterations < depth {
            let free = self.read_record_header(offset)?;
            if !free.is_deleted() {
                log::warn!("free list entry at offset {offset} is not marked deleted");
                return Err(Error::RecordNotDeleted);
            }

            if free.record_capacity >= capacity {
                self.unlink_free_record(header, &free)?;

                let mut record = self.new_record_header(data, free.record_capacity);
                record.bit_flags = free.bit_flags & !RECORD_DELETED_FLAG;
                match placement {
                    Placement::Tail => {
                        record.previous = header.last_record;
                        record.next = NOT_FOUND;
                    }
                    Placement::Linked { previous, next } => {
                        record.previous = previous;
                        record.next = next;
                    }
                }

                self.write_record(offset, &mut record, data)?;

                if let Placement::Tail = placement {
                    let last_offset = header.last_record;
                    if last_offset != NOT_FOUND {
                        let _guard = self.locks.lock_exclusive(last_offset);
                        let mut last = self.read_record_header(last_offset)?;
                        last.next = offset;
                        self.write_record_header(last_offset, &mut last)?;
                    } else {
                        header.first_record = offset;
                    }

                    header.last_record = offset;
                    header.total_records += 1;
                }

                self.write_storage_header(header)?;
                return Ok(Some((offset, record)));
            }

            offset = free.next;
            iterations += 1;
        }

        Ok(None)
    }

    //
    // Free list
    //

    /// Marks the record at `offset` deleted and chains it to the free list
    /// tail. Record bytes are written before the storage header counters;
    /// the caller persists the header afterwards.
    pub(crate) fn add_to_free_list(&self, header: &mut StorageHeader, offset: u64) -> Result<()> {
        let mut record = {
            let _guard = self.locks.lock_shared(offset);
            self.read_record_header(offset)?
        };
        if record.is_deleted() {
            return Err(Error::RecordDeleted(offset));
        }

        let previous_free = header.last_free_record;

        record.next = NOT_FOUND;
        record.previous = previous_free;
        record.data_length = 0;
        record.data_checksum = 0;
        record.bit_flags |= RECORD_DELETED_FLAG;
        {
            let _guard = self.locks.lock_exclusive(offset);
            self.write_record_header(offset, &mut record)?;
        }

        if previous_free != NOT_FOUND {
            let _guard = self.locks.lock_exclusive(previous_free);
            let mut previous = self.read_record_header(previous_free)?;
            previous.next = offset;
            self.write_record_header(previous_free, &mut previous)?;
        }

        if header.first_free_record == NOT_FOUND {
            header.first_free_record = offset;
        }
        header.last_free_record = offset;
        header.total_free_records += 1;

        Ok(())
    }

    /// Unchains a free record from the free list, the four-case mirror of
    /// live list removal. Refuses records whose deleted bit is clear; that
    /// means the two lists lost consistency somewhere.
    fn unlink_free_record(&self, header: &mut StorageHeader, free: &RecordHeader) -> Result<()> {
        if !free.is_deleted() {
            log::warn!("refusing to unchain a free record that is not marked deleted");
            return Err(Error::RecordNotDeleted);
        }

        let left = free.previous;
        let right = free.next;

        match (left != NOT_FOUND, right != NOT_FOUND) {
            (true, true) => {
                if left == right {
                    return Err(Error::RecordHeaderCorrupt(left));
                }
                let (lo, hi) = (left.min(right), left.max(right));
                let _lo_guard = self.locks.lock_exclusive(lo);
                let _hi_guard = self.locks.lock_exclusive(hi);

                let mut left_header = self.read_record_header(left)?;
                let mut right_header = self.read_record_header(right)?;
                left_header.next = right;
                right_header.previous = left;
                self.write_record_header(left, &mut left_header)?;
                self.write_record_header(right, &mut right_header)?;
            }
            (true, false) => {
                let _guard = self.locks.lock_exclusive(left);
                let mut left_header = self.read_record_header(left)?;
                left_header.next = NOT_FOUND;
                self.write_record_header(left, &mut left_header)?;

                header.last_free_record = left;
            }
            (false, true) => {
                let _guard = self.locks.lock_exclusive(right);
                let mut right_header = self.read_record_header(right)?;
                right_header.previous = NOT_FOUND;
                self.write_record_header(right, &mut right_header)?;

                header.first_free_record = right;
            }
            (false, false) => {
                header.first_free_record = NOT_FOUND;
                header.last_free_record = NOT_FOUND;
            }
        }

        header.total_free_records -= 1;
        Ok(())
    }

    //
    // Internals shared with the cursor
    //

    pub(crate) fn cache(&self) -> &PagedCache {
        &self.cache
    }

    pub(crate) fn lock_table(&self) -> &LockTable {
        &self.locks
    }

    pub(crate) fn header_mut(&self) -> RwLockWriteGuard<'_, StorageHeader> {
        self.header.write()
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
