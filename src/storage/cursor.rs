use crate::utils::checksum::adler32;

use super::{
    Error, NOT_FOUND, Result,
    record::{RECORD_HEADER_SIZE, RecordHeader},
    store::{Placement, RecordStore},
};

/// Position in the live record list.
///
/// Carries a snapshot of the record header taken when the cursor was
/// created or last moved, so the plain accessors need no storage access. A
/// cursor borrows its store and never outlives it; it is invalidated when
/// its record is removed, and follows the record when an update relocates
/// it.
///
/// One cursor is not meant to be shared between threads, but any number of
/// independent cursors may work on the same store concurrently.
pub struct RecordCursor<'s> {
    store: &'s RecordStore,
    header: RecordHeader,
    position: u64,
}

impl<'s> RecordCursor<'s> {
    pub(crate) fn new(store: &'s RecordStore, header: RecordHeader, position: u64) -> Self {
        Self {
            store,
            header,
            position,
        }
    }

    /// Record offset in the file, or `NOT_FOUND` after invalidation.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Payload bytes currently stored in the record.
    pub fn data_length(&self) -> u32 {
        if self.position == NOT_FOUND {
            return 0;
        }
        self.header.data_length
    }

    /// Reserved payload capacity of the record slot.
    pub fn record_capacity(&self) -> u32 {
        if self.position == NOT_FOUND {
            return 0;
        }
        self.header.record_capacity
    }

    /// Offset of the next record, or `NOT_FOUND` at the tail.
    pub fn next_position(&self) -> u64 {
        if self.position == NOT_FOUND {
            return NOT_FOUND;
        }
        self.header.next
    }

    /// Offset of the previous record, or `NOT_FOUND` at the head.
    pub fn prev_position(&self) -> u64 {
        if self.position == NOT_FOUND {
            return NOT_FOUND;
        }
        self.header.previous
    }

    /// Re-reads the record header and checks that the record still is the
    /// one this cursor points at: present, checksum intact, not deleted,
    /// not rewritten since the snapshot was taken.
    pub fn is_valid(&self) -> bool {
        if self.position == NOT_FOUND {
            return false;
        }

        let sample = {
            let _guard = self.store.lock_table().lock_shared(self.position);
            self.store.read_record_header(self.position)
        };

        match sample {
            Ok(header) => {
                !header.is_deleted() && header.head_checksum == self.header.head_checksum
            }
            Err(_) => false,
        }
    }

    /// Reads the record payload and verifies it against the stored
    /// checksum.
    pub fn data(&self) -> Result<Vec<u8>> {
        if self.position == NOT_FOUND {
            return Err(Error::NotFound);
        }

        let (header, data) = {
            let _guard = self.store.lock_table().lock_shared(self.position);

            let header = self.store.read_record_header(self.position)?;
            if header.is_deleted() {
                return Err(Error::RecordDeleted(self.position));
            }

            let mut data = vec![0u8; header.data_length as usize];
            let read = self
                .store
                .cache()
                .read(self.position + RECORD_HEADER_SIZE as u64, &mut data)?;
            if read != data.len() {
                return Err(Error::IoShort {
                    op: "record data read",
                    expected: data.len(),
                    actual: read,
                });
            }

            (header, data)
        };

        if adler32(&data) != header.data_checksum {
            return Err(Error::RecordCorrupt(self.position));
        }

        Ok(data)
    }

    /// Overwrites the record payload. Fits into the existing slot when
    /// `data.len()` is within the record capacity; otherwise the record is
    /// relocated to a slot big enough, the old slot goes to the free list
    /// and the cursor follows to the new offset.
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        if self.store.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if self.position == NOT_FOUND {
            return Err(Error::NotFound);
        }
        if data.is_empty() {
            return Err(Error::ZeroLength);
        }
        if data.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument("record larger than 4 GiB"));
        }

        // in-place when the slot is big enough
        {
            let _guard = self.store.lock_table().lock_exclusive(self.position);

            let mut header = self.store.read_record_header(self.position)?;
            if header.is_deleted() {
                return Err(Error::RecordDeleted(self.position));
            }

            if data.len() <= header.record_capacity as usize {
                header.data_length = data.len() as u32;
                header.data_checksum = adler32(data);
                self.store.write_record_header(self.position, &mut header)?;

                let written = self
                    .store
                    .cache()
                    .write(self.position + RECORD_HEADER_SIZE as u64, data)?;
                if written != data.len() {
                    return Err(Error::IoShort {
                        op: "record data write",
                        expected: data.len(),
                        actual: written,
                    });
                }

                self.header = header;
                return Ok(());
            }
        }

        // not enough capacity, move the record to a larger slot
        let mut storage_header = self.store.header_mut();

        let old = {
            let _guard = self.store.lock_table().lock_exclusive(self.position);
            self.store.read_record_header(self.position)?
        };
        if old.is_deleted() {
            return Err(Error::RecordDeleted(self.position));
        }

        let (new_offset, new_header) = self.store.allocate_record(
            &mut storage_header,
            data,
            Placement::Linked {
                previous: old.previous,
                next: old.next,
            },
        )?;

        // rewire the live list neighbours to the new offset
        if old.previous != NOT_FOUND {
            let _guard = self.store.lock_table().lock_exclusive(old.previous);
            let mut left = self.store.read_record_header(old.previous)?;
            left.next = new_offset;
            self.store.write_record_header(old.previous, &mut left)?;
        }
        if old.next != NOT_FOUND {
            let _guard = self.store.lock_table().lock_exclusive(old.next);
            let mut right = self.store.read_record_header(old.next)?;
            right.previous = new_offset;
            self.store.write_record_header(old.next, &mut right)?;
        }

        if storage_header.first_record == self.position {
            storage_header.first_record = new_offset;
        }
        if storage_header.last_record == self.position {
            storage_header.last_record = new_offset;
        }

        self.store.add_to_free_list(&mut storage_header, self.position)?;
        self.store.write_storage_header(&storage_header)?;

        self.position = new_offset;
        self.header = new_header;
        Ok(())
    }

    /// Moves to the next record. Returns `false` at the tail or when the
    /// cursor is invalidated.
    pub fn next(&mut self) -> Result<bool> {
        if self.position == NOT_FOUND {
            return Ok(false);
        }

        let current = {
            let _guard = self.store.lock_table().lock_shared(self.position);
            self.store.read_record_header(self.position)?
        };
        if current.next == NOT_FOUND {
            return Ok(false);
        }

        self.set_position(current.next)?;
        Ok(true)
    }

    /// Moves to the previous record. Returns `false` at the head or when
    /// the cursor is invalidated.
    pub fn previous(&mut self) -> Result<bool> {
        if self.position == NOT_FOUND {
            return Ok(false);
        }

        let current = {
            let _guard = self.store.lock_table().lock_shared(self.position);
            self.store.read_record_header(self.position)?
        };
        if current.previous == NOT_FOUND {
            return Ok(false);
        }

        self.set_position(current.previous)?;
        Ok(true)
    }

    /// Detaches the cursor from its record; every further access fails.
    pub fn invalidate(&mut self) {
        self.position = NOT_FOUND;
        self.header = RecordHeader {
            next: NOT_FOUND,
            previous: NOT_FOUND,
            bit_flags: 0,
            record_capacity: 0,
            data_length: 0,
            data_checksum: 0,
            head_checksum: 0,
        };
    }

    /// Points the cursor at a neighbour after its record got removed.
    pub(crate) fn reposition(&mut self, offset: u64, header: RecordHeader) {
        self.position = offset;
        self.header = header;
    }

    fn set_position(&mut self, offset: u64) -> Result<()> {
        let header = {
            let _guard = self.store.lock_table().lock_shared(offset);
            self.store.read_record_header(offset)?
        };

        self.header = header;
        self.position = offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MIN_CACHE_SIZE;
    use crate::storage::store::RecordStore;

    fn scratch_store() -> anyhow::Result<(tempfile::TempDir, RecordStore)> {
        let dir = tempfile::tempdir()?;
        let store = RecordStore::open(dir.path().join("records.db"), false, MIN_CACHE_SIZE)?;
        Ok((dir, store))
    }

    #[test]
    fn data_round_trip() -> anyhow::Result<()> {
        let (_dir, store) = scratch_store()?;

        let cursor = store.create_record(b"hello")?;
        assert_eq!(cursor.data()?, b"hello");
        assert_eq!(cursor.data_length(), 5);
        assert_eq!(cursor.record_capacity(), 5);
        assert!(cursor.is_valid());

        Ok(())
    }

    #[test]
    fn traversal_both_directions() -> anyhow::Result<()> {
        let (_dir, store) = scratch_store()?;

        for i in 0..5 {
            store.create_record(format!("r{i}").as_bytes())?;
        }

        let mut cursor = store.first_record()?.unwrap();
        let mut seen = vec![cursor.data()?];
        while cursor.next()? {
            seen.push(cursor.data()?);
        }
        let ascending: Vec<Vec<u8>> = (0..5).map(|i| format!("r{i}").into_bytes()).collect();
        assert_eq!(seen, ascending);

        let mut cursor = store.last_record()?.unwrap();
        let mut seen = vec![cursor.data()?];
        while cursor.previous()? {
            seen.push(cursor.data()?);
        }
        let descending: Vec<Vec<u8>> = ascending.into_iter().rev().collect();
        assert_eq!(seen, descending);

        Ok(())
    }

    #[test]
    fn in_place_update_keeps_offset() -> anyhow::Result<()> {
        let (_dir, store) = scratch_store()?;

        let mut cursor = store.create_record(b"abcdef")?;
        let offset = cursor.position();

        cursor.set_data(b"abc")?;
        assert_eq!(cursor.position(), offset);
        assert_eq!(cursor.data_length(), 3);
        assert_eq!(cursor.record_capacity(), 6);
        assert_eq!(cursor.data()?, b"abc");

        // growing back within capacity also stays put
        cursor.set_data(b"fedcba")?;
        assert_eq!(cursor.position(), offset);
        assert_eq!(cursor.data()?, b"fedcba");

        Ok(())
    }

    #[test]
    fn growing_update_relocates_record() -> anyhow::Result<()> {
        let (_dir, store) = scratch_store()?;

        let mut cursor = store.create_record(b"12345678")?;
        let old_offset = cursor.position();

        cursor.set_data(b"twenty bytes of data")?;
        assert_ne!(cursor.position(), old_offset);
        assert_eq!(cursor.data()?, b"twenty bytes of data");

        // still a single live record, head and tail moved along
        assert_eq!(store.total_records(), 1);
        assert_eq!(store.total_free_records(), 1);
        let first = store.first_record()?.unwrap();
        assert_eq!(first.position(), cursor.position());
        let last = store.last_record()?.unwrap();
        assert_eq!(last.position(), cursor.position());

        // the old slot is reachable through the free list
        assert!(matches!(
            store.record_at(old_offset),
            Err(crate::storage::Error::RecordDeleted(_))
        ));

        Ok(())
    }

    #[test]
    fn relocation_in_the_middle_keeps_chain() -> anyhow::Result<()> {
        let (_dir, store) = scratch_store()?;

        store.create_record(b"head")?;
        let mut cursor = store.create_record(b"mid")?;
        store.create_record(b"tail")?;

        cursor.set_data(b"mid grew past its capacity")?;

        let mut walk = store.first_record()?.unwrap();
        let mut seen = vec![walk.data()?];
        while walk.next()? {
            seen.push(walk.data()?);
        }
        assert_eq!(
            seen,
            vec![
                b"head".to_vec(),
                b"mid grew past its capacity".to_vec(),
                b"tail".to_vec()
            ]
        );

        Ok(())
    }

    #[test]
    fn cursor_detects_removed_record() -> anyhow::Result<()> {
        let (_dir, store) = scratch_store()?;

        let stale = store.create_record(b"going away")?;
        let mut doomed = store.record_at(stale.position())?;
        store.remove_record(&mut doomed)?;

        assert!(!stale.is_valid());
        assert!(stale.data().is_err());

        Ok(())
    }

    #[test]
    fn set_data_rejects_empty_payload() -> anyhow::Result<()> {
        let (_dir, store) = scratch_store()?;

        let mut cursor = store.create_record(b"x")?;
        assert!(matches!(cursor.set_data(b""), Err(Error::ZeroLength)));

        Ok(())
    }
}
