use std::collections::HashSet;
use std::thread;

use knowstore::storage::record::{RECORD_HEADER_SIZE, STORAGE_HEADER_SIZE};
use knowstore::{MIN_CACHE_SIZE, NOT_FOUND, RecordStore};

fn scratch_store() -> anyhow::Result<(tempfile::TempDir, RecordStore)> {
    let dir = tempfile::tempdir()?;
    let store = RecordStore::open(dir.path().join("records.db"), false, MIN_CACHE_SIZE)?;
    Ok((dir, store))
}

/// Walks the live list forward and returns every payload.
fn collect_ascending(store: &RecordStore) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut result = Vec::new();
    if let Some(mut cursor) = store.first_record()? {
        result.push(cursor.data()?);
        while cursor.next()? {
            result.push(cursor.data()?);
        }
    }
    Ok(result)
}

/// Walks the live list backward and returns every payload.
fn collect_descending(store: &RecordStore) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut result = Vec::new();
    if let Some(mut cursor) = store.last_record()? {
        result.push(cursor.data()?);
        while cursor.previous()? {
            result.push(cursor.data()?);
        }
    }
    Ok(result)
}

#[test]
fn minimal_create_read() -> anyhow::Result<()> {
    let (_dir, store) = scratch_store()?;

    let created = store.create_record(b"hello")?;
    assert_eq!(created.position(), STORAGE_HEADER_SIZE as u64);

    let first = store.first_record()?.unwrap();
    assert_eq!(first.data()?, b"hello");
    assert_eq!(store.total_records(), 1);

    let last = store.last_record()?.unwrap();
    assert_eq!(first.position(), 64);
    assert_eq!(last.position(), 64);

    Ok(())
}

#[test]
fn ascending_and_descending_traversal() -> anyhow::Result<()> {
    let (_dir, store) = scratch_store()?;

    let payloads: Vec<Vec<u8>> = (0..10).map(|i| format!("r{i}").into_bytes()).collect();
    for payload in &payloads {
        store.create_record(payload)?;
    }

    assert_eq!(store.total_records(), 10);
    assert_eq!(collect_ascending(&store)?, payloads);

    let reversed: Vec<Vec<u8>> = payloads.into_iter().rev().collect();
    assert_eq!(collect_descending(&store)?, reversed);

    Ok(())
}

#[test]
fn remove_even_records_and_reinsert() -> anyhow::Result<()> {
    let (_dir, store) = scratch_store()?;

    let payloads: Vec<Vec<u8>> = (0..1000).map(|i| format!("rec#{i}").into_bytes()).collect();
    let mut offsets = Vec::with_capacity(1000);
    for payload in &payloads {
        offsets.push(store.create_record(payload)?.position());
    }

    // drop every even-indexed record
    let mut freed = Vec::new();
    for i in (0..1000).step_by(2) {
        let mut cursor = store.record_at(offsets[i])?;
        store.remove_record(&mut cursor)?;
        freed.push(offsets[i]);
    }

    assert_eq!(store.total_records(), 500);
    assert_eq!(store.total_free_records(), 500);

    // odd records survive, in order
    let expected: Vec<Vec<u8>> = (0..1000)
        .filter(|i| i % 2 == 1)
        .map(|i| format!("rec#{i}").into_bytes())
        .collect();
    assert_eq!(collect_ascending(&store)?, expected);

    // reinserting payloads of the same sizes recycles the freed slots,
    // in free list order, without growing the data area
    let end_before = store.end_of_data();
    for (i, &expected_offset) in freed.iter().enumerate() {
        let cursor = store.create_record(format!("rec#{}", i * 2).as_bytes())?;
        assert_eq!(cursor.position(), expected_offset);
    }

    assert_eq!(store.total_records(), 1000);
    assert_eq!(store.total_free_records(), 0);
    assert_eq!(store.end_of_data(), end_before);

    Ok(())
}

#[test]
fn in_place_update() -> anyhow::Result<()> {
    let (_dir, store) = scratch_store()?;

    // a 64 byte record gives the slot 64 bytes of capacity
    let mut cursor = store.create_record(&[b'x'; 64])?;
    let offset = cursor.position();
    assert_eq!(cursor.record_capacity(), 64);

    cursor.set_data(b"abc")?;
    assert_eq!(cursor.position(), offset);
    assert_eq!(cursor.data_length(), 3);

    cursor.set_data(b"abcdef")?;
    assert_eq!(cursor.position(), offset);
    assert_eq!(cursor.data_length(), 6);
    assert_eq!(cursor.data()?, b"abcdef");

    Ok(())
}

#[test]
fn relocating_update() -> anyhow::Result<()> {
    let (_dir, store) = scratch_store()?;

    let mut cursor = store.create_record(b"12345678")?;
    let old_offset = cursor.position();

    cursor.set_data(b"12345678901234567890")?;
    assert_ne!(cursor.position(), old_offset);
    assert_eq!(cursor.data()?, b"12345678901234567890");

    assert_eq!(store.total_records(), 1);
    assert_eq!(store.total_free_records(), 1);
    assert_eq!(store.first_record()?.unwrap().position(), cursor.position());
    assert_eq!(store.last_record()?.unwrap().position(), cursor.position());

    Ok(())
}

#[test]
fn concurrent_writers() -> anyhow::Result<()> {
    const WRITERS: usize = 4;
    const RECORDS_PER_WRITER: usize = 10_000;

    let dir = tempfile::tempdir()?;
    let store = RecordStore::open(dir.path().join("records.db"), false, 4 * MIN_CACHE_SIZE)?;

    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let store = &store;
            scope.spawn(move || {
                for i in 0..RECORDS_PER_WRITER {
                    let payload = format!("writer{writer:02}-record{i:05}");
                    store
                        .create_record(payload.as_bytes())
                        .expect("create_record failed");
                }
            });
        }
    });

    assert_eq!(store.total_records(), (WRITERS * RECORDS_PER_WRITER) as u64);

    let mut expected = HashSet::new();
    for writer in 0..WRITERS {
        for i in 0..RECORDS_PER_WRITER {
            expected.insert(format!("writer{writer:02}-record{i:05}").into_bytes());
        }
    }

    // every payload is reachable exactly once and its checksum validates
    let seen = collect_ascending(&store)?;
    assert_eq!(seen.len(), WRITERS * RECORDS_PER_WRITER);
    let seen: HashSet<Vec<u8>> = seen.into_iter().collect();
    assert_eq!(seen, expected);

    Ok(())
}

#[test]
fn flipped_payload_bit_is_detected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("records.db");

    let offset = {
        let store = RecordStore::open(&path, false, MIN_CACHE_SIZE)?;
        let offset = store.create_record(b"precious data")?.position();
        store.close()?;
        offset
    };

    // flip one payload bit behind the engine's back
    let mut raw = std::fs::read(&path)?;
    let payload_at = offset as usize + RECORD_HEADER_SIZE;
    raw[payload_at + 3] ^= 0x08;
    std::fs::write(&path, &raw)?;

    let store = RecordStore::open(&path, false, MIN_CACHE_SIZE)?;
    let cursor = store.record_at(offset)?;
    assert!(cursor.data().is_err());

    Ok(())
}

#[test]
fn flipped_header_bit_is_detected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("records.db");

    let offset = {
        let store = RecordStore::open(&path, false, MIN_CACHE_SIZE)?;
        let offset = store.create_record(b"precious data")?.position();
        store.close()?;
        offset
    };

    let mut raw = std::fs::read(&path)?;
    raw[offset as usize + 8] ^= 0x01; // inside the `previous` field
    std::fs::write(&path, &raw)?;

    let store = RecordStore::open(&path, false, MIN_CACHE_SIZE)?;
    assert!(store.record_at(offset).is_err());

    Ok(())
}

#[test]
fn end_of_data_is_monotonic_and_within_file() -> anyhow::Result<()> {
    let (_dir, store) = scratch_store()?;

    let mut high_water = store.end_of_data();

    let mut offsets = Vec::new();
    for i in 0..100 {
        offsets.push(store.create_record(format!("row {i}").as_bytes())?.position());
        let end = store.end_of_data();
        assert!(end >= high_water);
        high_water = end;
    }

    for offset in offsets.iter().take(50) {
        let mut cursor = store.record_at(*offset)?;
        store.remove_record(&mut cursor)?;
        let end = store.end_of_data();
        assert!(end >= high_water);
        high_water = end;
    }

    store.flush()?;
    assert!(store.end_of_data() <= store.file_size()?);

    Ok(())
}

#[test]
fn traversal_matches_counts_after_churn() -> anyhow::Result<()> {
    let (_dir, store) = scratch_store()?;

    let mut offsets = Vec::new();
    for i in 0..200 {
        offsets.push(store.create_record(format!("item-{i:03}").as_bytes())?.position());
    }

    // remove a third of them, scattered
    for i in (0..200).step_by(3) {
        let mut cursor = store.record_at(offsets[i])?;
        store.remove_record(&mut cursor)?;
    }

    let forward = collect_ascending(&store)?;
    let backward = collect_descending(&store)?;

    assert_eq!(forward.len() as u64, store.total_records());
    assert_eq!(backward.len(), forward.len());

    let reversed: Vec<Vec<u8>> = backward.into_iter().rev().collect();
    assert_eq!(forward, reversed);

    Ok(())
}

#[test]
fn removed_cursor_position_is_not_found() -> anyhow::Result<()> {
    let (_dir, store) = scratch_store()?;

    let mut cursor = store.create_record(b"only")?;
    store.remove_record(&mut cursor)?;

    assert_eq!(cursor.position(), NOT_FOUND);
    assert_eq!(cursor.data_length(), 0);
    assert_eq!(cursor.next_position(), NOT_FOUND);
    assert!(store.remove_record(&mut cursor).is_err());

    Ok(())
}
