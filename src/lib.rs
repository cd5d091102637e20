//! # knowstore
//!
//! Single-file, thread-safe embedded storage engine for variable-length
//! binary records, sitting on top of a page-cached block I/O layer.
//!
//! Many concurrent producers and consumers can create, read, update,
//! delete and traverse records of up to 4 GiB each against one file.
//! Record headers and payloads carry Adler-32 checksums, and the space of
//! deleted records is recycled through a free list.
//!
//! ```no_run
//! use knowstore::{DEFAULT_CACHE_SIZE, RecordStore};
//!
//! # fn main() -> knowstore::storage::Result<()> {
//! let store = RecordStore::open("knowledge.db", false, DEFAULT_CACHE_SIZE)?;
//!
//! let mut cursor = store.create_record(b"hello")?;
//! cursor.set_data(b"hello world")?;
//! assert_eq!(cursor.data()?, b"hello world");
//!
//! store.remove_record(&mut cursor)?;
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod storage;
pub mod utils;

pub use storage::{
    DEFAULT_CACHE_SIZE, MIN_CACHE_SIZE, NOT_FOUND, PAGE_SIZE,
    cache::{CacheStat, PagedCache},
    cursor::RecordCursor,
    store::RecordStore,
};
