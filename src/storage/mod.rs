use thiserror::Error;

pub mod cache;
pub mod cursor;
pub mod locks;
pub mod record;
pub mod store;

/// Index of a page inside the storage file.
pub type PageNumber = u64;

/// Size of single cache page in **bytes**.
pub const PAGE_SIZE: usize = 8192;
/// Smallest cache pool the engine will allocate.
pub const MIN_CACHE_SIZE: usize = 256 * 1024;
/// Cache pool used when the caller does not care.
pub const DEFAULT_CACHE_SIZE: usize = 1024 * 1024;

/// Sentinel used in place of a null offset, both in memory and on disk.
pub const NOT_FOUND: u64 = u64::MAX;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // storage header
    #[error("storage header is invalid or corrupt")]
    HeaderCorrupt,

    // records
    #[error("record header at offset {0} is corrupt")]
    RecordHeaderCorrupt(u64),
    #[error("record data at offset {0} does not match its checksum")]
    RecordCorrupt(u64),
    #[error("record at offset {0} is deleted")]
    RecordDeleted(u64),
    #[error("record not found")]
    NotFound,
    #[error("record on free list is not marked deleted")]
    RecordNotDeleted,
    #[error("record length must be greater than zero")]
    ZeroLength,

    // access mode
    #[error("storage is opened read only")]
    ReadOnly,

    // arguments
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    // io
    #[error("short {op}: expected {expected} bytes, got {actual}")]
    IoShort {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Utils(#[from] crate::utils::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
