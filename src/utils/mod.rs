use thiserror::Error;

pub mod checksum;
pub mod io;

/// Utilities `Result` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Utilities `Error`.
#[derive(Debug, Error)]
pub enum Error {
    // io
    #[error("path is empty")]
    EmptyPath,
    #[error("can't open file {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("file is not open")]
    Closed,
    #[error("file is opened read only")]
    ReadOnly,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
