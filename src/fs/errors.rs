use thiserror::Error;

use crate::backend::BackendError;

/// Failures a store operation can hand back to the bridge.
///
/// A missing entry is not one of them: lookups return `Option`. Transient
/// backend trouble never appears here either; it is retried away or ends
/// the process.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("directory is not empty")]
    NotEmpty,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("write at offset {offset} would leave a gap past length {length}")]
    InvalidOffset { offset: u64, length: u64 },
    #[error("malformed entry document: {0}")]
    InvalidData(String),
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),
}
