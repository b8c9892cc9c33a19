use async_trait::async_trait;
use bson::Document;
use bson::oid::ObjectId;
use thiserror::Error;

pub mod conn;
pub mod memory;
pub mod mongo;

pub use conn::Connection;
pub use memory::MemoryBackend;
pub use mongo::MongoBackend;

#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend could not be reached. The only class the connection
    /// layer retries; everything else surfaces to the caller.
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("backend error: {0}")]
    Other(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unreachable(_))
    }
}

/// One stored chunk of file content.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: ObjectId,
    pub owner: ObjectId,
    pub index: u64,
    pub data: Vec<u8>,
}

/// Document-level primitives against the backing store.
///
/// Every method is a single backend round trip, so the connection layer
/// can retry each one independently. Entry documents travel as raw BSON;
/// decoding into typed entries happens above this seam. Implementations
/// must order chunk results by index.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Re-establish the underlying handle after a connectivity loss. All
    /// calls issued afterwards must observe the fresh handle.
    async fn reconnect(&self) -> Result<(), BackendError>;

    async fn insert_entry(&self, doc: &Document) -> Result<(), BackendError>;
    async fn find_entry(&self, filename: &str) -> Result<Option<Document>, BackendError>;
    /// Conditionally claim the advisory lock on an entry: matches only if
    /// the lock field is absent or already equals `lock_id`, sets it, and
    /// returns the updated document. `None` means no match (missing entry
    /// or a foreign holder).
    async fn find_and_lock_entry(
        &self,
        filename: &str,
        lock_id: &str,
    ) -> Result<Option<Document>, BackendError>;
    async fn clear_lock(&self, filename: &str) -> Result<(), BackendError>;
    /// All entries whose `directory` field equals `directory`. Listings
    /// must not be cut short by a server-side cursor idle timeout.
    async fn entries_in_directory(&self, directory: &str) -> Result<Vec<Document>, BackendError>;
    async fn count_children(&self, directory: &str) -> Result<u64, BackendError>;
    async fn delete_entry(&self, id: &ObjectId) -> Result<(), BackendError>;
    async fn rename_entry(&self, id: &ObjectId, new_filename: &str) -> Result<(), BackendError>;
    /// Atomic `$inc` on the entry's `metadata.st_nlink`; no read involved.
    async fn bump_link_count(&self, filename: &str, delta: i64) -> Result<(), BackendError>;
    /// Replace the `metadata` and `attrs` fields wholesale.
    async fn replace_entry_fields(
        &self,
        id: &ObjectId,
        metadata: &Document,
        attrs: &Document,
    ) -> Result<(), BackendError>;
    /// Record a new content length (both `length` and `metadata.st_size`).
    async fn set_entry_length(&self, id: &ObjectId, length: u64) -> Result<(), BackendError>;

    /// Chunks of `owner` with index in `first..=last`, ordered by index.
    async fn chunks_in_range(
        &self,
        owner: &ObjectId,
        first: u64,
        last: u64,
    ) -> Result<Vec<ChunkRecord>, BackendError>;
    async fn insert_chunk(
        &self,
        owner: &ObjectId,
        index: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;
    async fn replace_chunk_data(&self, id: &ObjectId, data: &[u8]) -> Result<(), BackendError>;
    async fn delete_chunks_from(&self, owner: &ObjectId, first: u64) -> Result<(), BackendError>;

    async fn count_entries(&self) -> Result<u64, BackendError>;
    async fn count_chunks(&self) -> Result<u64, BackendError>;
    /// Drop all stored entries and chunks. Development tool.
    async fn purge(&self) -> Result<(), BackendError>;
}
