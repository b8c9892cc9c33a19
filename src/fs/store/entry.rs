use std::sync::Arc;

use bson::Document;
use tracing::debug;

use crate::backend::{BackendError, Connection};
use crate::fs::entry::{EntryMetadata, FsEntry};
use crate::fs::errors::FsError;
use crate::fs::lock::LockManager;
use crate::fs::store::ChunkStore;

/// Whether a lookup should claim the advisory lock on its way through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Plain,
    Acquire,
}

/// CRUD and listing over entry documents.
#[derive(Clone)]
pub struct EntryStore {
    conn: Arc<Connection>,
    chunks: ChunkStore,
    locks: Arc<LockManager>,
}

impl EntryStore {
    pub fn new(conn: Arc<Connection>, chunks: ChunkStore, locks: Arc<LockManager>) -> Self {
        Self {
            conn,
            chunks,
            locks,
        }
    }

    /// Insert a new entry. The namespace is keyed by filename; inserting
    /// a taken name fails with `AlreadyExists` (callers are expected to
    /// have checked first).
    pub async fn create(&self, entry: &FsEntry) -> Result<(), FsError> {
        debug!("EntryStore::create({})", entry.filename);
        let doc = entry.to_document()?;
        let backend = self.conn.backend();
        self.conn
            .run("entry insert", || backend.insert_entry(&doc))
            .await
            .map_err(|e| match e {
                BackendError::Duplicate(_) => FsError::AlreadyExists,
                other => other.into(),
            })
    }

    /// Fetch an entry by filename. With `LockMode::Acquire`, the advisory
    /// lock is claimed as a side effect of the fetch when it is free or
    /// already ours; a foreign holder does not stop the lookup from
    /// returning the entry.
    pub async fn lookup(
        &self,
        filename: &str,
        lock: LockMode,
    ) -> Result<Option<FsEntry>, FsError> {
        let backend = self.conn.backend();
        if lock == LockMode::Acquire {
            let lock_id = self.locks.lock_id(filename);
            let claimed = self
                .conn
                .run("entry lock claim", || {
                    backend.find_and_lock_entry(filename, &lock_id)
                })
                .await?;
            if let Some(doc) = claimed {
                return Ok(Some(FsEntry::decode(&doc)?));
            }
            // Locked elsewhere or missing; a plain fetch settles which.
        }
        let doc = self
            .conn
            .run("entry lookup", || backend.find_entry(filename))
            .await?;
        doc.as_ref().map(FsEntry::decode).transpose()
    }

    pub async fn exists(&self, filename: &str) -> Result<bool, FsError> {
        Ok(self.lookup(filename, LockMode::Plain).await?.is_some())
    }

    /// Every entry whose parent is `parent`, in no particular order.
    pub async fn list_children(&self, parent: &str) -> Result<Vec<FsEntry>, FsError> {
        let backend = self.conn.backend();
        let docs = self
            .conn
            .run("directory listing", || backend.entries_in_directory(parent))
            .await?;
        docs.iter().map(FsEntry::decode).collect()
    }

    /// Delete an entry. A directory must be empty; a file loses its
    /// chunks first. The parent's link count is decremented afterwards.
    /// The emptiness check and the deletion are separate round trips, so
    /// a concurrent create can still slip a child in between them.
    pub async fn remove(&self, entry: &FsEntry) -> Result<(), FsError> {
        debug!("EntryStore::remove({})", entry.filename);
        let backend = self.conn.backend();
        if entry.is_directory() {
            let children = self
                .conn
                .run("child count", || backend.count_children(&entry.filename))
                .await?;
            if children != 0 {
                return Err(FsError::NotEmpty);
            }
        }
        if entry.is_file() {
            self.chunks.release(entry).await?;
        }
        self.conn
            .run("entry delete", || backend.delete_entry(&entry.id))
            .await?;
        self.set_link_count(&entry.directory, -1).await
    }

    /// Point the entry at a new filename. Chunks key off the entry id,
    /// so content needs no touching; any collision at the destination is
    /// the caller's to handle.
    pub async fn rename(&self, entry: &FsEntry, new_filename: &str) -> Result<(), FsError> {
        debug!("EntryStore::rename({} -> {})", entry.filename, new_filename);
        let backend = self.conn.backend();
        self.conn
            .run("entry rename", || {
                backend.rename_entry(&entry.id, new_filename)
            })
            .await?;
        Ok(())
    }

    /// Adjust a directory's link count by `delta` in one atomic update.
    pub async fn set_link_count(&self, directory: &str, delta: i64) -> Result<(), FsError> {
        let backend = self.conn.backend();
        self.conn
            .run("link count update", || {
                backend.bump_link_count(directory, delta)
            })
            .await?;
        Ok(())
    }

    /// Replace the entry's `metadata` and `attrs` wholesale.
    pub async fn save(
        &self,
        entry: &FsEntry,
        metadata: &EntryMetadata,
        attrs: &Document,
    ) -> Result<(), FsError> {
        debug!("EntryStore::save({})", entry.filename);
        let metadata = bson::to_document(metadata)
            .map_err(|e| FsError::InvalidData(format!("unencodable metadata: {e}")))?;
        let backend = self.conn.backend();
        self.conn
            .run("entry save", || {
                backend.replace_entry_fields(&entry.id, &metadata, attrs)
            })
            .await?;
        Ok(())
    }
}
