pub mod entry;
pub mod errors;
pub mod lock;
pub mod store;

use std::sync::Arc;

use tracing::info;

use crate::backend::Connection;

pub use self::entry::{EntryKind, EntryMetadata, FsEntry};
pub use self::errors::FsError;
pub use self::lock::LockManager;
pub use self::store::{ChunkStore, EntryStore, LockMode};

pub const DEFAULT_CHUNK_SIZE: u64 = 255 * 1024;
pub const ROOT_PATH: &str = "/";

/// Filesystem-shaped view over one backend connection.
///
/// Construction bootstraps the root directory when it is missing, so a
/// `MongoFs` always points at a mountable tree.
#[derive(Clone)]
pub struct MongoFs {
    pub entries: EntryStore,
    pub chunks: ChunkStore,
    pub locks: Arc<LockManager>,
    pub conn: Arc<Connection>,
}

/// Entry and chunk counts, for the admin surface.
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub entries: u64,
    pub chunks: u64,
}

impl MongoFs {
    pub async fn new(conn: Arc<Connection>, hostname: &str) -> Result<Self, FsError> {
        let locks = Arc::new(LockManager::new(conn.clone(), hostname.to_string()));
        let chunks = ChunkStore::new(conn.clone());
        let entries = EntryStore::new(conn.clone(), chunks.clone(), locks.clone());
        let fs = Self {
            entries,
            chunks,
            locks,
            conn,
        };
        fs.ensure_root().await?;
        Ok(fs)
    }

    /// Create the root directory entry unless somebody else already has.
    async fn ensure_root(&self) -> Result<(), FsError> {
        if self.entries.exists(ROOT_PATH).await? {
            return Ok(());
        }
        info!("Bootstrapping root directory");
        let root = FsEntry::new_directory(ROOT_PATH, EntryMetadata::directory(0o755, 0, 0));
        match self.entries.create(&root).await {
            // A concurrent mount won the race; the tree is usable either way.
            Ok(()) | Err(FsError::AlreadyExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn stats(&self) -> Result<EngineStats, FsError> {
        let backend = self.conn.backend();
        let entries = self
            .conn
            .run("entry count", || backend.count_entries())
            .await?;
        let chunks = self
            .conn
            .run("chunk count", || backend.count_chunks())
            .await?;
        Ok(EngineStats { entries, chunks })
    }

    /// Drop every entry and chunk, root included. `new` recreates the
    /// root on the next connection.
    pub async fn purge(&self) -> Result<(), FsError> {
        let backend = self.conn.backend();
        self.conn.run("purge", || backend.purge()).await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn new_in_memory() -> Self {
        use std::time::Duration;

        use crate::backend::MemoryBackend;

        let conn = Arc::new(Connection::new(
            Arc::new(MemoryBackend::new()),
            Duration::from_secs(60),
            None,
        ));
        Self::new(conn, "testhost").await.unwrap()
    }
}
