use std::sync::Arc;

use tracing::debug;

use crate::backend::Connection;
use crate::fs::entry::FsEntry;
use crate::fs::errors::FsError;

/// Advisory lock protocol over the `lock` field of entry documents.
///
/// Identities are `"<filename>;<pid>;<host>"`. Nothing in this layer
/// blocks on a held lock; the bridge decides what a refusal means.
pub struct LockManager {
    conn: Arc<Connection>,
    hostname: String,
    pid: u32,
}

impl LockManager {
    pub fn new(conn: Arc<Connection>, hostname: String) -> Self {
        Self {
            conn,
            hostname,
            pid: std::process::id(),
        }
    }

    /// This process's lock identity for `filename`.
    pub fn lock_id(&self, filename: &str) -> String {
        format!("{};{};{}", filename, self.pid, self.hostname)
    }

    /// Administrative override identity: pid 0, shared by every process
    /// on this host.
    pub fn master_lock_id(&self, filename: &str) -> String {
        format!("{};0;{}", filename, self.hostname)
    }

    /// Claim the lock with this process's identity in one conditional
    /// update. Succeeds when the entry is unlocked or we already hold
    /// it; a foreign holder is left untouched.
    pub async fn try_lock(&self, entry: &FsEntry) -> Result<bool, FsError> {
        let lock_id = self.lock_id(&entry.filename);
        let backend = self.conn.backend();
        let claimed = self
            .conn
            .run("lock claim", || {
                backend.find_and_lock_entry(&entry.filename, &lock_id)
            })
            .await?;
        debug!(
            "LockManager::try_lock({}): {}",
            entry.filename,
            if claimed.is_some() { "claimed" } else { "refused" }
        );
        Ok(claimed.is_some())
    }

    /// Drop the lock no matter who holds it. Releasing an unlocked entry
    /// is a no-op.
    pub async fn unlock(&self, entry: &FsEntry) -> Result<(), FsError> {
        let backend = self.conn.backend();
        self.conn
            .run("lock release", || backend.clear_lock(&entry.filename))
            .await?;
        Ok(())
    }
}
