use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{error, warn};

use super::{Backend, BackendError};

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// The process-wide handle to the backing store, plus the retry policy
/// every store operation runs under.
///
/// Constructed once by the mount process and injected into each store.
/// A filesystem cannot answer the kernel with "try again later", so a
/// transient backend failure is never surfaced: the operation is retried
/// against a reconnected handle until it succeeds or the attempt budget
/// runs out, at which point the mount is abandoned and the process ends.
pub struct Connection {
    backend: Arc<dyn Backend>,
    attempt_budget: Duration,
    mount_path: Option<PathBuf>,
}

impl Connection {
    pub fn new(
        backend: Arc<dyn Backend>,
        attempt_budget: Duration,
        mount_path: Option<PathBuf>,
    ) -> Self {
        Self {
            backend,
            attempt_budget,
            mount_path,
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Run one backend primitive under the retry policy.
    ///
    /// `attempt` is re-invoked after every reconnect, so each try issues
    /// its call against the current handle. Transient failures are
    /// retried every 500 ms; once the time since the first failure of
    /// this call reaches the attempt budget the process is terminated.
    /// Non-transient errors return immediately.
    pub async fn run<T, Fut, F>(&self, op: &'static str, mut attempt: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut first_failure: Option<Instant> = None;
        loop {
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };
            let since = *first_failure.get_or_insert_with(Instant::now);
            if self.budget_exhausted(since) {
                self.abort(op, &err);
            }
            warn!("Connection::run({}): backend unreachable, retrying: {}", op, err);
            sleep(RETRY_DELAY).await;
            if let Err(e) = self.backend.reconnect().await {
                warn!("Connection::run({}): reconnect failed: {}", op, e);
            }
        }
    }

    fn budget_exhausted(&self, first_failure: Instant) -> bool {
        first_failure.elapsed() >= self.attempt_budget
    }

    /// A mount must never keep serving requests against a backend it
    /// cannot reach. Unmount as far as possible, then end the process;
    /// the exit is what actually releases the mount if the unmount could
    /// not complete while this process still serves it.
    fn abort(&self, op: &'static str, err: &BackendError) -> ! {
        error!(
            "Connection::run({}): backend unreachable for {:?}, abandoning the mount: {}",
            op, self.attempt_budget, err
        );
        if let Some(mount) = &self.mount_path {
            match std::process::Command::new("fusermount")
                .arg("-u")
                .arg(mount)
                .status()
            {
                Ok(status) => warn!("unmount of {}: {}", mount.display(), status),
                Err(e) => warn!("unmount of {} could not run: {}", mount.display(), e),
            }
        }
        std::process::exit(1);
    }
}
