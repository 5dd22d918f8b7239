//! Named, process-external mutual exclusion on its own borrowed session.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{Result, StorageError};
use crate::pool::{SessionLease, SessionPool};

use super::session;

/// How often a blocked acquisition re-tries the non-blocking `GET_LOCK`.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Hands out [`DistributedLock`]s for cross-process mutual exclusion.
///
/// The caller does not need to hold a session: the manager borrows one from
/// the pool for the fast path and, when it has to wait, a second one so the
/// blocking poll never ties up the initially borrowed session.
pub struct LockManager {
    pool: SessionPool,
    prefix: String,
}

impl LockManager {
    pub(crate) fn new(pool: SessionPool, prefix: String) -> Self {
        LockManager { pool, prefix }
    }

    /// Acquires the named lock, waiting up to `timeout`.
    ///
    /// The returned handle keeps the underlying session leased until the
    /// lock is released; the session is not shared with anyone else in the
    /// meantime, because only it can release the lock.
    pub async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DistributedLock> {
        let full_name = format!("{}/{name}", self.prefix);
        let deadline = Instant::now() + timeout;

        let mut lease = self.pool.lease().await?;
        if session::try_acquire(&mut lease, &full_name, Duration::ZERO).await? {
            return Ok(DistributedLock::new(lease, full_name));
        }
        lease.release().await;

        let mut waiter = self.pool.lease().await?;
        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::LockTimeout {
                    name: full_name,
                    timeout,
                });
            }

            if session::try_acquire(&mut waiter, &full_name, Duration::ZERO).await? {
                return Ok(DistributedLock::new(waiter, full_name));
            }

            let wait = ACQUIRE_POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// A held named lock. Dropping it releases the lock and returns the session
/// to the pool; [`DistributedLock::release`] does the same deterministically.
pub struct DistributedLock {
    lease: Option<SessionLease>,
    name: String,
}

impl DistributedLock {
    fn new(lease: SessionLease, name: String) -> Self {
        debug!(name, "Acquired distributed lock");
        DistributedLock {
            lease: Some(lease),
            name,
        }
    }

    /// Full advisory-lock name this handle holds.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the lock and returns the session to the pool.
    pub async fn release(mut self) {
        if let Some(mut lease) = self.lease.take() {
            session::release(&mut lease, &self.name).await;
            lease.release().await;
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            let name = std::mem::take(&mut self.name);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    session::release(&mut lease, &name).await;
                    lease.release().await;
                });
            }
            // Outside a runtime the lease drop closes the session, which
            // releases its locks server-side.
        }
    }
}
