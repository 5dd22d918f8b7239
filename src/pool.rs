//! Bounded pool of raw MySQL sessions.
//!
//! Advisory locks are session-scoped, so lock carriers must be whole owned
//! connections rather than leases from a shared driver pool that interleaves
//! statements from different callers. A [`SessionLease`] hands out exclusive
//! access to one session; returning it runs the recycler, which wipes any
//! named locks the session still holds before the session becomes reusable.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::mysql::MySqlConnectOptions;
use sqlx::{ConnectOptions, Connection, MySqlConnection};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::lock::session;

/// Cadence of the idle-trimming maintenance task.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub(crate) struct SessionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connect_options: MySqlConnectOptions,
    min_size: usize,
    max_size: usize,
    idle: Mutex<VecDeque<MySqlConnection>>,
    shutdown: CancellationToken,
}

impl SessionPool {
    /// Builds the pool and starts its maintenance task. Must be called from
    /// within a tokio runtime.
    pub(crate) fn new(
        connect_options: MySqlConnectOptions,
        min_size: usize,
        max_size: usize,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            connect_options,
            min_size,
            max_size,
            idle: Mutex::new(VecDeque::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(maintenance(Arc::clone(&inner)));

        SessionPool { inner }
    }

    /// Borrows a session: an idle one when available, a fresh connection
    /// otherwise. The cap is enforced at recycle time, not here.
    pub(crate) async fn lease(&self) -> Result<SessionLease> {
        let reused = self.inner.idle.lock().expect("pool mutex poisoned").pop_front();

        let conn = match reused {
            Some(conn) => conn,
            None => self.inner.connect_options.connect().await?,
        };

        Ok(SessionLease {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Stops maintenance and closes every idle session. Leases outstanding at
    /// this point close their sessions on return instead of re-enqueuing.
    pub(crate) async fn close(&self) {
        self.inner.shutdown.cancel();

        let drained: Vec<MySqlConnection> = {
            let mut idle = self.inner.idle.lock().expect("pool mutex poisoned");
            idle.drain(..).collect()
        };
        for conn in drained {
            if let Err(error) = conn.close().await {
                debug!(error = ?error, "Failed to close pooled session cleanly");
            }
        }
    }
}

/// Exclusive access to one pooled session.
///
/// Dropping the lease recycles the session asynchronously; use
/// [`SessionLease::release`] where the caller wants to await the recycle.
pub(crate) struct SessionLease {
    conn: Option<MySqlConnection>,
    pool: Arc<PoolInner>,
}

impl SessionLease {
    /// Returns the session to the pool, awaiting the recycle.
    pub(crate) async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            recycle(Arc::clone(&self.pool), conn).await;
        }
    }
}

impl Deref for SessionLease {
    type Target = MySqlConnection;

    fn deref(&self) -> &MySqlConnection {
        self.conn.as_ref().expect("session lease already released")
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut MySqlConnection {
        self.conn.as_mut().expect("session lease already released")
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(recycle(pool, conn));
            }
            // Outside a runtime the connection is simply dropped.
        }
    }
}

async fn recycle(inner: Arc<PoolInner>, mut conn: MySqlConnection) {
    if inner.shutdown.is_cancelled() {
        let _ = conn.close().await;
        return;
    }

    // Stale locks from crashed code paths must not leak into the next lease.
    if let Err(error) = session::release_all(&mut conn).await {
        warn!(error = ?error, "Discarding session that failed lock cleanup");
        let _ = conn.close().await;
        return;
    }

    let rejected = {
        let mut idle = inner.idle.lock().expect("pool mutex poisoned");
        if idle.len() < inner.max_size && !inner.shutdown.is_cancelled() {
            idle.push_back(conn);
            None
        } else {
            Some(conn)
        }
    };

    if let Some(conn) = rejected {
        let _ = conn.close().await;
    }
}

/// Wakes every second and discards at most one idle session per tick while
/// the pool floats above its floor.
async fn maintenance(inner: Arc<PoolInner>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let surplus = {
            let mut idle = inner.idle.lock().expect("pool mutex poisoned");
            if idle.len() > inner.min_size {
                idle.pop_front()
            } else {
                None
            }
        };
        if let Some(conn) = surplus {
            let _ = conn.close().await;
        }
    }
}
