//! Primitives over MySQL's session-scoped named locks.
//!
//! A named lock belongs to the session that acquired it; only that session
//! can release it. Callers therefore always pass the one connection they own,
//! and the pool wipes every session with `RELEASE_ALL_LOCKS` before reuse.

use std::time::{Duration, Instant};

use sqlx::MySqlConnection;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::{Result, StorageError};

/// Longest single `GET_LOCK` wait; keeps cancellation sub-second responsive
/// even though the server-side wait itself cannot be interrupted.
const MAX_LOCK_WAIT: Duration = Duration::from_secs(1);

/// Pause between non-blocking attempts once less than a second remains.
const SPIN_PAUSE: Duration = Duration::from_millis(50);

/// Acquires the named lock on this session, waiting up to `timeout`.
///
/// The first attempt is non-blocking; afterwards the wait is clipped to one
/// second per round so the cancellation token is observed promptly.
pub(crate) async fn acquire(
    conn: &mut MySqlConnection,
    name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    if try_acquire(conn, name, Duration::ZERO).await? {
        return Ok(());
    }

    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(StorageError::LockTimeout {
                name: name.to_string(),
                timeout,
            });
        }

        let wait = (deadline - now).min(MAX_LOCK_WAIT);
        if try_acquire(conn, name, wait).await? {
            return Ok(());
        }
        if wait < Duration::from_secs(1) {
            // GET_LOCK takes whole seconds, so the tail of the deadline is
            // covered by non-blocking attempts with a short pause between.
            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep(SPIN_PAUSE.min(wait)) => {}
            }
        }
    }
}

/// One `GET_LOCK` round; `wait` is truncated to whole seconds.
/// Returns false on `0` or `NULL`.
pub(crate) async fn try_acquire(
    conn: &mut MySqlConnection,
    name: &str,
    wait: Duration,
) -> Result<bool> {
    let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
        .bind(name)
        .bind(wait.as_secs() as i64)
        .fetch_one(&mut *conn)
        .await?;

    Ok(acquired == Some(1))
}

/// Releases one named lock. Failures are logged, never raised: by the time a
/// release runs, the guarded work is already done.
pub(crate) async fn release(conn: &mut MySqlConnection, name: &str) {
    let released = sqlx::query_scalar::<_, Option<i64>>("SELECT RELEASE_LOCK(?)")
        .bind(name)
        .fetch_one(&mut *conn)
        .await;

    match released {
        Ok(Some(1)) => {}
        Ok(other) => warn!(name, result = ?other, "Released a lock this session did not hold"),
        Err(error) => warn!(name, error = ?error, "Failed to release lock"),
    }
}

/// Drops every named lock held by this session. The pool recycler runs this
/// on every returned session so stale locks from crashed code paths cannot
/// leak into the next lease.
pub(crate) async fn release_all(conn: &mut MySqlConnection) -> Result<()> {
    sqlx::query("DO RELEASE_ALL_LOCKS()")
        .execute(&mut *conn)
        .await?;
    Ok(())
}
