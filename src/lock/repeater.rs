//! Retry and lock-escalation orchestrator for mutating statements.
//!
//! Every write path runs through a [`Repeater`] with a declared resource set.
//! The policy escalates in three phases: optimistic attempts that absorb
//! deadlocks with jittered backoff, a bounded number of unlocked retries once
//! the declared locks test free, and finally acquisition of the full sorted
//! lock set for the remaining deadline.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::Rng;
use sqlx::{Connection, MySqlConnection};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::{Result, StorageError};

use super::resource::{self, Resource};

/// Deadlock retries granted before escalating past the optimistic phase.
const DEADLOCK_THRESHOLD: u32 = 5;

/// Unlocked retries granted while the declared resources test free.
const FREE_RETRIES: u32 = 3;

/// Upper bound of the jittered backoff between deadlock retries.
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// A unit of work the Repeater can run repeatedly against a session.
///
/// Implementations must be re-runnable: a batch that deadlocks is rolled
/// back and executed again from the top. Closures of the shape
/// `|conn: &mut MySqlConnection| async move { … }.boxed()` implement this
/// through the blanket impl below; the write-only transaction implements it
/// directly for its buffered command list.
pub(crate) trait RepeatAction<T> {
    fn run<'c>(&'c mut self, conn: &'c mut MySqlConnection) -> BoxFuture<'c, Result<T>>;
}

impl<T, F> RepeatAction<T> for F
where
    F: for<'c> FnMut(&'c mut MySqlConnection) -> BoxFuture<'c, Result<T>>,
{
    fn run<'c>(&'c mut self, conn: &'c mut MySqlConnection) -> BoxFuture<'c, Result<T>> {
        (self)(conn)
    }
}

/// Forces the higher-ranked closure signature `RepeatAction` requires.
///
/// Closures passed directly to [`Repeater::run_single`]/[`Repeater::run_batch`]
/// that capture outer references sometimes get inferred with a concrete
/// (rather than higher-ranked) lifetime, which the current type system
/// cannot reconcile with the blanket impl above. Routing the closure through
/// this identity function, whose signature states the required bound
/// explicitly, steers inference to the higher-ranked form without changing
/// the closure's behavior.
pub(crate) fn action<T, F>(f: F) -> F
where
    F: for<'c> FnMut(&'c mut MySqlConnection) -> BoxFuture<'c, Result<T>>,
{
    f
}

enum Mode {
    /// The action runs without an outer transaction.
    Single,
    /// Each attempt is wrapped in `BEGIN … COMMIT`, rolled back on error.
    Batch,
}

pub(crate) struct Repeater<'a> {
    prefix: &'a str,
    resources: &'a BTreeSet<Resource>,
    timeout: Duration,
    cancel: &'a CancellationToken,
}

impl<'a> Repeater<'a> {
    pub(crate) fn new(
        prefix: &'a str,
        resources: &'a BTreeSet<Resource>,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> Self {
        Repeater {
            prefix,
            resources,
            timeout,
            cancel,
        }
    }

    /// Runs a single-statement action, retrying through deadlocks.
    pub(crate) async fn run_single<T>(
        &self,
        session: &mut MySqlConnection,
        mut action: impl RepeatAction<T>,
    ) -> Result<T> {
        self.execute(session, Mode::Single, &mut action).await
    }

    /// Runs a multi-statement action inside a transaction per attempt,
    /// committing on success and rolling back on any error.
    pub(crate) async fn run_batch<T>(
        &self,
        session: &mut MySqlConnection,
        mut action: impl RepeatAction<T>,
    ) -> Result<T> {
        self.execute(session, Mode::Batch, &mut action).await
    }

    async fn execute<T>(
        &self,
        session: &mut MySqlConnection,
        mode: Mode,
        action: &mut dyn RepeatAction<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + self.timeout;
        let mut deadlocks: u32 = 0;

        // Phase one: optimistic, no locks held.
        let mut last_err = loop {
            if self.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            match attempt_once(session, &mode, action).await {
                Ok(value) => {
                    self.log_resolution(deadlocks);
                    return Ok(value);
                }
                Err(error) if error.is_deadlock() => {
                    deadlocks += 1;
                    if Instant::now() >= deadline {
                        return Err(error.into_retries_exhausted(self.timeout));
                    }
                    if deadlocks >= DEADLOCK_THRESHOLD {
                        break error;
                    }
                    self.backoff(deadline).await?;
                }
                Err(error) => return Err(error),
            }
        };

        // Phase two: the declared resources look free, so the contention is
        // with row locks rather than lock holders. A few more unlocked
        // attempts are cheap.
        let mut free_retries = 0;
        while free_retries < FREE_RETRIES
            && resource::all_free_or_held_by_session(session, self.prefix, self.resources).await?
        {
            if self.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(last_err.into_retries_exhausted(self.timeout));
            }
            match attempt_once(session, &mode, action).await {
                Ok(value) => {
                    self.log_resolution(deadlocks);
                    return Ok(value);
                }
                Err(error) if error.is_deadlock() => {
                    deadlocks += 1;
                    free_retries += 1;
                    last_err = error;
                    self.backoff(deadline).await?;
                }
                Err(error) => return Err(error),
            }
        }

        // Phase three: take every declared lock and run to completion.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let acquired =
            resource::acquire_all(session, self.prefix, self.resources, remaining, self.cancel)
                .await?;

        let result = loop {
            if self.cancel.is_cancelled() {
                break Err(StorageError::Cancelled);
            }
            match attempt_once(session, &mode, action).await {
                Ok(value) => {
                    self.log_resolution(deadlocks);
                    break Ok(value);
                }
                Err(error) if error.is_deadlock() => {
                    deadlocks += 1;
                    if Instant::now() >= deadline {
                        break Err(error.into_retries_exhausted(self.timeout));
                    }
                    if let Err(cancelled) = self.backoff(deadline).await {
                        break Err(cancelled);
                    }
                }
                Err(error) => break Err(error),
            }
        };

        resource::release_many(session, &acquired).await;
        result
    }

    async fn backoff(&self, deadline: Instant) -> Result<()> {
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=MAX_BACKOFF);
        let wait = jitter.min(deadline.saturating_duration_since(Instant::now()));
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    /// Bursts below the threshold stay silent; anything that needed
    /// escalation is worth a trace in the logs.
    fn log_resolution(&self, deadlocks: u32) {
        if deadlocks >= DEADLOCK_THRESHOLD {
            warn!(
                deadlocks,
                resources = ?self.resources,
                "Statement resolved after repeated database deadlocks"
            );
        }
    }
}

async fn attempt_once<T>(
    session: &mut MySqlConnection,
    mode: &Mode,
    action: &mut dyn RepeatAction<T>,
) -> Result<T> {
    match mode {
        Mode::Single => action.run(session).await,
        Mode::Batch => {
            let mut tx = session.begin().await?;
            match action.run(tx.as_mut()).await {
                Ok(value) => {
                    tx.commit().await?;
                    Ok(value)
                }
                Err(error) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = ?rollback, "Failed to roll back batch attempt");
                    }
                    Err(error)
                }
            }
        }
    }
}
