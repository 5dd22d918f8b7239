//! Periodic roll-up of raw counter deltas into the aggregated table.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use indoc::formatdoc;
use sqlx::MySqlConnection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::StorageConfig;
use crate::errors::{Result, StorageError};
use crate::lock::repeater::Repeater;
use crate::lock::resource::Resource;
use crate::lock::session;
use crate::pool::SessionPool;
use crate::sql::Tables;

/// Raw rows consumed per pass. A pass that consumes exactly this many rows
/// signals that more work is waiting.
const PASS_SIZE: u64 = 1000;

/// Pause between back-to-back passes while the raw table still has rows.
const BETWEEN_PASS_SLEEP: Duration = Duration::from_millis(500);

/// How long to wait for the global aggregator lock before conceding the run
/// to whichever process holds it.
const AGGREGATOR_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Bounds the size of the raw counter table by folding deltas into
/// aggregated sums. Aggregation never changes the value that
/// [`get_counter`](crate::StorageConnection::get_counter) reports.
pub struct CountersAggregator {
    pool: SessionPool,
    tables: Arc<Tables>,
    interval: Duration,
    batch_timeout: Duration,
}

impl CountersAggregator {
    pub(crate) fn new(pool: SessionPool, tables: Arc<Tables>, config: &StorageConfig) -> Self {
        CountersAggregator {
            pool,
            tables,
            interval: config.counters_aggregate_interval,
            batch_timeout: config.transaction_timeout,
        }
    }

    /// Runs until cancelled: drains the raw table in passes, then sleeps the
    /// configured aggregation interval.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Counters aggregator started");

        loop {
            loop {
                if cancel.is_cancelled() {
                    info!("Counters aggregator stopped");
                    return;
                }

                let consumed = match self.execute_pass(&cancel).await {
                    Ok(consumed) => consumed,
                    Err(StorageError::Cancelled) => {
                        info!("Counters aggregator stopped");
                        return;
                    }
                    Err(error) => {
                        error!(error = ?error, "Counter aggregation pass failed");
                        break;
                    }
                };

                if consumed < PASS_SIZE {
                    break;
                }

                debug!(consumed, "Raw counter table still has rows, continuing");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Counters aggregator stopped");
                        return;
                    }
                    _ = tokio::time::sleep(BETWEEN_PASS_SLEEP) => {}
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Counters aggregator stopped");
    }

    /// One aggregation pass: folds up to a thousand raw rows into the
    /// aggregated table and deletes them. Returns the number of consumed raw
    /// rows; zero when another process holds the aggregator lock.
    pub async fn execute_pass(&self, cancel: &CancellationToken) -> Result<u64> {
        let mut lease = self.pool.lease().await?;

        let lock_name = format!("{}/CountersAggregator", self.tables.prefix);
        match session::acquire(&mut lease, &lock_name, AGGREGATOR_LOCK_WAIT, cancel).await {
            Ok(()) => {}
            Err(StorageError::LockTimeout { .. }) => {
                debug!("Another process is aggregating counters, skipping pass");
                lease.release().await;
                return Ok(0);
            }
            Err(error) => {
                lease.release().await;
                return Err(error);
            }
        }

        let resources = BTreeSet::from([Resource::Counter]);
        let repeater = Repeater::new(&self.tables.prefix, &resources, self.batch_timeout, cancel);

        let tables = &self.tables;
        let consumed = repeater
            .run_batch(&mut lease, |conn: &mut MySqlConnection| {
                async move { aggregate_once(conn, tables).await }.boxed()
            })
            .await;

        session::release(&mut lease, &lock_name).await;
        lease.release().await;

        consumed
    }
}

/// The temp table pins the exact set of rows the insert and the delete see,
/// so deltas appended mid-pass survive untouched for the next pass.
async fn aggregate_once(conn: &mut MySqlConnection, tables: &Tables) -> Result<u64> {
    sqlx::query("DROP TEMPORARY TABLE IF EXISTS `__counters_to_aggregate`")
        .execute(&mut *conn)
        .await?;

    let snapshot = formatdoc!(
        r#"
            CREATE TEMPORARY TABLE `__counters_to_aggregate` ENGINE=MEMORY AS
                SELECT `Id` FROM {counter} LIMIT {pass_size}
        "#,
        counter = tables.counter,
        pass_size = PASS_SIZE
    );
    sqlx::query(&snapshot).execute(&mut *conn).await?;

    let fold = formatdoc!(
        r#"
            INSERT INTO {aggregated_counter} (`Key`, `Value`, `ExpireAt`)
                SELECT c.`Key`, CAST(SUM(c.`Value`) AS SIGNED), MAX(c.`ExpireAt`)
                FROM {counter} c
                JOIN `__counters_to_aggregate` r ON r.`Id` = c.`Id`
                GROUP BY c.`Key`
            ON DUPLICATE KEY UPDATE
                `Value` = `Value` + VALUES(`Value`),
                `ExpireAt` = GREATEST(`ExpireAt`, VALUES(`ExpireAt`))
        "#,
        aggregated_counter = tables.aggregated_counter,
        counter = tables.counter
    );
    sqlx::query(&fold).execute(&mut *conn).await?;

    let purge = formatdoc!(
        r#"
            DELETE c FROM {counter} c
            JOIN `__counters_to_aggregate` r ON r.`Id` = c.`Id`
        "#,
        counter = tables.counter
    );
    let deleted = sqlx::query(&purge).execute(&mut *conn).await?;

    sqlx::query("DROP TEMPORARY TABLE `__counters_to_aggregate`")
        .execute(&mut *conn)
        .await?;

    Ok(deleted.rows_affected())
}
