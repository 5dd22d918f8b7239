//! Round-robin deletion of expired rows.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
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

/// Rows deleted per table per batch.
const BATCH_SIZE: u64 = 1000;

/// Pause between batches while expired rows are still being found.
const BETWEEN_BATCH_SLEEP: Duration = Duration::from_secs(1);

/// How long to wait for the global sweep lock before conceding the table to
/// whichever process holds it.
const SWEEP_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Deletes rows whose `ExpireAt` lies in the past, sweeping the five
/// expiring tables in a fixed round-robin order.
pub struct ExpirationManager {
    pool: SessionPool,
    tables: Arc<Tables>,
    check_interval: Duration,
    statement_timeout: Duration,
}

impl ExpirationManager {
    pub(crate) fn new(pool: SessionPool, tables: Arc<Tables>, config: &StorageConfig) -> Self {
        ExpirationManager {
            pool,
            tables,
            check_interval: config.job_expiration_check_interval,
            statement_timeout: config.transaction_timeout,
        }
    }

    /// The sweep order; each table pairs with the resource lock guarding it.
    fn targets(&self) -> [(&String, Resource); 5] {
        [
            (&self.tables.aggregated_counter, Resource::Counter),
            (&self.tables.job, Resource::Job),
            (&self.tables.list, Resource::List),
            (&self.tables.set, Resource::Set),
            (&self.tables.hash, Resource::Hash),
        ]
    }

    /// Runs until cancelled. A batch that deletes nothing across all five
    /// tables sleeps the long check interval; otherwise the next batch
    /// follows after a short pause.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Expiration manager started");

        loop {
            let removed_any = self.execute_batch(&cancel).await;

            if cancel.is_cancelled() {
                break;
            }

            let sleep = if removed_any {
                BETWEEN_BATCH_SLEEP
            } else {
                self.check_interval
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        info!("Expiration manager stopped");
    }

    /// One batch over all five tables. Database errors are logged and the
    /// sweep continues with the next table. Returns whether anything was
    /// deleted.
    pub async fn execute_batch(&self, cancel: &CancellationToken) -> bool {
        let mut removed_any = false;

        for (table, resource) in self.targets() {
            if cancel.is_cancelled() {
                return removed_any;
            }

            match self.expire_table(table, resource, cancel).await {
                Ok(removed) => {
                    if removed > 0 {
                        debug!(table = %table, removed, "Removed expired rows");
                        removed_any = true;
                    }
                }
                Err(StorageError::Cancelled) => return removed_any,
                Err(error) => {
                    error!(table = %table, error = ?error, "Expiration failed, continuing with next table");
                }
            }
        }

        removed_any
    }

    async fn expire_table(
        &self,
        table: &str,
        resource: Resource,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut lease = self.pool.lease().await?;

        let lock_name = format!("{}/ExpirationManager", self.tables.prefix);
        match session::acquire(&mut lease, &lock_name, SWEEP_LOCK_WAIT, cancel).await {
            Ok(()) => {}
            Err(StorageError::LockTimeout { .. }) => {
                debug!(table, "Another process is sweeping, skipping table");
                lease.release().await;
                return Ok(0);
            }
            Err(error) => {
                lease.release().await;
                return Err(error);
            }
        }

        let resources = BTreeSet::from([resource]);
        let repeater = Repeater::new(
            &self.tables.prefix,
            &resources,
            self.statement_timeout,
            cancel,
        );

        let sql = format!("DELETE FROM {table} WHERE `ExpireAt` < ? LIMIT {BATCH_SIZE}");
        let removed = repeater
            .run_single(&mut lease, crate::lock::repeater::action(move |conn: &mut MySqlConnection| {
                let sql = sql.clone();
                async move {
                    let result = sqlx::query(&sql).bind(Utc::now()).execute(conn).await?;
                    Ok(result.rows_affected())
                }
                .boxed()
            }))
            .await;

        session::release(&mut lease, &lock_name).await;
        lease.release().await;

        removed
    }
}
