//! At-least-once queued delivery of job ids.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use getset::Getters;
use sqlx::MySqlConnection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::errors::{Result, StorageError};
use crate::lock::repeater::Repeater;
use crate::lock::resource::Resource;
use crate::pool::{SessionLease, SessionPool};
use crate::sql::{self, parse_job_id, Tables};

/// Per-queue delivery over the job queue table.
///
/// One instance serves all queues of a storage; the claim statement is
/// rendered per dequeue call (its shape depends on the queue count), while
/// the stale-cutoff arithmetic and timeouts come from the storage options.
pub struct JobQueue {
    pool: SessionPool,
    tables: Arc<Tables>,
    poll_interval: Duration,
    invisibility_timeout: chrono::Duration,
    claim_timeout: Duration,
}

impl JobQueue {
    pub(crate) fn new(pool: SessionPool, tables: Arc<Tables>, config: &StorageConfig) -> Self {
        JobQueue {
            pool,
            tables,
            poll_interval: config.queue_poll_interval,
            invisibility_timeout: chrono::Duration::from_std(config.invisibility_timeout)
                .unwrap_or(chrono::Duration::MAX),
            claim_timeout: config.transaction_timeout,
        }
    }

    /// Inserts an available delivery slot for the job, under the queue lock.
    pub async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        let resources = BTreeSet::from([Resource::Queue]);
        let repeater = Repeater::new(
            &self.tables.prefix,
            &resources,
            self.claim_timeout,
            cancel,
        );

        let mut lease = self.pool.lease().await?;
        let tables = self.tables.clone();
        let queue = queue.to_string();
        repeater
            .run_single(&mut lease, crate::lock::repeater::action(move |conn: &mut MySqlConnection| {
                let tables = tables.clone();
                let queue = queue.clone();
                async move { sql::queue::enqueue(conn, &tables, &queue, job_id).await }.boxed()
            }))
            .await?;
        lease.release().await;

        Ok(())
    }

    /// Polls until a job is claimed from one of the queues or the token
    /// fires. The claimed slot's session travels inside the returned handle.
    pub async fn dequeue(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<FetchedJob> {
        if queues.is_empty() {
            return Err(StorageError::Validation(
                "queue list must not be empty".into(),
            ));
        }

        let resources = BTreeSet::from([Resource::Queue]);
        let claim_sql = sql::queue::claim_sql(&self.tables, queues.len());
        let mut lease = self.pool.lease().await?;

        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let token = Uuid::new_v4().to_string();
            let now = Utc::now();
            let stale_cutoff = now - self.invisibility_timeout;

            let repeater = Repeater::new(
                &self.tables.prefix,
                &resources,
                self.claim_timeout,
                cancel,
            );
            let claim_sql_owned = claim_sql.clone();
            let token_owned = token.clone();
            let queues_owned = queues.to_vec();
            let claimed = repeater
                .run_single(&mut lease, crate::lock::repeater::action(move |conn: &mut MySqlConnection| {
                    let claim_sql_owned = claim_sql_owned.clone();
                    let token_owned = token_owned.clone();
                    let queues_owned = queues_owned.clone();
                    async move {
                        sql::queue::claim(
                            conn,
                            &claim_sql_owned,
                            now,
                            &token_owned,
                            &queues_owned,
                            stale_cutoff,
                        )
                        .await
                    }
                    .boxed()
                }))
                .await
                .map_err(|err| {
                    error!(error = ?err, queues = ?queues, "Failed to claim a queued job");
                    err
                })?;

            if claimed > 0 {
                match sql::queue::claimed_by_token(&mut *lease, &self.tables, &token).await? {
                    Some(row) => {
                        debug!(
                            job_id = row.job_id(),
                            queue = row.queue(),
                            "Fetched background job"
                        );
                        return Ok(FetchedJob::new(lease, Arc::clone(&self.tables), row));
                    }
                    // The slot was removed between claim and read; claim again.
                    None => continue,
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Pending,
    Removed,
    Requeued,
}

/// A claimed queue slot, bound to the session that claimed it.
///
/// The handle must end in [`remove_from_queue`](FetchedJob::remove_from_queue)
/// or [`requeue`](FetchedJob::requeue); disposing it with neither requeues the
/// slot so the job is redelivered rather than lost.
#[derive(Getters)]
pub struct FetchedJob {
    lease: Option<SessionLease>,
    tables: Arc<Tables>,
    row_id: i64,
    #[getset(get = "pub")]
    job_id: String,
    #[getset(get = "pub")]
    queue: String,
    state: HandleState,
}

impl FetchedJob {
    fn new(lease: SessionLease, tables: Arc<Tables>, row: sql::queue::ClaimedRow) -> Self {
        FetchedJob {
            lease: Some(lease),
            tables,
            row_id: *row.id(),
            job_id: row.job_id().to_string(),
            queue: row.queue().clone(),
            state: HandleState::Pending,
        }
    }

    /// Deletes the slot: the job has been processed and must not be
    /// delivered again.
    pub async fn remove_from_queue(&mut self) -> Result<()> {
        let lease = self
            .lease
            .as_mut()
            .expect("fetched job handle already released");
        sql::queue::remove(&mut **lease, &self.tables, self.row_id).await?;
        self.state = HandleState::Removed;
        Ok(())
    }

    /// Makes the slot immediately available for another consumer.
    pub async fn requeue(&mut self) -> Result<()> {
        let lease = self
            .lease
            .as_mut()
            .expect("fetched job handle already released");
        sql::queue::requeue(&mut **lease, &self.tables, self.row_id).await?;
        self.state = HandleState::Requeued;
        Ok(())
    }

    /// Finishes the handle: requeues the slot if it is still pending, then
    /// returns the session to the pool.
    pub async fn release(mut self) -> Result<()> {
        let mut lease = self
            .lease
            .take()
            .expect("fetched job handle already released");
        let mut outcome = Ok(());
        if self.state == HandleState::Pending {
            outcome = sql::queue::requeue(&mut *lease, &self.tables, self.row_id).await;
            self.state = HandleState::Requeued;
        }
        lease.release().await;
        outcome
    }
}

impl Drop for FetchedJob {
    fn drop(&mut self) {
        let Some(mut lease) = self.lease.take() else {
            return;
        };

        if self.state != HandleState::Pending {
            return; // lease drop recycles the session
        }

        let tables = Arc::clone(&self.tables);
        let row_id = self.row_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = sql::queue::requeue(&mut *lease, &tables, row_id).await {
                    warn!(error = ?error, row_id, "Failed to requeue abandoned fetched job");
                }
                lease.release().await;
            });
        }
        // Outside a runtime the session closes and the slot becomes
        // reclaimable once the invisibility timeout passes.
    }
}

/// Maps queue names to the queue implementation serving them.
///
/// One storage instance normally has a single provider; registering others
/// is supported, but one fetch call cannot mix providers.
pub(crate) struct QueueProviders {
    default_provider: Arc<JobQueue>,
    overrides: HashMap<String, Arc<JobQueue>>,
}

impl QueueProviders {
    pub(crate) fn new(default_provider: Arc<JobQueue>) -> Self {
        QueueProviders {
            default_provider,
            overrides: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, queue: &str, provider: Arc<JobQueue>) {
        self.overrides.insert(queue.to_string(), provider);
    }

    pub(crate) fn provider_for(&self, queue: &str) -> &Arc<JobQueue> {
        self.overrides.get(queue).unwrap_or(&self.default_provider)
    }

    /// All requested queues must resolve to one provider instance; fetching
    /// across queue implementations in a single call is not supported.
    pub(crate) fn resolve_single(&self, queues: &[String]) -> Result<Arc<JobQueue>> {
        let mut resolved: Option<&Arc<JobQueue>> = None;
        for queue in queues {
            let provider = self.provider_for(queue);
            match resolved {
                None => resolved = Some(provider),
                Some(current) if Arc::ptr_eq(current, provider) => {}
                Some(_) => {
                    return Err(StorageError::Validation(format!(
                        "queues resolve to multiple queue providers (`{queue}` differs)"
                    )))
                }
            }
        }
        resolved.cloned().ok_or_else(|| {
            StorageError::Validation("queue list must not be empty".into())
        })
    }
}
