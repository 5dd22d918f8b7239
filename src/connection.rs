//! Reader surface and server registry.
//!
//! Every call borrows a session from the pool, runs its statements, and
//! returns the session. Mutations go through the Repeater under their
//! resource lock; reads are plain queries.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use sqlx::MySqlConnection;
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, StorageError};
use crate::job::{InvocationData, JobData, ServerData, StateData};
use crate::lock::distributed::{DistributedLock, LockManager};
use crate::lock::repeater::Repeater;
use crate::lock::resource::Resource;
use crate::pool::SessionPool;
use crate::queue::{FetchedJob, QueueProviders};
use crate::sql::{self, parse_job_id, Tables};

/// TTL sentinel for keys that have no row or no expiry set.
const NO_TTL: i64 = -1;

/// Short-lived handle over the storage for reads and the server registry.
pub struct StorageConnection {
    pool: SessionPool,
    tables: Arc<Tables>,
    transaction_timeout: Duration,
    lock_manager: Arc<LockManager>,
    providers: Arc<RwLock<QueueProviders>>,
}

impl StorageConnection {
    pub(crate) fn new(
        pool: SessionPool,
        tables: Arc<Tables>,
        transaction_timeout: Duration,
        lock_manager: Arc<LockManager>,
        providers: Arc<RwLock<QueueProviders>>,
    ) -> Self {
        StorageConnection {
            pool,
            tables,
            transaction_timeout,
            lock_manager,
            providers,
        }
    }

    fn repeater<'a>(
        &'a self,
        resources: &'a BTreeSet<Resource>,
        cancel: &'a CancellationToken,
    ) -> Repeater<'a> {
        Repeater::new(
            &self.tables.prefix,
            resources,
            self.transaction_timeout,
            cancel,
        )
    }

    /// Creates a job record that starts out already expiring: unless a later
    /// state transition persists it or extends it, the expiration manager
    /// will delete it. Returns the new job id in its textual form.
    pub async fn create_expired_job(
        &self,
        invocation: &InvocationData,
        parameters: &HashMap<String, String>,
        created_at: DateTime<Utc>,
        expire_in: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let invocation_json = serde_json::to_string(invocation)?;
        let arguments_json = serde_json::to_string(&invocation.arguments)?;
        let expire_at = created_at
            + chrono::Duration::from_std(expire_in).map_err(|_| {
                StorageError::Validation(format!("expiry {expire_in:?} is out of range"))
            })?;

        let resources = BTreeSet::from([Resource::Job]);
        let repeater = self.repeater(&resources, cancel);
        let mut lease = self.pool.lease().await?;

        let tables = self.tables.clone();
        let parameters = parameters.clone();
        let job_id = repeater
            .run_batch(&mut lease, crate::lock::repeater::action(move |conn: &mut MySqlConnection| {
                let tables = tables.clone();
                let invocation_json = invocation_json.clone();
                let arguments_json = arguments_json.clone();
                let parameters = parameters.clone();
                async move {
                    let job_id = sql::job::insert_job(
                        &mut *conn,
                        &tables,
                        &invocation_json,
                        &arguments_json,
                        created_at,
                        expire_at,
                    )
                    .await?;
                    sql::job::insert_job_parameters(&mut *conn, &tables, job_id, &parameters).await?;
                    Ok(job_id)
                }
                .boxed()
            }))
            .await;
        lease.release().await;

        Ok(job_id?.to_string())
    }

    /// Claims the next job from one of the queues. All queues must resolve
    /// to the same queue provider; mixing implementations is not supported.
    pub async fn fetch_next_job(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<FetchedJob> {
        let provider = {
            let providers = self.providers.read().expect("provider registry poisoned");
            providers.resolve_single(queues)?
        };
        provider.dequeue(queues, cancel).await
    }

    pub async fn set_job_parameter(
        &self,
        job_id: &str,
        name: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        let resources = BTreeSet::from([Resource::Job]);
        let repeater = self.repeater(&resources, cancel);
        let mut lease = self.pool.lease().await?;

        let tables = self.tables.clone();
        let name = name.to_string();
        let value = value.to_string();
        let result = repeater
            .run_single(&mut lease, crate::lock::repeater::action(move |conn: &mut MySqlConnection| {
                let tables = tables.clone();
                let name = name.clone();
                let value = value.clone();
                async move {
                    sql::job::upsert_job_parameter(conn, &tables, job_id, &name, &value).await
                }
                .boxed()
            }))
            .await;
        lease.release().await;

        result
    }

    pub async fn get_job_parameter(&self, job_id: &str, name: &str) -> Result<Option<String>> {
        let job_id = parse_job_id(job_id)?;
        let mut lease = self.pool.lease().await?;
        let value = sql::job::get_job_parameter(&mut *lease, &self.tables, job_id, name).await;
        lease.release().await;
        value
    }

    pub async fn get_job_data(&self, job_id: &str) -> Result<Option<JobData>> {
        let job_id = parse_job_id(job_id)?;
        let mut lease = self.pool.lease().await?;
        let data = sql::job::get_job_data(&mut *lease, &self.tables, job_id).await;
        lease.release().await;
        data
    }

    pub async fn get_state_data(&self, job_id: &str) -> Result<Option<StateData>> {
        let job_id = parse_job_id(job_id)?;
        let mut lease = self.pool.lease().await?;
        let data = sql::job::get_state_data(&mut *lease, &self.tables, job_id).await;
        lease.release().await;
        data
    }

    /// Registers (or refreshes) a worker in the server registry.
    pub async fn announce_server(
        &self,
        server_id: &str,
        data: &ServerData,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if server_id.is_empty() {
            return Err(StorageError::Validation("server id must not be empty".into()));
        }
        let data_json = serde_json::to_string(data)?;
        let now = Utc::now();

        let resources = BTreeSet::from([Resource::Server]);
        let repeater = self.repeater(&resources, cancel);
        let mut lease = self.pool.lease().await?;

        let tables = self.tables.clone();
        let server_id = server_id.to_string();
        let result = repeater
            .run_single(&mut lease, crate::lock::repeater::action(move |conn: &mut MySqlConnection| {
                let tables = tables.clone();
                let server_id = server_id.clone();
                let data_json = data_json.clone();
                async move { sql::server::announce(conn, &tables, &server_id, &data_json, now).await }
                    .boxed()
            }))
            .await;
        lease.release().await;

        result
    }

    pub async fn server_heartbeat(&self, server_id: &str, cancel: &CancellationToken) -> Result<()> {
        let now = Utc::now();
        let resources = BTreeSet::from([Resource::Server]);
        let repeater = self.repeater(&resources, cancel);
        let mut lease = self.pool.lease().await?;

        let tables = self.tables.clone();
        let server_id = server_id.to_string();
        let result = repeater
            .run_single(&mut lease, crate::lock::repeater::action(move |conn: &mut MySqlConnection| {
                let tables = tables.clone();
                let server_id = server_id.clone();
                async move { sql::server::heartbeat(conn, &tables, &server_id, now).await }.boxed()
            }))
            .await;
        lease.release().await;

        result
    }

    pub async fn remove_server(&self, server_id: &str, cancel: &CancellationToken) -> Result<()> {
        let resources = BTreeSet::from([Resource::Server]);
        let repeater = self.repeater(&resources, cancel);
        let mut lease = self.pool.lease().await?;

        let tables = self.tables.clone();
        let server_id = server_id.to_string();
        let result = repeater
            .run_single(&mut lease, crate::lock::repeater::action(move |conn: &mut MySqlConnection| {
                let tables = tables.clone();
                let server_id = server_id.clone();
                async move { sql::server::remove(conn, &tables, &server_id).await }.boxed()
            }))
            .await;
        lease.release().await;

        result
    }

    /// Removes every worker whose heartbeat is older than `timeout` ago;
    /// returns the number of removed registrations.
    pub async fn remove_timed_out_servers(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if timeout.is_zero() {
            return Err(StorageError::Validation(
                "server timeout must be positive".into(),
            ));
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).map_err(|_| {
                StorageError::Validation(format!("server timeout {timeout:?} is out of range"))
            })?;

        let resources = BTreeSet::from([Resource::Server]);
        let repeater = self.repeater(&resources, cancel);
        let mut lease = self.pool.lease().await?;

        let tables = self.tables.clone();
        let removed = repeater
            .run_single(&mut lease, crate::lock::repeater::action(move |conn: &mut MySqlConnection| {
                let tables = tables.clone();
                async move { sql::server::remove_timed_out(conn, &tables, cutoff).await }.boxed()
            }))
            .await;
        lease.release().await;

        removed
    }

    /// Cross-process mutual exclusion on `"{prefix}/{resource}"`.
    pub async fn acquire_distributed_lock(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DistributedLock> {
        self.lock_manager.acquire(resource, timeout, cancel).await
    }

    pub async fn get_counter(&self, key: &str) -> Result<i64> {
        let mut lease = self.pool.lease().await?;
        let total = sql::kv::get_counter(&mut *lease, &self.tables, key).await;
        lease.release().await;
        total
    }

    pub async fn get_set_count(&self, key: &str) -> Result<i64> {
        let mut lease = self.pool.lease().await?;
        let count = sql::kv::get_set_count(&mut *lease, &self.tables, key).await;
        lease.release().await;
        count
    }

    pub async fn get_all_items_from_set(&self, key: &str) -> Result<Vec<String>> {
        let mut lease = self.pool.lease().await?;
        let items = sql::kv::get_all_items_from_set(&mut *lease, &self.tables, key).await;
        lease.release().await;
        items
    }

    /// Members ranked `[from + 1, to + 1]` by `Id` ascending.
    pub async fn get_range_from_set(&self, key: &str, from: u64, to: u64) -> Result<Vec<String>> {
        let mut lease = self.pool.lease().await?;
        let items = sql::kv::get_range_from_set(&mut *lease, &self.tables, key, from, to).await;
        lease.release().await;
        items
    }

    /// The member with the lowest score inside `[from_score, to_score]`.
    pub async fn get_first_by_lowest_score_from_set(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
    ) -> Result<Option<String>> {
        if to_score < from_score {
            return Err(StorageError::Validation(
                "to_score must not be lower than from_score".into(),
            ));
        }
        let mut lease = self.pool.lease().await?;
        let value = sql::kv::get_first_by_lowest_score_from_set(
            &mut *lease,
            &self.tables,
            key,
            from_score,
            to_score,
        )
        .await;
        lease.release().await;
        value
    }

    pub async fn get_list_count(&self, key: &str) -> Result<i64> {
        let mut lease = self.pool.lease().await?;
        let count = sql::kv::get_list_count(&mut *lease, &self.tables, key).await;
        lease.release().await;
        count
    }

    /// Whole list, newest first.
    pub async fn get_all_items_from_list(&self, key: &str) -> Result<Vec<String>> {
        let mut lease = self.pool.lease().await?;
        let items = sql::kv::get_all_items_from_list(&mut *lease, &self.tables, key).await;
        lease.release().await;
        items
    }

    /// Elements ranked `[from + 1, to + 1]` by `Id` descending.
    pub async fn get_range_from_list(&self, key: &str, from: u64, to: u64) -> Result<Vec<String>> {
        let mut lease = self.pool.lease().await?;
        let items = sql::kv::get_range_from_list(&mut *lease, &self.tables, key, from, to).await;
        lease.release().await;
        items
    }

    /// All fields of the hash, or `None` when it does not exist.
    pub async fn get_all_entries_from_hash(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        let mut lease = self.pool.lease().await?;
        let entries = sql::kv::get_all_entries_from_hash(&mut *lease, &self.tables, key).await;
        lease.release().await;
        entries
    }

    pub async fn get_hash_count(&self, key: &str) -> Result<i64> {
        let mut lease = self.pool.lease().await?;
        let count = sql::kv::get_hash_count(&mut *lease, &self.tables, key).await;
        lease.release().await;
        count
    }

    pub async fn get_value_from_hash(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut lease = self.pool.lease().await?;
        let value = sql::kv::get_value_from_hash(&mut *lease, &self.tables, key, field).await;
        lease.release().await;
        value
    }

    /// Time until the earliest expiry under the key; `-1 s` when nothing
    /// expires. Negative beyond the sentinel means already past due.
    pub async fn get_set_ttl(&self, key: &str) -> Result<chrono::Duration> {
        let mut lease = self.pool.lease().await?;
        let expire_at = sql::kv::min_expire_at(&mut *lease, &self.tables.set, key).await;
        lease.release().await;
        Ok(ttl_from(expire_at?))
    }

    pub async fn get_list_ttl(&self, key: &str) -> Result<chrono::Duration> {
        let mut lease = self.pool.lease().await?;
        let expire_at = sql::kv::min_expire_at(&mut *lease, &self.tables.list, key).await;
        lease.release().await;
        Ok(ttl_from(expire_at?))
    }

    pub async fn get_hash_ttl(&self, key: &str) -> Result<chrono::Duration> {
        let mut lease = self.pool.lease().await?;
        let expire_at = sql::kv::min_expire_at(&mut *lease, &self.tables.hash, key).await;
        lease.release().await;
        Ok(ttl_from(expire_at?))
    }
}

fn ttl_from(expire_at: Option<DateTime<Utc>>) -> chrono::Duration {
    match expire_at {
        Some(at) => at - Utc::now(),
        None => chrono::Duration::seconds(NO_TTL),
    }
}
