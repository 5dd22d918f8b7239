//! Deferred, resource-tagged command batches.
//!
//! Every semantic operation appends one re-runnable command and tags the
//! resources it touches; `commit` runs the whole buffer in order inside one
//! database transaction, through the Repeater, under the union of the
//! collected locks. Until then nothing touches the database.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use indoc::formatdoc;
use sqlx::MySqlConnection;
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, StorageError};
use crate::job::StateRecord;
use crate::lock::repeater::{RepeatAction, Repeater};
use crate::lock::resource::Resource;
use crate::pool::SessionPool;
use crate::sql::{self, parse_job_id, Tables};

/// One buffered mutation. Commands must be re-runnable because a batch that
/// deadlocks is rolled back and replayed from the top.
type Command = Box<dyn for<'c> FnMut(&'c mut MySqlConnection) -> BoxFuture<'c, Result<()>> + Send>;

struct CommandBatch {
    commands: Vec<Command>,
}

impl RepeatAction<()> for CommandBatch {
    fn run<'c>(&'c mut self, conn: &'c mut MySqlConnection) -> BoxFuture<'c, Result<()>> {
        async move {
            for command in self.commands.iter_mut() {
                command(&mut *conn).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

/// Write-only transaction over the storage tables.
pub struct WriteOnlyTransaction {
    pool: SessionPool,
    tables: Arc<Tables>,
    timeout: Duration,
    commands: Vec<Command>,
    resources: BTreeSet<Resource>,
}

impl WriteOnlyTransaction {
    pub(crate) fn new(pool: SessionPool, tables: Arc<Tables>, timeout: Duration) -> Self {
        WriteOnlyTransaction {
            pool,
            tables,
            timeout,
            commands: Vec::new(),
            resources: BTreeSet::new(),
        }
    }

    fn push(
        &mut self,
        resources: &[Resource],
        command: impl for<'c> FnMut(&'c mut MySqlConnection) -> BoxFuture<'c, Result<()>>
            + Send
            + 'static,
    ) {
        self.resources.extend(resources.iter().copied());
        self.commands.push(Box::new(command));
    }

    /// Number of buffered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Schedules the job record for deletion once `expire_in` has passed.
    pub fn expire_job(&mut self, job_id: &str, expire_in: Duration) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        let expire_at = expires_at(expire_in)?;
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::Job], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            async move {
                let sql = format!(
                    "UPDATE {job} SET `ExpireAt` = ? WHERE `Id` = ?",
                    job = tables.job
                );
                sqlx::query(&sql)
                    .bind(expire_at)
                    .bind(job_id)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .boxed()
        });
        Ok(())
    }

    /// Clears the job's expiry so the record is kept indefinitely.
    pub fn persist_job(&mut self, job_id: &str) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::Job], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            async move {
                let sql = format!(
                    "UPDATE {job} SET `ExpireAt` = NULL WHERE `Id` = ?",
                    job = tables.job
                );
                sqlx::query(&sql).bind(job_id).execute(conn).await?;
                Ok(())
            }
            .boxed()
        });
        Ok(())
    }

    /// Appends a state row and points the job at it. Both statements run on
    /// the same session inside the batch transaction, so the pointer can
    /// never reference a row that was rolled back.
    pub fn set_job_state(&mut self, job_id: &str, state: &StateRecord) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        let name = state.name.clone();
        let reason = state.reason.clone();
        let data = serde_json::to_string(&state.data)?;
        let tables = Arc::clone(&self.tables);
        self.push(
            &[Resource::Job, Resource::State],
            move |conn: &mut MySqlConnection| {
                let tables = Arc::clone(&tables);
                let name = name.clone();
                let reason = reason.clone();
                let data = data.clone();
                async move {
                    let insert = formatdoc!(
                        r#"
                            INSERT INTO {state} (`JobId`, `Name`, `Reason`, `CreatedAt`, `Data`)
                            VALUES (?, ?, ?, ?, ?)
                        "#,
                        state = tables.state
                    );
                    let inserted = sqlx::query(&insert)
                        .bind(job_id)
                        .bind(&name)
                        .bind(&reason)
                        .bind(Utc::now())
                        .bind(&data)
                        .execute(&mut *conn)
                        .await?;
                    let state_id = inserted.last_insert_id() as i64;

                    let update = format!(
                        "UPDATE {job} SET `StateId` = ?, `StateName` = ? WHERE `Id` = ?",
                        job = tables.job
                    );
                    sqlx::query(&update)
                        .bind(state_id)
                        .bind(&name)
                        .bind(job_id)
                        .execute(conn)
                        .await?;
                    Ok(())
                }
                .boxed()
            },
        );
        Ok(())
    }

    /// Appends a state row without promoting it to the job's current state.
    pub fn add_job_state(&mut self, job_id: &str, state: &StateRecord) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        let name = state.name.clone();
        let reason = state.reason.clone();
        let data = serde_json::to_string(&state.data)?;
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::State], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let name = name.clone();
            let reason = reason.clone();
            let data = data.clone();
            async move {
                let sql = formatdoc!(
                    r#"
                        INSERT INTO {state} (`JobId`, `Name`, `Reason`, `CreatedAt`, `Data`)
                        VALUES (?, ?, ?, ?, ?)
                    "#,
                    state = tables.state
                );
                sqlx::query(&sql)
                    .bind(job_id)
                    .bind(&name)
                    .bind(&reason)
                    .bind(Utc::now())
                    .bind(&data)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .boxed()
        });
        Ok(())
    }

    /// Inserts an available delivery slot for the job.
    pub fn add_to_queue(&mut self, queue: &str, job_id: &str) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        let queue = queue.to_string();
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::Queue], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let queue = queue.clone();
            async move { sql::queue::enqueue(conn, &tables, &queue, job_id).await }.boxed()
        });
        Ok(())
    }

    pub fn increment_counter(&mut self, key: &str) {
        self.counter_delta(key, 1, None);
    }

    pub fn increment_counter_with_expiry(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        let expire_at = expires_at(expire_in)?;
        self.counter_delta(key, 1, Some(expire_at));
        Ok(())
    }

    pub fn decrement_counter(&mut self, key: &str) {
        self.counter_delta(key, -1, None);
    }

    pub fn decrement_counter_with_expiry(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        let expire_at = expires_at(expire_in)?;
        self.counter_delta(key, -1, Some(expire_at));
        Ok(())
    }

    /// Counters are append-only deltas; the aggregator folds them later.
    fn counter_delta(&mut self, key: &str, delta: i32, expire_at: Option<DateTime<Utc>>) {
        let key = key.to_string();
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::Counter], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            async move {
                let sql = format!(
                    "INSERT INTO {counter} (`Key`, `Value`, `ExpireAt`) VALUES (?, ?, ?)",
                    counter = tables.counter
                );
                sqlx::query(&sql)
                    .bind(&key)
                    .bind(delta)
                    .bind(expire_at)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .boxed()
        });
    }

    pub fn add_to_set(&mut self, key: &str, value: &str) {
        self.add_to_set_with_score(key, value, 0.0);
    }

    /// Upserts on `(Key, Value)`; an existing member only has its score
    /// updated.
    pub fn add_to_set_with_score(&mut self, key: &str, value: &str, score: f64) {
        let key = key.to_string();
        let value = value.to_string();
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::Set], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            let value = value.clone();
            async move {
                let sql = formatdoc!(
                    r#"
                        INSERT INTO {set} (`Key`, `Value`, `Score`)
                        VALUES (?, ?, ?)
                        ON DUPLICATE KEY UPDATE `Score` = VALUES(`Score`)
                    "#,
                    set = tables.set
                );
                sqlx::query(&sql)
                    .bind(&key)
                    .bind(&value)
                    .bind(score)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .boxed()
        });
    }

    pub fn add_range_to_set(&mut self, key: &str, values: &[String]) {
        if values.is_empty() {
            return;
        }
        let key = key.to_string();
        let values = values.to_vec();
        let rows = vec!["(?, ?, 0.0)"; values.len()].join(", ");
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::Set], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            let values = values.clone();
            let rows = rows.clone();
            async move {
                let sql = formatdoc!(
                    r#"
                        INSERT INTO {set} (`Key`, `Value`, `Score`)
                        VALUES {rows}
                        ON DUPLICATE KEY UPDATE `Score` = VALUES(`Score`)
                    "#,
                    set = tables.set
                );
                let mut query = sqlx::query(&sql);
                for value in &values {
                    query = query.bind(&key).bind(value);
                }
                query.execute(conn).await?;
                Ok(())
            }
            .boxed()
        });
    }

    pub fn remove_from_set(&mut self, key: &str, value: &str) {
        let key = key.to_string();
        let value = value.to_string();
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::Set], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            let value = value.clone();
            async move {
                let sql = format!(
                    "DELETE FROM {set} WHERE `Key` = ? AND `Value` = ?",
                    set = tables.set
                );
                sqlx::query(&sql)
                    .bind(&key)
                    .bind(&value)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .boxed()
        });
    }

    pub fn remove_set(&mut self, key: &str) {
        self.delete_by_key(Resource::Set, "set", key);
    }

    pub fn expire_set(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        self.expire_by_key(Resource::Set, "set", key, expire_in)
    }

    pub fn persist_set(&mut self, key: &str) {
        self.persist_by_key(Resource::Set, "set", key);
    }

    /// Lists are stacks: a new element lands on top (highest `Id`).
    pub fn insert_to_list(&mut self, key: &str, value: &str) {
        let key = key.to_string();
        let value = value.to_string();
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::List], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            let value = value.clone();
            async move {
                let sql = format!(
                    "INSERT INTO {list} (`Key`, `Value`) VALUES (?, ?)",
                    list = tables.list
                );
                sqlx::query(&sql)
                    .bind(&key)
                    .bind(&value)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .boxed()
        });
    }

    pub fn remove_from_list(&mut self, key: &str, value: &str) {
        let key = key.to_string();
        let value = value.to_string();
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::List], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            let value = value.clone();
            async move {
                let sql = format!(
                    "DELETE FROM {list} WHERE `Key` = ? AND `Value` = ?",
                    list = tables.list
                );
                sqlx::query(&sql)
                    .bind(&key)
                    .bind(&value)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .boxed()
        });
    }

    /// Keeps ranks `[keep_start + 1, keep_end + 1]` by `Id` ascending within
    /// the key and deletes everything else.
    pub fn trim_list(&mut self, key: &str, keep_start: u64, keep_end: u64) {
        let key = key.to_string();
        let keep_count: i64 = if keep_end < keep_start {
            0
        } else {
            (keep_end - keep_start + 1) as i64
        };
        let offset = keep_start as i64;
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::List], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            async move {
                // MySQL cannot subquery the delete target directly; the
                // derived table keeps the window of ids to retain.
                let sql = formatdoc!(
                    r#"
                        DELETE FROM {list}
                        WHERE `Key` = ?
                          AND `Id` NOT IN (
                            SELECT `Id` FROM (
                                SELECT `Id` FROM {list}
                                WHERE `Key` = ?
                                ORDER BY `Id` ASC
                                LIMIT ? OFFSET ?
                            ) AS kept
                          )
                    "#,
                    list = tables.list
                );
                sqlx::query(&sql)
                    .bind(&key)
                    .bind(&key)
                    .bind(keep_count)
                    .bind(offset)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .boxed()
        });
    }

    pub fn expire_list(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        self.expire_by_key(Resource::List, "list", key, expire_in)
    }

    pub fn persist_list(&mut self, key: &str) {
        self.persist_by_key(Resource::List, "list", key);
    }

    /// Upserts every `(field, value)` pair under the key.
    pub fn set_range_in_hash(
        &mut self,
        key: &str,
        pairs: impl IntoIterator<Item = (String, String)>,
    ) {
        let pairs: Vec<(String, String)> = pairs.into_iter().collect();
        if pairs.is_empty() {
            return;
        }
        let key = key.to_string();
        let rows = vec!["(?, ?, ?)"; pairs.len()].join(", ");
        let tables = Arc::clone(&self.tables);
        self.push(&[Resource::Hash], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            let pairs = pairs.clone();
            let rows = rows.clone();
            async move {
                let sql = formatdoc!(
                    r#"
                        INSERT INTO {hash} (`Key`, `Field`, `Value`)
                        VALUES {rows}
                        ON DUPLICATE KEY UPDATE `Value` = VALUES(`Value`)
                    "#,
                    hash = tables.hash
                );
                let mut query = sqlx::query(&sql);
                for (field, value) in &pairs {
                    query = query.bind(&key).bind(field).bind(value);
                }
                query.execute(conn).await?;
                Ok(())
            }
            .boxed()
        });
    }

    pub fn remove_hash(&mut self, key: &str) {
        self.delete_by_key(Resource::Hash, "hash", key);
    }

    pub fn expire_hash(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        self.expire_by_key(Resource::Hash, "hash", key, expire_in)
    }

    pub fn persist_hash(&mut self, key: &str) {
        self.persist_by_key(Resource::Hash, "hash", key);
    }

    fn delete_by_key(&mut self, resource: Resource, table: &'static str, key: &str) {
        let key = key.to_string();
        let tables = Arc::clone(&self.tables);
        self.push(&[resource], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            async move {
                let sql = format!("DELETE FROM {} WHERE `Key` = ?", keyed_table(&tables, table));
                sqlx::query(&sql).bind(&key).execute(conn).await?;
                Ok(())
            }
            .boxed()
        });
    }

    fn expire_by_key(
        &mut self,
        resource: Resource,
        table: &'static str,
        key: &str,
        expire_in: Duration,
    ) -> Result<()> {
        let expire_at = expires_at(expire_in)?;
        let key = key.to_string();
        let tables = Arc::clone(&self.tables);
        self.push(&[resource], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            async move {
                let sql = format!(
                    "UPDATE {} SET `ExpireAt` = ? WHERE `Key` = ?",
                    keyed_table(&tables, table)
                );
                sqlx::query(&sql)
                    .bind(expire_at)
                    .bind(&key)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .boxed()
        });
        Ok(())
    }

    fn persist_by_key(&mut self, resource: Resource, table: &'static str, key: &str) {
        let key = key.to_string();
        let tables = Arc::clone(&self.tables);
        self.push(&[resource], move |conn: &mut MySqlConnection| {
            let tables = Arc::clone(&tables);
            let key = key.clone();
            async move {
                let sql = format!(
                    "UPDATE {} SET `ExpireAt` = NULL WHERE `Key` = ?",
                    keyed_table(&tables, table)
                );
                sqlx::query(&sql).bind(&key).execute(conn).await?;
                Ok(())
            }
            .boxed()
        });
    }

    /// Commits the whole buffer atomically under the union of the collected
    /// resource locks. Commands run in insertion order.
    pub async fn commit(mut self, cancel: &CancellationToken) -> Result<()> {
        if self.commands.is_empty() {
            return Ok(());
        }

        let batch = CommandBatch {
            commands: std::mem::take(&mut self.commands),
        };

        let mut lease = self.pool.lease().await?;
        let repeater = Repeater::new(&self.tables.prefix, &self.resources, self.timeout, cancel);
        let result = repeater.run_batch(&mut lease, batch).await;
        lease.release().await;
        result
    }
}

fn keyed_table<'t>(tables: &'t Tables, table: &str) -> &'t str {
    match table {
        "set" => &tables.set,
        "list" => &tables.list,
        "hash" => &tables.hash,
        other => unreachable!("not a keyed table: {other}"),
    }
}

fn expires_at(expire_in: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(expire_in).map_err(|_| {
        StorageError::Validation(format!("expiry {expire_in:?} is out of range"))
    })?;
    Ok(Utc::now() + ttl)
}
