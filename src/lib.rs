//! MySQL-backed storage engine for the Stoker background-job framework.
//!
//! The engine persists job definitions and their lifecycle state, delivers
//! job ids through per-queue slots with at-least-once semantics, and
//! coordinates concurrent workers through MySQL's session-scoped advisory
//! locks (`GET_LOCK` and friends). Multiple processes may run against the
//! same schema; a configurable table prefix isolates independent
//! deployments sharing one database.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! use chrono::Utc;
//! use stoker_mysql::{InvocationData, Storage, StorageOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> stoker_mysql::Result<()> {
//!     let storage = Storage::open(
//!         StorageOptions::default()
//!             .database_url("mysql://root@localhost:3306/jobs")
//!             .tables_prefix("app_"),
//!     )
//!     .await?;
//!
//!     let cancel = CancellationToken::new();
//!     let connection = storage.connection();
//!     let invocation = InvocationData {
//!         job_type: "Mailer".into(),
//!         method: "send_welcome".into(),
//!         parameter_types: vec!["i64".into()],
//!         arguments: vec!["42".into()],
//!     };
//!     let job_id = connection
//!         .create_expired_job(
//!             &invocation,
//!             &HashMap::new(),
//!             Utc::now(),
//!             Duration::from_secs(3600),
//!             &cancel,
//!         )
//!         .await?;
//!
//!     let mut tx = storage.begin_write_only();
//!     tx.add_to_queue("default", &job_id)?;
//!     tx.commit(&cancel).await?;
//!
//!     storage.close().await;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;
mod connection;
mod counters;
pub mod errors;
mod expiration;
mod job;
mod lock;
mod pool;
mod queue;
mod schema;
mod sql;
mod transaction;

pub use config::{IsolationLevel, StorageOptions};
pub use connection::StorageConnection;
pub use counters::CountersAggregator;
pub use errors::{Result, StorageError};
pub use expiration::ExpirationManager;
pub use job::{InvocationData, JobData, ServerData, StateData, StateRecord};
pub use lock::distributed::{DistributedLock, LockManager};
pub use lock::resource::Resource;
pub use queue::{FetchedJob, JobQueue};
pub use transaction::WriteOnlyTransaction;

use config::StorageConfig;
use pool::SessionPool;
use queue::QueueProviders;
use sql::Tables;

/// Handle over one storage deployment.
///
/// Capabilities hang off this handle: [`connection`](Storage::connection)
/// for reads and the server registry, [`begin_write_only`](Storage::begin_write_only)
/// for buffered mutations, the two maintenance workers, and the distributed
/// lock manager. The handle holds no module-level state; dropping the last
/// clone of everything it hands out leaves nothing behind but pooled
/// sessions, which [`close`](Storage::close) disposes.
pub struct Storage {
    pool: SessionPool,
    tables: Arc<Tables>,
    config: StorageConfig,
    lock_manager: Arc<LockManager>,
    providers: Arc<RwLock<QueueProviders>>,
}

impl Storage {
    /// Entry point for configuring a storage instance.
    pub fn options() -> StorageOptions {
        StorageOptions::default()
    }

    /// Connects, prepares the schema when configured to, and wires the
    /// component stack.
    pub async fn open(options: StorageOptions) -> Result<Storage> {
        let (connect_options, config) = options.resolve()?;
        let connect_options = connect_options.ok_or_else(|| {
            StorageError::Validation("either database_url or connect_options is required".into())
        })?;

        let pool = SessionPool::new(connect_options, config.min_pool_size, config.max_pool_size);
        let tables = Arc::new(Tables::new(&config.tables_prefix));

        if config.prepare_schema_if_necessary {
            let mut lease = pool.lease().await?;
            let prepared =
                schema::prepare(&mut lease, &config.tables_prefix, &CancellationToken::new()).await;
            lease.release().await;
            prepared?;
        }

        let lock_manager = Arc::new(LockManager::new(
            pool.clone(),
            config.tables_prefix.clone(),
        ));
        let default_queue = Arc::new(JobQueue::new(pool.clone(), Arc::clone(&tables), &config));
        let providers = Arc::new(RwLock::new(QueueProviders::new(default_queue)));

        info!(prefix = %config.tables_prefix, "Opened MySQL job storage");

        Ok(Storage {
            pool,
            tables,
            config,
            lock_manager,
            providers,
        })
    }

    /// A fresh reader/registry surface sharing this storage's pool.
    pub fn connection(&self) -> StorageConnection {
        StorageConnection::new(
            self.pool.clone(),
            Arc::clone(&self.tables),
            self.config.transaction_timeout,
            Arc::clone(&self.lock_manager),
            Arc::clone(&self.providers),
        )
    }

    /// An empty write-only transaction bound to this storage.
    pub fn begin_write_only(&self) -> WriteOnlyTransaction {
        WriteOnlyTransaction::new(
            self.pool.clone(),
            Arc::clone(&self.tables),
            self.config.transaction_timeout,
        )
    }

    /// The distributed lock manager backing
    /// [`StorageConnection::acquire_distributed_lock`].
    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    /// The counters roll-up worker; callers own the task that runs it.
    pub fn counters_aggregator(&self) -> CountersAggregator {
        CountersAggregator::new(self.pool.clone(), Arc::clone(&self.tables), &self.config)
    }

    /// The expired-row sweeper; callers own the task that runs it.
    pub fn expiration_manager(&self) -> ExpirationManager {
        ExpirationManager::new(self.pool.clone(), Arc::clone(&self.tables), &self.config)
    }

    /// Routes a queue name to a dedicated queue implementation. One fetch
    /// call can only span queues served by a single implementation.
    pub fn register_queue_provider(&self, queue: &str, provider: Arc<JobQueue>) {
        self.providers
            .write()
            .expect("provider registry poisoned")
            .register(queue, provider);
    }

    /// Disposes the storage: stops pool maintenance and closes every idle
    /// session. Distributed-lock holders keep their leased sessions alive
    /// until released; those sessions close on return instead of pooling.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Closed MySQL job storage");
    }
}
