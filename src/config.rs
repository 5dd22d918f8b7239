use std::time::Duration;

use sqlx::mysql::MySqlConnectOptions;

/// Floor for [`StorageOptions::queue_poll_interval`]; polling faster than
/// this hammers the claim statement without improving latency.
pub(crate) const MIN_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_JOB_EXPIRATION_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_COUNTERS_AGGREGATE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_INVISIBILITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_DASHBOARD_JOB_LIST_LIMIT: usize = 50_000;
const DEFAULT_MIN_POOL_SIZE: usize = 1;
const DEFAULT_MAX_POOL_SIZE: usize = 20;

/// Transaction isolation hint for the batch commit path.
///
/// The write path serializes contending writers through advisory locks, so
/// the engine may ignore this; it is carried for deployments that want to
/// force a level anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options for opening a [`Storage`](crate::Storage).
///
/// Follows the consuming-builder convention: each setter takes and returns
/// `self`, and unset options fall back to their documented defaults at
/// [`Storage::open`](crate::Storage::open).
#[derive(Default)]
pub struct StorageOptions {
    database_url: Option<String>,
    connect_options: Option<MySqlConnectOptions>,
    tables_prefix: Option<String>,
    prepare_schema_if_necessary: Option<bool>,
    queue_poll_interval: Option<Duration>,
    job_expiration_check_interval: Option<Duration>,
    counters_aggregate_interval: Option<Duration>,
    invisibility_timeout: Option<Duration>,
    transaction_timeout: Option<Duration>,
    dashboard_job_list_limit: Option<usize>,
    transaction_isolation_level: Option<IsolationLevel>,
    min_pool_size: Option<usize>,
    max_pool_size: Option<usize>,
}

impl StorageOptions {
    /// Connection string of the target MySQL server.
    pub fn database_url(mut self, value: &str) -> Self {
        self.database_url = Some(value.into());
        self
    }

    /// Pre-parsed connection options; takes precedence over
    /// [`database_url`](Self::database_url).
    pub fn connect_options(mut self, value: MySqlConnectOptions) -> Self {
        self.connect_options = Some(value);
        self
    }

    /// Prefix prepended to every table name and advisory-lock name,
    /// allowing multiple independent deployments against one database.
    /// Default: empty.
    pub fn tables_prefix(mut self, value: &str) -> Self {
        self.tables_prefix = Some(value.into());
        self
    }

    /// Run the schema installer and migrations on open. Default: true.
    pub fn prepare_schema_if_necessary(mut self, value: bool) -> Self {
        self.prepare_schema_if_necessary = Some(value);
        self
    }

    /// Sleep between empty dequeue claims. Lower-clamped at 1 s.
    /// Default: 15 s.
    pub fn queue_poll_interval(mut self, value: Duration) -> Self {
        self.queue_poll_interval = Some(value);
        self
    }

    /// Sleep after an exhaustive expiration batch. Default: 1 h.
    pub fn job_expiration_check_interval(mut self, value: Duration) -> Self {
        self.job_expiration_check_interval = Some(value);
        self
    }

    /// Sleep after a counters aggregation run. Default: 5 min.
    pub fn counters_aggregate_interval(mut self, value: Duration) -> Self {
        self.counters_aggregate_interval = Some(value);
        self
    }

    /// Duration after which a claimed-but-unfinished queue slot is considered
    /// abandoned and may be re-claimed. Default: 30 min.
    pub fn invisibility_timeout(mut self, value: Duration) -> Self {
        self.invisibility_timeout = Some(value);
        self
    }

    /// Upper bound for a write-only batch commit. Default: 1 min.
    pub fn transaction_timeout(mut self, value: Duration) -> Self {
        self.transaction_timeout = Some(value);
        self
    }

    /// Opaque to the engine; passed through to monitoring. Default: 50 000.
    pub fn dashboard_job_list_limit(mut self, value: usize) -> Self {
        self.dashboard_job_list_limit = Some(value);
        self
    }

    /// Isolation hint for the batch commit path; may be ignored.
    pub fn transaction_isolation_level(mut self, value: IsolationLevel) -> Self {
        self.transaction_isolation_level = Some(value);
        self
    }

    /// Minimum number of pooled sessions kept through maintenance.
    /// Default: 1.
    pub fn min_pool_size(mut self, value: usize) -> Self {
        self.min_pool_size = Some(value);
        self
    }

    /// Maximum number of idle sessions retained by the pool. Default: 20.
    pub fn max_pool_size(mut self, value: usize) -> Self {
        self.max_pool_size = Some(value);
        self
    }

    pub(crate) fn resolve(self) -> crate::errors::Result<(Option<MySqlConnectOptions>, StorageConfig)> {
        let connect_options = match (self.connect_options, self.database_url) {
            (Some(options), _) => Some(options),
            (None, Some(url)) => Some(url.parse::<MySqlConnectOptions>().map_err(|e| {
                crate::errors::StorageError::Validation(format!("invalid database url: {e}"))
            })?),
            (None, None) => None,
        };

        let min_pool_size = self.min_pool_size.unwrap_or(DEFAULT_MIN_POOL_SIZE).max(1);
        let max_pool_size = self
            .max_pool_size
            .unwrap_or(DEFAULT_MAX_POOL_SIZE)
            .max(min_pool_size);

        let config = StorageConfig {
            tables_prefix: self.tables_prefix.unwrap_or_default(),
            prepare_schema_if_necessary: self.prepare_schema_if_necessary.unwrap_or(true),
            queue_poll_interval: self
                .queue_poll_interval
                .unwrap_or(DEFAULT_QUEUE_POLL_INTERVAL)
                .max(MIN_QUEUE_POLL_INTERVAL),
            job_expiration_check_interval: self
                .job_expiration_check_interval
                .unwrap_or(DEFAULT_JOB_EXPIRATION_CHECK_INTERVAL),
            counters_aggregate_interval: self
                .counters_aggregate_interval
                .unwrap_or(DEFAULT_COUNTERS_AGGREGATE_INTERVAL),
            invisibility_timeout: self
                .invisibility_timeout
                .unwrap_or(DEFAULT_INVISIBILITY_TIMEOUT),
            transaction_timeout: self
                .transaction_timeout
                .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT),
            dashboard_job_list_limit: self
                .dashboard_job_list_limit
                .unwrap_or(DEFAULT_DASHBOARD_JOB_LIST_LIMIT),
            transaction_isolation_level: self.transaction_isolation_level,
            min_pool_size,
            max_pool_size,
        };

        Ok((connect_options, config))
    }
}

/// Resolved configuration held by an open storage instance.
#[derive(Debug, Clone)]
pub(crate) struct StorageConfig {
    pub(crate) tables_prefix: String,
    pub(crate) prepare_schema_if_necessary: bool,
    pub(crate) queue_poll_interval: Duration,
    pub(crate) job_expiration_check_interval: Duration,
    pub(crate) counters_aggregate_interval: Duration,
    pub(crate) invisibility_timeout: Duration,
    pub(crate) transaction_timeout: Duration,
    #[allow(dead_code)]
    pub(crate) dashboard_job_list_limit: usize,
    #[allow(dead_code)]
    pub(crate) transaction_isolation_level: Option<IsolationLevel>,
    pub(crate) min_pool_size: usize,
    pub(crate) max_pool_size: usize,
}
