#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{FromRow, MySqlPool};
use stoker_mysql::{InvocationData, Storage, StorageOptions};
use tokio::sync::OnceCell;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const PREFIX: &str = "stoker_";

#[derive(FromRow, Debug)]
#[sqlx(rename_all = "PascalCase")]
pub struct QueueRow {
    pub id: i64,
    pub job_id: i64,
    pub queue: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub fetch_token: Option<String>,
}

#[derive(FromRow, Debug)]
#[sqlx(rename_all = "PascalCase")]
pub struct JobRow {
    pub id: i64,
    pub state_id: Option<i64>,
    pub state_name: Option<String>,
    pub expire_at: Option<DateTime<Utc>>,
}

#[derive(FromRow, Debug)]
#[sqlx(rename_all = "PascalCase")]
pub struct StateRow {
    pub id: i64,
    pub job_id: i64,
    pub name: String,
    pub reason: Option<String>,
    pub data: Option<String>,
}

pub struct TestStorage {
    pub source_pool: MySqlPool,
    pub assert_pool: MySqlPool,
    pub connect_options: MySqlConnectOptions,
    pub storage: Storage,
    pub name: String,
}

impl TestStorage {
    async fn drop_db(&self) {
        self.storage.close().await;
        self.assert_pool.close().await;
        sqlx::query(&format!("DROP DATABASE `{}`", self.name))
            .execute(&self.source_pool)
            .await
            .expect("Failed to drop test database");
    }

    pub fn table(&self, name: &str) -> String {
        format!("`{PREFIX}{name}`")
    }

    pub fn cancel_after(&self, delay: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        cancel
    }

    pub fn sample_invocation(&self) -> InvocationData {
        InvocationData {
            job_type: "SampleJob".into(),
            method: "perform".into(),
            parameter_types: vec!["String".into()],
            arguments: vec!["hello".into()],
        }
    }

    /// Creates a job record expiring in one hour and returns its textual id.
    pub async fn create_job(&self) -> String {
        self.storage
            .connection()
            .create_expired_job(
                &self.sample_invocation(),
                &HashMap::new(),
                Utc::now(),
                Duration::from_secs(3600),
                &CancellationToken::new(),
            )
            .await
            .expect("Failed to create job")
    }

    /// Creates a job and enqueues it on the given queue.
    pub async fn create_enqueued_job(&self, queue: &str) -> String {
        let job_id = self.create_job().await;
        let mut tx = self.storage.begin_write_only();
        tx.add_to_queue(queue, &job_id).expect("Failed to buffer enqueue");
        tx.commit(&CancellationToken::new())
            .await
            .expect("Failed to commit enqueue");
        job_id
    }

    pub async fn queue_rows(&self) -> Vec<QueueRow> {
        sqlx::query_as(&format!(
            "SELECT `Id`, `JobId`, `Queue`, `FetchedAt`, `FetchToken` FROM {} ORDER BY `Id`",
            self.table("JobQueue")
        ))
        .fetch_all(&self.assert_pool)
        .await
        .expect("Failed to read queue rows")
    }

    pub async fn job_row(&self, job_id: &str) -> Option<JobRow> {
        sqlx::query_as(&format!(
            "SELECT `Id`, `StateId`, `StateName`, `ExpireAt` FROM {} WHERE `Id` = ?",
            self.table("Job")
        ))
        .bind(job_id.parse::<i64>().expect("malformed job id"))
        .fetch_optional(&self.assert_pool)
        .await
        .expect("Failed to read job row")
    }

    pub async fn state_rows(&self, job_id: &str) -> Vec<StateRow> {
        sqlx::query_as(&format!(
            "SELECT `Id`, `JobId`, `Name`, `Reason`, `Data` FROM {} WHERE `JobId` = ? ORDER BY `Id`",
            self.table("State")
        ))
        .bind(job_id.parse::<i64>().expect("malformed job id"))
        .fetch_all(&self.assert_pool)
        .await
        .expect("Failed to read state rows")
    }

    pub async fn insert_raw_counter(
        &self,
        key: &str,
        value: i32,
        expire_at: Option<DateTime<Utc>>,
    ) {
        sqlx::query(&format!(
            "INSERT INTO {} (`Key`, `Value`, `ExpireAt`) VALUES (?, ?, ?)",
            self.table("Counter")
        ))
        .bind(key)
        .bind(value)
        .bind(expire_at)
        .execute(&self.assert_pool)
        .await
        .expect("Failed to insert raw counter");
    }

    pub async fn raw_counter_count(&self, key: &str) -> i64 {
        sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE `Key` = ?",
            self.table("Counter")
        ))
        .bind(key)
        .fetch_one(&self.assert_pool)
        .await
        .expect("Failed to count raw counters")
    }

    pub async fn aggregated_counter_value(&self, key: &str) -> Option<i64> {
        sqlx::query_scalar(&format!(
            "SELECT CAST(`Value` AS SIGNED) FROM {} WHERE `Key` = ?",
            self.table("AggregatedCounter")
        ))
        .bind(key)
        .fetch_optional(&self.assert_pool)
        .await
        .expect("Failed to read aggregated counter")
    }

    pub async fn count_rows(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table(table)))
            .fetch_one(&self.assert_pool)
            .await
            .expect("Failed to count rows")
    }

    pub async fn applied_migrations(&self) -> Vec<String> {
        sqlx::query_scalar(&format!(
            "SELECT `Id` FROM {} ORDER BY `Id`",
            self.table("Migration")
        ))
        .fetch_all(&self.assert_pool)
        .await
        .expect("Failed to read migrations")
    }

    /// Connection id of whoever holds the advisory lock, `None` when free.
    pub async fn lock_holder(&self, name: &str) -> Option<u64> {
        sqlx::query_scalar("SELECT IS_USED_LOCK(?)")
            .bind(format!("{PREFIX}/{name}"))
            .fetch_one(&self.assert_pool)
            .await
            .expect("Failed to probe lock")
    }

    /// Reopens a second storage handle against the same test database.
    pub async fn reopen(&self) -> Storage {
        Storage::open(
            StorageOptions::default()
                .connect_options(self.connect_options.clone())
                .tables_prefix(PREFIX)
                .queue_poll_interval(Duration::from_secs(1)),
        )
        .await
        .expect("Failed to reopen storage")
    }
}

pub async fn create_test_storage() -> TestStorage {
    let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let server_options: MySqlConnectOptions =
        db_url.parse().expect("Failed to parse DATABASE_URL");

    let source_pool = MySqlPoolOptions::new()
        .max_connections(2)
        .connect_with(server_options.clone())
        .await
        .expect("Failed to connect to database");

    let db_id = uuid::Uuid::now_v7();
    let db_name = format!("__test_stoker_{}", db_id.simple());
    sqlx::query(&format!("CREATE DATABASE `{db_name}`"))
        .execute(&source_pool)
        .await
        .expect("Failed to create test database");

    let connect_options = server_options.database(&db_name);

    let assert_pool = MySqlPoolOptions::new()
        .max_connections(4)
        .connect_with(connect_options.clone())
        .await
        .expect("Failed to connect to test database");

    let storage = Storage::open(
        StorageOptions::default()
            .connect_options(connect_options.clone())
            .tables_prefix(PREFIX)
            .queue_poll_interval(Duration::from_secs(1)),
    )
    .await
    .expect("Failed to open storage");

    TestStorage {
        source_pool,
        assert_pool,
        connect_options,
        storage,
        name: db_name,
    }
}

pub async fn with_test_storage<F, Fut>(test_fn: F)
where
    F: FnOnce(Arc<TestStorage>) -> Fut + 'static,
    Fut: std::future::Future<Output = ()>,
{
    let local_set = LocalSet::new();

    local_set
        .run_until(async move {
            let test_storage = Arc::new(create_test_storage().await);
            let passed_in = Arc::clone(&test_storage);

            let result = tokio::task::spawn_local(async move {
                test_fn(passed_in).await;
            })
            .await;

            test_storage.drop_db().await;
            result.expect("Test failed");
        })
        .await;
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        // Log level set to debug except for sqlx set at warn (to not show all sql requests)
        let filter_layer = EnvFilter::try_new("debug,sqlx=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}
