use chrono::Utc;
use helpers::with_test_storage;

mod helpers;

#[tokio::test]
async fn opening_installs_the_schema_and_records_migrations() {
    with_test_storage(|test| async move {
        for table in [
            "Job",
            "JobParameter",
            "JobQueue",
            "State",
            "Server",
            "Hash",
            "Set",
            "List",
            "Counter",
            "AggregatedCounter",
        ] {
            assert_eq!(test.count_rows(table).await, 0, "table {table} must exist");
        }

        let applied = test.applied_migrations().await;
        assert_eq!(
            applied,
            vec![
                "m000001_set_score_index".to_string(),
                "m000002_job_queue_fetch_token_index".to_string(),
            ]
        );
    })
    .await;
}

#[tokio::test]
async fn reopening_an_installed_database_is_a_noop() {
    with_test_storage(|test| async move {
        let job_id = test.create_job().await;

        for _ in 0..3 {
            let storage = test.reopen().await;
            storage.close().await;
        }

        // Nothing re-ran: data survived and no migration was recorded twice.
        assert!(test.job_row(&job_id).await.is_some());
        assert_eq!(test.applied_migrations().await.len(), 2);
    })
    .await;
}

#[tokio::test]
async fn unknown_recorded_migrations_are_ignored() {
    with_test_storage(|test| async move {
        sqlx::query(&format!(
            "INSERT INTO {} (`Id`, `ExecutedAt`) VALUES ('m999999_from_the_future', ?)",
            test.table("Migration")
        ))
        .bind(Utc::now())
        .execute(&test.assert_pool)
        .await
        .unwrap();

        let storage = test.reopen().await;
        storage.close().await;

        let applied = test.applied_migrations().await;
        assert_eq!(applied.len(), 3);
        assert!(applied.contains(&"m999999_from_the_future".to_string()));
    })
    .await;
}

#[tokio::test]
async fn schema_preparation_can_be_skipped() {
    with_test_storage(|test| async move {
        // A second deployment prefix in the same database, opened with
        // preparation disabled, must not create its tables.
        let result = stoker_mysql::Storage::open(
            stoker_mysql::StorageOptions::default()
                .connect_options(test.connect_options.clone())
                .tables_prefix("other_")
                .prepare_schema_if_necessary(false),
        )
        .await;
        let storage = result.expect("Opening without preparation must succeed");
        storage.close().await;

        let other_tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name LIKE 'other\\_%'",
        )
        .fetch_one(&test.assert_pool)
        .await
        .unwrap();
        assert_eq!(other_tables, 0);
    })
    .await;
}
