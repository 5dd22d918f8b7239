use std::collections::HashMap;
use std::time::Duration;

use helpers::with_test_storage;
use stoker_mysql::{StateRecord, StorageError};
use tokio_util::sync::CancellationToken;

mod helpers;

fn processing_state() -> StateRecord {
    StateRecord {
        name: "Processing".into(),
        reason: Some("Picked by worker".into()),
        data: HashMap::from([("worker".into(), "w-1".into())]),
    }
}

#[tokio::test]
async fn set_job_state_points_the_job_at_the_new_state_row() {
    with_test_storage(|test| async move {
        let job_id = test.create_job().await;

        let mut tx = test.storage.begin_write_only();
        tx.set_job_state(&job_id, &processing_state()).unwrap();
        tx.commit(&CancellationToken::new()).await.unwrap();

        let job = test.job_row(&job_id).await.unwrap();
        let states = test.state_rows(&job_id).await;

        assert_eq!(states.len(), 1);
        assert_eq!(job.state_id, Some(states[0].id));
        assert_eq!(job.state_name.as_deref(), Some("Processing"));
        assert_eq!(states[0].name, "Processing");

        // A second transition must repoint the job at the newest row.
        let mut tx = test.storage.begin_write_only();
        tx.set_job_state(
            &job_id,
            &StateRecord {
                name: "Succeeded".into(),
                ..Default::default()
            },
        )
        .unwrap();
        tx.commit(&CancellationToken::new()).await.unwrap();

        let job = test.job_row(&job_id).await.unwrap();
        let states = test.state_rows(&job_id).await;
        assert_eq!(states.len(), 2);
        assert_eq!(job.state_id, Some(states[1].id));
        assert_eq!(job.state_name.as_deref(), Some("Succeeded"));

        let read_back = test
            .storage
            .connection()
            .get_state_data(&job_id)
            .await
            .unwrap()
            .expect("state data missing");
        assert_eq!(read_back.name(), "Succeeded");
    })
    .await;
}

#[tokio::test]
async fn a_failing_command_rolls_back_the_whole_batch() {
    with_test_storage(|test| async move {
        let mut tx = test.storage.begin_write_only();
        tx.insert_to_list("audit", "entry");
        // Points at a job that does not exist; the state insert violates the
        // foreign key and must take the list insert down with it.
        tx.set_job_state("999999", &processing_state()).unwrap();
        let result = tx.commit(&CancellationToken::new()).await;

        assert!(result.is_err());
        assert_eq!(test.count_rows("List").await, 0);
        assert_eq!(test.count_rows("State").await, 0);
    })
    .await;
}

#[tokio::test]
async fn commands_apply_in_insertion_order() {
    with_test_storage(|test| async move {
        let job_id = test.create_job().await;

        let mut tx = test.storage.begin_write_only();
        tx.set_job_state(&job_id, &processing_state()).unwrap();
        tx.add_to_queue("default", &job_id).unwrap();
        tx.increment_counter("stats:enqueued");
        tx.commit(&CancellationToken::new()).await.unwrap();

        assert_eq!(test.queue_rows().await.len(), 1);
        assert_eq!(test.state_rows(&job_id).await.len(), 1);
        assert_eq!(
            test.storage
                .connection()
                .get_counter("stats:enqueued")
                .await
                .unwrap(),
            1
        );
    })
    .await;
}

#[tokio::test]
async fn expire_and_persist_job_toggle_the_expiry() {
    with_test_storage(|test| async move {
        let job_id = test.create_job().await;
        assert!(test.job_row(&job_id).await.unwrap().expire_at.is_some());

        let mut tx = test.storage.begin_write_only();
        tx.persist_job(&job_id).unwrap();
        tx.commit(&CancellationToken::new()).await.unwrap();
        assert!(test.job_row(&job_id).await.unwrap().expire_at.is_none());

        let mut tx = test.storage.begin_write_only();
        tx.expire_job(&job_id, Duration::from_secs(600)).unwrap();
        tx.commit(&CancellationToken::new()).await.unwrap();
        assert!(test.job_row(&job_id).await.unwrap().expire_at.is_some());
    })
    .await;
}

#[tokio::test]
async fn counters_accumulate_signed_deltas() {
    with_test_storage(|test| async move {
        let mut tx = test.storage.begin_write_only();
        tx.increment_counter("stats");
        tx.increment_counter("stats");
        tx.decrement_counter("stats");
        tx.increment_counter_with_expiry("stats", Duration::from_secs(3600))
            .unwrap();
        tx.commit(&CancellationToken::new()).await.unwrap();

        let connection = test.storage.connection();
        assert_eq!(connection.get_counter("stats").await.unwrap(), 2);
        assert_eq!(connection.get_counter("missing").await.unwrap(), 0);
    })
    .await;
}

#[tokio::test]
async fn set_members_upsert_on_key_and_value() {
    with_test_storage(|test| async move {
        let mut tx = test.storage.begin_write_only();
        tx.add_to_set_with_score("schedule", "job-1", 5.0);
        tx.add_to_set_with_score("schedule", "job-1", 2.0);
        tx.add_to_set("schedule", "job-2");
        tx.commit(&CancellationToken::new()).await.unwrap();

        let connection = test.storage.connection();
        assert_eq!(connection.get_set_count("schedule").await.unwrap(), 2);
        assert_eq!(
            connection
                .get_first_by_lowest_score_from_set("schedule", 1.0, 10.0)
                .await
                .unwrap()
                .as_deref(),
            Some("job-1")
        );
        assert_eq!(
            connection
                .get_first_by_lowest_score_from_set("schedule", 3.0, 10.0)
                .await
                .unwrap(),
            None
        );
    })
    .await;
}

#[tokio::test]
async fn list_ranges_read_newest_first() {
    with_test_storage(|test| async move {
        let mut tx = test.storage.begin_write_only();
        for value in ["a", "b", "c", "d"] {
            tx.insert_to_list("history", value);
        }
        tx.commit(&CancellationToken::new()).await.unwrap();

        let connection = test.storage.connection();
        assert_eq!(
            connection.get_all_items_from_list("history").await.unwrap(),
            vec!["d", "c", "b", "a"]
        );
        assert_eq!(
            connection
                .get_range_from_list("history", 0, 1)
                .await
                .unwrap(),
            vec!["d", "c"]
        );
        assert_eq!(
            connection
                .get_range_from_list("history", 1, 2)
                .await
                .unwrap(),
            vec!["c", "b"]
        );
    })
    .await;
}

#[tokio::test]
async fn trim_list_keeps_the_requested_window_by_insertion_order() {
    with_test_storage(|test| async move {
        let mut tx = test.storage.begin_write_only();
        for value in ["a", "b", "c", "d", "e"] {
            tx.insert_to_list("history", value);
        }
        tx.commit(&CancellationToken::new()).await.unwrap();

        // Ranks run 1..N by insertion order; keep ranks 2..=3.
        let mut tx = test.storage.begin_write_only();
        tx.trim_list("history", 1, 2);
        tx.commit(&CancellationToken::new()).await.unwrap();

        let remaining = test
            .storage
            .connection()
            .get_all_items_from_list("history")
            .await
            .unwrap();
        assert_eq!(remaining, vec!["c", "b"]);
    })
    .await;
}

#[tokio::test]
async fn hash_ranges_upsert_fields() {
    with_test_storage(|test| async move {
        let mut tx = test.storage.begin_write_only();
        tx.set_range_in_hash(
            "recurring:1",
            vec![
                ("cron".to_string(), "* * * * *".to_string()),
                ("queue".to_string(), "default".to_string()),
            ],
        );
        tx.set_range_in_hash(
            "recurring:1",
            vec![("queue".to_string(), "critical".to_string())],
        );
        tx.commit(&CancellationToken::new()).await.unwrap();

        let connection = test.storage.connection();
        let entries = connection
            .get_all_entries_from_hash("recurring:1")
            .await
            .unwrap()
            .expect("hash missing");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.get("queue").map(String::as_str), Some("critical"));
        assert_eq!(connection.get_hash_count("recurring:1").await.unwrap(), 2);
        assert_eq!(
            connection.get_all_entries_from_hash("missing").await.unwrap(),
            None
        );
    })
    .await;
}

#[tokio::test]
async fn expiry_toggles_for_keyed_collections() {
    with_test_storage(|test| async move {
        let mut tx = test.storage.begin_write_only();
        tx.add_to_set("s", "v");
        tx.insert_to_list("l", "v");
        tx.set_range_in_hash("h", vec![("f".to_string(), "v".to_string())]);
        tx.expire_set("s", Duration::from_secs(3600)).unwrap();
        tx.expire_list("l", Duration::from_secs(3600)).unwrap();
        tx.expire_hash("h", Duration::from_secs(3600)).unwrap();
        tx.commit(&CancellationToken::new()).await.unwrap();

        let connection = test.storage.connection();
        assert!(connection.get_set_ttl("s").await.unwrap() > chrono::Duration::zero());
        assert!(connection.get_list_ttl("l").await.unwrap() > chrono::Duration::zero());
        assert!(connection.get_hash_ttl("h").await.unwrap() > chrono::Duration::zero());

        let mut tx = test.storage.begin_write_only();
        tx.persist_set("s");
        tx.persist_list("l");
        tx.persist_hash("h");
        tx.commit(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            connection.get_set_ttl("s").await.unwrap(),
            chrono::Duration::seconds(-1)
        );
        assert_eq!(
            connection.get_list_ttl("l").await.unwrap(),
            chrono::Duration::seconds(-1)
        );
        assert_eq!(
            connection.get_hash_ttl("h").await.unwrap(),
            chrono::Duration::seconds(-1)
        );
    })
    .await;
}

#[tokio::test]
async fn an_empty_transaction_commits_without_touching_the_database() {
    with_test_storage(|test| async move {
        let tx = test.storage.begin_write_only();
        assert!(tx.is_empty());
        tx.commit(&CancellationToken::new()).await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn malformed_job_ids_fail_validation_up_front() {
    with_test_storage(|test| async move {
        let mut tx = test.storage.begin_write_only();
        let result = tx.add_to_queue("default", "not-an-id");
        assert!(matches!(result, Err(StorageError::Validation(_))));
        assert!(tx.is_empty());
    })
    .await;
}
