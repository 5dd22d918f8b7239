use std::time::Duration;

use helpers::with_test_storage;
use stoker_mysql::StorageError;
use tokio_util::sync::CancellationToken;

mod helpers;

#[tokio::test]
async fn enqueue_then_dequeue_returns_the_job() {
    with_test_storage(|test| async move {
        let job_id = test.create_job().await;
        assert_eq!(job_id, "1");

        let mut tx = test.storage.begin_write_only();
        tx.add_to_queue("default", &job_id).unwrap();
        tx.commit(&CancellationToken::new()).await.unwrap();

        let connection = test.storage.connection();
        let mut fetched = connection
            .fetch_next_job(&["default".into()], &test.cancel_after(Duration::from_secs(10)))
            .await
            .expect("Failed to fetch job");

        assert_eq!(fetched.job_id(), "1");
        assert_eq!(fetched.queue(), "default");

        fetched.remove_from_queue().await.unwrap();
        fetched.release().await.unwrap();
        assert!(test.queue_rows().await.is_empty());

        // Nothing left to deliver: the next fetch polls until cancelled.
        let empty = connection
            .fetch_next_job(&["default".into()], &test.cancel_after(Duration::from_millis(200)))
            .await;
        assert!(matches!(empty, Err(StorageError::Cancelled)));
    })
    .await;
}

#[tokio::test]
async fn releasing_an_unfinished_handle_requeues_the_slot() {
    with_test_storage(|test| async move {
        test.create_enqueued_job("default").await;

        let fetched = test
            .storage
            .connection()
            .fetch_next_job(&["default".into()], &test.cancel_after(Duration::from_secs(10)))
            .await
            .expect("Failed to fetch job");

        let claimed = &test.queue_rows().await[0];
        assert!(claimed.fetched_at.is_some());
        assert!(claimed.fetch_token.is_some());

        // Neither removed nor requeued: release must requeue.
        fetched.release().await.unwrap();

        let row = &test.queue_rows().await[0];
        assert!(row.fetched_at.is_none());
    })
    .await;
}

#[tokio::test]
async fn dropping_an_unfinished_handle_requeues_in_the_background() {
    with_test_storage(|test| async move {
        test.create_enqueued_job("default").await;

        let fetched = test
            .storage
            .connection()
            .fetch_next_job(&["default".into()], &test.cancel_after(Duration::from_secs(10)))
            .await
            .expect("Failed to fetch job");
        drop(fetched);

        let mut requeued = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if test.queue_rows().await[0].fetched_at.is_none() {
                requeued = true;
                break;
            }
        }
        assert!(requeued, "Abandoned slot was never requeued");
    })
    .await;
}

#[tokio::test]
async fn fetch_spans_multiple_queues() {
    with_test_storage(|test| async move {
        let first = test.create_enqueued_job("default").await;
        let second = test.create_enqueued_job("critical").await;

        let connection = test.storage.connection();
        let queues = vec!["critical".to_string(), "default".to_string()];

        let mut a = connection
            .fetch_next_job(&queues, &test.cancel_after(Duration::from_secs(10)))
            .await
            .expect("Failed to fetch first job");
        let mut b = connection
            .fetch_next_job(&queues, &test.cancel_after(Duration::from_secs(10)))
            .await
            .expect("Failed to fetch second job");

        let mut job_ids = vec![a.job_id().clone(), b.job_id().clone()];
        job_ids.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(job_ids, expected);
        assert!(["default", "critical"].contains(&a.queue().as_str()));
        assert!(["default", "critical"].contains(&b.queue().as_str()));

        a.remove_from_queue().await.unwrap();
        b.remove_from_queue().await.unwrap();
        a.release().await.unwrap();
        b.release().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn stale_claims_become_reclaimable() {
    with_test_storage(|test| async move {
        test.create_enqueued_job("default").await;

        let connection = test.storage.connection();
        let first = connection
            .fetch_next_job(&["default".into()], &test.cancel_after(Duration::from_secs(10)))
            .await
            .expect("Failed to fetch job");
        let first_token = test.queue_rows().await[0].fetch_token.clone();

        // Simulate a consumer that went away without finishing.
        sqlx::query(&format!(
            "UPDATE {} SET `FetchedAt` = UTC_TIMESTAMP(6) - INTERVAL 40 MINUTE",
            test.table("JobQueue")
        ))
        .execute(&test.assert_pool)
        .await
        .unwrap();

        let mut reclaimed = connection
            .fetch_next_job(&["default".into()], &test.cancel_after(Duration::from_secs(10)))
            .await
            .expect("Stale slot was not reclaimable");

        let row = &test.queue_rows().await[0];
        assert_ne!(row.fetch_token, first_token, "Reclaim must assign a new token");

        reclaimed.remove_from_queue().await.unwrap();
        reclaimed.release().await.unwrap();
        drop(first);
    })
    .await;
}

#[tokio::test]
async fn only_one_consumer_claims_a_single_slot() {
    with_test_storage(|test| async move {
        test.create_enqueued_job("default").await;

        let mut claims = Vec::new();
        for _ in 0..4 {
            let connection = test.storage.connection();
            let cancel = test.cancel_after(Duration::from_secs(2));
            claims.push(tokio::task::spawn_local(async move {
                connection.fetch_next_job(&["default".into()], &cancel).await
            }));
        }

        let mut fetched = Vec::new();
        let mut cancelled = 0;
        for claim in claims {
            match claim.await.unwrap() {
                Ok(handle) => fetched.push(handle),
                Err(StorageError::Cancelled) => cancelled += 1,
                Err(other) => panic!("unexpected failure: {other:?}"),
            }
        }

        assert_eq!(fetched.len(), 1, "Exactly one consumer may win the slot");
        assert_eq!(cancelled, 3);

        let rows = test.queue_rows().await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].fetch_token.is_some());

        let mut winner = fetched.pop().unwrap();
        winner.remove_from_queue().await.unwrap();
        winner.release().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn fetching_from_no_queues_is_invalid() {
    with_test_storage(|test| async move {
        let result = test
            .storage
            .connection()
            .fetch_next_job(&[], &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StorageError::Validation(_))));
    })
    .await;
}
