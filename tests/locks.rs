use std::time::{Duration, Instant};

use helpers::with_test_storage;
use stoker_mysql::StorageError;
use tokio_util::sync::CancellationToken;

mod helpers;

#[tokio::test]
async fn distributed_locks_are_mutually_exclusive() {
    with_test_storage(|test| async move {
        let connection = test.storage.connection();
        let cancel = CancellationToken::new();

        let held = connection
            .acquire_distributed_lock("recurring-jobs", Duration::from_secs(5), &cancel)
            .await
            .expect("First acquisition must succeed immediately");

        assert!(
            test.lock_holder("recurring-jobs").await.is_some(),
            "Lock must be visible server-side"
        );

        // A second holder can only get in after the first releases.
        let storage = test.reopen().await;
        let second_cancel = cancel.clone();
        let contender = tokio::task::spawn_local(async move {
            let started = Instant::now();
            let lock = storage
                .connection()
                .acquire_distributed_lock("recurring-jobs", Duration::from_secs(5), &second_cancel)
                .await;
            let waited = started.elapsed();
            storage.close().await;
            (lock, waited)
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        held.release().await;

        let (lock, waited) = contender.await.unwrap();
        let lock = lock.expect("Second acquisition must succeed after release");
        assert!(
            waited >= Duration::from_millis(250),
            "Contender cannot get in before the release"
        );
        assert!(
            waited < Duration::from_secs(2),
            "One poll interval should suffice after release, waited {waited:?}"
        );
        lock.release().await;

        assert_eq!(test.lock_holder("recurring-jobs").await, None);
    })
    .await;
}

#[tokio::test]
async fn contended_acquisition_times_out() {
    with_test_storage(|test| async move {
        let connection = test.storage.connection();
        let cancel = CancellationToken::new();

        let held = connection
            .acquire_distributed_lock("singleton", Duration::from_secs(5), &cancel)
            .await
            .unwrap();

        let storage = test.reopen().await;
        let result = storage
            .connection()
            .acquire_distributed_lock("singleton", Duration::from_millis(600), &cancel)
            .await;
        assert!(matches!(result, Err(StorageError::LockTimeout { .. })));
        storage.close().await;

        held.release().await;
    })
    .await;
}

#[tokio::test]
async fn cancellation_interrupts_a_blocked_acquisition() {
    with_test_storage(|test| async move {
        let connection = test.storage.connection();

        let held = connection
            .acquire_distributed_lock("singleton", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        let storage = test.reopen().await;
        let result = storage
            .connection()
            .acquire_distributed_lock(
                "singleton",
                Duration::from_secs(30),
                &test.cancel_after(Duration::from_millis(400)),
            )
            .await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
        storage.close().await;

        held.release().await;
    })
    .await;
}

#[tokio::test]
async fn no_session_leaks_locks_back_into_the_pool() {
    with_test_storage(|test| async move {
        let connection = test.storage.connection();
        let cancel = CancellationToken::new();

        // A distributed lock released the regular way.
        let lock = connection
            .acquire_distributed_lock("leak-check", Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        lock.release().await;
        assert_eq!(test.lock_holder("leak-check").await, None);

        // Repeater-held resource locks must be gone after the call returns.
        test.create_enqueued_job("default").await;
        let mut fetched = connection
            .fetch_next_job(&["default".into()], &test.cancel_after(Duration::from_secs(10)))
            .await
            .unwrap();
        fetched.remove_from_queue().await.unwrap();
        fetched.release().await.unwrap();

        for resource in ["queue", "job", "counter", "state", "server", "migration"] {
            assert_eq!(
                test.lock_holder(resource).await,
                None,
                "resource lock `{resource}` leaked"
            );
        }
    })
    .await;
}

#[tokio::test]
async fn overlapping_write_transactions_serialize_without_deadlock() {
    with_test_storage(|test| async move {
        let job_a = test.create_job().await;
        let job_b = test.create_job().await;

        let mut tasks = Vec::new();
        for (job_id, queue) in [(job_a, "default"), (job_b, "critical")] {
            let storage = test.reopen().await;
            tasks.push(tokio::task::spawn_local(async move {
                let cancel = CancellationToken::new();
                for _ in 0..10 {
                    let mut tx = storage.begin_write_only();
                    tx.add_to_queue(queue, &job_id).unwrap();
                    tx.increment_counter("contended");
                    tx.set_job_state(
                        &job_id,
                        &stoker_mysql::StateRecord {
                            name: "Enqueued".into(),
                            ..Default::default()
                        },
                    )
                    .unwrap();
                    tx.commit(&cancel).await.unwrap();
                }
                storage.close().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(test.queue_rows().await.len(), 20);
        assert_eq!(
            test.storage
                .connection()
                .get_counter("contended")
                .await
                .unwrap(),
            20
        );
    })
    .await;
}
