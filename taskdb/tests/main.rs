//! Public task-store API: claim atomicity, stale reclamation, startup
//! recovery, ordering, and the update laws.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use uuid::Uuid;

use quill_taskdb::{now_ts, Task, TaskDb, TaskDbError, TaskPatch, TaskStatus};

fn random_hash(rng: &mut ChaCha8Rng) -> String {
    (0..32).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

async fn open_db() -> (tempfile::TempDir, TaskDb) {
    let dir = tempdir().unwrap();
    let db = TaskDb::new(dir.path().join("tasks.db"));
    db.init().await.unwrap();
    (dir, db)
}

/// Mark a queued row as claimed by `worker` at `started`, bypassing
/// `claim_next`, to seed recovery scenarios.
async fn force_processing(db: &TaskDb, id: Uuid, worker: &str, started: f64) {
    db.update(
        id,
        TaskPatch {
            status: Some(TaskStatus::Processing),
            worker_id: Some(Some(worker.to_string())),
            processing_started: Some(Some(started)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn init_twice_is_idempotent() {
    let dir = tempdir().unwrap();
    let db = TaskDb::new(dir.path().join("tasks.db"));
    db.init().await.unwrap();
    db.init().await.unwrap();

    let task = Task::new(Uuid::new_v4(), "a.pdf", None);
    db.create(&task).await.unwrap();
    assert_eq!(db.get(task.id).await.unwrap().unwrap(), task);

    // A second handle over the same file sees the same schema.
    let again = TaskDb::new(dir.path().join("tasks.db"));
    again.init().await.unwrap();
    assert!(again.get(task.id).await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let (_dir, db) = open_db().await;
    let task = Task::new(Uuid::new_v4(), "a.pdf", None);
    db.create(&task).await.unwrap();
    let err = db.create(&task).await.unwrap_err();
    assert!(matches!(err, TaskDbError::DuplicateId(id) if id == task.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_exactly_one_winner() {
    let (_dir, db) = open_db().await;
    let mut task = Task::new(Uuid::new_v4(), "contested.pdf", None);
    task.created_at = 1000.0;
    db.create(&task).await.unwrap();

    let (a, b) = tokio::join!(db.claim_next("w1"), db.claim_next("w2"));
    let (a, b) = (a.unwrap(), b.unwrap());

    // Exactly one of the two claimants got the task.
    assert!(a.is_some() ^ b.is_some());
    let (winner, claimed) = match (&a, &b) {
        (Some(t), None) => ("w1", t),
        (None, Some(t)) => ("w2", t),
        _ => unreachable!(),
    };
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.worker_id.as_deref(), Some(winner));

    let stored = db.get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Processing);
    assert_eq!(stored.worker_id.as_deref(), Some(winner));
    assert!(stored.processing_started.unwrap() >= 1000.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claims_never_hand_out_the_same_task_twice() {
    let (_dir, db) = open_db().await;
    for i in 0..2 {
        db.create(&Task::new(Uuid::new_v4(), format!("t{i}.pdf"), None))
            .await
            .unwrap();
    }

    let (a, b, c, d) = tokio::join!(
        db.claim_next("w1"),
        db.claim_next("w2"),
        db.claim_next("w3"),
        db.claim_next("w4"),
    );
    let claimed: Vec<_> = [a, b, c, d]
        .into_iter()
        .map(|r| r.unwrap())
        .flatten()
        .collect();

    // Two tasks, four claimants: two wins, no duplicates.
    assert_eq!(claimed.len(), 2);
    assert_ne!(claimed[0].id, claimed[1].id);
}

#[tokio::test]
async fn stale_claims_are_returned_to_the_queue() {
    let (_dir, db) = open_db().await;

    let stale = Task::new(Uuid::new_v4(), "hung.pdf", None);
    db.create(&stale).await.unwrap();
    force_processing(&db, stale.id, "w1", now_ts() - 600.0).await;

    let healthy = Task::new(Uuid::new_v4(), "active.pdf", None);
    db.create(&healthy).await.unwrap();
    force_processing(&db, healthy.id, "w2", now_ts() - 10.0).await;

    assert_eq!(db.release_stale(300).await.unwrap(), 1);

    let reclaimed = db.get(stale.id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, TaskStatus::Queued);
    assert!(reclaimed.worker_id.is_none());
    assert!(reclaimed.processing_started.is_none());
    assert!(reclaimed.message.contains("timeout"));

    let untouched = db.get(healthy.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, TaskStatus::Processing);
    assert_eq!(untouched.worker_id.as_deref(), Some("w2"));
}

#[tokio::test]
async fn zero_timeout_releases_every_processing_task() {
    let (_dir, db) = open_db().await;
    for i in 0..3 {
        let task = Task::new(Uuid::new_v4(), format!("t{i}.pdf"), None);
        db.create(&task).await.unwrap();
        force_processing(&db, task.id, "w1", now_ts() - 1.0).await;
    }
    assert_eq!(db.release_stale(0).await.unwrap(), 3);
}

#[tokio::test]
async fn startup_reset_fails_orphans_and_keeps_the_queue() {
    let (_dir, db) = open_db().await;

    let a = Task::new(Uuid::new_v4(), "a.pdf", None);
    let b = Task::new(Uuid::new_v4(), "b.pdf", None);
    let c = Task::new(Uuid::new_v4(), "c.pdf", None);
    for task in [&a, &b, &c] {
        db.create(task).await.unwrap();
    }
    force_processing(&db, a.id, "w1", now_ts()).await;
    force_processing(&db, b.id, "w2", now_ts()).await;

    assert_eq!(db.reset_startup().await.unwrap(), 2);

    for id in [a.id, b.id] {
        let orphan = db.get(id).await.unwrap().unwrap();
        assert_eq!(orphan.status, TaskStatus::Failed);
        assert_eq!(orphan.message, "Server was restarted while processing");
        assert!(orphan.worker_id.is_none());
        assert!(orphan.processing_started.is_none());
    }
    let queued = db.get(c.id).await.unwrap().unwrap();
    assert_eq!(queued.status, TaskStatus::Queued);
}

#[tokio::test]
async fn claims_follow_creation_order() {
    let (_dir, db) = open_db().await;
    let mut ids = Vec::new();
    for i in 0..10 {
        let mut task = Task::new(Uuid::new_v4(), format!("t{i}.pdf"), None);
        task.created_at = 1000.0 + i as f64;
        task.updated_at = task.created_at;
        db.create(&task).await.unwrap();
        ids.push(task.id);
    }

    let workers = ["w1", "w2", "w3"];
    for (i, expected) in ids.iter().enumerate() {
        let claimed = db
            .claim_next(workers[i % workers.len()])
            .await
            .unwrap()
            .expect("queue should not be empty yet");
        assert_eq!(claimed.id, *expected, "claim {i} out of order");
    }
    assert!(db.claim_next("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn equal_timestamps_break_ties_by_insertion_order() {
    let (_dir, db) = open_db().await;
    let mut ids = Vec::new();
    for i in 0..5 {
        let mut task = Task::new(Uuid::new_v4(), format!("t{i}.pdf"), None);
        task.created_at = 1000.0;
        db.create(&task).await.unwrap();
        ids.push(task.id);
    }
    for expected in &ids {
        let claimed = db.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, *expected);
    }
}

#[tokio::test]
async fn empty_update_only_bumps_updated_at() {
    let (_dir, db) = open_db().await;
    let task = Task::new(Uuid::new_v4(), "a.pdf", None);
    db.create(&task).await.unwrap();

    let before = db.get(task.id).await.unwrap().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    db.update(task.id, TaskPatch::default()).await.unwrap();
    let after = db.get(task.id).await.unwrap().unwrap();

    assert!(after.updated_at > before.updated_at);
    let normalized = Task {
        updated_at: before.updated_at,
        ..after
    };
    assert_eq!(normalized, before);
}

#[tokio::test]
async fn claim_then_release_restores_the_row() {
    let (_dir, db) = open_db().await;
    let task = Task::new(Uuid::new_v4(), "a.pdf", Some("c".repeat(64)));
    db.create(&task).await.unwrap();

    let before = db.get(task.id).await.unwrap().unwrap();
    db.claim_next("w1").await.unwrap().unwrap();
    db.update(task.id, TaskPatch::released()).await.unwrap();
    let after = db.get(task.id).await.unwrap().unwrap();

    assert!(after.updated_at >= before.updated_at);
    let normalized = Task {
        updated_at: before.updated_at,
        ..after
    };
    assert_eq!(normalized, before);
}

#[tokio::test]
async fn hash_lookup_returns_the_newest_completed_match() {
    let (_dir, db) = open_db().await;
    let mut rng = ChaCha8Rng::seed_from_u64(123);
    let hash = random_hash(&mut rng);

    let mut old = Task::new(Uuid::new_v4(), "old.pdf", Some(hash.clone()));
    old.created_at = 1000.0;
    old.status = TaskStatus::Completed;
    old.result_path = Some("/results/old.zip".to_string());
    db.create(&old).await.unwrap();

    let mut newer = Task::new(Uuid::new_v4(), "newer.pdf", Some(hash.clone()));
    newer.created_at = 2000.0;
    newer.status = TaskStatus::Completed;
    newer.result_path = Some("/results/newer.zip".to_string());
    db.create(&newer).await.unwrap();

    // Still-running duplicates never count as cache hits.
    let mut running = Task::new(Uuid::new_v4(), "running.pdf", Some(hash.clone()));
    running.created_at = 3000.0;
    db.create(&running).await.unwrap();

    let hit = db.get_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(hit.id, newer.id);

    assert!(db.get_by_hash(&"f".repeat(64)).await.unwrap().is_none());
}

#[tokio::test]
async fn cleanup_returns_old_rows_with_their_artifacts() {
    let (_dir, db) = open_db().await;

    let mut old_done = Task::new(Uuid::new_v4(), "old.pdf", None);
    old_done.created_at = now_ts() - 10.0 * 86_400.0;
    old_done.status = TaskStatus::Completed;
    old_done.result_path = Some("/results/old.zip".to_string());
    db.create(&old_done).await.unwrap();

    let mut old_failed = Task::new(Uuid::new_v4(), "older.pdf", None);
    old_failed.created_at = now_ts() - 30.0 * 86_400.0;
    old_failed.status = TaskStatus::Failed;
    db.create(&old_failed).await.unwrap();

    let fresh = Task::new(Uuid::new_v4(), "fresh.pdf", None);
    db.create(&fresh).await.unwrap();

    let mut removed = db.cleanup_older_than(7).await.unwrap();
    removed.sort_by_key(|(id, _)| *id);
    let mut expected = vec![
        (old_done.id, Some("/results/old.zip".to_string())),
        (old_failed.id, None),
    ];
    expected.sort_by_key(|(id, _)| *id);
    assert_eq!(removed, expected);

    assert!(db.get(old_done.id).await.unwrap().is_none());
    assert!(db.get(fresh.id).await.unwrap().is_some());
}

#[tokio::test]
async fn delete_removes_a_single_row() {
    let (_dir, db) = open_db().await;
    let task = Task::new(Uuid::new_v4(), "a.pdf", None);
    db.create(&task).await.unwrap();
    db.delete(task.id).await.unwrap();
    assert!(db.get(task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn pending_listing_skips_failed_and_downloaded() {
    let (_dir, db) = open_db().await;

    let queued = Task::new(Uuid::new_v4(), "q.pdf", None);
    db.create(&queued).await.unwrap();

    let mut failed = Task::new(Uuid::new_v4(), "f.pdf", None);
    failed.status = TaskStatus::Failed;
    db.create(&failed).await.unwrap();

    let mut fetched = Task::new(Uuid::new_v4(), "d.pdf", None);
    fetched.status = TaskStatus::Completed;
    fetched.downloaded = true;
    db.create(&fetched).await.unwrap();

    let pending = db.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, queued.id);
}

#[tokio::test]
async fn stats_aggregate_the_whole_queue() {
    let (_dir, db) = open_db().await;

    for _ in 0..2 {
        db.create(&Task::new(Uuid::new_v4(), "q.pdf", None))
            .await
            .unwrap();
    }

    let in_flight = Task::new(Uuid::new_v4(), "p.pdf", None);
    db.create(&in_flight).await.unwrap();
    force_processing(&db, in_flight.id, "w1", now_ts()).await;

    // Completed twenty seconds after its claim, within the last hour.
    let mut done = Task::new(Uuid::new_v4(), "c.pdf", None);
    done.status = TaskStatus::Completed;
    done.processing_started = Some(now_ts() - 20.0);
    done.progress = 100;
    done.result_path = Some("/results/c.zip".to_string());
    db.create(&done).await.unwrap();

    let mut failed = Task::new(Uuid::new_v4(), "f.pdf", None);
    failed.status = TaskStatus::Failed;
    db.create(&failed).await.unwrap();

    let stats = db.stats().await.unwrap();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total, 5);
    assert_eq!(stats.active_workers, 1);
    assert_eq!(stats.completed_last_hour, 1);
    assert!(stats.avg_processing_secs > 0.0);
}
