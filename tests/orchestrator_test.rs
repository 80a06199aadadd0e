//! End-to-end tests for the orchestrator: submission, scheduling, item
//! failures, control requests and dead letters.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use workq::db::Db;
use workq::dead_letter::DeadLetterFilter;
use workq::engine::Orchestrator;
use workq::error::Error;
use workq::event::{EventKind, JobUpdate};
use workq::model::failure::{FailureClass, FailureReason};
use workq::model::{ItemState, JobState, NewJob, Priority};

use common::*;

fn job(kind: &str, label: &str, items: u32) -> NewJob {
    NewJob::new(kind, "tenant-a", "actor-a")
        .payload(json!({ "label": label }))
        .items((0..items).map(|i| json!({ "n": i })))
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatches_by_tier_then_submission_order() {
    let mut settings = fast_settings();
    settings.workers = 1;
    let (recorder, mut seen) = Recorder::new();
    let orch = orchestrator(settings, vec![("record", recorder)]).await;

    let a = orch
        .submit_job(job("record", "A", 1).priority(Priority::Low))
        .await
        .unwrap();
    let b = orch
        .submit_job(job("record", "B", 1).priority(Priority::Urgent))
        .await
        .unwrap();
    let c = orch
        .submit_job(job("record", "C", 1).priority(Priority::Normal))
        .await
        .unwrap();
    assert_eq!(orch.queued(), 3);

    orch.start();
    for id in [a, b, c] {
        finish(&orch, id).await;
    }

    let mut order = Vec::new();
    while let Ok((label, _)) = seen.try_recv() {
        order.push(label);
    }
    assert_eq!(order, ["B", "C", "A"]);
    orch.shutdown().await;
}

#[tokio::test]
async fn start_after_holds_job_until_due() {
    let (recorder, _seen) = Recorder::new();
    let orch = orchestrator(fast_settings(), vec![("record", recorder)]).await;
    orch.start();

    let id = orch
        .submit_job(
            job("record", "later", 1).start_after(Utc::now() + chrono::Duration::milliseconds(150)),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    let status = orch.get_job_status(id).await.unwrap();
    assert_eq!(status.job.state, JobState::Pending);

    let status = finish(&orch, id).await;
    assert_eq!(status.job.state, JobState::Completed);
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_idempotency_key_returns_existing_job() {
    let (recorder, _seen) = Recorder::new();
    let orch = orchestrator(fast_settings(), vec![("record", recorder)]).await;

    let first = orch
        .submit(job("record", "x", 2).idempotency_key("import-42"))
        .await
        .unwrap();
    let second = orch
        .submit(job("record", "x", 5).idempotency_key("import-42"))
        .await
        .unwrap();

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(first.job_id(), second.job_id());
    assert_eq!(orch.list_jobs(None).await.unwrap().len(), 1);
    assert_eq!(orch.queued(), 1);

    let status = orch.get_job_status(first.job_id()).await.unwrap();
    assert_eq!(status.job.counters.total, 2);

    let events = orch.get_job_events(first.job_id()).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::Resubmitted { idempotency_key } if idempotency_key == "import-42"
    )));
}

#[tokio::test]
async fn unknown_kind_is_rejected() {
    let orch = orchestrator(fast_settings(), vec![]).await;
    let err = orch.submit(job("nope", "x", 1)).await.unwrap_err();
    assert!(matches!(err, Error::UnknownJobKind(kind) if kind == "nope"));
    assert!(orch.list_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn submit_after_shutdown_is_rejected() {
    let (recorder, _seen) = Recorder::new();
    let orch = orchestrator(fast_settings(), vec![("record", recorder)]).await;
    orch.start();
    orch.shutdown().await;

    let err = orch.submit(job("record", "late", 1)).await.unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}

// ---------------------------------------------------------------------------
// Item failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn permanent_item_failures_dead_letter_and_job_completes() {
    let handler = Arc::new(FailsOn {
        indexes: HashSet::from([2, 5, 8]),
    });
    let orch = orchestrator(fast_settings(), vec![("import", handler)]).await;
    orch.start();

    let id = orch.submit_job(job("import", "batch", 10)).await.unwrap();
    let status = finish(&orch, id).await;

    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.job.counters.completed, 7);
    assert_eq!(status.job.counters.failed, 3);
    assert_eq!(status.progress.percent_complete, Some(100.0));
    assert!(status.job.failure_reason.is_none());

    let entries = orch
        .list_dead_letters(&DeadLetterFilter {
            job_id: Some(id),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut indexes: Vec<_> = entries.iter().map(|e| e.item.index).collect();
    indexes.sort_unstable();
    assert_eq!(indexes, [2, 5, 8]);
    for entry in &entries {
        assert_eq!(entry.class, FailureClass::Permanent);
        assert_eq!(entry.attempts(), 1);
        assert_eq!(entry.history().len(), 1);
    }
    orch.shutdown().await;
}

#[tokio::test]
async fn failure_rate_above_threshold_fails_job() {
    let mut settings = fast_settings();
    settings.failure.fatal_failure_rate = 0.2;
    let handler = Arc::new(FailsOn {
        indexes: HashSet::from([0, 1, 2]),
    });
    let orch = orchestrator(settings, vec![("import", handler)]).await;
    orch.start();

    let id = orch.submit_job(job("import", "bad", 10)).await.unwrap();
    let status = finish(&orch, id).await;

    assert_eq!(status.job.state, JobState::Failed);
    assert_eq!(
        status.job.failure_reason,
        Some(FailureReason::FatalItemFailureRate)
    );
    assert_eq!(status.job.counters.failed, 3);
    assert_eq!(status.job.counters.canceled, 7);
    assert!(status.job.counters.is_consistent());
    orch.shutdown().await;
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let handler = Flaky::new(2);
    let orch = orchestrator(fast_settings(), vec![("flaky", handler.clone())]).await;
    orch.start();

    let id = orch.submit_job(job("flaky", "retry", 3)).await.unwrap();
    let status = finish(&orch, id).await;

    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.job.counters.completed, 3);
    assert_eq!(status.job.attempts, 9);
    for item in &status.job.items {
        assert_eq!(item.attempts, 3);
        assert_eq!(item.result, Some(json!({ "calls": 3 })));
    }

    let events = orch.get_job_events(id).await.unwrap();
    let failed_attempts = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::AttemptFailed { .. }))
        .count();
    assert_eq!(failed_attempts, 6);
    orch.shutdown().await;
}

#[tokio::test]
async fn storage_error_mid_item_releases_job_for_another_pass() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("workq.db").display());
    let db = Arc::new(Db::connect(&url).await.unwrap());
    let mut settings = fast_settings();
    settings.workers = 1;
    settings.scheduler.release_delay_ms = 20;
    let handler = Arc::new(FailsOn {
        indexes: HashSet::from([1]),
    });
    let orch = Orchestrator::builder()
        .settings(settings)
        .db(Arc::clone(&db))
        .handler("import", handler)
        .build()
        .await
        .unwrap();

    // Dead-lettering item 1 fails until the table is back.
    let admin = sqlx::SqlitePool::connect(&url).await.unwrap();
    sqlx::query("DROP TABLE dead_letters")
        .execute(&admin)
        .await
        .unwrap();

    let id = orch.submit_job(job("import", "outage", 4)).await.unwrap();
    orch.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = orch.get_job_status(id).await.unwrap();
        if status.job.counters.completed == 1 && status.job.parked {
            assert_eq!(status.job.state, JobState::Running);
            assert_eq!(status.job.items[1].state, ItemState::Pending);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job was never released");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    sqlx::query(
        "CREATE TABLE dead_letters (
            id TEXT PRIMARY KEY NOT NULL,
            job_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            class TEXT NOT NULL,
            body TEXT NOT NULL,
            enqueued_at_ms INTEGER NOT NULL
        )",
    )
    .execute(&admin)
    .await
    .unwrap();

    let status = finish(&orch, id).await;
    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.job.counters.completed, 3);
    assert_eq!(status.job.counters.failed, 1);
    assert!(status.job.items[1].attempts >= 2);

    let entries = orch
        .list_dead_letters(&DeadLetterFilter {
            job_id: Some(id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    orch.shutdown().await;
}

#[tokio::test]
async fn rate_limited_job_is_rescheduled_and_finishes() {
    let mut settings = fast_settings();
    settings.rate_limit.actor_limit = 2;
    settings.rate_limit.actor_window_ms = 100;
    let (recorder, mut seen) = Recorder::new();
    let orch = orchestrator(settings, vec![("record", recorder)]).await;
    orch.start();

    let id = orch.submit_job(job("record", "burst", 5)).await.unwrap();
    let status = finish(&orch, id).await;

    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.job.counters.completed, 5);
    assert!(!status.job.rate_limited);

    let mut indexes = Vec::new();
    while let Ok((_, index)) = seen.try_recv() {
        indexes.push(index);
    }
    assert_eq!(indexes, [0, 1, 2, 3, 4]);

    let events = orch.get_job_events(id).await.unwrap();
    assert!(
        events
            .iter()
            .any(|e| matches!(e.kind, EventKind::RateLimited { .. }))
    );
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pause_at_item_boundary_then_resume_in_order() {
    let (gate, mut started, permits) = Gate::new();
    let orch = orchestrator(fast_settings(), vec![("gate", gate)]).await;

    let id = orch.submit_job(job("gate", "paced", 10)).await.unwrap();
    let mut updates = orch.subscribe(id).await.unwrap();
    orch.start();
    for index in 0..4 {
        assert_eq!(started.recv().await, Some(index));
        if index == 3 {
            orch.pause_job(id).await.unwrap();
        }
        permits.add_permits(1);
    }

    wait_for_state(&orch, id, JobState::Paused).await;
    let status = orch.get_job_status(id).await.unwrap();
    assert_eq!(status.job.counters.completed, 4);
    assert_eq!(status.job.counters.pending, 6);
    assert!(started.try_recv().is_err(), "no item may start while paused");

    // Everything up to the pause is already published; nothing follows it.
    while let Some(update) = updates.recv().await {
        if matches!(update, JobUpdate::StateChanged { new_state: JobState::Paused, .. }) {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(updates.try_recv(), None, "no updates while paused");

    orch.resume_job(id).await.unwrap();
    assert!(matches!(
        updates.recv().await,
        Some(JobUpdate::StateChanged {
            prior_state: JobState::Paused,
            new_state: JobState::Running,
            ..
        })
    ));
    permits.add_permits(6);
    let status = finish(&orch, id).await;
    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.job.counters.completed, 10);

    let mut rest = Vec::new();
    while let Ok(index) = started.try_recv() {
        rest.push(index);
    }
    assert_eq!(rest, [4, 5, 6, 7, 8, 9]);
    orch.shutdown().await;
}

#[tokio::test]
async fn cancel_lets_in_flight_item_finish() {
    let (gate, mut started, permits) = Gate::new();
    let orch = orchestrator(fast_settings(), vec![("gate", gate)]).await;
    orch.start();

    let id = orch.submit_job(job("gate", "doomed", 6)).await.unwrap();
    assert_eq!(started.recv().await, Some(0));
    permits.add_permits(1);
    assert_eq!(started.recv().await, Some(1));

    orch.cancel_job(id).await.unwrap();
    let status = orch.get_job_status(id).await.unwrap();
    assert_eq!(status.job.state, JobState::Canceling);

    permits.add_permits(1);
    let status = finish(&orch, id).await;
    assert_eq!(status.job.state, JobState::Canceled);
    assert_eq!(status.job.counters.completed, 2);
    assert_eq!(status.job.counters.canceled, 4);
    assert!(started.try_recv().is_err());
    orch.shutdown().await;
}

#[tokio::test]
async fn cancel_before_dispatch_is_immediate() {
    let (recorder, mut seen) = Recorder::new();
    let orch = orchestrator(fast_settings(), vec![("record", recorder)]).await;

    let id = orch.submit_job(job("record", "never", 3)).await.unwrap();
    orch.cancel_job(id).await.unwrap();

    let status = orch.get_job_status(id).await.unwrap();
    assert_eq!(status.job.state, JobState::Canceled);
    assert!(
        status
            .job
            .items
            .iter()
            .all(|item| item.state == ItemState::Canceled)
    );
    assert_eq!(orch.queued(), 0);

    orch.start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(seen.try_recv().is_err());
    orch.shutdown().await;
}

#[tokio::test]
async fn pause_of_finished_job_is_rejected() {
    let (recorder, _seen) = Recorder::new();
    let orch = orchestrator(fast_settings(), vec![("record", recorder)]).await;
    orch.start();

    let id = orch.submit_job(job("record", "quick", 1)).await.unwrap();
    finish(&orch, id).await;

    let err = orch.pause_job(id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    orch.shutdown().await;
}

#[tokio::test]
async fn deadline_fails_running_job() {
    let handler = Arc::new(Sleepy {
        per_item: Duration::from_millis(40),
    });
    let orch = orchestrator(fast_settings(), vec![("slow", handler)]).await;
    orch.start();

    let id = orch
        .submit_job(
            job("slow", "late", 20).deadline(Utc::now() + chrono::Duration::milliseconds(150)),
        )
        .await
        .unwrap();
    let status = finish(&orch, id).await;

    assert_eq!(status.job.state, JobState::Failed);
    assert_eq!(
        status.job.failure_reason,
        Some(FailureReason::DeadlineExceeded)
    );
    assert!(status.job.counters.completed < 20);
    assert!(status.job.counters.canceled > 0);
    assert_eq!(status.job.counters.pending, 0);
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscriber_sees_lifecycle_in_order() {
    let (recorder, _seen) = Recorder::new();
    let orch = orchestrator(fast_settings(), vec![("record", recorder)]).await;

    let id = orch.submit_job(job("record", "watched", 4)).await.unwrap();
    let mut updates = orch.subscribe(id).await.unwrap();
    orch.start();

    let mut received = Vec::new();
    while let Some(update) = updates.recv().await {
        received.push(update);
    }
    assert_eq!(
        states(&received),
        [JobState::Running, JobState::Completing, JobState::Completed]
    );
    assert!(received.last().is_some_and(|u| u.is_terminal()));

    let percents: Vec<f64> = received
        .iter()
        .filter_map(|u| match u {
            JobUpdate::Progress { progress, .. } => progress.percent_complete,
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100.0));

    // Finished jobs yield a closed stream.
    let mut late = orch.subscribe(id).await.unwrap();
    assert!(late.recv().await.is_none());
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_letter_retry_resubmits_item() {
    let mut settings = fast_settings();
    settings.failure.fatal_failure_rate = 1.0;
    let handler = Arc::new(Switch {
        healthy: AtomicBool::new(false),
    });
    let orch = orchestrator(settings, vec![("sync", handler.clone())]).await;
    orch.start();

    let id = orch
        .submit_job(
            NewJob::new("sync", "tenant-b", "actor-b").item(json!({ "record": "r-17" })),
        )
        .await
        .unwrap();
    let status = finish(&orch, id).await;
    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.job.counters.failed, 1);

    let entries = orch
        .list_dead_letters(&DeadLetterFilter {
            tenant_id: Some("tenant-b".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.error.code.as_deref(), Some("E_REJECT"));
    assert_eq!(entry.item.payload, json!({ "record": "r-17" }));

    handler.healthy.store(true, Ordering::SeqCst);
    let retried = orch.retry_dead_letter(entry.id).await.unwrap();
    assert_ne!(retried, id);

    let status = finish(&orch, retried).await;
    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.job.origin, Some(entry.id));
    assert_eq!(status.job.items[0].result, Some(json!({ "record": "r-17" })));

    assert!(matches!(
        orch.get_dead_letter(entry.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        orch.retry_dead_letter(entry.id).await,
        Err(Error::NotFound(_))
    ));
    orch.shutdown().await;
}

#[tokio::test]
async fn sweep_purges_expired_dead_letters_and_archives_jobs() {
    let mut settings = fast_settings();
    settings.failure.fatal_failure_rate = 1.0;
    let handler = Arc::new(FailsOn {
        indexes: HashSet::from([0]),
    });
    let orch = orchestrator(settings, vec![("import", handler)]).await;
    orch.start();

    let id = orch
        .submit_job(job("import", "old", 2).idempotency_key("nightly"))
        .await
        .unwrap();
    finish(&orch, id).await;

    // Nothing is old enough yet.
    let report = orch.sweep_at(Utc::now()).await.unwrap();
    assert_eq!(report.dead_letters_purged, 0);
    assert_eq!(report.jobs_archived, 0);

    let report = orch
        .sweep_at(Utc::now() + chrono::Duration::days(8))
        .await
        .unwrap();
    assert_eq!(report.dead_letters_purged, 1);
    assert_eq!(report.jobs_archived, 1);
    assert!(matches!(
        orch.get_job_status(id).await,
        Err(Error::NotFound(_))
    ));

    // The key is free again after archival.
    let again = orch
        .submit(job("import", "old", 1).idempotency_key("nightly"))
        .await
        .unwrap();
    assert!(again.is_created());
    orch.shutdown().await;
}
