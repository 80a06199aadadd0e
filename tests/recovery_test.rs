//! Restart behaviour: unfinished jobs persisted by one orchestrator are
//! picked up by the next one built on the same database.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use workq::db::Db;
use workq::dead_letter::DeadLetterFilter;
use workq::engine::Orchestrator;
use workq::event::{EventKind, JobUpdate};
use workq::handler::{WorkHandler, WorkOutput};
use workq::model::failure::{ClassifiedError, FailureReason};
use workq::model::{JobContext, JobState, NewJob, WorkItem};

use common::{fast_settings, finish};

struct Counting {
    per_item: Duration,
    calls: AtomicU32,
}

#[async_trait]
impl WorkHandler for Counting {
    fn operation(&self) -> &str {
        "counting"
    }

    async fn execute(
        &self,
        item: &WorkItem,
        _job: &JobContext,
    ) -> Result<WorkOutput, ClassifiedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.per_item).await;
        Ok(WorkOutput::Completed(json!(item.index)))
    }
}

async fn build(db: &Arc<Db>, handler: Option<Arc<Counting>>) -> Orchestrator {
    let mut settings = fast_settings();
    settings.workers = 1;
    let mut builder = Orchestrator::builder()
        .settings(settings)
        .db(Arc::clone(db));
    if let Some(handler) = handler {
        builder = builder.handler("count", handler);
    }
    builder.build().await.unwrap()
}

fn counting() -> Arc<Counting> {
    Arc::new(Counting {
        per_item: Duration::from_millis(25),
        calls: AtomicU32::new(0),
    })
}

#[tokio::test]
async fn running_job_resumes_after_restart() {
    let db = Arc::new(Db::in_memory().await.unwrap());
    let handler = counting();

    let first = build(&db, Some(Arc::clone(&handler))).await;
    let id = first
        .submit_job(
            NewJob::new("count", "tenant", "actor").items((0..6).map(|i| json!({ "i": i }))),
        )
        .await
        .unwrap();
    let mut updates = first.subscribe(id).await.unwrap();
    first.start();

    // Stop as soon as the first item has settled.
    while let Some(update) = updates.recv().await {
        if matches!(update, JobUpdate::Progress { ref progress, .. } if progress.items_completed > 0)
        {
            break;
        }
    }
    first.shutdown().await;

    let stored = db.get_job(id).await.unwrap();
    assert_eq!(stored.state, JobState::Running);
    assert!(stored.parked);
    let done_before = stored.counters.completed;
    assert!(done_before >= 1 && done_before < 6);

    let second = build(&db, Some(Arc::clone(&handler))).await;
    let report = second.recover().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.requeued, 1);

    second.start();
    let status = finish(&second, id).await;
    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.job.counters.completed, 6);
    // Settled items are never run twice.
    assert_eq!(handler.calls.load(Ordering::SeqCst), 6);

    let events = second.get_job_events(id).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::Recovered {
            from: JobState::Running
        }
    )));
    second.shutdown().await;
}

#[tokio::test]
async fn pending_job_is_requeued_after_restart() {
    let db = Arc::new(Db::in_memory().await.unwrap());
    let handler = counting();

    let first = build(&db, Some(Arc::clone(&handler))).await;
    let id = first
        .submit_job(NewJob::new("count", "tenant", "actor").item(json!({})))
        .await
        .unwrap();
    // Never started.
    first.shutdown().await;

    let second = build(&db, Some(Arc::clone(&handler))).await;
    let report = second.recover().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(second.queued(), 1);

    // Recovering twice does not duplicate the job.
    let again = second.recover().await.unwrap();
    assert_eq!(again.recovered, 0);
    assert_eq!(second.queued(), 1);

    second.start();
    let status = finish(&second, id).await;
    assert_eq!(status.job.state, JobState::Completed);
    second.shutdown().await;
}

#[tokio::test]
async fn recovered_job_without_handler_dead_letters() {
    let db = Arc::new(Db::in_memory().await.unwrap());

    let first = build(&db, Some(counting())).await;
    let id = first
        .submit_job(NewJob::new("count", "tenant", "actor").item(json!({ "orphan": true })))
        .await
        .unwrap();
    first.shutdown().await;

    let second = build(&db, None).await;
    second.recover().await.unwrap();
    second.start();

    let status = finish(&second, id).await;
    assert_eq!(status.job.state, JobState::Failed);
    assert_eq!(
        status.job.failure_reason,
        Some(FailureReason::FatalItemFailureRate)
    );

    let entries = second
        .list_dead_letters(&DeadLetterFilter {
            job_id: Some(id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].error.code.as_deref(), Some("unknown_kind"));
    second.shutdown().await;
}
