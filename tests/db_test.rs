//! Storage against a SQLite file, the way the CLI uses it.

use serde_json::json;
use workq::db::Db;
use workq::engine::Orchestrator;
use workq::event::EventKind;
use workq::model::{JobState, NewJob};

async fn file_db(dir: &tempfile::TempDir) -> Db {
    let url = format!("sqlite://{}", dir.path().join("workq.db").display());
    let db = Db::connect(&url).await.unwrap();
    db.migrate().await.unwrap();
    db
}

#[tokio::test]
async fn connects_and_migrates() {
    let dir = tempfile::tempdir().unwrap();
    let db = file_db(&dir).await;
    assert!(db.health_check().await.is_ok());
    // Migrations are idempotent.
    db.migrate().await.unwrap();
}

#[tokio::test]
async fn memory_url_uses_private_database() {
    let db = Db::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    assert!(db.list_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn jobs_persist_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let db = std::sync::Arc::new(file_db(&dir).await);
        let orch = Orchestrator::builder()
            .db(db)
            .handler(
                "noop",
                std::sync::Arc::new(workq::handler::CommandHandler::new(
                    toml::from_str(
                        r#"
                        kind = "noop"
                        command = "true"
                        "#,
                    )
                    .unwrap(),
                )),
            )
            .build()
            .await
            .unwrap();
        orch.submit_job(
            NewJob::new("noop", "tenant", "actor")
                .idempotency_key("persisted")
                .items([json!(1), json!(2)]),
        )
        .await
        .unwrap()
    };

    let db = file_db(&dir).await;
    let job = db.get_job(id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.counters.total, 2);
    assert_eq!(
        db.find_job_by_idempotency_key("persisted").await.unwrap(),
        Some(id)
    );

    let unfinished = db.list_unfinished_jobs().await.unwrap();
    assert_eq!(unfinished.len(), 1);
    assert_eq!(
        db.list_jobs(Some(JobState::Pending)).await.unwrap().len(),
        1
    );
    assert!(db.list_jobs(Some(JobState::Running)).await.unwrap().is_empty());

    let events = db.events_for_job(id).await.unwrap();
    assert!(matches!(
        events[0].kind,
        EventKind::Submitted { items: 2, .. }
    ));
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn missing_job_is_not_found() {
    let db = Db::in_memory().await.unwrap();
    db.migrate().await.unwrap();
    let err = db.get_job(workq::model::JobId::new()).await.unwrap_err();
    assert!(matches!(err, workq::error::Error::NotFound(_)));
}
