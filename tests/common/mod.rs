//! Shared fixtures for the orchestrator integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Semaphore, mpsc};
use workq::config::Settings;
use workq::engine::Orchestrator;
use workq::event::JobUpdate;
use workq::handler::{WorkHandler, WorkOutput};
use workq::model::failure::ClassifiedError;
use workq::model::{JobContext, JobId, JobState, WorkItem};

/// Settings with millisecond-scale backoff so retry paths finish quickly.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.workers = 2;
    settings.retry.initial_delay_ms = 5;
    settings.retry.backoff_factor_ms = 5;
    settings.retry.max_delay_ms = 20;
    settings.retry.jitter = 0.0;
    settings.retry.total_timeout_ms = 5_000;
    settings
}

pub async fn orchestrator(
    settings: Settings,
    handlers: Vec<(&str, Arc<dyn WorkHandler>)>,
) -> Orchestrator {
    let mut builder = Orchestrator::builder().settings(settings);
    for (kind, handler) in handlers {
        builder = builder.handler(kind, handler);
    }
    builder.build().await.expect("failed to build orchestrator")
}

/// Wait for the job's state, bounded so a hang fails the test.
pub async fn wait_for_state(orchestrator: &Orchestrator, id: JobId, state: JobState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = orchestrator.get_job_status(id).await.unwrap();
        if status.job.state == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job stuck in {} waiting for {state}",
            status.job.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn finish(orchestrator: &Orchestrator, id: JobId) -> workq::engine::JobStatus {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_for(id))
        .await
        .expect("job did not finish in time")
        .unwrap()
}

pub fn states(updates: &[JobUpdate]) -> Vec<JobState> {
    updates
        .iter()
        .filter_map(|update| match update {
            JobUpdate::StateChanged { new_state, .. } => Some(*new_state),
            JobUpdate::Progress { .. } => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Completes every item, reporting `(job label, item index)` on a channel.
pub struct Recorder {
    pub seen: mpsc::UnboundedSender<(String, u32)>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, u32)>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { seen }), rx)
    }
}

#[async_trait]
impl WorkHandler for Recorder {
    fn operation(&self) -> &str {
        "record"
    }

    async fn execute(
        &self,
        item: &WorkItem,
        job: &JobContext,
    ) -> Result<WorkOutput, ClassifiedError> {
        let label = job.payload["label"].as_str().unwrap_or_default().to_string();
        let _ = self.seen.send((label, item.index));
        Ok(WorkOutput::Completed(json!({ "index": item.index })))
    }
}

/// Fails the listed item indexes permanently and completes the rest.
pub struct FailsOn {
    pub indexes: HashSet<u32>,
}

#[async_trait]
impl WorkHandler for FailsOn {
    fn operation(&self) -> &str {
        "fails-on"
    }

    async fn execute(
        &self,
        item: &WorkItem,
        _job: &JobContext,
    ) -> Result<WorkOutput, ClassifiedError> {
        if self.indexes.contains(&item.index) {
            Err(ClassifiedError::permanent(format!("item {} rejected", item.index)))
        } else {
            Ok(WorkOutput::Completed(json!(item.index)))
        }
    }
}

/// Announces each item as it starts, then holds it until the test
/// releases a permit.
pub struct Gate {
    pub started: mpsc::UnboundedSender<u32>,
    pub permits: Arc<Semaphore>,
}

impl Gate {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<u32>, Arc<Semaphore>) {
        let (started, rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(0));
        (
            Arc::new(Self {
                started,
                permits: Arc::clone(&permits),
            }),
            rx,
            permits,
        )
    }
}

#[async_trait]
impl WorkHandler for Gate {
    fn operation(&self) -> &str {
        "gate"
    }

    async fn execute(
        &self,
        item: &WorkItem,
        _job: &JobContext,
    ) -> Result<WorkOutput, ClassifiedError> {
        let _ = self.started.send(item.index);
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ClassifiedError::system("gate closed"))?;
        permit.forget();
        Ok(WorkOutput::Completed(json!(item.index)))
    }
}

/// Takes a fixed time per item.
pub struct Sleepy {
    pub per_item: Duration,
}

#[async_trait]
impl WorkHandler for Sleepy {
    fn operation(&self) -> &str {
        "sleepy"
    }

    async fn execute(
        &self,
        item: &WorkItem,
        _job: &JobContext,
    ) -> Result<WorkOutput, ClassifiedError> {
        tokio::time::sleep(self.per_item).await;
        Ok(WorkOutput::Completed(json!(item.index)))
    }
}

/// Fails permanently until switched on.
pub struct Switch {
    pub healthy: AtomicBool,
}

#[async_trait]
impl WorkHandler for Switch {
    fn operation(&self) -> &str {
        "switch"
    }

    async fn execute(
        &self,
        item: &WorkItem,
        _job: &JobContext,
    ) -> Result<WorkOutput, ClassifiedError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(WorkOutput::Completed(item.payload.clone()))
        } else {
            Err(ClassifiedError::permanent("downstream rejected the record").with_code("E_REJECT"))
        }
    }
}

/// Fails transiently a fixed number of times per item, then succeeds.
pub struct Flaky {
    pub failures: u32,
    pub calls: parking_lot::Mutex<std::collections::HashMap<u32, u32>>,
}

impl Flaky {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: parking_lot::Mutex::new(Default::default()),
        })
    }
}

#[async_trait]
impl WorkHandler for Flaky {
    fn operation(&self) -> &str {
        "flaky"
    }

    async fn execute(
        &self,
        item: &WorkItem,
        _job: &JobContext,
    ) -> Result<WorkOutput, ClassifiedError> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(item.index).or_default();
            *count += 1;
            *count
        };
        if call <= self.failures {
            Err(ClassifiedError::transient(format!("attempt {call} timed out")))
        } else {
            Ok(WorkOutput::Completed(json!({ "calls": call })))
        }
    }
}
