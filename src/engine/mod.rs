//! Orchestration engine: submission, dispatch, control and retention.

pub mod eta;
mod execution;
mod pool;
pub mod scheduler;
pub mod state;

pub use eta::EtaEstimator;
pub use scheduler::{Dispatch, PriorityScheduler};
pub use state::{ItemDelta, JobStateMachine, JobStatus, Step, SubmitResult};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::breaker::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::broadcast::{JobSubscription, ProgressBroadcaster};
use crate::config::Settings;
use crate::db::Db;
use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterId, DeadLetterStore};
use crate::error::{Error, Result};
use crate::event::JobEvent;
use crate::handler::{HandlerRegistry, WorkHandler};
use crate::limiter::RateLimiter;
use crate::model::{Job, JobId, JobState, NewJob};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::telemetry::metrics;

/// Everything workers and the API share.
struct Shared {
    settings: Settings,
    db: Arc<Db>,
    state: JobStateMachine,
    scheduler: Arc<PriorityScheduler>,
    executor: RetryExecutor,
    handlers: HandlerRegistry,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    dead_letters: Arc<DeadLetterStore>,
    broadcaster: Arc<ProgressBroadcaster>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let dead_letters_purged = self.dead_letters.purge_expired_at(now).await?;

        let retention =
            chrono::Duration::from_std(Duration::from_millis(self.settings.retention.terminal_job_ms))
                .map_err(|e| Error::Config(format!("job retention out of range: {e}")))?;
        let mut jobs_archived = 0;
        if let Some(cutoff) = now.checked_sub_signed(retention) {
            for id in self.db.finished_jobs_before(cutoff).await? {
                if self.state.archive(id).await? {
                    jobs_archived += 1;
                }
            }
        }

        let limits = self.limiter.config();
        let refill = Duration::try_from_secs_f64(limits.tenant_capacity / limits.tenant_refill_per_sec)
            .unwrap_or(Duration::MAX);
        let limiter_keys_evicted = self
            .limiter
            .evict_idle(Instant::now(), limits.actor_window.max(refill));

        let report = SweepReport {
            dead_letters_purged,
            jobs_archived,
            limiter_keys_evicted,
        };
        if report != SweepReport::default() {
            info!(
                dead_letters_purged,
                jobs_archived, limiter_keys_evicted, "retention sweep"
            );
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub dead_letters_purged: u64,
    pub jobs_archived: u64,
    pub limiter_keys_evicted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Unfinished jobs loaded from storage.
    pub recovered: usize,
    /// Of those, jobs put back in the ready queue.
    pub requeued: usize,
}

pub struct OrchestratorBuilder {
    settings: Settings,
    db: Option<Arc<Db>>,
    handlers: HandlerRegistry,
    extra: Vec<(String, Arc<dyn WorkHandler>)>,
}

impl OrchestratorBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Use this database. Defaults to a private in-memory database.
    pub fn db(mut self, db: Arc<Db>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn handler(mut self, kind: impl Into<String>, handler: Arc<dyn WorkHandler>) -> Self {
        self.extra.push((kind.into(), handler));
        self
    }

    /// Validate settings, run migrations and wire the components. Nothing
    /// runs until [`Orchestrator::start`].
    pub async fn build(self) -> Result<Orchestrator> {
        let Self {
            settings,
            db,
            mut handlers,
            extra,
        } = self;
        settings.validate()?;
        for (kind, handler) in extra {
            handlers.register(kind, handler)?;
        }

        let db = match db {
            Some(db) => db,
            None => Arc::new(Db::in_memory().await?),
        };
        db.migrate().await?;

        let broadcaster = Arc::new(ProgressBroadcaster::new(settings.channel_capacity));
        let scheduler = Arc::new(PriorityScheduler::new(settings.scheduler.aging_threshold()));
        let limiter = Arc::new(RateLimiter::new((&settings.rate_limit).into()));
        let breakers = Arc::new(CircuitBreakerRegistry::from(&settings.breaker));
        let dead_letters = Arc::new(DeadLetterStore::new(
            Arc::clone(&db),
            Duration::from_millis(settings.retention.dead_letter_ms),
        ));
        let executor = RetryExecutor::new(
            Arc::clone(&limiter),
            Arc::clone(&breakers),
            Arc::clone(&dead_letters),
            RetryPolicy::from_settings(&settings),
        );
        let state = JobStateMachine::new(
            Arc::clone(&db),
            Arc::clone(&broadcaster),
            Arc::clone(&scheduler),
            &settings,
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Orchestrator {
            shared: Arc::new(Shared {
                settings,
                db,
                state,
                scheduler,
                executor,
                handlers,
                limiter,
                breakers,
                dead_letters,
                broadcaster,
                shutdown,
            }),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

/// The job orchestrator. Owns the worker pool and exposes the submission,
/// control and observation API.
pub struct Orchestrator {
    shared: Arc<Shared>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder {
            settings: Settings::default(),
            db: None,
            handlers: HandlerRegistry::empty(),
            extra: Vec::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.shared.db
    }

    /// Spawn the worker pool and the retention sweeper. Must be called
    /// from within a Tokio runtime. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || *self.shared.shutdown.borrow() {
            return;
        }
        let workers = self.shared.settings.workers;
        tasks.extend(pool::spawn_workers(&self.shared, workers));
        tasks.push(pool::spawn_sweeper(
            &self.shared,
            Duration::from_millis(self.shared.settings.retention.sweep_interval_ms),
        ));
        info!(workers, "orchestrator started");
    }

    /// Stop dispatching, let workers finish their current item, and wait
    /// for them. Jobs left mid-way stay `running` and parked for
    /// [`recover`](Self::recover) on the next start.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        self.shared.scheduler.close();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("orchestrator stopped");
    }

    /// Reload unfinished jobs from storage after a restart.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for job in self.shared.db.list_unfinished_jobs().await? {
            if self.shared.state.is_live(job.id) {
                continue;
            }
            report.recovered += 1;
            if self.shared.state.recover(job).await? {
                report.requeued += 1;
            }
        }
        if report.recovered > 0 {
            info!(
                recovered = report.recovered,
                requeued = report.requeued,
                "jobs recovered"
            );
        }
        Ok(report)
    }

    /// Submit a job. A job whose idempotency key is already taken is not
    /// created again; the existing job id comes back instead.
    pub async fn submit(&self, new: NewJob) -> Result<SubmitResult> {
        if *self.shared.shutdown.borrow() {
            return Err(Error::ShuttingDown);
        }
        if !self.shared.handlers.contains(&new.kind) {
            return Err(Error::UnknownJobKind(new.kind.clone()));
        }
        let kind = new.kind.clone();
        let priority = new.priority;
        let start_after = new.start_after;

        let result = self.shared.state.create(new).await?;
        metrics::jobs_submitted().add(
            1,
            &[
                KeyValue::new("kind", kind),
                KeyValue::new("result", if result.is_created() { "ok" } else { "duplicate" }),
            ],
        );
        if let SubmitResult::Created(id) = result {
            self.shared
                .scheduler
                .enqueue_at(id, priority, state::ready_at(start_after, Utc::now()));
        }
        Ok(result)
    }

    pub async fn submit_job(&self, new: NewJob) -> Result<JobId> {
        self.submit(new).await.map(SubmitResult::job_id)
    }

    pub async fn pause_job(&self, id: JobId) -> Result<()> {
        self.shared.state.pause(id).await
    }

    pub async fn resume_job(&self, id: JobId) -> Result<()> {
        self.shared.state.resume(id).await
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<()> {
        self.shared.state.cancel(id).await
    }

    pub async fn get_job_status(&self, id: JobId) -> Result<JobStatus> {
        self.shared.state.status(id).await
    }

    pub async fn get_job_events(&self, id: JobId) -> Result<Vec<JobEvent>> {
        let events = self.shared.db.events_for_job(id).await?;
        if events.is_empty() {
            // Every job has at least its submission event.
            self.shared.db.get_job(id).await?;
        }
        Ok(events)
    }

    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.shared.db.list_jobs(state).await
    }

    /// Updates for one job until it finishes. A job that already finished
    /// yields a stream that is closed from the start.
    pub async fn subscribe(&self, id: JobId) -> Result<JobSubscription> {
        if let Some(subscription) = self.shared.broadcaster.subscribe(id) {
            return Ok(subscription);
        }
        self.shared.state.status(id).await?;
        Ok(JobSubscription::closed())
    }

    pub fn subscribe_all(&self) -> JobSubscription {
        self.shared.broadcaster.subscribe_all()
    }

    /// Wait until the job reaches a terminal state and return its status.
    pub async fn wait_for(&self, id: JobId) -> Result<JobStatus> {
        let mut subscription = self.subscribe(id).await?;
        while subscription.recv().await.is_some() {}
        self.get_job_status(id).await
    }

    pub async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        self.shared.dead_letters.list(filter).await
    }

    pub async fn get_dead_letter(&self, id: DeadLetterId) -> Result<DeadLetterEntry> {
        self.shared.dead_letters.get(id).await
    }

    /// Resubmit a dead-lettered item as a new single-item job.
    pub async fn retry_dead_letter(&self, id: DeadLetterId) -> Result<JobId> {
        self.shared
            .dead_letters
            .retry(id, |new| self.submit_job(new))
            .await
    }

    pub async fn remove_dead_letter(&self, id: DeadLetterId) -> Result<()> {
        self.shared.dead_letters.remove(id).await
    }

    pub async fn purge_expired_dead_letters(&self) -> Result<u64> {
        self.shared.dead_letters.purge_expired().await
    }

    pub fn breaker_snapshot(&self, operation: &str) -> CircuitSnapshot {
        self.shared.breakers.snapshot(operation)
    }

    /// Jobs waiting in the ready queue.
    pub fn queued(&self) -> usize {
        self.shared.scheduler.len()
    }

    /// One retention pass as of `now`. The background sweeper runs this on
    /// its interval.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.shared.sweep(now).await
    }
}
