//! Job lifecycle.
//!
//! Every live job sits in a [`JobCell`]: the record behind an async mutex
//! plus an atomic requested-state flag for control operations. A mutation
//! runs against a draft copy; the draft and its events are written in one
//! transaction, then swapped in and broadcast while the job lock is still
//! held, so observers see updates in commit order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{Span, debug, info};

use super::eta::EtaEstimator;
use super::scheduler::{PriorityScheduler, Taken};
use crate::broadcast::ProgressBroadcaster;
use crate::config::Settings;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::event::{EventKind, JobUpdate, Progress};
use crate::model::failure::{ClassifiedError, FailureReason};
use crate::model::{
    ItemCounters, ItemState, Job, JobContext, JobId, JobState, NewJob, Priority, RequestedState,
    WorkItem,
};
use crate::telemetry::job::record_state_transition;
use crate::telemetry::metrics;

pub(crate) struct JobCell {
    job: Mutex<Job>,
    requested: AtomicU8,
    /// Signalled when cancel is requested for a job with an item in flight.
    pub(crate) cancel: Notify,
    eta: parking_lot::Mutex<EtaEstimator>,
}

impl JobCell {
    fn new(job: Job, eta: EtaEstimator) -> Self {
        Self {
            job: Mutex::new(job),
            requested: AtomicU8::new(RequestedState::None.as_u8()),
            cancel: Notify::new(),
            eta: parking_lot::Mutex::new(eta),
        }
    }

    pub(crate) fn requested(&self) -> RequestedState {
        RequestedState::from_u8(self.requested.load(Ordering::Acquire))
    }

    fn request(&self, requested: RequestedState) {
        self.requested.store(requested.as_u8(), Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    Created(JobId),
    /// The idempotency key already belonged to this job.
    Existing(JobId),
}

impl SubmitResult {
    pub fn job_id(self) -> JobId {
        match self {
            SubmitResult::Created(id) | SubmitResult::Existing(id) => id,
        }
    }

    pub fn is_created(self) -> bool {
        matches!(self, SubmitResult::Created(_))
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: Job,
    pub progress: Progress,
    pub requested: RequestedState,
}

/// A settled work item reported by the worker that ran it.
#[derive(Debug, Clone)]
pub struct ItemDelta {
    /// The item in its settled state. Replaces the stored copy.
    pub item: WorkItem,
    /// Wall time spent on the item, fed to the ETA estimator.
    pub duration: Option<Duration>,
    /// The failure that settled the item, if it failed.
    pub error: Option<ClassifiedError>,
}

/// What the owning worker should do next.
#[derive(Debug)]
pub enum Step {
    /// Run this item. It has been marked `processing`.
    Item {
        item: WorkItem,
        job: JobContext,
        deadline: Option<DateTime<Utc>>,
    },
    /// The job left `running`; release it.
    Done,
}

enum Emit {
    State {
        from: JobState,
        to: JobState,
        reason: String,
    },
    Progress,
}

/// A job to put in the ready queue once the write commits.
struct Enqueue {
    id: JobId,
    tier: Priority,
    ready_at: Instant,
}

/// Side effects of one mutation. Applied after the write commits.
struct Changes {
    now: DateTime<Utc>,
    events: Vec<(EventKind, String)>,
    updates: Vec<Emit>,
    settled: Vec<ItemState>,
    sample: Option<Duration>,
    touched: bool,
    enqueue: Vec<Enqueue>,
    /// Entries pulled from the ready queue, put back if the write fails.
    taken: Vec<Taken>,
}

impl Changes {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            events: Vec::new(),
            updates: Vec::new(),
            settled: Vec::new(),
            sample: None,
            touched: false,
            enqueue: Vec::new(),
            taken: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        !self.touched && self.events.is_empty() && self.updates.is_empty()
    }

    fn enqueue_at(&mut self, id: JobId, tier: Priority, ready_at: Instant) {
        self.enqueue.push(Enqueue { id, tier, ready_at });
    }

    /// Pull a job out of the ready queue. False if it was not queued.
    fn unqueue(&mut self, scheduler: &PriorityScheduler, id: JobId) -> bool {
        match scheduler.take(id) {
            Some(taken) => {
                self.taken.push(taken);
                true
            }
            None => false,
        }
    }

    fn rollback(self, scheduler: &PriorityScheduler) {
        for taken in self.taken {
            scheduler.restore(taken);
        }
    }

    fn touch(&mut self) {
        self.touched = true;
    }

    fn event(&mut self, kind: EventKind) {
        self.events.push((kind, String::new()));
    }

    fn progress(&mut self) {
        if !matches!(self.updates.last(), Some(Emit::Progress)) {
            self.updates.push(Emit::Progress);
        }
    }

    fn transition(&mut self, job: &mut Job, to: JobState, reason: impl Into<String>) -> Result<()> {
        let from = job.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        let reason = reason.into();
        job.state = to;
        if to.is_terminal() {
            job.finished_at = Some(self.now);
            job.parked = false;
        }
        self.events.push((
            EventKind::StateChanged {
                from,
                to,
                reason: reason.clone(),
            },
            String::new(),
        ));
        self.updates.push(Emit::State { from, to, reason });
        Ok(())
    }

    /// Cancel pending items, and the in-flight one too if `in_flight`.
    fn cancel_items(&mut self, job: &mut Job, in_flight: bool) {
        let mut any = false;
        for item in job.items.iter_mut() {
            let cancel = match item.state {
                ItemState::Pending => true,
                ItemState::Processing => in_flight,
                _ => false,
            };
            if !cancel {
                continue;
            }
            job.counters.apply(item.state, ItemState::Canceled);
            item.state = ItemState::Canceled;
            item.finished_at = Some(self.now);
            self.settled.push(ItemState::Canceled);
            self.events.push((
                EventKind::ItemSettled {
                    index: item.index,
                    state: ItemState::Canceled,
                    counters: job.counters,
                },
                String::new(),
            ));
            any = true;
        }
        if any {
            self.progress();
        }
    }

    /// Cancel everything that is left and end in `canceled`.
    fn finish_cancel(&mut self, job: &mut Job, reason: &str) -> Result<()> {
        if job.state != JobState::Canceling {
            self.transition(job, JobState::Canceling, reason)?;
        }
        self.cancel_items(job, true);
        self.transition(job, JobState::Canceled, reason)
    }

    fn fail(&mut self, job: &mut Job, reason: FailureReason) -> Result<()> {
        self.cancel_items(job, true);
        self.transition(job, JobState::Failed, reason.to_string())?;
        job.failure_reason = Some(reason);
        self.event(EventKind::Failed { reason });
        Ok(())
    }
}

fn failure_rate_exceeded(counters: &ItemCounters, rate: f64) -> bool {
    counters.total > 0 && f64::from(counters.failed) / f64::from(counters.total) > rate
}

/// Scheduler instant matching an optional wall-clock earliest start.
pub(crate) fn ready_at(start_after: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Instant {
    let delay = start_after
        .and_then(|at| (at - now).to_std().ok())
        .unwrap_or_default();
    Instant::now() + delay
}

/// Put an item that did not settle back in line, keeping its attempt
/// history.
fn restore_item(job: &mut Job, mut item: WorkItem) -> Result<()> {
    let index = item.index as usize;
    let stored = job
        .items
        .get(index)
        .ok_or_else(|| Error::NotFound(format!("item {index} of job {}", job.id)))?;
    if stored.state.is_settled() {
        return Ok(());
    }
    job.attempts += item.attempts.saturating_sub(stored.attempts);
    item.state = ItemState::Pending;
    job.items[index] = item;
    Ok(())
}

pub struct JobStateMachine {
    db: Arc<Db>,
    broadcaster: Arc<ProgressBroadcaster>,
    scheduler: Arc<PriorityScheduler>,
    jobs: parking_lot::RwLock<HashMap<JobId, Arc<JobCell>>>,
    /// Idempotency key to job. Held across the whole of a submission.
    idempotency: Mutex<HashMap<String, JobId>>,
    eta_history: usize,
    eta_decay: f64,
    fatal_failure_rate: f64,
}

impl JobStateMachine {
    pub fn new(
        db: Arc<Db>,
        broadcaster: Arc<ProgressBroadcaster>,
        scheduler: Arc<PriorityScheduler>,
        settings: &Settings,
    ) -> Self {
        Self {
            db,
            broadcaster,
            scheduler,
            jobs: parking_lot::RwLock::new(HashMap::new()),
            idempotency: Mutex::new(HashMap::new()),
            eta_history: settings.eta.history,
            eta_decay: settings.eta.decay,
            fatal_failure_rate: settings.failure.fatal_failure_rate,
        }
    }

    pub(crate) fn cell(&self, id: JobId) -> Result<Arc<JobCell>> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    fn new_cell(&self, job: Job) -> Arc<JobCell> {
        Arc::new(JobCell::new(
            job,
            EtaEstimator::new(self.eta_history, self.eta_decay),
        ))
    }

    /// Run `f` against a draft of the job, persist, then publish.
    async fn apply<R>(
        &self,
        cell: &JobCell,
        f: impl FnOnce(&mut Job, &mut Changes) -> Result<R>,
    ) -> Result<R> {
        let mut current = cell.job.lock().await;
        let mut draft = current.clone();
        let mut changes = Changes::new(Utc::now());
        let out = match f(&mut draft, &mut changes) {
            Ok(out) => out,
            Err(e) => {
                changes.rollback(&self.scheduler);
                return Err(e);
            }
        };
        if !changes.is_empty() {
            draft.updated_at = changes.now;
            if let Err(e) = self.db.save_job(&draft, &changes.events).await {
                changes.rollback(&self.scheduler);
                return Err(e);
            }
            *current = draft;
        }

        let Changes {
            now,
            updates,
            settled,
            sample,
            enqueue,
            ..
        } = changes;
        for Enqueue { id, tier, ready_at } in enqueue {
            self.scheduler.enqueue_at(id, tier, ready_at);
        }
        if updates.is_empty() && settled.is_empty() && sample.is_none() {
            return Ok(out);
        }
        let eta = {
            let mut eta = cell.eta.lock();
            if let Some(sample) = sample {
                eta.record(sample);
            }
            eta.estimate(current.counters.pending)
        };
        for outcome in settled {
            metrics::items_settled().add(
                1,
                &[
                    KeyValue::new("kind", current.kind.clone()),
                    KeyValue::new("outcome", outcome.to_string()),
                ],
            );
        }

        let span = Span::current();
        for emit in updates {
            let update = match emit {
                Emit::State { from, to, reason } => {
                    metrics::job_state_transitions().add(
                        1,
                        &[
                            KeyValue::new("from", from.to_string()),
                            KeyValue::new("to", to.to_string()),
                        ],
                    );
                    record_state_transition(&span, &from.to_string(), &to.to_string());
                    if to.is_terminal() {
                        info!(job_id = %current.id, state = %to, %reason, "job finished");
                    }
                    JobUpdate::StateChanged {
                        job_id: current.id,
                        prior_state: from,
                        new_state: to,
                        reason,
                        timestamp: now,
                    }
                }
                Emit::Progress => JobUpdate::Progress {
                    job_id: current.id,
                    progress: Progress::new(&current.counters, eta, current.rate_limited),
                    timestamp: now,
                },
            };
            self.broadcaster.publish(update);
        }
        Ok(out)
    }

    /// Create a pending job, or return the job already holding its
    /// idempotency key.
    pub async fn create(&self, new: NewJob) -> Result<SubmitResult> {
        new.validate()?;
        let mut keys = self.idempotency.lock().await;

        if let Some(key) = new.idempotency_key.clone() {
            let existing = match keys.get(&key) {
                Some(id) => Some(*id),
                None => self.db.find_job_by_idempotency_key(&key).await?,
            };
            if let Some(id) = existing {
                let kind = EventKind::Resubmitted {
                    idempotency_key: key,
                };
                let cell = self.jobs.read().get(&id).cloned();
                match cell {
                    Some(cell) => {
                        self.apply(&cell, |_, changes| {
                            changes.event(kind);
                            Ok(())
                        })
                        .await?;
                    }
                    None => {
                        self.db.append_event(id, Utc::now(), &kind, "").await?;
                    }
                }
                debug!(job_id = %id, "duplicate submission");
                return Ok(SubmitResult::Existing(id));
            }
        }

        let job = new.into_job(Utc::now());
        let id = job.id;
        let submitted = EventKind::Submitted {
            kind: job.kind.clone(),
            priority: job.priority,
            items: job.counters.total,
        };
        self.broadcaster.open(id);
        if let Err(e) = self.db.save_job(&job, &[(submitted, String::new())]).await {
            self.broadcaster.close(id);
            return Err(e);
        }

        if let Some(key) = job.idempotency_key.clone() {
            keys.insert(key, id);
        }
        info!(job_id = %id, kind = %job.kind, priority = %job.priority, items = job.counters.total, "job submitted");
        self.jobs.write().insert(id, self.new_cell(job));
        Ok(SubmitResult::Created(id))
    }

    /// Move a job along one edge of the lifecycle. Entering `canceled`
    /// cancels whatever items remain. `failed` needs a reason and goes
    /// through [`fail_job`](Self::fail_job).
    pub async fn transition(&self, id: JobId, to: JobState, reason: &str) -> Result<()> {
        let cell = self.cell(id)?;
        self.apply(&cell, |job, changes| match to {
            JobState::Failed => Err(Error::InvalidJob(
                "a failed job needs a failure reason".into(),
            )),
            JobState::Completed if job.counters.pending > 0 => Err(Error::InvalidJob(format!(
                "job {id} still has {} pending items",
                job.counters.pending
            ))),
            JobState::Canceled => {
                if !job.state.can_transition_to(to) {
                    return Err(Error::InvalidTransition {
                        from: job.state,
                        to,
                    });
                }
                changes.cancel_items(job, true);
                changes.transition(job, to, reason)
            }
            _ => changes.transition(job, to, reason),
        })
        .await
    }

    /// Record a settled item. Evaluates the job-level failure rules.
    pub async fn update_progress(&self, id: JobId, delta: ItemDelta) -> Result<()> {
        let cell = self.cell(id)?;
        let rate = self.fatal_failure_rate;
        self.apply(&cell, |job, changes| {
            if !matches!(job.state, JobState::Running | JobState::Canceling) {
                return Err(Error::InvalidJob(format!(
                    "job {id} is {} and cannot settle items",
                    job.state
                )));
            }
            let ItemDelta {
                mut item,
                duration,
                error,
            } = delta;
            let index = item.index;
            if !item.state.is_settled() {
                return Err(Error::InvalidJob(format!(
                    "item {index} reported as {}",
                    item.state
                )));
            }
            let (from, prior_attempts) = match job.items.get(index as usize) {
                Some(stored) if stored.state.is_settled() => {
                    return Err(Error::InvalidJob(format!(
                        "item {index} of job {id} already settled"
                    )));
                }
                Some(stored) => (stored.state, stored.attempts),
                None => return Err(Error::NotFound(format!("item {index} of job {id}"))),
            };

            let to = item.state;
            if item.finished_at.is_none() {
                item.finished_at = Some(changes.now);
            }
            job.attempts += item.attempts.saturating_sub(prior_attempts);
            job.counters.apply(from, to);
            job.rate_limited = false;
            if let Some(error) = &error {
                job.last_error = Some(error.to_string());
            }
            let entry = item.dead_letter;
            job.items[index as usize] = item;

            changes.settled.push(to);
            changes.event(EventKind::ItemSettled {
                index,
                state: to,
                counters: job.counters,
            });
            if let (Some(entry_id), Some(error)) = (entry, &error) {
                changes.event(EventKind::DeadLettered {
                    index,
                    entry_id,
                    class: error.class,
                });
            }
            changes.sample = duration;
            changes.progress();

            if job.state == JobState::Running {
                if error.as_ref().is_some_and(|e| e.fatal) {
                    changes.fail(job, FailureReason::SourceUnreadable)?;
                } else if failure_rate_exceeded(&job.counters, rate) {
                    changes.fail(job, FailureReason::FatalItemFailureRate)?;
                }
            }
            Ok(())
        })
        .await
    }

    /// Take ownership of a dispatched job. `None` if there is nothing to run.
    pub async fn claim(&self, id: JobId, effective: Priority) -> Result<Option<JobContext>> {
        let cell = self.cell(id)?;
        self.apply(&cell, |job, changes| {
            let requested = cell.requested();
            if effective > job.effective_priority {
                changes.event(EventKind::PriorityPromoted {
                    from: job.effective_priority,
                    to: effective,
                });
                job.effective_priority = effective;
            }
            match job.state {
                JobState::Pending if requested == RequestedState::Cancel => {
                    changes.finish_cancel(job, "canceled before dispatch")?;
                    Ok(None)
                }
                JobState::Pending => {
                    changes.transition(job, JobState::Running, "dispatched")?;
                    Ok(Some(job.context()))
                }
                JobState::Paused => {
                    changes.transition(job, JobState::Running, "resumed")?;
                    Ok(Some(job.context()))
                }
                JobState::Running if job.parked => {
                    job.parked = false;
                    changes.touch();
                    Ok(Some(job.context()))
                }
                JobState::Canceling => {
                    changes.finish_cancel(job, "canceled")?;
                    Ok(None)
                }
                _ => Ok(None),
            }
        })
        .await
    }

    /// Item boundary: observe deadline and control requests, then hand out
    /// the next pending item or complete the job.
    pub async fn next_step(&self, id: JobId) -> Result<Step> {
        let cell = self.cell(id)?;
        self.apply(&cell, |job, changes| {
            let requested = cell.requested();
            match job.state {
                JobState::Running => {}
                JobState::Canceling => {
                    changes.finish_cancel(job, "canceled")?;
                    return Ok(Step::Done);
                }
                _ => return Ok(Step::Done),
            }
            if job.deadline_passed(changes.now) {
                changes.fail(job, FailureReason::DeadlineExceeded)?;
                return Ok(Step::Done);
            }
            match requested {
                RequestedState::Cancel => {
                    changes.finish_cancel(job, "cancel requested")?;
                    return Ok(Step::Done);
                }
                RequestedState::Pause => {
                    changes.transition(job, JobState::Pausing, "pause requested")?;
                    changes.transition(job, JobState::Paused, "paused at item boundary")?;
                    return Ok(Step::Done);
                }
                RequestedState::None => {}
            }

            match job.next_pending_item() {
                Some(index) => {
                    let item = &mut job.items[index as usize];
                    item.state = ItemState::Processing;
                    if item.started_at.is_none() {
                        item.started_at = Some(changes.now);
                    }
                    let item = item.clone();
                    changes.touch();
                    Ok(Step::Item {
                        item,
                        job: job.context(),
                        deadline: job.deadline,
                    })
                }
                None => {
                    changes.transition(job, JobState::Completing, "all items settled")?;
                    changes.transition(job, JobState::Completed, "completed")?;
                    Ok(Step::Done)
                }
            }
        })
        .await
    }

    /// End a job in `failed`, canceling what is left. Returns false if the
    /// job had already finished.
    pub async fn fail_job(&self, id: JobId, reason: FailureReason) -> Result<bool> {
        let cell = self.cell(id)?;
        self.apply(&cell, |job, changes| {
            if job.state.is_terminal() {
                return Ok(false);
            }
            changes.fail(job, reason)?;
            Ok(true)
        })
        .await
    }

    /// Release a running job without settling it. The unsettled item, if
    /// any, goes back to pending. With `retry_after` the job was throttled:
    /// it is flagged and re-enqueued, not eligible before the wait is over.
    /// A job canceled in the meantime finishes canceling instead.
    pub async fn park(
        &self,
        id: JobId,
        item: Option<WorkItem>,
        retry_after: Option<Duration>,
    ) -> Result<()> {
        let cell = self.cell(id)?;
        self.apply(&cell, |job, changes| {
            if let Some(item) = item {
                restore_item(job, item)?;
                changes.touch();
            }
            match job.state {
                JobState::Canceling => changes.finish_cancel(job, "canceled"),
                JobState::Running => {
                    job.parked = true;
                    changes.touch();
                    if let Some(wait) = retry_after {
                        // The retry loop usually flagged it already.
                        if !job.rate_limited {
                            job.rate_limited = true;
                            changes.event(EventKind::RateLimited {
                                retry_after_ms: u64::try_from(wait.as_millis())
                                    .unwrap_or(u64::MAX),
                            });
                            changes.progress();
                        }
                        changes.enqueue_at(id, job.effective_priority, Instant::now() + wait);
                    }
                    Ok(())
                }
                _ => Ok(()),
            }
        })
        .await
    }

    /// Hand back a job whose worker failed internally. Items left in
    /// `processing` go back to pending and a pending or running job is
    /// re-enqueued after `delay`, so it stays reachable without a restart.
    pub async fn release(&self, id: JobId, delay: Duration) -> Result<()> {
        let cell = self.cell(id)?;
        self.apply(&cell, |job, changes| {
            for item in job.items.iter_mut() {
                if item.state == ItemState::Processing {
                    item.state = ItemState::Pending;
                    changes.touch();
                }
            }
            match job.state {
                JobState::Canceling => changes.finish_cancel(job, "canceled"),
                JobState::Pending => {
                    changes.enqueue_at(id, job.effective_priority, Instant::now() + delay);
                    Ok(())
                }
                JobState::Running => {
                    job.parked = true;
                    changes.touch();
                    changes.enqueue_at(id, job.effective_priority, Instant::now() + delay);
                    Ok(())
                }
                _ => Ok(()),
            }
        })
        .await
    }

    /// Flag a job whose worker is waiting on the rate limiter.
    pub async fn set_rate_limited(&self, id: JobId, retry_after: Duration) -> Result<()> {
        let cell = self.cell(id)?;
        self.apply(&cell, |job, changes| {
            if job.rate_limited || job.state.is_terminal() {
                return Ok(());
            }
            job.rate_limited = true;
            changes.event(EventKind::RateLimited {
                retry_after_ms: u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
            });
            changes.progress();
            Ok(())
        })
        .await
    }

    pub async fn record_attempt_failure(
        &self,
        id: JobId,
        item: &WorkItem,
        error: &ClassifiedError,
    ) -> Result<()> {
        let cell = self.cell(id)?;
        self.apply(&cell, |job, changes| {
            job.last_error = Some(error.to_string());
            changes.event(EventKind::AttemptFailed {
                index: item.index,
                attempt: item.attempts,
                class: error.class,
            });
            Ok(())
        })
        .await
    }

    /// Pause a running job. A job with an item in flight pauses at the next
    /// item boundary; a parked job pauses at once.
    pub async fn pause(&self, id: JobId) -> Result<()> {
        let cell = self.cell(id)?;
        let scheduler = &self.scheduler;
        self.apply(&cell, |job, changes| match job.state {
            JobState::Running if job.parked && changes.unqueue(scheduler, id) => {
                job.parked = false;
                changes.transition(job, JobState::Pausing, "pause requested")?;
                changes.transition(job, JobState::Paused, "paused while queued")
            }
            JobState::Running => {
                cell.request(RequestedState::Pause);
                Ok(())
            }
            JobState::Pausing | JobState::Paused => {
                changes.unqueue(scheduler, id);
                Ok(())
            }
            from => Err(Error::InvalidTransition {
                from,
                to: JobState::Pausing,
            }),
        })
        .await
    }

    /// Resume a paused job at its effective priority, or withdraw a pause
    /// request that has not been observed yet.
    pub async fn resume(&self, id: JobId) -> Result<()> {
        let cell = self.cell(id)?;
        self.apply(&cell, |job, changes| match job.state {
            JobState::Paused => {
                cell.request(RequestedState::None);
                changes.enqueue_at(id, job.effective_priority, Instant::now());
                Ok(())
            }
            JobState::Running if cell.requested() == RequestedState::Pause => {
                cell.request(RequestedState::None);
                Ok(())
            }
            from => Err(Error::InvalidTransition {
                from,
                to: JobState::Running,
            }),
        })
        .await
    }

    /// Cancel a pending or running job. Pending items are canceled at once;
    /// an in-flight item is allowed to finish.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let cell = self.cell(id)?;
        let scheduler = &self.scheduler;
        self.apply(&cell, |job, changes| match job.state {
            JobState::Pending if changes.unqueue(scheduler, id) => {
                changes.finish_cancel(job, "canceled before dispatch")
            }
            JobState::Pending => {
                // Dequeued but not yet claimed; the claim observes this.
                cell.request(RequestedState::Cancel);
                Ok(())
            }
            JobState::Running if job.parked && changes.unqueue(scheduler, id) => {
                changes.finish_cancel(job, "cancel requested")
            }
            JobState::Running => {
                changes.transition(job, JobState::Canceling, "cancel requested")?;
                changes.cancel_items(job, false);
                cell.request(RequestedState::Cancel);
                cell.cancel.notify_one();
                Ok(())
            }
            JobState::Canceling => Ok(()),
            from => Err(Error::InvalidTransition {
                from,
                to: JobState::Canceling,
            }),
        })
        .await
    }

    /// Load a persisted job after a restart. Returns true if it was put
    /// back in the ready queue.
    pub async fn recover(&self, job: Job) -> Result<bool> {
        let id = job.id;
        if self.jobs.read().contains_key(&id) {
            return Ok(false);
        }
        if let Some(key) = job.idempotency_key.clone() {
            self.idempotency.lock().await.insert(key, id);
        }
        let cell = self.new_cell(job);
        self.broadcaster.open(id);
        self.jobs.write().insert(id, Arc::clone(&cell));

        self.apply(&cell, |job, changes| {
            changes.event(EventKind::Recovered { from: job.state });
            for item in job.items.iter_mut() {
                if item.state == ItemState::Processing {
                    item.state = ItemState::Pending;
                }
            }
            match job.state {
                JobState::Pending => {
                    let at = ready_at(job.start_after, changes.now);
                    changes.enqueue_at(id, job.effective_priority, at);
                    Ok(true)
                }
                JobState::Running => {
                    job.parked = true;
                    changes.enqueue_at(id, job.effective_priority, Instant::now());
                    Ok(true)
                }
                JobState::Pausing => {
                    changes.transition(job, JobState::Paused, "recovered")?;
                    Ok(false)
                }
                JobState::Completing => {
                    changes.transition(job, JobState::Completed, "recovered")?;
                    Ok(false)
                }
                JobState::Canceling => {
                    changes.finish_cancel(job, "recovered")?;
                    Ok(false)
                }
                JobState::Paused
                | JobState::Completed
                | JobState::Canceled
                | JobState::Failed => Ok(false),
            }
        })
        .await
    }

    /// Drop a finished job from memory, the idempotency index and storage.
    pub async fn archive(&self, id: JobId) -> Result<bool> {
        let mut keys = self.idempotency.lock().await;
        let cell = self.jobs.read().get(&id).cloned();
        if let Some(cell) = cell {
            let job = cell.job.lock().await;
            if !job.state.is_terminal() {
                return Err(Error::InvalidJob(format!(
                    "job {id} is {} and cannot be archived",
                    job.state
                )));
            }
            if let Some(key) = &job.idempotency_key {
                if keys.get(key) == Some(&id) {
                    keys.remove(key);
                }
            }
            self.jobs.write().remove(&id);
            self.broadcaster.close(id);
        }
        let deleted = self.db.delete_job(id).await?;
        if deleted {
            debug!(job_id = %id, "job archived");
        }
        Ok(deleted)
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatus> {
        let cell = self.jobs.read().get(&id).cloned();
        match cell {
            Some(cell) => {
                let job = cell.job.lock().await.clone();
                let eta = cell.eta.lock().estimate(job.counters.pending);
                Ok(JobStatus {
                    progress: Progress::new(&job.counters, eta, job.rate_limited),
                    requested: cell.requested(),
                    job,
                })
            }
            None => {
                let job = self.db.get_job(id).await?;
                Ok(JobStatus {
                    progress: Progress::new(&job.counters, None, job.rate_limited),
                    requested: RequestedState::None,
                    job,
                })
            }
        }
    }

    pub fn is_live(&self, id: JobId) -> bool {
        self.jobs.read().contains_key(&id)
    }
}
