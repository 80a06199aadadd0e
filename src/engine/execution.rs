//! One worker's pass over a dispatched job.
//!
//! The worker claims the job, then walks its items in order: each item runs
//! through the retry executor and its outcome is settled on the state
//! machine. Control requests, the deadline and shutdown are observed at
//! item boundaries. Two things can cut an in-flight item short: the
//! deadline, and a cancel that outlives the grace period.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use super::Shared;
use super::scheduler::Dispatch;
use super::state::{ItemDelta, JobCell, JobStateMachine, Step};
use crate::error::Result;
use crate::handler::{WorkHandler, WorkOutput};
use crate::model::failure::{ClassifiedError, FailureReason};
use crate::model::{ItemState, JobContext, JobId, RequestedState, WorkItem};
use crate::retry::{AttemptObserver, RetryContext, RunOutcome};
use crate::telemetry::job::start_job_span;

pub(super) async fn run_job(shared: &Shared, dispatch: Dispatch) -> Result<()> {
    let id = dispatch.job_id;
    let result = claim_and_drive(shared, dispatch).await;
    if let Err(e) = &result {
        let delay = shared.settings.scheduler.release_delay();
        warn!(job_id = %id, error = %e, delay_ms = delay.as_millis() as u64, "worker failed, releasing job");
        if let Err(release) = shared.state.release(id, delay).await {
            error!(job_id = %id, error = %release, "failed to release job, left for recovery");
        }
    }
    result
}

async fn claim_and_drive(shared: &Shared, dispatch: Dispatch) -> Result<()> {
    let id = dispatch.job_id;
    let Some(job) = shared.state.claim(id, dispatch.effective).await? else {
        debug!(job_id = %id, "nothing to run after claim");
        return Ok(());
    };

    let handler = shared
        .handlers
        .get(&job.kind)
        .unwrap_or_else(|| Arc::new(MissingHandler) as Arc<dyn WorkHandler>);
    let span = start_job_span(&job.kind, id);
    drive(shared, job, handler).instrument(span).await
}

async fn drive(shared: &Shared, job: JobContext, handler: Arc<dyn WorkHandler>) -> Result<()> {
    let id = job.id;
    let cell = shared.state.cell(id)?;
    let observer = JobObserver {
        state: &shared.state,
        job_id: id,
    };

    loop {
        if *shared.shutdown.borrow() {
            info!(job_id = %id, "shutting down, job left for recovery");
            shared.state.park(id, None, None).await?;
            return Ok(());
        }

        let (item, ctx, deadline) = match shared.state.next_step(id).await? {
            Step::Item {
                item,
                job,
                deadline,
            } => (item, job, deadline),
            Step::Done => return Ok(()),
        };

        let started = Instant::now();
        let retry_ctx = RetryContext {
            job: ctx.clone(),
            item: item.clone(),
            operation: handler.operation().to_string(),
        };
        let attempt_handler = Arc::clone(&handler);
        let run = shared.executor.run(
            retry_ctx,
            move |_attempt| {
                let handler = Arc::clone(&attempt_handler);
                let item = item.clone();
                let ctx = ctx.clone();
                async move { handler.execute(&item, &ctx).await }
            },
            &observer,
        );

        let outcome = tokio::select! {
            outcome = run => outcome?,
            reason = interrupted(&cell, deadline, shared.settings.scheduler.cancel_grace()) => {
                warn!(job_id = %id, %reason, "in-flight item abandoned");
                shared.state.fail_job(id, reason).await?;
                return Ok(());
            }
        };
        let took = started.elapsed();

        let (item, error) = match outcome {
            RunOutcome::Succeeded { mut item, output } => {
                match output {
                    WorkOutput::Completed(value) => {
                        item.state = ItemState::Completed;
                        item.result = Some(value);
                    }
                    WorkOutput::Skipped { reason } => {
                        item.state = ItemState::Skipped;
                        item.result = Some(serde_json::json!({ "skipped": reason }));
                    }
                }
                (item, None)
            }
            RunOutcome::DeadLettered {
                mut item, error, ..
            } => {
                item.state = ItemState::Failed;
                (item, Some(error))
            }
            RunOutcome::Throttled { item, retry_after } => {
                debug!(job_id = %id, item = item.index, retry_after_ms = retry_after.as_millis() as u64, "throttled, yielding worker");
                shared.state.park(id, Some(item), Some(retry_after)).await?;
                return Ok(());
            }
        };

        shared
            .state
            .update_progress(
                id,
                ItemDelta {
                    item,
                    duration: Some(took),
                    error,
                },
            )
            .await?;
    }
}

/// Resolves when an in-flight item must be abandoned.
async fn interrupted(
    cell: &JobCell,
    deadline: Option<DateTime<Utc>>,
    grace: Duration,
) -> FailureReason {
    let escalation = async {
        if cell.requested() != RequestedState::Cancel {
            cell.cancel.notified().await;
        }
        tokio::time::sleep(grace).await;
    };
    let expiry = async {
        match deadline {
            Some(at) => {
                let left = (at - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(left).await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = escalation => FailureReason::ExplicitCancelEscalation,
        _ = expiry => FailureReason::DeadlineExceeded,
    }
}

/// Reports retry-loop events on the job's record.
struct JobObserver<'a> {
    state: &'a JobStateMachine,
    job_id: JobId,
}

#[async_trait]
impl AttemptObserver for JobObserver<'_> {
    async fn throttled(&self, _item: &WorkItem, retry_after: Duration) {
        if let Err(e) = self.state.set_rate_limited(self.job_id, retry_after).await {
            warn!(job_id = %self.job_id, error = %e, "failed to flag rate limit");
        }
    }

    async fn attempt_failed(&self, item: &WorkItem, error: &ClassifiedError) {
        if let Err(e) = self
            .state
            .record_attempt_failure(self.job_id, item, error)
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "failed to record attempt failure");
        }
    }
}

/// Stands in for a job kind whose handler is no longer registered, e.g.
/// after a restart with a different handler set. Every item dead-letters.
struct MissingHandler;

#[async_trait]
impl WorkHandler for MissingHandler {
    fn operation(&self) -> &str {
        "unregistered"
    }

    async fn execute(
        &self,
        _item: &WorkItem,
        job: &JobContext,
    ) -> std::result::Result<WorkOutput, ClassifiedError> {
        Err(
            ClassifiedError::permanent(format!("no handler registered for kind {}", job.kind))
                .with_code("unknown_kind"),
        )
    }
}
