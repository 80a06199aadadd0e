//! Core data model.
//!
//! A job is a schedulable unit of work composed of one or more work items.
//! It has identity (id + optional idempotency key), ownership (tenant and
//! actor, used for rate-limit partitioning), a priority tier, and a
//! lifecycle state. Work items carry their own sub-state which rolls up
//! into the job's aggregate counters.

pub mod failure;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dead_letter::DeadLetterId;
use crate::error::Error;
use failure::{AttemptRecord, FailureReason};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Other(format!("invalid job id {s}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Priority tier. Ordering is `Low < Normal < Urgent`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Urgent,
}

impl Priority {
    /// All tiers, highest first. Dispatch iterates in this order.
    pub const DESCENDING: [Priority; 3] = [Priority::Urgent, Priority::Normal, Priority::Low];

    /// Promote by `levels` tiers, saturating at `Urgent`.
    pub fn promoted(self, levels: u32) -> Self {
        let rank = (self.rank() + levels).min(Priority::Urgent.rank());
        Self::from_rank(rank)
    }

    pub(crate) fn rank(self) -> u32 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::Urgent => 2,
        }
    }

    fn from_rank(rank: u32) -> Self {
        match rank {
            0 => Priority::Low,
            1 => Priority::Normal,
            _ => Priority::Urgent,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(Error::Other(format!("unknown priority: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, waiting in the ready queue.
    Pending,
    /// Owned by a worker, processing work items.
    Running,
    /// Pause observed at an item boundary.
    Pausing,
    /// Parked until resumed.
    Paused,
    /// Last item settled, finalizing.
    Completing,
    /// Done. Terminal.
    Completed,
    /// Cancel observed, waiting for in-flight work to settle.
    Canceling,
    /// Canceled by request. Terminal.
    Canceled,
    /// Failed with a [`FailureReason`]. Terminal.
    Failed,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Canceling)
                | (Running, Pausing)
                | (Running, Completing)
                | (Running, Canceling)
                | (Running, Failed)     // deadline, fatal failure rate, source unreadable
                | (Pausing, Paused)
                | (Paused, Running)     // resumed and picked up again
                | (Completing, Completed)
                | (Canceling, Canceled)
                | (Canceling, Failed) // cancel escalation
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Canceled | JobState::Failed
        )
    }

    pub const ALL: [JobState; 9] = [
        JobState::Pending,
        JobState::Running,
        JobState::Pausing,
        JobState::Paused,
        JobState::Completing,
        JobState::Completed,
        JobState::Canceling,
        JobState::Canceled,
        JobState::Failed,
    ];
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Pausing => "pausing",
            JobState::Paused => "paused",
            JobState::Completing => "completing",
            JobState::Completed => "completed",
            JobState::Canceling => "canceling",
            JobState::Canceled => "canceled",
            JobState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.to_string() == s)
            .ok_or_else(|| Error::Other(format!("unknown state: {s}")))
    }
}

/// Control request recorded against a job, observed cooperatively by the
/// owning worker at work-item boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedState {
    #[default]
    None,
    Pause,
    Cancel,
}

impl RequestedState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RequestedState::None => 0,
            RequestedState::Pause => 1,
            RequestedState::Cancel => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RequestedState::Pause,
            2 => RequestedState::Cancel,
            _ => RequestedState::None,
        }
    }
}

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// Sub-state of a single work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
    Canceled,
}

impl ItemState {
    /// Settled items no longer count as pending.
    pub fn is_settled(self) -> bool {
        !matches!(self, ItemState::Pending | ItemState::Processing)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Pending => "pending",
            ItemState::Processing => "processing",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
            ItemState::Skipped => "skipped",
            ItemState::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// The smallest unit dispatched to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Position within the job. Items are processed in index order.
    pub index: u32,
    /// Opaque input for the work function.
    pub payload: serde_json::Value,
    pub state: ItemState,
    /// Calls made to the work function so far.
    pub attempts: u32,
    /// Attempt history, including circuit-breaker rejections.
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    /// Time spent inside the retry loop, excluding time parked in the queue.
    #[serde(default)]
    pub retry_elapsed_ms: u64,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub dead_letter: Option<DeadLetterId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(index: u32, payload: serde_json::Value) -> Self {
        Self {
            index,
            payload,
            state: ItemState::Pending,
            attempts: 0,
            history: Vec::new(),
            retry_elapsed_ms: 0,
            result: None,
            last_error: None,
            dead_letter: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Aggregate item counters for a job.
///
/// Invariant: `total == completed + failed + skipped + canceled + pending`.
/// Items in `processing` count as pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemCounters {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub canceled: u32,
    pub pending: u32,
}

impl ItemCounters {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            pending: total,
            ..Self::default()
        }
    }

    /// Move one item between states, keeping the invariant.
    pub fn apply(&mut self, from: ItemState, to: ItemState) {
        if from == to {
            return;
        }
        if let Some(slot) = self.slot(from) {
            *slot = slot.saturating_sub(1);
        }
        if let Some(slot) = self.slot(to) {
            *slot += 1;
        }
    }

    fn slot(&mut self, state: ItemState) -> Option<&mut u32> {
        match state {
            ItemState::Pending | ItemState::Processing => Some(&mut self.pending),
            ItemState::Completed => Some(&mut self.completed),
            ItemState::Failed => Some(&mut self.failed),
            ItemState::Skipped => Some(&mut self.skipped),
            ItemState::Canceled => Some(&mut self.canceled),
        }
    }

    pub fn settled(&self) -> u32 {
        self.completed + self.failed + self.skipped + self.canceled
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.settled() + self.pending
    }

    /// Percent of items settled, clamped to [0, 100]. `None` for empty jobs.
    pub fn percent_complete(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let pct = f64::from(self.settled()) / f64::from(self.total) * 100.0;
        Some(pct.clamp(0.0, 100.0))
    }

    /// Recompute from item states.
    pub fn from_items(items: &[WorkItem]) -> Self {
        let mut counters = Self::new(items.len() as u32);
        for item in items {
            counters.apply(ItemState::Pending, item.state);
        }
        counters
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A schedulable unit of work tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// What kind of work this is. Selects the work handler.
    pub kind: String,

    /// Tier as submitted. Never changed by aging.
    pub priority: Priority,

    /// Tier after aging promotion.
    pub effective_priority: Priority,

    pub state: JobState,

    pub tenant_id: String,
    pub actor_id: String,

    /// Resubmissions with the same key return this job.
    pub idempotency_key: Option<String>,

    /// Opaque job-level payload reference.
    pub payload: serde_json::Value,

    pub items: Vec<WorkItem>,
    pub counters: ItemCounters,

    /// Work-function calls across all items.
    pub attempts: u32,

    pub last_error: Option<String>,
    pub failure_reason: Option<FailureReason>,

    /// Most recent admission was throttled by the rate limiter.
    #[serde(default)]
    pub rate_limited: bool,

    /// Running but not owned by a worker: yielded to the queue after a rate
    /// limit rejection, or interrupted by shutdown.
    #[serde(default)]
    pub parked: bool,

    /// Dead-letter entry this job was resubmitted from.
    pub origin: Option<DeadLetterId>,

    pub submitted_at: DateTime<Utc>,
    pub start_after: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The fields a work function or dead-letter snapshot needs.
    pub fn context(&self) -> JobContext {
        JobContext {
            id: self.id,
            kind: self.kind.clone(),
            priority: self.priority,
            tenant_id: self.tenant_id.clone(),
            actor_id: self.actor_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
            payload: self.payload.clone(),
            submitted_at: self.submitted_at,
        }
    }

    /// Index of the next item to process, in the order fixed at creation.
    pub fn next_pending_item(&self) -> Option<u32> {
        self.items
            .iter()
            .find(|item| item.state == ItemState::Pending)
            .map(|item| item.index)
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Job header handed to work functions and captured in dead-letter entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    pub id: JobId,
    pub kind: String,
    pub priority: Priority,
    pub tenant_id: String,
    pub actor_id: String,
    pub idempotency_key: Option<String>,
    pub payload: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new jobs. The orchestrator's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) kind: String,
    pub(crate) tenant_id: String,
    pub(crate) actor_id: String,
    pub(crate) priority: Priority,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) payload: serde_json::Value,
    pub(crate) items: Vec<serde_json::Value>,
    pub(crate) start_after: Option<DateTime<Utc>>,
    pub(crate) deadline: Option<DateTime<Utc>>,
    pub(crate) origin: Option<DeadLetterId>,
}

impl NewJob {
    pub fn new(
        kind: impl Into<String>,
        tenant_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            tenant_id: tenant_id.into(),
            actor_id: actor_id.into(),
            priority: Priority::Normal,
            idempotency_key: None,
            payload: serde_json::Value::Null,
            items: Vec::new(),
            start_after: None,
            deadline: None,
            origin: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Append one work item. A job submitted without items runs its
    /// payload as a single item.
    pub fn item(mut self, payload: serde_json::Value) -> Self {
        self.items.push(payload);
        self
    }

    pub fn items(mut self, payloads: impl IntoIterator<Item = serde_json::Value>) -> Self {
        self.items.extend(payloads);
        self
    }

    pub fn start_after(mut self, at: DateTime<Utc>) -> Self {
        self.start_after = Some(at);
        self
    }

    pub fn deadline(mut self, at: DateTime<Utc>) -> Self {
        self.deadline = Some(at);
        self
    }

    pub(crate) fn origin(mut self, id: DeadLetterId) -> Self {
        self.origin = Some(id);
        self
    }

    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.kind.trim().is_empty() {
            return Err(Error::InvalidJob("kind must not be empty".into()));
        }
        if self.tenant_id.trim().is_empty() || self.actor_id.trim().is_empty() {
            return Err(Error::InvalidJob(
                "tenant_id and actor_id are required".into(),
            ));
        }
        if self
            .idempotency_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            return Err(Error::InvalidJob("idempotency key must not be blank".into()));
        }
        if let (Some(start), Some(deadline)) = (self.start_after, self.deadline) {
            if deadline <= start {
                return Err(Error::InvalidJob("deadline precedes earliest start".into()));
            }
        }
        Ok(())
    }

    /// Materialize the job record in `pending` state.
    pub(crate) fn into_job(self, now: DateTime<Utc>) -> Job {
        let payloads = if self.items.is_empty() {
            vec![self.payload.clone()]
        } else {
            self.items
        };
        let items: Vec<WorkItem> = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| WorkItem::new(index as u32, payload))
            .collect();

        Job {
            id: JobId::new(),
            kind: self.kind,
            priority: self.priority,
            effective_priority: self.priority,
            state: JobState::Pending,
            tenant_id: self.tenant_id,
            actor_id: self.actor_id,
            idempotency_key: self.idempotency_key,
            payload: self.payload,
            counters: ItemCounters::new(items.len() as u32),
            items,
            attempts: 0,
            last_error: None,
            failure_reason: None,
            rate_limited: false,
            parked: false,
            origin: self.origin,
            submitted_at: now,
            start_after: self.start_after,
            deadline: self.deadline,
            updated_at: now,
            finished_at: None,
        }
    }
}
