//! Structured events.
//!
//! [`JobEvent`] is the append-only audit record written on every state
//! transition and progress delta. [`JobUpdate`] is what observers receive
//! over the broadcaster: the same moments, shaped for a push channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dead_letter::DeadLetterId;
use crate::model::failure::{FailureClass, FailureReason};
use crate::model::{ItemCounters, ItemState, JobId, JobState, Priority};

/// An audit record. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Storage sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Free-form detail.
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Submitted {
        kind: String,
        priority: Priority,
        items: u32,
    },
    /// Resubmission matched an existing job by idempotency key.
    Resubmitted {
        idempotency_key: String,
    },
    StateChanged {
        from: JobState,
        to: JobState,
        reason: String,
    },
    ItemSettled {
        index: u32,
        state: ItemState,
        counters: ItemCounters,
    },
    PriorityPromoted {
        from: Priority,
        to: Priority,
    },
    AttemptFailed {
        index: u32,
        attempt: u32,
        class: FailureClass,
    },
    DeadLettered {
        index: u32,
        entry_id: DeadLetterId,
        class: FailureClass,
    },
    RateLimited {
        retry_after_ms: u64,
    },
    Failed {
        reason: FailureReason,
    },
    Recovered {
        from: JobState,
    },
    /// Stored event that this build cannot parse.
    Unknown {
        raw: String,
    },
}

impl EventKind {
    /// Stable short name, stored alongside the JSON body.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Submitted { .. } => "submitted",
            EventKind::Resubmitted { .. } => "resubmitted",
            EventKind::StateChanged { .. } => "state_changed",
            EventKind::ItemSettled { .. } => "item_settled",
            EventKind::PriorityPromoted { .. } => "priority_promoted",
            EventKind::AttemptFailed { .. } => "attempt_failed",
            EventKind::DeadLettered { .. } => "dead_lettered",
            EventKind::RateLimited { .. } => "rate_limited",
            EventKind::Failed { .. } => "failed",
            EventKind::Recovered { .. } => "recovered",
            EventKind::Unknown { .. } => "unknown",
        }
    }
}

/// Progress snapshot delivered to observers and returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// `None` when the job has no items.
    pub percent_complete: Option<f64>,
    pub items_total: u32,
    pub items_completed: u32,
    pub items_failed: u32,
    pub items_skipped: u32,
    pub items_canceled: u32,
    pub items_pending: u32,
    /// Estimated time to completion. `None` until a duration sample exists.
    pub eta_ms: Option<u64>,
    pub rate_limited: bool,
}

impl Progress {
    pub fn new(counters: &ItemCounters, eta: Option<std::time::Duration>, rate_limited: bool) -> Self {
        Self {
            percent_complete: counters.percent_complete(),
            items_total: counters.total,
            items_completed: counters.completed,
            items_failed: counters.failed,
            items_skipped: counters.skipped,
            items_canceled: counters.canceled,
            items_pending: counters.pending,
            eta_ms: eta.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            rate_limited,
        }
    }
}

/// An observer-facing update, in emission order per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobUpdate {
    StateChanged {
        job_id: JobId,
        prior_state: JobState,
        new_state: JobState,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Progress {
        job_id: JobId,
        #[serde(flatten)]
        progress: Progress,
        timestamp: DateTime<Utc>,
    },
}

impl JobUpdate {
    pub fn job_id(&self) -> JobId {
        match self {
            JobUpdate::StateChanged { job_id, .. } | JobUpdate::Progress { job_id, .. } => *job_id,
        }
    }

    /// The job reached a terminal state; its stream closes after this.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobUpdate::StateChanged { new_state, .. } if new_state.is_terminal())
    }
}
