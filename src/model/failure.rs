//! Failure taxonomy.
//!
//! Every work-function failure is classified exactly once, when it is
//! raised, and the class travels with the attempt record into the
//! dead-letter store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a work-function failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Temporary glitch. Retry.
    Transient,
    /// Downstream quota exhausted. Retry.
    RateLimited,
    /// Connectivity failure. Retry.
    Network,
    /// Resource exhaustion on our side. Retry.
    System,
    /// Will never succeed. No retry.
    Permanent,
    /// Bad input. No retry.
    Validation,
    /// Credential failure. No retry.
    Authentication,
}

impl FailureClass {
    pub const ALL: [FailureClass; 7] = [
        FailureClass::Transient,
        FailureClass::RateLimited,
        FailureClass::Network,
        FailureClass::System,
        FailureClass::Permanent,
        FailureClass::Validation,
        FailureClass::Authentication,
    ];

    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            FailureClass::Transient
                | FailureClass::RateLimited
                | FailureClass::Network
                | FailureClass::System
        )
    }

    /// Whether a failure of this class says something about the health of
    /// the downstream dependency. Bad input does not.
    pub fn counts_against_breaker(self) -> bool {
        !matches!(self, FailureClass::Validation)
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureClass::Transient => "transient",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Network => "network",
            FailureClass::System => "system",
            FailureClass::Permanent => "permanent",
            FailureClass::Validation => "validation",
            FailureClass::Authentication => "authentication",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for FailureClass {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureClass::ALL
            .into_iter()
            .find(|class| class.to_string() == s)
            .ok_or_else(|| crate::error::Error::Other(format!("unknown failure class: {s}")))
    }
}

/// A failure raised by a work function, already classified.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{class}: {message}")]
pub struct ClassifiedError {
    pub class: FailureClass,
    pub message: String,
    /// Provider-specific error code, if any.
    pub code: Option<String>,
    /// Minimum wait suggested by the downstream (e.g. a Retry-After header).
    pub retry_after: Option<Duration>,
    /// The whole job cannot proceed (e.g. its source is unreadable).
    #[serde(default)]
    pub fatal: bool,
}

impl ClassifiedError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            code: None,
            retry_after: None,
            fatal: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureClass::RateLimited, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Network, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(FailureClass::System, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Permanent, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Validation, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Authentication, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    /// Mark the failure as fatal for the whole job: the job fails with
    /// [`FailureReason::SourceUnreadable`] and its remaining items are
    /// canceled.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn is_retriable(&self) -> bool {
        !self.fatal && self.class.is_retriable()
    }
}

/// What happened on one pass through the retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed {
        class: FailureClass,
        message: String,
    },
    /// Circuit breaker refused the call. No attempt budget consumed.
    CircuitOpen,
}

/// One entry of a work item's attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number (1-based). A circuit rejection carries the number of
    /// the attempt it blocked.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
}

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DeadlineExceeded,
    FatalItemFailureRate,
    ExplicitCancelEscalation,
    SourceUnreadable,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::DeadlineExceeded => "deadline_exceeded",
            FailureReason::FatalItemFailureRate => "fatal_item_failure_rate",
            FailureReason::ExplicitCancelEscalation => "explicit_cancel_escalation",
            FailureReason::SourceUnreadable => "source_unreadable",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classes_match_taxonomy() {
        let retriable: Vec<_> = FailureClass::ALL
            .into_iter()
            .filter(|class| class.is_retriable())
            .collect();
        assert_eq!(
            retriable,
            vec![
                FailureClass::Transient,
                FailureClass::RateLimited,
                FailureClass::Network,
                FailureClass::System,
            ]
        );
    }

    #[test]
    fn fatal_errors_are_never_retried() {
        assert!(ClassifiedError::transient("blip").is_retriable());
        assert!(!ClassifiedError::transient("sheet gone").fatal().is_retriable());
    }

    #[test]
    fn class_parses_from_snake_case() {
        assert_eq!(
            "rate_limited".parse::<FailureClass>().unwrap(),
            FailureClass::RateLimited
        );
        assert!("bogus".parse::<FailureClass>().is_err());
    }
}
