//! Circuit breakers keyed by logical operation name.
//!
//! ```text
//! closed --(threshold failures within window)--> open
//! open --(cooldown elapsed, one caller admitted)--> half_open
//! half_open --(trial success)--> closed
//! half_open --(trial failure)--> open
//! ```
//!
//! The registry is an ordinary object owned by the orchestrator and shared
//! with the retry executor; each operation's state sits behind its own lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerSettings;
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Rolling window in which failures are counted.
    pub window: Duration,
    /// Time spent open before a half-open trial is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of one breaker, for operators and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub operation: String,
    pub state: CircuitState,
    /// Failures currently inside the rolling window.
    pub recent_failures: u32,
    /// Time until a half-open trial may start, when open.
    pub retry_after_ms: Option<u64>,
    pub since_last_failure_ms: Option<u64>,
    pub since_last_success_ms: Option<u64>,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    /// Timestamps of failures inside the rolling window, while closed.
    failures: VecDeque<Instant>,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    opened_at: Option<Instant>,
    /// Start of the in-flight half-open trial.
    trial_started: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            last_failure: None,
            last_success: None,
            opened_at: None,
            trial_started: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether `can_execute_at` would admit a caller, without admitting one.
    fn admits(&self, now: Instant, cooldown: Duration) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_remaining(now, cooldown).is_zero(),
            CircuitState::HalfOpen => self
                .trial_started
                .is_none_or(|started| now.saturating_duration_since(started) >= cooldown),
        }
    }

    fn cooldown_remaining(&self, now: Instant, cooldown: Duration) -> Duration {
        self.opened_at
            .map(|opened| (opened + cooldown).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

pub struct CircuitBreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: DashMap<String, Arc<Mutex<Breaker>>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl From<&BreakerSettings> for CircuitBreakerRegistry {
    fn from(s: &BreakerSettings) -> Self {
        let defaults = BreakerConfig {
            failure_threshold: s.failure_threshold,
            window: Duration::from_millis(s.window_ms),
            cooldown: Duration::from_millis(s.cooldown_ms),
        };
        let mut registry = Self::new(defaults);
        for (name, op) in &s.operations {
            registry = registry.with_operation(
                name.clone(),
                BreakerConfig {
                    failure_threshold: op.failure_threshold.unwrap_or(defaults.failure_threshold),
                    window: op.window_ms.map_or(defaults.window, Duration::from_millis),
                    cooldown: op.cooldown_ms.map_or(defaults.cooldown, Duration::from_millis),
                },
            );
        }
        registry
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Use a dedicated configuration for one operation.
    pub fn with_operation(mut self, operation: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(operation.into(), config);
        self
    }

    pub fn config_for(&self, operation: &str) -> BreakerConfig {
        self.overrides
            .get(operation)
            .copied()
            .unwrap_or(self.defaults)
    }

    pub fn can_execute(&self, operation: &str) -> bool {
        self.can_execute_at(operation, Instant::now())
    }

    /// Would [`can_execute`](Self::can_execute) let a call through? Does
    /// not start a half-open trial.
    pub fn is_admitting(&self, operation: &str) -> bool {
        self.is_admitting_at(operation, Instant::now())
    }

    pub fn is_admitting_at(&self, operation: &str, now: Instant) -> bool {
        let config = self.config_for(operation);
        self.breakers
            .get(operation)
            .map(|b| Arc::clone(&b))
            .is_none_or(|breaker| breaker.lock().admits(now, config.cooldown))
    }

    /// May a call to `operation` proceed at `now`?
    ///
    /// While open, refuses until the cooldown elapses, then admits exactly
    /// one caller as the half-open trial. Others are refused until the
    /// trial reports. A trial that never reports within another cooldown is
    /// treated as lost and a fresh one is admitted.
    pub fn can_execute_at(&self, operation: &str, now: Instant) -> bool {
        let config = self.config_for(operation);
        let breaker = self.breaker(operation);
        let mut breaker = breaker.lock();

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if breaker.cooldown_remaining(now, config.cooldown).is_zero() {
                    self.transition(operation, &mut breaker, CircuitState::HalfOpen);
                    breaker.trial_started = Some(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match breaker.trial_started {
                Some(started) if now.saturating_duration_since(started) < config.cooldown => false,
                _ => {
                    warn!(operation, "half-open trial never reported, admitting a new one");
                    breaker.trial_started = Some(now);
                    true
                }
            },
        }
    }

    pub fn record_success(&self, operation: &str) {
        self.record_success_at(operation, Instant::now());
    }

    pub fn record_success_at(&self, operation: &str, now: Instant) {
        let breaker = self.breaker(operation);
        let mut breaker = breaker.lock();
        breaker.last_success = Some(now);
        match breaker.state {
            CircuitState::Closed => breaker.failures.clear(),
            CircuitState::HalfOpen => {
                breaker.failures.clear();
                breaker.trial_started = None;
                breaker.opened_at = None;
                self.transition(operation, &mut breaker, CircuitState::Closed);
            }
            // A straggler from before the circuit opened.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, operation: &str) {
        self.record_failure_at(operation, Instant::now());
    }

    pub fn record_failure_at(&self, operation: &str, now: Instant) {
        let config = self.config_for(operation);
        let breaker = self.breaker(operation);
        let mut breaker = breaker.lock();
        breaker.last_failure = Some(now);

        match breaker.state {
            CircuitState::Closed => {
                breaker.failures.push_back(now);
                breaker.prune(now, config.window);
                if breaker.failures.len() as u64 >= u64::from(config.failure_threshold) {
                    breaker.opened_at = Some(now);
                    breaker.failures.clear();
                    self.transition(operation, &mut breaker, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                breaker.opened_at = Some(now);
                breaker.trial_started = None;
                self.transition(operation, &mut breaker, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Remaining cooldown for an open circuit, zero otherwise.
    pub fn retry_after_at(&self, operation: &str, now: Instant) -> Duration {
        let config = self.config_for(operation);
        let breaker = self.breaker(operation);
        let breaker = breaker.lock();
        match breaker.state {
            CircuitState::Open => breaker.cooldown_remaining(now, config.cooldown),
            CircuitState::HalfOpen => breaker
                .trial_started
                .map(|started| (started + config.cooldown).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO),
            CircuitState::Closed => Duration::ZERO,
        }
    }

    pub fn state(&self, operation: &str) -> CircuitState {
        self.breakers
            .get(operation)
            .map_or(CircuitState::Closed, |b| b.lock().state)
    }

    pub fn snapshot(&self, operation: &str) -> CircuitSnapshot {
        self.snapshot_at(operation, Instant::now())
    }

    pub fn snapshot_at(&self, operation: &str, now: Instant) -> CircuitSnapshot {
        let config = self.config_for(operation);
        let Some(breaker) = self.breakers.get(operation).map(|b| Arc::clone(&b)) else {
            return CircuitSnapshot {
                operation: operation.to_string(),
                state: CircuitState::Closed,
                recent_failures: 0,
                retry_after_ms: None,
                since_last_failure_ms: None,
                since_last_success_ms: None,
            };
        };
        let mut breaker = breaker.lock();
        breaker.prune(now, config.window);
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        let since = |at: Option<Instant>| at.map(|at| millis(now.saturating_duration_since(at)));
        let retry_after_ms = (breaker.state == CircuitState::Open)
            .then(|| millis(breaker.cooldown_remaining(now, config.cooldown)));
        CircuitSnapshot {
            operation: operation.to_string(),
            state: breaker.state,
            recent_failures: breaker.failures.len() as u32,
            retry_after_ms,
            since_last_failure_ms: since(breaker.last_failure),
            since_last_success_ms: since(breaker.last_success),
        }
    }

    /// Force an operation's breaker back to closed.
    pub fn reset(&self, operation: &str) {
        if let Some(breaker) = self.breakers.get(operation).map(|b| Arc::clone(&b)) {
            let mut breaker = breaker.lock();
            breaker.failures.clear();
            breaker.opened_at = None;
            breaker.trial_started = None;
            if breaker.state != CircuitState::Closed {
                self.transition(operation, &mut breaker, CircuitState::Closed);
            }
        }
    }

    fn transition(&self, operation: &str, breaker: &mut Breaker, to: CircuitState) {
        let from = breaker.state;
        breaker.state = to;
        info!(operation, %from, %to, "circuit breaker transition");
        metrics::circuit_transitions().add(
            1,
            &[
                KeyValue::new("operation", operation.to_string()),
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }

    fn breaker(&self, operation: &str) -> Arc<Mutex<Breaker>> {
        if let Some(existing) = self.breakers.get(operation) {
            return Arc::clone(&existing);
        }
        Arc::clone(
            &self
                .breakers
                .entry(operation.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Breaker::new()))),
        )
    }
}
