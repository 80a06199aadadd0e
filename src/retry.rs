//! Retry executor.
//!
//! Drives repeated attempts of one work item through the rate limiter and
//! the circuit breaker for the item's operation. Retriable failures are
//! absorbed up to the attempt and time budgets; anything else ends in the
//! dead-letter store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::config::{RateLimitPolicy, Settings, StrategyKind};
use crate::dead_letter::{DeadLetterEntry, DeadLetterId, DeadLetterStore};
use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::model::failure::{AttemptOutcome, AttemptRecord, ClassifiedError};
use crate::model::{ItemState, JobContext, WorkItem};
use crate::telemetry::metrics;

/// Floor for sleeps while a circuit is refusing calls.
const MIN_CIRCUIT_POLL: Duration = Duration::from_millis(10);

/// How long to wait before retry number `attempt` (zero-based).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    Exponential {
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    },
    /// `initial_delay + attempt * backoff_factor`, capped at `max_delay`.
    Linear {
        initial_delay: Duration,
        backoff_factor: Duration,
        max_delay: Duration,
    },
    Fixed {
        delay: Duration,
    },
    Immediate,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Delay before retry `attempt`, where 0 is the first retry. No jitter.
pub fn compute_delay(strategy: &BackoffStrategy, attempt: u32) -> Duration {
    match *strategy {
        BackoffStrategy::Exponential {
            initial_delay,
            multiplier,
            max_delay,
        } => {
            let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
            let secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
            Duration::try_from_secs_f64(secs)
                .unwrap_or(max_delay)
                .min(max_delay)
        }
        BackoffStrategy::Linear {
            initial_delay,
            backoff_factor,
            max_delay,
        } => backoff_factor
            .checked_mul(attempt)
            .and_then(|step| initial_delay.checked_add(step))
            .unwrap_or(max_delay)
            .min(max_delay),
        BackoffStrategy::Fixed { delay } => delay,
        BackoffStrategy::Immediate => Duration::ZERO,
    }
}

/// Scale `delay` by a random factor in `[1 - jitter, 1 + jitter]`.
pub fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let jitter = jitter.min(1.0);
    let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor)
}

/// Limits and behavior of the retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    /// Maximum calls to the work function per item.
    pub max_retries: u32,
    /// Budget for one item's whole attempt history.
    pub total_timeout: Duration,
    /// ± fraction applied to each computed delay.
    pub jitter: f64,
    /// How long an item may wait on an open circuit before it is
    /// dead-lettered.
    pub open_grace: Duration,
    pub rate_limit: RateLimitPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        let retry = &settings.retry;
        let initial_delay = Duration::from_millis(retry.initial_delay_ms);
        let max_delay = Duration::from_millis(retry.max_delay_ms);
        let strategy = match retry.strategy {
            StrategyKind::Exponential => BackoffStrategy::Exponential {
                initial_delay,
                multiplier: retry.multiplier,
                max_delay,
            },
            StrategyKind::Linear => BackoffStrategy::Linear {
                initial_delay,
                backoff_factor: Duration::from_millis(retry.backoff_factor_ms),
                max_delay,
            },
            StrategyKind::Fixed => BackoffStrategy::Fixed {
                delay: initial_delay,
            },
            StrategyKind::Immediate => BackoffStrategy::Immediate,
        };
        Self {
            strategy,
            max_retries: retry.max_retries,
            total_timeout: Duration::from_millis(retry.total_timeout_ms),
            jitter: retry.jitter,
            open_grace: Duration::from_millis(settings.breaker.open_grace_ms),
            rate_limit: settings.rate_limit.policy,
        }
    }
}

/// What the executor needs to know about the item it is running.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub job: JobContext,
    /// Carries attempts and history from earlier passes.
    pub item: WorkItem,
    /// Downstream operation name, used as the circuit breaker key.
    pub operation: String,
}

#[derive(Debug)]
pub enum RunOutcome<T> {
    Succeeded {
        item: WorkItem,
        output: T,
    },
    /// Failure was non-retriable or the budgets ran out.
    DeadLettered {
        item: WorkItem,
        entry_id: DeadLetterId,
        error: ClassifiedError,
    },
    /// The rate limiter rejected the attempt and the policy is to
    /// reschedule. No attempt was consumed.
    Throttled {
        item: WorkItem,
        retry_after: Duration,
    },
}

/// Hooks for progress reporting from inside the retry loop.
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    async fn throttled(&self, _item: &WorkItem, _retry_after: Duration) {}
    async fn attempt_failed(&self, _item: &WorkItem, _error: &ClassifiedError) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl AttemptObserver for NoopObserver {}

pub struct RetryExecutor {
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    dead_letters: Arc<DeadLetterStore>,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(
        limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        dead_letters: Arc<DeadLetterStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            limiter,
            breakers,
            dead_letters,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt_fn` until it succeeds, is rescheduled by the rate
    /// limiter, or is dead-lettered.
    ///
    /// `attempt_fn` receives the 1-based attempt number. It must be safe to
    /// call repeatedly for the same item.
    pub async fn run<T, F, Fut>(
        &self,
        ctx: RetryContext,
        mut attempt_fn: F,
        observer: &dyn AttemptObserver,
    ) -> Result<RunOutcome<T>>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, ClassifiedError>> + Send,
    {
        let RetryContext {
            job,
            mut item,
            operation,
        } = ctx;
        let mut spent = Duration::from_millis(item.retry_elapsed_ms);
        let mut circuit_wait = Duration::ZERO;

        loop {
            // Waiting on an open circuit must not spend the tenant's quota.
            if !self.breakers.is_admitting(&operation) {
                match self
                    .circuit_refused(&job, &mut item, &operation, &mut spent, &mut circuit_wait)
                    .await
                {
                    Some(error) => return self.dead_letter(&job, item, error).await,
                    None => continue,
                }
            }

            let admission = self.limiter.admit(&job.actor_id, &job.tenant_id, 1);
            if !admission.allowed {
                observer.throttled(&item, admission.retry_after).await;
                match self.policy.rate_limit {
                    RateLimitPolicy::Reschedule => {
                        item.retry_elapsed_ms = millis(spent);
                        return Ok(RunOutcome::Throttled {
                            item,
                            retry_after: admission.retry_after,
                        });
                    }
                    RateLimitPolicy::Wait => {
                        debug!(job_id = %job.id, item = item.index, wait_ms = millis(admission.retry_after), "waiting for admission");
                        tokio::time::sleep(admission.retry_after).await;
                        continue;
                    }
                }
            }

            if !self.breakers.can_execute(&operation) {
                // Another caller took the half-open trial in between.
                self.limiter.refund(&job.actor_id, &job.tenant_id, 1);
                match self
                    .circuit_refused(&job, &mut item, &operation, &mut spent, &mut circuit_wait)
                    .await
                {
                    Some(error) => return self.dead_letter(&job, item, error).await,
                    None => continue,
                }
            }
            circuit_wait = Duration::ZERO;

            item.attempts += 1;
            let attempt = item.attempts;
            let started_at = Utc::now();
            let clock = Instant::now();
            let result = attempt_fn(attempt).await;
            let took = clock.elapsed();
            spent += took;

            match result {
                Ok(output) => {
                    self.breakers.record_success(&operation);
                    item.history.push(AttemptRecord {
                        attempt,
                        started_at,
                        duration_ms: millis(took),
                        outcome: AttemptOutcome::Succeeded,
                    });
                    item.retry_elapsed_ms = millis(spent);
                    record_duration(&operation, "ok", took);
                    return Ok(RunOutcome::Succeeded { item, output });
                }
                Err(error) => {
                    // Bad input still counts as an answer from the dependency.
                    if error.class.counts_against_breaker() {
                        self.breakers.record_failure(&operation);
                    } else {
                        self.breakers.record_success(&operation);
                    }
                    item.history.push(AttemptRecord {
                        attempt,
                        started_at,
                        duration_ms: millis(took),
                        outcome: AttemptOutcome::Failed {
                            class: error.class,
                            message: error.message.clone(),
                        },
                    });
                    item.last_error = Some(error.to_string());
                    item.retry_elapsed_ms = millis(spent);
                    record_duration(&operation, "error", took);
                    observer.attempt_failed(&item, &error).await;

                    if !error.is_retriable() {
                        return self.dead_letter(&job, item, error).await;
                    }
                    if attempt >= self.policy.max_retries || spent >= self.policy.total_timeout {
                        return self.dead_letter(&job, item, error).await;
                    }

                    let delay = apply_jitter(
                        compute_delay(&self.policy.strategy, attempt - 1),
                        self.policy.jitter,
                    )
                    .max(error.retry_after.unwrap_or_default());
                    if spent + delay >= self.policy.total_timeout {
                        return self.dead_letter(&job, item, error).await;
                    }

                    warn!(
                        job_id = %job.id,
                        item = item.index,
                        attempt,
                        class = %error.class,
                        delay_ms = millis(delay),
                        error = %error.message,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    spent += delay;
                }
            }
        }
    }

    /// Record a refused call and wait for the circuit. Returns the error to
    /// dead-letter with once the grace period or the time budget is spent.
    async fn circuit_refused(
        &self,
        job: &JobContext,
        item: &mut WorkItem,
        operation: &str,
        spent: &mut Duration,
        circuit_wait: &mut Duration,
    ) -> Option<ClassifiedError> {
        item.history.push(AttemptRecord {
            attempt: item.attempts + 1,
            started_at: Utc::now(),
            duration_ms: 0,
            outcome: AttemptOutcome::CircuitOpen,
        });
        if *circuit_wait >= self.policy.open_grace || *spent >= self.policy.total_timeout {
            item.retry_elapsed_ms = millis(*spent);
            return Some(
                ClassifiedError::transient(format!(
                    "circuit for {operation} stayed open past the grace period"
                ))
                .with_code("circuit_open"),
            );
        }
        let wait = self
            .breakers
            .retry_after_at(operation, Instant::now())
            .min(self.policy.open_grace.saturating_sub(*circuit_wait))
            .min(self.policy.total_timeout.saturating_sub(*spent))
            .max(MIN_CIRCUIT_POLL);
        debug!(job_id = %job.id, item = item.index, operation, wait_ms = millis(wait), "circuit open, waiting");
        tokio::time::sleep(wait).await;
        *spent += wait;
        *circuit_wait += wait;
        None
    }

    async fn dead_letter<T>(
        &self,
        job: &JobContext,
        mut item: WorkItem,
        error: ClassifiedError,
    ) -> Result<RunOutcome<T>> {
        let mut snapshot = item.clone();
        snapshot.state = ItemState::Failed;
        snapshot.finished_at = Some(Utc::now());
        let entry = DeadLetterEntry::new(job.clone(), snapshot, error.clone());
        self.dead_letters.add(&entry).await?;
        info!(job_id = %job.id, item = item.index, entry_id = %entry.id, "item moved to dead letters");

        item.dead_letter = Some(entry.id);
        item.last_error = Some(error.to_string());
        Ok(RunOutcome::DeadLettered {
            item,
            entry_id: entry.id,
            error,
        })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn record_duration(operation: &str, outcome: &'static str, took: Duration) {
    metrics::attempt_duration_ms().record(
        took.as_secs_f64() * 1000.0,
        &[
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("outcome", outcome),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::db::Db;
    use crate::dead_letter::DeadLetterFilter;
    use crate::limiter::RateLimitConfig;
    use crate::model::NewJob;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let strategy = BackoffStrategy::Exponential {
            initial_delay: ms(100),
            multiplier: 2.0,
            max_delay: ms(1000),
        };
        let delays: Vec<_> = (0..6).map(|a| compute_delay(&strategy, a)).collect();
        assert_eq!(
            delays,
            vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000)]
        );
        assert_eq!(compute_delay(&strategy, u32::MAX), ms(1000));
    }

    #[test]
    fn linear_grows_by_factor() {
        let strategy = BackoffStrategy::Linear {
            initial_delay: ms(100),
            backoff_factor: ms(50),
            max_delay: ms(220),
        };
        assert_eq!(compute_delay(&strategy, 0), ms(100));
        assert_eq!(compute_delay(&strategy, 2), ms(200));
        assert_eq!(compute_delay(&strategy, 3), ms(220));
    }

    #[test]
    fn fixed_and_immediate() {
        assert_eq!(compute_delay(&BackoffStrategy::Fixed { delay: ms(7) }, 9), ms(7));
        assert_eq!(compute_delay(&BackoffStrategy::Immediate, 3), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..200 {
            let d = apply_jitter(ms(1000), 0.1);
            assert!(d >= ms(900) && d <= ms(1100), "{d:?}");
        }
        assert_eq!(apply_jitter(ms(1000), 0.0), ms(1000));
    }

    struct Harness {
        executor: RetryExecutor,
        store: Arc<DeadLetterStore>,
        breakers: Arc<CircuitBreakerRegistry>,
        limiter: Arc<RateLimiter>,
    }

    async fn harness(policy: RetryPolicy, limits: RateLimitConfig) -> Harness {
        harness_with_cooldown(policy, limits, ms(20)).await
    }

    async fn harness_with_cooldown(
        policy: RetryPolicy,
        limits: RateLimitConfig,
        cooldown: Duration,
    ) -> Harness {
        let db = Arc::new(Db::in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let store = Arc::new(DeadLetterStore::new(db, Duration::from_secs(3600)));
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 100,
            window: Duration::from_secs(60),
            cooldown,
        }));
        let limiter = Arc::new(RateLimiter::new(limits));
        let executor = RetryExecutor::new(
            Arc::clone(&limiter),
            Arc::clone(&breakers),
            Arc::clone(&store),
            policy,
        );
        Harness {
            executor,
            store,
            breakers,
            limiter,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            strategy: BackoffStrategy::Fixed { delay: ms(1) },
            max_retries,
            total_timeout: Duration::from_secs(10),
            jitter: 0.0,
            open_grace: ms(100),
            rate_limit: RateLimitPolicy::Reschedule,
        }
    }

    fn context() -> RetryContext {
        let job = NewJob::new("post", "acme", "alice")
            .item(json!({"n": 1}))
            .into_job(Utc::now());
        RetryContext {
            job: job.context(),
            item: job.items[0].clone(),
            operation: "content_generate".into(),
        }
    }

    #[tokio::test]
    async fn succeeds_on_last_allowed_attempt() {
        let h = harness(fast_policy(3), RateLimitConfig::default()).await;
        let calls = AtomicU32::new(0);
        let outcome = h
            .executor
            .run(
                context(),
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(ClassifiedError::transient("blip"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                &NoopObserver,
            )
            .await
            .unwrap();

        match outcome {
            RunOutcome::Succeeded { item, output } => {
                assert_eq!(output, 3);
                assert_eq!(item.attempts, 3);
                assert_eq!(item.history.len(), 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_with_full_history() {
        let h = harness(fast_policy(3), RateLimitConfig::default()).await;
        let outcome = h
            .executor
            .run(
                context(),
                |_| async { Err::<(), _>(ClassifiedError::network("down")) },
                &NoopObserver,
            )
            .await
            .unwrap();

        let RunOutcome::DeadLettered { entry_id, item, .. } = outcome else {
            panic!("expected dead letter");
        };
        assert_eq!(item.attempts, 3);
        let entry = h.store.get(entry_id).await.unwrap();
        assert_eq!(entry.attempts(), 3);
        assert_eq!(entry.item.state, ItemState::Failed);
        assert_eq!(entry.history().len(), 3);
        assert_eq!(entry.class, crate::model::failure::FailureClass::Network);
    }

    #[tokio::test]
    async fn non_retriable_failure_is_not_retried() {
        let h = harness(fast_policy(5), RateLimitConfig::default()).await;
        let calls = AtomicU32::new(0);
        let outcome = h
            .executor
            .run(
                context(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(ClassifiedError::validation("bad row")) }
                },
                &NoopObserver,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::DeadLettered { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.store.list(&DeadLetterFilter::default()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn open_circuit_does_not_consume_attempts() {
        let h = harness(fast_policy(2), RateLimitConfig::default()).await;
        for _ in 0..100 {
            h.breakers.record_failure("content_generate");
        }
        let calls = AtomicU32::new(0);
        let outcome = h
            .executor
            .run(
                context(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, ClassifiedError>(()) }
                },
                &NoopObserver,
            )
            .await
            .unwrap();

        // The circuit cools down after 20ms and the half-open trial succeeds.
        let RunOutcome::Succeeded { item, .. } = outcome else {
            panic!("expected success after cooldown");
        };
        assert_eq!(item.attempts, 1);
        assert!(item
            .history
            .iter()
            .any(|r| r.outcome == AttemptOutcome::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistently_open_circuit_dead_letters_after_grace() {
        let mut policy = fast_policy(3);
        policy.open_grace = ms(30);
        let h = harness_with_cooldown(policy, RateLimitConfig::default(), Duration::from_secs(600))
            .await;
        for _ in 0..100 {
            h.breakers.record_failure("content_generate");
        }
        let calls = AtomicU32::new(0);
        let outcome = h
            .executor
            .run(
                context(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, ClassifiedError>(()) }
                },
                &NoopObserver,
            )
            .await
            .unwrap();

        let RunOutcome::DeadLettered { error, item, .. } = outcome else {
            panic!("expected dead letter");
        };
        assert_eq!(error.code.as_deref(), Some("circuit_open"));
        assert_eq!(item.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validation_failure_in_trial_closes_circuit() {
        let h = harness(fast_policy(3), RateLimitConfig::default()).await;
        for _ in 0..100 {
            h.breakers.record_failure("content_generate");
        }
        tokio::time::sleep(ms(25)).await;

        let outcome = h
            .executor
            .run(
                context(),
                |_| async { Err::<(), _>(ClassifiedError::validation("missing title")) },
                &NoopObserver,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::DeadLettered { .. }));
        assert_eq!(h.breakers.state("content_generate"), CircuitState::Closed);
        assert!(h.breakers.can_execute("content_generate"));
    }

    #[tokio::test]
    async fn waiting_on_open_circuit_spends_no_quota() {
        let mut policy = fast_policy(3);
        policy.open_grace = ms(30);
        let limits = RateLimitConfig {
            actor_limit: 100,
            actor_window: Duration::from_secs(60),
            tenant_capacity: 3.0,
            tenant_refill_per_sec: 0.001,
        };
        let h = harness_with_cooldown(policy, limits, Duration::from_secs(600)).await;
        for _ in 0..100 {
            h.breakers.record_failure("content_generate");
        }

        let outcome = h
            .executor
            .run(context(), |_| async { Ok::<_, ClassifiedError>(()) }, &NoopObserver)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::DeadLettered { .. }));

        let tokens = h
            .limiter
            .tenant_tokens_at("acme", Instant::now())
            .unwrap_or(3.0);
        assert!((tokens - 3.0).abs() < 0.01, "tenant charged: {tokens} left");
    }

    #[tokio::test]
    async fn throttled_item_is_handed_back_without_attempts() {
        let h = harness(
            fast_policy(3),
            RateLimitConfig {
                actor_limit: 1,
                actor_window: Duration::from_secs(60),
                tenant_capacity: 10.0,
                tenant_refill_per_sec: 1.0,
            },
        )
        .await;
        let first = h
            .executor
            .run(context(), |_| async { Ok::<_, ClassifiedError>(()) }, &NoopObserver)
            .await
            .unwrap();
        assert!(matches!(first, RunOutcome::Succeeded { .. }));

        let second = h
            .executor
            .run(context(), |_| async { Ok::<_, ClassifiedError>(()) }, &NoopObserver)
            .await
            .unwrap();
        let RunOutcome::Throttled { item, retry_after } = second else {
            panic!("expected throttle");
        };
        assert_eq!(item.attempts, 0);
        assert!(retry_after > Duration::from_secs(59));
    }
}
