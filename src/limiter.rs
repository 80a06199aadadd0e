//! Admission control.
//!
//! Two independent quota dimensions must both pass:
//! - a per-actor sliding window (at most N admissions per rolling window),
//! - a per-tenant token bucket (capacity C, refill R tokens/second).
//!
//! State is partitioned per key: each actor window and tenant bucket sits
//! behind its own mutex inside a `DashMap`, so unrelated tenants never
//! contend. A rejected call has no side effects.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitSettings;
use crate::telemetry::metrics;

/// Limits applied by the [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Admissions allowed per actor within `actor_window`.
    pub actor_limit: u32,
    pub actor_window: Duration,
    /// Token bucket capacity per tenant.
    pub tenant_capacity: f64,
    /// Tokens added per second per tenant.
    pub tenant_refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            actor_limit: 60,
            actor_window: Duration::from_secs(60),
            tenant_capacity: 100.0,
            tenant_refill_per_sec: 10.0,
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(s: &RateLimitSettings) -> Self {
        Self {
            actor_limit: s.actor_limit,
            actor_window: Duration::from_millis(s.actor_window_ms),
            tenant_capacity: s.tenant_capacity,
            tenant_refill_per_sec: s.tenant_refill_per_sec,
        }
    }
}

/// Answer to "may this unit proceed now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Zero when allowed.
    pub retry_after: Duration,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    fn rejected(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Timestamps of recently admitted requests for one actor.
#[derive(Debug, Default)]
struct SlidingWindow {
    admitted: VecDeque<Instant>,
    last_seen: Option<Instant>,
}

impl SlidingWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// `Err(wait)` until the oldest record in the window expires.
    fn check(&self, now: Instant, window: Duration, limit: u32) -> Result<(), Duration> {
        if (self.admitted.len() as u64) < u64::from(limit) {
            return Ok(());
        }
        let wait = self
            .admitted
            .front()
            .map(|&oldest| (oldest + window).saturating_duration_since(now))
            .unwrap_or(window);
        Err(wait)
    }

    fn record(&mut self, now: Instant) {
        self.admitted.push_back(now);
    }

    fn unrecord(&mut self) {
        self.admitted.pop_back();
    }
}

/// Lazily refilled token bucket for one tenant.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: now,
        }
    }

    /// `tokens = min(C, tokens + elapsed * R)`.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// `Err(wait)` with `(cost - tokens) / R` when short.
    fn check(&self, cost: f64) -> Result<(), Duration> {
        if self.tokens >= cost {
            return Ok(());
        }
        let secs = (cost - self.tokens) / self.refill_rate;
        Err(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }

    fn deduct(&mut self, cost: f64) {
        self.tokens = (self.tokens - cost).clamp(0.0, self.capacity);
    }

    fn credit(&mut self, cost: f64) {
        self.tokens = (self.tokens + cost).min(self.capacity);
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Combined per-actor / per-tenant admission gate.
pub struct RateLimiter {
    config: RateLimitConfig,
    actors: DashMap<String, Arc<Mutex<SlidingWindow>>>,
    tenants: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            actors: DashMap::new(),
            tenants: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit one unit of `cost` for the actor and tenant, now.
    pub fn admit(&self, actor_id: &str, tenant_id: &str, cost: u32) -> Admission {
        self.admit_at(actor_id, tenant_id, cost, Instant::now())
    }

    /// Admission decision at an explicit instant.
    pub fn admit_at(&self, actor_id: &str, tenant_id: &str, cost: u32, now: Instant) -> Admission {
        let cost = f64::from(cost);
        let window = self.actor_window(actor_id);
        let bucket = self.tenant_bucket(tenant_id, now);

        // Fixed lock order: actor, then tenant.
        let mut window = window.lock();
        let mut bucket = bucket.lock();

        window.prune(now, self.config.actor_window);
        window.last_seen = Some(now);
        bucket.refill(now);

        let window_check = window.check(now, self.config.actor_window, self.config.actor_limit);
        let bucket_check = if cost > self.config.tenant_capacity {
            // Can never be satisfied; report the time a full refill takes.
            Err(Duration::try_from_secs_f64(
                self.config.tenant_capacity / self.config.tenant_refill_per_sec,
            )
            .unwrap_or(Duration::MAX))
        } else {
            bucket.check(cost)
        };

        let admission = match (window_check, bucket_check) {
            (Ok(()), Ok(())) => {
                window.record(now);
                bucket.deduct(cost);
                Admission::allowed()
            }
            (Err(a), Ok(())) | (Ok(()), Err(a)) => Admission::rejected(a),
            (Err(a), Err(b)) => Admission::rejected(a.max(b)),
        };

        if !admission.allowed {
            debug!(
                actor_id,
                tenant_id,
                retry_after_ms = admission.retry_after.as_millis() as u64,
                "admission rejected"
            );
        }
        metrics::rate_limit_decisions().add(
            1,
            &[KeyValue::new(
                "result",
                if admission.allowed { "allowed" } else { "rejected" },
            )],
        );
        admission
    }

    /// Give back an admission whose call was never made.
    pub fn refund(&self, actor_id: &str, tenant_id: &str, cost: u32) {
        self.refund_at(actor_id, tenant_id, cost, Instant::now());
    }

    pub fn refund_at(&self, actor_id: &str, tenant_id: &str, cost: u32, now: Instant) {
        let window = self.actor_window(actor_id);
        let bucket = self.tenant_bucket(tenant_id, now);
        let mut window = window.lock();
        let mut bucket = bucket.lock();
        window.unrecord();
        bucket.refill(now);
        bucket.credit(f64::from(cost));
        debug!(actor_id, tenant_id, cost, "admission refunded");
    }

    /// Current tokens in a tenant's bucket, refilled to `now`. `None` if the
    /// tenant has never been seen.
    pub fn tenant_tokens_at(&self, tenant_id: &str, now: Instant) -> Option<f64> {
        let bucket = self.tenants.get(tenant_id)?.clone();
        let mut bucket = bucket.lock();
        bucket.refill(now);
        Some(bucket.tokens())
    }

    /// Drop state for keys idle longer than `idle`: actor windows that are
    /// empty and tenant buckets that have refilled to capacity. Keys held by
    /// an admission in progress are kept. Returns the number of keys removed.
    pub fn evict_idle(&self, now: Instant, idle: Duration) -> usize {
        let before = self.actors.len() + self.tenants.len();
        let window_len = self.config.actor_window;
        self.actors.retain(|_, window| {
            if Arc::strong_count(window) > 1 {
                return true;
            }
            let mut window = window.lock();
            window.prune(now, window_len);
            let quiet = window
                .last_seen
                .is_none_or(|seen| now.saturating_duration_since(seen) >= idle);
            !(quiet && window.admitted.is_empty())
        });
        self.tenants.retain(|_, bucket| {
            if Arc::strong_count(bucket) > 1 {
                return true;
            }
            let mut bucket = bucket.lock();
            let quiet = now.saturating_duration_since(bucket.last_refill) >= idle;
            bucket.refill(now);
            !(quiet && bucket.tokens >= bucket.capacity)
        });
        before - (self.actors.len() + self.tenants.len())
    }

    fn actor_window(&self, actor_id: &str) -> Arc<Mutex<SlidingWindow>> {
        if let Some(existing) = self.actors.get(actor_id) {
            return Arc::clone(&existing);
        }
        Arc::clone(
            &self
                .actors
                .entry(actor_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SlidingWindow::default()))),
        )
    }

    fn tenant_bucket(&self, tenant_id: &str, now: Instant) -> Arc<Mutex<TokenBucket>> {
        if let Some(existing) = self.tenants.get(tenant_id) {
            return Arc::clone(&existing);
        }
        Arc::clone(&self.tenants.entry(tenant_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(TokenBucket::new(
                self.config.tenant_capacity,
                self.config.tenant_refill_per_sec,
                now,
            )))
        }))
    }
}
