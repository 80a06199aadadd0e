//! Orchestrator tuning loaded from TOML. Every field has a default, so an
//! empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Size of the worker pool.
    pub workers: usize,
    /// Buffered updates per subscriber channel.
    pub channel_capacity: usize,
    pub rate_limit: RateLimitSettings,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub scheduler: SchedulerSettings,
    pub failure: FailureSettings,
    pub retention: RetentionSettings,
    pub eta: EtaSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 256,
            rate_limit: RateLimitSettings::default(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            scheduler: SchedulerSettings::default(),
            failure: FailureSettings::default(),
            retention: RetentionSettings::default(),
            eta: EtaSettings::default(),
        }
    }
}

impl Settings {
    /// Read, parse and validate a settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Parse and validate settings from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(raw).map_err(|e| Error::Config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, msg: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::Config(msg.to_string()))
            }
        }

        check(self.workers > 0, "workers must be at least 1")?;
        check(self.channel_capacity > 0, "channel_capacity must be at least 1")?;

        let rl = &self.rate_limit;
        check(rl.actor_limit > 0, "rate_limit.actor_limit must be at least 1")?;
        check(rl.actor_window_ms > 0, "rate_limit.actor_window_ms must be positive")?;
        check(rl.tenant_capacity >= 1.0, "rate_limit.tenant_capacity must be at least 1")?;
        check(
            rl.tenant_refill_per_sec > 0.0 && rl.tenant_refill_per_sec.is_finite(),
            "rate_limit.tenant_refill_per_sec must be positive",
        )?;

        let retry = &self.retry;
        check(retry.max_retries >= 1, "retry.max_retries must be at least 1")?;
        check(retry.multiplier >= 1.0, "retry.multiplier must be at least 1.0")?;
        check(
            (0.0..=1.0).contains(&retry.jitter),
            "retry.jitter must be within [0, 1]",
        )?;
        check(
            retry.initial_delay_ms <= retry.max_delay_ms,
            "retry.initial_delay_ms exceeds retry.max_delay_ms",
        )?;

        check(
            self.breaker.failure_threshold >= 1,
            "breaker.failure_threshold must be at least 1",
        )?;
        for (name, op) in &self.breaker.operations {
            if op.failure_threshold == Some(0) {
                return Err(Error::Config(format!(
                    "breaker.operations.{name}.failure_threshold must be at least 1"
                )));
            }
        }

        check(
            (0.0..=1.0).contains(&self.failure.fatal_failure_rate),
            "failure.fatal_failure_rate must be within [0, 1]",
        )?;
        check(
            self.retention.sweep_interval_ms > 0,
            "retention.sweep_interval_ms must be positive",
        )?;
        check(self.eta.history >= 1, "eta.history must be at least 1")?;
        check(
            self.eta.decay > 0.0 && self.eta.decay <= 1.0,
            "eta.decay must be within (0, 1]",
        )?;
        Ok(())
    }
}

/// What a worker does when the rate limiter rejects an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    /// Sleep the worker until `retry_after`, holding no job lock.
    Wait,
    /// Yield the worker and re-enqueue the job behind `retry_after`.
    #[default]
    Reschedule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    pub actor_limit: u32,
    pub actor_window_ms: u64,
    pub tenant_capacity: f64,
    pub tenant_refill_per_sec: f64,
    pub policy: RateLimitPolicy,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            actor_limit: 60,
            actor_window_ms: 60_000,
            tenant_capacity: 100.0,
            tenant_refill_per_sec: 10.0,
            policy: RateLimitPolicy::Reschedule,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub strategy: StrategyKind,
    /// Also the delay for the `fixed` strategy.
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub backoff_factor_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay, applied as ±jitter.
    pub jitter: f64,
    /// Maximum calls to the work function per item.
    pub max_retries: u32,
    pub total_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Exponential,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            backoff_factor_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.1,
            max_retries: 3,
            total_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub window_ms: u64,
    pub cooldown_ms: u64,
    /// How long an item may wait on an open circuit before dead-lettering.
    pub open_grace_ms: u64,
    /// Per-operation overrides, keyed by operation name.
    pub operations: BTreeMap<String, BreakerOverride>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            open_grace_ms: 120_000,
            operations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerOverride {
    pub failure_threshold: Option<u32>,
    pub window_ms: Option<u64>,
    pub cooldown_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSettings {
    /// Wait after which a queued job is promoted one tier.
    pub aging_threshold_ms: u64,
    /// How long in-flight work may run after a cancel before escalation.
    pub cancel_grace_ms: u64,
    /// Delay before a job whose worker hit an internal error is retried.
    pub release_delay_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            aging_threshold_ms: 300_000,
            cancel_grace_ms: 30_000,
            release_delay_ms: 1_000,
        }
    }
}

impl SchedulerSettings {
    pub fn aging_threshold(&self) -> Duration {
        Duration::from_millis(self.aging_threshold_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn release_delay(&self) -> Duration {
        Duration::from_millis(self.release_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailureSettings {
    /// A job fails once `items_failed / items_total` exceeds this. `1.0`
    /// never triggers.
    pub fatal_failure_rate: f64,
}

impl Default for FailureSettings {
    fn default() -> Self {
        Self {
            fatal_failure_rate: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionSettings {
    pub dead_letter_ms: u64,
    pub terminal_job_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            dead_letter_ms: 7 * 24 * 60 * 60 * 1_000,
            terminal_job_ms: 24 * 60 * 60 * 1_000,
            sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EtaSettings {
    /// Duration samples kept per job.
    pub history: usize,
    /// Weight multiplier per step back in history.
    pub decay: f64,
}

impl Default for EtaSettings {
    fn default() -> Self {
        Self {
            history: 100,
            decay: 0.9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(Settings::from_toml_str("").unwrap(), Settings::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            workers = 8

            [rate_limit]
            policy = "wait"

            [breaker.operations.sheet_read]
            cooldown_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.rate_limit.policy, RateLimitPolicy::Wait);
        assert_eq!(settings.rate_limit.actor_limit, 60);
        assert_eq!(
            settings.breaker.operations["sheet_read"].cooldown_ms,
            Some(5000)
        );
        assert_eq!(settings.breaker.failure_threshold, 5);
    }

    #[test]
    fn zero_workers_rejected() {
        let err = Settings::from_toml_str("workers = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn out_of_range_failure_rate_rejected() {
        assert!(Settings::from_toml_str("[failure]\nfatal_failure_rate = 1.5").is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(Settings::from_toml_str("wokers = 2").is_err());
    }
}
