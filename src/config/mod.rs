//! Typed configuration.
//!
//! Process configuration comes from environment variables and is loaded
//! once at startup, failing fast when required vars are missing. Tuning
//! knobs for the orchestrator live in a TOML [`Settings`] file.

mod settings;

pub use settings::{
    BreakerOverride, BreakerSettings, EtaSettings, FailureSettings, RateLimitPolicy,
    RateLimitSettings, RetentionSettings, RetrySettings, SchedulerSettings, Settings,
    StrategyKind,
};

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    /// SQLite connection string, e.g. `sqlite://workq.db`.
    pub database_url: SecretString,
    /// Optional path to a TOML settings file.
    pub settings_path: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            settings_path: std::env::var_os("WORKQ_CONFIG").map(PathBuf::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Settings from `WORKQ_CONFIG`, or the defaults when unset.
    pub fn settings(&self) -> Result<Settings> {
        match &self.settings_path {
            Some(path) => Settings::load(path),
            None => Ok(Settings::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
