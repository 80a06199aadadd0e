use std::io::Write;

use secrecy::ExposeSecret;
use workq::config::{Config, RateLimitPolicy, Settings};

// Both cases share one test so they do not race on the process environment.
#[test]
fn config_from_env() {
    unsafe {
        std::env::remove_var("DATABASE_URL");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("DATABASE_URL", "sqlite://workq-test.db");
        std::env::remove_var("WORKQ_CONFIG");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.database_url.expose_secret(), "sqlite://workq-test.db");
    assert!(!config.log_level.is_empty());
    assert_eq!(config.settings().unwrap(), Settings::default());

    unsafe {
        std::env::remove_var("DATABASE_URL");
    }
}

#[test]
fn settings_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
workers = 2

[rate_limit]
actor_limit = 10
policy = "wait"

[retry]
strategy = "linear"
max_retries = 5

[breaker.operations.sheets]
failure_threshold = 2
"#
    )
    .unwrap();

    let settings = Settings::load(file.path()).unwrap();
    assert_eq!(settings.workers, 2);
    assert_eq!(settings.rate_limit.actor_limit, 10);
    assert_eq!(settings.rate_limit.policy, RateLimitPolicy::Wait);
    assert_eq!(settings.retry.max_retries, 5);
    assert_eq!(
        settings.breaker.operations["sheets"].failure_threshold,
        Some(2)
    );
    assert_eq!(settings.scheduler, Default::default());
}

#[test]
fn settings_load_reports_path_on_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[retry]\njitter = 3.0\n").unwrap();

    let err = Settings::load(file.path()).unwrap_err().to_string();
    assert!(err.contains("jitter"), "{err}");
    assert!(err.contains(&file.path().display().to_string()), "{err}");
}

#[test]
fn missing_settings_file_is_config_error() {
    let err = Settings::load("/nonexistent/workq.toml").unwrap_err();
    assert!(matches!(err, workq::error::Error::Config(_)));
}
