//! # workq
//!
//! Job orchestration core: rate-limited admission, priority scheduling
//! with aging, retries behind per-operation circuit breakers, a dead-letter
//! store, and a job lifecycle with progress broadcast to subscribers.
//!
//! State is persisted in SQLite so unfinished jobs survive a restart.
//! Observability goes through `tracing` and OpenTelemetry.

pub mod breaker;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod event;
pub mod handler;
pub mod limiter;
pub mod model;
pub mod retry;
pub mod telemetry;
