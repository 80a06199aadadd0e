//! Work functions.
//!
//! The orchestrator knows nothing about the work itself: each job kind
//! maps to a [`WorkHandler`] that processes one item and reports a
//! classified outcome. Handlers must tolerate being called more than once
//! for the same item.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::failure::ClassifiedError;
use crate::model::{JobContext, WorkItem};

/// What a work function produced for an item.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutput {
    /// Item processed; the value is stored as the item's result.
    Completed(serde_json::Value),
    /// The handler decided the item needs no processing.
    Skipped { reason: String },
}

#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Downstream operation this handler calls. Circuit breakers are keyed
    /// by this name.
    fn operation(&self) -> &str;

    async fn execute(
        &self,
        item: &WorkItem,
        job: &JobContext,
    ) -> std::result::Result<WorkOutput, ClassifiedError>;
}

/// Job kind to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn WorkHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn WorkHandler>) -> Result<()> {
        let kind = kind.into();
        if self.handlers.contains_key(&kind) {
            return Err(Error::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn WorkHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Load every `*.toml` command handler definition in `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read handler dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: HandlerFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad handler config {}: {e}", path.display()))
                })?;
                let def = file.handler;
                let kind = def.kind.clone();
                registry.register(kind, Arc::new(CommandHandler::new(def)))?;
            }
        }

        Ok(registry)
    }
}

#[derive(Debug, Deserialize)]
struct HandlerFile {
    handler: CommandDefinition,
}

/// A handler backed by an external executable.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandDefinition {
    /// Job kind this handler serves.
    pub kind: String,
    /// Circuit breaker key. Defaults to the kind.
    #[serde(default)]
    pub operation: Option<String>,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill the process and report a transient failure after this long.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Runs one process per item. The item payload is written to stdin as JSON
/// and the exit status is classified using sysexits codes:
///
/// | exit | outcome |
/// |---|---|
/// | 0 | completed, stdout is the result |
/// | 10 | skipped |
/// | 65 | validation |
/// | 66 | permanent, job-fatal (input unreadable) |
/// | 69 | network |
/// | 71, 74 | system |
/// | 75 | transient |
/// | 77 | authentication |
/// | other | permanent |
pub struct CommandHandler {
    def: CommandDefinition,
    operation: String,
}

pub const EXIT_SKIPPED: i32 = 10;

impl CommandHandler {
    pub fn new(def: CommandDefinition) -> Self {
        let operation = def.operation.clone().unwrap_or_else(|| def.kind.clone());
        Self { def, operation }
    }

    fn resolved_command(&self) -> std::io::Result<PathBuf> {
        // Relative paths are taken from the process working directory.
        if self.def.command.is_relative() && self.def.command.components().count() > 1 {
            Ok(std::env::current_dir()?.join(&self.def.command))
        } else {
            Ok(self.def.command.clone())
        }
    }
}

#[async_trait]
impl WorkHandler for CommandHandler {
    fn operation(&self) -> &str {
        &self.operation
    }

    async fn execute(
        &self,
        item: &WorkItem,
        job: &JobContext,
    ) -> std::result::Result<WorkOutput, ClassifiedError> {
        let command = self
            .resolved_command()
            .map_err(|e| ClassifiedError::system(format!("cannot resolve command: {e}")))?;
        debug!(
            job_id = %job.id,
            item = item.index,
            command = %command.display(),
            "running handler command"
        );

        let mut child = Command::new(&command)
            .args(&self.def.args)
            .env("WORKQ_JOB_ID", job.id.to_string())
            .env("WORKQ_JOB_KIND", &job.kind)
            .env("WORKQ_ITEM_INDEX", item.index.to_string())
            .env("WORKQ_TENANT_ID", &job.tenant_id)
            .env("WORKQ_ACTOR_ID", &job.actor_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    ClassifiedError::permanent(format!("cannot run {}: {e}", command.display()))
                }
                _ => ClassifiedError::system(format!("spawn failed: {e}")),
            })?;

        let input = serde_json::to_vec(&item.payload)
            .map_err(|e| ClassifiedError::validation(format!("payload not serializable: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            // The command may exit without reading its input.
            let _ = stdin.write_all(&input).await;
        }

        let output = match self.def.timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), child.wait_with_output())
                .await
                .map_err(|_| ClassifiedError::transient(format!("timed out after {ms}ms")))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| ClassifiedError::system(format!("wait failed: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let Some(code) = output.status.code() else {
            return Err(ClassifiedError::system("terminated by signal"));
        };
        if code == 0 {
            return Ok(WorkOutput::Completed(parse_stdout(&output.stdout)));
        }
        if code == EXIT_SKIPPED {
            let reason = if stderr.is_empty() {
                "skipped by handler".to_string()
            } else {
                stderr
            };
            return Ok(WorkOutput::Skipped { reason });
        }
        Err(classify_exit(code, stderr))
    }
}

fn parse_stdout(stdout: &[u8]) -> serde_json::Value {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}

/// Map a non-zero sysexits code to a classified failure.
pub fn classify_exit(code: i32, stderr: String) -> ClassifiedError {
    let message = if stderr.is_empty() {
        format!("exited with status {code}")
    } else {
        stderr
    };
    let error = match code {
        75 => ClassifiedError::transient(message),
        69 => ClassifiedError::network(message),
        71 | 74 => ClassifiedError::system(message),
        65 => ClassifiedError::validation(message),
        77 => ClassifiedError::authentication(message),
        66 => ClassifiedError::permanent(message).fatal(),
        _ => ClassifiedError::permanent(message),
    };
    error.with_code(format!("exit_{code}"))
}
