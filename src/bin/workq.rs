//! workq CLI: operator interface to the job orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use workq::config::Config;
use workq::db::Db;
use workq::dead_letter::{DeadLetterFilter, DeadLetterId};
use workq::engine::Orchestrator;
use workq::event::JobUpdate;
use workq::handler::HandlerRegistry;
use workq::model::failure::FailureClass;
use workq::model::{JobId, JobState, NewJob, Priority};
use workq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};

#[derive(Parser)]
#[command(name = "workq", about = "Job orchestration with retries, rate limits and dead letters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator until Ctrl-C
    Serve {
        /// Directory containing handler TOML configs
        #[arg(long, default_value = "handlers")]
        handlers: PathBuf,
        /// Worker count (overrides settings)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Submit a job and follow it until it finishes
    Submit {
        /// Job kind (selects the handler)
        kind: String,
        /// JSON file with an array of item payloads
        #[arg(long)]
        items: PathBuf,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long, default_value = "default")]
        tenant: String,
        #[arg(long, default_value = "operator")]
        actor: String,
        #[arg(long)]
        idempotency_key: Option<String>,
        /// Fail the job if it is still running after this many seconds
        #[arg(long)]
        deadline_secs: Option<i64>,
        #[arg(long, default_value = "handlers")]
        handlers: PathBuf,
    },
    /// Job inspection
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Dead-letter operations
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// List jobs
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<JobState>,
    },
    /// Show a job
    Show {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Show a job's event log
    Events {
        /// Job ID (full UUID or prefix)
        id: String,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List dead-letter entries
    List {
        #[arg(long)]
        job: Option<JobId>,
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        class: Option<FailureClass>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Show an entry with its attempt history
    Show { id: DeadLetterId },
    /// Delete an entry
    Remove { id: DeadLetterId },
    /// Delete entries past the retention period
    Purge,
    /// Resubmit an entry as a new job and follow it
    Retry {
        id: DeadLetterId,
        #[arg(long, default_value = "handlers")]
        handlers: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { handlers, workers } => cmd_serve(&config, &handlers, workers).await,
        Command::Submit {
            kind,
            items,
            priority,
            tenant,
            actor,
            idempotency_key,
            deadline_secs,
            handlers,
        } => {
            let payloads = read_items(&items)?;
            let mut new = NewJob::new(kind, tenant, actor)
                .priority(priority)
                .items(payloads);
            if let Some(key) = idempotency_key {
                new = new.idempotency_key(key);
            }
            if let Some(secs) = deadline_secs {
                new = new.deadline(Utc::now() + chrono::Duration::seconds(secs));
            }
            cmd_submit(&config, &handlers, new).await
        }
        Command::Job { action } => {
            let orchestrator = build(&config, HandlerRegistry::empty(), None).await?;
            match action {
                JobAction::List { state } => cmd_job_list(&orchestrator, state).await,
                JobAction::Show { id } => cmd_job_show(&orchestrator, &id).await,
                JobAction::Events { id } => cmd_job_events(&orchestrator, &id).await,
            }
        }
        Command::DeadLetter { action } => match action {
            DeadLetterAction::Retry { id, handlers } => {
                cmd_dead_letter_retry(&config, &handlers, id).await
            }
            action => {
                let orchestrator = build(&config, HandlerRegistry::empty(), None).await?;
                cmd_dead_letter(&orchestrator, action).await
            }
        },
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workq".to_string(),
        log_level: config.log_level.clone(),
    })?)
}

async fn build(
    config: &Config,
    handlers: HandlerRegistry,
    workers: Option<usize>,
) -> anyhow::Result<Orchestrator> {
    let mut settings = config.settings()?;
    if let Some(workers) = workers {
        settings.workers = workers;
    }
    let db = Db::connect(config.database_url.expose_secret()).await?;
    Ok(Orchestrator::builder()
        .settings(settings)
        .db(Arc::new(db))
        .handlers(handlers)
        .build()
        .await?)
}

async fn cmd_serve(config: &Config, handlers: &Path, workers: Option<usize>) -> anyhow::Result<()> {
    let _guard = telemetry(config)?;
    let registry = HandlerRegistry::load_from_dir(handlers)?;
    let orchestrator = build(config, registry, workers).await?;

    let report = orchestrator.recover().await?;
    println!(
        "Recovered {} job(s), {} requeued.",
        report.recovered, report.requeued
    );
    orchestrator.start();

    tokio::signal::ctrl_c().await?;
    orchestrator.shutdown().await;
    Ok(())
}

fn read_items(path: &Path) -> anyhow::Result<Vec<serde_json::Value>> {
    let raw = std::fs::read_to_string(path)?;
    match serde_json::from_str(&raw)? {
        serde_json::Value::Array(items) => Ok(items),
        single => Ok(vec![single]),
    }
}

async fn cmd_submit(config: &Config, handlers: &Path, new: NewJob) -> anyhow::Result<()> {
    let _guard = telemetry(config)?;
    let registry = HandlerRegistry::load_from_dir(handlers)?;
    let orchestrator = build(config, registry, None).await?;

    let result = orchestrator.submit(new).await?;
    let id = result.job_id();
    if result.is_created() {
        println!("Created: {id}");
    } else {
        println!("Existing: {id} (idempotency key already used)");
    }
    follow(&orchestrator, id).await
}

async fn cmd_dead_letter_retry(
    config: &Config,
    handlers: &Path,
    id: DeadLetterId,
) -> anyhow::Result<()> {
    let _guard = telemetry(config)?;
    let registry = HandlerRegistry::load_from_dir(handlers)?;
    let orchestrator = build(config, registry, None).await?;

    let job_id = orchestrator.retry_dead_letter(id).await?;
    println!("Resubmitted {id} as job {job_id}");
    follow(&orchestrator, job_id).await
}

/// Run the pool, print updates for `id` until it finishes, then stop.
async fn follow(orchestrator: &Orchestrator, id: JobId) -> anyhow::Result<()> {
    let mut updates = orchestrator.subscribe(id).await?;
    orchestrator.start();
    while let Some(update) = updates.recv().await {
        print_update(&update);
    }
    orchestrator.shutdown().await;

    let status = orchestrator.get_job_status(id).await?;
    println!("---");
    println!("State:      {}", status.job.state);
    if let Some(reason) = status.job.failure_reason {
        println!("Reason:     {reason}");
    }
    Ok(())
}

fn print_update(update: &JobUpdate) {
    match update {
        JobUpdate::StateChanged {
            prior_state,
            new_state,
            reason,
            ..
        } => println!("{prior_state} -> {new_state}  ({reason})"),
        JobUpdate::Progress { progress, .. } => {
            let pct = progress
                .percent_complete
                .map_or_else(|| "-".to_string(), |p| format!("{p:.0}%"));
            let eta = progress
                .eta_ms
                .map_or_else(|| "-".to_string(), |ms| format!("{:.1}s", ms as f64 / 1000.0));
            println!(
                "{pct:>5}  done {} failed {} skipped {} canceled {} pending {}  eta {eta}{}",
                progress.items_completed,
                progress.items_failed,
                progress.items_skipped,
                progress.items_canceled,
                progress.items_pending,
                if progress.rate_limited { "  [rate limited]" } else { "" }
            );
        }
    }
}

/// Accept a full job id or a unique prefix.
async fn resolve_job_id(orchestrator: &Orchestrator, id_str: &str) -> anyhow::Result<JobId> {
    if id_str.len() >= 36 {
        return Ok(id_str.parse()?);
    }
    let jobs = orchestrator.list_jobs(None).await?;
    let matches: Vec<_> = jobs
        .iter()
        .filter(|job| job.id.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no job matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} jobs match prefix '{id_str}', be more specific"),
    }
}

async fn cmd_job_list(orchestrator: &Orchestrator, state: Option<JobState>) -> anyhow::Result<()> {
    let jobs = orchestrator.list_jobs(state).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<14}  {:<10}  {:<6}  {:>9}  SUBMITTED",
        "ID", "KIND", "STATE", "PRI", "DONE/ALL"
    );
    println!("{}", "-".repeat(72));
    for job in &jobs {
        let short_id = &job.id.to_string()[..8];
        println!(
            "{:<8}  {:<14}  {:<10}  {:<6}  {:>9}  {}",
            short_id,
            job.kind,
            job.state.to_string(),
            job.priority.to_string(),
            format!("{}/{}", job.counters.settled(), job.counters.total),
            job.submitted_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_job_show(orchestrator: &Orchestrator, id: &str) -> anyhow::Result<()> {
    let id = resolve_job_id(orchestrator, id).await?;
    let status = orchestrator.get_job_status(id).await?;
    let job = &status.job;

    println!("ID:         {}", job.id);
    println!("Kind:       {}", job.kind);
    println!("State:      {}", job.state);
    println!("Priority:   {} (effective {})", job.priority, job.effective_priority);
    println!("Tenant:     {}", job.tenant_id);
    println!("Actor:      {}", job.actor_id);
    println!(
        "Idem. Key:  {}",
        job.idempotency_key.as_deref().unwrap_or("-")
    );
    println!(
        "Items:      {} total, {} completed, {} failed, {} skipped, {} canceled, {} pending",
        job.counters.total,
        job.counters.completed,
        job.counters.failed,
        job.counters.skipped,
        job.counters.canceled,
        job.counters.pending
    );
    if let Some(pct) = status.progress.percent_complete {
        println!("Progress:   {pct:.1}%");
    }
    println!("Attempts:   {}", job.attempts);
    println!("Submitted:  {}", job.submitted_at);
    println!("Updated:    {}", job.updated_at);
    if let Some(deadline) = job.deadline {
        println!("Deadline:   {deadline}");
    }
    if let Some(finished) = job.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(reason) = job.failure_reason {
        println!("Reason:     {reason}");
    }
    if let Some(ref err) = job.last_error {
        println!("Last Error: {err}");
    }
    if let Some(origin) = job.origin {
        println!("Origin:     dead letter {origin}");
    }
    Ok(())
}

async fn cmd_job_events(orchestrator: &Orchestrator, id: &str) -> anyhow::Result<()> {
    let id = resolve_job_id(orchestrator, id).await?;
    for event in orchestrator.get_job_events(id).await? {
        println!(
            "{:>6}  {}  {:<18}  {}",
            event.seq,
            event.timestamp.format("%H:%M:%S%.3f"),
            event.kind.name(),
            serde_json::to_string(&event.kind)?
        );
    }
    Ok(())
}

async fn cmd_dead_letter(orchestrator: &Orchestrator, action: DeadLetterAction) -> anyhow::Result<()> {
    match action {
        DeadLetterAction::List {
            job,
            tenant,
            class,
            limit,
        } => {
            let filter = DeadLetterFilter {
                job_id: job,
                tenant_id: tenant,
                class,
                limit: Some(limit),
            };
            let entries = orchestrator.list_dead_letters(&filter).await?;
            if entries.is_empty() {
                println!("No dead letters.");
                return Ok(());
            }
            println!(
                "{:<36}  {:<8}  {:>4}  {:<14}  {:>3}  ENQUEUED",
                "ID", "JOB", "ITEM", "CLASS", "ATT"
            );
            println!("{}", "-".repeat(96));
            for entry in &entries {
                println!(
                    "{:<36}  {:<8}  {:>4}  {:<14}  {:>3}  {}",
                    entry.id,
                    &entry.job.id.to_string()[..8],
                    entry.item.index,
                    entry.class.to_string(),
                    entry.attempts(),
                    entry.enqueued_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} entr(ies)", entries.len());
        }
        DeadLetterAction::Show { id } => {
            let entry = orchestrator.get_dead_letter(id).await?;
            println!("ID:         {}", entry.id);
            println!("Job:        {} ({})", entry.job.id, entry.job.kind);
            println!("Tenant:     {}", entry.job.tenant_id);
            println!("Item:       {}", entry.item.index);
            println!("Class:      {}", entry.class);
            println!("Error:      {}", entry.error.message);
            if let Some(ref code) = entry.error.code {
                println!("Code:       {code}");
            }
            println!(
                "Payload:    {}",
                serde_json::to_string_pretty(&entry.item.payload)?
            );
            println!("Enqueued:   {}", entry.enqueued_at);
            println!("--- attempts");
            for record in entry.history() {
                println!(
                    "#{:<3} {}  {:>6}ms  {}",
                    record.attempt,
                    record.started_at.format("%H:%M:%S%.3f"),
                    record.duration_ms,
                    serde_json::to_string(&record.outcome)?
                );
            }
        }
        DeadLetterAction::Remove { id } => {
            orchestrator.remove_dead_letter(id).await?;
            println!("Removed {id}");
        }
        DeadLetterAction::Purge => {
            let purged = orchestrator.purge_expired_dead_letters().await?;
            println!("Purged {purged} expired entr(ies)");
        }
        DeadLetterAction::Retry { id, .. } => {
            anyhow::bail!("retrying {id} needs a handler registry")
        }
    }
    Ok(())
}
