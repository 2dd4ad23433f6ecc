use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tokio::time::{Instant, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tempo_core::executor::{
    CallerRunsRejectedBatches, DropRejectedBatches, RejectedBatchHandler, RetryRejectedBatches,
};
use tempo_core::impls::InMemoryJobStore;
use tempo_core::ports::JobStore;
use tempo_core::{JobContext, JobError, JobHandler, JobScheduler, NewJob, SchedulerConfig};

/// Run a demo workload through the scheduler against an in-memory store.
#[derive(Debug, Parser)]
#[command(name = "tempo", version)]
struct Args {
    /// JSON scheduler configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of independent `greet` jobs.
    #[arg(long, default_value_t = 20)]
    jobs: usize,

    /// Number of `flaky` jobs; each fails twice before succeeding.
    #[arg(long, default_value_t = 3)]
    flaky: usize,

    /// Length of the exclusive `ledger` chain on one account.
    #[arg(long, default_value_t = 5)]
    ledger: u32,

    /// Repeat descriptor for the `tick` job.
    #[arg(long, default_value = "R3/PT1S")]
    tick: String,

    /// What to do with batches the worker pool rejects.
    #[arg(long, value_enum, default_value_t = RejectedPolicy::CallerRuns)]
    rejected: RejectedPolicy,

    /// Stop after this many seconds even if work remains.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RejectedPolicy {
    Drop,
    Retry,
    CallerRuns,
}

impl RejectedPolicy {
    fn handler(self) -> Arc<dyn RejectedBatchHandler> {
        match self {
            RejectedPolicy::Drop => Arc::new(DropRejectedBatches),
            RejectedPolicy::Retry => {
                Arc::new(RetryRejectedBatches::new(Duration::from_millis(100), 10))
            }
            RejectedPolicy::CallerRuns => Arc::new(CallerRunsRejectedBatches),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GreetPayload {
    name: String,
}

struct GreetHandler;

#[async_trait]
impl JobHandler for GreetHandler {
    fn handler_type(&self) -> &str {
        "greet"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        let payload: GreetPayload = ctx.payload()?;
        info!(job_id = %ctx.job_id(), name = %payload.name, "hello");
        Ok(())
    }
}

/// Fails the first `failures_per_job` attempts of every job.
struct FlakyHandler {
    failures_per_job: u32,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    fn handler_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        if ctx.job().failures < self.failures_per_job {
            return Err(JobError::failed(format!(
                "simulated outage (attempt {})",
                ctx.job().failures + 1
            )));
        }
        info!(job_id = %ctx.job_id(), failures = ctx.job().failures, "flaky job recovered");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LedgerPayload {
    account: String,
    entry: u32,
    remaining: u32,
}

/// Posts one entry, then queues the next one on the same account.
struct LedgerHandler;

#[async_trait]
impl JobHandler for LedgerHandler {
    fn handler_type(&self) -> &str {
        "ledger"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        let payload: LedgerPayload = ctx.payload()?;
        info!(account = %payload.account, entry = payload.entry, "posting ledger entry");

        if payload.remaining > 0 {
            let next = ctx.schedule(ledger_job(
                &payload.account,
                payload.entry + 1,
                payload.remaining - 1,
            ));
            info!(job_id = %next, "queued next ledger entry");
        }
        Ok(())
    }
}

fn ledger_job(account: &str, entry: u32, remaining: u32) -> NewJob {
    NewJob::new("ledger")
        .exclusive_on(format!("account:{account}"))
        .with_payload(serde_json::json!({
            "account": account,
            "entry": entry,
            "remaining": remaining,
        }))
}

struct TickHandler;

#[async_trait]
impl JobHandler for TickHandler {
    fn handler_type(&self) -> &str {
        "tick"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        info!(repeat = ?ctx.job().repeat, "tick");
        Ok(())
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SchedulerConfig> {
    let config = match path {
        Some(path) => SchedulerConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SchedulerConfig::default().with_wait_time(Duration::from_millis(500)),
    };
    // started explicitly below, after the jobs are in place
    Ok(config.with_auto_activate(false))
}

async fn outstanding(store: &InMemoryJobStore) -> anyhow::Result<usize> {
    let counts = store.counts().await?;
    Ok(counts.due + counts.waiting + counts.leased)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let store = Arc::new(InMemoryJobStore::new());
    let scheduler = JobScheduler::builder(store.clone())
        .config(config)
        .rejected_batch_handler(args.rejected.handler())
        .register(GreetHandler)?
        .register(FlakyHandler { failures_per_job: 2 })?
        .register(LedgerHandler)?
        .register(TickHandler)?
        .build()?;

    info!(lock_owner = %scheduler.lock_owner(), "scheduler built");
    scheduler.start();

    for n in 0..args.jobs {
        scheduler
            .schedule(NewJob::new("greet").with_payload(serde_json::json!({ "name": format!("job-{n}") })))
            .await?;
    }
    for _ in 0..args.flaky {
        scheduler.schedule(NewJob::new("flaky").with_retries(3)).await?;
    }
    if args.ledger > 0 {
        scheduler.schedule(ledger_job("acme", 1, args.ledger - 1)).await?;
    }
    scheduler.schedule(NewJob::new("tick").repeating(args.tick.clone())).await?;

    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    loop {
        if outstanding(&store).await? == 0 {
            info!("all jobs finished");
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!(timeout_secs = args.timeout_secs, "timed out with work remaining");
                break;
            }
            _ = sleep(Duration::from_millis(200)) => {}
        }
    }

    scheduler.shutdown().await;

    let stats = scheduler.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    for job in scheduler.failed_jobs().await? {
        println!(
            "failed: id={} handler={} last_failure={:?}",
            job.id,
            job.handler_type,
            job.last_failure.map(|failure| failure.message)
        );
    }
    Ok(())
}
