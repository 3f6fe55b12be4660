//! Deferral demo driver.
//!
//! Submits a batch of delayed jobs, some of which fail a few times before
//! succeeding and some of which are cancelled, then reports what happened.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use clap::Parser;
use miette::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deferral::{JobHandle, JobOptions, Scheduler, SchedulerConfig};

#[derive(Parser)]
#[command(name = "deferral-demo")]
#[command(about = "Drive the in-process delayed task scheduler", long_about = None)]
struct Cli {
    /// Number of jobs to submit
    #[arg(long, env = "DEFERRAL_JOBS", default_value = "20")]
    jobs: usize,

    /// Base delay in milliseconds
    #[arg(long, env = "DEFERRAL_DELAY_MS", default_value = "100")]
    delay_ms: u64,

    /// Extra delay added per job index, in milliseconds
    #[arg(long, env = "DEFERRAL_SPREAD_MS", default_value = "25")]
    spread_ms: u64,

    /// Every Nth job fails before succeeding (0 disables)
    #[arg(long, env = "DEFERRAL_FLAKY_EVERY", default_value = "4")]
    flaky_every: usize,

    /// How many attempts a flaky job fails before succeeding
    #[arg(long, env = "DEFERRAL_FLAKY_FAILURES", default_value = "1")]
    flaky_failures: u32,

    /// Every Nth job is cancelled right after submission (0 disables)
    #[arg(long, env = "DEFERRAL_CANCEL_EVERY", default_value = "0")]
    cancel_every: usize,

    /// Retries granted to each job
    #[arg(long, env = "DEFERRAL_MAX_RETRIES", default_value = "2")]
    max_retries: u32,

    /// Cap on concurrently running callbacks (unbounded when unset)
    #[arg(long, env = "DEFERRAL_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Node identifier embedded in job handles
    #[arg(long, env = "DEFERRAL_NODE_ID", default_value = "100")]
    node_id: u16,

    /// How long to wait for jobs before reporting, in milliseconds
    #[arg(long, env = "DEFERRAL_WAIT_MS", default_value = "3000")]
    wait_ms: u64,
}

impl Cli {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_retries: self.max_retries,
            max_concurrency: self.max_concurrency,
            node_id: self.node_id,
            ..SchedulerConfig::default()
        }
    }

    /// Delay for job `index`: the base delay plus one spread step per index.
    fn job_delay(&self, index: usize) -> Duration {
        let spread = self.spread_ms.saturating_mul(index as u64);
        Duration::from_millis(self.delay_ms.saturating_add(spread))
    }

    fn is_nth(every: usize, index: usize) -> bool {
        every > 0 && (index + 1) % every == 0
    }
}

/// Counters shared by every demo callback.
#[derive(Default)]
struct Tally {
    attempts: AtomicUsize,
    successes: AtomicUsize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "deferral=info,deferral_demo=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.scheduler_config();
    let scheduler = Scheduler::start(config.clone()).map_err(|e| miette::miette!("{}", e))?;
    info!(config = ?config, "scheduler ready");

    let tally = Arc::new(Tally::default());
    let mut cancelled: Vec<JobHandle> = Vec::new();

    for index in 0..cli.jobs {
        let delay = cli.job_delay(index);
        let failures_left = if Cli::is_nth(cli.flaky_every, index) {
            cli.flaky_failures
        } else {
            0
        };

        let handle = scheduler
            .submit_with(delay, JobOptions::new(job_callback(index, failures_left, &tally)))
            .await
            .map_err(|e| miette::miette!("failed to submit job {}: {}", index, e))?;

        if Cli::is_nth(cli.cancel_every, index) {
            scheduler
                .cancel(handle)
                .await
                .map_err(|e| miette::miette!("failed to cancel job {}: {}", index, e))?;
            cancelled.push(handle);
        }
    }
    info!(
        submitted = cli.jobs,
        cancelled = cancelled.len(),
        "jobs submitted"
    );

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(cli.wait_ms)) => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, reporting early");
        }
    }

    let snapshot = scheduler
        .snapshot()
        .await
        .map_err(|e| miette::miette!("failed to read scheduler state: {}", e))?;
    info!(
        attempts = tally.attempts.load(Ordering::SeqCst),
        successes = tally.successes.load(Ordering::SeqCst),
        pending = snapshot.pending,
        tracked = snapshot.tracked,
        "run finished"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).map_err(|e| miette::miette!("{}", e))?
    );

    scheduler.shutdown().await;
    Ok(())
}

/// Callback for job `index` that fails its first `failures` attempts.
fn job_callback(
    index: usize,
    failures: u32,
    tally: &Arc<Tally>,
) -> impl Fn() -> bool + Send + Sync + 'static {
    let tally = Arc::clone(tally);
    let attempt = AtomicU32::new(0);

    move || {
        tally.attempts.fetch_add(1, Ordering::SeqCst);
        let this_attempt = attempt.fetch_add(1, Ordering::SeqCst);
        if this_attempt < failures {
            info!(index, attempt = this_attempt, "job reporting failure");
            return false;
        }
        tally.successes.fetch_add(1, Ordering::SeqCst);
        info!(index, attempt = this_attempt, "job succeeded");
        true
    }
}
