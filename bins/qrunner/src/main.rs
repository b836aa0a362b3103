mod aggregator;
mod config;
mod descriptor;
mod executor;
mod failure;
mod formatter;
mod loader;
mod scheduler;
mod unit;


use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use executor::Executor;
use qrunner_common::config::{FailureDisplay, MissingDescriptor, RunnerConfig};
use qrunner_common::types::RunRecord;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Grace period for unit threads that ignore cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "qrunner")]
#[command(about = "Runs graded test groups under a global time budget and writes partial-credit scores", long_about = None)]
struct Cli {
    /// Global time budget in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Print the details of every failure
    #[arg(long, conflicts_with = "first_failure")]
    all_failures: bool,

    /// Print the details of the first failure only (default)
    #[arg(long)]
    first_failure: bool,

    /// Directory searched for group manifests before the shared resolver
    #[arg(long = "classpath", value_name = "DIR")]
    classpath: Vec<PathBuf>,

    /// Worker pool size; omit for an unbounded pool
    #[arg(long)]
    workers: Option<usize>,

    /// Run the units of each group in parallel too
    #[arg(long)]
    parallel_units: bool,

    /// What to do with a unit that has no score descriptor
    #[arg(long, value_enum)]
    missing_descriptor: Option<MissingDescriptorArg>,

    /// JSON configuration file (defaults to config/qrunner.json when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Also write the run report and score summary as JSON
    #[arg(long, value_name = "FILE")]
    json_report: Option<PathBuf>,

    /// File the per-unit score lines are written to
    #[arg(value_name = "SCORES_FILE")]
    scores: PathBuf,

    /// Dotted names of the groups to run
    #[arg(value_name = "GROUP", required = true)]
    groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MissingDescriptorArg {
    Abort,
    Zero,
}

impl From<MissingDescriptorArg> for MissingDescriptor {
    fn from(arg: MissingDescriptorArg) -> Self {
        match arg {
            MissingDescriptorArg::Abort => MissingDescriptor::Abort,
            MissingDescriptorArg::Zero => MissingDescriptor::Zero,
        }
    }
}

impl Cli {
    /// Command-line flags win over every other configuration source
    fn apply(&self, config: &mut RunnerConfig) {
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if self.all_failures {
            config.failure_display = FailureDisplay::All;
        } else if self.first_failure {
            config.failure_display = FailureDisplay::First;
        }
        if !self.classpath.is_empty() {
            config.classpath = self.classpath.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = (workers > 0).then_some(workers);
        }
        if self.parallel_units {
            config.parallel_units = true;
        }
        if let Some(missing) = self.missing_descriptor {
            config.missing_descriptor = missing.into();
        }
    }
}

fn write_json_report(path: &Path, record: &RunRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record).context("Failed to serialize run report")?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries failure details and the summary
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("qrunner booting...");

    let mut config = config::load_layered(cli.config.as_deref())?;
    cli.apply(&mut config);

    info!(
        timeout_secs = config.timeout_secs,
        workers = ?config.workers,
        isolated_prefix = %config.isolated_prefix,
        classpath = ?config.classpath,
        groups = cli.groups.len(),
        "Configuration loaded"
    );

    let scores = match File::create(&cli.scores) {
        Ok(file) => file,
        Err(e) => {
            error!(path = %cli.scores.display(), error = %e, "Cannot create output file");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    let executor = Executor::new(config);
    let result = runtime.block_on(executor.execute(
        &cli.groups,
        Box::new(io::stdout()),
        Box::new(BufWriter::new(scores)),
    ));

    info!("Cleaning up...");
    let shutdown = Instant::now();
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    if shutdown.elapsed() >= SHUTDOWN_GRACE {
        warn!("Cleaning up harder...");
    }

    let record = match result {
        Ok(record) => record,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    if let Some(path) = &cli.json_report {
        write_json_report(path, &record)?;
    }

    if !record.not_found.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
