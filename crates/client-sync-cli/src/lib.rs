//! `client-sync-sim`: drive a [`client_sync::SyncCoordinator`] against an
//! in-process simulated server and print a JSON report of every flush.

#![forbid(unsafe_code)]

pub mod sim;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use client_sync_core::Config;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Sync(#[from] client_sync_core::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(
    name = "client-sync-sim",
    version,
    about = "Replay a telemetry workload through the sync core and report flushes"
)]
pub struct Cli {
    /// Number of events to track
    #[arg(long, default_value_t = 50)]
    pub events: usize,

    /// Delay between consecutive events
    #[arg(long, default_value_t = 200)]
    pub event_interval_ms: u64,

    /// Flush window; overrides the configured value
    #[arg(long)]
    pub flush_interval_ms: Option<u64>,

    /// Make the server reject every Kth batch (0 = never)
    #[arg(long, default_value_t = 0)]
    pub fail_every: u64,

    /// Simulated network latency per request
    #[arg(long, default_value_t = 0)]
    pub latency_ms: u64,

    /// Notifications preloaded on the server
    #[arg(long, default_value_t = 5)]
    pub notifications: usize,

    /// JSON5 configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    fn scenario(&self) -> CliResult<sim::Scenario> {
        if self.events == 0 {
            return Err(CliError::InvalidArgument("--events must be at least 1".into()));
        }
        Ok(sim::Scenario {
            events: self.events,
            event_interval: Duration::from_millis(self.event_interval_ms),
            fail_every: self.fail_every,
            latency: Duration::from_millis(self.latency_ms),
            notifications: self.notifications,
        })
    }

    fn load_config(&self) -> CliResult<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::from_env(),
        };
        if let Some(ms) = self.flush_interval_ms {
            if ms == 0 {
                return Err(CliError::InvalidArgument(
                    "--flush-interval-ms must be positive".into(),
                ));
            }
            config.flush_interval = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

/// Parse arguments, run the scenario and return the process exit code.
#[must_use]
pub fn run() -> i32 {
    let cli = Cli::parse();
    match execute(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn execute(cli: &Cli) -> CliResult<()> {
    let config = cli.load_config()?;
    init_logging(&config);
    let scenario = cli.scenario()?;
    tracing::debug!(?config, "configuration loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(sim::run(&config, &scenario))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
