//! cuehost - audio plugin host process
//!
//! Speaks line-delimited JSON on stdin/stdout. Diagnostics go to stderr.

use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cuehost_isolation::stdio::protocol_stdout;
use cuehost_server::{HostConfig, Server};
use cuehost_session::IsolationMode;

const DEFAULT_FILTER: &str = "cuehost=info,warn";

#[derive(Parser, Debug)]
#[command(name = "cuehost", version)]
#[command(about = "Host audio plugins for a controller process over stdio", long_about = None)]
struct Args {
    /// RON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Command worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Where plugin code runs: subprocess or in-process
    #[arg(long)]
    isolation: Option<IsolationMode>,

    /// Log filter, e.g. `cuehost=debug` (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log.as_deref());

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(directives: Option<&str>) {
    let filter = match directives {
        Some(directives) => EnvFilter::try_new(directives).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HostConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(isolation) = args.isolation {
        config.isolation = isolation;
    }
    config.validate()?;

    tracing::info!("Starting cuehost {}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Config: {config:?}");

    // In-process plugins may print; keep fd 1 for protocol lines only.
    let output = protocol_stdout().context("Failed to take over stdout")?;
    Server::new(config).run(BufReader::new(io::stdin()), output)
}
