//! Plugin worker process
//!
//! Hosts a single plugin on behalf of `cuehost`, so that a crashing plugin
//! takes down only this process. Control messages arrive as JSON lines on
//! stdin, audio blocks through the shared memory region named by `--shm`.
//!
//! Usage: cuehost-worker --descriptor <json> --shm <name>

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "cuehost-worker", about = "Host one plugin instance for cuehost")]
struct Args {
    /// JSON-encoded plugin descriptor
    #[arg(long)]
    descriptor: String,

    /// Shared memory region created by the host
    #[arg(long)]
    shm: String,
}

fn main() -> ExitCode {
    // Notify the host of crashes through the exit code
    cuehost_isolation::install_crash_hook();
    cuehost_isolation::init_subprocess_logging();

    let args = Args::parse();
    match cuehost_isolation::worker::serve(&args.descriptor, &args.shm) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
