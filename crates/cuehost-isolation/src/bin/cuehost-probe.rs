//! Plugin probe process
//!
//! Loads one plugin binary just far enough to describe it and prints a
//! single JSON `ScanResult` line. Running each probe in its own process
//! keeps a crashing binary from taking the scan down with it.
//!
//! Usage: cuehost-probe <path> --format <vst2|vst3|au>

use clap::Parser;
use cuehost_isolation::ipc::ScanResult;
use cuehost_isolation::stdio::{protocol_stdout, write_line};
use cuehost_plugin::PluginFormat;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "cuehost-probe", about = "Describe one plugin binary")]
struct Args {
    /// Plugin binary or bundle
    path: PathBuf,

    /// Plugin format to probe as
    #[arg(long)]
    format: PluginFormat,
}

fn main() -> ExitCode {
    cuehost_isolation::install_crash_hook();
    cuehost_isolation::init_subprocess_logging();

    let args = Args::parse();
    let mut out = match protocol_stdout() {
        Ok(out) => out,
        Err(e) => {
            eprintln!("Failed to take protocol stdout: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (result, code) = match cuehost_isolation::native::probe(&args.path, args.format) {
        Ok(plugin) => (ScanResult::Success { plugin }, ExitCode::SUCCESS),
        Err(e) => (
            ScanResult::Error {
                message: e.to_string(),
            },
            ExitCode::FAILURE,
        ),
    };
    if let Err(e) = write_line(out.as_mut(), &result) {
        eprintln!("Failed to write probe result: {e}");
        return ExitCode::FAILURE;
    }
    code
}
