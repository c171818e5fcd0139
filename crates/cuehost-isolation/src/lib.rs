//! Fault boundary between the host and native plugin code.
//!
//! Native plugins run in a `cuehost-worker` subprocess per instance and are
//! probed in a `cuehost-probe` subprocess per binary, so a crashing plugin
//! takes down only its own process. Control traffic is line-delimited JSON
//! over the child's stdio; audio goes through POSIX shared memory.

mod error;
pub mod ipc;
pub mod isolated;
pub mod native;
pub mod probe;
pub mod shm;
pub mod stdio;
pub mod worker;

pub use error::IsolationError;
pub use isolated::IsolatedPlugin;
pub use probe::{CRASH_EXIT_CODE, ProbeRunner};

use std::path::PathBuf;

/// Worker executable name
pub const WORKER_EXE: &str = "cuehost-worker";

/// Probe executable name
pub const PROBE_EXE: &str = "cuehost-probe";

/// Locate a helper executable installed next to the running one.
///
/// Test binaries live one level deeper (`target/<profile>/deps`), so the
/// parent directory is tried as well.
pub fn sibling_executable(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let file_name = format!("{name}{}", std::env::consts::EXE_SUFFIX);
    exe.ancestors()
        .skip(1)
        .take(2)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
}

/// Install the subprocess panic hook: report and exit with
/// [`CRASH_EXIT_CODE`] so the host can tell a crash from a clean failure.
pub fn install_crash_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PLUGIN CRASHED: {panic_info}");
        std::process::exit(CRASH_EXIT_CODE);
    }));
}

/// Subprocess logging: stderr only, `RUST_LOG` or `warn`.
pub fn init_subprocess_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
