//! Scan-time fault boundary: probe each candidate binary in its own
//! `cuehost-probe` process.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use cuehost_plugin::{PluginDescriptor, PluginFormat};

use crate::IsolationError;
use crate::ipc::ScanResult;

/// Exit code the subprocess panic hooks use
pub const CRASH_EXIT_CODE: i32 = 2;

/// Runs `cuehost-probe <path> --format <format>` per candidate.
#[derive(Debug, Clone)]
pub struct ProbeRunner {
    exe: PathBuf,
    timeout: Duration,
}

impl ProbeRunner {
    pub fn new(exe: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            exe: exe.into(),
            timeout,
        }
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    /// Probe one binary. Crashes, hangs and garbage output are all errors.
    pub fn probe(&self, path: &Path, format: PluginFormat) -> Result<PluginDescriptor, IsolationError> {
        let mut child = Command::new(&self.exe)
            .arg(path)
            .arg("--format")
            .arg(format.tag())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| IsolationError::Spawn {
                exe: self.exe.clone(),
                source,
            })?;

        // The result is a single line, far below the pipe buffer, so the
        // child never blocks on a full pipe while we poll.
        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if start.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(IsolationError::Timeout(self.timeout));
                }
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    let _ = child.kill();
                    return Err(IsolationError::Crashed(format!("Failed to wait for probe: {e}")));
                }
            }
        };

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            let _ = stdout.read_to_string(&mut output);
        }
        interpret(status, &output)
    }
}

fn interpret(status: ExitStatus, output: &str) -> Result<PluginDescriptor, IsolationError> {
    if let Some(reason) = crash_reason(status) {
        return Err(IsolationError::Crashed(reason));
    }

    let result = output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| IsolationError::Protocol("probe printed nothing".to_string()))
        .and_then(|line| {
            serde_json::from_str::<ScanResult>(line)
                .map_err(|e| IsolationError::Protocol(format!("Malformed probe output: {e}")))
        });

    match (status.success(), result) {
        (true, Ok(ScanResult::Success { plugin })) => Ok(plugin),
        (_, Ok(ScanResult::Error { message })) => Err(IsolationError::ProbeFailed(message)),
        (false, _) => Err(IsolationError::ProbeFailed(format!("probe exited with {status}"))),
        (true, Err(e)) => Err(e),
    }
}

#[cfg(unix)]
fn crash_reason(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signal) = status.signal() {
        return Some(format!("killed by signal {signal}"));
    }
    (status.code() == Some(CRASH_EXIT_CODE)).then(|| "plugin panicked".to_string())
}

#[cfg(not(unix))]
fn crash_reason(status: ExitStatus) -> Option<String> {
    (status.code() == Some(CRASH_EXIT_CODE)).then(|| "plugin panicked".to_string())
}
