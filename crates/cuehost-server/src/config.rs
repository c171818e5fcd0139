//! Host configuration.
//!
//! Every field has a default, so a RON file only needs the fields it
//! changes:
//!
//! ```ron
//! (
//!     workers: 4,
//!     isolation: "in-process",
//!     scan_paths: ["/opt/plugins"],
//! )
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use cuehost_core::{AudioConfig, Frames, SampleRate};
use cuehost_isolation::{PROBE_EXE, WORKER_EXE, sibling_executable};
use cuehost_session::IsolationMode;
use serde::{Deserialize, Serialize};

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Threads in the command worker pool
    pub workers: usize,
    pub isolation: IsolationMode,
    /// Sample rate for `loadPlugin` requests that omit one
    pub sample_rate: SampleRate,
    /// Block size for `loadPlugin` requests that omit one
    pub block_size: Frames,
    /// Offer the builtin reference plugins
    pub builtins: bool,
    /// `cuehost-worker` location; next to the running executable if unset
    pub worker_exe: Option<PathBuf>,
    /// `cuehost-probe` location; next to the running executable if unset
    pub probe_exe: Option<PathBuf>,
    /// Per-request deadline for isolated plugins before the worker is killed
    pub request_timeout_ms: u64,
    /// Per-binary deadline while scanning
    pub probe_timeout_ms: u64,
    /// How often the event pump polls instances
    pub event_poll_ms: u64,
    /// Directories `scanPlugins` walks when the request names none
    pub scan_paths: Vec<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        let defaults = AudioConfig::default();
        Self {
            workers: std::thread::available_parallelism()
                .map_or(4, std::num::NonZeroUsize::get)
                .clamp(2, 8),
            isolation: IsolationMode::default(),
            sample_rate: defaults.sample_rate,
            block_size: defaults.block_size,
            builtins: true,
            worker_exe: None,
            probe_exe: None,
            request_timeout_ms: 10_000,
            probe_timeout_ms: 15_000,
            event_poll_ms: 10,
            scan_paths: default_scan_paths(),
        }
    }
}

impl HostConfig {
    /// Load a RON file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = ron::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        AudioConfig::new(self.sample_rate, self.block_size, 0, 0)
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn worker_exe(&self) -> PathBuf {
        resolve(self.worker_exe.as_ref(), WORKER_EXE)
    }

    pub fn probe_exe(&self) -> PathBuf {
        resolve(self.probe_exe.as_ref(), PROBE_EXE)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms.max(1))
    }
}

/// Configured path, else a sibling of the running executable, else `$PATH`.
fn resolve(configured: Option<&PathBuf>, name: &str) -> PathBuf {
    configured
        .cloned()
        .or_else(|| sibling_executable(name))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Standard plugin directories for this OS.
pub fn default_scan_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let home = dirs::home_dir();

    #[cfg(target_os = "linux")]
    {
        if let Some(home) = &home {
            paths.push(home.join(".vst3"));
            paths.push(home.join(".vst"));
        }
        paths.push(PathBuf::from("/usr/lib/vst3"));
        paths.push(PathBuf::from("/usr/local/lib/vst3"));
        paths.push(PathBuf::from("/usr/lib/vst"));
        paths.push(PathBuf::from("/usr/local/lib/vst"));
    }

    #[cfg(target_os = "macos")]
    {
        for dir in ["VST3", "VST", "Components"] {
            if let Some(home) = &home {
                paths.push(home.join("Library/Audio/Plug-Ins").join(dir));
            }
            paths.push(PathBuf::from("/Library/Audio/Plug-Ins").join(dir));
        }
    }

    #[cfg(target_os = "windows")]
    {
        let _ = &home;
        paths.push(PathBuf::from("C:\\Program Files\\Common Files\\VST3"));
        paths.push(PathBuf::from("C:\\Program Files\\VSTPlugins"));
        paths.push(PathBuf::from("C:\\Program Files\\Steinberg\\VSTPlugins"));
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    let _ = home;

    paths
}
