//! Plugin creation policy: where each plugin runs.

use std::path::PathBuf;
use std::time::Duration;

use cuehost_engine::builtin;
use cuehost_isolation::{IsolatedPlugin, native};
use cuehost_plugin::{Plugin, PluginDescriptor, PluginError, PluginFormat};
use serde::{Deserialize, Serialize};

use crate::instance::PluginFactory;

/// Where native plugin code executes
///
/// Deserialized from its name string so the same spelling works in JSON,
/// RON and on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum IsolationMode {
    /// One worker process per instance
    #[default]
    Subprocess,
    /// Inside the host process; a crash takes the host down
    InProcess,
}

impl std::str::FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subprocess" => Ok(Self::Subprocess),
            "in-process" => Ok(Self::InProcess),
            other => Err(format!(
                "unknown isolation mode '{other}' (expected subprocess or in-process)"
            )),
        }
    }
}

impl TryFrom<String> for IsolationMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The host's factory. Builtins are trusted and always run in-process.
pub struct HostFactory {
    mode: IsolationMode,
    worker_exe: PathBuf,
    request_timeout: Duration,
}

impl HostFactory {
    pub fn new(
        mode: IsolationMode,
        worker_exe: impl Into<PathBuf>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            mode,
            worker_exe: worker_exe.into(),
            request_timeout,
        }
    }

    pub const fn mode(&self) -> IsolationMode {
        self.mode
    }
}

impl PluginFactory for HostFactory {
    fn create(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>, PluginError> {
        if descriptor.format == PluginFormat::Builtin {
            return BuiltinFactory.create(descriptor);
        }
        match self.mode {
            IsolationMode::Subprocess => {
                let plugin =
                    IsolatedPlugin::spawn(&self.worker_exe, descriptor, self.request_timeout)?;
                tracing::info!(
                    "Spawned worker {} for {}",
                    plugin.worker_pid(),
                    descriptor.id
                );
                Ok(Box::new(plugin))
            }
            IsolationMode::InProcess => native::load(descriptor),
        }
    }
}

/// Creates builtin plugins only.
pub struct BuiltinFactory;

impl PluginFactory for BuiltinFactory {
    fn create(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>, PluginError> {
        builtin::create(&descriptor.id).ok_or_else(|| {
            PluginError::InitializationFailed(format!("Unknown builtin plugin {}", descriptor.id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_mode_names() {
        assert_eq!("in-process".parse::<IsolationMode>(), Ok(IsolationMode::InProcess));
        assert_eq!("subprocess".parse::<IsolationMode>(), Ok(IsolationMode::Subprocess));
        assert!("threads".parse::<IsolationMode>().is_err());
        assert_eq!(
            serde_json::to_string(&IsolationMode::InProcess).unwrap(),
            "\"in-process\""
        );
    }

    #[test]
    fn test_builtins_never_spawn_workers() {
        let factory = HostFactory::new(
            IsolationMode::Subprocess,
            "/nonexistent/cuehost-worker",
            Duration::from_secs(1),
        );
        let plugin = factory.create(&builtin::sine::SineOscillator::describe()).unwrap();
        assert_eq!(plugin.descriptor().id, "builtin:sine");
    }

    #[test]
    fn test_native_load_failures() {
        let descriptor =
            PluginDescriptor::new(PluginFormat::Vst3, "00ff", "/nonexistent/Gone.vst3", "Gone");
        let subprocess = HostFactory::new(
            IsolationMode::Subprocess,
            "/nonexistent/cuehost-worker",
            Duration::from_secs(1),
        );
        assert!(matches!(
            subprocess.create(&descriptor),
            Err(PluginError::InitializationFailed(_))
        ));

        let in_process = HostFactory::new(IsolationMode::InProcess, "", Duration::from_secs(1));
        assert!(in_process.create(&descriptor).is_err());
    }
}
