use std::path::PathBuf;
use std::time::Duration;

use cuehost_plugin::PluginError;

/// Failures of the subprocess boundary itself, as opposed to errors the
/// plugin reported.
#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("Failed to spawn {exe}: {source}", exe = exe.display())]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Plugin worker exited")]
    WorkerExited,

    #[error("No answer within {0:?}")]
    Timeout(Duration),

    /// The probe or worker died from a signal or its panic hook.
    #[error("Crashed: {0}")]
    Crashed(String),

    /// The probe ran to completion and rejected the binary.
    #[error("Probe failed: {0}")]
    ProbeFailed(String),
}

impl From<IsolationError> for PluginError {
    fn from(error: IsolationError) -> Self {
        match error {
            IsolationError::Spawn { .. } | IsolationError::SharedMemory(_) => {
                Self::InitializationFailed(error.to_string())
            }
            IsolationError::ProbeFailed(_) => Self::FormatError(error.to_string()),
            IsolationError::Protocol(_)
            | IsolationError::WorkerExited
            | IsolationError::Timeout(_)
            | IsolationError::Crashed(_) => Self::Fault(error.to_string()),
        }
    }
}
