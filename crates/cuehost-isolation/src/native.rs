//! Format dispatch for native plugin binaries.

use std::path::Path;

use cuehost_plugin::{Plugin, PluginDescriptor, PluginError, PluginFormat};

/// Inspect one binary with the adapter for `format`.
pub fn probe(path: &Path, format: PluginFormat) -> Result<PluginDescriptor, PluginError> {
    match format {
        PluginFormat::Vst2 => cuehost_vst2::probe(path),
        PluginFormat::Vst3 => cuehost_vst3::probe(path),
        PluginFormat::Au => cuehost_au::probe(path),
        PluginFormat::Builtin => Err(PluginError::Unsupported(
            "builtin plugins are not probed from disk".to_string(),
        )),
    }
}

/// Instantiate a native plugin in this process.
pub fn load(descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>, PluginError> {
    tracing::info!("Loading {} plugin from {}", descriptor.format, descriptor.path.display());
    match descriptor.format {
        PluginFormat::Vst2 => Ok(Box::new(cuehost_vst2::load(descriptor)?)),
        PluginFormat::Vst3 => Ok(Box::new(cuehost_vst3::load(descriptor)?)),
        PluginFormat::Au => match cuehost_au::load(descriptor)? {},
        PluginFormat::Builtin => Err(PluginError::Unsupported(format!(
            "{} is not a native plugin",
            descriptor.id
        ))),
    }
}

/// Instantiate any plugin: builtins from the engine, the rest natively.
pub fn instantiate(descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>, PluginError> {
    if descriptor.format == PluginFormat::Builtin {
        return cuehost_engine::builtin::create(&descriptor.id).ok_or_else(|| {
            PluginError::InitializationFailed(format!("Unknown builtin plugin {}", descriptor.id))
        });
    }
    load(descriptor)
}
