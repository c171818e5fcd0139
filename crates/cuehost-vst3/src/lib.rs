//! VST3 plugin host implementation.
//!
//! Loads `.vst3` modules through their `GetPluginFactory` export and wraps
//! the component/controller pair so it implements the common `Plugin`
//! trait. All COM plumbing (vtables, host-side objects, memory streams,
//! parameter change queues) is hand-written against the VST3 ABI.

pub mod com;
mod component_handler;
mod host_application;
pub mod loader;
mod parameter_changes;
mod stream;
mod wrapper;

pub use loader::{ClassInfo, Vst3Module};
pub use wrapper::{Vst3Plugin, probe};

use cuehost_plugin::{PluginDescriptor, PluginError};

/// Instantiate the plugin a descriptor from `probe` points at.
pub fn load(descriptor: &PluginDescriptor) -> Result<Vst3Plugin, PluginError> {
    Vst3Plugin::load(descriptor)
}
