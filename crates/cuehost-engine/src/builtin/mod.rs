//! Built-in reference plugins.
//!
//! Implemented directly in Rust against the `Plugin` trait, just like the
//! format adapters, but loaded in-process without FFI. They are
//! deterministic, which makes them the reference instruments for render and
//! isolation checks.

pub mod fault;
pub mod gain;
pub mod sine;

use cuehost_plugin::{Plugin, PluginDescriptor};

/// Descriptors of every builtin plugin
pub fn descriptors() -> Vec<PluginDescriptor> {
    vec![
        gain::GainProcessor::describe(),
        sine::SineOscillator::describe(),
        fault::FaultInjector::describe(),
    ]
}

/// Create a builtin plugin by descriptor id (`builtin:gain`) or bare name.
///
/// Returns `None` if the name doesn't match any builtin.
pub fn create(id: &str) -> Option<Box<dyn Plugin>> {
    match id.strip_prefix("builtin:").unwrap_or(id) {
        "gain" => Some(Box::new(gain::GainProcessor::default())),
        "sine" => Some(Box::new(sine::SineOscillator::default())),
        "fault" => Some(Box::new(fault::FaultInjector::default())),
        _ => None,
    }
}
