//! Plugin abstraction layer.
//!
//! This crate defines the common `Plugin` trait that every plugin format
//! (VST2, VST3, AU, builtin processors, and the subprocess proxy that wraps
//! any of them) implements. The session and engine crates only ever see
//! `Box<dyn Plugin>`, so a format is chosen once, by the descriptor's tag,
//! when the instance is created.

mod descriptor;

pub use descriptor::{ParameterInfo, PluginDescriptor, PluginFormat};

use cuehost_core::{AudioConfig, Frames, Sample};
use serde::{Deserialize, Serialize};

/// Audio buffer for processing
///
/// The outer slices borrow for `'a`, the channel data for `'b`, so a block
/// can be built over slice arrays that live shorter than the samples.
pub struct AudioBuffer<'a, 'b> {
    pub inputs: &'a [&'b [Sample]],
    pub outputs: &'a mut [&'b mut [Sample]],
    pub frames: Frames,
}

impl AudioBuffer<'_, '_> {
    /// Zero every output channel.
    pub fn clear_outputs(&mut self) {
        for channel in self.outputs.iter_mut() {
            channel.fill(0.0);
        }
    }
}

/// Parameter change delivered to `process` at a block boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamChange {
    pub id: u32,
    pub value: f32,
    pub sample_offset: u32,
}

/// Fixed-capacity buffer of parameter changes for one processing block.
///
/// `push` never grows the allocation, so a buffer created off the audio
/// thread can be refilled on it every block.
pub struct EventBuffer {
    events: Vec<ParamChange>,
}

impl EventBuffer {
    /// Default number of changes a block can carry.
    pub const DEFAULT_CAPACITY: usize = 256;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    /// Append a change. Returns `false` (dropping the change) when full.
    pub fn push(&mut self, change: ParamChange) -> bool {
        if self.events.len() == self.events.capacity() {
            return false;
        }
        self.events.push(change);
        true
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn is_full(&self) -> bool {
        self.events.len() == self.events.capacity()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ParamChange> {
        self.events.iter()
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Something the plugin did on its own, outside any host call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PluginNotification {
    /// Parameter moved by automation or a gesture in the plugin's editor.
    ParameterChanged { id: u32, value: f32 },
    /// User closed the plugin's editor window.
    EditorClosed,
    /// The fault boundary lost the plugin (worker process died).
    Crashed { message: String },
}

/// Main plugin trait that all plugin formats implement
///
/// Calls arrive from one thread at a time; the host serializes access per
/// instance. `process` may be called on the real-time stream thread, so
/// implementations must not allocate or block there.
pub trait Plugin: Send {
    /// Identity and capabilities
    fn descriptor(&self) -> &PluginDescriptor;

    /// Apply the audio configuration. Called once, before anything else.
    fn initialize(&mut self, config: &AudioConfig) -> Result<(), PluginError>;

    /// Prepare for processing at the configured block size.
    fn activate(&mut self) -> Result<(), PluginError>;

    /// Release real-time resources, keeping parameter state.
    fn suspend(&mut self) -> Result<(), PluginError>;

    /// Process one block of at most the configured block size.
    fn process(&mut self, audio: &mut AudioBuffer, events: &EventBuffer)
    -> Result<(), PluginError>;

    /// Get all parameters
    fn parameters(&self) -> Vec<ParameterInfo>;

    /// Set a parameter and return the value the plugin actually applied.
    ///
    /// The host clamps to the declared range before calling; a plugin may
    /// quantize further.
    fn set_parameter(&mut self, id: u32, value: f32) -> Result<f32, PluginError>;

    /// Get a parameter value
    fn get_parameter(&mut self, id: u32) -> Result<f32, PluginError>;

    /// Serialize internal state into an opaque, plugin-defined blob.
    fn save_state(&mut self) -> Result<Vec<u8>, PluginError>;

    /// Restore a blob produced by `save_state`.
    fn load_state(&mut self, data: &[u8]) -> Result<(), PluginError>;

    /// Show or hide the plugin's editor window.
    fn set_editor_visible(&mut self, _visible: bool) -> Result<(), PluginError> {
        Err(PluginError::Unsupported(format!(
            "{} has no editor available in this host",
            self.descriptor().name
        )))
    }

    /// Channel carrying plugin-originated notifications, if the format has any.
    ///
    /// The receiver is cloned out once at load time so it stays reachable
    /// while the plugin itself is owned by a stream thread.
    fn notifications(&self) -> Option<crossbeam_channel::Receiver<PluginNotification>> {
        None
    }

    /// Deactivate and release the native plugin.
    fn shutdown(&mut self);
}

/// Plugin-related errors
///
/// Serializable so the worker subprocess can hand them back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message")]
pub enum PluginError {
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Plugin processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Plugin format error: {0}")]
    FormatError(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The native code crashed or the fault boundary lost it. The instance
    /// is unusable afterwards.
    #[error("Plugin fault: {0}")]
    Fault(String),
}

impl PluginError {
    pub const fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_buffer_never_grows() {
        let mut buffer = EventBuffer::with_capacity(2);
        let change = ParamChange {
            id: 0,
            value: 0.5,
            sample_offset: 0,
        };
        assert!(buffer.push(change));
        assert!(buffer.push(change));
        assert!(buffer.is_full());
        assert!(!buffer.push(change));
        assert_eq!(buffer.len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.push(change));
    }

    #[test]
    fn test_plugin_error_wire_shape() {
        let error = PluginError::Fault("segfault".to_string());
        let json = serde_json::to_string(&error).unwrap();
        assert_eq!(json, r#"{"kind":"Fault","message":"segfault"}"#);
        let back: PluginError = serde_json::from_str(&json).unwrap();
        assert!(back.is_fault());
    }

    #[test]
    fn test_clear_outputs() {
        let mut left = [1.0_f32; 4];
        let mut right = [1.0_f32; 4];
        let mut outputs: [&mut [f32]; 2] = [&mut left, &mut right];
        let mut audio = AudioBuffer {
            inputs: &[],
            outputs: &mut outputs,
            frames: 4,
        };
        audio.clear_outputs();
        assert_eq!(left, [0.0; 4]);
        assert_eq!(right, [0.0; 4]);
    }
}
