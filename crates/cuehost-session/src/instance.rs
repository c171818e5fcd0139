//! Plugin instance lifecycle.
//!
//! A [`PluginInstance`] owns one plugin and walks it through
//! `Unloaded → Loading → Loaded → Active ⇄ Suspended`, with `Error`
//! reachable from anywhere and `Unloading → Unloaded` as final cleanup.
//!
//! Every native call goes through [`PluginInstance::call`], which catches
//! panics and turns them (and `PluginError::Fault`) into the `Error` state
//! plus a crash event. While an instance streams, its plugin lives on the
//! stream thread; calls that need it pause the stream and resume it after.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use cuehost_comms::{StreamEvent, StreamStats};
use cuehost_core::{AudioConfig, Frames, Sample};
use cuehost_engine::{RenderError, StreamError, StreamHandle, render_offline, validate_inputs};
use cuehost_plugin::{ParameterInfo, Plugin, PluginDescriptor, PluginError, PluginNotification};
use serde::Serialize;

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceState {
    Unloaded,
    Loading,
    Loaded,
    Active,
    Suspended,
    Error,
    Unloading,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Error => "error",
            Self::Unloading => "unloading",
        })
    }
}

/// States in which the native plugin may be used
const LIVE: &[InstanceState] = &[
    InstanceState::Loaded,
    InstanceState::Active,
    InstanceState::Suspended,
];

/// Something that happened to an instance outside any request.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Crash { handle: u64, message: String },
    EditorClosed { handle: u64 },
    ParameterChanged { handle: u64, param_id: u32, value: f32 },
}

impl HostEvent {
    pub const fn handle(&self) -> u64 {
        match self {
            Self::Crash { handle, .. }
            | Self::EditorClosed { handle }
            | Self::ParameterChanged { handle, .. } => *handle,
        }
    }
}

/// Instance operation failures. Each variant is one protocol error code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InstanceError {
    #[error("Unknown handle {0}")]
    UnknownHandle(u64),

    #[error("Plugin load failed: {0}")]
    LoadFailed(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: InstanceState,
    },

    #[error("Instance {0} is not streaming")]
    NotStreaming(u64),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Plugin fault: {0}")]
    Fault(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The plugin refused an operation without crashing.
    #[error("Plugin error: {0}")]
    Plugin(String),
}

impl From<PluginError> for InstanceError {
    fn from(error: PluginError) -> Self {
        match error {
            PluginError::Fault(m) => Self::Fault(m),
            PluginError::InvalidParameter(m) => Self::InvalidParameter(m),
            PluginError::Unsupported(m) => Self::Unsupported(m),
            other => Self::Plugin(other.to_string()),
        }
    }
}

impl From<RenderError> for InstanceError {
    fn from(error: RenderError) -> Self {
        match error {
            RenderError::FormatMismatch(m) => Self::FormatMismatch(m),
            RenderError::Plugin(e) => e.into(),
        }
    }
}

impl From<StreamError> for InstanceError {
    fn from(error: StreamError) -> Self {
        match error {
            StreamError::FormatMismatch(m) => Self::FormatMismatch(m),
            StreamError::CommandQueueFull => Self::InvalidParameter(error.to_string()),
            StreamError::Panicked => Self::Fault(error.to_string()),
            StreamError::Spawn(e) => Self::Plugin(format!("Failed to start stream: {e}")),
        }
    }
}

/// Creates the plugin object for a descriptor.
///
/// The factory decides where the plugin runs (in-process or behind the
/// worker-process boundary).
pub trait PluginFactory: Send + Sync {
    fn create(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>, PluginError>;
}

/// One row of an instance's parameter table
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterState {
    #[serde(flatten)]
    pub info: ParameterInfo,
    pub value: f32,
}

/// Snapshot returned by `getInstanceInfo`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub handle: u64,
    pub descriptor_id: String,
    pub state: InstanceState,
    pub config: AudioConfig,
    pub editor_visible: bool,
    pub streaming: bool,
    pub history: Vec<InstanceState>,
}

/// Where the native plugin currently lives
enum NativeSlot {
    Idle(Box<dyn Plugin>),
    /// Owned by the stream thread
    Streaming(StreamHandle),
    /// Released, or lost to a failure
    Retired,
}

/// A handle-identified, stateful wrapper around one loaded plugin.
pub struct PluginInstance {
    handle: u64,
    descriptor: Arc<PluginDescriptor>,
    state: InstanceState,
    config: AudioConfig,
    parameters: Vec<ParameterState>,
    native: NativeSlot,
    notifications: Option<Receiver<PluginNotification>>,
    editor_visible: bool,
    history: Vec<InstanceState>,
    fault: Option<String>,
    events: Sender<HostEvent>,
}

impl PluginInstance {
    /// Instantiate and initialize a plugin.
    ///
    /// Any failure here is `LoadFailed`; the instance is dropped and the
    /// handle is never handed out.
    pub fn load(
        handle: u64,
        descriptor: Arc<PluginDescriptor>,
        config: AudioConfig,
        factory: &dyn PluginFactory,
        events: Sender<HostEvent>,
    ) -> Result<Self, InstanceError> {
        let mut instance = Self {
            handle,
            descriptor,
            state: InstanceState::Unloaded,
            config,
            parameters: Vec::new(),
            native: NativeSlot::Retired,
            notifications: None,
            editor_visible: false,
            history: vec![InstanceState::Unloaded],
            fault: None,
            events,
        };
        instance.transition(InstanceState::Loading);

        match instance.instantiate(factory) {
            Ok(()) => {
                instance.transition(InstanceState::Loaded);
                tracing::info!(
                    "Loaded {} as handle {handle} ({} parameters)",
                    instance.descriptor.id,
                    instance.parameters.len()
                );
                Ok(instance)
            }
            Err(message) => {
                tracing::warn!("Failed to load {}: {message}", instance.descriptor.id);
                instance.transition(InstanceState::Error);
                instance.release();
                Err(InstanceError::LoadFailed(message))
            }
        }
    }

    fn instantiate(&mut self, factory: &dyn PluginFactory) -> Result<(), String> {
        self.config.validate().map_err(|e| e.to_string())?;
        let mut plugin = factory.create(&self.descriptor).map_err(|e| e.to_string())?;
        self.notifications = plugin.notifications();

        let config = self.config;
        let table = panic::catch_unwind(AssertUnwindSafe(|| {
            plugin.initialize(&config)?;
            read_parameters(plugin.as_mut())
        }));
        self.native = NativeSlot::Idle(plugin);
        match table {
            Ok(Ok(table)) => {
                self.parameters = table;
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("plugin panicked: {}", panic_message(&*panic))),
        }
    }

    pub const fn handle(&self) -> u64 {
        self.handle
    }

    pub const fn state(&self) -> InstanceState {
        self.state
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub const fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub const fn is_streaming(&self) -> bool {
        matches!(self.native, NativeSlot::Streaming(_))
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            handle: self.handle,
            descriptor_id: self.descriptor.id.clone(),
            state: self.state,
            config: self.config,
            editor_visible: self.editor_visible,
            streaming: self.is_streaming(),
            history: self.history.clone(),
        }
    }

    /// `Loaded | Suspended → Active`
    pub fn activate(&mut self) -> Result<InstanceState, InstanceError> {
        self.require("activate", LIVE)?;
        if self.state != InstanceState::Active {
            self.call(|plugin| plugin.activate())?;
            self.transition(InstanceState::Active);
        }
        Ok(self.state)
    }

    /// `Active → Suspended`, stopping any stream first.
    pub fn suspend(&mut self) -> Result<InstanceState, InstanceError> {
        self.require("suspend", &[InstanceState::Active, InstanceState::Suspended])?;
        if self.state == InstanceState::Active {
            self.stop_stream()?;
            self.call(|plugin| plugin.suspend())?;
            self.transition(InstanceState::Suspended);
        }
        Ok(self.state)
    }

    pub fn parameters(&self) -> Result<Vec<ParameterState>, InstanceError> {
        self.require("getParameters", LIVE)?;
        Ok(self.parameters.clone())
    }

    /// Clamp, apply and store a parameter value. Returns the applied value.
    pub fn set_parameter(&mut self, id: u32, value: f32) -> Result<f32, InstanceError> {
        self.require("setParameter", LIVE)?;
        if !value.is_finite() {
            return Err(InstanceError::InvalidParameter(format!(
                "value {value} for parameter {id} is not finite"
            )));
        }
        let index = self.parameter_index(id)?;
        let clamped = self.parameters[index].info.clamp(value);

        let applied = if let NativeSlot::Streaming(stream) = &mut self.native {
            // Applied by the stream thread at the next block boundary.
            stream.set_parameter(id, clamped)?;
            clamped
        } else {
            self.call(|plugin| plugin.set_parameter(id, clamped))?
        };
        self.parameters[index].value = applied;
        Ok(applied)
    }

    pub fn get_parameter(&mut self, id: u32) -> Result<f32, InstanceError> {
        self.require("getParameter", LIVE)?;
        let index = self.parameter_index(id)?;
        if !self.is_streaming() {
            let value = self.call(|plugin| plugin.get_parameter(id))?;
            self.parameters[index].value = value;
        }
        Ok(self.parameters[index].value)
    }

    pub fn save_preset(&mut self) -> Result<Vec<u8>, InstanceError> {
        self.require("savePreset", LIVE)?;
        self.call(|plugin| plugin.save_state())
    }

    /// Restore a preset blob, then re-read every parameter value.
    pub fn load_preset(&mut self, data: &[u8]) -> Result<(), InstanceError> {
        self.require("loadPreset", LIVE)?;
        let table = self.call(|plugin| {
            plugin.load_state(data)?;
            read_parameters(plugin)
        })?;
        self.parameters = table;
        Ok(())
    }

    /// Render `frame_count` frames synchronously. Requires `Active`.
    pub fn render_offline(
        &mut self,
        inputs: &[Vec<Sample>],
        frame_count: Frames,
    ) -> Result<Vec<Vec<Sample>>, InstanceError> {
        self.require("renderOffline", &[InstanceState::Active])?;
        let config = self.config;
        validate_inputs(&config, inputs, frame_count)?;
        self.call(|plugin| render_offline(plugin, &config, inputs, frame_count))
    }

    /// Move the plugin onto its own real-time stream thread.
    pub fn start_stream(&mut self) -> Result<(), InstanceError> {
        self.require("startStream", &[InstanceState::Active])?;
        if self.is_streaming() {
            return Ok(());
        }
        self.resume_stream()
    }

    /// Take the plugin back from the stream thread. No-op if not streaming.
    pub fn stop_stream(&mut self) -> Result<(), InstanceError> {
        self.require("stopStream", LIVE)?;
        if self.pause_stream()? {
            tracing::info!("Stream for handle {} stopped", self.handle);
        }
        Ok(())
    }

    /// Queue input audio for the stream. Returns the frames accepted.
    pub fn write_stream(&mut self, channels: &[Vec<Sample>]) -> Result<Frames, InstanceError> {
        self.check_stream("writeStream")?;
        let stream = self.stream()?;
        Ok(stream.write(channels)?)
    }

    /// Drain up to `max_frames` frames of processed output.
    pub fn read_stream(&mut self, max_frames: Frames) -> Result<Vec<Vec<Sample>>, InstanceError> {
        self.check_stream("readStream")?;
        let stream = self.stream()?;
        Ok(stream.read(max_frames))
    }

    pub fn stream_status(&mut self) -> Result<StreamStats, InstanceError> {
        self.check_stream("streamStatus")?;
        let stream = self.stream()?;
        Ok(stream.stats())
    }

    pub fn show_editor(&mut self) -> Result<(), InstanceError> {
        self.set_editor_visible("showEditor", true)
    }

    pub fn hide_editor(&mut self) -> Result<(), InstanceError> {
        self.set_editor_visible("hideEditor", false)
    }

    fn set_editor_visible(
        &mut self,
        operation: &'static str,
        visible: bool,
    ) -> Result<(), InstanceError> {
        self.require(operation, LIVE)?;
        if !self.descriptor.has_editor {
            return Err(InstanceError::Unsupported(format!(
                "{} has no editor",
                self.descriptor.name
            )));
        }
        self.call(|plugin| plugin.set_editor_visible(visible))?;
        self.editor_visible = visible;
        Ok(())
    }

    /// Release the plugin from any state. Always ends in `Unloaded`.
    pub fn unload(&mut self) {
        if self.state == InstanceState::Unloaded {
            return;
        }
        self.transition(InstanceState::Unloading);
        self.release();
        self.notifications = None;
        self.transition(InstanceState::Unloaded);
        tracing::info!("Unloaded handle {}", self.handle);
    }

    /// Drain plugin notifications and stream events, raising host events.
    ///
    /// Called periodically by the event pump.
    pub fn pump(&mut self) {
        if matches!(
            self.state,
            InstanceState::Unloaded | InstanceState::Unloading
        ) {
            return;
        }
        if let NativeSlot::Streaming(stream) = &mut self.native
            && let Some(StreamEvent::Faulted { panicked }) = stream.poll_event()
        {
            self.stream_faulted(panicked);
        }

        let Some(notifications) = self.notifications.clone() else {
            return;
        };
        while let Ok(notification) = notifications.try_recv() {
            match notification {
                PluginNotification::ParameterChanged { id, value } => {
                    if let Some(row) = self.parameters.iter_mut().find(|p| p.info.id == id) {
                        row.value = value;
                    }
                    self.emit(HostEvent::ParameterChanged {
                        handle: self.handle,
                        param_id: id,
                        value,
                    });
                }
                PluginNotification::EditorClosed => {
                    self.editor_visible = false;
                    self.emit(HostEvent::EditorClosed {
                        handle: self.handle,
                    });
                }
                PluginNotification::Crashed { message } => {
                    self.fail(message);
                }
            }
        }
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[InstanceState],
    ) -> Result<(), InstanceError> {
        if self.state == InstanceState::Error {
            return Err(InstanceError::Fault(format!(
                "handle {} is in the error state: {}",
                self.handle,
                self.fault.as_deref().unwrap_or("unknown fault")
            )));
        }
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(InstanceError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn parameter_index(&self, id: u32) -> Result<usize, InstanceError> {
        self.parameters
            .iter()
            .position(|p| p.info.id == id)
            .ok_or_else(|| InstanceError::InvalidParameter(format!("unknown parameter id {id}")))
    }

    /// Run `f` against the native plugin behind the fault guard.
    ///
    /// A panic or a `Fault` moves the instance to `Error`. A running stream
    /// is paused for the call and resumed afterwards.
    fn call<R, E>(
        &mut self,
        f: impl FnOnce(&mut dyn Plugin) -> Result<R, E>,
    ) -> Result<R, InstanceError>
    where
        E: Into<InstanceError>,
    {
        let was_streaming = self.pause_stream()?;
        let NativeSlot::Idle(plugin) = &mut self.native else {
            return Err(self.fail("native plugin is gone".to_string()));
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(plugin.as_mut())));
        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => match error.into() {
                InstanceError::Fault(message) => Err(self.fail(message)),
                other => Err(other),
            },
            Err(panic) => Err(self.fail(format!("plugin panicked: {}", panic_message(&*panic)))),
        };

        if was_streaming && self.state != InstanceState::Error {
            self.resume_stream()?;
        }
        result
    }

    /// Halt a running stream and take the plugin back.
    /// Returns whether a stream was running.
    fn pause_stream(&mut self) -> Result<bool, InstanceError> {
        if !self.is_streaming() {
            return Ok(false);
        }
        let NativeSlot::Streaming(stream) = mem::replace(&mut self.native, NativeSlot::Retired)
        else {
            return Ok(false);
        };
        let processor = match stream.halt() {
            Ok(processor) => processor,
            Err(e) => return Err(self.fail(e.to_string())),
        };
        let faulted = processor.is_faulted();
        self.native = NativeSlot::Idle(processor.into_plugin());
        if faulted {
            return Err(self.fail("plugin faulted in the stream callback".to_string()));
        }
        Ok(true)
    }

    fn resume_stream(&mut self) -> Result<(), InstanceError> {
        let NativeSlot::Idle(plugin) = mem::replace(&mut self.native, NativeSlot::Retired) else {
            return Err(self.fail("native plugin is gone".to_string()));
        };
        match StreamHandle::start(plugin, self.config, &self.handle.to_string()) {
            Ok(stream) => {
                self.native = NativeSlot::Streaming(stream);
                Ok(())
            }
            Err(e) => Err(self.fail(format!("stream could not start: {e}"))),
        }
    }

    fn stream(&mut self) -> Result<&mut StreamHandle, InstanceError> {
        match &mut self.native {
            NativeSlot::Streaming(stream) => Ok(stream),
            _ => Err(InstanceError::NotStreaming(self.handle)),
        }
    }

    /// Surface a pending stream fault before touching the stream.
    fn check_stream(&mut self, operation: &'static str) -> Result<(), InstanceError> {
        self.require(operation, &[InstanceState::Active])?;
        if let NativeSlot::Streaming(stream) = &mut self.native
            && let Some(StreamEvent::Faulted { panicked }) = stream.poll_event()
        {
            return Err(self.stream_faulted(panicked));
        }
        Ok(())
    }

    fn stream_faulted(&mut self, panicked: bool) -> InstanceError {
        if let NativeSlot::Streaming(stream) = mem::replace(&mut self.native, NativeSlot::Retired)
            && let Ok(processor) = stream.halt()
        {
            self.native = NativeSlot::Idle(processor.into_plugin());
        }
        let message = if panicked {
            "plugin panicked in the stream callback"
        } else {
            "plugin failed in the stream callback"
        };
        self.fail(message.to_string())
    }

    /// Stop any stream and shut the plugin down, whatever state we are in.
    fn release(&mut self) {
        let plugin = match mem::replace(&mut self.native, NativeSlot::Retired) {
            NativeSlot::Idle(plugin) => Some(plugin),
            NativeSlot::Streaming(stream) => stream.halt().ok().map(|p| p.into_plugin()),
            NativeSlot::Retired => None,
        };
        if let Some(mut plugin) = plugin
            && panic::catch_unwind(AssertUnwindSafe(|| plugin.shutdown())).is_err()
        {
            tracing::warn!("Plugin for handle {} panicked during shutdown", self.handle);
        }
    }

    /// Enter `Error` and report the crash. Idempotent.
    fn fail(&mut self, message: String) -> InstanceError {
        if self.state != InstanceState::Error {
            tracing::error!("Handle {} faulted: {message}", self.handle);
            self.transition(InstanceState::Error);
            self.fault = Some(message.clone());
            self.emit(HostEvent::Crash {
                handle: self.handle,
                message: message.clone(),
            });
        }
        InstanceError::Fault(message)
    }

    fn transition(&mut self, to: InstanceState) {
        tracing::debug!("Handle {}: {} -> {to}", self.handle, self.state);
        self.state = to;
        self.history.push(to);
    }

    fn emit(&self, event: HostEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Event receiver gone, dropping event for handle {}", self.handle);
        }
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Read the parameter table with current values.
fn read_parameters(plugin: &mut dyn Plugin) -> Result<Vec<ParameterState>, PluginError> {
    plugin
        .parameters()
        .into_iter()
        .map(|info| {
            let value = plugin.get_parameter(info.id)?;
            Ok(ParameterState { info, value })
        })
        .collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
