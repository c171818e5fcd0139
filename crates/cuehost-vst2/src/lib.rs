//! VST2 plugin host implementation.
//!
//! Built on the `vst` crate's host side: `PluginLoader` opens the library and
//! drives the `AEffect`, this crate adapts it to the common `Plugin` trait.
//! VST2 parameters are addressed by index and are always normalized.

use cuehost_core::{AudioConfig, MAX_CHANNELS};
use cuehost_plugin::{
    AudioBuffer, EventBuffer, ParameterInfo, Plugin, PluginDescriptor, PluginError, PluginFormat,
    PluginNotification,
};
use crossbeam_channel::{Receiver, Sender};
use smallvec::SmallVec;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use vst::host::{Host, HostBuffer, PluginInstance, PluginLoader};
use vst::plugin::{Category, Info, Plugin as VstPlugin, PluginParameters};

/// Capacity of the automation notification channel
const NOTIFICATION_CAPACITY: usize = 1024;

/// Host identifier reported through `audioMasterCurrentId`: "CUEH"
const HOST_PLUGIN_ID: i32 = 0x4355_4548;

const STATE_HEADER_CHUNK: [u8; 4] = *b"CHK\0";
const STATE_HEADER_PARAMS: [u8; 4] = *b"PRM\0";

/// Host callbacks for one plugin instance.
struct CueHost {
    notifications: Sender<PluginNotification>,
}

impl Host for CueHost {
    fn automate(&self, index: i32, value: f32) {
        let Ok(id) = u32::try_from(index) else {
            return;
        };
        let _ = self
            .notifications
            .try_send(PluginNotification::ParameterChanged { id, value });
    }

    fn get_plugin_id(&self) -> i32 {
        HOST_PLUGIN_ID
    }

    fn idle(&self) {}
}

/// Loaded plugin objects. `params` points into the instance, so it is
/// declared (and dropped) first.
struct Loaded {
    params: Arc<dyn PluginParameters>,
    instance: PluginInstance,
}

/// VST2 plugin wrapper
pub struct Vst2Plugin {
    descriptor: PluginDescriptor,
    loaded: Option<Loaded>,
    info: Info,
    notifications: Receiver<PluginNotification>,
    _host: Arc<Mutex<CueHost>>,
    config: AudioConfig,
    active: bool,
    host_buffer: HostBuffer<f32>,
    scratch_inputs: Vec<Vec<f32>>,
    scratch_outputs: Vec<Vec<f32>>,
}

// SAFETY: the instance, its parameter object and the host buffer's raw
// channel pointers are only touched by the thread that currently owns the
// wrapper, and the host serializes calls per instance.
#[allow(unsafe_code)]
unsafe impl Send for Vst2Plugin {}

/// Resolve a macOS `.vst` bundle to the binary inside it; `PluginLoader`
/// calls `dlopen` directly and does not understand bundles.
fn resolve_bundle_path(path: &Path) -> PathBuf {
    if path.is_dir() && path.extension().and_then(|e| e.to_str()) == Some("vst") {
        if let Some(stem) = path.file_stem() {
            let inner = path.join("Contents").join("MacOS").join(stem);
            if inner.exists() {
                return inner;
            }
        }
    }
    path.to_path_buf()
}

fn open(
    path: &Path,
) -> Result<(PluginInstance, Arc<Mutex<CueHost>>, Receiver<PluginNotification>), PluginError> {
    if path.components().any(|c| c == std::path::Component::ParentDir) {
        return Err(PluginError::FormatError(
            "Plugin path cannot contain '..' components (directory traversal)".to_string(),
        ));
    }
    let resolved = resolve_bundle_path(path);
    let (tx, rx) = crossbeam_channel::bounded(NOTIFICATION_CAPACITY);
    let host = Arc::new(Mutex::new(CueHost { notifications: tx }));

    let mut loader = PluginLoader::load(&resolved, Arc::clone(&host))
        .map_err(|e| PluginError::FormatError(format!("Failed to load VST2 library: {e:?}")))?;
    let mut instance = loader.instance().map_err(|e| {
        PluginError::InitializationFailed(format!("Failed to create VST2 instance: {e:?}"))
    })?;
    instance.init();
    Ok((instance, host, rx))
}

fn describe(path: &Path, info: &Info) -> PluginDescriptor {
    let instrument = matches!(info.category, Category::Synth | Category::Generator)
        || info.inputs == 0;
    PluginDescriptor::new(PluginFormat::Vst2, info.unique_id, path, info.name.clone())
        .vendor(info.vendor.clone())
        .version(info.version.to_string())
        .instrument(instrument)
        .channels(
            usize::try_from(info.inputs).unwrap_or(0).min(MAX_CHANNELS),
            usize::try_from(info.outputs).unwrap_or(0).min(MAX_CHANNELS),
        )
}

/// Probe a VST2 library for its descriptor.
pub fn probe(path: &Path) -> Result<PluginDescriptor, PluginError> {
    let (instance, _host, _rx) = open(path)?;
    Ok(describe(path, &instance.get_info()))
}

/// Instantiate the plugin a descriptor from `probe` points at.
pub fn load(descriptor: &PluginDescriptor) -> Result<Vst2Plugin, PluginError> {
    Vst2Plugin::load(descriptor)
}

impl Vst2Plugin {
    pub fn load(descriptor: &PluginDescriptor) -> Result<Self, PluginError> {
        tracing::info!("Loading VST2 plugin from: {}", descriptor.path.display());
        let (mut instance, host, notifications) = open(&descriptor.path)?;
        let info = instance.get_info();
        let params = instance.get_parameter_object();
        let host_buffer = HostBuffer::from_info(&info);
        tracing::info!(
            "Loaded VST2 plugin '{}' ({} parameters)",
            info.name,
            info.parameters
        );

        Ok(Self {
            descriptor: PluginDescriptor {
                id: descriptor.id.clone(),
                ..describe(&descriptor.path, &info)
            },
            loaded: Some(Loaded { params, instance }),
            info,
            notifications,
            _host: host,
            config: AudioConfig::default(),
            active: false,
            host_buffer,
            scratch_inputs: Vec::new(),
            scratch_outputs: Vec::new(),
        })
    }

    fn loaded(&mut self) -> Result<&mut Loaded, PluginError> {
        self.loaded
            .as_mut()
            .ok_or_else(|| PluginError::ProcessingFailed("plugin has been shut down".into()))
    }

    fn check_index(&self, id: u32) -> Result<i32, PluginError> {
        i32::try_from(id)
            .ok()
            .filter(|&index| index < self.info.parameters)
            .ok_or_else(|| PluginError::InvalidParameter(format!("unknown parameter id {id}")))
    }

    fn restore_parameters(&mut self, payload: &[u8]) -> Result<(), PluginError> {
        let (count, values) = payload.split_first_chunk::<4>().ok_or_else(|| {
            PluginError::InvalidParameter("parameter state is missing its count".into())
        })?;
        let count = i32::from_le_bytes(*count);
        if count < 0 || count > self.info.parameters {
            return Err(PluginError::InvalidParameter(format!(
                "state has {count} parameters but plugin has {}",
                self.info.parameters
            )));
        }
        if values.len() != count as usize * 4 {
            return Err(PluginError::InvalidParameter(format!(
                "parameter state size mismatch: expected {} bytes, got {}",
                count as usize * 4,
                values.len()
            )));
        }

        let loaded = self.loaded()?;
        for (index, bytes) in values.chunks_exact(4).enumerate() {
            let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            loaded.params.set_parameter(index as i32, value.clamp(0.0, 1.0));
        }
        Ok(())
    }
}

/// Copy host input into the plugin's declared input channels. Channels the
/// host does not supply read as silence.
fn fill_scratch(scratch: &mut [Vec<f32>], inputs: &[&[f32]], frames: usize) {
    for (ch, channel) in scratch.iter_mut().enumerate() {
        match inputs.get(ch) {
            Some(input) => channel[..frames].copy_from_slice(&input[..frames]),
            None => channel[..frames].fill(0.0),
        }
    }
}

/// Copy the plugin's rendered channels back to the host, silencing host
/// channels the plugin does not produce.
fn copy_rendered(rendered: &[Vec<f32>], outputs: &mut [&mut [f32]], frames: usize) {
    for (ch, output) in outputs.iter_mut().enumerate() {
        match rendered.get(ch) {
            Some(channel) => output[..frames].copy_from_slice(&channel[..frames]),
            None => output[..frames].fill(0.0),
        }
    }
}

impl Plugin for Vst2Plugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn initialize(&mut self, config: &AudioConfig) -> Result<(), PluginError> {
        tracing::info!(
            "Initializing VST2 plugin '{}' at {} Hz, block size {}",
            self.descriptor.name,
            config.sample_rate,
            config.block_size
        );
        let loaded = self.loaded()?;
        loaded.instance.set_sample_rate(config.sample_rate as f32);
        loaded.instance.set_block_size(config.block_size as i64);

        let inputs = usize::try_from(self.info.inputs).unwrap_or(0);
        let outputs = usize::try_from(self.info.outputs).unwrap_or(0);
        self.scratch_inputs = vec![vec![0.0; config.block_size]; inputs];
        self.scratch_outputs = vec![vec![0.0; config.block_size]; outputs];
        self.config = *config;
        Ok(())
    }

    fn activate(&mut self) -> Result<(), PluginError> {
        if !self.active {
            self.loaded()?.instance.resume();
            self.active = true;
        }
        Ok(())
    }

    fn suspend(&mut self) -> Result<(), PluginError> {
        if self.active {
            self.loaded()?.instance.suspend();
            self.active = false;
        }
        Ok(())
    }

    fn process(&mut self, audio: &mut AudioBuffer, events: &EventBuffer) -> Result<(), PluginError> {
        if !self.active {
            return Err(PluginError::ProcessingFailed("plugin is not active".into()));
        }
        let frames = audio.frames;
        if frames > self.config.block_size {
            return Err(PluginError::ProcessingFailed(format!(
                "block of {frames} frames exceeds configured {}",
                self.config.block_size
            )));
        }
        let Some(loaded) = self.loaded.as_mut() else {
            return Err(PluginError::ProcessingFailed("plugin has been shut down".into()));
        };

        for change in events.iter() {
            loaded.params.set_parameter(change.id as i32, change.value);
        }

        fill_scratch(&mut self.scratch_inputs, audio.inputs, frames);
        {
            let inputs: SmallVec<[&[f32]; MAX_CHANNELS]> = self
                .scratch_inputs
                .iter()
                .map(|channel| &channel[..frames])
                .collect();
            let mut outputs: SmallVec<[&mut [f32]; MAX_CHANNELS]> = self
                .scratch_outputs
                .iter_mut()
                .map(|channel| &mut channel[..frames])
                .collect();

            let mut buffer = self.host_buffer.bind(&inputs[..], &mut outputs[..]);
            loaded.instance.process(&mut buffer);
        }
        copy_rendered(&self.scratch_outputs, audio.outputs, frames);
        Ok(())
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        let Some(loaded) = self.loaded.as_ref() else {
            return Vec::new();
        };
        (0..self.info.parameters)
            .map(|index| ParameterInfo {
                automatable: loaded.params.can_be_automated(index),
                ..ParameterInfo::normalized(
                    index as u32,
                    loaded.params.get_parameter_name(index),
                    loaded.params.get_parameter(index),
                )
            })
            .collect()
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<f32, PluginError> {
        let index = self.check_index(id)?;
        let params = &self.loaded()?.params;
        params.set_parameter(index, value.clamp(0.0, 1.0));
        Ok(params.get_parameter(index))
    }

    fn get_parameter(&mut self, id: u32) -> Result<f32, PluginError> {
        let index = self.check_index(id)?;
        Ok(self.loaded()?.params.get_parameter(index))
    }

    fn save_state(&mut self) -> Result<Vec<u8>, PluginError> {
        let preset_chunks = self.info.preset_chunks;
        let count = self.info.parameters;
        let params = &self.loaded()?.params;

        if preset_chunks {
            let chunk = params.get_preset_data();
            if !chunk.is_empty() {
                let mut state = Vec::with_capacity(4 + chunk.len());
                state.extend_from_slice(&STATE_HEADER_CHUNK);
                state.extend_from_slice(&chunk);
                return Ok(state);
            }
        }

        let mut state = Vec::with_capacity(8 + count.max(0) as usize * 4);
        state.extend_from_slice(&STATE_HEADER_PARAMS);
        state.extend_from_slice(&count.to_le_bytes());
        for index in 0..count {
            state.extend_from_slice(&params.get_parameter(index).to_le_bytes());
        }
        Ok(state)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), PluginError> {
        let Some((header, payload)) = data.split_first_chunk::<4>() else {
            return Err(PluginError::InvalidParameter(
                "state data too short (missing header)".into(),
            ));
        };
        match *header {
            STATE_HEADER_CHUNK if !payload.is_empty() => {
                self.loaded()?.params.load_preset_data(payload);
                Ok(())
            }
            STATE_HEADER_PARAMS => self.restore_parameters(payload),
            _ => Err(PluginError::InvalidParameter(format!(
                "unrecognized VST2 state header {header:?}"
            ))),
        }
    }

    fn notifications(&self) -> Option<Receiver<PluginNotification>> {
        Some(self.notifications.clone())
    }

    fn shutdown(&mut self) {
        if self.active {
            let _ = self.suspend();
        }
        if let Some(loaded) = self.loaded.take() {
            tracing::info!("Shutting down VST2 plugin '{}'", self.descriptor.name);
            drop(loaded);
        }
    }
}

impl Drop for Vst2Plugin {
    fn drop(&mut self) {
        self.shutdown();
    }
}
