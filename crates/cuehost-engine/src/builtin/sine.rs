//! Sine oscillator - deterministic test-tone instrument.

use cuehost_core::{AudioConfig, SampleRate};
use cuehost_plugin::{
    AudioBuffer, EventBuffer, ParameterInfo, Plugin, PluginDescriptor, PluginError, PluginFormat,
};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

pub const FREQUENCY: u32 = 0;
pub const LEVEL: u32 = 1;

/// Sine generator writing the same tone to every output channel.
///
/// Phase restarts at zero on every `activate`, so two instances configured
/// alike render identical samples.
pub struct SineOscillator {
    frequency: f32,
    level: f32,
    phase: f64,
    sample_rate: SampleRate,
    descriptor: PluginDescriptor,
}

#[derive(Serialize, Deserialize)]
struct SineState {
    frequency: f32,
    level: f32,
}

impl Default for SineOscillator {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            level: 0.5,
            phase: 0.0,
            sample_rate: 48000,
            descriptor: Self::describe(),
        }
    }
}

impl SineOscillator {
    pub fn describe() -> PluginDescriptor {
        PluginDescriptor::new(PluginFormat::Builtin, "sine", "", "Sine")
            .vendor("cuehost")
            .version("1.0.0")
            .instrument(true)
            .channels(0, 2)
    }

    fn apply(&mut self, id: u32, value: f32) -> Result<f32, PluginError> {
        let info = self
            .parameters()
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| PluginError::InvalidParameter(format!("Unknown parameter ID: {id}")))?;
        let value = info.clamp(value);
        match id {
            FREQUENCY => self.frequency = value,
            _ => self.level = value,
        }
        Ok(value)
    }
}

impl Plugin for SineOscillator {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn initialize(&mut self, config: &AudioConfig) -> Result<(), PluginError> {
        self.sample_rate = config.sample_rate;
        Ok(())
    }

    fn activate(&mut self) -> Result<(), PluginError> {
        self.phase = 0.0;
        Ok(())
    }

    fn suspend(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn process(&mut self, audio: &mut AudioBuffer, events: &EventBuffer) -> Result<(), PluginError> {
        for change in events.iter() {
            match change.id {
                FREQUENCY => self.frequency = change.value.clamp(20.0, 20_000.0),
                LEVEL => self.level = change.value.clamp(0.0, 1.0),
                _ => {}
            }
        }

        let step = f64::from(self.frequency) / f64::from(self.sample_rate);
        let level = f64::from(self.level);
        let Some((first, rest)) = audio.outputs.split_first_mut() else {
            return Ok(());
        };
        for sample in first[..audio.frames].iter_mut() {
            *sample = (level * (TAU * self.phase).sin()) as f32;
            self.phase = (self.phase + step).fract();
        }
        for channel in rest {
            channel[..audio.frames].copy_from_slice(&first[..audio.frames]);
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo {
                id: FREQUENCY,
                name: "Frequency".to_string(),
                min_value: 20.0,
                max_value: 20_000.0,
                default_value: 440.0,
                automatable: true,
            },
            ParameterInfo {
                id: LEVEL,
                name: "Level".to_string(),
                min_value: 0.0,
                max_value: 1.0,
                default_value: 0.5,
                automatable: true,
            },
        ]
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<f32, PluginError> {
        self.apply(id, value)
    }

    fn get_parameter(&mut self, id: u32) -> Result<f32, PluginError> {
        match id {
            FREQUENCY => Ok(self.frequency),
            LEVEL => Ok(self.level),
            _ => Err(PluginError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn save_state(&mut self) -> Result<Vec<u8>, PluginError> {
        serde_json::to_vec(&SineState {
            frequency: self.frequency,
            level: self.level,
        })
        .map_err(|e| PluginError::ProcessingFailed(format!("Failed to encode state: {e}")))
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), PluginError> {
        let state: SineState = serde_json::from_slice(data)
            .map_err(|e| PluginError::InvalidParameter(format!("Invalid sine state: {e}")))?;
        self.apply(FREQUENCY, state.frequency)?;
        self.apply(LEVEL, state.level)?;
        Ok(())
    }

    fn shutdown(&mut self) {}
}
