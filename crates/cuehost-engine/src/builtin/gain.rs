//! Gain processor - simple volume control.

use cuehost_core::AudioConfig;
use cuehost_plugin::{
    AudioBuffer, EventBuffer, ParameterInfo, Plugin, PluginDescriptor, PluginError, PluginFormat,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Gain parameter id
pub const GAIN: u32 = 0;

/// Simple gain/volume processor
///
/// Multiplies every input channel by a gain factor into the output channel
/// with the same index. Output channels without a matching input are
/// silent.
///
/// ## Parameter Range
///
/// Gain: 0.0 to 2.0 (linear)
/// - 0.0 = silence (−∞ dB)
/// - 1.0 = unity gain (0 dB, default)
/// - 2.0 = double amplitude (+6 dB)
pub struct GainProcessor {
    /// Gain value stored as f32 bits in an atomic
    gain: AtomicU32,
    descriptor: PluginDescriptor,
}

#[derive(Serialize, Deserialize)]
struct GainState {
    gain: f32,
}

impl Default for GainProcessor {
    fn default() -> Self {
        Self {
            gain: AtomicU32::new(1.0_f32.to_bits()),
            descriptor: Self::describe(),
        }
    }
}

impl GainProcessor {
    pub fn describe() -> PluginDescriptor {
        PluginDescriptor::new(PluginFormat::Builtin, "gain", "", "Gain")
            .vendor("cuehost")
            .version("1.0.0")
    }

    fn get_gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Acquire))
    }

    fn set_gain(&self, value: f32) -> f32 {
        let clamped = value.clamp(0.0, 2.0);
        self.gain.store(clamped.to_bits(), Ordering::Release);
        clamped
    }
}

impl Plugin for GainProcessor {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn initialize(&mut self, _config: &AudioConfig) -> Result<(), PluginError> {
        Ok(())
    }

    fn activate(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn suspend(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn process(&mut self, audio: &mut AudioBuffer, events: &EventBuffer) -> Result<(), PluginError> {
        for change in events.iter().filter(|c| c.id == GAIN) {
            self.set_gain(change.value);
        }
        let gain = self.get_gain();
        let frames = audio.frames;

        for (ch, output) in audio.outputs.iter_mut().enumerate() {
            match audio.inputs.get(ch) {
                Some(input) => {
                    for (out, sample) in output[..frames].iter_mut().zip(&input[..frames]) {
                        *out = sample * gain;
                    }
                }
                None => output[..frames].fill(0.0),
            }
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo {
            id: GAIN,
            name: "Gain".to_string(),
            min_value: 0.0,
            max_value: 2.0,
            default_value: 1.0,
            automatable: true,
        }]
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<f32, PluginError> {
        match id {
            GAIN => Ok(self.set_gain(value)),
            _ => Err(PluginError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn get_parameter(&mut self, id: u32) -> Result<f32, PluginError> {
        match id {
            GAIN => Ok(self.get_gain()),
            _ => Err(PluginError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn save_state(&mut self) -> Result<Vec<u8>, PluginError> {
        serde_json::to_vec(&GainState {
            gain: self.get_gain(),
        })
        .map_err(|e| PluginError::ProcessingFailed(format!("Failed to encode state: {e}")))
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), PluginError> {
        let state: GainState = serde_json::from_slice(data)
            .map_err(|e| PluginError::InvalidParameter(format!("Invalid gain state: {e}")))?;
        self.set_gain(state.gain);
        Ok(())
    }

    fn shutdown(&mut self) {}
}
