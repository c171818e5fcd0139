//! Fault injector - passthrough effect that panics on demand.
//!
//! Exists to exercise the host's fault boundaries: once `trigger` reaches
//! 0.5, the next `process` call panics.

use cuehost_core::AudioConfig;
use cuehost_plugin::{
    AudioBuffer, EventBuffer, ParameterInfo, Plugin, PluginDescriptor, PluginError, PluginFormat,
};

pub const TRIGGER: u32 = 0;

pub struct FaultInjector {
    trigger: f32,
    descriptor: PluginDescriptor,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self {
            trigger: 0.0,
            descriptor: Self::describe(),
        }
    }
}

impl FaultInjector {
    pub fn describe() -> PluginDescriptor {
        PluginDescriptor::new(PluginFormat::Builtin, "fault", "", "Fault Injector")
            .vendor("cuehost")
            .version("1.0.0")
    }

    fn armed(&self) -> bool {
        self.trigger >= 0.5
    }
}

impl Plugin for FaultInjector {
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
        for change in events.iter().filter(|c| c.id == TRIGGER) {
            self.trigger = change.value.clamp(0.0, 1.0);
        }
        assert!(!self.armed(), "fault injector triggered");

        let frames = audio.frames;
        for (ch, output) in audio.outputs.iter_mut().enumerate() {
            match audio.inputs.get(ch) {
                Some(input) => output[..frames].copy_from_slice(&input[..frames]),
                None => output[..frames].fill(0.0),
            }
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo {
            id: TRIGGER,
            name: "Trigger".to_string(),
            min_value: 0.0,
            max_value: 1.0,
            default_value: 0.0,
            automatable: false,
        }]
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<f32, PluginError> {
        if id != TRIGGER {
            return Err(PluginError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            )));
        }
        self.trigger = value.clamp(0.0, 1.0);
        Ok(self.trigger)
    }

    fn get_parameter(&mut self, id: u32) -> Result<f32, PluginError> {
        if id == TRIGGER {
            Ok(self.trigger)
        } else {
            Err(PluginError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            )))
        }
    }

    fn save_state(&mut self) -> Result<Vec<u8>, PluginError> {
        Ok(self.trigger.to_le_bytes().to_vec())
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), PluginError> {
        let bytes: [u8; 4] = data
            .try_into()
            .map_err(|_| PluginError::InvalidParameter("fault state must be 4 bytes".into()))?;
        self.trigger = f32::from_le_bytes(bytes).clamp(0.0, 1.0);
        Ok(())
    }

    fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(plugin: &mut FaultInjector) {
        let input = vec![0.5_f32; 8];
        let mut output = vec![0.0_f32; 8];
        let inputs: Vec<&[f32]> = vec![&input];
        let mut outputs: Vec<&mut [f32]> = vec![&mut output];
        let mut audio = AudioBuffer {
            inputs: &inputs,
            outputs: &mut outputs,
            frames: 8,
        };
        plugin.process(&mut audio, &EventBuffer::new()).unwrap();
    }

    #[test]
    fn test_passthrough_while_disarmed() {
        let mut plugin = FaultInjector::default();
        plugin.set_parameter(TRIGGER, 0.4).unwrap();
        run(&mut plugin);
    }

    #[test]
    #[should_panic(expected = "fault injector triggered")]
    fn test_panics_when_armed() {
        let mut plugin = FaultInjector::default();
        plugin.set_parameter(TRIGGER, 1.0).unwrap();
        run(&mut plugin);
    }
}
