//! Offline (faster than real time) rendering.

use cuehost_core::{AudioConfig, Frames, MAX_CHANNELS, Sample};
use cuehost_plugin::{AudioBuffer, EventBuffer, Plugin, PluginError};
use smallvec::SmallVec;

/// Offline render failures
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// Input buffers do not match the instance's audio configuration.
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Check input buffers against the configuration without touching the plugin.
pub fn validate_inputs(
    config: &AudioConfig,
    inputs: &[Vec<Sample>],
    frame_count: Frames,
) -> Result<(), RenderError> {
    if inputs.len() != config.input_channels {
        return Err(RenderError::FormatMismatch(format!(
            "expected {} input channels, got {}",
            config.input_channels,
            inputs.len()
        )));
    }
    if let Some((ch, buffer)) = inputs
        .iter()
        .enumerate()
        .find(|(_, buffer)| buffer.len() != frame_count)
    {
        return Err(RenderError::FormatMismatch(format!(
            "input channel {ch} has {} frames, expected {frame_count}",
            buffer.len()
        )));
    }
    Ok(())
}

/// Run `frame_count` frames of `inputs` through an active plugin.
///
/// Audio is fed in chunks of at most `config.block_size` frames; the last
/// chunk may be shorter. Returns one buffer of `frame_count` samples per
/// configured output channel.
pub fn render_offline(
    plugin: &mut dyn Plugin,
    config: &AudioConfig,
    inputs: &[Vec<Sample>],
    frame_count: Frames,
) -> Result<Vec<Vec<Sample>>, RenderError> {
    validate_inputs(config, inputs, frame_count)?;

    let mut outputs = vec![vec![0.0; frame_count]; config.output_channels];
    let events = EventBuffer::with_capacity(0);
    let block_size = config.block_size.max(1);

    let mut offset = 0;
    while offset < frame_count {
        let frames = block_size.min(frame_count - offset);
        let range = offset..offset + frames;

        let input_refs: SmallVec<[&[Sample]; MAX_CHANNELS]> =
            inputs.iter().map(|ch| &ch[range.clone()]).collect();
        let mut output_refs: SmallVec<[&mut [Sample]; MAX_CHANNELS]> = outputs
            .iter_mut()
            .map(|ch| &mut ch[range.clone()])
            .collect();

        let mut audio = AudioBuffer {
            inputs: &input_refs,
            outputs: &mut output_refs,
            frames,
        };
        plugin.process(&mut audio, &events)?;
        offset += frames;
    }

    tracing::debug!(
        "Rendered {frame_count} frames offline through {}",
        plugin.descriptor().id
    );
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{gain, sine};

    fn gain_plugin(config: &AudioConfig, value: f32) -> gain::GainProcessor {
        let mut plugin = gain::GainProcessor::default();
        plugin.initialize(config).unwrap();
        plugin.set_parameter(gain::GAIN, value).unwrap();
        plugin.activate().unwrap();
        plugin
    }

    #[test]
    fn test_render_applies_gain_across_partial_blocks() {
        let config = AudioConfig::new(48000, 64, 2, 2);
        let mut plugin = gain_plugin(&config, 0.5);
        let inputs = vec![vec![1.0; 150], vec![-1.0; 150]];

        let outputs = render_offline(&mut plugin, &config, &inputs, 150).unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs[0].iter().all(|&s| s == 0.5));
        assert!(outputs[1].iter().all(|&s| s == -0.5));
    }

    #[test]
    fn test_channel_count_mismatch() {
        let config = AudioConfig::new(48000, 64, 2, 2);
        let mut plugin = gain_plugin(&config, 1.0);
        let inputs = vec![vec![1.0; 32]];
        assert!(matches!(
            render_offline(&mut plugin, &config, &inputs, 32),
            Err(RenderError::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_length_mismatch_is_not_truncated() {
        let config = AudioConfig::new(48000, 64, 2, 2);
        let mut plugin = gain_plugin(&config, 1.0);
        let inputs = vec![vec![1.0; 32], vec![1.0; 31]];
        assert!(matches!(
            render_offline(&mut plugin, &config, &inputs, 32),
            Err(RenderError::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_zero_frames() {
        let config = AudioConfig::new(48000, 64, 2, 2);
        let mut plugin = gain_plugin(&config, 1.0);
        let inputs = vec![Vec::new(), Vec::new()];
        let outputs = render_offline(&mut plugin, &config, &inputs, 0).unwrap();
        assert_eq!(outputs, vec![Vec::<f32>::new(), Vec::new()]);
    }

    #[test]
    fn test_instrument_render_is_deterministic() {
        let config = AudioConfig::new(44100, 128, 0, 2);
        let render = || {
            let mut plugin = sine::SineOscillator::default();
            plugin.initialize(&config).unwrap();
            plugin.activate().unwrap();
            render_offline(&mut plugin, &config, &[], 1000).unwrap()
        };
        let first = render();
        assert_eq!(first, render());
        assert_eq!(first[0].len(), 1000);
        assert!(first[0].iter().any(|&s| s != 0.0));
    }
}
