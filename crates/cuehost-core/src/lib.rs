//! Core types and constants shared across the cuehost crates.
//!
//! Everything here is plain data: sample/frame aliases, the audio port
//! configuration an instance is loaded with, and the hard limits the
//! shared-memory transport and the stream rings are sized for.

use serde::{Deserialize, Serialize};

/// Sample rate in Hz
pub type SampleRate = u32;

/// Number of audio frames (samples per channel)
pub type Frames = usize;

/// Audio sample type (32-bit float is standard for plugin hosting)
pub type Sample = f32;

/// Number of audio channels
pub type ChannelCount = usize;

/// Common sample rates
pub mod sample_rates {
    use super::SampleRate;

    /// 44.1 kHz sample rate (CD quality)
    pub const SR_44100: SampleRate = 44100;
    /// 48 kHz sample rate (professional audio standard)
    pub const SR_48000: SampleRate = 48000;
    /// 96 kHz sample rate (high resolution audio)
    pub const SR_96000: SampleRate = 96000;

    /// Lowest rate a plugin will be configured with.
    pub const MIN: SampleRate = 8000;
    /// Highest rate a plugin will be configured with.
    pub const MAX: SampleRate = 384_000;
}

/// Audio buffer block sizes
pub mod block_sizes {
    use super::Frames;

    /// 64 frames per block (very low latency, ~1.3ms @ 48kHz)
    pub const BLOCK_64: Frames = 64;
    /// 256 frames per block (balanced, ~5.3ms @ 48kHz)
    pub const BLOCK_256: Frames = 256;
    /// 512 frames per block (higher latency, ~10.7ms @ 48kHz)
    pub const BLOCK_512: Frames = 512;

    /// Upper bound on frames per block. The shared-memory transport
    /// reserves exactly this many frames per channel.
    pub const MAX: Frames = 8192;
}

/// Maximum channels per direction on any instance.
pub const MAX_CHANNELS: ChannelCount = 8;

/// Audio port configuration an instance is loaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub sample_rate: SampleRate,
    pub block_size: Frames,
    pub input_channels: ChannelCount,
    pub output_channels: ChannelCount,
}

impl AudioConfig {
    pub const fn new(
        sample_rate: SampleRate,
        block_size: Frames,
        input_channels: ChannelCount,
        output_channels: ChannelCount,
    ) -> Self {
        Self {
            sample_rate,
            block_size,
            input_channels,
            output_channels,
        }
    }

    /// Check the configuration against the host limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(sample_rates::MIN..=sample_rates::MAX).contains(&self.sample_rate) {
            return Err(ConfigError::SampleRate(self.sample_rate));
        }
        if self.block_size == 0 || self.block_size > block_sizes::MAX {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        if self.input_channels > MAX_CHANNELS || self.output_channels > MAX_CHANNELS {
            return Err(ConfigError::Channels {
                inputs: self.input_channels,
                outputs: self.output_channels,
            });
        }
        Ok(())
    }

    /// Wall-clock duration of one block.
    pub fn block_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.block_size as f64 / f64::from(self.sample_rate))
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self::new(sample_rates::SR_48000, block_sizes::BLOCK_512, 2, 2)
    }
}

/// Rejected audio configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "sample rate {0} Hz is outside {min}..={max}",
        min = sample_rates::MIN,
        max = sample_rates::MAX
    )]
    SampleRate(SampleRate),

    #[error("block size {0} is outside 1..={max}", max = block_sizes::MAX)]
    BlockSize(Frames),

    #[error(
        "channel layout {inputs} in / {outputs} out exceeds {max} channels",
        max = MAX_CHANNELS
    )]
    Channels {
        inputs: ChannelCount,
        outputs: ChannelCount,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AudioConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = AudioConfig::default();
        config.sample_rate = 1000;
        assert_eq!(config.validate(), Err(ConfigError::SampleRate(1000)));

        let mut config = AudioConfig::default();
        config.block_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::BlockSize(0)));

        let config = AudioConfig::new(48000, 256, 2, MAX_CHANNELS + 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Channels { .. })
        ));
    }

    #[test]
    fn test_block_duration() {
        let config = AudioConfig::new(48000, 480, 2, 2);
        assert_eq!(config.block_duration().as_millis(), 10);
    }

    #[test]
    fn test_camel_case_wire_names() {
        let json = serde_json::to_value(AudioConfig::default()).unwrap();
        assert_eq!(json["sampleRate"], 48000);
        assert_eq!(json["blockSize"], 512);
        assert_eq!(json["inputChannels"], 2);
    }
}
