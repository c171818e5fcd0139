//! Lockless communication primitives for the real-time stream thread.
//!
//! Every streaming instance gets one set of channels: the command side lives
//! with the instance (behind the per-handle serialization), the real-time
//! side moves onto the stream thread. Nothing on the real-time side blocks or
//! allocates.

pub use rtrb;
pub use triple_buffer;

use cuehost_core::{ChannelCount, Frames, Sample};
use serde::Serialize;

/// Commands sent from the command context to the stream thread
///
/// IMPORTANT: All variants must be real-time safe (no heap allocation/deallocation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamCommand {
    /// Apply a parameter change at the next block boundary.
    SetParameter { id: u32, value: f32 },
}

/// Events sent from the stream thread back to the command context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The plugin panicked or reported a fault from `process`; the stream
    /// stopped calling it.
    Faulted { panicked: bool },
}

/// Counters published by the stream thread after every block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub blocks: u64,
    /// Blocks processed with silence because not enough input was queued.
    pub underruns: u64,
    /// Blocks whose output was dropped because the output ring was full.
    pub overruns: u64,
    /// Blocks the plugin rejected with a non-fatal error; they play as silence.
    pub failed_blocks: u64,
    pub faulted: bool,
}

/// Number of blocks each sample ring can hold.
pub const RING_BLOCKS: usize = 32;

/// Capacity of the parameter change ring.
pub const COMMAND_CAPACITY: usize = 1024;

/// Create the channel pair for one stream.
pub fn create_stream_channels(
    block_size: Frames,
    input_channels: ChannelCount,
    output_channels: ChannelCount,
) -> (ControlChannels, RtChannels) {
    let (command_tx, command_rx) = rtrb::RingBuffer::new(COMMAND_CAPACITY);
    let (event_tx, event_rx) = rtrb::RingBuffer::new(16);
    let (input_tx, input_rx) =
        rtrb::RingBuffer::new((block_size * input_channels * RING_BLOCKS).max(1));
    let (output_tx, output_rx) =
        rtrb::RingBuffer::new((block_size * output_channels * RING_BLOCKS).max(1));
    let (stats_in, stats_out) = triple_buffer::triple_buffer(&StreamStats::default());

    let control = ControlChannels {
        command_tx,
        event_rx,
        input_tx,
        output_rx,
        stats: stats_out,
        input_channels,
        output_channels,
    };
    let rt = RtChannels {
        command_rx,
        event_tx,
        input_rx,
        output_tx,
        stats: stats_in,
    };
    (control, rt)
}

/// Channels held by the command context
pub struct ControlChannels {
    pub command_tx: rtrb::Producer<StreamCommand>,
    pub event_rx: rtrb::Consumer<StreamEvent>,
    /// Interleaved input samples
    pub input_tx: rtrb::Producer<Sample>,
    /// Interleaved output samples
    pub output_rx: rtrb::Consumer<Sample>,
    pub stats: triple_buffer::Output<StreamStats>,
    input_channels: ChannelCount,
    output_channels: ChannelCount,
}

impl ControlChannels {
    /// Queue as many whole frames of `channels` as fit. Returns frames accepted.
    ///
    /// `channels` must hold one equally long buffer per input channel.
    pub fn push_input(&mut self, channels: &[Vec<Sample>]) -> Frames {
        debug_assert_eq!(channels.len(), self.input_channels);
        if self.input_channels == 0 {
            return 0;
        }
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        let room = self.input_tx.slots() / self.input_channels;
        let accepted = frames.min(room);
        for frame in 0..accepted {
            for channel in channels {
                // Room was reserved above, push cannot fail.
                let _ = self.input_tx.push(channel[frame]);
            }
        }
        accepted
    }

    /// Drain up to `max_frames` whole frames of output, de-interleaved.
    pub fn pop_output(&mut self, max_frames: Frames) -> Vec<Vec<Sample>> {
        if self.output_channels == 0 {
            return Vec::new();
        }
        let available = self.output_rx.slots() / self.output_channels;
        let frames = available.min(max_frames);
        let mut channels = vec![Vec::with_capacity(frames); self.output_channels];
        for _ in 0..frames {
            for channel in &mut channels {
                channel.push(self.output_rx.pop().unwrap_or(0.0));
            }
        }
        channels
    }

    /// Latest counters published by the stream thread.
    pub fn stats(&mut self) -> StreamStats {
        *self.stats.read()
    }

    pub const fn input_channels(&self) -> ChannelCount {
        self.input_channels
    }

    pub const fn output_channels(&self) -> ChannelCount {
        self.output_channels
    }
}

/// Channels moved onto the stream thread
pub struct RtChannels {
    pub command_rx: rtrb::Consumer<StreamCommand>,
    pub event_tx: rtrb::Producer<StreamEvent>,
    pub input_rx: rtrb::Consumer<Sample>,
    pub output_tx: rtrb::Producer<Sample>,
    pub stats: triple_buffer::Input<StreamStats>,
}
