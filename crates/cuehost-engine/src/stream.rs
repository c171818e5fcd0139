//! Real-time streaming.
//!
//! Every streaming instance owns one periodic thread that calls
//! [`StreamProcessor::process_block`] once per block duration. The command
//! context talks to it only through the lock-free rings in
//! [`cuehost_comms`], so a slow or stalled stream never blocks another.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use cuehost_comms::{
    ControlChannels, RtChannels, StreamCommand, StreamEvent, StreamStats, create_stream_channels,
};
use cuehost_core::{AudioConfig, Frames, MAX_CHANNELS, Sample};
use cuehost_plugin::{AudioBuffer, EventBuffer, ParamChange, Plugin};
use smallvec::SmallVec;

/// Stream control failures
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Failed to spawn stream thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Parameter queue is full")]
    CommandQueueFull,

    /// The stream thread died outside the plugin guard; the plugin is lost.
    #[error("Stream thread panicked")]
    Panicked,
}

/// The real-time half of a stream: the plugin plus preallocated buffers.
pub struct StreamProcessor {
    plugin: Box<dyn Plugin>,
    rt: RtChannels,
    events: EventBuffer,
    inputs: Vec<Vec<Sample>>,
    outputs: Vec<Vec<Sample>>,
    config: AudioConfig,
    stats: StreamStats,
    faulted: bool,
}

impl StreamProcessor {
    /// All allocation for the stream happens here.
    pub fn new(plugin: Box<dyn Plugin>, config: AudioConfig, rt: RtChannels) -> Self {
        Self {
            plugin,
            rt,
            events: EventBuffer::new(),
            inputs: vec![vec![0.0; config.block_size]; config.input_channels],
            outputs: vec![vec![0.0; config.block_size]; config.output_channels],
            config,
            stats: StreamStats::default(),
            faulted: false,
        }
    }

    /// Process one block. Returns `false` once the plugin has faulted, that
    /// is, panicked or returned [`PluginError::Fault`](cuehost_plugin::PluginError::Fault).
    ///
    /// REAL-TIME SAFE: no allocation, locking, logging or I/O.
    pub fn process_block(&mut self) -> bool {
        if self.faulted {
            return false;
        }

        // Changes beyond one block's capacity stay queued for the next block.
        while !self.events.is_full() {
            let Ok(StreamCommand::SetParameter { id, value }) = self.rt.command_rx.pop() else {
                break;
            };
            self.events.push(ParamChange {
                id,
                value,
                sample_offset: 0,
            });
        }

        self.pull_input();

        let result = {
            // REAL-TIME SAFE: SmallVec keeps up to MAX_CHANNELS slices on the stack
            let input_refs: SmallVec<[&[Sample]; MAX_CHANNELS]> =
                self.inputs.iter().map(Vec::as_slice).collect();
            let mut output_refs: SmallVec<[&mut [Sample]; MAX_CHANNELS]> =
                self.outputs.iter_mut().map(Vec::as_mut_slice).collect();
            let plugin = &mut self.plugin;
            let events = &self.events;
            let frames = self.config.block_size;

            panic::catch_unwind(AssertUnwindSafe(|| {
                let mut audio = AudioBuffer {
                    inputs: &input_refs,
                    outputs: &mut output_refs,
                    frames,
                };
                plugin.process(&mut audio, events)
            }))
        };
        self.events.clear();

        let panicked = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) if e.is_fault() => Some(false),
            Ok(Err(_)) => {
                // A rejected block is not fatal: it plays as silence.
                for channel in &mut self.outputs {
                    channel.fill(0.0);
                }
                self.stats.failed_blocks += 1;
                None
            }
            Err(_) => Some(true),
        };
        if let Some(panicked) = panicked {
            self.faulted = true;
            self.stats.faulted = true;
            let _ = self.rt.event_tx.push(StreamEvent::Faulted { panicked });
            self.rt.stats.write(self.stats);
            return false;
        }

        self.push_output();
        self.stats.blocks += 1;
        self.rt.stats.write(self.stats);
        true
    }

    /// De-interleave one block of input, or substitute silence.
    fn pull_input(&mut self) {
        let channels = self.config.input_channels;
        if channels == 0 {
            return;
        }
        let needed = self.config.block_size * channels;
        match self.rt.input_rx.read_chunk(needed) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                for (i, &sample) in first.iter().chain(second).enumerate() {
                    self.inputs[i % channels][i / channels] = sample;
                }
                chunk.commit_all();
            }
            Err(_) => {
                for channel in &mut self.inputs {
                    channel.fill(0.0);
                }
                self.stats.underruns += 1;
            }
        }
    }

    /// Interleave the block into the output ring, or drop it when full.
    fn push_output(&mut self) {
        let channels = self.config.output_channels;
        if channels == 0 {
            return;
        }
        let needed = self.config.block_size * channels;
        match self.rt.output_tx.write_chunk(needed) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                for (i, slot) in first.iter_mut().chain(second.iter_mut()).enumerate() {
                    *slot = self.outputs[i % channels][i / channels];
                }
                chunk.commit_all();
            }
            Err(_) => self.stats.overruns += 1,
        }
    }

    pub const fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub const fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Apply parameter changes the thread never got to. Runs after the
    /// stream thread is gone, so the plugin is called directly.
    fn apply_pending(&mut self) {
        if self.faulted {
            return;
        }
        let plugin = &mut self.plugin;
        let rt = &mut self.rt;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            while let Ok(StreamCommand::SetParameter { id, value }) = rt.command_rx.pop() {
                plugin.set_parameter(id, value)?;
            }
            Ok::<(), cuehost_plugin::PluginError>(())
        }));
        if !matches!(result, Ok(Ok(()))) {
            self.faulted = true;
            self.stats.faulted = true;
        }
    }

    /// Hand the plugin back to the command context.
    pub fn into_plugin(self) -> Box<dyn Plugin> {
        self.plugin
    }
}

/// Command-side handle of a running stream.
pub struct StreamHandle {
    control: ControlChannels,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<StreamProcessor>>,
}

impl StreamHandle {
    /// Move `plugin` onto a new periodic stream thread.
    pub fn start(
        plugin: Box<dyn Plugin>,
        config: AudioConfig,
        name: &str,
    ) -> Result<Self, StreamError> {
        let (control, rt) = create_stream_channels(
            config.block_size,
            config.input_channels,
            config.output_channels,
        );
        let processor = StreamProcessor::new(plugin, config, rt);
        let stop = Arc::new(AtomicBool::new(false));

        let thread = thread::Builder::new()
            .name(format!("stream-{name}"))
            .spawn({
                let stop = Arc::clone(&stop);
                move || run(processor, &stop)
            })
            .map_err(StreamError::Spawn)?;

        tracing::info!(
            "Stream {name} started ({} frames @ {} Hz)",
            config.block_size,
            config.sample_rate
        );
        Ok(Self {
            control,
            stop,
            thread: Some(thread),
        })
    }

    /// Queue a parameter change for the next block boundary.
    pub fn set_parameter(&mut self, id: u32, value: f32) -> Result<(), StreamError> {
        self.control
            .command_tx
            .push(StreamCommand::SetParameter { id, value })
            .map_err(|_| StreamError::CommandQueueFull)
    }

    /// Queue input audio. Returns the number of frames accepted.
    pub fn write(&mut self, channels: &[Vec<Sample>]) -> Result<Frames, StreamError> {
        let expected = self.control.input_channels();
        if channels.len() != expected {
            return Err(StreamError::FormatMismatch(format!(
                "expected {expected} input channels, got {}",
                channels.len()
            )));
        }
        if channels.windows(2).any(|pair| pair[0].len() != pair[1].len()) {
            return Err(StreamError::FormatMismatch(
                "input channels differ in length".to_string(),
            ));
        }
        Ok(self.control.push_input(channels))
    }

    /// Drain up to `max_frames` frames of processed output.
    pub fn read(&mut self, max_frames: Frames) -> Vec<Vec<Sample>> {
        self.control.pop_output(max_frames)
    }

    pub fn stats(&mut self) -> StreamStats {
        self.control.stats()
    }

    pub const fn output_channels(&self) -> usize {
        self.control.output_channels()
    }

    /// Next event raised by the stream thread, if any.
    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.control.event_rx.pop().ok()
    }

    /// Stop the thread and take the processor (and its plugin) back.
    pub fn halt(mut self) -> Result<StreamProcessor, StreamError> {
        self.stop.store(true, Ordering::Release);
        let thread = self.thread.take().ok_or(StreamError::Panicked)?;
        let mut processor = thread.join().map_err(|_| StreamError::Panicked)?;
        processor.apply_pending();
        Ok(processor)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Periodic loop of the stream thread.
fn run(mut processor: StreamProcessor, stop: &AtomicBool) -> StreamProcessor {
    let period = processor.config.block_duration();
    let mut deadline = Instant::now();

    while !stop.load(Ordering::Acquire) {
        if !processor.process_block() {
            break;
        }
        deadline += period;
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else if now - deadline > period * 4 {
            // Fell far behind (machine stalled); don't burst to catch up.
            deadline = now;
        }
    }
    processor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{fault, gain, sine};
    use cuehost_comms::{COMMAND_CAPACITY, RING_BLOCKS};
    use cuehost_plugin::{ParameterInfo, PluginDescriptor, PluginError, PluginFormat};
    use std::time::Duration;

    fn active(mut plugin: Box<dyn Plugin>, config: &AudioConfig) -> Box<dyn Plugin> {
        plugin.initialize(config).unwrap();
        plugin.activate().unwrap();
        plugin
    }

    fn gain_plugin(config: &AudioConfig, value: f32) -> Box<dyn Plugin> {
        let mut plugin = active(Box::new(gain::GainProcessor::default()), config);
        plugin.set_parameter(gain::GAIN, value).unwrap();
        plugin
    }

    #[test]
    fn test_block_roundtrip() {
        let config = AudioConfig::new(48000, 4, 2, 2);
        let (mut control, rt) = create_stream_channels(4, 2, 2);
        let mut processor = StreamProcessor::new(gain_plugin(&config, 0.5), config, rt);

        control.push_input(&[vec![1.0, 2.0, 3.0, 4.0], vec![-1.0; 4]]);
        assert!(processor.process_block());

        let out = control.pop_output(16);
        assert_eq!(out, vec![vec![0.5, 1.0, 1.5, 2.0], vec![-0.5; 4]]);
        assert_eq!(control.stats().blocks, 1);
        assert_eq!(control.stats().underruns, 0);
    }

    #[test]
    fn test_underrun_produces_silence() {
        let config = AudioConfig::new(48000, 8, 2, 2);
        let (mut control, rt) = create_stream_channels(8, 2, 2);
        let mut processor = StreamProcessor::new(gain_plugin(&config, 1.0), config, rt);

        // Less than one block queued: the block runs on silence.
        control.push_input(&[vec![1.0; 3], vec![1.0; 3]]);
        assert!(processor.process_block());
        assert_eq!(control.stats().underruns, 1);
        assert!(control.pop_output(8).iter().flatten().all(|&s| s == 0.0));
    }

    #[test]
    fn test_parameter_applied_at_next_block() {
        let config = AudioConfig::new(48000, 4, 2, 2);
        let (mut control, rt) = create_stream_channels(4, 2, 2);
        let mut processor = StreamProcessor::new(gain_plugin(&config, 1.0), config, rt);

        control
            .command_tx
            .push(StreamCommand::SetParameter {
                id: gain::GAIN,
                value: 0.25,
            })
            .unwrap();
        control.push_input(&[vec![1.0; 4], vec![1.0; 4]]);
        processor.process_block();
        assert!(control.pop_output(4).iter().flatten().all(|&s| s == 0.25));

        let mut plugin = processor.into_plugin();
        assert_eq!(plugin.get_parameter(gain::GAIN).unwrap(), 0.25);
    }

    #[test]
    fn test_overrun_when_output_is_not_drained() {
        let config = AudioConfig::new(48000, 16, 0, 2);
        let (mut control, rt) = create_stream_channels(16, 0, 2);
        let plugin = active(Box::new(sine::SineOscillator::default()), &config);
        let mut processor = StreamProcessor::new(plugin, config, rt);

        for _ in 0..=RING_BLOCKS {
            assert!(processor.process_block());
        }
        let stats = control.stats();
        assert_eq!(stats.blocks, RING_BLOCKS as u64 + 1);
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.underruns, 0);
    }

    #[test]
    fn test_panic_is_contained() {
        let config = AudioConfig::new(48000, 4, 2, 2);
        let (mut control, rt) = create_stream_channels(4, 2, 2);
        let mut plugin = active(Box::new(fault::FaultInjector::default()), &config);
        plugin.set_parameter(fault::TRIGGER, 1.0).unwrap();
        let mut processor = StreamProcessor::new(plugin, config, rt);

        assert!(!processor.process_block());
        assert!(processor.is_faulted());
        assert!(!processor.process_block());
        assert_eq!(
            control.event_rx.pop(),
            Ok(StreamEvent::Faulted { panicked: true })
        );
        assert!(control.stats().faulted);
        assert_eq!(control.stats().blocks, 0);
    }

    #[test]
    fn test_changes_beyond_block_capacity_wait_for_next_block() {
        let config = AudioConfig::new(48000, 4, 2, 2);
        let (mut control, rt) = create_stream_channels(4, 2, 2);
        let mut processor = StreamProcessor::new(gain_plugin(&config, 1.0), config, rt);

        let burst = EventBuffer::DEFAULT_CAPACITY + 44;
        for i in 0..burst {
            control
                .command_tx
                .push(StreamCommand::SetParameter {
                    id: gain::GAIN,
                    value: i as f32 / 200.0,
                })
                .unwrap();
        }
        assert!(processor.process_block());
        assert_eq!(control.command_tx.slots(), COMMAND_CAPACITY - 44);
        assert!(processor.process_block());
        assert_eq!(control.command_tx.slots(), COMMAND_CAPACITY);

        let last = (burst - 1) as f32 / 200.0;
        let mut plugin = processor.into_plugin();
        assert_eq!(plugin.get_parameter(gain::GAIN).unwrap(), last);
    }

    /// Refuses every block with the configured error.
    struct Refusing {
        descriptor: PluginDescriptor,
        error: PluginError,
    }

    impl Refusing {
        fn boxed(error: PluginError) -> Box<dyn Plugin> {
            Box::new(Self {
                descriptor: PluginDescriptor::new(PluginFormat::Builtin, "refusing", "", "Refusing"),
                error,
            })
        }
    }

    impl Plugin for Refusing {
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
        fn process(&mut self, audio: &mut AudioBuffer, _events: &EventBuffer) -> Result<(), PluginError> {
            for output in audio.outputs.iter_mut() {
                output.fill(1.0);
            }
            Err(self.error.clone())
        }
        fn parameters(&self) -> Vec<ParameterInfo> {
            Vec::new()
        }
        fn set_parameter(&mut self, _id: u32, value: f32) -> Result<f32, PluginError> {
            Ok(value)
        }
        fn get_parameter(&mut self, _id: u32) -> Result<f32, PluginError> {
            Ok(0.0)
        }
        fn save_state(&mut self) -> Result<Vec<u8>, PluginError> {
            Ok(Vec::new())
        }
        fn load_state(&mut self, _data: &[u8]) -> Result<(), PluginError> {
            Ok(())
        }
        fn shutdown(&mut self) {}
    }

    #[test]
    fn test_rejected_block_plays_silence_and_keeps_running() {
        let config = AudioConfig::new(48000, 4, 2, 2);
        let (mut control, rt) = create_stream_channels(4, 2, 2);
        let plugin = Refusing::boxed(PluginError::ProcessingFailed("not now".into()));
        let mut processor = StreamProcessor::new(plugin, config, rt);

        control.push_input(&[vec![1.0; 4], vec![1.0; 4]]);
        assert!(processor.process_block());
        assert!(processor.process_block());
        assert!(!processor.is_faulted());

        let stats = control.stats();
        assert_eq!(stats.failed_blocks, 2);
        assert_eq!(stats.blocks, 2);
        assert!(!stats.faulted);
        assert!(control.event_rx.pop().is_err());
        let out = control.pop_output(16);
        assert_eq!(out[0].len(), 8);
        assert!(out.iter().flatten().all(|&s| s == 0.0));
    }

    #[test]
    fn test_fault_error_stops_the_stream() {
        let config = AudioConfig::new(48000, 4, 2, 2);
        let (mut control, rt) = create_stream_channels(4, 2, 2);
        let plugin = Refusing::boxed(PluginError::Fault("worker died".into()));
        let mut processor = StreamProcessor::new(plugin, config, rt);

        assert!(!processor.process_block());
        assert!(processor.is_faulted());
        assert_eq!(
            control.event_rx.pop(),
            Ok(StreamEvent::Faulted { panicked: false })
        );
        assert_eq!(control.stats().failed_blocks, 0);
    }

    /// Collect `frames` frames of non-silent output, tolerating the silent
    /// underrun blocks produced before input arrives.
    fn collect_signal(handle: &mut StreamHandle, frames: usize) -> Vec<Vec<f32>> {
        let mut signal = vec![Vec::new(); handle.output_channels()];
        let deadline = Instant::now() + Duration::from_secs(10);
        while signal[0].len() < frames && Instant::now() < deadline {
            let chunk = handle.read(usize::MAX);
            for (out, channel) in signal.iter_mut().zip(chunk) {
                out.extend(channel.into_iter().filter(|&s| s != 0.0));
            }
            thread::sleep(Duration::from_millis(5));
        }
        signal
    }

    #[test]
    fn test_concurrent_streams_are_independent() {
        // 64 ms blocks: the 32-block output ring holds two seconds.
        let config = AudioConfig::new(8000, 512, 2, 2);
        let mut quiet = StreamHandle::start(gain_plugin(&config, 0.5), config, "quiet").unwrap();
        let mut loud = StreamHandle::start(gain_plugin(&config, 2.0), config, "loud").unwrap();

        let frames = config.block_size * 4;
        assert_eq!(quiet.write(&[vec![1.0; frames], vec![1.0; frames]]).unwrap(), frames);
        assert_eq!(loud.write(&[vec![1.0; frames], vec![1.0; frames]]).unwrap(), frames);

        let quiet_out = collect_signal(&mut quiet, frames);
        let loud_out = collect_signal(&mut loud, frames);

        for channel in &quiet_out {
            assert_eq!(channel.len(), frames);
            assert!(channel.iter().all(|&s| s == 0.5));
        }
        for channel in &loud_out {
            assert_eq!(channel.len(), frames);
            assert!(channel.iter().all(|&s| s == 2.0));
        }

        let quiet_plugin = quiet.halt().unwrap().into_plugin();
        let mut loud_plugin = loud.halt().unwrap().into_plugin();
        assert_eq!(quiet_plugin.descriptor().id, "builtin:gain");
        assert_eq!(loud_plugin.get_parameter(gain::GAIN).unwrap(), 2.0);
    }

    #[test]
    fn test_write_rejects_wrong_channel_count() {
        let config = AudioConfig::new(8000, 512, 2, 2);
        let mut handle = StreamHandle::start(gain_plugin(&config, 1.0), config, "mismatch").unwrap();
        assert!(matches!(
            handle.write(&[vec![1.0; 4]]),
            Err(StreamError::FormatMismatch(_))
        ));
        assert!(matches!(
            handle.write(&[vec![1.0; 4], vec![1.0; 3]]),
            Err(StreamError::FormatMismatch(_))
        ));
        handle.set_parameter(gain::GAIN, 0.5).unwrap();
        let processor = handle.halt().unwrap();
        assert!(!processor.is_faulted());
    }

    #[test]
    fn test_halt_applies_queued_changes() {
        // One block per second: the change is still queued when we halt.
        let config = AudioConfig::new(8000, 8000, 2, 2);
        let mut handle = StreamHandle::start(gain_plugin(&config, 1.0), config, "queued").unwrap();
        thread::sleep(Duration::from_millis(50));
        handle.set_parameter(gain::GAIN, 0.75).unwrap();
        let mut plugin = handle.halt().unwrap().into_plugin();
        assert_eq!(plugin.get_parameter(gain::GAIN).unwrap(), 0.75);
    }

    #[test]
    fn test_stream_fault_is_reported() {
        let config = AudioConfig::new(48000, 64, 2, 2);
        let mut handle = StreamHandle::start(
            active(Box::new(fault::FaultInjector::default()), &config),
            config,
            "fault",
        )
        .unwrap();
        handle.set_parameter(fault::TRIGGER, 1.0).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut event = None;
        while event.is_none() && Instant::now() < deadline {
            event = handle.poll_event();
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(event, Some(StreamEvent::Faulted { panicked: true }));
        assert!(handle.halt().unwrap().is_faulted());
    }
}
