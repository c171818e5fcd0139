//! Inter-process communication between the host and a plugin worker.
//!
//! # Architecture
//!
//! - **Control**: one JSON [`ControlMessage`] per line on the worker's
//!   stdin, one [`ResponseMessage`] per line back on its stdout.
//! - **Audio**: a [`SharedAudioBuffer`] mapped by both processes carries
//!   input and output samples plus the block's parameter changes.
//! - **Atomic state word**: `Idle → Process` (host), `Process → Done`
//!   (worker), `Done → Idle` (host).
//!
//! # Process Flow
//!
//! 1. Host creates the shared region and spawns `cuehost-worker`
//! 2. Worker opens the region, loads the plugin and answers `Ready`
//! 3. Control requests (`Init`, `SetParameter`, ...) are answered in order
//! 4. For each block:
//!    - Host writes inputs and parameter changes, sets `Process`
//!    - Worker runs the plugin, writes outputs, sets `Done`
//!    - Host reads outputs, sets `Idle`

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use cuehost_core::{AudioConfig, MAX_CHANNELS, Sample, block_sizes};
use cuehost_plugin::{
    AudioBuffer, EventBuffer, ParamChange, ParameterInfo, Plugin, PluginDescriptor, PluginError,
    PluginNotification,
};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::IsolationError;
use crate::shm::SharedMemory;

/// Frames per channel reserved in shared memory
pub const MAX_FRAMES: usize = block_sizes::MAX;

/// Maximum parameter changes per block
pub const MAX_PARAM_CHANGES: usize = 256;

/// Control messages sent from the host to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Apply the audio configuration
    Init { config: AudioConfig },

    Activate,

    Suspend,

    /// Query the parameter table
    GetParameters,

    SetParameter { id: u32, value: f32 },

    GetParameter { id: u32 },

    SaveState,

    /// Restore state; `data` is base64
    LoadState { data: String },

    SetEditorVisible { visible: bool },

    /// Shut the plugin down and exit
    Shutdown,
}

/// Messages sent from the worker to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseMessage {
    /// Plugin loaded, waiting for `Init`
    Ready { descriptor: PluginDescriptor },

    /// Request succeeded without a payload
    Ok,

    Parameters { parameters: Vec<ParameterInfo> },

    ParameterValue { id: u32, value: f32 },

    /// Saved state; `data` is base64
    State { data: String },

    Error { error: PluginError },

    /// Unsolicited; never answers a request
    Notification { notification: PluginNotification },
}

/// Atomic state flags for process synchronization
///
/// Stored in shared memory and accessed by both processes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Waiting for work
    Idle = 0,

    /// Host has written the block, worker should process
    Process = 1,

    /// Worker has finished, host can read outputs
    Done = 2,

    /// Worker gave up on the block
    Crashed = 3,
}

impl ProcessState {
    #[allow(clippy::match_same_arms)]
    pub fn from_u32(val: u32) -> Self {
        match val {
            0 => Self::Idle,
            1 => Self::Process,
            2 => Self::Done,
            3 => Self::Crashed,
            _ => Self::Idle, // Default to Idle for unknown values
        }
    }
}

/// `status` word values
const STATUS_OK: u32 = 0;
const STATUS_ERROR: u32 = 1;

/// One parameter change in shared memory
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ParamSlot {
    pub id: u32,
    pub value: f32,
}

/// Shared memory layout for audio processing
///
/// All-zero bytes are a valid value (state `Idle`, silence), so a freshly
/// truncated region needs no initialization. The sample arrays are only
/// touched by the side that currently owns the block per `state`.
#[repr(C)]
pub struct SharedAudioBuffer {
    state: AtomicU32,
    frame_count: AtomicU32,
    input_channels: AtomicU32,
    output_channels: AtomicU32,
    change_count: AtomicU32,
    status: AtomicU32,
    changes: UnsafeCell<[ParamSlot; MAX_PARAM_CHANGES]>,
    inputs: UnsafeCell<[[Sample; MAX_FRAMES]; MAX_CHANNELS]>,
    outputs: UnsafeCell<[[Sample; MAX_FRAMES]; MAX_CHANNELS]>,
}

impl SharedAudioBuffer {
    pub fn state(&self) -> ProcessState {
        ProcessState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ProcessState) {
        self.state.store(state as u32, Ordering::Release);
    }
}

/// Typed access to the shared block of one isolated instance.
pub struct AudioTransport {
    shm: SharedMemory,
}

impl AudioTransport {
    /// Host side: create the region.
    pub fn create(name: &str) -> Result<Self, IsolationError> {
        let shm = SharedMemory::create(name, std::mem::size_of::<SharedAudioBuffer>())?;
        Ok(Self { shm })
    }

    /// Worker side: open the host's region.
    pub fn open(name: &str) -> Result<Self, IsolationError> {
        let shm = SharedMemory::open(name, std::mem::size_of::<SharedAudioBuffer>())?;
        Ok(Self { shm })
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    #[allow(unsafe_code)]
    fn shared(&self) -> &SharedAudioBuffer {
        // SAFETY: the region is mmap'd page-aligned with at least
        // size_of::<SharedAudioBuffer>() bytes (checked on open), and any
        // byte pattern the peer can produce is valid for every field.
        unsafe { self.shm.as_ref::<SharedAudioBuffer>() }
    }

    pub fn state(&self) -> ProcessState {
        self.shared().state()
    }

    pub fn set_state(&self, state: ProcessState) {
        self.shared().set_state(state);
    }

    /// Host side: publish one block and hand it to the worker.
    ///
    /// Changes beyond [`MAX_PARAM_CHANGES`] are dropped.
    #[allow(unsafe_code)]
    pub fn submit(
        &mut self,
        inputs: &[&[Sample]],
        output_channels: usize,
        frames: usize,
        events: &EventBuffer,
    ) {
        let shared = self.shared();
        let frames = frames.min(MAX_FRAMES);

        // SAFETY: state is Idle, so the worker does not touch the arrays
        // until we store Process below.
        let (changes, input_data) =
            unsafe { (&mut *shared.changes.get(), &mut *shared.inputs.get()) };

        let mut count = 0;
        for (slot, change) in changes.iter_mut().zip(events.iter()) {
            *slot = ParamSlot {
                id: change.id,
                value: change.value,
            };
            count += 1;
        }
        let input_channels = inputs.len().min(MAX_CHANNELS);
        for (dest, src) in input_data.iter_mut().zip(&inputs[..input_channels]) {
            dest[..frames].copy_from_slice(&src[..frames]);
        }

        shared.change_count.store(count as u32, Ordering::Relaxed);
        shared.frame_count.store(frames as u32, Ordering::Relaxed);
        shared.input_channels.store(input_channels as u32, Ordering::Relaxed);
        shared
            .output_channels
            .store(output_channels.min(MAX_CHANNELS) as u32, Ordering::Relaxed);
        shared.status.store(STATUS_OK, Ordering::Relaxed);
        shared.set_state(ProcessState::Process);
    }

    /// Host side: spin until the worker leaves `Process`, `exited` is set,
    /// or `deadline` passes. Returns the state observed last.
    pub fn wait(&self, deadline: Instant, exited: &AtomicBool) -> ProcessState {
        let shared = self.shared();
        let mut spins = 0_u32;
        loop {
            let state = shared.state();
            if state != ProcessState::Process
                || exited.load(Ordering::Acquire)
                || Instant::now() >= deadline
            {
                return state;
            }
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Host side: copy a finished block out and release it.
    ///
    /// Returns `false` if the plugin reported an error for the block.
    #[allow(unsafe_code)]
    pub fn collect(&mut self, outputs: &mut [&mut [Sample]], frames: usize) -> bool {
        let shared = self.shared();
        let frames = frames.min(MAX_FRAMES);
        // SAFETY: state is Done, the worker has released the arrays.
        let output_data = unsafe { &*shared.outputs.get() };
        for (dest, src) in outputs.iter_mut().zip(output_data.iter()) {
            dest[..frames].copy_from_slice(&src[..frames]);
        }
        let ok = shared.status.load(Ordering::Relaxed) == STATUS_OK;
        shared.set_state(ProcessState::Idle);
        ok
    }

    /// Worker side: whether a block is waiting.
    pub fn pending(&self) -> bool {
        self.state() == ProcessState::Process
    }

    /// Worker side: run the pending block through `plugin` and mark it done.
    #[allow(unsafe_code)]
    pub fn serve(&mut self, plugin: &mut dyn Plugin, events: &mut EventBuffer) {
        let shared = self.shared();
        let frames = (shared.frame_count.load(Ordering::Relaxed) as usize).min(MAX_FRAMES);
        let input_channels =
            (shared.input_channels.load(Ordering::Relaxed) as usize).min(MAX_CHANNELS);
        let output_channels =
            (shared.output_channels.load(Ordering::Relaxed) as usize).min(MAX_CHANNELS);
        let change_count =
            (shared.change_count.load(Ordering::Relaxed) as usize).min(MAX_PARAM_CHANGES);

        // SAFETY: state is Process, the host does not touch the arrays until
        // we store Done. Inputs, outputs and changes are distinct cells.
        let (changes, input_data, output_data) = unsafe {
            (
                &*shared.changes.get(),
                &*shared.inputs.get(),
                &mut *shared.outputs.get(),
            )
        };

        events.clear();
        for slot in &changes[..change_count] {
            events.push(ParamChange {
                id: slot.id,
                value: slot.value,
                sample_offset: 0,
            });
        }

        let input_refs: SmallVec<[&[Sample]; MAX_CHANNELS]> = input_data[..input_channels]
            .iter()
            .map(|channel| &channel[..frames])
            .collect();
        let mut output_refs: SmallVec<[&mut [Sample]; MAX_CHANNELS]> = output_data
            [..output_channels]
            .iter_mut()
            .map(|channel| &mut channel[..frames])
            .collect();
        let mut audio = AudioBuffer {
            inputs: &input_refs,
            outputs: &mut output_refs,
            frames,
        };

        let status = match plugin.process(&mut audio, events) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                tracing::warn!("Plugin process failed: {e}");
                STATUS_ERROR
            }
        };
        shared.status.store(status, Ordering::Relaxed);
        shared.set_state(ProcessState::Done);
    }
}

/// Result printed by `cuehost-probe`
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ScanResult {
    #[serde(rename = "success")]
    Success { plugin: PluginDescriptor },

    #[serde(rename = "error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::unique_name;
    use cuehost_engine::builtin::gain::{GAIN, GainProcessor};
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    fn test_process_state_conversion() {
        assert_eq!(ProcessState::from_u32(0), ProcessState::Idle);
        assert_eq!(ProcessState::from_u32(1), ProcessState::Process);
        assert_eq!(ProcessState::from_u32(2), ProcessState::Done);
        assert_eq!(ProcessState::from_u32(3), ProcessState::Crashed);
        assert_eq!(ProcessState::from_u32(999), ProcessState::Idle); // Unknown defaults to Idle
    }

    #[test]
    fn test_control_wire_format() {
        let json = serde_json::to_string(&ControlMessage::SetParameter { id: 3, value: 0.5 })
            .unwrap();
        assert_eq!(json, r#"{"SetParameter":{"id":3,"value":0.5}}"#);
        assert_eq!(serde_json::to_string(&ControlMessage::Activate).unwrap(), r#""Activate""#);

        let error = ResponseMessage::Error {
            error: PluginError::Unsupported("no editor".into()),
        };
        let back: ResponseMessage =
            serde_json::from_str(&serde_json::to_string(&error).unwrap()).unwrap();
        assert_eq!(back, error);
    }

    #[test]
    fn test_scan_result_is_tagged() {
        let json = serde_json::to_value(ScanResult::Error {
            message: "nope".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "nope");
    }

    #[test]
    #[serial]
    fn test_block_exchange_between_mappings() {
        let name = unique_name();
        let mut host = AudioTransport::create(&name).unwrap();
        let mut worker = AudioTransport::open(&name).unwrap();
        assert_eq!(host.state(), ProcessState::Idle);
        assert!(!worker.pending());

        let left = vec![1.0_f32; 32];
        let right = vec![-1.0_f32; 32];
        let mut events = EventBuffer::new();
        events.push(ParamChange {
            id: GAIN,
            value: 0.5,
            sample_offset: 0,
        });
        host.submit(&[&left, &right], 2, 32, &events);
        assert!(worker.pending());

        let mut plugin = GainProcessor::default();
        worker.serve(&mut plugin, &mut EventBuffer::new());

        let exited = AtomicBool::new(false);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(host.wait(deadline, &exited), ProcessState::Done);

        let mut out_l = vec![0.0_f32; 32];
        let mut out_r = vec![0.0_f32; 32];
        assert!(host.collect(&mut [&mut out_l, &mut out_r], 32));
        assert!(out_l.iter().all(|&s| s == 0.5));
        assert!(out_r.iter().all(|&s| s == -0.5));
        assert_eq!(host.state(), ProcessState::Idle);
    }

    #[test]
    #[serial]
    fn test_wait_gives_up_at_deadline() {
        let mut host = AudioTransport::create(&unique_name()).unwrap();
        host.submit(&[], 0, 16, &EventBuffer::new());
        let exited = AtomicBool::new(false);
        assert_eq!(host.wait(Instant::now(), &exited), ProcessState::Process);

        exited.store(true, Ordering::Release);
        let far = Instant::now() + Duration::from_secs(60);
        assert_eq!(host.wait(far, &exited), ProcessState::Process);
    }
}
