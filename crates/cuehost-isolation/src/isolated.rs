//! Host side of the fault boundary.
//!
//! `IsolatedPlugin` implements `Plugin` by driving a `cuehost-worker`
//! subprocess: control calls become JSON request lines answered in order,
//! `process` goes through the shared-memory block. If the worker dies, every
//! later call fails with `PluginError::Fault` and a `Crashed` notification
//! is raised.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use cuehost_core::AudioConfig;
use cuehost_plugin::{
    AudioBuffer, EventBuffer, ParameterInfo, Plugin, PluginDescriptor, PluginError,
    PluginNotification,
};

use crate::IsolationError;
use crate::ipc::{AudioTransport, ControlMessage, MAX_FRAMES, ProcessState, ResponseMessage};
use crate::shm::unique_name;

/// Time the worker gets to load the plugin and answer `Ready`
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Floor of the per-block processing deadline
const MIN_PROCESS_DEADLINE: Duration = Duration::from_millis(250);

/// Grace period for a clean exit after `Shutdown`
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

const NOTIFICATION_CAPACITY: usize = 1024;

/// Plugin hosted in a worker subprocess
pub struct IsolatedPlugin {
    descriptor: PluginDescriptor,
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<ResponseMessage>,
    notifications: Receiver<PluginNotification>,
    /// Set by the reader thread when the worker's stdout closes
    exited: Arc<AtomicBool>,
    /// Set before a deliberate shutdown so EOF is not reported as a crash
    closing: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    transport: AudioTransport,
    parameters: Vec<ParameterInfo>,
    request_timeout: Duration,
    process_deadline: Duration,
    shut_down: bool,
}

impl IsolatedPlugin {
    /// Spawn `worker_exe` for `descriptor` and wait until the plugin is loaded.
    pub fn spawn(
        worker_exe: &Path,
        descriptor: &PluginDescriptor,
        request_timeout: Duration,
    ) -> Result<Self, PluginError> {
        let transport = AudioTransport::create(&unique_name())?;
        let descriptor_json = serde_json::to_string(descriptor).map_err(|e| {
            PluginError::InitializationFailed(format!("Failed to encode descriptor: {e}"))
        })?;

        let mut child = Command::new(worker_exe)
            .arg("--descriptor")
            .arg(&descriptor_json)
            .arg("--shm")
            .arg(transport.name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| IsolationError::Spawn {
                exe: worker_exe.to_path_buf(),
                source,
            })?;
        tracing::info!("Spawned worker {} for {}", child.id(), descriptor.id);

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PluginError::InitializationFailed(
                "Worker pipes unavailable".to_string(),
            ));
        };

        let (reply_tx, replies) = crossbeam_channel::unbounded();
        let (notification_tx, notifications) = crossbeam_channel::bounded(NOTIFICATION_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));

        let reader = thread::Builder::new()
            .name(format!("worker-{}", child.id()))
            .spawn({
                let exited = Arc::clone(&exited);
                let closing = Arc::clone(&closing);
                move || read_worker(stdout, &reply_tx, &notification_tx, &exited, &closing)
            });
        let reader = match reader {
            Ok(reader) => reader,
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(IsolationError::Spawn {
                    exe: "worker reader thread".into(),
                    source,
                }
                .into());
            }
        };

        let mut plugin = Self {
            descriptor: descriptor.clone(),
            child,
            stdin,
            replies,
            notifications,
            exited,
            closing,
            reader: Some(reader),
            transport,
            parameters: Vec::new(),
            request_timeout,
            process_deadline: MIN_PROCESS_DEADLINE,
            shut_down: false,
        };

        // Dropping `plugin` on error reaps the worker.
        match plugin.receive(LOAD_TIMEOUT)? {
            ResponseMessage::Ready { .. } => Ok(plugin),
            other => Err(unexpected(&other).into()),
        }
    }

    fn send(&mut self, message: &ControlMessage) -> Result<(), PluginError> {
        if self.exited.load(Ordering::Acquire) {
            return Err(IsolationError::WorkerExited.into());
        }
        let json = serde_json::to_string(message)
            .map_err(|e| IsolationError::Protocol(format!("Failed to encode request: {e}")))?;
        writeln!(self.stdin, "{json}")
            .and_then(|()| self.stdin.flush())
            .map_err(|_| IsolationError::WorkerExited)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<ResponseMessage, PluginError> {
        match self.replies.recv_timeout(timeout) {
            Ok(ResponseMessage::Error { error }) => Err(error),
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                // A late reply would pair with the next request; the worker
                // cannot be trusted any more.
                tracing::error!("Worker for {} timed out, killing it", self.descriptor.id);
                self.kill();
                Err(IsolationError::Timeout(timeout).into())
            }
            Err(RecvTimeoutError::Disconnected) => Err(IsolationError::WorkerExited.into()),
        }
    }

    fn request(&mut self, message: &ControlMessage) -> Result<ResponseMessage, PluginError> {
        self.send(message)?;
        self.receive(self.request_timeout)
    }

    fn request_ok(&mut self, message: &ControlMessage) -> Result<(), PluginError> {
        match self.request(message)? {
            ResponseMessage::Ok => Ok(()),
            other => Err(unexpected(&other).into()),
        }
    }

    fn refresh_parameters(&mut self) -> Result<(), PluginError> {
        match self.request(&ControlMessage::GetParameters)? {
            ResponseMessage::Parameters { parameters } => {
                self.parameters = parameters;
                Ok(())
            }
            other => Err(unexpected(&other).into()),
        }
    }

    fn expect_value(&mut self, message: &ControlMessage) -> Result<f32, PluginError> {
        match self.request(message)? {
            ResponseMessage::ParameterValue { value, .. } => Ok(value),
            other => Err(unexpected(&other).into()),
        }
    }

    fn kill(&mut self) {
        self.closing.store(true, Ordering::Release);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Whether the worker process is still running
    pub fn is_alive(&mut self) -> bool {
        !self.exited.load(Ordering::Acquire) && matches!(self.child.try_wait(), Ok(None))
    }

    pub fn worker_pid(&self) -> u32 {
        self.child.id()
    }
}

fn unexpected(response: &ResponseMessage) -> IsolationError {
    IsolationError::Protocol(format!("Unexpected response: {response:?}"))
}

/// Route worker output until EOF. Replies go to the requester, notifications
/// to whoever polls the instance.
fn read_worker(
    stdout: impl std::io::Read,
    replies: &Sender<ResponseMessage>,
    notifications: &Sender<PluginNotification>,
    exited: &AtomicBool,
    closing: &AtomicBool,
) {
    for line in BufReader::new(stdout).lines() {
        let Ok(line) = line else { break };
        match serde_json::from_str::<ResponseMessage>(&line) {
            Ok(ResponseMessage::Notification { notification }) => {
                let _ = notifications.try_send(notification);
            }
            Ok(response) => {
                if replies.send(response).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!("Ignoring malformed worker line ({e}): {line}"),
        }
    }

    exited.store(true, Ordering::Release);
    if !closing.load(Ordering::Acquire) {
        tracing::error!("Plugin worker exited unexpectedly");
        let _ = notifications.try_send(PluginNotification::Crashed {
            message: "plugin worker exited unexpectedly".to_string(),
        });
    }
}

impl Plugin for IsolatedPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn initialize(&mut self, config: &AudioConfig) -> Result<(), PluginError> {
        if config.block_size > MAX_FRAMES {
            return Err(PluginError::InitializationFailed(format!(
                "Block size {} exceeds shared buffer capacity {MAX_FRAMES}",
                config.block_size
            )));
        }
        self.request_ok(&ControlMessage::Init { config: *config })?;
        self.process_deadline = (config.block_duration() * 4).max(MIN_PROCESS_DEADLINE);
        self.refresh_parameters()?;
        tracing::debug!(
            "Isolated plugin '{}' has {} parameters",
            self.descriptor.name,
            self.parameters.len()
        );
        Ok(())
    }

    fn activate(&mut self) -> Result<(), PluginError> {
        self.request_ok(&ControlMessage::Activate)
    }

    fn suspend(&mut self) -> Result<(), PluginError> {
        self.request_ok(&ControlMessage::Suspend)
    }

    fn process(&mut self, audio: &mut AudioBuffer, events: &EventBuffer) -> Result<(), PluginError> {
        if self.exited.load(Ordering::Acquire) {
            return Err(PluginError::Fault("plugin worker has exited".to_string()));
        }
        let frames = audio.frames;
        if frames > MAX_FRAMES {
            return Err(PluginError::ProcessingFailed(format!(
                "Frame count {frames} exceeds maximum buffer size {MAX_FRAMES}"
            )));
        }

        self.transport
            .submit(audio.inputs, audio.outputs.len(), frames, events);
        let deadline = Instant::now() + self.process_deadline;
        match self.transport.wait(deadline, &self.exited) {
            ProcessState::Done => {
                if self.transport.collect(audio.outputs, frames) {
                    Ok(())
                } else {
                    Err(PluginError::ProcessingFailed(
                        "plugin rejected the block".to_string(),
                    ))
                }
            }
            ProcessState::Process if !self.exited.load(Ordering::Acquire) => {
                Err(PluginError::Fault(format!(
                    "plugin missed the {:?} processing deadline",
                    self.process_deadline
                )))
            }
            _ => Err(PluginError::Fault(
                "plugin worker died during processing".to_string(),
            )),
        }
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        self.parameters.clone()
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<f32, PluginError> {
        self.expect_value(&ControlMessage::SetParameter { id, value })
    }

    fn get_parameter(&mut self, id: u32) -> Result<f32, PluginError> {
        self.expect_value(&ControlMessage::GetParameter { id })
    }

    fn save_state(&mut self) -> Result<Vec<u8>, PluginError> {
        match self.request(&ControlMessage::SaveState)? {
            ResponseMessage::State { data } => BASE64
                .decode(data)
                .map_err(|e| IsolationError::Protocol(format!("Invalid state encoding: {e}")).into()),
            other => Err(unexpected(&other).into()),
        }
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), PluginError> {
        self.request_ok(&ControlMessage::LoadState {
            data: BASE64.encode(data),
        })?;
        self.refresh_parameters()
    }

    fn set_editor_visible(&mut self, visible: bool) -> Result<(), PluginError> {
        self.request_ok(&ControlMessage::SetEditorVisible { visible })
    }

    fn notifications(&self) -> Option<Receiver<PluginNotification>> {
        Some(self.notifications.clone())
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.closing.store(true, Ordering::Release);

        if !self.exited.load(Ordering::Acquire)
            && self.send(&ControlMessage::Shutdown).is_ok()
        {
            // Wait for the worker to exit gracefully so it stops touching
            // shared memory before the region is unlinked.
            let start = Instant::now();
            while start.elapsed() < SHUTDOWN_GRACE {
                if matches!(self.child.try_wait(), Ok(Some(_))) {
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }

        if matches!(self.child.try_wait(), Ok(None)) {
            tracing::warn!("Worker {} ignored shutdown, killing it", self.child.id());
        }
        self.kill();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for IsolatedPlugin {
    fn drop(&mut self) {
        self.shutdown();
    }
}
