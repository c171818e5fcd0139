//! Worker side of the fault boundary.
//!
//! `cuehost-worker` hosts exactly one plugin. It answers control messages
//! from stdin in order, serves audio blocks from shared memory between
//! them, and forwards the plugin's own notifications as unsolicited lines.
//! If the plugin crashes the process dies with it, and the host sees EOF.

use std::io::{BufRead, Write};
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use cuehost_plugin::{EventBuffer, Plugin, PluginDescriptor, PluginError, PluginNotification};

use crate::ipc::{AudioTransport, ControlMessage, ResponseMessage};
use crate::stdio::{protocol_stdout, write_line};
use crate::{IsolationError, native};

/// After a block, keep spinning for the next one this long before
/// falling back to sleeping polls.
const HOT_WINDOW: Duration = Duration::from_millis(50);

/// Poll interval while no audio is flowing
const IDLE_POLL: Duration = Duration::from_millis(1);

/// One line read from stdin
type Incoming = Result<ControlMessage, String>;

/// Plugin plus its shared-memory block
pub struct Worker {
    plugin: Box<dyn Plugin>,
    transport: AudioTransport,
    events: EventBuffer,
    notifications: Option<Receiver<PluginNotification>>,
    last_block: Option<Instant>,
}

impl Worker {
    pub fn new(plugin: Box<dyn Plugin>, transport: AudioTransport) -> Self {
        let notifications = plugin.notifications();
        Self {
            plugin,
            transport,
            events: EventBuffer::new(),
            notifications,
            last_block: None,
        }
    }

    /// Answer one control message. `Shutdown` shuts the plugin down; the
    /// caller stops reading afterwards.
    pub fn handle(&mut self, message: ControlMessage) -> ResponseMessage {
        match self.dispatch(message) {
            Ok(response) => response,
            Err(error) => ResponseMessage::Error { error },
        }
    }

    fn dispatch(&mut self, message: ControlMessage) -> Result<ResponseMessage, PluginError> {
        let plugin = &mut self.plugin;
        Ok(match message {
            ControlMessage::Init { config } => {
                plugin.initialize(&config)?;
                ResponseMessage::Ok
            }
            ControlMessage::Activate => {
                plugin.activate()?;
                ResponseMessage::Ok
            }
            ControlMessage::Suspend => {
                plugin.suspend()?;
                ResponseMessage::Ok
            }
            ControlMessage::GetParameters => ResponseMessage::Parameters {
                parameters: plugin.parameters(),
            },
            ControlMessage::SetParameter { id, value } => ResponseMessage::ParameterValue {
                id,
                value: plugin.set_parameter(id, value)?,
            },
            ControlMessage::GetParameter { id } => ResponseMessage::ParameterValue {
                id,
                value: plugin.get_parameter(id)?,
            },
            ControlMessage::SaveState => ResponseMessage::State {
                data: BASE64.encode(plugin.save_state()?),
            },
            ControlMessage::LoadState { data } => {
                let bytes = BASE64
                    .decode(data)
                    .map_err(|e| PluginError::InvalidParameter(format!("Invalid state: {e}")))?;
                plugin.load_state(&bytes)?;
                ResponseMessage::Ok
            }
            ControlMessage::SetEditorVisible { visible } => {
                plugin.set_editor_visible(visible)?;
                ResponseMessage::Ok
            }
            ControlMessage::Shutdown => {
                plugin.shutdown();
                ResponseMessage::Ok
            }
        })
    }

    /// Serve the pending audio block, if any.
    pub fn serve_pending_block(&mut self) -> bool {
        if !self.transport.pending() {
            return false;
        }
        self.transport.serve(self.plugin.as_mut(), &mut self.events);
        self.last_block = Some(Instant::now());
        true
    }

    fn hot(&self) -> bool {
        self.last_block.is_some_and(|t| t.elapsed() < HOT_WINDOW)
    }

    fn forward_notifications(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let Some(notifications) = &self.notifications else {
            return Ok(());
        };
        while let Ok(notification) = notifications.try_recv() {
            write_line(out, &ResponseMessage::Notification { notification })?;
        }
        Ok(())
    }

    /// Serve control messages and audio blocks until `Shutdown` or EOF.
    pub fn run(mut self, incoming: &Receiver<Incoming>, out: &mut dyn Write) -> std::io::Result<()> {
        loop {
            self.serve_pending_block();
            self.forward_notifications(out)?;

            let next = if self.hot() {
                match incoming.try_recv() {
                    Ok(line) => Some(line),
                    Err(TryRecvError::Empty) => {
                        std::hint::spin_loop();
                        None
                    }
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match incoming.recv_timeout(IDLE_POLL) {
                    Ok(line) => Some(line),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            match next {
                None => {}
                Some(Ok(ControlMessage::Shutdown)) => {
                    let response = self.handle(ControlMessage::Shutdown);
                    write_line(out, &response)?;
                    return Ok(());
                }
                Some(Ok(message)) => write_line(out, &self.handle(message))?,
                Some(Err(parse_error)) => write_line(
                    out,
                    &ResponseMessage::Error {
                        error: PluginError::InvalidParameter(parse_error),
                    },
                )?,
            }
        }

        tracing::info!("Host closed the control pipe, shutting down");
        self.plugin.shutdown();
        Ok(())
    }
}

/// Read control messages from stdin on a dedicated thread.
fn spawn_stdin_reader() -> Result<Receiver<Incoming>, IsolationError> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("control-reader".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let message = serde_json::from_str::<ControlMessage>(&line)
                    .map_err(|e| format!("Failed to parse control message: {e}"));
                if tx.send(message).is_err() {
                    break;
                }
            }
        })
        .map_err(|source| IsolationError::Spawn {
            exe: "control-reader thread".into(),
            source,
        })?;
    Ok(rx)
}

/// Entry point of `cuehost-worker`.
///
/// Load failures are reported to the host as an `Error` line before
/// returning.
pub fn serve(descriptor_json: &str, shm_name: &str) -> anyhow::Result<()> {
    use anyhow::Context as _;

    let mut out = protocol_stdout().context("Failed to take protocol stdout")?;

    let setup = || -> Result<Worker, PluginError> {
        let descriptor: PluginDescriptor = serde_json::from_str(descriptor_json)
            .map_err(|e| PluginError::InitializationFailed(format!("Invalid descriptor: {e}")))?;
        let transport = AudioTransport::open(shm_name)?;
        let plugin = native::instantiate(&descriptor)?;
        Ok(Worker::new(plugin, transport))
    };

    let worker = match setup() {
        Ok(worker) => worker,
        Err(error) => {
            write_line(out.as_mut(), &ResponseMessage::Error { error: error.clone() })?;
            return Err(error).context("Failed to load plugin");
        }
    };

    let descriptor = worker.plugin.descriptor().clone();
    tracing::info!("Worker ready: {} ({})", descriptor.name, descriptor.id);
    write_line(out.as_mut(), &ResponseMessage::Ready { descriptor })?;

    let incoming = spawn_stdin_reader()?;
    worker.run(&incoming, out.as_mut())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::unique_name;
    use cuehost_core::AudioConfig;
    use cuehost_engine::builtin;
    use serial_test::serial;

    fn worker(id: &str) -> (Worker, AudioTransport) {
        let name = unique_name();
        let host = AudioTransport::create(&name).unwrap();
        let plugin = builtin::create(id).unwrap();
        (Worker::new(plugin, AudioTransport::open(&name).unwrap()), host)
    }

    #[test]
    #[serial]
    fn test_control_messages() {
        let (mut worker, _host) = worker("builtin:gain");
        let config = AudioConfig::default();
        assert_eq!(worker.handle(ControlMessage::Init { config }), ResponseMessage::Ok);
        assert_eq!(worker.handle(ControlMessage::Activate), ResponseMessage::Ok);
        assert_eq!(
            worker.handle(ControlMessage::SetParameter { id: 0, value: 5.0 }),
            ResponseMessage::ParameterValue { id: 0, value: 2.0 }
        );
        assert!(matches!(
            worker.handle(ControlMessage::GetParameter { id: 9 }),
            ResponseMessage::Error {
                error: PluginError::InvalidParameter(_)
            }
        ));
        assert!(matches!(
            worker.handle(ControlMessage::SetEditorVisible { visible: true }),
            ResponseMessage::Error {
                error: PluginError::Unsupported(_)
            }
        ));
    }

    #[test]
    #[serial]
    fn test_state_travels_as_base64() {
        let (mut worker, _host) = worker("builtin:gain");
        worker.handle(ControlMessage::SetParameter { id: 0, value: 1.5 });
        let ResponseMessage::State { data } = worker.handle(ControlMessage::SaveState) else {
            panic!("expected state");
        };
        worker.handle(ControlMessage::SetParameter { id: 0, value: 0.1 });
        assert_eq!(
            worker.handle(ControlMessage::LoadState { data }),
            ResponseMessage::Ok
        );
        assert_eq!(
            worker.handle(ControlMessage::GetParameter { id: 0 }),
            ResponseMessage::ParameterValue { id: 0, value: 1.5 }
        );
        assert!(matches!(
            worker.handle(ControlMessage::LoadState {
                data: "%%%".to_string()
            }),
            ResponseMessage::Error { .. }
        ));
    }

    #[test]
    #[serial]
    fn test_run_serves_until_shutdown() {
        let (worker, _host) = worker("builtin:gain");
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(Ok(ControlMessage::GetParameters)).unwrap();
        tx.send(Err("garbage".to_string())).unwrap();
        tx.send(Ok(ControlMessage::Shutdown)).unwrap();

        let mut out = Vec::new();
        worker.run(&rx, &mut out).unwrap();

        let lines: Vec<ResponseMessage> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert!(matches!(&lines[0], ResponseMessage::Parameters { parameters } if parameters.len() == 1));
        assert!(matches!(lines[1], ResponseMessage::Error { .. }));
        assert_eq!(lines[2], ResponseMessage::Ok);
    }

    #[test]
    #[serial]
    fn test_run_exits_on_eof() {
        let (worker, _host) = worker("builtin:sine");
        let (tx, rx) = crossbeam_channel::unbounded::<Incoming>();
        drop(tx);
        let mut out = Vec::new();
        worker.run(&rx, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
