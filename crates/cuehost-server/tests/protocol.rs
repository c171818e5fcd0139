//! End-to-end protocol tests.
//!
//! Each test drives a real `Server` through in-memory pipes, using the
//! builtin plugins in-process so no third-party plugin or worker binary is
//! needed.

use std::collections::VecDeque;
use std::io::{self, BufReader, Read, Write};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use cuehost_core::AudioConfig;
use cuehost_plugin::{
    AudioBuffer, EventBuffer, ParameterInfo, Plugin, PluginDescriptor, PluginError, PluginFormat,
    PluginNotification,
};
use cuehost_server::{HostConfig, Server};
use cuehost_session::{BuiltinFactory, Catalog, InProcessProber, PluginFactory};
use serde_json::{Value, json};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Blocking reader over chunks sent from the test; EOF when the sender drops.
struct PipeReader {
    chunks: Receiver<Vec<u8>>,
    current: io::Cursor<Vec<u8>>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.current.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            match self.chunks.recv() {
                Ok(chunk) => self.current = io::Cursor::new(chunk),
                Err(_) => return Ok(0),
            }
        }
    }
}

struct PipeWriter(Sender<Vec<u8>>);

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A running host plus the controller's side of its stdio.
struct Host {
    input: Option<Sender<Vec<u8>>>,
    output: Receiver<Vec<u8>>,
    partial: Vec<u8>,
    backlog: VecDeque<Value>,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Host {
    fn start() -> Self {
        Self::with_factory(Box::new(BuiltinFactory), Vec::new())
    }

    fn with_factory(factory: Box<dyn PluginFactory>, extra: Vec<PluginDescriptor>) -> Self {
        let config = HostConfig {
            workers: 4,
            event_poll_ms: 5,
            scan_paths: Vec::new(),
            ..HostConfig::default()
        };
        let catalog = Catalog::new(Box::new(InProcessProber), true);
        for descriptor in extra {
            catalog.insert(descriptor);
        }
        let server = Server::with_parts(config, catalog, factory);

        let (input, chunks) = crossbeam_channel::unbounded();
        let (out_tx, output) = crossbeam_channel::unbounded();
        let reader = BufReader::new(PipeReader {
            chunks,
            current: io::Cursor::new(Vec::new()),
        });
        let thread = std::thread::spawn(move || server.run(reader, PipeWriter(out_tx)));

        Self {
            input: Some(input),
            output,
            partial: Vec::new(),
            backlog: VecDeque::new(),
            thread: Some(thread),
        }
    }

    fn send_raw(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.input.as_ref().unwrap().send(bytes).unwrap();
    }

    fn send(&self, id: impl Into<Value>, command: &str, params: Value) {
        let request = json!({ "id": id.into(), "command": command, "params": params });
        self.send_raw(&request.to_string());
    }

    /// Next line from the host, skipping nothing.
    fn read_line(&mut self) -> Option<Value> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.partial.drain(..=pos).collect();
                return Some(serde_json::from_slice(&line).expect("host wrote invalid JSON"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.output.recv_timeout(remaining) {
                Ok(chunk) => self.partial.extend_from_slice(&chunk),
                Err(_) => return None,
            }
        }
    }

    fn next_matching(&mut self, matches: impl Fn(&Value) -> bool) -> Value {
        if let Some(pos) = self.backlog.iter().position(&matches) {
            return self.backlog.remove(pos).unwrap();
        }
        loop {
            let line = self.read_line().expect("timed out waiting for the host");
            if matches(&line) {
                return line;
            }
            self.backlog.push_back(line);
        }
    }

    fn response(&mut self, id: impl Into<Value>) -> Value {
        let id = id.into();
        self.next_matching(|line| line.get("id") == Some(&id))
    }

    fn event(&mut self, name: &str) -> Value {
        self.next_matching(|line| line["event"] == name)
    }

    fn request(&mut self, id: impl Into<Value>, command: &str, params: Value) -> Value {
        let id = id.into();
        self.send(id.clone(), command, params);
        self.response(id)
    }

    fn result(&mut self, id: impl Into<Value>, command: &str, params: Value) -> Value {
        let response = self.request(id, command, params);
        assert!(
            response.get("error").is_none(),
            "{command} failed: {response}"
        );
        response["result"].clone()
    }

    fn load(&mut self, id: &str) -> u64 {
        let result = self.result(format!("load-{id}"), "loadPlugin", json!({ "id": id }));
        result["handle"].as_u64().unwrap()
    }

    /// Close stdin and wait for the host to exit. Returns every line it
    /// wrote that was not consumed yet.
    fn finish(mut self) -> (anyhow::Result<()>, Vec<Value>) {
        self.input.take();
        let status = self.thread.take().unwrap().join().unwrap();
        let mut rest: Vec<Value> = self.backlog.drain(..).collect();
        while let Some(line) = self.read_line() {
            rest.push(line);
        }
        (status, rest)
    }
}

fn error_code(response: &Value) -> &str {
    response["error"]["code"].as_str().unwrap_or_default()
}

#[test]
fn test_scan_of_empty_directory_finds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut host = Host::start();

    let scanned = host.result(1, "scanPlugins", json!({ "paths": [dir.path()] }));
    assert_eq!(scanned["plugins"], json!([]));

    let listed = host.result(2, "listPlugins", json!({}));
    let ids: Vec<&str> = listed["plugins"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["builtin:fault", "builtin:gain", "builtin:sine"]);

    assert!(host.finish().0.is_ok());
}

#[test]
fn test_unknown_plugin_fails_to_load() {
    let mut host = Host::start();
    let response = host.request("a", "loadPlugin", json!({ "id": "vst3:missing" }));
    assert_eq!(error_code(&response), "PluginLoadFailed");

    let response = host.request("b", "activate", json!({ "handle": 1 }));
    assert_eq!(error_code(&response), "UnknownHandle");
    host.finish().0.unwrap();
}

#[test]
fn test_parameter_values_are_clamped() {
    let mut host = Host::start();
    let handle = host.load("builtin:sine");

    let set = host.result(
        1,
        "setParameter",
        json!({ "handle": handle, "paramId": 1, "value": 2.0 }),
    );
    assert_eq!(set["value"], json!(1.0));
    let get = host.result(2, "getParameter", json!({ "handle": handle, "paramId": 1 }));
    assert_eq!(get["value"], json!(1.0));

    let bad = host.request(
        3,
        "setParameter",
        json!({ "handle": handle, "paramId": 99, "value": 0.5 }),
    );
    assert_eq!(error_code(&bad), "InvalidParameter");
    host.finish().0.unwrap();
}

#[test]
fn test_malformed_lines_do_not_stop_the_host() {
    let mut host = Host::start();
    host.send_raw("{this is not json");
    host.send_raw(r#"{"id":1,"command":"frobnicate"}"#);
    host.send_raw(r#"{"id":2,"command":"activate","params":{"handle":"one"}}"#);
    host.send_raw(r#"{"id":3,"command":"listPlugins"}"#);

    let parse = host.next_matching(|line| line.get("id") == Some(&Value::Null));
    assert_eq!(error_code(&parse), "ParseError");
    assert_eq!(error_code(&host.response(1)), "UnknownCommand");
    assert_eq!(error_code(&host.response(2)), "InvalidRequest");
    assert!(host.response(3)["result"]["plugins"].is_array());
    host.finish().0.unwrap();
}

#[test]
fn test_requests_on_one_handle_keep_their_order() {
    let mut host = Host::start();
    let handle = host.load("builtin:gain");

    for i in 0..40u32 {
        let value = f64::from(i) / 20.0;
        host.send(
            i,
            "setParameter",
            json!({ "handle": handle, "paramId": 0, "value": value }),
        );
    }
    host.send("last", "getParameter", json!({ "handle": handle, "paramId": 0 }));

    let mut ids = Vec::new();
    loop {
        let line = host.read_line().expect("timed out");
        if line["id"] == "last" {
            let value = line["result"]["value"].as_f64().unwrap();
            assert!((value - 1.95).abs() < 1e-6, "last value was {value}");
            break;
        }
        ids.push(line["id"].as_u64().unwrap());
    }
    assert_eq!(ids, (0..40).collect::<Vec<u64>>());
    host.finish().0.unwrap();
}

#[test]
fn test_plugin_fault_is_contained_to_its_instance() {
    let mut host = Host::start();
    let faulty = host.load("builtin:fault");
    let healthy = host.load("builtin:gain");
    host.result(1, "activate", json!({ "handle": faulty }));
    host.result(2, "activate", json!({ "handle": healthy }));
    host.result(
        3,
        "setParameter",
        json!({ "handle": faulty, "paramId": 0, "value": 1.0 }),
    );

    let input = json!([vec![0.25; 64], vec![0.25; 64]]);
    let crashed = host.request(
        4,
        "renderOffline",
        json!({ "handle": faulty, "inputs": input, "frameCount": 64 }),
    );
    assert_eq!(error_code(&crashed), "PluginFault");

    let crash = host.event("crash");
    assert_eq!(crash["handle"], json!(faulty));
    assert!(crash["data"]["message"].is_string());

    let info = host.result(5, "getInstanceInfo", json!({ "handle": faulty }));
    assert_eq!(info["state"], "error");
    let again = host.request(6, "activate", json!({ "handle": faulty }));
    assert_eq!(error_code(&again), "PluginFault");

    let rendered = host.result(
        7,
        "renderOffline",
        json!({ "handle": healthy, "inputs": input, "frameCount": 64 }),
    );
    assert_eq!(rendered["outputs"], input);

    // The faulted instance can still be unloaded.
    host.result(8, "unloadPlugin", json!({ "handle": faulty }));
    let (status, rest) = host.finish();
    status.unwrap();
    assert!(rest.iter().all(|line| line["event"] != "crash"));
}

#[test]
fn test_offline_render_is_deterministic() {
    let mut host = Host::start();
    let render = |host: &mut Host, tag: &str| {
        let handle = host.load("builtin:sine");
        host.result(format!("{tag}-a"), "activate", json!({ "handle": handle }));
        host.result(
            format!("{tag}-r"),
            "renderOffline",
            json!({ "handle": handle, "inputs": [], "frameCount": 1500 }),
        )["outputs"]
            .clone()
    };

    let first = render(&mut host, "one");
    let second = render(&mut host, "two");
    assert_eq!(first, second);
    assert_eq!(first.as_array().unwrap().len(), 2);
    assert!(first[0].as_array().unwrap().iter().any(|s| s.as_f64() != Some(0.0)));

    let mismatch = host.request(
        "bad",
        "renderOffline",
        json!({ "handle": 1, "inputs": [[0.0]], "frameCount": 1 }),
    );
    assert_eq!(error_code(&mismatch), "FormatMismatch");
    host.finish().0.unwrap();
}

#[test]
fn test_lifecycle_state_errors() {
    let mut host = Host::start();
    let handle = host.load("builtin:gain");

    let early = host.request(
        1,
        "renderOffline",
        json!({ "handle": handle, "inputs": [[0.0], [0.0]], "frameCount": 1 }),
    );
    assert_eq!(error_code(&early), "InvalidState");
    assert_eq!(host.result(2, "activate", json!({ "handle": handle }))["state"], "active");
    assert_eq!(host.result(3, "suspend", json!({ "handle": handle }))["state"], "suspended");

    let editor = host.request(4, "showEditor", json!({ "handle": handle }));
    assert_eq!(error_code(&editor), "Unsupported");

    host.result(5, "unloadPlugin", json!({ "handle": handle }));
    let gone = host.request(6, "getParameters", json!({ "handle": handle }));
    assert_eq!(error_code(&gone), "UnknownHandle");
    host.finish().0.unwrap();
}

#[test]
fn test_preset_round_trip_over_the_wire() {
    let mut host = Host::start();
    let handle = host.load("builtin:gain");
    host.result(1, "setParameter", json!({ "handle": handle, "paramId": 0, "value": 0.25 }));
    let saved = host.result(2, "savePreset", json!({ "handle": handle }))["data"].clone();

    host.result(3, "setParameter", json!({ "handle": handle, "paramId": 0, "value": 1.5 }));
    host.result(4, "loadPreset", json!({ "handle": handle, "data": saved }));
    let get = host.result(5, "getParameter", json!({ "handle": handle, "paramId": 0 }));
    assert_eq!(get["value"], json!(0.25));

    let garbage = host.request(6, "loadPreset", json!({ "handle": handle, "data": "%%%" }));
    assert_eq!(error_code(&garbage), "InvalidRequest");
    host.finish().0.unwrap();
}

#[test]
fn test_shutdown_answers_then_exits_cleanly() {
    let mut host = Host::start();
    let handle = host.load("builtin:gain");
    host.result(1, "activate", json!({ "handle": handle }));

    let response = host.request("bye", "shutdown", json!({}));
    assert_eq!(response["result"], json!({}));

    // Input after shutdown is never read.
    host.send_raw(r#"{"id":9,"command":"listPlugins"}"#);
    let (status, rest) = host.finish();
    status.unwrap();
    assert!(rest.iter().all(|line| line["id"] != json!(9)));
}

#[test]
fn test_eof_is_a_clean_exit() {
    let host = Host::start();
    let (status, rest) = host.finish();
    status.unwrap();
    assert!(rest.is_empty());
}

/// A fake editor-bearing plugin that reports a knob turn and a close as
/// soon as its editor opens.
struct EditorPlugin {
    descriptor: PluginDescriptor,
    notify: Sender<PluginNotification>,
    notifications: Receiver<PluginNotification>,
    mix: f32,
}

impl Plugin for EditorPlugin {
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
    fn process(&mut self, _audio: &mut AudioBuffer, _events: &EventBuffer) -> Result<(), PluginError> {
        Ok(())
    }
    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::normalized(3, "Mix", 0.5)]
    }
    fn set_parameter(&mut self, _id: u32, value: f32) -> Result<f32, PluginError> {
        self.mix = value;
        Ok(value)
    }
    fn get_parameter(&mut self, _id: u32) -> Result<f32, PluginError> {
        Ok(self.mix)
    }
    fn save_state(&mut self) -> Result<Vec<u8>, PluginError> {
        Ok(Vec::new())
    }
    fn load_state(&mut self, _data: &[u8]) -> Result<(), PluginError> {
        Ok(())
    }
    fn set_editor_visible(&mut self, visible: bool) -> Result<(), PluginError> {
        if visible {
            // Automation moves the plugin's own value before it reports it.
            self.mix = 0.8;
            let _ = self.notify.send(PluginNotification::ParameterChanged {
                id: 3,
                value: self.mix,
            });
            let _ = self.notify.send(PluginNotification::EditorClosed);
        }
        Ok(())
    }
    fn notifications(&self) -> Option<Receiver<PluginNotification>> {
        Some(self.notifications.clone())
    }
    fn shutdown(&mut self) {}
}

struct EditorFactory;

impl PluginFactory for EditorFactory {
    fn create(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>, PluginError> {
        if descriptor.format == PluginFormat::Builtin {
            return BuiltinFactory.create(descriptor);
        }
        let (notify, notifications) = crossbeam_channel::unbounded();
        Ok(Box::new(EditorPlugin {
            descriptor: descriptor.clone(),
            notify,
            notifications,
            mix: 0.5,
        }))
    }
}

#[test]
fn test_editor_notifications_become_events() {
    let descriptor =
        PluginDescriptor::new(PluginFormat::Vst3, "e1", "/plugins/Editor.vst3", "Editor")
            .editor(true);
    let mut host = Host::with_factory(Box::new(EditorFactory), vec![descriptor]);
    let handle = host.load("vst3:e1");

    host.result(1, "showEditor", json!({ "handle": handle }));
    let changed = host.event("parameterChanged");
    assert_eq!(changed["handle"], json!(handle));
    assert_eq!(changed["data"]["paramId"], json!(3));
    assert!((changed["data"]["value"].as_f64().unwrap() - 0.8).abs() < 1e-6);
    let closed = host.event("editorClosed");
    assert_eq!(closed, json!({ "event": "editorClosed", "handle": handle, "data": {} }));

    let info = host.result(2, "getInstanceInfo", json!({ "handle": handle }));
    assert_eq!(info["editorVisible"], json!(false));
    let mix = host.result(3, "getParameter", json!({ "handle": handle, "paramId": 3 }));
    assert_eq!(mix["value"], changed["data"]["value"]);
    host.finish().0.unwrap();
}

#[test]
fn test_stream_over_the_wire() {
    let mut host = Host::start();
    let handle = host.result(
        "load",
        "loadPlugin",
        json!({ "id": "builtin:gain", "sampleRate": 8000, "blockSize": 256 }),
    )["handle"]
        .as_u64()
        .unwrap();
    host.result(1, "setParameter", json!({ "handle": handle, "paramId": 0, "value": 0.5 }));

    let early = host.request(2, "startStream", json!({ "handle": handle }));
    assert_eq!(error_code(&early), "InvalidState");
    host.result(3, "activate", json!({ "handle": handle }));
    host.result(4, "startStream", json!({ "handle": handle }));

    let wrong = host.request(5, "writeStream", json!({ "handle": handle, "channels": [[1.0]] }));
    assert_eq!(error_code(&wrong), "FormatMismatch");

    let frames = 1024;
    let written = host.result(
        6,
        "writeStream",
        json!({ "handle": handle, "channels": [vec![1.0; frames], vec![1.0; frames]] }),
    );
    assert_eq!(written["accepted"], json!(frames));

    // Underrun blocks before the write come out silent; the rest is scaled.
    let deadline = Instant::now() + TIMEOUT;
    let mut signal = 0;
    let mut id = 100;
    while signal < frames && Instant::now() < deadline {
        let read = host.result(id, "readStream", json!({ "handle": handle }));
        for sample in read["channels"][0].as_array().unwrap() {
            let sample = sample.as_f64().unwrap();
            assert!(sample == 0.0 || sample == 0.5, "unexpected sample {sample}");
            if sample == 0.5 {
                signal += 1;
            }
        }
        id += 1;
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(signal, frames);

    let status = host.result("status", "streamStatus", json!({ "handle": handle }));
    assert!(status["blocks"].as_u64().unwrap() >= 4);
    assert_eq!(status["faulted"], json!(false));

    host.result("stop", "stopStream", json!({ "handle": handle }));
    let stopped = host.request("read", "readStream", json!({ "handle": handle }));
    assert_eq!(error_code(&stopped), "InvalidState");
    let gain = host.result("gain", "getParameter", json!({ "handle": handle, "paramId": 0 }));
    assert_eq!(gain["value"], json!(0.5));
    host.finish().0.unwrap();
}
