//! Worker subprocess tests.
//!
//! These spawn the real `cuehost-worker` binary hosting builtin plugins, so
//! they exercise the full control pipe and shared-memory path without any
//! third-party plugin installed.

use std::path::Path;
use std::time::Duration;

use cuehost_core::AudioConfig;
use cuehost_engine::builtin::{fault, gain, sine};
use cuehost_isolation::{IsolatedPlugin, IsolationError, ProbeRunner};
use cuehost_plugin::{
    AudioBuffer, EventBuffer, ParamChange, Plugin, PluginDescriptor, PluginError, PluginFormat,
    PluginNotification,
};
use serial_test::serial;

const WORKER: &str = env!("CARGO_BIN_EXE_cuehost-worker");
const PROBE: &str = env!("CARGO_BIN_EXE_cuehost-probe");

fn spawn(descriptor: &PluginDescriptor) -> IsolatedPlugin {
    IsolatedPlugin::spawn(Path::new(WORKER), descriptor, Duration::from_secs(10))
        .expect("worker should start")
}

fn process(plugin: &mut dyn Plugin, input: f32, frames: usize, events: &EventBuffer) -> Result<Vec<Vec<f32>>, PluginError> {
    let left = vec![input; frames];
    let right = vec![input; frames];
    let mut out_l = vec![0.0; frames];
    let mut out_r = vec![0.0; frames];
    {
        let inputs: Vec<&[f32]> = vec![&left, &right];
        let mut outputs: Vec<&mut [f32]> = vec![&mut out_l, &mut out_r];
        let mut audio = AudioBuffer {
            inputs: &inputs,
            outputs: &mut outputs,
            frames,
        };
        plugin.process(&mut audio, events)?;
    }
    Ok(vec![out_l, out_r])
}

#[test]
#[serial]
fn test_isolated_gain_round_trip() {
    let mut plugin = spawn(&gain::GainProcessor::describe());
    let config = AudioConfig::new(48000, 128, 2, 2);
    plugin.initialize(&config).unwrap();
    assert_eq!(plugin.parameters().len(), 1);
    plugin.activate().unwrap();

    assert_eq!(plugin.set_parameter(gain::GAIN, 0.5).unwrap(), 0.5);
    assert_eq!(plugin.get_parameter(gain::GAIN).unwrap(), 0.5);

    let out = process(&mut plugin, 1.0, 128, &EventBuffer::new()).unwrap();
    assert!(out.iter().flatten().all(|&s| s == 0.5));

    // Block-boundary parameter changes travel through shared memory.
    let mut events = EventBuffer::new();
    events.push(ParamChange {
        id: gain::GAIN,
        value: 2.0,
        sample_offset: 0,
    });
    let out = process(&mut plugin, 1.0, 64, &events).unwrap();
    assert!(out.iter().flatten().all(|&s| s == 2.0));

    let state = plugin.save_state().unwrap();
    plugin.set_parameter(gain::GAIN, 0.1).unwrap();
    plugin.load_state(&state).unwrap();
    assert_eq!(plugin.get_parameter(gain::GAIN).unwrap(), 2.0);

    assert!(matches!(
        plugin.set_editor_visible(true),
        Err(PluginError::Unsupported(_))
    ));
    assert!(matches!(
        plugin.set_parameter(42, 0.0),
        Err(PluginError::InvalidParameter(_))
    ));

    plugin.suspend().unwrap();
    plugin.shutdown();
    plugin.shutdown();
    assert!(!plugin.is_alive());
}

#[test]
#[serial]
fn test_isolated_instrument_has_no_inputs() {
    let mut plugin = spawn(&sine::SineOscillator::describe());
    let config = AudioConfig::new(48000, 256, 0, 2);
    plugin.initialize(&config).unwrap();
    plugin.activate().unwrap();

    let mut out_l = vec![0.0; 256];
    let mut out_r = vec![0.0; 256];
    {
        let mut outputs: Vec<&mut [f32]> = vec![&mut out_l, &mut out_r];
        let mut audio = AudioBuffer {
            inputs: &[],
            outputs: &mut outputs,
            frames: 256,
        };
        plugin.process(&mut audio, &EventBuffer::new()).unwrap();
    }
    assert!(out_l.iter().any(|&s| s != 0.0));
    assert_eq!(out_l, out_r);
}

#[test]
#[serial]
fn test_worker_crash_is_contained() {
    let mut plugin = spawn(&fault::FaultInjector::describe());
    let notifications = plugin.notifications().unwrap();
    plugin.initialize(&AudioConfig::default()).unwrap();
    plugin.activate().unwrap();
    plugin.set_parameter(fault::TRIGGER, 1.0).unwrap();

    let result = process(&mut plugin, 1.0, 512, &EventBuffer::new());
    assert!(matches!(result, Err(PluginError::Fault(_))), "{result:?}");

    let notification = notifications
        .recv_timeout(Duration::from_secs(5))
        .expect("crash notification");
    assert!(matches!(notification, PluginNotification::Crashed { .. }));

    // Everything after the crash is a fault too.
    assert!(plugin.get_parameter(fault::TRIGGER).unwrap_err().is_fault());
    assert!(!plugin.is_alive());
}

#[test]
#[serial]
fn test_load_failure_is_reported() {
    let descriptor = PluginDescriptor::new(
        PluginFormat::Vst3,
        "00000000000000000000000000000000",
        "/nonexistent/Missing.vst3",
        "Missing",
    );
    let result = IsolatedPlugin::spawn(Path::new(WORKER), &descriptor, Duration::from_secs(10));
    let error = result.err().expect("missing binary must not load");
    assert!(!error.is_fault(), "{error:?}");
}

#[test]
#[serial]
fn test_missing_worker_executable() {
    let result = IsolatedPlugin::spawn(
        Path::new("/nonexistent/cuehost-worker"),
        &gain::GainProcessor::describe(),
        Duration::from_secs(1),
    );
    assert!(matches!(result, Err(PluginError::InitializationFailed(_))));
}

#[test]
fn test_probe_rejects_missing_binary() {
    let runner = ProbeRunner::new(PROBE, Duration::from_secs(10));
    let result = runner.probe(Path::new("/nonexistent/Missing.vst3"), PluginFormat::Vst3);
    assert!(matches!(result, Err(IsolationError::ProbeFailed(_))), "{result:?}");
}

#[test]
fn test_probe_reads_au_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("Echo.component");
    std::fs::create_dir_all(bundle.join("Contents")).unwrap();
    std::fs::write(
        bundle.join("Contents").join("Info.plist"),
        "<plist><dict><key>AudioComponents</key><array><dict>\
         <key>name</key><string>Acme: Echo</string>\
         <key>type</key><string>aufx</string>\
         </dict></array></dict></plist>",
    )
    .unwrap();

    let runner = ProbeRunner::new(PROBE, Duration::from_secs(10));
    let descriptor = runner.probe(&bundle, PluginFormat::Au).unwrap();
    assert_eq!(descriptor.id, "au:Echo");
    assert_eq!(descriptor.vendor, "Acme");
}
