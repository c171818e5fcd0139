//! Command table: payload shapes and the operation each command runs.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use crossbeam_channel::Sender;
use cuehost_core::{AudioConfig, ChannelCount, Frames, SampleRate};
use cuehost_session::{Catalog, HostEvent, InstanceError, PluginFactory, PluginInstance, Registry};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::config::HostConfig;
use crate::protocol::{ErrorCode, ProtocolError};

/// Everything a command can reach. Shared by all pool threads.
pub struct HostContext {
    pub config: HostConfig,
    pub catalog: Catalog,
    pub registry: Registry,
    pub factory: Box<dyn PluginFactory>,
    pub events: Sender<HostEvent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanParams {
    #[serde(default)]
    pub paths: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdParams {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadParams {
    pub id: String,
    pub sample_rate: Option<SampleRate>,
    pub block_size: Option<Frames>,
    pub input_channels: Option<ChannelCount>,
    pub output_channels: Option<ChannelCount>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandleParams {
    pub handle: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamParams {
    pub handle: u64,
    pub param_id: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetParameterParams {
    pub handle: u64,
    pub param_id: u32,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PresetParams {
    pub handle: u64,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderParams {
    pub handle: u64,
    pub inputs: Vec<Vec<f32>>,
    pub frame_count: Frames,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteStreamParams {
    pub handle: u64,
    pub channels: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStreamParams {
    pub handle: u64,
    pub max_frames: Option<Frames>,
}

/// A validated command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScanPlugins(ScanParams),
    ListPlugins,
    GetPlugin(IdParams),
    LoadPlugin(LoadParams),
    UnloadPlugin(HandleParams),
    Activate(HandleParams),
    Suspend(HandleParams),
    GetParameters(HandleParams),
    SetParameter(SetParameterParams),
    GetParameter(ParamParams),
    SavePreset(HandleParams),
    LoadPreset(PresetParams),
    RenderOffline(RenderParams),
    StartStream(HandleParams),
    StopStream(HandleParams),
    WriteStream(WriteStreamParams),
    ReadStream(ReadStreamParams),
    StreamStatus(HandleParams),
    ShowEditor(HandleParams),
    HideEditor(HandleParams),
    GetInstanceInfo(HandleParams),
    Shutdown,
}

fn params<T: DeserializeOwned>(command: &str, params: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(params).map_err(|e| {
        ProtocolError::new(
            ErrorCode::InvalidRequest,
            format!("Invalid params for {command}: {e}"),
        )
    })
}

impl Command {
    /// Resolve a command name and check its payload shape.
    pub fn parse(name: &str, payload: Value) -> Result<Self, ProtocolError> {
        Ok(match name {
            "scanPlugins" => Self::ScanPlugins(params(name, payload)?),
            "listPlugins" => Self::ListPlugins,
            "getPlugin" => Self::GetPlugin(params(name, payload)?),
            "loadPlugin" => Self::LoadPlugin(params(name, payload)?),
            "unloadPlugin" => Self::UnloadPlugin(params(name, payload)?),
            "activate" => Self::Activate(params(name, payload)?),
            "suspend" => Self::Suspend(params(name, payload)?),
            "getParameters" => Self::GetParameters(params(name, payload)?),
            "setParameter" => Self::SetParameter(params(name, payload)?),
            "getParameter" => Self::GetParameter(params(name, payload)?),
            "savePreset" => Self::SavePreset(params(name, payload)?),
            "loadPreset" => Self::LoadPreset(params(name, payload)?),
            "renderOffline" => Self::RenderOffline(params(name, payload)?),
            "startStream" => Self::StartStream(params(name, payload)?),
            "stopStream" => Self::StopStream(params(name, payload)?),
            "writeStream" => Self::WriteStream(params(name, payload)?),
            "readStream" => Self::ReadStream(params(name, payload)?),
            "streamStatus" => Self::StreamStatus(params(name, payload)?),
            "showEditor" => Self::ShowEditor(params(name, payload)?),
            "hideEditor" => Self::HideEditor(params(name, payload)?),
            "getInstanceInfo" => Self::GetInstanceInfo(params(name, payload)?),
            "shutdown" => Self::Shutdown,
            other => {
                return Err(ProtocolError::new(
                    ErrorCode::UnknownCommand,
                    format!("Unknown command '{other}'"),
                ));
            }
        })
    }

    /// The instance this command is sequenced on, if any.
    pub const fn handle(&self) -> Option<u64> {
        match self {
            Self::UnloadPlugin(p)
            | Self::Activate(p)
            | Self::Suspend(p)
            | Self::GetParameters(p)
            | Self::SavePreset(p)
            | Self::StartStream(p)
            | Self::StopStream(p)
            | Self::StreamStatus(p)
            | Self::ShowEditor(p)
            | Self::HideEditor(p)
            | Self::GetInstanceInfo(p) => Some(p.handle),
            Self::SetParameter(p) => Some(p.handle),
            Self::GetParameter(p) => Some(p.handle),
            Self::LoadPreset(p) => Some(p.handle),
            Self::RenderOffline(p) => Some(p.handle),
            Self::WriteStream(p) => Some(p.handle),
            Self::ReadStream(p) => Some(p.handle),
            Self::ScanPlugins(_)
            | Self::ListPlugins
            | Self::GetPlugin(_)
            | Self::LoadPlugin(_)
            | Self::Shutdown => None,
        }
    }
}

type CommandResult = Result<Value, ProtocolError>;

/// Run one command to completion on the calling thread.
pub fn execute(ctx: &HostContext, command: Command) -> CommandResult {
    match command {
        Command::ScanPlugins(p) => {
            let paths = p.paths.unwrap_or_else(|| ctx.config.scan_paths.clone());
            Ok(json!({ "plugins": ctx.catalog.scan(&paths) }))
        }
        Command::ListPlugins => Ok(json!({ "plugins": ctx.catalog.list() })),
        Command::GetPlugin(p) => {
            let plugin = ctx.catalog.get(&p.id).ok_or_else(|| {
                ProtocolError::new(
                    ErrorCode::InvalidParameter,
                    format!("No plugin with id '{}'", p.id),
                )
            })?;
            Ok(json!({ "plugin": plugin.as_ref() }))
        }
        Command::LoadPlugin(p) => load_plugin(ctx, &p),
        Command::UnloadPlugin(p) => {
            ctx.registry.unload(p.handle)?;
            Ok(json!({}))
        }
        Command::Activate(p) => with_instance(ctx, p.handle, |i| {
            Ok(json!({ "state": i.activate()? }))
        }),
        Command::Suspend(p) => with_instance(ctx, p.handle, |i| {
            Ok(json!({ "state": i.suspend()? }))
        }),
        Command::GetParameters(p) => with_instance(ctx, p.handle, |i| {
            Ok(json!({ "parameters": i.parameters()? }))
        }),
        Command::SetParameter(p) => with_instance(ctx, p.handle, |i| {
            let value = i.set_parameter(p.param_id, p.value)?;
            Ok(json!({ "paramId": p.param_id, "value": value }))
        }),
        Command::GetParameter(p) => with_instance(ctx, p.handle, |i| {
            let value = i.get_parameter(p.param_id)?;
            Ok(json!({ "paramId": p.param_id, "value": value }))
        }),
        Command::SavePreset(p) => with_instance(ctx, p.handle, |i| {
            Ok(json!({ "data": BASE64.encode(i.save_preset()?) }))
        }),
        Command::LoadPreset(p) => with_instance(ctx, p.handle, |i| {
            let data = BASE64.decode(&p.data).map_err(|e| {
                InstanceError::InvalidRequest(format!("preset data is not base64: {e}"))
            })?;
            i.load_preset(&data)?;
            Ok(json!({}))
        }),
        Command::RenderOffline(p) => with_instance(ctx, p.handle, |i| {
            let outputs = i.render_offline(&p.inputs, p.frame_count)?;
            Ok(json!({ "outputs": outputs, "frameCount": p.frame_count }))
        }),
        Command::StartStream(p) => with_instance(ctx, p.handle, |i| {
            i.start_stream()?;
            Ok(json!({}))
        }),
        Command::StopStream(p) => with_instance(ctx, p.handle, |i| {
            i.stop_stream()?;
            Ok(json!({}))
        }),
        Command::WriteStream(p) => with_instance(ctx, p.handle, |i| {
            Ok(json!({ "accepted": i.write_stream(&p.channels)? }))
        }),
        Command::ReadStream(p) => with_instance(ctx, p.handle, |i| {
            let max_frames = p.max_frames.unwrap_or(usize::MAX);
            let channels = i.read_stream(max_frames)?;
            let frames = channels.first().map_or(0, Vec::len);
            Ok(json!({ "channels": channels, "frames": frames }))
        }),
        Command::StreamStatus(p) => with_instance(ctx, p.handle, |i| {
            Ok(serde_json::to_value(i.stream_status()?).unwrap_or(Value::Null))
        }),
        Command::ShowEditor(p) => with_instance(ctx, p.handle, |i| {
            i.show_editor()?;
            Ok(json!({}))
        }),
        Command::HideEditor(p) => with_instance(ctx, p.handle, |i| {
            i.hide_editor()?;
            Ok(json!({}))
        }),
        Command::GetInstanceInfo(p) => with_instance(ctx, p.handle, |i| {
            Ok(serde_json::to_value(i.info()).unwrap_or(Value::Null))
        }),
        Command::Shutdown => Ok(json!({})),
    }
}

fn with_instance(
    ctx: &HostContext,
    handle: u64,
    f: impl FnOnce(&mut PluginInstance) -> Result<Value, InstanceError>,
) -> CommandResult {
    let slot = ctx.registry.get(handle)?;
    let mut instance = slot.lock();
    Ok(f(&mut *instance)?)
}

/// Resolve the descriptor, fill in config defaults and register the instance.
fn load_plugin(ctx: &HostContext, p: &LoadParams) -> CommandResult {
    let descriptor = ctx
        .catalog
        .get(&p.id)
        .ok_or_else(|| InstanceError::LoadFailed(format!("No plugin with id '{}'", p.id)))?;

    let config = AudioConfig::new(
        p.sample_rate.unwrap_or(ctx.config.sample_rate),
        p.block_size.unwrap_or(ctx.config.block_size),
        p.input_channels.unwrap_or(descriptor.input_channels),
        p.output_channels.unwrap_or(descriptor.output_channels),
    );

    let handle = ctx.registry.allocate();
    let instance = PluginInstance::load(
        handle,
        Arc::clone(&descriptor),
        config,
        ctx.factory.as_ref(),
        ctx.events.clone(),
    )?;
    let parameters = instance.parameters()?;
    ctx.registry.insert(instance);
    Ok(json!({ "handle": handle, "parameters": parameters }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuehost_session::{BuiltinFactory, InProcessProber};

    fn context() -> (HostContext, crossbeam_channel::Receiver<HostEvent>) {
        let (events, rx) = crossbeam_channel::unbounded();
        let ctx = HostContext {
            config: HostConfig::default(),
            catalog: Catalog::new(Box::new(InProcessProber), true),
            registry: Registry::new(),
            factory: Box::new(BuiltinFactory),
            events,
        };
        (ctx, rx)
    }

    fn run(ctx: &HostContext, name: &str, payload: Value) -> CommandResult {
        execute(ctx, Command::parse(name, payload)?)
    }

    #[test]
    fn test_parse_rejects_unknown_and_misshapen() {
        assert_eq!(
            Command::parse("frobnicate", json!({})).unwrap_err().code,
            ErrorCode::UnknownCommand
        );
        assert_eq!(
            Command::parse("activate", json!({"handle": "one"})).unwrap_err().code,
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            Command::parse("setParameter", json!({"handle": 1, "paramId": 0})).unwrap_err().code,
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            Command::parse("getParameter", json!({"handle": 4, "paramId": 0}))
                .unwrap()
                .handle(),
            Some(4)
        );
        assert_eq!(Command::parse("loadPlugin", json!({"id": "x"})).unwrap().handle(), None);
    }

    #[test]
    fn test_load_uses_host_and_descriptor_defaults() {
        let (ctx, _events) = context();
        let result = run(&ctx, "loadPlugin", json!({"id": "builtin:sine", "blockSize": 128})).unwrap();
        let handle = result["handle"].as_u64().unwrap();
        assert_eq!(result["parameters"].as_array().unwrap().len(), 2);

        let info = run(&ctx, "getInstanceInfo", json!({"handle": handle})).unwrap();
        assert_eq!(info["config"]["blockSize"], 128);
        assert_eq!(info["config"]["sampleRate"], 48000);
        assert_eq!(info["config"]["inputChannels"], 0);
        assert_eq!(info["config"]["outputChannels"], 2);
        assert_eq!(info["state"], "loaded");
    }

    #[test]
    fn test_load_failures() {
        let (ctx, _events) = context();
        let unknown = run(&ctx, "loadPlugin", json!({"id": "vst3:nope"})).unwrap_err();
        assert_eq!(unknown.code, ErrorCode::PluginLoadFailed);

        let rejected = run(&ctx, "loadPlugin", json!({"id": "builtin:gain", "sampleRate": 1})).unwrap_err();
        assert_eq!(rejected.code, ErrorCode::PluginLoadFailed);
        assert!(ctx.registry.is_empty());
    }

    #[test]
    fn test_parameter_and_preset_commands() {
        let (ctx, _events) = context();
        let handle = run(&ctx, "loadPlugin", json!({"id": "builtin:gain"})).unwrap()["handle"]
            .as_u64()
            .unwrap();

        let set = run(&ctx, "setParameter", json!({"handle": handle, "paramId": 0, "value": 3.0})).unwrap();
        assert_eq!(set, json!({"paramId": 0, "value": 2.0}));

        let preset = run(&ctx, "savePreset", json!({"handle": handle})).unwrap();
        run(&ctx, "setParameter", json!({"handle": handle, "paramId": 0, "value": 0.5})).unwrap();
        run(&ctx, "loadPreset", json!({"handle": handle, "data": preset["data"]})).unwrap();
        let get = run(&ctx, "getParameter", json!({"handle": handle, "paramId": 0})).unwrap();
        assert_eq!(get["value"], 2.0);

        let bad = run(&ctx, "loadPreset", json!({"handle": handle, "data": "not base64!"})).unwrap_err();
        assert_eq!(bad.code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_unload_retires_handle() {
        let (ctx, _events) = context();
        let handle = run(&ctx, "loadPlugin", json!({"id": "builtin:gain"})).unwrap()["handle"]
            .as_u64()
            .unwrap();
        run(&ctx, "unloadPlugin", json!({"handle": handle})).unwrap();
        let err = run(&ctx, "activate", json!({"handle": handle})).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownHandle);
    }

    #[test]
    fn test_catalog_commands() {
        let (ctx, _events) = context();
        let dir = tempfile::tempdir().unwrap();
        let scanned = run(&ctx, "scanPlugins", json!({"paths": [dir.path()]})).unwrap();
        assert_eq!(scanned, json!({"plugins": []}));

        let listed = run(&ctx, "listPlugins", json!({})).unwrap();
        assert_eq!(listed["plugins"].as_array().unwrap().len(), 3);

        let gain = run(&ctx, "getPlugin", json!({"id": "builtin:gain"})).unwrap();
        assert_eq!(gain["plugin"]["format"], "BUILTIN");
        assert_eq!(
            run(&ctx, "getPlugin", json!({"id": "au:none"})).unwrap_err().code,
            ErrorCode::InvalidParameter
        );
    }
}
