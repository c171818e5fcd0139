//! VST3 plugin wrapper that implements the Plugin trait.
//!
//! Drives `IComponent` + `IAudioProcessor` for audio and the
//! `IEditController` for parameters and controller state. Parameters are
//! exposed in the normalized `0.0..=1.0` domain VST3 uses natively.

use crate::com::{
    self, AudioBusBuffers, BusInfo, ComPtr, FUnknownVtbl, IAUDIO_PROCESSOR_IID,
    IAudioProcessorVtbl, ICOMPONENT_IID, ICONNECTION_POINT_IID, IComponentVtbl,
    IConnectionPointVtbl, IEDIT_CONTROLLER_IID, IEditControllerVtbl, K_NOT_IMPLEMENTED,
    K_RESULT_OK, PARAM_CAN_AUTOMATE, ProcessData, ProcessSetup, RawParameterInfo, TResult, Tuid,
    direction, media, process_mode,
};
use crate::component_handler::ComponentHandler;
use crate::host_application::HostApplication;
use crate::loader::{ClassInfo, Vst3Module};
use crate::parameter_changes::ParameterChanges;
use crate::stream::StreamRef;
use crossbeam_channel::Receiver;
use cuehost_core::{AudioConfig, ChannelCount, MAX_CHANNELS};
use cuehost_plugin::{
    AudioBuffer, EventBuffer, ParameterInfo, Plugin, PluginDescriptor, PluginError, PluginFormat,
    PluginNotification,
};
use std::path::Path;

/// Capacity of the edit notification channel
const NOTIFICATION_CAPACITY: usize = 1024;

/// Live COM objects of one instance.
///
/// Declaration order is drop order: connections and controller go before
/// the component, and the module (which unloads the library) goes last.
struct Objects {
    connections: Option<(ComPtr<IConnectionPointVtbl>, ComPtr<IConnectionPointVtbl>)>,
    controller: Option<Controller>,
    processor: ComPtr<IAudioProcessorVtbl>,
    component: ComPtr<IComponentVtbl>,
    _handler: ComPtr<FUnknownVtbl>,
    _host: ComPtr<FUnknownVtbl>,
    _module: Vst3Module,
}

struct Controller {
    ptr: ComPtr<IEditControllerVtbl>,
    /// Created from the controller class id rather than queried from the
    /// component, so it is initialized and terminated on its own.
    separate: bool,
}

/// VST3 plugin wrapper
pub struct Vst3Plugin {
    descriptor: PluginDescriptor,
    objects: Option<Objects>,
    parameters: Vec<ParameterInfo>,
    config: AudioConfig,
    active: bool,
    notifications: Receiver<PluginNotification>,
    input_changes: Box<ParameterChanges>,
    output_changes: Box<ParameterChanges>,
    scratch_inputs: Vec<Vec<f32>>,
    input_ptrs: [*mut f32; MAX_CHANNELS],
    output_ptrs: [*mut f32; MAX_CHANNELS],
}

// SAFETY: VST3 objects are only called from whichever thread currently owns
// the wrapper, one call at a time. The raw channel pointers are scratch
// space rebuilt on every `process` call.
#[allow(unsafe_code)]
unsafe impl Send for Vst3Plugin {}

/// Probe a module for its descriptor without preparing DSP state.
pub fn probe(path: &Path) -> Result<PluginDescriptor, PluginError> {
    let module = Vst3Module::open(path)?;
    let class = module.audio_class()?;
    let component = module.create_instance::<IComponentVtbl>(&class.class_id, &ICOMPONENT_IID)?;
    let host = HostApplication::create();

    initialize_base(&component, &host)?;
    let descriptor = describe(&module, &class, &component);
    terminate_component(&component);
    drop(component);
    Ok(descriptor)
}

impl Vst3Plugin {
    /// Instantiate the class a descriptor points at.
    pub fn load(descriptor: &PluginDescriptor) -> Result<Self, PluginError> {
        tracing::info!("Loading VST3 plugin from: {}", descriptor.path.display());
        let module = Vst3Module::open(&descriptor.path)?;
        let class = select_class(&module, &descriptor.id)?;

        let component = module.create_instance::<IComponentVtbl>(&class.class_id, &ICOMPONENT_IID)?;
        let host = HostApplication::create();
        initialize_base(&component, &host)?;

        let Some(processor) = component.query::<IAudioProcessorVtbl>(&IAUDIO_PROCESSOR_IID) else {
            terminate_component(&component);
            return Err(PluginError::FormatError(
                "component does not implement IAudioProcessor".into(),
            ));
        };

        let (tx, rx) = crossbeam_channel::bounded(NOTIFICATION_CAPACITY);
        let handler = ComponentHandler::create(tx);
        let controller = create_controller(&module, &component, &host);
        let connections = controller.as_ref().and_then(|c| connect(&component, c));

        if let Some(controller) = &controller {
            attach_controller(controller, &component, &handler);
        }

        let parameters = controller
            .as_ref()
            .map(|c| read_parameters(&c.ptr))
            .unwrap_or_default();
        let refreshed = describe(&module, &class, &component);
        tracing::info!(
            "Loaded VST3 class '{}' ({} parameters)",
            class.name,
            parameters.len()
        );

        Ok(Self {
            descriptor: PluginDescriptor {
                id: descriptor.id.clone(),
                ..refreshed
            },
            objects: Some(Objects {
                connections,
                controller,
                processor,
                component,
                _handler: handler,
                _host: host,
                _module: module,
            }),
            parameters,
            config: AudioConfig::default(),
            active: false,
            notifications: rx,
            input_changes: ParameterChanges::new(),
            output_changes: ParameterChanges::new(),
            scratch_inputs: Vec::new(),
            input_ptrs: [std::ptr::null_mut(); MAX_CHANNELS],
            output_ptrs: [std::ptr::null_mut(); MAX_CHANNELS],
        })
    }

    fn objects(&self) -> Result<&Objects, PluginError> {
        self.objects
            .as_ref()
            .ok_or_else(|| PluginError::ProcessingFailed("plugin has been shut down".into()))
    }

    fn controller(&self) -> Result<&ComPtr<IEditControllerVtbl>, PluginError> {
        self.objects()?
            .controller
            .as_ref()
            .map(|c| &c.ptr)
            .ok_or_else(|| PluginError::Unsupported("plugin has no edit controller".into()))
    }

    fn find_parameter(&self, id: u32) -> Result<&ParameterInfo, PluginError> {
        self.parameters
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| PluginError::InvalidParameter(format!("unknown parameter id {id}")))
    }

    #[allow(unsafe_code)]
    fn set_buses(&self, objects: &Objects, config: &AudioConfig) -> Result<(), PluginError> {
        let component = &objects.component;
        let processor = &objects.processor;
        let mut inputs = bus_arrangements(processor, component, direction::INPUT, config.input_channels);
        let mut outputs =
            bus_arrangements(processor, component, direction::OUTPUT, config.output_channels);

        let result = unsafe {
            (processor.vtbl().set_bus_arrangements)(
                processor.as_ptr(),
                inputs.as_mut_ptr(),
                inputs.len() as i32,
                outputs.as_mut_ptr(),
                outputs.len() as i32,
            )
        };
        if result != K_RESULT_OK
            && (config.input_channels != self.descriptor.input_channels
                || config.output_channels != self.descriptor.output_channels)
        {
            return Err(PluginError::InitializationFailed(format!(
                "plugin rejected {} in / {} out channel layout",
                config.input_channels, config.output_channels
            )));
        }

        // Only the main buses receive buffers.
        for (dir, count) in [(direction::INPUT, inputs.len()), (direction::OUTPUT, outputs.len())] {
            for index in 0..count {
                let state = u8::from(index == 0);
                unsafe {
                    (component.vtbl().activate_bus)(
                        component.as_ptr(),
                        media::AUDIO,
                        dir,
                        index as i32,
                        state,
                    );
                }
            }
        }
        Ok(())
    }
}

impl Plugin for Vst3Plugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    #[allow(unsafe_code)]
    fn initialize(&mut self, config: &AudioConfig) -> Result<(), PluginError> {
        tracing::info!(
            "Initializing VST3 plugin '{}' at {} Hz, block size {}",
            self.descriptor.name,
            config.sample_rate,
            config.block_size
        );
        let objects = self.objects()?;
        let processor = &objects.processor;

        let result = unsafe { (processor.vtbl().can_process_sample_size)(processor.as_ptr(), com::SAMPLE_32) };
        if result != K_RESULT_OK {
            return Err(PluginError::Unsupported(
                "plugin cannot process 32-bit float samples".into(),
            ));
        }

        self.set_buses(objects, config)?;

        let mut setup = ProcessSetup {
            process_mode: process_mode::REALTIME,
            symbolic_sample_size: com::SAMPLE_32,
            max_samples_per_block: config.block_size as i32,
            sample_rate: f64::from(config.sample_rate),
        };
        let result = unsafe { (processor.vtbl().setup_processing)(processor.as_ptr(), &raw mut setup) };
        if result != K_RESULT_OK {
            return Err(PluginError::InitializationFailed(format!(
                "setupProcessing failed with result {result}"
            )));
        }

        self.scratch_inputs = vec![vec![0.0; config.block_size]; config.input_channels];
        self.config = *config;
        Ok(())
    }

    #[allow(unsafe_code)]
    fn activate(&mut self) -> Result<(), PluginError> {
        if self.active {
            return Ok(());
        }
        let objects = self.objects()?;
        let result = unsafe { (objects.component.vtbl().set_active)(objects.component.as_ptr(), 1) };
        check(result, "setActive(true)")?;
        let result = unsafe { (objects.processor.vtbl().set_processing)(objects.processor.as_ptr(), 1) };
        if result != K_RESULT_OK && result != K_NOT_IMPLEMENTED {
            tracing::debug!("setProcessing(true) returned {result}");
        }
        self.active = true;
        Ok(())
    }

    #[allow(unsafe_code)]
    fn suspend(&mut self) -> Result<(), PluginError> {
        if !self.active {
            return Ok(());
        }
        let objects = self.objects()?;
        unsafe {
            (objects.processor.vtbl().set_processing)(objects.processor.as_ptr(), 0);
        }
        let result = unsafe { (objects.component.vtbl().set_active)(objects.component.as_ptr(), 0) };
        self.active = false;
        check(result, "setActive(false)")
    }

    #[allow(unsafe_code)]
    fn process(&mut self, audio: &mut AudioBuffer, events: &EventBuffer) -> Result<(), PluginError> {
        if !self.active {
            return Err(PluginError::ProcessingFailed("plugin is not active".into()));
        }
        let frames = audio.frames;
        if frames > self.config.block_size {
            return Err(PluginError::ProcessingFailed(format!(
                "block of {frames} frames exceeds configured {}",
                self.config.block_size
            )));
        }

        // Plugins may write to their inputs; never hand them the caller's.
        let input_count = audio.inputs.len().min(self.scratch_inputs.len());
        for (ch, scratch) in self.scratch_inputs.iter_mut().take(input_count).enumerate() {
            scratch[..frames].copy_from_slice(&audio.inputs[ch][..frames]);
            self.input_ptrs[ch] = scratch.as_mut_ptr();
        }
        let output_count = audio.outputs.len().min(MAX_CHANNELS);
        for (ch, output) in audio.outputs.iter_mut().take(output_count).enumerate() {
            self.output_ptrs[ch] = output.as_mut_ptr();
        }

        for change in events.iter() {
            self.input_changes
                .add_change(change.id, change.sample_offset as i32, f64::from(change.value));
        }

        let mut input_bus = AudioBusBuffers {
            num_channels: input_count as i32,
            silence_flags: 0,
            channel_buffers_32: self.input_ptrs.as_mut_ptr(),
        };
        let mut output_bus = AudioBusBuffers {
            num_channels: output_count as i32,
            silence_flags: 0,
            channel_buffers_32: self.output_ptrs.as_mut_ptr(),
        };
        let mut data = ProcessData {
            process_mode: process_mode::REALTIME,
            symbolic_sample_size: com::SAMPLE_32,
            num_samples: frames as i32,
            num_inputs: i32::from(input_count > 0),
            num_outputs: i32::from(output_count > 0),
            inputs: &raw mut input_bus,
            outputs: &raw mut output_bus,
            input_parameter_changes: self.input_changes.as_com_ptr(),
            output_parameter_changes: self.output_changes.as_com_ptr(),
            input_events: std::ptr::null_mut(),
            output_events: std::ptr::null_mut(),
            process_context: std::ptr::null_mut(),
        };

        let Some(objects) = self.objects.as_ref() else {
            return Err(PluginError::ProcessingFailed("plugin has been shut down".into()));
        };
        let result = unsafe { (objects.processor.vtbl().process)(objects.processor.as_ptr(), &raw mut data) };
        self.input_changes.clear();
        self.output_changes.clear();

        if result == K_RESULT_OK {
            Ok(())
        } else {
            Err(PluginError::ProcessingFailed(format!(
                "process returned {result}"
            )))
        }
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        self.parameters.clone()
    }

    #[allow(unsafe_code)]
    fn set_parameter(&mut self, id: u32, value: f32) -> Result<f32, PluginError> {
        let value = self.find_parameter(id)?.clamp(value);
        let controller = self.controller()?;
        let result =
            unsafe { (controller.vtbl().set_param_normalized)(controller.as_ptr(), id, f64::from(value)) };
        if result != K_RESULT_OK {
            return Err(PluginError::InvalidParameter(format!(
                "controller rejected value {value} for parameter {id}"
            )));
        }
        let applied = unsafe { (controller.vtbl().get_param_normalized)(controller.as_ptr(), id) } as f32;
        // Reaches the processor with the next block.
        self.input_changes.add_change(id, 0, f64::from(applied));
        Ok(applied)
    }

    #[allow(unsafe_code)]
    fn get_parameter(&mut self, id: u32) -> Result<f32, PluginError> {
        self.find_parameter(id)?;
        let controller = self.controller()?;
        Ok(unsafe { (controller.vtbl().get_param_normalized)(controller.as_ptr(), id) } as f32)
    }

    #[allow(unsafe_code)]
    fn save_state(&mut self) -> Result<Vec<u8>, PluginError> {
        let objects = self.objects()?;
        let component_state = StreamRef::new();
        let result = unsafe {
            (objects.component.vtbl().get_state)(
                objects.component.as_ptr(),
                component_state.as_com_ptr(),
            )
        };
        check(result, "IComponent::getState")?;

        let controller_state = StreamRef::new();
        if let Some(controller) = &objects.controller {
            let result = unsafe {
                (controller.ptr.vtbl().get_state)(controller.ptr.as_ptr(), controller_state.as_com_ptr())
            };
            if result != K_RESULT_OK {
                tracing::debug!("IEditController::getState returned {result}");
            }
        }
        Ok(encode_state(component_state.data(), controller_state.data()))
    }

    #[allow(unsafe_code)]
    fn load_state(&mut self, data: &[u8]) -> Result<(), PluginError> {
        let (component_bytes, controller_bytes) = decode_state(data)?;
        let objects = self.objects()?;

        let mut component_state = StreamRef::from_bytes(component_bytes.to_vec());
        let result = unsafe {
            (objects.component.vtbl().set_state)(
                objects.component.as_ptr(),
                component_state.as_com_ptr(),
            )
        };
        check(result, "IComponent::setState")?;

        if let Some(controller) = &objects.controller {
            component_state.rewind();
            let vtbl = controller.ptr.vtbl();
            unsafe {
                (vtbl.set_component_state)(controller.ptr.as_ptr(), component_state.as_com_ptr());
            }
            if !controller_bytes.is_empty() {
                let controller_state = StreamRef::from_bytes(controller_bytes.to_vec());
                unsafe {
                    (vtbl.set_state)(controller.ptr.as_ptr(), controller_state.as_com_ptr());
                }
            }
        }
        Ok(())
    }

    fn notifications(&self) -> Option<Receiver<PluginNotification>> {
        Some(self.notifications.clone())
    }

    #[allow(unsafe_code)]
    fn shutdown(&mut self) {
        if self.active {
            let _ = self.suspend();
        }
        let Some(objects) = self.objects.take() else {
            return;
        };
        tracing::info!("Shutting down VST3 plugin '{}'", self.descriptor.name);

        if let Some((component_cp, controller_cp)) = &objects.connections {
            unsafe {
                (component_cp.vtbl().disconnect)(component_cp.as_ptr(), controller_cp.as_ptr());
                (controller_cp.vtbl().disconnect)(controller_cp.as_ptr(), component_cp.as_ptr());
            }
        }
        if let Some(controller) = &objects.controller {
            unsafe {
                (controller.ptr.vtbl().set_component_handler)(
                    controller.ptr.as_ptr(),
                    std::ptr::null_mut(),
                );
                if controller.separate {
                    (controller.ptr.vtbl().base.terminate)(controller.ptr.as_ptr());
                }
            }
        }
        terminate_component(&objects.component);
        drop(objects);
    }
}

impl Drop for Vst3Plugin {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check(result: TResult, call: &str) -> Result<(), PluginError> {
    if result == K_RESULT_OK {
        Ok(())
    } else {
        Err(PluginError::ProcessingFailed(format!(
            "{call} failed with result {result}"
        )))
    }
}

/// Preset blob: little-endian component state length, component state,
/// then controller state.
fn encode_state(component: &[u8], controller: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(4 + component.len() + controller.len());
    blob.extend_from_slice(&(component.len() as u32).to_le_bytes());
    blob.extend_from_slice(component);
    blob.extend_from_slice(controller);
    blob
}

fn decode_state(blob: &[u8]) -> Result<(&[u8], &[u8]), PluginError> {
    let malformed = || PluginError::InvalidParameter("malformed VST3 preset blob".into());
    let (len, rest) = blob.split_first_chunk::<4>().ok_or_else(malformed)?;
    let len = u32::from_le_bytes(*len) as usize;
    if len > rest.len() {
        return Err(malformed());
    }
    Ok(rest.split_at(len))
}

#[allow(unsafe_code)]
fn initialize_base(
    component: &ComPtr<IComponentVtbl>,
    host: &ComPtr<FUnknownVtbl>,
) -> Result<(), PluginError> {
    let result = unsafe { (component.vtbl().base.initialize)(component.as_ptr(), host.as_ptr()) };
    if result == K_RESULT_OK {
        Ok(())
    } else {
        Err(PluginError::InitializationFailed(format!(
            "IComponent::initialize failed with result {result}"
        )))
    }
}

#[allow(unsafe_code)]
fn terminate_component(component: &ComPtr<IComponentVtbl>) {
    unsafe {
        (component.vtbl().base.terminate)(component.as_ptr());
    }
}

fn select_class(module: &Vst3Module, descriptor_id: &str) -> Result<ClassInfo, PluginError> {
    let wanted = descriptor_id.strip_prefix("vst3:");
    module
        .classes()
        .into_iter()
        .find(|class| {
            class.category == com::AUDIO_EFFECT_CLASS
                && wanted.is_none_or(|hex| com::tuid_to_hex(&class.class_id) == hex)
        })
        .map_or_else(|| module.audio_class(), Ok)
}

/// Edit controller: the component itself (single-component plugins) or a
/// separate object created from the controller class id.
#[allow(unsafe_code)]
fn create_controller(
    module: &Vst3Module,
    component: &ComPtr<IComponentVtbl>,
    host: &ComPtr<FUnknownVtbl>,
) -> Option<Controller> {
    if let Some(ptr) = component.query::<IEditControllerVtbl>(&IEDIT_CONTROLLER_IID) {
        return Some(Controller {
            ptr,
            separate: false,
        });
    }

    let mut cid: Tuid = [0; 16];
    let result =
        unsafe { (component.vtbl().get_controller_class_id)(component.as_ptr(), &raw mut cid) };
    if result != K_RESULT_OK || cid == [0; 16] {
        tracing::debug!("VST3 component has no edit controller");
        return None;
    }

    let ptr = match module.create_instance::<IEditControllerVtbl>(&cid, &IEDIT_CONTROLLER_IID) {
        Ok(ptr) => ptr,
        Err(e) => {
            tracing::warn!("Failed to create VST3 edit controller: {e}");
            return None;
        }
    };
    let result = unsafe { (ptr.vtbl().base.initialize)(ptr.as_ptr(), host.as_ptr()) };
    if result != K_RESULT_OK {
        tracing::warn!("IEditController::initialize failed with result {result}");
        return None;
    }
    Some(Controller {
        ptr,
        separate: true,
    })
}

#[allow(unsafe_code)]
fn connect(
    component: &ComPtr<IComponentVtbl>,
    controller: &Controller,
) -> Option<(ComPtr<IConnectionPointVtbl>, ComPtr<IConnectionPointVtbl>)> {
    if !controller.separate {
        return None;
    }
    let component_cp = component.query::<IConnectionPointVtbl>(&ICONNECTION_POINT_IID)?;
    let controller_cp = controller
        .ptr
        .query::<IConnectionPointVtbl>(&ICONNECTION_POINT_IID)?;
    unsafe {
        (component_cp.vtbl().connect)(component_cp.as_ptr(), controller_cp.as_ptr());
        (controller_cp.vtbl().connect)(controller_cp.as_ptr(), component_cp.as_ptr());
    }
    Some((component_cp, controller_cp))
}

/// Install the component handler and sync the controller with the
/// component's current state.
#[allow(unsafe_code)]
fn attach_controller(
    controller: &Controller,
    component: &ComPtr<IComponentVtbl>,
    handler: &ComPtr<FUnknownVtbl>,
) {
    let vtbl = controller.ptr.vtbl();
    unsafe {
        (vtbl.set_component_handler)(controller.ptr.as_ptr(), handler.as_ptr());
    }

    let mut state = StreamRef::new();
    let result = unsafe { (component.vtbl().get_state)(component.as_ptr(), state.as_com_ptr()) };
    if result == K_RESULT_OK {
        state.rewind();
        unsafe {
            (vtbl.set_component_state)(controller.ptr.as_ptr(), state.as_com_ptr());
        }
    }
}

#[allow(unsafe_code)]
fn read_parameters(controller: &ComPtr<IEditControllerVtbl>) -> Vec<ParameterInfo> {
    let count = unsafe { (controller.vtbl().get_parameter_count)(controller.as_ptr()) };
    (0..count.max(0))
        .filter_map(|index| {
            let mut raw: RawParameterInfo = com::zeroed();
            let result = unsafe {
                (controller.vtbl().get_parameter_info)(controller.as_ptr(), index, &raw mut raw)
            };
            (result == K_RESULT_OK).then(|| ParameterInfo {
                automatable: raw.flags & PARAM_CAN_AUTOMATE != 0,
                ..ParameterInfo::normalized(
                    raw.id,
                    com::utf16_to_string(&raw.title),
                    raw.default_normalized_value as f32,
                )
            })
        })
        .collect()
}

#[allow(unsafe_code)]
fn main_bus_channels(component: &ComPtr<IComponentVtbl>, dir: i32) -> (i32, ChannelCount) {
    let buses = unsafe { (component.vtbl().get_bus_count)(component.as_ptr(), media::AUDIO, dir) };
    if buses <= 0 {
        return (0, 0);
    }
    let mut info: BusInfo = com::zeroed();
    let result = unsafe {
        (component.vtbl().get_bus_info)(component.as_ptr(), media::AUDIO, dir, 0, &raw mut info)
    };
    let channels = if result == K_RESULT_OK {
        info.channel_count.max(0) as ChannelCount
    } else {
        0
    };
    (buses, channels.min(MAX_CHANNELS))
}

/// Arrangements for every bus in one direction: the requested layout on the
/// main bus, the plugin's current layout everywhere else.
#[allow(unsafe_code)]
fn bus_arrangements(
    processor: &ComPtr<IAudioProcessorVtbl>,
    component: &ComPtr<IComponentVtbl>,
    dir: i32,
    main_channels: ChannelCount,
) -> Vec<u64> {
    let (buses, _) = main_bus_channels(component, dir);
    (0..buses)
        .map(|index| {
            if index == 0 {
                return com::speaker_arrangement(main_channels);
            }
            let mut arrangement = 0_u64;
            unsafe {
                (processor.vtbl().get_bus_arrangement)(
                    processor.as_ptr(),
                    dir,
                    index,
                    &raw mut arrangement,
                );
            }
            arrangement
        })
        .collect()
}

fn describe(
    module: &Vst3Module,
    class: &ClassInfo,
    component: &ComPtr<IComponentVtbl>,
) -> PluginDescriptor {
    let (_, inputs) = main_bus_channels(component, direction::INPUT);
    let (_, outputs) = main_bus_channels(component, direction::OUTPUT);
    PluginDescriptor::new(
        PluginFormat::Vst3,
        com::tuid_to_hex(&class.class_id),
        module.path(),
        class.name.clone(),
    )
    .vendor(module.vendor())
    .instrument(inputs == 0)
    .channels(inputs, outputs)
}
