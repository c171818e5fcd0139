//! VST3 COM interface declarations.
//!
//! VST3 uses manual reference counting and vtable-based polymorphism,
//! similar to Microsoft COM. Only the slice of the SDK this host calls is
//! declared here: every vtable is `#[repr(C)]`, starts with its base
//! interface, and lists methods in SDK declaration order.

use std::ffi::{c_char, c_void};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// 128-bit interface / class identifier
pub type Tuid = [u8; 16];

/// VST3 result code
pub type TResult = i32;

/// VST3 boolean (`uint8`)
pub type TBool = u8;

pub const K_RESULT_OK: TResult = 0;
pub const K_RESULT_FALSE: TResult = 1;

#[cfg(windows)]
pub const K_NO_INTERFACE: TResult = 0x8000_4002_u32 as i32;
#[cfg(not(windows))]
pub const K_NO_INTERFACE: TResult = -1;

#[cfg(windows)]
pub const K_INVALID_ARGUMENT: TResult = 0x8007_0057_u32 as i32;
#[cfg(not(windows))]
pub const K_INVALID_ARGUMENT: TResult = 2;

#[cfg(windows)]
pub const K_NOT_IMPLEMENTED: TResult = 0x8000_4001_u32 as i32;
#[cfg(not(windows))]
pub const K_NOT_IMPLEMENTED: TResult = 3;

/// Build an interface id from its four SDK words.
///
/// On Windows the SDK is COM compatible and stores the first two words in
/// GUID byte order; everywhere else all four words are big-endian.
pub const fn uid(l1: u32, l2: u32, l3: u32, l4: u32) -> Tuid {
    let a = l1.to_be_bytes();
    let b = l2.to_be_bytes();
    let c = l3.to_be_bytes();
    let d = l4.to_be_bytes();
    if cfg!(windows) {
        [
            a[3], a[2], a[1], a[0], b[1], b[0], b[3], b[2], c[0], c[1], c[2], c[3], d[0], d[1],
            d[2], d[3],
        ]
    } else {
        [
            a[0], a[1], a[2], a[3], b[0], b[1], b[2], b[3], c[0], c[1], c[2], c[3], d[0], d[1],
            d[2], d[3],
        ]
    }
}

pub const FUNKNOWN_IID: Tuid = uid(0x0000_0000, 0x0000_0000, 0xC000_0000, 0x0000_0046);
pub const IPLUGIN_BASE_IID: Tuid = uid(0x2288_8DDB, 0x156E_45AE, 0x8358_B348, 0x0819_0625);
pub const IPLUGIN_FACTORY_IID: Tuid = uid(0x7A4D_811C, 0x5211_4A1F, 0xAED9_D2EE, 0x0B43_BF9F);
pub const ICOMPONENT_IID: Tuid = uid(0xE831_FF31, 0xF2D5_4301, 0x928E_BBEE, 0x2569_7802);
pub const IAUDIO_PROCESSOR_IID: Tuid = uid(0x4204_3F99, 0xB7DA_453C, 0xA569_E79D, 0x9AAE_C33D);
pub const IEDIT_CONTROLLER_IID: Tuid = uid(0xDCD7_BBE3, 0x7742_448D, 0xA874_AACC, 0x979C_759E);
pub const ICONNECTION_POINT_IID: Tuid = uid(0x70A4_156F, 0x6E6E_4026, 0x9891_48BF, 0xAA60_D8D1);
pub const IHOST_APPLICATION_IID: Tuid = uid(0x58E5_95CC, 0xDB2D_4969, 0x8B6A_AF8C, 0x36A6_64E5);
pub const ICOMPONENT_HANDLER_IID: Tuid = uid(0x93A0_BEA3, 0x0BD0_45DB, 0x8E89_0B0C, 0xC1E4_6AC6);
pub const IBSTREAM_IID: Tuid = uid(0xC3BF_6EA2, 0x3099_4752, 0x9B6B_F990, 0x1EE3_3E9B);
pub const IPARAMETER_CHANGES_IID: Tuid = uid(0xA477_9663, 0x0BB6_4A56, 0xB443_84A8, 0x466F_EB9D);
pub const IPARAM_VALUE_QUEUE_IID: Tuid = uid(0x0126_3A18, 0xED07_4F6F, 0x98C9_D356, 0x4686_F9BA);

/// Class category of audio processors in `PClassInfo::category`.
pub const AUDIO_EFFECT_CLASS: &str = "Audio Module Class";

pub mod media {
    pub const AUDIO: i32 = 0;
    pub const EVENT: i32 = 1;
}

pub mod direction {
    pub const INPUT: i32 = 0;
    pub const OUTPUT: i32 = 1;
}

pub mod process_mode {
    pub const REALTIME: i32 = 0;
    pub const OFFLINE: i32 = 2;
}

pub const SAMPLE_32: i32 = 0;

/// `ParameterInfo::flags` bit for automatable parameters.
pub const PARAM_CAN_AUTOMATE: i32 = 1;

/// Speaker arrangement with the first `channels` speakers set.
pub const fn speaker_arrangement(channels: usize) -> u64 {
    match channels {
        0 => 0,
        // kSpeakerM
        1 => 1 << 19,
        n if n >= 64 => u64::MAX,
        n => (1_u64 << n) - 1,
    }
}

/// Signature of the module's `GetPluginFactory` export
pub type GetPluginFactoryFn = unsafe extern "C" fn() -> *mut c_void;

/// Signature of the Linux `ModuleEntry` / `ModuleExit` exports
pub type ModuleEntryFn = unsafe extern "C" fn(*mut c_void) -> bool;
pub type ModuleExitFn = unsafe extern "C" fn() -> bool;

#[repr(C)]
pub struct FUnknownVtbl {
    pub query_interface:
        unsafe extern "C" fn(this: *mut c_void, iid: *const Tuid, obj: *mut *mut c_void) -> TResult,
    pub add_ref: unsafe extern "C" fn(this: *mut c_void) -> u32,
    pub release: unsafe extern "C" fn(this: *mut c_void) -> u32,
}

#[repr(C)]
pub struct IPluginBaseVtbl {
    pub unknown: FUnknownVtbl,
    pub initialize: unsafe extern "C" fn(this: *mut c_void, context: *mut c_void) -> TResult,
    pub terminate: unsafe extern "C" fn(this: *mut c_void) -> TResult,
}

#[repr(C)]
pub struct IPluginFactoryVtbl {
    pub unknown: FUnknownVtbl,
    pub get_factory_info: unsafe extern "C" fn(this: *mut c_void, info: *mut PFactoryInfo) -> TResult,
    pub count_classes: unsafe extern "C" fn(this: *mut c_void) -> i32,
    pub get_class_info:
        unsafe extern "C" fn(this: *mut c_void, index: i32, info: *mut PClassInfo) -> TResult,
    pub create_instance: unsafe extern "C" fn(
        this: *mut c_void,
        cid: *const c_char,
        iid: *const c_char,
        obj: *mut *mut c_void,
    ) -> TResult,
}

#[repr(C)]
pub struct IComponentVtbl {
    pub base: IPluginBaseVtbl,
    pub get_controller_class_id: unsafe extern "C" fn(this: *mut c_void, cid: *mut Tuid) -> TResult,
    pub set_io_mode: unsafe extern "C" fn(this: *mut c_void, mode: i32) -> TResult,
    pub get_bus_count: unsafe extern "C" fn(this: *mut c_void, media: i32, dir: i32) -> i32,
    pub get_bus_info: unsafe extern "C" fn(
        this: *mut c_void,
        media: i32,
        dir: i32,
        index: i32,
        bus: *mut BusInfo,
    ) -> TResult,
    pub get_routing_info:
        unsafe extern "C" fn(this: *mut c_void, input: *mut c_void, output: *mut c_void) -> TResult,
    pub activate_bus: unsafe extern "C" fn(
        this: *mut c_void,
        media: i32,
        dir: i32,
        index: i32,
        state: TBool,
    ) -> TResult,
    pub set_active: unsafe extern "C" fn(this: *mut c_void, state: TBool) -> TResult,
    pub set_state: unsafe extern "C" fn(this: *mut c_void, stream: *mut c_void) -> TResult,
    pub get_state: unsafe extern "C" fn(this: *mut c_void, stream: *mut c_void) -> TResult,
}

#[repr(C)]
pub struct IAudioProcessorVtbl {
    pub unknown: FUnknownVtbl,
    pub set_bus_arrangements: unsafe extern "C" fn(
        this: *mut c_void,
        inputs: *mut u64,
        num_ins: i32,
        outputs: *mut u64,
        num_outs: i32,
    ) -> TResult,
    pub get_bus_arrangement:
        unsafe extern "C" fn(this: *mut c_void, dir: i32, index: i32, arr: *mut u64) -> TResult,
    pub can_process_sample_size: unsafe extern "C" fn(this: *mut c_void, size: i32) -> TResult,
    pub get_latency_samples: unsafe extern "C" fn(this: *mut c_void) -> u32,
    pub setup_processing: unsafe extern "C" fn(this: *mut c_void, setup: *mut ProcessSetup) -> TResult,
    pub set_processing: unsafe extern "C" fn(this: *mut c_void, state: TBool) -> TResult,
    pub process: unsafe extern "C" fn(this: *mut c_void, data: *mut ProcessData) -> TResult,
    pub get_tail_samples: unsafe extern "C" fn(this: *mut c_void) -> u32,
}

#[repr(C)]
pub struct IEditControllerVtbl {
    pub base: IPluginBaseVtbl,
    pub set_component_state: unsafe extern "C" fn(this: *mut c_void, stream: *mut c_void) -> TResult,
    pub set_state: unsafe extern "C" fn(this: *mut c_void, stream: *mut c_void) -> TResult,
    pub get_state: unsafe extern "C" fn(this: *mut c_void, stream: *mut c_void) -> TResult,
    pub get_parameter_count: unsafe extern "C" fn(this: *mut c_void) -> i32,
    pub get_parameter_info:
        unsafe extern "C" fn(this: *mut c_void, index: i32, info: *mut RawParameterInfo) -> TResult,
    pub get_param_string_by_value: unsafe extern "C" fn(
        this: *mut c_void,
        id: u32,
        value: f64,
        string: *mut u16,
    ) -> TResult,
    pub get_param_value_by_string: unsafe extern "C" fn(
        this: *mut c_void,
        id: u32,
        string: *const u16,
        value: *mut f64,
    ) -> TResult,
    pub normalized_param_to_plain: unsafe extern "C" fn(this: *mut c_void, id: u32, value: f64) -> f64,
    pub plain_param_to_normalized: unsafe extern "C" fn(this: *mut c_void, id: u32, value: f64) -> f64,
    pub get_param_normalized: unsafe extern "C" fn(this: *mut c_void, id: u32) -> f64,
    pub set_param_normalized: unsafe extern "C" fn(this: *mut c_void, id: u32, value: f64) -> TResult,
    pub set_component_handler: unsafe extern "C" fn(this: *mut c_void, handler: *mut c_void) -> TResult,
    pub create_view: unsafe extern "C" fn(this: *mut c_void, name: *const c_char) -> *mut c_void,
}

#[repr(C)]
pub struct IConnectionPointVtbl {
    pub unknown: FUnknownVtbl,
    pub connect: unsafe extern "C" fn(this: *mut c_void, other: *mut c_void) -> TResult,
    pub disconnect: unsafe extern "C" fn(this: *mut c_void, other: *mut c_void) -> TResult,
    pub notify: unsafe extern "C" fn(this: *mut c_void, message: *mut c_void) -> TResult,
}

#[repr(C)]
pub struct PFactoryInfo {
    pub vendor: [c_char; 64],
    pub url: [c_char; 256],
    pub email: [c_char; 128],
    pub flags: i32,
}

#[repr(C)]
pub struct PClassInfo {
    pub cid: Tuid,
    pub cardinality: i32,
    pub category: [c_char; 32],
    pub name: [c_char; 64],
}

#[repr(C)]
pub struct BusInfo {
    pub media_type: i32,
    pub direction: i32,
    pub channel_count: i32,
    pub name: [u16; 128],
    pub bus_type: i32,
    pub flags: u32,
}

#[repr(C)]
pub struct ProcessSetup {
    pub process_mode: i32,
    pub symbolic_sample_size: i32,
    pub max_samples_per_block: i32,
    pub sample_rate: f64,
}

#[repr(C)]
pub struct AudioBusBuffers {
    pub num_channels: i32,
    pub silence_flags: u64,
    pub channel_buffers_32: *mut *mut f32,
}

#[repr(C)]
pub struct ProcessData {
    pub process_mode: i32,
    pub symbolic_sample_size: i32,
    pub num_samples: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub inputs: *mut AudioBusBuffers,
    pub outputs: *mut AudioBusBuffers,
    pub input_parameter_changes: *mut c_void,
    pub output_parameter_changes: *mut c_void,
    pub input_events: *mut c_void,
    pub output_events: *mut c_void,
    pub process_context: *mut c_void,
}

#[repr(C)]
pub struct RawParameterInfo {
    pub id: u32,
    pub title: [u16; 128],
    pub short_title: [u16; 128],
    pub units: [u16; 128],
    pub step_count: i32,
    pub default_normalized_value: f64,
    pub unit_id: i32,
    pub flags: i32,
}

/// Zero-initialized FFI output struct.
///
/// Only used for the plain-data structs above, which are valid all-zero.
pub fn zeroed<T: Zeroable>() -> T {
    T::zeroed()
}

pub trait Zeroable: Sized {
    fn zeroed() -> Self;
}

macro_rules! zeroable {
    ($($ty:ty),*) => {
        $(impl Zeroable for $ty {
            #[allow(unsafe_code)]
            fn zeroed() -> Self {
                // SAFETY: integer, float and array-of-integer fields only.
                unsafe { std::mem::zeroed() }
            }
        })*
    };
}

zeroable!(PFactoryInfo, PClassInfo, BusInfo, RawParameterInfo);

/// Owning pointer to a foreign COM object.
///
/// Holds one reference; `Clone` adds one and `Drop` releases one. `V` is the
/// vtable type of the interface the pointer was obtained for.
pub struct ComPtr<V> {
    ptr: NonNull<c_void>,
    _vtbl: PhantomData<*const V>,
}

impl<V> ComPtr<V> {
    /// Adopt a raw interface pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a live object whose first field is a
    /// pointer to a `V` vtable, and the caller must own one reference to it.
    #[allow(unsafe_code)]
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self {
            ptr,
            _vtbl: PhantomData,
        })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }

    /// The interface's vtable
    #[allow(unsafe_code)]
    pub fn vtbl(&self) -> &V {
        // SAFETY: upheld by `from_raw`.
        unsafe { &**self.ptr.as_ptr().cast::<*const V>() }
    }

    #[allow(unsafe_code)]
    fn unknown(&self) -> &FUnknownVtbl {
        // SAFETY: every VST3 vtable begins with the FUnknown methods.
        unsafe { &**self.ptr.as_ptr().cast::<*const FUnknownVtbl>() }
    }

    /// `queryInterface` for another interface of the same object.
    #[allow(unsafe_code)]
    pub fn query<U>(&self, iid: &Tuid) -> Option<ComPtr<U>> {
        let mut obj = std::ptr::null_mut();
        // SAFETY: valid object, valid out pointer.
        let result = unsafe { (self.unknown().query_interface)(self.as_ptr(), iid, &raw mut obj) };
        if result != K_RESULT_OK {
            return None;
        }
        // SAFETY: a successful queryInterface hands us one reference.
        unsafe { ComPtr::from_raw(obj) }
    }

    /// Whether two pointers refer to the same interface pointer.
    pub fn same_object<U>(&self, other: &ComPtr<U>) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}

impl<V> Clone for ComPtr<V> {
    #[allow(unsafe_code)]
    fn clone(&self) -> Self {
        // SAFETY: valid object.
        unsafe { (self.unknown().add_ref)(self.as_ptr()) };
        Self {
            ptr: self.ptr,
            _vtbl: PhantomData,
        }
    }
}

impl<V> Drop for ComPtr<V> {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: we own exactly one reference.
        unsafe { (self.unknown().release)(self.as_ptr()) };
    }
}

/// Read a NUL-terminated `char8` array.
pub fn c_chars_to_string(chars: &[c_char]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Read a NUL-terminated `String128`.
pub fn utf16_to_string(chars: &[u16]) -> String {
    let len = chars.iter().position(|&c| c == 0).unwrap_or(chars.len());
    String::from_utf16_lossy(&chars[..len])
}

/// Hex rendering of a class id, used in descriptor ids.
pub fn tuid_to_hex(id: &Tuid) -> String {
    use std::fmt::Write;
    id.iter().fold(String::with_capacity(32), |mut out, byte| {
        let _ = write!(out, "{byte:02X}");
        out
    })
}
