//! `IComponentHandler` implementation for VST3 host
//!
//! Edit controllers report parameter edits made in their own UI through this
//! interface. `performEdit` becomes a `ParameterChanged` notification; the
//! other callbacks only log.

use crate::com::{
    ComPtr, FUNKNOWN_IID, FUnknownVtbl, ICOMPONENT_HANDLER_IID, K_INVALID_ARGUMENT,
    K_NO_INTERFACE, K_RESULT_OK, TResult, Tuid,
};
use crossbeam_channel::Sender;
use cuehost_plugin::PluginNotification;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

/// `IComponentHandler` forwarding edits to a notification channel
#[repr(C)]
pub struct ComponentHandler {
    /// COM vtable pointer (must be first field)
    vtable: *const IComponentHandlerVTable,

    /// Reference count for COM lifetime management
    ref_count: AtomicU32,

    notifications: Sender<PluginNotification>,
}

#[repr(C)]
struct IComponentHandlerVTable {
    // FUnknown methods
    query_interface:
        unsafe extern "C" fn(this: *mut c_void, iid: *const Tuid, obj: *mut *mut c_void) -> TResult,
    add_ref: unsafe extern "C" fn(this: *mut c_void) -> u32,
    release: unsafe extern "C" fn(this: *mut c_void) -> u32,

    // IComponentHandler methods
    begin_edit: unsafe extern "C" fn(this: *mut c_void, id: u32) -> TResult,
    perform_edit: unsafe extern "C" fn(this: *mut c_void, id: u32, value_normalized: f64) -> TResult,
    end_edit: unsafe extern "C" fn(this: *mut c_void, id: u32) -> TResult,
    restart_component: unsafe extern "C" fn(this: *mut c_void, flags: i32) -> TResult,
}

static VTABLE: IComponentHandlerVTable = IComponentHandlerVTable {
    query_interface,
    add_ref,
    release,
    begin_edit,
    perform_edit,
    end_edit,
    restart_component,
};

impl ComponentHandler {
    /// Allocate a handler; the returned pointer owns the first reference.
    #[allow(unsafe_code)]
    pub fn create(notifications: Sender<PluginNotification>) -> ComPtr<FUnknownVtbl> {
        let handler = Box::new(Self {
            vtable: &raw const VTABLE,
            ref_count: AtomicU32::new(1),
            notifications,
        });
        let ptr = Box::into_raw(handler).cast::<c_void>();
        // SAFETY: fresh allocation with one reference, FUnknown-first vtable.
        unsafe { ComPtr::from_raw(ptr) }.unwrap_or_else(|| unreachable!("Box is never null"))
    }
}

// COM vtable implementations

#[allow(unsafe_code)]
unsafe extern "C" fn query_interface(
    this: *mut c_void,
    iid: *const Tuid,
    obj: *mut *mut c_void,
) -> TResult {
    if this.is_null() || iid.is_null() || obj.is_null() {
        return K_INVALID_ARGUMENT;
    }

    let iid_bytes = unsafe { *iid };
    if iid_bytes == ICOMPONENT_HANDLER_IID || iid_bytes == FUNKNOWN_IID {
        unsafe {
            *obj = this;
            let handler = &*(this.cast::<ComponentHandler>());
            handler.ref_count.fetch_add(1, Ordering::Relaxed);
        }
        K_RESULT_OK
    } else {
        unsafe {
            *obj = std::ptr::null_mut();
        }
        K_NO_INTERFACE
    }
}

#[allow(unsafe_code)]
unsafe extern "C" fn add_ref(this: *mut c_void) -> u32 {
    if this.is_null() {
        return 0;
    }
    let handler = unsafe { &*(this.cast::<ComponentHandler>()) };
    handler.ref_count.fetch_add(1, Ordering::Relaxed) + 1
}

#[allow(unsafe_code)]
unsafe extern "C" fn release(this: *mut c_void) -> u32 {
    if this.is_null() {
        return 0;
    }

    let handler = unsafe { &*(this.cast::<ComponentHandler>()) };
    let old_count = handler.ref_count.fetch_sub(1, Ordering::AcqRel);
    match old_count {
        1 => {
            unsafe {
                drop(Box::from_raw(this.cast::<ComponentHandler>()));
            }
            0
        }
        0 => {
            tracing::error!("IComponentHandler released with zero references");
            0
        }
        n => n - 1,
    }
}

#[allow(unsafe_code)]
unsafe extern "C" fn begin_edit(_this: *mut c_void, id: u32) -> TResult {
    tracing::trace!("beginEdit({id})");
    K_RESULT_OK
}

#[allow(unsafe_code)]
unsafe extern "C" fn perform_edit(this: *mut c_void, id: u32, value_normalized: f64) -> TResult {
    if this.is_null() {
        return K_INVALID_ARGUMENT;
    }

    let handler = unsafe { &*(this.cast::<ComponentHandler>()) };
    // The instance may already be gone; a closed channel is fine.
    let _ = handler
        .notifications
        .try_send(PluginNotification::ParameterChanged {
            id,
            value: value_normalized as f32,
        });
    K_RESULT_OK
}

#[allow(unsafe_code)]
unsafe extern "C" fn end_edit(_this: *mut c_void, id: u32) -> TResult {
    tracing::trace!("endEdit({id})");
    K_RESULT_OK
}

#[allow(unsafe_code)]
unsafe extern "C" fn restart_component(_this: *mut c_void, flags: i32) -> TResult {
    tracing::debug!("restartComponent(0x{flags:x}) requested; ignored");
    K_RESULT_OK
}
