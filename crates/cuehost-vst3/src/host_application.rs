//! `IHostApplication` implementation for VST3 host
//!
//! Passed as the context to `IPluginBase::initialize`; plugins use it to
//! identify the host.

use crate::com::{
    ComPtr, FUNKNOWN_IID, FUnknownVtbl, IHOST_APPLICATION_IID, K_INVALID_ARGUMENT,
    K_NO_INTERFACE, K_RESULT_FALSE, K_RESULT_OK, TResult, Tuid,
};
use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

const HOST_NAME: &str = "cuehost";

/// Basic `IHostApplication` implementation
#[repr(C)]
pub struct HostApplication {
    /// COM vtable pointer (must be first field)
    vtable: *const IHostApplicationVTable,

    /// Reference count for COM lifetime management
    ref_count: AtomicU32,
}

#[repr(C)]
struct IHostApplicationVTable {
    // FUnknown methods
    query_interface:
        unsafe extern "C" fn(this: *mut c_void, iid: *const Tuid, obj: *mut *mut c_void) -> TResult,
    add_ref: unsafe extern "C" fn(this: *mut c_void) -> u32,
    release: unsafe extern "C" fn(this: *mut c_void) -> u32,

    // IHostApplication methods
    get_name: unsafe extern "C" fn(this: *mut c_void, name: *mut u16) -> TResult,
    create_instance: unsafe extern "C" fn(
        this: *mut c_void,
        cid: *const Tuid,
        iid: *const Tuid,
        obj: *mut *mut c_void,
    ) -> TResult,
}

static VTABLE: IHostApplicationVTable = IHostApplicationVTable {
    query_interface,
    add_ref,
    release,
    get_name,
    create_instance,
};

impl HostApplication {
    /// Allocate a host context; the returned pointer owns the first reference.
    #[allow(unsafe_code)]
    pub fn create() -> ComPtr<FUnknownVtbl> {
        let host = Box::new(Self {
            vtable: &raw const VTABLE,
            ref_count: AtomicU32::new(1),
        });
        let ptr = Box::into_raw(host).cast::<c_void>();
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
    if iid_bytes == IHOST_APPLICATION_IID || iid_bytes == FUNKNOWN_IID {
        unsafe {
            *obj = this;
            let host_app = &*(this.cast::<HostApplication>());
            host_app.ref_count.fetch_add(1, Ordering::Relaxed);
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
    let host_app = unsafe { &*(this.cast::<HostApplication>()) };
    host_app.ref_count.fetch_add(1, Ordering::Relaxed) + 1
}

#[allow(unsafe_code)]
unsafe extern "C" fn release(this: *mut c_void) -> u32 {
    if this.is_null() {
        return 0;
    }

    let host_app = unsafe { &*(this.cast::<HostApplication>()) };
    let old_count = host_app.ref_count.fetch_sub(1, Ordering::AcqRel);
    match old_count {
        1 => {
            unsafe {
                drop(Box::from_raw(this.cast::<HostApplication>()));
            }
            0
        }
        0 => {
            tracing::error!("IHostApplication released with zero references");
            0
        }
        n => n - 1,
    }
}

#[allow(unsafe_code)]
unsafe extern "C" fn get_name(this: *mut c_void, name: *mut u16) -> TResult {
    if this.is_null() || name.is_null() {
        return K_INVALID_ARGUMENT;
    }

    // String128: at most 127 code units plus terminator.
    let units: Vec<u16> = HOST_NAME.encode_utf16().take(127).chain([0]).collect();
    unsafe {
        std::ptr::copy_nonoverlapping(units.as_ptr(), name, units.len());
    }
    K_RESULT_OK
}

#[allow(unsafe_code)]
unsafe extern "C" fn create_instance(
    this: *mut c_void,
    _cid: *const Tuid,
    _iid: *const Tuid,
    obj: *mut *mut c_void,
) -> TResult {
    if this.is_null() || obj.is_null() {
        return K_INVALID_ARGUMENT;
    }

    // No host-provided IMessage / IAttributeList objects.
    unsafe {
        *obj = std::ptr::null_mut();
    }
    K_RESULT_FALSE
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn test_get_name() {
        let host = HostApplication::create();
        let table = unsafe { &*(*host.as_ptr().cast::<HostApplication>()).vtable };
        let mut name = [0_u16; 128];
        let result = unsafe { (table.get_name)(host.as_ptr(), name.as_mut_ptr()) };
        assert_eq!(result, K_RESULT_OK);
        assert_eq!(crate::com::utf16_to_string(&name), HOST_NAME);
    }

    #[test]
    fn test_query_and_clone_keep_object_alive() {
        let host = HostApplication::create();
        let same: Option<ComPtr<FUnknownVtbl>> = host.query(&IHOST_APPLICATION_IID);
        let same = same.expect("IHostApplication");
        assert!(host.same_object(&same));
        let cloned = host.clone();
        drop(host);
        drop(same);
        let count = unsafe { &*cloned.as_ptr().cast::<HostApplication>() }
            .ref_count
            .load(Ordering::Relaxed);
        assert_eq!(count, 1);
    }
}
