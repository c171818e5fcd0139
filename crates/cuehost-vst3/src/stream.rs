//! Memory-backed `IBStream` for VST3 state transfer
//!
//! Component and controller state move through these streams for preset
//! save/load and for syncing a freshly created controller with its
//! component.

use crate::com::{FUNKNOWN_IID, IBSTREAM_IID, K_INVALID_ARGUMENT, K_NO_INTERFACE, K_RESULT_FALSE};
use crate::com::{K_RESULT_OK, TResult, Tuid};
use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

/// Memory-based `IBStream` implementation
#[repr(C)]
pub struct MemoryStream {
    /// COM vtable pointer (must be first field)
    vtable: *const IBStreamVTable,

    /// Reference count for COM lifetime management
    ref_count: AtomicU32,

    data: Vec<u8>,
    position: usize,
}

/// `IBStream` vtable structure
#[repr(C)]
struct IBStreamVTable {
    // FUnknown methods
    query_interface:
        unsafe extern "C" fn(this: *mut c_void, iid: *const Tuid, obj: *mut *mut c_void) -> TResult,
    add_ref: unsafe extern "C" fn(this: *mut c_void) -> u32,
    release: unsafe extern "C" fn(this: *mut c_void) -> u32,

    // IBStream methods
    read: unsafe extern "C" fn(
        this: *mut c_void,
        buffer: *mut c_void,
        num_bytes: i32,
        num_bytes_read: *mut i32,
    ) -> TResult,
    write: unsafe extern "C" fn(
        this: *mut c_void,
        buffer: *const c_void,
        num_bytes: i32,
        num_bytes_written: *mut i32,
    ) -> TResult,
    seek: unsafe extern "C" fn(this: *mut c_void, pos: i64, mode: i32, result: *mut i64) -> TResult,
    tell: unsafe extern "C" fn(this: *mut c_void, pos: *mut i64) -> TResult,
}

/// Seek modes
const K_IBSEEK_SET: i32 = 0;
const K_IBSEEK_CUR: i32 = 1;
const K_IBSEEK_END: i32 = 2;

static VTABLE: IBStreamVTable = IBStreamVTable {
    query_interface,
    add_ref,
    release,
    read,
    write,
    seek,
    tell,
};

/// The host's reference to a `MemoryStream`.
///
/// Plugins may retain their own references past a call; the allocation is
/// freed when the last reference is released.
pub struct StreamRef {
    ptr: *mut MemoryStream,
}

impl StreamRef {
    /// Create an empty stream
    pub fn new() -> Self {
        Self::from_bytes(Vec::new())
    }

    /// Create a stream positioned at the start of `data`
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let stream = Box::new(MemoryStream {
            vtable: &raw const VTABLE,
            ref_count: AtomicU32::new(1),
            data,
            position: 0,
        });
        Self {
            ptr: Box::into_raw(stream),
        }
    }

    /// Raw `IBStream*` to hand to the plugin
    pub fn as_com_ptr(&self) -> *mut c_void {
        self.ptr.cast::<c_void>()
    }

    #[allow(unsafe_code)]
    fn stream(&self) -> &MemoryStream {
        // SAFETY: we hold a reference, so the allocation is alive.
        unsafe { &*self.ptr }
    }

    pub fn data(&self) -> &[u8] {
        &self.stream().data
    }

    /// Seek back to the start so the same bytes can be read again.
    #[allow(unsafe_code)]
    pub fn rewind(&mut self) {
        // SAFETY: plugin calls into the stream happen on this thread, inside
        // host calls, never concurrently with this one.
        unsafe { (*self.ptr).position = 0 };
    }
}

impl Default for StreamRef {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamRef {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: releases the reference created in `from_bytes`.
        unsafe { release(self.ptr.cast::<c_void>()) };
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
    if iid_bytes == IBSTREAM_IID || iid_bytes == FUNKNOWN_IID {
        unsafe {
            *obj = this;
            let stream = &*(this.cast::<MemoryStream>());
            stream.ref_count.fetch_add(1, Ordering::Relaxed);
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
    let stream = unsafe { &*(this.cast::<MemoryStream>()) };
    stream.ref_count.fetch_add(1, Ordering::Relaxed) + 1
}

#[allow(unsafe_code)]
unsafe extern "C" fn release(this: *mut c_void) -> u32 {
    if this.is_null() {
        return 0;
    }

    let stream = unsafe { &*(this.cast::<MemoryStream>()) };
    let old_count = stream.ref_count.fetch_sub(1, Ordering::AcqRel);
    match old_count {
        1 => {
            unsafe {
                drop(Box::from_raw(this.cast::<MemoryStream>()));
            }
            0
        }
        0 => {
            tracing::error!("IBStream released with zero references");
            0
        }
        n => n - 1,
    }
}

#[allow(unsafe_code)]
unsafe extern "C" fn read(
    this: *mut c_void,
    buffer: *mut c_void,
    num_bytes: i32,
    num_bytes_read: *mut i32,
) -> TResult {
    if this.is_null() || buffer.is_null() {
        return K_INVALID_ARGUMENT;
    }

    let stream = unsafe { &mut *(this.cast::<MemoryStream>()) };
    let to_read = num_bytes.max(0) as usize;
    let available = stream.data.len().saturating_sub(stream.position);
    let actual_read = to_read.min(available);

    if actual_read > 0 {
        unsafe {
            std::ptr::copy_nonoverlapping(
                stream.data.as_ptr().add(stream.position),
                buffer.cast::<u8>(),
                actual_read,
            );
        }
        stream.position += actual_read;
    }

    if !num_bytes_read.is_null() {
        unsafe {
            *num_bytes_read = actual_read as i32;
        }
    }

    if actual_read == to_read {
        K_RESULT_OK
    } else {
        K_RESULT_FALSE
    }
}

#[allow(unsafe_code)]
unsafe extern "C" fn write(
    this: *mut c_void,
    buffer: *const c_void,
    num_bytes: i32,
    num_bytes_written: *mut i32,
) -> TResult {
    if this.is_null() || buffer.is_null() {
        return K_INVALID_ARGUMENT;
    }

    let stream = unsafe { &mut *(this.cast::<MemoryStream>()) };
    let to_write = num_bytes.max(0) as usize;

    if stream.position + to_write > stream.data.len() {
        stream.data.resize(stream.position + to_write, 0);
    }

    if to_write > 0 {
        unsafe {
            std::ptr::copy_nonoverlapping(
                buffer.cast::<u8>(),
                stream.data.as_mut_ptr().add(stream.position),
                to_write,
            );
        }
        stream.position += to_write;
    }

    if !num_bytes_written.is_null() {
        unsafe {
            *num_bytes_written = to_write as i32;
        }
    }

    K_RESULT_OK
}

#[allow(unsafe_code)]
unsafe extern "C" fn seek(this: *mut c_void, pos: i64, mode: i32, result: *mut i64) -> TResult {
    if this.is_null() {
        return K_INVALID_ARGUMENT;
    }

    let stream = unsafe { &mut *(this.cast::<MemoryStream>()) };

    let new_pos = match mode {
        K_IBSEEK_SET => pos,
        K_IBSEEK_CUR => stream.position as i64 + pos,
        K_IBSEEK_END => stream.data.len() as i64 + pos,
        _ => return K_INVALID_ARGUMENT,
    };
    stream.position = new_pos.max(0) as usize;

    if !result.is_null() {
        unsafe {
            *result = stream.position as i64;
        }
    }

    K_RESULT_OK
}

#[allow(unsafe_code)]
unsafe extern "C" fn tell(this: *mut c_void, pos: *mut i64) -> TResult {
    if this.is_null() || pos.is_null() {
        return K_INVALID_ARGUMENT;
    }

    let stream = unsafe { &*(this.cast::<MemoryStream>()) };
    unsafe {
        *pos = stream.position as i64;
    }

    K_RESULT_OK
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    fn vtbl(stream: &StreamRef) -> &'static IBStreamVTable {
        unsafe { &*(*stream.ptr).vtable }
    }

    #[test]
    fn test_write_then_read_back() {
        let mut stream = StreamRef::new();
        let this = stream.as_com_ptr();
        let payload = *b"state";
        let mut written = 0;
        let result =
            unsafe { (vtbl(&stream).write)(this, payload.as_ptr().cast(), 5, &raw mut written) };
        assert_eq!(result, K_RESULT_OK);
        assert_eq!(written, 5);
        assert_eq!(stream.data(), b"state");

        stream.rewind();
        let mut out = [0_u8; 8];
        let mut read_count = 0;
        let result =
            unsafe { (vtbl(&stream).read)(this, out.as_mut_ptr().cast(), 8, &raw mut read_count) };
        // Short read reports kResultFalse with the bytes that were available.
        assert_eq!(result, K_RESULT_FALSE);
        assert_eq!(read_count, 5);
        assert_eq!(&out[..5], b"state");
    }

    #[test]
    fn test_seek_and_tell() {
        let stream = StreamRef::from_bytes(vec![0; 10]);
        let this = stream.as_com_ptr();
        let mut pos = 0;
        unsafe {
            (vtbl(&stream).seek)(this, -3, K_IBSEEK_END, &raw mut pos);
        }
        assert_eq!(pos, 7);
        unsafe {
            (vtbl(&stream).seek)(this, 1, K_IBSEEK_CUR, std::ptr::null_mut());
            (vtbl(&stream).tell)(this, &raw mut pos);
        }
        assert_eq!(pos, 8);
    }

    #[test]
    fn test_plugin_reference_outlives_host_reference() {
        let stream = StreamRef::from_bytes(vec![1, 2, 3]);
        let this = stream.as_com_ptr();
        let table = vtbl(&stream);
        unsafe { (table.add_ref)(this) };
        drop(stream);
        // The plugin's reference is still valid and is the last one.
        let mut pos = -1;
        unsafe { (table.tell)(this, &raw mut pos) };
        assert_eq!(pos, 0);
        assert_eq!(unsafe { (table.release)(this) }, 0);
    }

    #[test]
    fn test_query_interface() {
        let stream = StreamRef::new();
        let this = stream.as_com_ptr();
        let mut obj = std::ptr::null_mut();
        let result = unsafe { (vtbl(&stream).query_interface)(this, &IBSTREAM_IID, &raw mut obj) };
        assert_eq!(result, K_RESULT_OK);
        assert_eq!(obj, this);
        unsafe { (vtbl(&stream).release)(this) };

        let other = [7_u8; 16];
        let result = unsafe { (vtbl(&stream).query_interface)(this, &other, &raw mut obj) };
        assert_eq!(result, K_NO_INTERFACE);
        assert!(obj.is_null());
    }
}
