//! VST3 parameter change queue implementations
//!
//! Implements `IParamValueQueue` and `IParameterChanges` for transmitting
//! parameter changes from the host to the audio processor.
//!
//! Everything is preallocated: queues live in one boxed slice and points in
//! fixed arrays, so filling and clearing between blocks never allocates. Both
//! objects are host-owned; their reference counts are nominal and `release`
//! never frees.

use crate::com::{
    FUNKNOWN_IID, IPARAM_VALUE_QUEUE_IID, IPARAMETER_CHANGES_IID, K_INVALID_ARGUMENT,
    K_NO_INTERFACE, K_RESULT_FALSE, K_RESULT_OK, TResult, Tuid,
};
use std::ffi::c_void;

/// Distinct parameters that can change within one block.
pub const MAX_QUEUES: usize = 64;

/// Points per parameter within one block.
pub const MAX_POINTS: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct ValuePoint {
    sample_offset: i32,
    value: f64,
}

/// Implementation of `IParamValueQueue`
#[repr(C)]
pub struct ParamValueQueue {
    /// COM vtable pointer
    vtable: *const IParamValueQueueVTable,
    param_id: u32,
    len: usize,
    points: [ValuePoint; MAX_POINTS],
}

#[repr(C)]
struct IParamValueQueueVTable {
    // FUnknown methods
    query_interface:
        unsafe extern "C" fn(this: *mut c_void, iid: *const Tuid, obj: *mut *mut c_void) -> TResult,
    add_ref: unsafe extern "C" fn(this: *mut c_void) -> u32,
    release: unsafe extern "C" fn(this: *mut c_void) -> u32,

    // IParamValueQueue methods
    get_parameter_id: unsafe extern "C" fn(this: *mut c_void) -> u32,
    get_point_count: unsafe extern "C" fn(this: *mut c_void) -> i32,
    get_point: unsafe extern "C" fn(
        this: *mut c_void,
        index: i32,
        sample_offset: *mut i32,
        value: *mut f64,
    ) -> TResult,
    add_point: unsafe extern "C" fn(
        this: *mut c_void,
        sample_offset: i32,
        value: f64,
        index: *mut i32,
    ) -> TResult,
}

static PARAM_VALUE_QUEUE_VTABLE: IParamValueQueueVTable = IParamValueQueueVTable {
    query_interface: queue_query_interface,
    add_ref: nominal_add_ref,
    release: nominal_release,
    get_parameter_id,
    get_point_count,
    get_point,
    add_point,
};

impl ParamValueQueue {
    fn empty() -> Self {
        Self {
            vtable: &raw const PARAM_VALUE_QUEUE_VTABLE,
            param_id: 0,
            len: 0,
            points: [ValuePoint::default(); MAX_POINTS],
        }
    }

    /// Append a point; when full the last point is overwritten so the
    /// newest value always wins.
    fn push(&mut self, sample_offset: i32, value: f64) -> usize {
        let point = ValuePoint {
            sample_offset,
            value,
        };
        if self.len < MAX_POINTS {
            self.points[self.len] = point;
            self.len += 1;
        } else {
            self.points[MAX_POINTS - 1] = point;
        }
        self.len - 1
    }
}

/// Implementation of `IParameterChanges`
#[repr(C)]
pub struct ParameterChanges {
    /// COM vtable pointer
    vtable: *const IParameterChangesVTable,
    used: usize,
    queues: Box<[ParamValueQueue]>,
}

#[repr(C)]
struct IParameterChangesVTable {
    // FUnknown methods
    query_interface:
        unsafe extern "C" fn(this: *mut c_void, iid: *const Tuid, obj: *mut *mut c_void) -> TResult,
    add_ref: unsafe extern "C" fn(this: *mut c_void) -> u32,
    release: unsafe extern "C" fn(this: *mut c_void) -> u32,

    // IParameterChanges methods
    get_parameter_count: unsafe extern "C" fn(this: *mut c_void) -> i32,
    get_parameter_data: unsafe extern "C" fn(this: *mut c_void, index: i32) -> *mut c_void,
    add_parameter_data:
        unsafe extern "C" fn(this: *mut c_void, id: *const u32, index: *mut i32) -> *mut c_void,
}

static PARAMETER_CHANGES_VTABLE: IParameterChangesVTable = IParameterChangesVTable {
    query_interface: changes_query_interface,
    add_ref: nominal_add_ref,
    release: nominal_release,
    get_parameter_count,
    get_parameter_data,
    add_parameter_data,
};

impl ParameterChanges {
    /// Allocate the queue storage. Boxed so the COM pointer stays stable.
    pub fn new() -> Box<Self> {
        let queues: Vec<ParamValueQueue> = (0..MAX_QUEUES).map(|_| ParamValueQueue::empty()).collect();
        Box::new(Self {
            vtable: &raw const PARAMETER_CHANGES_VTABLE,
            used: 0,
            queues: queues.into_boxed_slice(),
        })
    }

    /// Raw `IParameterChanges*` for `ProcessData`
    pub fn as_com_ptr(&mut self) -> *mut c_void {
        std::ptr::from_mut::<Self>(self).cast::<c_void>()
    }

    /// Queue a change. Returns `false` when every queue slot is taken by
    /// another parameter.
    pub fn add_change(&mut self, param_id: u32, sample_offset: i32, value: f64) -> bool {
        match self.queue_index(param_id) {
            Some(index) => {
                self.queues[index].push(sample_offset, value);
                true
            }
            None => false,
        }
    }

    /// Number of parameters with pending changes
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Forget all queued changes. Storage is kept.
    pub fn clear(&mut self) {
        for queue in &mut self.queues[..self.used] {
            queue.len = 0;
        }
        self.used = 0;
    }

    /// Index of the queue for `param_id`, claiming a free one if needed.
    fn queue_index(&mut self, param_id: u32) -> Option<usize> {
        if let Some(index) = self.queues[..self.used]
            .iter()
            .position(|queue| queue.param_id == param_id)
        {
            return Some(index);
        }
        if self.used == MAX_QUEUES {
            return None;
        }
        let index = self.used;
        self.queues[index].param_id = param_id;
        self.queues[index].len = 0;
        self.used += 1;
        Some(index)
    }
}

// SAFETY: the vtable pointer is to a static; all other state is owned data.
#[allow(unsafe_code)]
unsafe impl Send for ParameterChanges {}

// FUnknown implementations

#[allow(unsafe_code)]
unsafe extern "C" fn nominal_add_ref(_this: *mut c_void) -> u32 {
    1
}

#[allow(unsafe_code)]
unsafe extern "C" fn nominal_release(_this: *mut c_void) -> u32 {
    1
}

#[allow(unsafe_code)]
unsafe fn answer_query(this: *mut c_void, iid: *const Tuid, obj: *mut *mut c_void, own: &Tuid) -> TResult {
    if this.is_null() || iid.is_null() || obj.is_null() {
        return K_INVALID_ARGUMENT;
    }
    let iid_bytes = unsafe { *iid };
    if iid_bytes == *own || iid_bytes == FUNKNOWN_IID {
        unsafe { *obj = this };
        K_RESULT_OK
    } else {
        unsafe { *obj = std::ptr::null_mut() };
        K_NO_INTERFACE
    }
}

#[allow(unsafe_code)]
unsafe extern "C" fn queue_query_interface(
    this: *mut c_void,
    iid: *const Tuid,
    obj: *mut *mut c_void,
) -> TResult {
    unsafe { answer_query(this, iid, obj, &IPARAM_VALUE_QUEUE_IID) }
}

#[allow(unsafe_code)]
unsafe extern "C" fn changes_query_interface(
    this: *mut c_void,
    iid: *const Tuid,
    obj: *mut *mut c_void,
) -> TResult {
    unsafe { answer_query(this, iid, obj, &IPARAMETER_CHANGES_IID) }
}

// IParamValueQueue implementation

#[allow(unsafe_code)]
unsafe extern "C" fn get_parameter_id(this: *mut c_void) -> u32 {
    unsafe { (*this.cast::<ParamValueQueue>()).param_id }
}

#[allow(unsafe_code)]
unsafe extern "C" fn get_point_count(this: *mut c_void) -> i32 {
    unsafe { (*this.cast::<ParamValueQueue>()).len as i32 }
}

#[allow(unsafe_code)]
unsafe extern "C" fn get_point(
    this: *mut c_void,
    index: i32,
    sample_offset: *mut i32,
    value: *mut f64,
) -> TResult {
    if this.is_null() || sample_offset.is_null() || value.is_null() {
        return K_INVALID_ARGUMENT;
    }

    let queue = unsafe { &*this.cast::<ParamValueQueue>() };
    let Some(point) = usize::try_from(index)
        .ok()
        .filter(|&i| i < queue.len)
        .map(|i| queue.points[i])
    else {
        return K_RESULT_FALSE;
    };

    unsafe {
        *sample_offset = point.sample_offset;
        *value = point.value;
    }
    K_RESULT_OK
}

#[allow(unsafe_code)]
unsafe extern "C" fn add_point(
    this: *mut c_void,
    sample_offset: i32,
    value: f64,
    index: *mut i32,
) -> TResult {
    if this.is_null() {
        return K_INVALID_ARGUMENT;
    }

    let queue = unsafe { &mut *this.cast::<ParamValueQueue>() };
    let new_index = queue.push(sample_offset, value);
    if !index.is_null() {
        unsafe { *index = new_index as i32 };
    }
    K_RESULT_OK
}

// IParameterChanges implementation

#[allow(unsafe_code)]
unsafe extern "C" fn get_parameter_count(this: *mut c_void) -> i32 {
    unsafe { (*this.cast::<ParameterChanges>()).used as i32 }
}

#[allow(unsafe_code)]
unsafe extern "C" fn get_parameter_data(this: *mut c_void, index: i32) -> *mut c_void {
    let changes = unsafe { &mut *this.cast::<ParameterChanges>() };
    match usize::try_from(index) {
        Ok(i) if i < changes.used => std::ptr::from_mut(&mut changes.queues[i]).cast::<c_void>(),
        _ => std::ptr::null_mut(),
    }
}

#[allow(unsafe_code)]
unsafe extern "C" fn add_parameter_data(
    this: *mut c_void,
    id: *const u32,
    index: *mut i32,
) -> *mut c_void {
    if this.is_null() || id.is_null() {
        return std::ptr::null_mut();
    }

    let changes = unsafe { &mut *this.cast::<ParameterChanges>() };
    let param_id = unsafe { *id };
    let Some(slot) = changes.queue_index(param_id) else {
        return std::ptr::null_mut();
    };
    if !index.is_null() {
        unsafe { *index = slot as i32 };
    }
    std::ptr::from_mut(&mut changes.queues[slot]).cast::<c_void>()
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_group_by_parameter() {
        let mut changes = ParameterChanges::new();
        assert!(changes.add_change(7, 0, 0.1));
        assert!(changes.add_change(9, 0, 0.2));
        assert!(changes.add_change(7, 32, 0.3));
        assert_eq!(changes.len(), 2);

        let this = changes.as_com_ptr();
        unsafe {
            assert_eq!(get_parameter_count(this), 2);
            let queue = get_parameter_data(this, 0);
            assert_eq!(get_parameter_id(queue), 7);
            assert_eq!(get_point_count(queue), 2);

            let mut offset = 0;
            let mut value = 0.0;
            assert_eq!(get_point(queue, 1, &raw mut offset, &raw mut value), K_RESULT_OK);
            assert_eq!((offset, value), (32, 0.3));
            assert_eq!(get_point(queue, 2, &raw mut offset, &raw mut value), K_RESULT_FALSE);
            assert!(get_parameter_data(this, 5).is_null());
        }
    }

    #[test]
    fn test_full_queue_keeps_newest_value() {
        let mut changes = ParameterChanges::new();
        for i in 0..(MAX_POINTS + 3) {
            changes.add_change(1, 0, i as f64);
        }
        let queue = &changes.queues[0];
        assert_eq!(queue.len, MAX_POINTS);
        assert_eq!(queue.points[MAX_POINTS - 1].value, (MAX_POINTS + 2) as f64);
    }

    #[test]
    fn test_queue_slots_are_bounded_and_reusable() {
        let mut changes = ParameterChanges::new();
        for id in 0..MAX_QUEUES as u32 {
            assert!(changes.add_change(id, 0, 0.5));
        }
        assert!(!changes.add_change(999, 0, 0.5));

        changes.clear();
        assert!(changes.is_empty());
        assert!(changes.add_change(999, 0, 0.5));
        assert_eq!(changes.queues[0].len, 1);
    }

    #[test]
    fn test_plugin_side_add_parameter_data() {
        let mut changes = ParameterChanges::new();
        let this = changes.as_com_ptr();
        let id = 42_u32;
        let mut index = -1;
        unsafe {
            let queue = add_parameter_data(this, &raw const id, &raw mut index);
            assert!(!queue.is_null());
            assert_eq!(index, 0);
            let mut point_index = -1;
            add_point(queue, 5, 0.75, &raw mut point_index);
            assert_eq!(point_index, 0);
        }
        assert_eq!(changes.len(), 1);
    }
}
