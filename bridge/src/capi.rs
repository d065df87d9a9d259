//! C ABI for native extension code.
//!
//! Every function takes the runtime it operates on; a handle is only
//! meaningful to the runtime that issued it. Functions returning a "new"
//! handle transfer one count to the caller, "borrowed" ones do not.
//! Broken invariants abort the process.
#![allow(non_snake_case)]

use core::ffi::{c_char, c_int};
use core::ptr::{self, NonNull};

use object::Cell;

use crate::handles::NativeHandle;
use crate::runtime::Runtime;

#[inline(always)]
unsafe fn runtime<'a>(runtime: *mut Runtime) -> &'a mut Runtime {
    assert!(!runtime.is_null(), "null runtime passed to the native API");
    // SAFETY: non-null, and the caller holds the runtime exclusively
    unsafe { &mut *runtime }
}

#[inline(always)]
fn handle(handle: *mut NativeHandle) -> NonNull<NativeHandle> {
    match NonNull::new(handle) {
        Some(handle) => handle,
        None => panic!("null native handle passed to the native API"),
    }
}

/// # Safety
///
/// `rt` must be a live runtime; `h` a handle it issued.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_IncRef(rt: *mut Runtime, h: *mut NativeHandle) {
    unsafe { runtime(rt).incref(handle(h)) }
}

/// # Safety
///
/// `rt` must be a live runtime; `h` a handle it issued.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_DecRef(rt: *mut Runtime, h: *mut NativeHandle) {
    unsafe { runtime(rt).decref(handle(h)) };
}

/// Take a new count of `h` and return it.
///
/// # Safety
///
/// `rt` must be a live runtime; `h` a handle it issued.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_NewRef(rt: *mut Runtime, h: *mut NativeHandle) -> *mut NativeHandle {
    unsafe { runtime(rt).incref(handle(h)) };
    h
}

/// Borrowed handle of the type of `h`.
///
/// # Safety
///
/// `rt` must be a live runtime; `h` a handle it issued.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_Type(rt: *mut Runtime, h: *mut NativeHandle) -> *mut NativeHandle {
    unsafe { runtime(rt).type_handle(handle(h)) }.as_ptr()
}

/// Borrowed handle of `None`.
///
/// # Safety
///
/// `rt` must be a live runtime.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_None(rt: *mut Runtime) -> *mut NativeHandle {
    unsafe { runtime(rt) }.new_borrowed_reference(Cell::NONE).as_ptr()
}

/// New handle of an integer, or null if the heap is exhausted.
///
/// # Safety
///
/// `rt` must be a live runtime.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_IntFromI64(rt: *mut Runtime, value: i64) -> *mut NativeHandle {
    let rt = unsafe { runtime(rt) };
    match rt.new_int(value) {
        Ok(cell) => rt.new_owning_reference(cell).as_ptr(),
        Err(err) => {
            log::warn!("capi: IntFromI64({value}): {err}");
            ptr::null_mut()
        }
    }
}

/// Store the value of an integer handle in `out`. Returns 0 on success, -1
/// if `h` is not an integer or does not fit.
///
/// # Safety
///
/// `rt` must be a live runtime; `h` a handle it issued; `out` writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_IntAsI64(rt: *mut Runtime, h: *mut NativeHandle, out: *mut i64) -> c_int {
    let rt = unsafe { runtime(rt) };
    let cell = unsafe { rt.as_cell(handle(h)) };
    match rt.int_value(cell).and_then(|n| i64::try_from(n).ok()) {
        Some(n) => {
            unsafe { out.write(n) };
            0
        }
        None => -1,
    }
}

/// New handle of a copy of `len` bytes at `data`, or null if the heap is
/// exhausted.
///
/// # Safety
///
/// `rt` must be a live runtime; `data` readable for `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_BytesFromStringAndSize(
    rt: *mut Runtime,
    data: *const c_char,
    len: usize,
) -> *mut NativeHandle {
    let rt = unsafe { runtime(rt) };
    let bytes = if len == 0 {
        &[][..]
    } else {
        unsafe { core::slice::from_raw_parts(data.cast::<u8>(), len) }
    };
    match rt.new_bytes(bytes) {
        Ok(cell) => rt.new_owning_reference(cell).as_ptr(),
        Err(err) => {
            log::warn!("capi: BytesFromStringAndSize({len}): {err}");
            ptr::null_mut()
        }
    }
}

/// NUL-terminated contents of a bytes handle, owned by the handle. Null if
/// `h` is not bytes.
///
/// # Safety
///
/// `rt` must be a live runtime; `h` a handle it issued.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_BytesAsCStr(rt: *mut Runtime, h: *mut NativeHandle) -> *const c_char {
    match unsafe { runtime(rt).bytes_as_c_str(handle(h)) } {
        Some(text) => text.as_ptr(),
        None => ptr::null(),
    }
}

/// Borrowed handle of element `index` of a tuple, or null if `h` is not a
/// tuple or the index is out of range.
///
/// # Safety
///
/// `rt` must be a live runtime; `h` a handle it issued.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_TupleGetItem(
    rt: *mut Runtime,
    h: *mut NativeHandle,
    index: usize,
) -> *mut NativeHandle {
    let rt = unsafe { runtime(rt) };
    let tuple = unsafe { rt.as_cell(handle(h)) };
    match rt.tuple_get(tuple, index) {
        Some(item) => rt.new_borrowed_reference(item).as_ptr(),
        None => ptr::null_mut(),
    }
}

/// # Safety
///
/// `rt` must be a live runtime.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Bridge_Collect(rt: *mut Runtime) {
    unsafe { runtime(rt) }.collect();
}
