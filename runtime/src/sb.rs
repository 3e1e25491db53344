//! StringBuilder primitives
//!
//! Incremental string assembly without per-push record allocation. The
//! handle is a boxed byte buffer cast to i64; `build` snapshots the
//! buffer into a fresh string record and leaves the builder reusable.

use crate::string::{bmb_string_new, BmbString};

unsafe fn deref(handle: i64) -> *mut Vec<u8> {
    handle as *mut Vec<u8>
}

/// Allocate an empty builder.
#[unsafe(no_mangle)]
pub extern "C" fn bmb_sb_new() -> i64 {
    Box::into_raw(Box::new(Vec::<u8>::new())) as i64
}

/// Free a builder.
///
/// # Safety
/// `handle` must come from bmb_sb_new and must not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_sb_free(handle: i64) -> i64 {
    if handle != 0 {
        unsafe {
            drop(Box::from_raw(deref(handle)));
        }
    }
    0
}

/// Append a string's bytes. Returns the handle for chaining.
///
/// # Safety
/// `handle` must be a live builder handle; `s` a valid string record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_sb_push(handle: i64, s: *const BmbString) -> i64 {
    unsafe {
        (*deref(handle)).extend_from_slice(crate::string::bytes_of(s));
    }
    handle
}

/// Append one byte.
///
/// # Safety
/// `handle` must be a live builder handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_sb_push_char(handle: i64, byte: i64) -> i64 {
    unsafe {
        (*deref(handle)).push((byte & 0xFF) as u8);
    }
    handle
}

/// Append the decimal rendering of an integer.
///
/// # Safety
/// `handle` must be a live builder handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_sb_push_int(handle: i64, value: i64) -> i64 {
    unsafe {
        (*deref(handle)).extend_from_slice(value.to_string().as_bytes());
    }
    handle
}

/// Append a string with `"` `\` and control bytes escaped, for emitting
/// quoted output.
///
/// # Safety
/// `handle` must be a live builder handle; `s` a valid string record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_sb_push_escaped(handle: i64, s: *const BmbString) -> i64 {
    unsafe {
        let buffer = &mut *deref(handle);
        for &b in crate::string::bytes_of(s) {
            match b {
                b'"' => buffer.extend_from_slice(b"\\\""),
                b'\\' => buffer.extend_from_slice(b"\\\\"),
                b'\n' => buffer.extend_from_slice(b"\\n"),
                b'\r' => buffer.extend_from_slice(b"\\r"),
                b'\t' => buffer.extend_from_slice(b"\\t"),
                0 => buffer.extend_from_slice(b"\\0"),
                _ => buffer.push(b),
            }
        }
    }
    handle
}

/// Accumulated length in bytes.
///
/// # Safety
/// `handle` must be a live builder handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_sb_len(handle: i64) -> i64 {
    unsafe { (*deref(handle)).len() as i64 }
}

/// Snapshot the buffer into a fresh string record.
///
/// # Safety
/// `handle` must be a live builder handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_sb_build(handle: i64) -> *mut BmbString {
    unsafe {
        let buffer = &*deref(handle);
        bmb_string_new(buffer.as_ptr(), buffer.len() as i64)
    }
}

/// Reset the buffer, keeping the allocation.
///
/// # Safety
/// `handle` must be a live builder handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_sb_clear(handle: i64) -> i64 {
    unsafe {
        (*deref(handle)).clear();
    }
    handle
}
