//! Vector primitives
//!
//! A vector is a flat i64 array laid out as `[cap, len, elem0, elem1,
//! …]`, growing by doubling. The handle handed to user code is a
//! stable one-word cell pointing at that array, so growth can swap the
//! array without invalidating outstanding handles. The cell pointer is
//! cast to i64 at the ABI boundary.

use libc::{free, malloc, realloc};

const HEADER_WORDS: usize = 2;
const DEFAULT_CAP: i64 = 8;

/// The stable cell the handle points at.
#[repr(C)]
struct VecCell {
    array: *mut i64,
}

unsafe fn cell(handle: i64) -> *mut VecCell {
    handle as *mut VecCell
}

unsafe fn alloc_array(cap: i64) -> *mut i64 {
    unsafe {
        let array = malloc((HEADER_WORDS + cap as usize) * 8) as *mut i64;
        *array = cap;
        *array.add(1) = 0;
        array
    }
}

/// Allocate an empty vector.
#[unsafe(no_mangle)]
pub extern "C" fn vec_new() -> i64 {
    vec_with_capacity(DEFAULT_CAP)
}

/// Allocate a vector with an initial capacity.
#[unsafe(no_mangle)]
pub extern "C" fn vec_with_capacity(cap: i64) -> i64 {
    let cap = cap.max(1);
    unsafe {
        let cell_ptr = malloc(std::mem::size_of::<VecCell>()) as *mut VecCell;
        (*cell_ptr).array = alloc_array(cap);
        cell_ptr as i64
    }
}

/// Free the vector and its handle cell.
///
/// # Safety
/// `handle` must come from vec_new/vec_with_capacity and must not be
/// used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vec_free(handle: i64) -> i64 {
    if handle == 0 {
        return 0;
    }
    unsafe {
        let c = cell(handle);
        free((*c).array.cast());
        free(c.cast());
    }
    0
}

/// Number of elements.
///
/// # Safety
/// `handle` must be a live vector handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vec_len(handle: i64) -> i64 {
    unsafe { *(*cell(handle)).array.add(1) }
}

/// Current capacity.
///
/// # Safety
/// `handle` must be a live vector handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vec_cap(handle: i64) -> i64 {
    unsafe { *(*cell(handle)).array }
}

/// Append, doubling the array when full.
///
/// # Safety
/// `handle` must be a live vector handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vec_push(handle: i64, value: i64) {
    unsafe {
        let c = cell(handle);
        let array = (*c).array;
        let cap = *array;
        let len = *array.add(1);
        if len == cap {
            let new_cap = cap * 2;
            let grown =
                realloc(array.cast(), (HEADER_WORDS + new_cap as usize) * 8) as *mut i64;
            *grown = new_cap;
            (*c).array = grown;
        }
        let array = (*c).array;
        *array.add(HEADER_WORDS + len as usize) = value;
        *array.add(1) = len + 1;
    }
}

/// Remove and return the last element; 0 when empty.
///
/// # Safety
/// `handle` must be a live vector handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vec_pop(handle: i64) -> i64 {
    unsafe {
        let array = (*cell(handle)).array;
        let len = *array.add(1);
        if len == 0 {
            return 0;
        }
        *array.add(1) = len - 1;
        *array.add(HEADER_WORDS + (len - 1) as usize)
    }
}

/// Element at `index`; 0 when out of bounds.
///
/// # Safety
/// `handle` must be a live vector handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vec_get(handle: i64, index: i64) -> i64 {
    unsafe {
        let array = (*cell(handle)).array;
        let len = *array.add(1);
        if index < 0 || index >= len {
            return 0;
        }
        *array.add(HEADER_WORDS + index as usize)
    }
}

/// Store at `index`; out-of-bounds stores are dropped.
///
/// # Safety
/// `handle` must be a live vector handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vec_set(handle: i64, index: i64, value: i64) {
    unsafe {
        let array = (*cell(handle)).array;
        let len = *array.add(1);
        if index < 0 || index >= len {
            return;
        }
        *array.add(HEADER_WORDS + index as usize) = value;
    }
}

/// Reset the length, keeping the capacity.
///
/// # Safety
/// `handle` must be a live vector handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vec_clear(handle: i64) {
    unsafe {
        *(*cell(handle)).array.add(1) = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_get() {
        unsafe {
            let v = vec_new();
            vec_push(v, 7);
            vec_push(v, 8);
            assert_eq!(vec_len(v), 2);
            assert_eq!(vec_get(v, 0), 7);
            assert_eq!(vec_get(v, 1), 8);
            vec_free(v);
        }
    }

    #[test]
    fn test_growth_keeps_handle_valid() {
        unsafe {
            let v = vec_with_capacity(2);
            let before = vec_cap(v);
            for i in 0..100 {
                vec_push(v, i);
            }
            // The same handle sees the grown array.
            assert_eq!(vec_len(v), 100);
            assert!(vec_cap(v) > before);
            assert_eq!(vec_get(v, 99), 99);
            assert_eq!(vec_get(v, 0), 0);
            vec_free(v);
        }
    }

    #[test]
    fn test_doubling() {
        unsafe {
            let v = vec_with_capacity(4);
            for i in 0..5 {
                vec_push(v, i);
            }
            assert_eq!(vec_cap(v), 8);
            vec_free(v);
        }
    }

    #[test]
    fn test_pop() {
        unsafe {
            let v = vec_new();
            vec_push(v, 1);
            vec_push(v, 2);
            assert_eq!(vec_pop(v), 2);
            assert_eq!(vec_pop(v), 1);
            assert_eq!(vec_pop(v), 0);
            assert_eq!(vec_len(v), 0);
            vec_free(v);
        }
    }

    #[test]
    fn test_set_and_bounds() {
        unsafe {
            let v = vec_new();
            vec_push(v, 10);
            vec_set(v, 0, 42);
            assert_eq!(vec_get(v, 0), 42);
            // Out of bounds: reads 0, writes dropped.
            assert_eq!(vec_get(v, 5), 0);
            vec_set(v, 5, 9);
            assert_eq!(vec_len(v), 1);
            vec_free(v);
        }
    }

    #[test]
    fn test_clear() {
        unsafe {
            let v = vec_new();
            vec_push(v, 1);
            let cap = vec_cap(v);
            vec_clear(v);
            assert_eq!(vec_len(v), 0);
            assert_eq!(vec_cap(v), cap);
            vec_free(v);
        }
    }
}
