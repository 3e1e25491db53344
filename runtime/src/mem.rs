//! Manual memory management surface
//!
//! Heap allocations travel through user code as i64 handles (pointer
//! cast to integer). `bmb_free` consistently returns i64 so it composes
//! inside conditional branches.

/// Free a heap allocation identified by its i64 handle. Always returns
/// 0; freeing the zero handle is a no-op.
///
/// # Safety
/// `handle` must be zero or an allocation obtained from `malloc` that
/// has not been freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_free(handle: i64) -> i64 {
    if handle != 0 {
        unsafe {
            libc::free(handle as *mut libc::c_void);
        }
    }
    0
}
