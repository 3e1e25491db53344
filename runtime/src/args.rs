//! Process entry point and CLI argument access
//!
//! The runtime owns the C `main`: it stashes argc/argv in the two
//! process-wide globals and calls the compiled program's
//! `bmb_user_main`. Both globals are written exactly once, before any
//! user code runs, and never mutated afterwards.

use libc::c_char;

use crate::string::{bmb_string_from_cstr, bmb_string_new, BmbString};

/// Process argc, set once in `main`.
static mut G_ARGC: i64 = 0;
/// Process argv, set once in `main`.
static mut G_ARGV: *const *const c_char = std::ptr::null();

#[cfg(not(test))]
unsafe extern "C" {
    /// The compiled program's entry point, emitted by the compiler.
    fn bmb_user_main() -> i64;
}

/// C entry point linked into every compiled program. Only the
/// staticlib artifact carries this symbol; under the test harness the
/// Rust runtime owns `main`.
///
/// # Safety
/// Called by the C runtime with a valid argc/argv pair.
#[cfg(not(test))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn main(argc: libc::c_int, argv: *const *const c_char) -> libc::c_int {
    unsafe {
        G_ARGC = argc as i64;
        G_ARGV = argv;
        bmb_user_main() as libc::c_int
    }
}

/// Number of CLI arguments, including the program name.
#[unsafe(no_mangle)]
pub extern "C" fn bmb_arg_count() -> i64 {
    unsafe { G_ARGC }
}

/// Argument at `index` as a fresh string record; empty when out of
/// range. Index 0 is the program name.
#[unsafe(no_mangle)]
pub extern "C" fn bmb_get_arg(index: i64) -> *mut BmbString {
    unsafe {
        if index < 0 || index >= G_ARGC || G_ARGV.is_null() {
            return bmb_string_new(std::ptr::null(), 0);
        }
        let arg = *G_ARGV.offset(index as isize);
        bmb_string_from_cstr(arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // main() never runs under the test harness, so the globals hold
    // their initial values here.
    #[test]
    fn test_arg_count_defaults_to_zero() {
        assert_eq!(bmb_arg_count(), 0);
    }

    #[test]
    fn test_get_arg_out_of_range_is_empty() {
        unsafe {
            let s = bmb_get_arg(5);
            assert_eq!(crate::string::bmb_string_len(s), 0);
            crate::string::bmb_string_free(s);
        }
    }
}
