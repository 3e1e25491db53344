//! Process primitives

use crate::string::{bmb_string_new, str_of, BmbString};

/// Run a shell command; returns its exit code (-1 when it failed to
/// start).
///
/// # Safety
/// `command` must be a valid string record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_system(command: *const BmbString) -> i64 {
    let command = unsafe { str_of(command) }.into_owned();
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .status();
    match status {
        Ok(s) => s.code().unwrap_or(-1) as i64,
        Err(_) => -1,
    }
}

/// Environment variable value; empty string when unset.
///
/// # Safety
/// `name` must be a valid string record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_getenv(name: *const BmbString) -> *mut BmbString {
    let name = unsafe { str_of(name) }.into_owned();
    let value = std::env::var(&name).unwrap_or_default();
    unsafe { bmb_string_new(value.as_ptr(), value.len() as i64) }
}

/// Run a shell command capturing stdout into a string record.
///
/// # Safety
/// `command` must be a valid string record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_exec(command: *const BmbString) -> *mut BmbString {
    let command = unsafe { str_of(command) }.into_owned();
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .output();
    match output {
        Ok(out) => unsafe { bmb_string_new(out.stdout.as_ptr(), out.stdout.len() as i64) },
        Err(_) => unsafe { bmb_string_new(std::ptr::null(), 0) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string::{bmb_string_free, bytes_of};

    fn mk(content: &str) -> *mut BmbString {
        unsafe { bmb_string_new(content.as_ptr(), content.len() as i64) }
    }

    #[test]
    fn test_system_exit_code() {
        let ok = mk("true");
        let fail = mk("exit 3");
        unsafe {
            assert_eq!(bmb_system(ok), 0);
            assert_eq!(bmb_system(fail), 3);
            bmb_string_free(ok);
            bmb_string_free(fail);
        }
    }

    #[test]
    fn test_exec_captures_stdout() {
        let cmd = mk("printf hello");
        unsafe {
            let out = bmb_exec(cmd);
            assert_eq!(bytes_of(out), b"hello");
            bmb_string_free(out);
            bmb_string_free(cmd);
        }
    }

    #[test]
    fn test_getenv_unset_is_empty() {
        let name = mk("BMB_SURELY_UNSET_VARIABLE_XYZ");
        unsafe {
            let value = bmb_getenv(name);
            assert_eq!(crate::string::bmb_string_len(value), 0);
            bmb_string_free(value);
            bmb_string_free(name);
        }
    }

    #[test]
    fn test_getenv_set() {
        unsafe {
            std::env::set_var("BMB_RUNTIME_TEST_VAR", "on");
        }
        let name = mk("BMB_RUNTIME_TEST_VAR");
        unsafe {
            let value = bmb_getenv(name);
            assert_eq!(bytes_of(value), b"on");
            bmb_string_free(value);
            bmb_string_free(name);
        }
    }
}
