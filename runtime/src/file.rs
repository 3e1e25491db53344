//! File I/O primitives
//!
//! Files are opened, used and closed inside a single call; no handle
//! crosses the ABI. Paths arrive as string records and are converted at
//! this boundary.

use crate::string::{bmb_string_new, str_of, BmbString};

/// Read a whole file into a fresh string record; empty on failure.
///
/// # Safety
/// `path` must be a valid string record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_read_file(path: *const BmbString) -> *mut BmbString {
    let path = unsafe { str_of(path) }.into_owned();
    match std::fs::read(&path) {
        Ok(bytes) => unsafe { bmb_string_new(bytes.as_ptr(), bytes.len() as i64) },
        Err(_) => unsafe { bmb_string_new(std::ptr::null(), 0) },
    }
}

/// Write (truncate) a file; 1 on success, 0 on failure.
///
/// # Safety
/// `path` and `content` must be valid string records.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_write_file(path: *const BmbString, content: *const BmbString) -> i64 {
    let path = unsafe { str_of(path) }.into_owned();
    let bytes = unsafe { crate::string::bytes_of(content) };
    match std::fs::write(&path, bytes) {
        Ok(()) => 1,
        Err(_) => 0,
    }
}

/// Append to a file, creating it if missing; 1 on success.
///
/// # Safety
/// `path` and `content` must be valid string records.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_append_file(path: *const BmbString, content: *const BmbString) -> i64 {
    use std::io::Write;
    let path = unsafe { str_of(path) }.into_owned();
    let bytes = unsafe { crate::string::bytes_of(content) };
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(bytes));
    match result {
        Ok(()) => 1,
        Err(_) => 0,
    }
}

/// 1 when the path exists.
///
/// # Safety
/// `path` must be a valid string record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_file_exists(path: *const BmbString) -> i64 {
    let path = unsafe { str_of(path) }.into_owned();
    if std::path::Path::new(&path).exists() { 1 } else { 0 }
}

/// Size in bytes, or -1 when unavailable.
///
/// # Safety
/// `path` must be a valid string record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_file_size(path: *const BmbString) -> i64 {
    let path = unsafe { str_of(path) }.into_owned();
    match std::fs::metadata(&path) {
        Ok(meta) => meta.len() as i64,
        Err(_) => -1,
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
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path_buf = dir.path().join("out.txt");
        let path = mk(path_buf.to_str().unwrap());
        let content = mk("line one\nline two");
        unsafe {
            assert_eq!(bmb_write_file(path, content), 1);
            let back = bmb_read_file(path);
            assert_eq!(bytes_of(back), b"line one\nline two");
            bmb_string_free(back);
            bmb_string_free(content);
            bmb_string_free(path);
        }
    }

    #[test]
    fn test_append() {
        let dir = tempfile::tempdir().unwrap();
        let path_buf = dir.path().join("log.txt");
        let path = mk(path_buf.to_str().unwrap());
        let a = mk("a");
        let b = mk("b");
        unsafe {
            assert_eq!(bmb_append_file(path, a), 1);
            assert_eq!(bmb_append_file(path, b), 1);
            let back = bmb_read_file(path);
            assert_eq!(bytes_of(back), b"ab");
            bmb_string_free(back);
            bmb_string_free(a);
            bmb_string_free(b);
            bmb_string_free(path);
        }
    }

    #[test]
    fn test_exists_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path_buf = dir.path().join("sized.txt");
        let path = mk(path_buf.to_str().unwrap());
        unsafe {
            assert_eq!(bmb_file_exists(path), 0);
            assert_eq!(bmb_file_size(path), -1);
            let content = mk("12345");
            bmb_write_file(path, content);
            assert_eq!(bmb_file_exists(path), 1);
            assert_eq!(bmb_file_size(path), 5);
            bmb_string_free(content);
            bmb_string_free(path);
        }
    }

    #[test]
    fn test_read_missing_is_empty() {
        let path = mk("/definitely/not/here.txt");
        unsafe {
            let back = bmb_read_file(path);
            assert_eq!(crate::string::bmb_string_len(back), 0);
            bmb_string_free(back);
            bmb_string_free(path);
        }
    }
}
