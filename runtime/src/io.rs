//! Numeric and string output, console input, assertions

use std::io::{BufRead, Write};

use crate::string::BmbString;

#[unsafe(no_mangle)]
pub extern "C" fn bmb_println_i64(value: i64) {
    println!("{value}");
}

#[unsafe(no_mangle)]
pub extern "C" fn bmb_print_i64(value: i64) {
    print!("{value}");
    std::io::stdout().flush().ok();
}

#[unsafe(no_mangle)]
pub extern "C" fn bmb_println_f64(value: f64) {
    println!("{value}");
}

#[unsafe(no_mangle)]
pub extern "C" fn bmb_print_f64(value: f64) {
    print!("{value}");
    std::io::stdout().flush().ok();
}

/// Print a string record followed by a newline.
///
/// # Safety
/// `s` must be a valid string record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_println_str(s: *const BmbString) {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    lock.write_all(unsafe { crate::string::bytes_of(s) }).ok();
    lock.write_all(b"\n").ok();
}

/// Print a string record without a newline.
///
/// # Safety
/// `s` must be a valid string record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bmb_print_str(s: *const BmbString) {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    lock.write_all(unsafe { crate::string::bytes_of(s) }).ok();
    lock.flush().ok();
}

/// Read one integer from stdin; 0 on EOF or parse failure.
#[unsafe(no_mangle)]
pub extern "C" fn bmb_read_int() -> i64 {
    let stdin = std::io::stdin();
    let mut line = String::new();
    if stdin.lock().read_line(&mut line).is_err() {
        return 0;
    }
    line.trim().parse().unwrap_or(0)
}

/// Abort with a message when the condition is zero. Runtime assertion
/// failures print to stderr and exit non-zero.
#[unsafe(no_mangle)]
pub extern "C" fn bmb_assert(cond: i64) {
    if cond == 0 {
        eprintln!("assertion failed");
        std::process::exit(134);
    }
}
