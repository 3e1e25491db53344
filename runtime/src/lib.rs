//! BMB runtime library
//!
//! C-ABI primitives that compiled BMB programs link against: the
//! three-field string record, vectors, hash maps, string builders,
//! file and process I/O, numeric output and CLI argument access.
//!
//! Built as a `staticlib` for native linking (the compiler driver picks
//! it up via `BMB_RUNTIME_PATH`) and as an `rlib` so the test suite can
//! exercise the same entry points in-process.
//!
//! Memory is manual: every heap object returned to user code is
//! caller-freed. Handles are not thread-safe; compiled programs are
//! single-threaded by model.

mod args;
mod file;
mod hashmap;
mod io;
mod math;
mod mem;
mod process;
mod sb;
mod string;
mod vec;

pub use args::*;
pub use file::*;
pub use hashmap::*;
pub use io::*;
pub use math::*;
pub use mem::*;
pub use process::*;
pub use sb::*;
pub use string::*;
pub use vec::*;

/// Sentinel returned by hashmap get/remove when the key is absent.
pub const MISS_SENTINEL: i64 = i64::MIN;
