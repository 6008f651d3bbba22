//! Foundational low-level utilities shared across the reporting agent crates.
//!
//! Provides the atomic file-write helper used for the run id hand-off file and
//! the clock helpers used for log timestamps and backend date fields.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use time_utils::{current_unix_timestamp_ms, rfc3339_now, rfc3339_seconds_ago};
