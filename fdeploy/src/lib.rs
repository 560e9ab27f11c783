use chrono::{DateTime, Utc};

pub mod config;
pub mod entry;
pub mod path;
pub mod progress;
pub mod rules;

mod error;

pub use crate::config::Config;
pub use crate::entry::{Entry, EntryKind, LocalEntry, RemoteEntry};
pub use crate::error::{Error, NtStatus, Result};
pub use crate::rules::Rules;

/// File placed at the root of the remote target while the site is offline.
/// The hosting server answers every request with its content.
pub const MAINTENANCE_MARKER: &str = "app_offline.htm";

/// Truncates a timestamp to the second, the resolution used to compare
/// local and remote modification times.
pub fn comparable_time(time: impl Into<DateTime<Utc>>) -> i64 {
    time.into().timestamp()
}
