//! Common types shared by the token broker crates

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};

/// Current wall-clock time as unix milliseconds.
///
/// Stores and history records all use this representation for timestamps.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
