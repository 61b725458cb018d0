//! Test-only helpers shared across this crate's unit tests.

use std::sync::{Mutex, OnceLock};

/// Config-resolution tests mutate process-wide env vars; serialize
/// them so parallel test threads don't stomp on each other.
pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
