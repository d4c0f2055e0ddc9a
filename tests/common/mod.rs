#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};

#[cfg(target_os = "macos")]
pub const BASIC_FIXTURE: &str = "libbasic.dylib";
#[cfg(not(target_os = "macos"))]
pub const BASIC_FIXTURE: &str = "libbasic.so";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("TEST_ARTIFACTS")).join(name)
}

/// The compiled shared-object fixture, or `None` when the build host had
/// no C toolchain.
pub fn basic_fixture() -> Option<Vec<u8>> {
    std::fs::read(fixture_path(BASIC_FIXTURE)).ok()
}

/// Serialises tests that touch the process-wide `REFLEKTOR_MARKER`
/// environment variable.
pub fn marker_env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
