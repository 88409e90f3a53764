//! Optional process-wide allocator instance.
//!
//! The library is context-based; this module adds the single shared
//! instance most tools want. [`init`] creates it, [`global`] hands out
//! clones, [`shutdown`] runs the orderly close and drops it.

use parking_lot::Mutex;

use crate::api::alloc::GuardAlloc;
use crate::api::config::AllocConfig;
use crate::diagnostics::error::ErrorCode;

static GLOBAL: Mutex<Option<GuardAlloc>> = Mutex::new(None);

/// Create the process-wide instance.
pub fn init(config: AllocConfig) -> Result<GuardAlloc, ErrorCode> {
    let mut slot = GLOBAL.lock();
    if slot.is_some() {
        return Err(ErrorCode::AlreadyInitialized);
    }
    let alloc = GuardAlloc::new(config);
    *slot = Some(alloc.clone());
    Ok(alloc)
}

/// A handle to the process-wide instance.
pub fn global() -> Result<GuardAlloc, ErrorCode> {
    GLOBAL.lock().clone().ok_or(ErrorCode::NotInitialized)
}

/// Close and drop the process-wide instance.
///
/// The instance is removed even when the close reports leaks or
/// damage; dropping the last handle reclaims whatever was left.
pub fn shutdown() -> Result<(), ErrorCode> {
    let alloc = GLOBAL
        .lock()
        .take()
        .ok_or(ErrorCode::NotInitialized)?;
    alloc.close()
}
