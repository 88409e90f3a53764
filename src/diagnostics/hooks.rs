//! Pluggable error and abort callbacks for integrity failures.
//!
//! When a guard tag or checksum check fails, the allocator builds a
//! [`DamageReport`] and consults the installed error hook. The hook
//! decides whether execution continues; without a hook, fatal-class
//! damage prints the report and panics.

use std::io::Write;
use std::sync::Arc;

use super::error::ErrorCode;

/// Decision returned by an error hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep running; self-checking is degraded until re-enabled.
    Continue,
    /// Invoke the abort hook and terminate.
    Stop,
}

/// Diagnostic context handed to the error hook.
#[derive(Debug, Clone, Copy)]
pub struct DamageReport {
    /// The integrity code being reported.
    pub code: ErrorCode,
    /// Name of the operation that detected the damage.
    pub function: &'static str,
    /// Source file of the triggering call.
    pub file: &'static str,
    /// Source line of the triggering call.
    pub line: u32,
    /// User pointer of the damaged block or buffer, when known.
    pub ptr: Option<*const u8>,
    /// Byte offset of the damage relative to the user data start.
    /// Negative offsets fall inside the control header or prefix tag.
    pub offset: isize,
}

/// Error callback: inspects a report, decides continue-vs-stop.
pub type ErrorHook = Arc<dyn Fn(&DamageReport) -> Verdict + Send + Sync>;

/// Abort callback: runs right before termination.
pub type AbortHook = Arc<dyn Fn() + Send + Sync>;

/// Installed callbacks. Hooks are `Arc`s so they can be cloned out of
/// the registry lock before being invoked; a hook may therefore call
/// back into the allocator without deadlocking.
#[derive(Default, Clone)]
pub(crate) struct IntegrityHooks {
    pub(crate) error_hook: Option<ErrorHook>,
    pub(crate) abort_hook: Option<AbortHook>,
}

impl IntegrityHooks {
    /// Decide the verdict for a report.
    ///
    /// Without an error hook the default policy applies: fatal-class
    /// damage stops unless continue mode is set; advisory damage
    /// (double free, truncated copy) always continues.
    pub(crate) fn decide(&self, report: &DamageReport, continue_mode: bool) -> Verdict {
        match &self.error_hook {
            Some(hook) => hook(report),
            None if continue_mode || !report.code.is_fatal_integrity() => Verdict::Continue,
            None => Verdict::Stop,
        }
    }

    /// Run the abort hook and terminate via panic.
    pub(crate) fn abort(&self, report: &DamageReport) -> ! {
        if let Some(hook) = &self.abort_hook {
            hook();
        }
        panic!(
            "[guardalloc][{:?}] {} in {} at {}:{}",
            report.code,
            report.code.message(),
            report.function,
            report.file,
            report.line
        );
    }
}

/// Print a report to stderr (and the log crate, when enabled).
pub(crate) fn emit(report: &DamageReport) {
    let mut stderr = std::io::stderr();
    let _ = writeln!(
        stderr,
        "[guardalloc][{:?}] error: {}",
        report.code,
        report.code.message()
    );
    let _ = writeln!(
        stderr,
        "  in {} at {}:{}",
        report.function, report.file, report.line
    );
    if let Some(ptr) = report.ptr {
        let _ = writeln!(
            stderr,
            "  block {:#x}, damage at offset {}",
            ptr as usize, report.offset
        );
    }

    #[cfg(feature = "log")]
    log::error!(
        "[{:?}] {} in {} at {}:{}",
        report.code,
        report.code.message(),
        report.function,
        report.file,
        report.line
    );
}

/// Print a warning-level line to stderr (and the log crate).
pub(crate) fn emit_warning(function: &'static str, code: ErrorCode) {
    let mut stderr = std::io::stderr();
    let _ = writeln!(
        stderr,
        "[guardalloc][{:?}] warning: {} ({})",
        code,
        code.message(),
        function
    );

    #[cfg(feature = "log")]
    log::warn!("[{:?}] {} ({})", code, code.message(), function);
}
