//! # guardalloc
//!
//! A debugging allocation layer with per-block corruption detection.
//!
//! ## Features
//!
//! - Guard tags around every block (prefix, postfix, checksummed header)
//! - Double-free and wild-pointer detection without touching freed memory
//! - Block classes with per-class statistics and contiguous chain layout
//! - Checksum-locked buffers for memory that must not change
//! - Bounds-checked memcpy/strcpy/strcat/sprintf stand-ins
//! - A stacked runtime mode (debug, trace, warning, continue, modify)
//! - Pluggable error and abort hooks with a continue-or-stop verdict
//! - Allocation trace log with one line per operation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use guardalloc::{AllocConfig, ClassId, GuardAlloc, Mode};
//!
//! let alloc = GuardAlloc::new(AllocConfig::default().with_mode(Mode::DEBUG));
//!
//! let ptr = alloc.alloc(ClassId::DEFAULT, "scratch", 256).unwrap();
//! // ... use the 256 bytes behind ptr ...
//! alloc.check_block(Some(ptr as *const u8)).unwrap();
//! alloc.free(ptr).unwrap();
//! alloc.close().unwrap();
//! ```

pub mod api;
pub mod diagnostics;

mod core;
mod debug;
mod util;

// Re-export public API at crate root for convenience
pub use api::alloc::{GuardAlloc, ModeGuard};
pub use api::config::{AllocConfig, ConfigError, CONFIG_ENV_VAR};
pub use api::modes::Mode;
pub use api::rtl::UNKNOWN_CAP;
pub use api::stats::{AllocStats, MemoryUse, StatScope};

pub use crate::core::classes::ClassId;
pub use crate::core::global::{global, init, shutdown};

pub use crate::debug::poison::{FREED_PATTERN, UNINIT_PATTERN};

pub use diagnostics::{AbortHook, DamageReport, ErrorCode, ErrorHook, Verdict};
