//! Error codes, integrity callbacks, and the call trace log.

pub mod error;
pub mod hooks;
pub(crate) mod trace;

pub use error::ErrorCode;
pub use hooks::{AbortHook, DamageReport, ErrorHook, Verdict};
