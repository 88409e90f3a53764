//! Corruption detection: block canary checks, locked-buffer checksums,
//! and the fill patterns stamped into fresh and freed memory.

pub(crate) mod check;
pub(crate) mod locked;
pub mod poison;
