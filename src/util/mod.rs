//! Internal utilities.

pub mod size;
