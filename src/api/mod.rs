//! Public surface: the allocator facade, its configuration, runtime
//! modes, guarded string and memory shims, and usage statistics.

pub mod alloc;
pub mod config;
pub mod modes;
pub mod rtl;
pub mod stats;
