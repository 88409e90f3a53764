//! Block bookkeeping: per-block records, the allocation chain, and the
//! class table they hang off.

pub(crate) mod arena;
pub mod classes;
pub(crate) mod global;
pub(crate) mod layout;
