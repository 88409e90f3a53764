//! Fill patterns for modify mode.
//!
//! Fresh user memory is stamped with a recognizable pattern so reads
//! of uninitialized data stand out, and freed memory is stamped so
//! use-after-free shows up in a debugger.

/// Pattern written over freed user bytes.
pub const FREED_PATTERN: u8 = 0xCD;

/// Pattern written over fresh, uninitialized user bytes.
pub const UNINIT_PATTERN: u8 = 0xAB;

/// Stamp a region with the uninitialized pattern.
///
/// # Safety
///
/// The region must be valid and writable.
pub(crate) unsafe fn fill_uninit(ptr: *mut u8, len: usize) {
    std::ptr::write_bytes(ptr, UNINIT_PATTERN, len);
}

/// Stamp a region with the freed pattern.
///
/// # Safety
///
/// The region must be valid and writable.
pub(crate) unsafe fn fill_freed(ptr: *mut u8, len: usize) {
    std::ptr::write_bytes(ptr, FREED_PATTERN, len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_differ() {
        assert_ne!(FREED_PATTERN, UNINIT_PATTERN);
    }

    #[test]
    fn test_fill() {
        let mut buf = [0u8; 32];
        unsafe { fill_uninit(buf.as_mut_ptr(), buf.len()) };
        assert!(buf.iter().all(|&b| b == UNINIT_PATTERN));
        unsafe { fill_freed(buf.as_mut_ptr(), 16) };
        assert!(buf[..16].iter().all(|&b| b == FREED_PATTERN));
        assert!(buf[16..].iter().all(|&b| b == UNINIT_PATTERN));
    }
}
