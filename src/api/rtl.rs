//! Bounds-checked copy and format shims.
//!
//! These are guarded stand-ins for the classic runtime routines:
//! memcpy, strcpy, strcat and sprintf, each clamped to the capacity of
//! the destination. The capacity is either declared by the caller or,
//! with [`UNKNOWN_CAP`], resolved from the allocator's own records
//! when the destination lives inside a tracked block. An overflow is
//! truncated at the capacity and reported as `RtlDamage`; string
//! destinations always keep a terminating nul.

use std::panic::Location;

use crate::api::alloc::GuardAlloc;
use crate::api::modes::Mode;
use crate::diagnostics::error::ErrorCode;
use crate::diagnostics::hooks;

/// Ask the allocator to resolve the destination capacity itself.
pub const UNKNOWN_CAP: usize = usize::MAX;

impl GuardAlloc {
    /// Bounded memmove: copy `len` bytes from `src` to `dst`, clamped
    /// to the destination capacity. Returns the bytes copied.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `len` bytes and `dst` writable for
    /// its actual capacity.
    #[track_caller]
    pub unsafe fn guarded_mem_copy(
        &self,
        dst: *mut u8,
        capacity: usize,
        src: *const u8,
        len: usize,
    ) -> Result<usize, ErrorCode> {
        let caller = Location::caller();
        if dst.is_null() || src.is_null() {
            return Err(self.fail(ErrorCode::NullPointer));
        }
        match self.effective_cap("guarded_mem_copy", dst, capacity) {
            Some(cap) if cap < len => {
                std::ptr::copy(src, dst, cap);
                Err(self.report_damage(
                    "guarded_mem_copy",
                    ErrorCode::RtlDamage,
                    Some(dst as *const u8),
                    cap as isize,
                    caller,
                ))
            }
            _ => {
                std::ptr::copy(src, dst, len);
                Ok(len)
            }
        }
    }

    /// Bounded strcpy: copy the nul-terminated string at `src` into
    /// `dst`. Returns the string length copied, not counting the nul.
    ///
    /// # Safety
    ///
    /// `src` must be nul-terminated and `dst` writable for its actual
    /// capacity.
    #[track_caller]
    pub unsafe fn guarded_str_copy(
        &self,
        dst: *mut u8,
        capacity: usize,
        src: *const u8,
    ) -> Result<usize, ErrorCode> {
        let caller = Location::caller();
        if dst.is_null() || src.is_null() {
            return Err(self.fail(ErrorCode::NullPointer));
        }
        let len = strlen(src);
        self.bounded_str_write("guarded_str_copy", dst, capacity, src, len, caller)
    }

    /// Bounded strcat: append the nul-terminated string at `src` to the
    /// one already in `dst`. Returns the combined length.
    ///
    /// # Safety
    ///
    /// `src` must be nul-terminated, `dst` must hold a nul-terminated
    /// string and be writable for its actual capacity.
    #[track_caller]
    pub unsafe fn guarded_str_cat(
        &self,
        dst: *mut u8,
        capacity: usize,
        src: *const u8,
    ) -> Result<usize, ErrorCode> {
        let caller = Location::caller();
        if dst.is_null() || src.is_null() {
            return Err(self.fail(ErrorCode::NullPointer));
        }
        let src_len = strlen(src);

        let Some(cap) = self.effective_cap("guarded_str_cat", dst, capacity) else {
            // Nothing to bound against; behave like plain strcat.
            let used = strlen(dst);
            std::ptr::copy(src, dst.add(used), src_len + 1);
            return Ok(used + src_len);
        };

        // The existing string must terminate inside the capacity,
        // otherwise the destination is already overrun.
        let Some(used) = strnlen(dst, cap) else {
            return Err(self.report_damage(
                "guarded_str_cat",
                ErrorCode::RtlDamage,
                Some(dst as *const u8),
                cap as isize,
                caller,
            ));
        };
        let room = cap - used;
        if src_len + 1 > room {
            if room > 0 {
                std::ptr::copy(src, dst.add(used), room - 1);
                *dst.add(used + room - 1) = 0;
            }
            return Err(self.report_damage(
                "guarded_str_cat",
                ErrorCode::RtlDamage,
                Some(dst as *const u8),
                cap as isize,
                caller,
            ));
        }
        std::ptr::copy(src, dst.add(used), src_len + 1);
        Ok(used + src_len)
    }

    /// Bounded sprintf: render `args` into `dst` with a trailing nul.
    /// Returns the rendered length, not counting the nul.
    ///
    /// # Safety
    ///
    /// `dst` must be writable for its actual capacity.
    #[track_caller]
    pub unsafe fn guarded_format(
        &self,
        dst: *mut u8,
        capacity: usize,
        args: std::fmt::Arguments<'_>,
    ) -> Result<usize, ErrorCode> {
        let caller = Location::caller();
        if dst.is_null() {
            return Err(self.fail(ErrorCode::NullPointer));
        }
        let text = std::fmt::format(args);
        self.bounded_str_write(
            "guarded_format",
            dst,
            capacity,
            text.as_ptr(),
            text.len(),
            caller,
        )
    }

    /// Copy `len` bytes plus a nul into `dst`, truncating at the
    /// resolved capacity.
    unsafe fn bounded_str_write(
        &self,
        function: &'static str,
        dst: *mut u8,
        capacity: usize,
        src: *const u8,
        len: usize,
        caller: &'static Location<'static>,
    ) -> Result<usize, ErrorCode> {
        match self.effective_cap(function, dst, capacity) {
            Some(cap) if len + 1 > cap => {
                if cap > 0 {
                    std::ptr::copy(src, dst, cap - 1);
                    *dst.add(cap - 1) = 0;
                }
                Err(self.report_damage(
                    function,
                    ErrorCode::RtlDamage,
                    Some(dst as *const u8),
                    cap as isize,
                    caller,
                ))
            }
            _ => {
                std::ptr::copy(src, dst, len);
                *dst.add(len) = 0;
                Ok(len)
            }
        }
    }

    /// The capacity to bound the write by. A declared capacity is
    /// taken as-is; [`UNKNOWN_CAP`] is resolved from the block records.
    /// `None` means the destination is untracked and the copy runs
    /// unchecked; with WARNING mode set that is reported as `NoSize`
    /// first.
    fn effective_cap(
        &self,
        function: &'static str,
        dst: *const u8,
        declared: usize,
    ) -> Option<usize> {
        if declared != UNKNOWN_CAP {
            return Some(declared);
        }
        match self.containing_block(dst as usize) {
            Some((start, len)) => Some(start + len - dst as usize),
            None => {
                if self.effective_mode().contains(Mode::WARNING) {
                    hooks::emit_warning(function, ErrorCode::NoSize);
                    self.fail(ErrorCode::NoSize);
                }
                None
            }
        }
    }
}

unsafe fn strlen(mut ptr: *const u8) -> usize {
    let mut len = 0;
    while *ptr != 0 {
        len += 1;
        ptr = ptr.add(1);
    }
    len
}

/// Length of the nul-terminated string at `ptr`, or `None` when no nul
/// occurs within `cap` bytes.
unsafe fn strnlen(ptr: *const u8, cap: usize) -> Option<usize> {
    (0..cap).find(|&i| *ptr.add(i) == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::AllocConfig;
    use crate::core::classes::ClassId;

    fn alloc() -> GuardAlloc {
        GuardAlloc::new(AllocConfig::default())
    }

    #[test]
    fn test_mem_copy_within_tracked_block() {
        let a = alloc();
        let dst = a.alloc(ClassId::DEFAULT, "dst", 16).unwrap();
        let src = [7u8; 16];
        let copied =
            unsafe { a.guarded_mem_copy(dst, UNKNOWN_CAP, src.as_ptr(), 16) }.unwrap();
        assert_eq!(copied, 16);
        assert_eq!(unsafe { *dst.add(15) }, 7);
        a.free(dst).unwrap();
    }

    #[test]
    fn test_mem_copy_overflow_truncated_and_reported() {
        let a = alloc();
        let dst = a.alloc(ClassId::DEFAULT, "dst", 8).unwrap();
        let src = [9u8; 32];
        let result = unsafe { a.guarded_mem_copy(dst, UNKNOWN_CAP, src.as_ptr(), 32) };
        assert_eq!(result, Err(ErrorCode::RtlDamage));
        // Exactly the capacity was written; the postfix tag survived.
        assert_eq!(a.check_block(Some(dst as *const u8)), Ok(()));
        a.free(dst).unwrap();
    }

    #[test]
    fn test_mem_copy_interior_pointer_shrinks_capacity() {
        let a = alloc();
        let dst = a.alloc(ClassId::DEFAULT, "dst", 16).unwrap();
        let src = [1u8; 10];
        let result = unsafe {
            a.guarded_mem_copy(dst.add(10), UNKNOWN_CAP, src.as_ptr(), 10)
        };
        assert_eq!(result, Err(ErrorCode::RtlDamage));
        assert_eq!(a.check_block(Some(dst as *const u8)), Ok(()));
        a.free(dst).unwrap();
    }

    #[test]
    fn test_declared_capacity_bounds_untracked_destination() {
        let a = alloc();
        let mut buf = [0u8; 8];
        let src = [3u8; 16];
        let result =
            unsafe { a.guarded_mem_copy(buf.as_mut_ptr(), 8, src.as_ptr(), 16) };
        assert_eq!(result, Err(ErrorCode::RtlDamage));
        assert_eq!(buf, [3u8; 8]);
    }

    #[test]
    fn test_str_copy_fits() {
        let a = alloc();
        let dst = a.alloc(ClassId::DEFAULT, "s", 16).unwrap();
        let len = unsafe { a.guarded_str_copy(dst, UNKNOWN_CAP, b"hello\0".as_ptr()) }.unwrap();
        assert_eq!(len, 5);
        assert_eq!(unsafe { std::slice::from_raw_parts(dst, 6) }, b"hello\0");
        a.free(dst).unwrap();
    }

    #[test]
    fn test_str_copy_truncates_with_nul() {
        let a = alloc();
        let dst = a.alloc(ClassId::DEFAULT, "s", 4).unwrap();
        let result = unsafe { a.guarded_str_copy(dst, UNKNOWN_CAP, b"overlong\0".as_ptr()) };
        assert_eq!(result, Err(ErrorCode::RtlDamage));
        assert_eq!(unsafe { std::slice::from_raw_parts(dst, 4) }, b"ove\0");
        assert_eq!(a.check_block(Some(dst as *const u8)), Ok(()));
        a.free(dst).unwrap();
    }

    #[test]
    fn test_str_cat_appends() {
        let a = alloc();
        let dst = a.alloc(ClassId::DEFAULT, "s", 16).unwrap();
        unsafe {
            a.guarded_str_copy(dst, UNKNOWN_CAP, b"ab\0".as_ptr()).unwrap();
            let len = a.guarded_str_cat(dst, UNKNOWN_CAP, b"cd\0".as_ptr()).unwrap();
            assert_eq!(len, 4);
            assert_eq!(std::slice::from_raw_parts(dst, 5), b"abcd\0");
        }
        a.free(dst).unwrap();
    }

    #[test]
    fn test_str_cat_overflow_truncates() {
        let a = alloc();
        let dst = a.alloc(ClassId::DEFAULT, "s", 6).unwrap();
        unsafe {
            a.guarded_str_copy(dst, UNKNOWN_CAP, b"abc\0".as_ptr()).unwrap();
            let result = a.guarded_str_cat(dst, UNKNOWN_CAP, b"defgh\0".as_ptr());
            assert_eq!(result, Err(ErrorCode::RtlDamage));
            assert_eq!(std::slice::from_raw_parts(dst, 6), b"abcde\0");
        }
        assert_eq!(a.check_block(Some(dst as *const u8)), Ok(()));
        a.free(dst).unwrap();
    }

    #[test]
    fn test_format_renders_into_block() {
        let a = alloc();
        let dst = a.alloc(ClassId::DEFAULT, "s", 32).unwrap();
        let len =
            unsafe { a.guarded_format(dst, UNKNOWN_CAP, format_args!("id={}", 42)) }.unwrap();
        assert_eq!(len, 5);
        assert_eq!(unsafe { std::slice::from_raw_parts(dst, 6) }, b"id=42\0");
        a.free(dst).unwrap();
    }

    #[test]
    fn test_untracked_destination_warns_with_nosize() {
        let a = alloc();
        a.open_mode(Mode::WARNING).unwrap();
        let mut buf = [0u8; 16];
        let src = [5u8; 4];
        let copied = unsafe {
            a.guarded_mem_copy(buf.as_mut_ptr(), UNKNOWN_CAP, src.as_ptr(), 4)
        }
        .unwrap();
        assert_eq!(copied, 4);
        assert_eq!(a.error_code(), Some(ErrorCode::NoSize));
    }
}
