//! Checksum-locked buffers.
//!
//! A locked buffer is a caller-owned region that must not change while
//! locked. The registry keeps one entry per lock with a checksum of the
//! region taken at lock time; release and check recompute it. Lookup is
//! last-in-first-out so the most recent lock of an address wins.

use crate::diagnostics::error::ErrorCode;

const SUM_WORD: usize = 8;

#[derive(Debug, Clone, Copy)]
struct LockedBuf {
    addr: usize,
    len: usize,
    sum: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LockedRegistry {
    entries: Vec<LockedBuf>,
}

impl LockedRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a lock of `len` bytes at `ptr`. A null pointer or an
    /// empty region is an error, never a lock.
    ///
    /// # Safety
    ///
    /// `ptr` must be readable for `len` bytes until released.
    pub(crate) unsafe fn lock(&mut self, ptr: *const u8, len: usize) -> Result<(), ErrorCode> {
        if ptr.is_null() {
            return Err(ErrorCode::NullPointer);
        }
        if len == 0 {
            return Err(ErrorCode::BadSize);
        }
        self.entries.push(LockedBuf {
            addr: ptr as usize,
            len,
            sum: checksum(ptr, len),
        });
        Ok(())
    }

    /// Verify a locked region, or all of them when `ptr` is `None`.
    ///
    /// # Safety
    ///
    /// Every checked region must still be readable for its length.
    pub(crate) unsafe fn check(&self, ptr: Option<*const u8>) -> Result<(), ErrorCode> {
        match ptr {
            Some(ptr) => {
                if ptr.is_null() {
                    return Ok(());
                }
                let entry = self
                    .find(ptr as usize)
                    .ok_or(ErrorCode::NotFound)
                    .map(|at| self.entries[at])?;
                verify(&entry)
            }
            None => {
                for entry in self.entries.iter().rev() {
                    verify(entry)?;
                }
                Ok(())
            }
        }
    }

    /// Drop a lock, verifying the region on the way out. The entry is
    /// removed even when the verification fails, so a damaged buffer
    /// does not stay registered and fail every later sweep.
    ///
    /// With `None`, every lock is released; the first error wins but
    /// the registry still ends up empty.
    ///
    /// # Safety
    ///
    /// Every released region must still be readable for its length.
    pub(crate) unsafe fn release(&mut self, ptr: Option<*const u8>) -> Result<(), ErrorCode> {
        match ptr {
            Some(ptr) => {
                if ptr.is_null() {
                    return Ok(());
                }
                let at = self.find(ptr as usize).ok_or(ErrorCode::NotFound)?;
                let entry = self.entries.remove(at);
                verify(&entry)
            }
            None => {
                let mut first_error = None;
                while let Some(entry) = self.entries.pop() {
                    if let Err(code) = verify(&entry) {
                        first_error.get_or_insert(code);
                    }
                }
                match first_error {
                    Some(code) => Err(code),
                    None => Ok(()),
                }
            }
        }
    }

    fn find(&self, addr: usize) -> Option<usize> {
        self.entries.iter().rposition(|entry| entry.addr == addr)
    }
}

unsafe fn verify(entry: &LockedBuf) -> Result<(), ErrorCode> {
    if checksum(entry.addr as *const u8, entry.len) == entry.sum {
        Ok(())
    } else {
        Err(ErrorCode::BufferDamage)
    }
}

/// Checksum of a byte region: the leading word, the trailing word, and
/// every 8-aligned word fully inside the region, summed with wrapping
/// adds. Cheap, order-insensitive in the middle, but it always covers
/// both edges where overruns land.
pub(crate) unsafe fn checksum(ptr: *const u8, len: usize) -> u64 {
    let start = ptr as usize;
    let end = start + len;

    let mut sum = edge_word(ptr, len.min(SUM_WORD));
    if len > SUM_WORD {
        sum = sum.wrapping_add(edge_word((end - SUM_WORD) as *const u8, SUM_WORD));
    }

    // Interior words at 8-aligned addresses strictly inside the region.
    let mut addr = (start + SUM_WORD - 1) & !(SUM_WORD - 1);
    while addr + SUM_WORD <= end {
        sum = sum.wrapping_add((addr as *const u64).read());
        addr += SUM_WORD;
    }
    sum
}

unsafe fn edge_word(ptr: *const u8, len: usize) -> u64 {
    let mut bytes = [0u8; SUM_WORD];
    std::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), len);
    u64::from_le_bytes(bytes)
}
