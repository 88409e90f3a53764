//! Debug modes and the bounded mode stack.

use bitflags::bitflags;

use crate::diagnostics::error::ErrorCode;

bitflags! {
    /// Self-checking and failure-policy flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Mode: u8 {
        /// Full-heap scan before every allocate/free/resize.
        const DEBUG = 1 << 0;
        /// One trace-log line per call.
        const TRACE = 1 << 1;
        /// Emit advisory warnings (e.g. unknown destination size).
        const WARNING = 1 << 2;
        /// Keep running after integrity errors (degrades checking).
        const CONTINUE = 1 << 3;
        /// Fill fresh and freed memory with recognizable patterns.
        const MODIFY = 1 << 4;
    }
}

impl Mode {
    /// Validate raw mode bits, rejecting unknown ones.
    pub fn try_from_bits(bits: u8) -> Result<Self, ErrorCode> {
        Mode::from_bits(bits).ok_or(ErrorCode::BadMode)
    }
}

/// Bounded stack of mode values.
///
/// `open` saves the current mode and applies a new one; `close`
/// restores the saved value. Opening past the configured capacity
/// still applies the requested mode but cannot save the current one,
/// and reports [`ErrorCode::Warn`]; the next `close` after such an
/// overflow restores the base (bottom-of-stack) mode, not the value
/// current at overflow time. This degrade is intentional and bounded
/// by `capacity`, which is configurable precisely so the condition is
/// cheap to test.
pub(crate) struct ModeStack {
    current: Mode,
    saved: Vec<Mode>,
    capacity: usize,
    overflowed: bool,
}

impl ModeStack {
    pub(crate) fn new(base: Mode, capacity: usize) -> Self {
        Self {
            current: base,
            saved: Vec::new(),
            capacity,
            overflowed: false,
        }
    }

    pub(crate) fn current(&self) -> Mode {
        self.current
    }

    /// Replace the current mode without touching the stack.
    pub(crate) fn set(&mut self, mode: Mode) {
        self.current = mode;
    }

    /// Push the current mode and apply `mode`.
    pub(crate) fn open(&mut self, mode: Mode) -> Result<(), ErrorCode> {
        if self.saved.len() >= self.capacity {
            self.current = mode;
            self.overflowed = true;
            return Err(ErrorCode::Warn);
        }
        self.saved.push(self.current);
        self.current = mode;
        Ok(())
    }

    /// Pop back to the previously saved mode.
    pub(crate) fn close(&mut self) -> Result<Mode, ErrorCode> {
        if self.overflowed {
            // The overflowed open lost its save slot; the only state
            // still known to be valid is the base mode.
            self.current = self.saved.first().copied().unwrap_or(self.current);
            self.saved.clear();
            self.overflowed = false;
            return Ok(self.current);
        }
        match self.saved.pop() {
            Some(mode) => {
                self.current = mode;
                Ok(mode)
            }
            None => Err(ErrorCode::Warn),
        }
    }
}
