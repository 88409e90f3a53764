//! Error codes and the per-context last-error slot.
//!
//! Every operation reports failure through [`ErrorCode`]; the `Display`
//! implementation is the canonical message text for each code.

use parking_lot::Mutex;
use thiserror::Error;

/// Result condition for every allocator operation.
///
/// Codes fall into three families:
/// - configuration errors (`NotInitialized`, `AlreadyInitialized`,
///   `BadMode`, `Warn`) and resource errors (`BadSize`, `NullPointer`,
///   `NoMemory`) are plain return values;
/// - class lifecycle errors (`ClassNotCreated`, `ClassNotReleased`,
///   `ClassPredefined`) are plain return values;
/// - integrity errors (`BlockDamage`, `BufferDamage`, `Fatal`, and the
///   advisory `Released` / `RtlDamage`) are additionally routed through
///   the error callback with full diagnostic context.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The global allocator has not been initialized.
    #[error("allocator is not initialized")]
    NotInitialized,

    /// The global allocator is already initialized.
    #[error("allocator is already initialized")]
    AlreadyInitialized,

    /// A requested size is zero or arithmetically out of range.
    #[error("requested size is zero or out of range")]
    BadSize,

    /// A required pointer or name argument is null/empty.
    #[error("null pointer or empty name argument")]
    NullPointer,

    /// A mode value contains unknown bits.
    #[error("mode value contains unknown bits")]
    BadMode,

    /// Non-fatal condition: the request was honored in degraded form.
    #[error("request honored with degraded bookkeeping")]
    Warn,

    /// The class id does not name a created class.
    #[error("class has not been created")]
    ClassNotCreated,

    /// The class still owns live blocks and cannot be closed.
    #[error("class still owns live blocks")]
    ClassNotReleased,

    /// Predefined classes can never be closed.
    #[error("predefined classes cannot be closed")]
    ClassPredefined,

    /// The underlying raw allocator returned null.
    #[error("underlying allocation failed")]
    NoMemory,

    /// The pointer does not belong to any tracked block or buffer.
    #[error("pointer does not belong to any tracked block")]
    NotFound,

    /// The block was already released (double free / use after free).
    #[error("block has already been released")]
    Released,

    /// The block belongs to the no-check class and carries no guards.
    #[error("block belongs to the no-check class")]
    NoCheckClass,

    /// A guard tag or control header has been overwritten.
    #[error("block control data is damaged")]
    BlockDamage,

    /// A locked buffer's checksum no longer matches its contents.
    #[error("locked buffer checksum mismatch")]
    BufferDamage,

    /// A guarded copy exceeded the destination capacity and was truncated.
    #[error("guarded copy exceeded the destination capacity")]
    RtlDamage,

    /// The destination capacity could not be determined.
    #[error("destination size cannot be determined")]
    NoSize,

    /// Live blocks or locked buffers remain at close time.
    #[error("live blocks or locked buffers remain")]
    NotEmpty,

    /// The block chain itself is inconsistent; state is untrustworthy.
    #[error("block chain is inconsistent")]
    Fatal,
}

impl ErrorCode {
    /// Integrity errors are routed through the error callback in
    /// addition to being returned.
    pub fn is_integrity(self) -> bool {
        matches!(
            self,
            ErrorCode::Released
                | ErrorCode::BlockDamage
                | ErrorCode::BufferDamage
                | ErrorCode::RtlDamage
                | ErrorCode::Fatal
        )
    }

    /// Fatal-class integrity errors terminate by default when no error
    /// callback is installed; advisory ones (`Released`, `RtlDamage`)
    /// only do so if a callback asks for it.
    pub fn is_fatal_integrity(self) -> bool {
        matches!(
            self,
            ErrorCode::BlockDamage | ErrorCode::BufferDamage | ErrorCode::Fatal
        )
    }

    /// The message text for this code, equivalent to `to_string()`.
    pub fn message(self) -> String {
        self.to_string()
    }
}

/// Process-wide-per-context slot holding the most recent error.
#[derive(Default)]
pub(crate) struct LastError(Mutex<Option<ErrorCode>>);

impl LastError {
    pub(crate) fn record(&self, code: ErrorCode) -> ErrorCode {
        *self.0.lock() = Some(code);
        code
    }

    pub(crate) fn get(&self) -> Option<ErrorCode> {
        *self.0.lock()
    }

    pub(crate) fn clear(&self) {
        *self.0.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_distinct() {
        let codes = [
            ErrorCode::BadSize,
            ErrorCode::NullPointer,
            ErrorCode::BlockDamage,
            ErrorCode::BufferDamage,
            ErrorCode::Released,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a.message(), b.message());
            }
        }
    }

    #[test]
    fn test_severity_classes() {
        assert!(ErrorCode::BlockDamage.is_integrity());
        assert!(ErrorCode::BlockDamage.is_fatal_integrity());
        assert!(ErrorCode::Released.is_integrity());
        assert!(!ErrorCode::Released.is_fatal_integrity());
        assert!(!ErrorCode::BadSize.is_integrity());
    }

    #[test]
    fn test_last_error_slot() {
        let slot = LastError::default();
        assert_eq!(slot.get(), None);
        slot.record(ErrorCode::BadSize);
        assert_eq!(slot.get(), Some(ErrorCode::BadSize));
        slot.clear();
        assert_eq!(slot.get(), None);
    }
}
