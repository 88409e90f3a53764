//! Call trace log.
//!
//! One line per traced allocator call, in a fixed field order:
//!
//! ```text
//! <op> <class> <name> <size> [<count>] <file> <line> <old-ptr> [<new-ptr>] <error>
//! ```
//!
//! with `op` one of `A` (alloc), `C` (alloc_zeroed), `F` (free),
//! `R` (resize). The file is opened lazily on the first record. If it
//! cannot be opened, or a write fails, the record goes to stderr and
//! the file is abandoned; a trace record is never silently dropped.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use super::error::ErrorCode;

/// Which allocator operation a trace record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TraceOp {
    Alloc,
    AllocZeroed,
    Free,
    Resize,
}

impl TraceOp {
    fn letter(self) -> char {
        match self {
            TraceOp::Alloc => 'A',
            TraceOp::AllocZeroed => 'C',
            TraceOp::Free => 'F',
            TraceOp::Resize => 'R',
        }
    }
}

/// One trace record, borrowed from the call site.
pub(crate) struct TraceRecord<'a> {
    pub op: TraceOp,
    pub class: &'a str,
    pub name: &'a str,
    pub size: usize,
    pub count: Option<usize>,
    pub file: &'a str,
    pub line: u32,
    pub old_ptr: usize,
    pub new_ptr: Option<usize>,
    pub error: Option<ErrorCode>,
}

impl TraceRecord<'_> {
    fn format(&self) -> String {
        let mut line = String::with_capacity(96);
        let _ = write!(
            line,
            "{} {} {} {}",
            self.op.letter(),
            if self.class.is_empty() { "-" } else { self.class },
            if self.name.is_empty() { "-" } else { self.name },
            self.size
        );
        if let Some(count) = self.count {
            let _ = write!(line, " {}", count);
        }
        let _ = write!(line, " {} {} {:#x}", self.file, self.line, self.old_ptr);
        if let Some(new_ptr) = self.new_ptr {
            let _ = write!(line, " {:#x}", new_ptr);
        }
        match self.error {
            Some(code) => {
                let _ = write!(line, " {:?}", code);
            }
            None => line.push_str(" OK"),
        }
        line
    }
}

/// Lazily-opened trace sink with guaranteed stderr fallback.
pub(crate) struct TraceLog {
    path: Option<PathBuf>,
    file: Option<File>,
    broken: bool,
}

impl TraceLog {
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            file: None,
            broken: false,
        }
    }

    /// Append one record, opening the file on first use.
    pub(crate) fn write(&mut self, record: &TraceRecord<'_>) {
        let line = record.format();

        if !self.broken {
            if self.file.is_none() {
                match &self.path {
                    Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
                        Ok(file) => self.file = Some(file),
                        Err(_) => self.broken = true,
                    },
                    // No trace file configured: stderr is the sink.
                    None => self.broken = true,
                }
            }
            if let Some(file) = &mut self.file {
                if writeln!(file, "{}", line).is_ok() {
                    return;
                }
                self.file = None;
                self.broken = true;
            }
        }

        let _ = writeln!(std::io::stderr(), "{}", line);
    }

    /// Flush and close the trace file.
    pub(crate) fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}
