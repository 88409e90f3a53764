//! The allocator facade.
//!
//! [`GuardAlloc`] is a cheaply clonable handle over one shared
//! allocator instance: the block heap, the locked-buffer registry, the
//! mode stack, the integrity hooks and the trace log, each behind its
//! own lock. Callers hand out clones freely; the instance itself dies
//! with the last handle, releasing any memory still held.

use std::io::{self, Write};
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::config::AllocConfig;
use crate::api::modes::{Mode, ModeStack};
use crate::api::stats::{AllocStats, MemoryUse, StatScope};
use crate::core::arena::HeapState;
use crate::core::classes::ClassId;
use crate::debug::check::{self, CheckOutcome};
use crate::debug::locked::LockedRegistry;
use crate::diagnostics::error::{ErrorCode, LastError};
use crate::diagnostics::hooks::{self, AbortHook, DamageReport, ErrorHook, IntegrityHooks, Verdict};
use crate::diagnostics::trace::{TraceLog, TraceOp, TraceRecord};

pub(crate) struct Inner {
    config: AllocConfig,
    heap: Mutex<HeapState>,
    locked: Mutex<LockedRegistry>,
    modes: Mutex<ModeStack>,
    hooks: Mutex<IntegrityHooks>,
    trace: Mutex<TraceLog>,
    last_error: LastError,
    /// Set when fatal damage was continued past; masks the DEBUG and
    /// MODIFY modes until checks are re-enabled.
    degraded: AtomicBool,
}

// The heap holds raw block pointers that no other thread can reach
// except through these locks.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        self.heap.get_mut().release_all();
        self.trace.get_mut().close();
    }
}

/// Handle to one allocator instance.
#[derive(Clone)]
pub struct GuardAlloc {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GuardAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardAlloc")
            .field("stats", &self.stats())
            .finish()
    }
}

impl GuardAlloc {
    pub fn new(config: AllocConfig) -> Self {
        let inner = Inner {
            heap: Mutex::new(HeapState::new(config.tombstone_limit)),
            locked: Mutex::new(LockedRegistry::new()),
            modes: Mutex::new(ModeStack::new(config.initial_mode, config.mode_stack_depth)),
            hooks: Mutex::new(IntegrityHooks::default()),
            trace: Mutex::new(TraceLog::new(config.trace_file.clone())),
            last_error: LastError::default(),
            degraded: AtomicBool::new(false),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &AllocConfig {
        &self.inner.config
    }

    // ---- allocation ----

    /// Allocate `size` bytes in `class`, tagged with `name`.
    #[track_caller]
    pub fn alloc(&self, class: ClassId, name: &str, size: usize) -> Result<*mut u8, ErrorCode> {
        let caller = Location::caller();
        self.alloc_inner("alloc", class, name, size, None, caller)
    }

    /// Allocate `count` zero-initialized items of `item_size` bytes.
    #[track_caller]
    pub fn alloc_zeroed(
        &self,
        class: ClassId,
        name: &str,
        item_size: usize,
        count: usize,
    ) -> Result<*mut u8, ErrorCode> {
        let caller = Location::caller();
        if item_size.checked_mul(count).is_none() {
            return Err(self.fail(ErrorCode::BadSize));
        }
        self.alloc_inner("alloc_zeroed", class, name, item_size, Some(count), caller)
    }

    fn alloc_inner(
        &self,
        function: &'static str,
        class: ClassId,
        name: &str,
        size: usize,
        count: Option<usize>,
        caller: &'static Location<'static>,
    ) -> Result<*mut u8, ErrorCode> {
        if name.is_empty() && class != ClassId::NO_CHECK {
            return Err(self.fail(ErrorCode::NullPointer));
        }
        let mode = self.effective_mode();
        self.debug_scan(function, mode, caller)?;

        let zeroed = count.is_some();
        let total = size.saturating_mul(count.unwrap_or(1));
        let poison = mode.contains(Mode::MODIFY);

        let (result, class_label) = {
            let mut heap = self.inner.heap.lock();
            let result = heap.allocate(class, name, total, zeroed, poison);
            (result, heap.classes.name(class).unwrap_or("").to_string())
        };

        if mode.contains(Mode::TRACE) {
            let op = if zeroed {
                TraceOp::AllocZeroed
            } else {
                TraceOp::Alloc
            };
            self.inner.trace.lock().write(&TraceRecord {
                op,
                class: &class_label,
                name,
                size,
                count,
                file: caller.file(),
                line: caller.line(),
                old_ptr: result.map_or(0, |ptr| ptr as usize),
                new_ptr: None,
                error: result.err(),
            });
        }
        result.map_err(|code| self.fail(code))
    }

    /// Free a block. The block's canaries are verified first; damage is
    /// reported and the block is left in place.
    #[track_caller]
    pub fn free(&self, ptr: *mut u8) -> Result<(), ErrorCode> {
        let caller = Location::caller();
        if ptr.is_null() {
            return Err(self.fail(ErrorCode::NullPointer));
        }
        let mode = self.effective_mode();
        self.debug_scan("free", mode, caller)?;
        let addr = ptr as usize;

        let (outcome, meta) = {
            let heap = self.inner.heap.lock();
            (check::check_ptr(&heap, addr), heap.block_meta(addr).ok())
        };
        let verdict = match outcome {
            CheckOutcome::Ok | CheckOutcome::NoCheckClass => {
                let poison = mode.contains(Mode::MODIFY);
                self.inner
                    .heap
                    .lock()
                    .release(addr, poison)
                    .map_err(|code| self.fail(code))
            }
            other => self.handle_outcome("free", other, Some(ptr as *const u8), caller),
        };

        if mode.contains(Mode::TRACE) {
            let (class_label, name, size) = self.trace_meta(meta);
            self.inner.trace.lock().write(&TraceRecord {
                op: TraceOp::Free,
                class: &class_label,
                name: &name,
                size,
                count: None,
                file: caller.file(),
                line: caller.line(),
                old_ptr: addr,
                new_ptr: None,
                error: verdict.as_ref().err().copied(),
            });
        }
        verdict
    }

    /// Grow or shrink a block, preserving its class, name and leading
    /// contents. A null `ptr` allocates; a zero `new_size` frees and
    /// returns null.
    #[track_caller]
    pub fn resize(&self, ptr: *mut u8, new_size: usize) -> Result<*mut u8, ErrorCode> {
        let caller = Location::caller();
        let mode = self.effective_mode();
        self.debug_scan("resize", mode, caller)?;

        let old_addr = ptr as usize;
        let result = self.resize_inner(ptr, new_size, mode, caller);

        if mode.contains(Mode::TRACE) {
            let meta = result
                .ok()
                .filter(|new_ptr| !new_ptr.is_null())
                .map(|new_ptr| new_ptr as usize)
                .and_then(|addr| self.inner.heap.lock().block_meta(addr).ok());
            let (class_label, name, _) = self.trace_meta(meta);
            self.inner.trace.lock().write(&TraceRecord {
                op: TraceOp::Resize,
                class: &class_label,
                name: &name,
                size: new_size,
                count: None,
                file: caller.file(),
                line: caller.line(),
                old_ptr: old_addr,
                new_ptr: result.ok().map(|ptr| ptr as usize),
                error: result.err(),
            });
        }
        result
    }

    fn resize_inner(
        &self,
        ptr: *mut u8,
        new_size: usize,
        mode: Mode,
        caller: &'static Location<'static>,
    ) -> Result<*mut u8, ErrorCode> {
        let poison = mode.contains(Mode::MODIFY);

        if ptr.is_null() {
            return self
                .inner
                .heap
                .lock()
                .allocate(ClassId::DEFAULT, "realloc", new_size, false, poison)
                .map_err(|code| self.fail(code));
        }
        let addr = ptr as usize;

        let outcome = check::check_ptr(&self.inner.heap.lock(), addr);
        match outcome {
            CheckOutcome::Ok | CheckOutcome::NoCheckClass => {}
            other => {
                self.handle_outcome("resize", other, Some(ptr as *const u8), caller)?;
            }
        }

        if new_size == 0 {
            self.inner
                .heap
                .lock()
                .release(addr, poison)
                .map_err(|code| self.fail(code))?;
            return Ok(std::ptr::null_mut());
        }

        let mut heap = self.inner.heap.lock();
        let (class, name, old_len) = heap.block_meta(addr).map_err(|code| self.fail(code))?;
        let new_ptr = heap
            .allocate(class, &name, new_size, false, poison)
            .map_err(|code| self.fail(code))?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, old_len.min(new_size));
        }
        heap.release(addr, poison).map_err(|code| self.fail(code))?;
        Ok(new_ptr)
    }

    // ---- integrity checks ----

    /// Verify one block's canaries, or sweep the whole heap when `ptr`
    /// is `None`.
    #[track_caller]
    pub fn check_block(&self, ptr: Option<*const u8>) -> Result<(), ErrorCode> {
        let caller = Location::caller();
        let outcome = {
            let heap = self.inner.heap.lock();
            match ptr {
                Some(ptr) if ptr.is_null() => return Err(self.fail(ErrorCode::NullPointer)),
                Some(ptr) => check::check_ptr(&heap, ptr as usize),
                None => check::check_heap(&heap),
            }
        };
        match outcome {
            CheckOutcome::Ok => Ok(()),
            CheckOutcome::NoCheckClass => Err(self.fail(ErrorCode::NoCheckClass)),
            other => self.handle_outcome("check_block", other, ptr, caller),
        }
    }

    /// Lock a caller-owned buffer: checksum it now, verify it on every
    /// later check and on release.
    ///
    /// # Safety
    ///
    /// `ptr` must be readable for `len` bytes until released.
    pub unsafe fn lock_buffer(&self, ptr: *const u8, len: usize) -> Result<(), ErrorCode> {
        self.inner
            .locked
            .lock()
            .lock(ptr, len)
            .map_err(|code| self.fail(code))
    }

    /// Release a locked buffer, or all of them when `ptr` is `None`.
    /// The registration is removed even when the final verification
    /// fails.
    ///
    /// # Safety
    ///
    /// Each released region must still be readable for its length.
    #[track_caller]
    pub unsafe fn release_buffer(&self, ptr: Option<*const u8>) -> Result<(), ErrorCode> {
        let caller = Location::caller();
        let result = self.inner.locked.lock().release(ptr);
        match result {
            Ok(()) => Ok(()),
            Err(ErrorCode::BufferDamage) => Err(self.report_damage(
                "release_buffer",
                ErrorCode::BufferDamage,
                ptr,
                0,
                caller,
            )),
            Err(code) => Err(self.fail(code)),
        }
    }

    /// Verify a locked buffer, or all of them when `ptr` is `None`.
    ///
    /// # Safety
    ///
    /// Each checked region must still be readable for its length.
    #[track_caller]
    pub unsafe fn check_locked(&self, ptr: Option<*const u8>) -> Result<(), ErrorCode> {
        let caller = Location::caller();
        let result = self.inner.locked.lock().check(ptr);
        match result {
            Ok(()) => Ok(()),
            Err(ErrorCode::BufferDamage) => Err(self.report_damage(
                "check_locked",
                ErrorCode::BufferDamage,
                ptr,
                0,
                caller,
            )),
            Err(code) => Err(self.fail(code)),
        }
    }

    /// Re-arm DEBUG and MODIFY after a continued fatal error.
    pub fn re_enable_checks(&self) {
        self.inner.degraded.store(false, Ordering::Relaxed);
    }

    // ---- modes ----

    /// The mode in effect, with DEBUG and MODIFY masked while degraded.
    pub fn current_mode(&self) -> Mode {
        self.effective_mode()
    }

    /// Replace the current mode without touching the stack.
    pub fn set_mode(&self, mode: Mode) {
        self.inner.modes.lock().set(mode);
    }

    /// Push a new mode onto the stack. Past capacity the mode still
    /// applies but `Warn` is returned and the stack is marked
    /// overflowed.
    pub fn open_mode(&self, mode: Mode) -> Result<(), ErrorCode> {
        self.inner
            .modes
            .lock()
            .open(mode)
            .map_err(|code| self.fail(code))
    }

    /// Like [`open_mode`](Self::open_mode) with a raw bit pattern.
    pub fn open_mode_bits(&self, bits: u8) -> Result<(), ErrorCode> {
        let mode = Mode::try_from_bits(bits).map_err(|code| self.fail(code))?;
        self.open_mode(mode)
    }

    /// Pop the mode stack, returning the restored mode. After an
    /// overflow, one pop restores the base mode and empties the stack.
    pub fn close_mode(&self) -> Result<Mode, ErrorCode> {
        self.inner
            .modes
            .lock()
            .close()
            .map_err(|code| self.fail(code))
    }

    /// Push a mode and restore the previous one when the guard drops.
    pub fn mode_guard(&self, mode: Mode) -> ModeGuard {
        let _ = self.open_mode(mode);
        ModeGuard {
            alloc: self.clone(),
        }
    }

    // ---- hooks and errors ----

    pub fn set_error_hook(&self, hook: Option<ErrorHook>) {
        self.inner.hooks.lock().error_hook = hook;
    }

    pub fn set_abort_hook(&self, hook: Option<AbortHook>) {
        self.inner.hooks.lock().abort_hook = hook;
    }

    /// The most recent error code, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.inner.last_error.get()
    }

    pub fn clear_error(&self) {
        self.inner.last_error.clear();
    }

    // ---- classes ----

    pub fn create_class(&self, name: &str) -> Result<ClassId, ErrorCode> {
        self.inner
            .heap
            .lock()
            .classes
            .create(name)
            .map_err(|code| self.fail(code))
    }

    /// Close a user class. Fails with `ClassNotReleased` while the
    /// class still owns blocks.
    pub fn close_class(&self, id: ClassId) -> Result<(), ErrorCode> {
        self.inner
            .heap
            .lock()
            .classes
            .close(id)
            .map_err(|code| self.fail(code))
    }

    pub fn class_name(&self, id: ClassId) -> Option<String> {
        self.inner
            .heap
            .lock()
            .classes
            .name(id)
            .map(str::to_string)
    }

    /// All live class ids, built-ins first, then in creation order.
    pub fn classes(&self) -> Vec<ClassId> {
        self.inner.heap.lock().classes.ids_in_creation_order()
    }

    // ---- introspection ----

    /// User length of a live block.
    pub fn block_size(&self, ptr: *const u8) -> Result<usize, ErrorCode> {
        if ptr.is_null() {
            return Err(self.fail(ErrorCode::NullPointer));
        }
        self.inner
            .heap
            .lock()
            .block_size(ptr as usize)
            .map_err(|code| self.fail(code))
    }

    pub fn total_memory(&self, scope: StatScope) -> MemoryUse {
        self.inner.heap.lock().totals.scoped(scope)
    }

    pub fn class_memory(&self, id: ClassId, scope: StatScope) -> Result<MemoryUse, ErrorCode> {
        self.inner
            .heap
            .lock()
            .classes
            .memory(id, scope)
            .ok_or_else(|| self.fail(ErrorCode::ClassNotCreated))
    }

    pub fn stats(&self) -> AllocStats {
        self.inner.heap.lock().stats()
    }

    /// Forward-only cursor over live blocks: `None` yields the newest
    /// block, a previous result yields its chain successor.
    pub fn next_block(&self, prev: Option<*const u8>) -> Result<Option<*mut u8>, ErrorCode> {
        self.inner
            .heap
            .lock()
            .next_block(prev.map(|ptr| ptr as usize))
            .map_err(|code| self.fail(code))
    }

    /// Write a table of every live block to `w`, newest first.
    pub fn dump_blocks(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let heap = self.inner.heap.lock();
        writeln!(
            w,
            "{:<18} {:>10} {:>8}  {:<14} {}",
            "ADDRESS", "SIZE", "CONTROL", "CLASS", "NAME"
        )?;
        for index in heap.arena.chain() {
            if let Some(record) = heap.arena.record(index) {
                let class_label = heap.classes.name(record.class).unwrap_or("?");
                writeln!(
                    w,
                    "{:<#18x} {:>10} {:>8}  {:<14} {}",
                    record.user_addr,
                    record.user_len,
                    record.control_bytes(),
                    class_label,
                    record.name
                )?;
            }
        }
        let totals = heap.totals.scoped(StatScope::Current);
        writeln!(
            w,
            "{} blocks, {} user bytes, {} control bytes",
            totals.blocks, totals.user_bytes, totals.control_bytes
        )
    }

    /// Write per-class usage to `w`, one class or all of them.
    pub fn dump_classes(&self, w: &mut dyn io::Write, class: Option<ClassId>) -> io::Result<()> {
        let heap = self.inner.heap.lock();
        writeln!(
            w,
            "{:<6} {:<14} {:>8} {:>12} {:>12}",
            "CLASS", "NAME", "BLOCKS", "USER", "PEAK"
        )?;
        let ids = match class {
            Some(id) => vec![id],
            None => heap.classes.ids_in_creation_order(),
        };
        for id in ids {
            let Some(info) = heap.classes.get(id) else {
                continue;
            };
            let current = info.stats.scoped(StatScope::Current);
            let peak = info.stats.scoped(StatScope::Peak);
            writeln!(
                w,
                "{:<6} {:<14} {:>8} {:>12} {:>12}",
                id.to_string(),
                info.name,
                current.blocks,
                current.user_bytes,
                peak.user_bytes
            )?;
        }
        Ok(())
    }

    // ---- shutdown ----

    /// Orderly shutdown check: fails while blocks or locked buffers
    /// are outstanding, then verifies the empty heap, closes every
    /// user class, and closes the trace log. The instance stays
    /// usable either way.
    #[track_caller]
    pub fn close(&self) -> Result<(), ErrorCode> {
        let caller = Location::caller();
        if self.inner.heap.lock().arena.live_count() > 0 {
            return Err(self.fail(ErrorCode::NotEmpty));
        }
        if !self.inner.locked.lock().is_empty() {
            return Err(self.fail(ErrorCode::NotEmpty));
        }
        let outcome = check::check_heap(&self.inner.heap.lock());
        match outcome {
            CheckOutcome::Ok | CheckOutcome::NoCheckClass => {}
            other => {
                self.handle_outcome("close", other, None, caller)?;
            }
        }
        // An empty heap means every user class is empty too.
        self.inner.heap.lock().classes.close_all_user();
        self.inner.trace.lock().close();
        Ok(())
    }

    // ---- internals ----

    pub(crate) fn effective_mode(&self) -> Mode {
        let mode = self.inner.modes.lock().current();
        if self.inner.degraded.load(Ordering::Relaxed) {
            mode & !(Mode::DEBUG | Mode::MODIFY)
        } else {
            mode
        }
    }

    pub(crate) fn fail(&self, code: ErrorCode) -> ErrorCode {
        self.inner.last_error.record(code)
    }

    /// Start address and user length of the live block containing
    /// `addr`, interior pointers included.
    pub(crate) fn containing_block(&self, addr: usize) -> Option<(usize, usize)> {
        self.inner.heap.lock().containing_block(addr)
    }

    /// Full heap sweep before a mutating call, when DEBUG is set.
    fn debug_scan(
        &self,
        function: &'static str,
        mode: Mode,
        caller: &'static Location<'static>,
    ) -> Result<(), ErrorCode> {
        if !mode.contains(Mode::DEBUG) {
            return Ok(());
        }
        let outcome = check::check_heap(&self.inner.heap.lock());
        match outcome {
            CheckOutcome::Ok | CheckOutcome::NoCheckClass => Ok(()),
            other => self.handle_outcome(function, other, None, caller),
        }
    }

    /// Turn a detector outcome into an error, routing damage through
    /// the hook machinery.
    fn handle_outcome(
        &self,
        function: &'static str,
        outcome: CheckOutcome,
        ptr: Option<*const u8>,
        caller: &'static Location<'static>,
    ) -> Result<(), ErrorCode> {
        match outcome {
            CheckOutcome::Ok | CheckOutcome::NoCheckClass => Ok(()),
            CheckOutcome::NotFound => Err(self.fail(ErrorCode::NotFound)),
            CheckOutcome::Released => {
                Err(self.report_damage(function, ErrorCode::Released, ptr, 0, caller))
            }
            CheckOutcome::Damage(spot) => Err(self.report_damage(
                function,
                ErrorCode::BlockDamage,
                Some(spot.addr as *const u8),
                spot.offset,
                caller,
            )),
            CheckOutcome::Fatal => {
                Err(self.report_damage(function, ErrorCode::Fatal, None, 0, caller))
            }
        }
    }

    /// Report damage: print, consult the error hook, abort on `Stop`,
    /// degrade self-checking on a continued fatal error.
    ///
    /// The hooks are cloned out of their lock before being invoked, so
    /// a hook may call back into the allocator.
    pub(crate) fn report_damage(
        &self,
        function: &'static str,
        code: ErrorCode,
        ptr: Option<*const u8>,
        offset: isize,
        caller: &'static Location<'static>,
    ) -> ErrorCode {
        let report = DamageReport {
            code,
            function,
            file: caller.file(),
            line: caller.line(),
            ptr,
            offset,
        };
        hooks::emit(&report);

        let snapshot = self.inner.hooks.lock().clone();
        let continue_mode = self.inner.modes.lock().current().contains(Mode::CONTINUE);
        match snapshot.decide(&report, continue_mode) {
            Verdict::Stop => snapshot.abort(&report),
            Verdict::Continue => {
                if code.is_fatal_integrity() {
                    self.inner.degraded.store(true, Ordering::Relaxed);
                }
                self.fail(code)
            }
        }
    }

    fn trace_meta(
        &self,
        meta: Option<(ClassId, String, usize)>,
    ) -> (String, String, usize) {
        match meta {
            Some((class, name, size)) => {
                let label = self
                    .inner
                    .heap
                    .lock()
                    .classes
                    .name(class)
                    .unwrap_or("")
                    .to_string();
                (label, name, size)
            }
            None => (String::new(), String::new(), 0),
        }
    }
}

/// RAII mode frame: restores the previous mode on drop.
#[must_use = "the pushed mode is popped when the guard drops"]
pub struct ModeGuard {
    alloc: GuardAlloc,
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        let _ = self.alloc.close_mode();
    }
}
