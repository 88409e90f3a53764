//! Block record arena and heap state.
//!
//! Every tracked allocation is described by a [`BlockRecord`] held in a
//! slot arena; records are addressed by index, linkage between blocks
//! is indices, and a pointer map resolves user pointers to records.
//! The arena is ground truth: the header and tag bytes written into
//! each allocation are canaries checked against it, never the other
//! way around.
//!
//! Released records linger as tombstones (bounded by configuration) so
//! that freeing an already-freed pointer reports `Released` instead of
//! `NotFound`. A tombstone whose address is reused by a later
//! allocation is dropped at that point.

use std::alloc::{alloc, dealloc};
use std::collections::{HashMap, VecDeque};

use crate::api::stats::{AllocStats, UsageStats};
use crate::core::classes::{ClassId, ClassTable};
use crate::core::layout::{self, BlockHeader, BlockLayout, TagState};
use crate::debug::poison;
use crate::diagnostics::error::ErrorCode;

/// Bookkeeping for one tracked allocation.
pub(crate) struct BlockRecord {
    /// Allocation base; null once the record is a tombstone.
    pub base: *mut u8,
    pub layout: BlockLayout,
    pub user_addr: usize,
    pub user_len: usize,
    pub class: ClassId,
    pub generation: u32,
    pub name: Box<str>,
    pub prev: Option<u32>,
    pub next: Option<u32>,
    pub state: TagState,
}

impl BlockRecord {
    pub(crate) fn is_live(&self) -> bool {
        !self.base.is_null() && self.state != TagState::Released
    }

    pub(crate) fn user_ptr(&self) -> *mut u8 {
        self.user_addr as *mut u8
    }

    pub(crate) fn control_bytes(&self) -> usize {
        self.layout.control_bytes(self.user_len)
    }
}

enum ArenaSlot {
    Occupied(BlockRecord),
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// Slot arena with free-list recycling, generation counters, and the
/// index-linked global block chain.
pub(crate) struct BlockArena {
    slots: Vec<ArenaSlot>,
    free_head: Option<u32>,
    by_addr: HashMap<usize, u32>,
    /// First record in the global chain.
    head: Option<u32>,
    live_count: usize,
    tombstones: VecDeque<u32>,
    tombstone_limit: usize,
}

impl BlockArena {
    pub(crate) fn new(tombstone_limit: usize) -> Self {
        Self {
            slots: Vec::with_capacity(64),
            free_head: None,
            by_addr: HashMap::new(),
            head: None,
            live_count: 0,
            tombstones: VecDeque::new(),
            tombstone_limit,
        }
    }

    pub(crate) fn record(&self, index: u32) -> Option<&BlockRecord> {
        match self.slots.get(index as usize) {
            Some(ArenaSlot::Occupied(record)) => Some(record),
            _ => None,
        }
    }

    pub(crate) fn record_mut(&mut self, index: u32) -> Option<&mut BlockRecord> {
        match self.slots.get_mut(index as usize) {
            Some(ArenaSlot::Occupied(record)) => Some(record),
            _ => None,
        }
    }

    pub(crate) fn lookup(&self, user_addr: usize) -> Option<u32> {
        self.by_addr.get(&user_addr).copied()
    }

    pub(crate) fn head(&self) -> Option<u32> {
        self.head
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live_count
    }

    /// Occupy a slot for a fresh record and register its address.
    fn insert(&mut self, mut record: BlockRecord) -> u32 {
        let user_addr = record.user_addr;
        let index = match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let (next_free, generation) = match slot {
                    ArenaSlot::Vacant {
                        next_free,
                        generation,
                    } => (*next_free, *generation),
                    ArenaSlot::Occupied(_) => (None, 0),
                };
                self.free_head = next_free;
                record.generation = generation.wrapping_add(1);
                *slot = ArenaSlot::Occupied(record);
                index
            }
            None => {
                let index = self.slots.len() as u32;
                record.generation = 1;
                self.slots.push(ArenaSlot::Occupied(record));
                index
            }
        };
        self.by_addr.insert(user_addr, index);
        index
    }

    /// Link a record into the chain, directly before `before`, or at
    /// the chain head when `before` is `None`.
    fn link_before(&mut self, index: u32, before: Option<u32>) {
        match before {
            Some(succ) => {
                let pred = self.record(succ).and_then(|r| r.prev);
                if let Some(record) = self.record_mut(index) {
                    record.prev = pred;
                    record.next = Some(succ);
                }
                if let Some(record) = self.record_mut(succ) {
                    record.prev = Some(index);
                }
                match pred {
                    Some(pred) => {
                        if let Some(record) = self.record_mut(pred) {
                            record.next = Some(index);
                        }
                    }
                    None => self.head = Some(index),
                }
            }
            None => {
                let old_head = self.head;
                if let Some(record) = self.record_mut(index) {
                    record.prev = None;
                    record.next = old_head;
                }
                if let Some(head) = old_head {
                    if let Some(record) = self.record_mut(head) {
                        record.prev = Some(index);
                    }
                }
                self.head = Some(index);
            }
        }
        self.live_count += 1;
    }

    /// Remove a record from the chain, returning its former neighbors.
    fn unlink(&mut self, index: u32) -> (Option<u32>, Option<u32>) {
        let (prev, next) = match self.record(index) {
            Some(record) => (record.prev, record.next),
            None => return (None, None),
        };
        match prev {
            Some(pred) => {
                if let Some(record) = self.record_mut(pred) {
                    record.next = next;
                }
            }
            None => self.head = next,
        }
        if let Some(succ) = next {
            if let Some(record) = self.record_mut(succ) {
                record.prev = prev;
            }
        }
        if let Some(record) = self.record_mut(index) {
            record.prev = None;
            record.next = None;
        }
        self.live_count -= 1;
        (prev, next)
    }

    /// Turn a live record into a tombstone, evicting the oldest
    /// tombstone past the retention bound.
    fn retire(&mut self, index: u32) {
        if let Some(record) = self.record_mut(index) {
            record.base = std::ptr::null_mut();
            record.state = TagState::Released;
        }
        self.tombstones.push_back(index);
        while self.tombstones.len() > self.tombstone_limit {
            if let Some(old) = self.tombstones.pop_front() {
                self.drop_record(old);
            }
        }
    }

    /// Remove a tombstone outright (its address was reused).
    fn drop_tombstone(&mut self, index: u32) {
        if let Some(pos) = self.tombstones.iter().position(|&t| t == index) {
            self.tombstones.remove(pos);
        }
        self.drop_record(index);
    }

    fn drop_record(&mut self, index: u32) {
        let generation = match self.slots.get(index as usize) {
            Some(ArenaSlot::Occupied(record)) => {
                self.by_addr.remove(&record.user_addr);
                record.generation
            }
            _ => return,
        };
        self.slots[index as usize] = ArenaSlot::Vacant {
            next_free: self.free_head,
            generation,
        };
        self.free_head = Some(index);
    }

    /// Chain indices from the head, bounded so a bookkeeping bug can
    /// never spin forever.
    pub(crate) fn chain(&self) -> Vec<u32> {
        let mut indices = Vec::with_capacity(self.live_count);
        let mut cursor = self.head;
        while let Some(index) = cursor {
            if indices.len() > self.live_count {
                break;
            }
            indices.push(index);
            cursor = self.record(index).and_then(|r| r.next);
        }
        indices
    }
}

/// The arena, class table and running totals, guarded by one lock.
pub(crate) struct HeapState {
    pub arena: BlockArena,
    pub classes: ClassTable,
    pub totals: UsageStats,
    pub alloc_count: u64,
    pub free_count: u64,
}

impl HeapState {
    pub(crate) fn new(tombstone_limit: usize) -> Self {
        Self {
            arena: BlockArena::new(tombstone_limit),
            classes: ClassTable::new(),
            totals: UsageStats::default(),
            alloc_count: 0,
            free_count: 0,
        }
    }

    /// Build one block: raw allocation, canaries, record, chain link,
    /// statistics. `zero` and `poison` control the user-byte fill.
    pub(crate) fn allocate(
        &mut self,
        class: ClassId,
        name: &str,
        size: usize,
        zero: bool,
        poison: bool,
    ) -> Result<*mut u8, ErrorCode> {
        if size == 0 {
            return Err(ErrorCode::BadSize);
        }
        if self.classes.get(class).is_none() {
            return Err(ErrorCode::ClassNotCreated);
        }

        let bare = class == ClassId::NO_CHECK;
        let block_layout = if bare {
            BlockLayout::bare(size)
        } else {
            BlockLayout::checked(name.len(), size)
        }
        .ok_or(ErrorCode::BadSize)?;
        let alloc_layout = block_layout.alloc_layout().ok_or(ErrorCode::BadSize)?;

        let base = unsafe { alloc(alloc_layout) };
        if base.is_null() {
            return Err(ErrorCode::NoMemory);
        }
        let user = unsafe { base.add(block_layout.user_offset) };
        let user_addr = user as usize;

        unsafe {
            if zero {
                std::ptr::write_bytes(user, 0, size);
            } else if poison {
                poison::fill_uninit(user, size);
            }
            if block_layout.checked {
                layout::write_name(base, name);
                layout::write_prefix(base, &block_layout, TagState::Live);
                layout::write_postfix(base, &block_layout, size, TagState::Live);
            } else {
                layout::write_prefix(base, &block_layout, TagState::NoCheck);
            }
        }

        // The raw allocator may hand back an address an old tombstone
        // still claims.
        if let Some(stale) = self.arena.lookup(user_addr) {
            self.arena.drop_tombstone(stale);
        }

        let record = BlockRecord {
            base,
            layout: block_layout,
            user_addr,
            user_len: size,
            class,
            generation: 0,
            name: if bare { "".into() } else { name.into() },
            prev: None,
            next: None,
            state: if bare { TagState::NoCheck } else { TagState::Live },
        };
        let index = self.arena.insert(record);

        // Class contiguity: directly before the class's first block,
        // or at the chain head when the class has none.
        let before = self.classes.get(class).and_then(|info| info.first_block);
        self.arena.link_before(index, before);
        if let Some(info) = self.classes.get_mut(class) {
            info.first_block = Some(index);
        }

        let control = block_layout.control_bytes(size);
        if let Some(info) = self.classes.get_mut(class) {
            info.stats.on_alloc(size, control);
        }
        self.totals.on_alloc(size, control);
        self.alloc_count += 1;

        self.refresh_canaries_around(index);
        Ok(user)
    }

    /// Tear one block down. The caller is expected to have run the
    /// corruption detector first; this only distinguishes live,
    /// tombstoned, and unknown pointers.
    pub(crate) fn release(&mut self, user_addr: usize, poison: bool) -> Result<(), ErrorCode> {
        let index = self.arena.lookup(user_addr).ok_or(ErrorCode::NotFound)?;
        let (base, block_layout, user_len, class) = {
            let record = self.arena.record(index).ok_or(ErrorCode::NotFound)?;
            if !record.is_live() {
                return Err(ErrorCode::Released);
            }
            (record.base, record.layout, record.user_len, record.class)
        };

        let (prev, next) = self.arena.unlink(index);

        // Keep the class's first-block pointer on a block of its own
        // class, preserving the contiguity invariant.
        if let Some(info) = self.classes.get_mut(class) {
            if info.first_block == Some(index) {
                info.first_block = match next {
                    Some(succ) if self.arena.record(succ).map(|r| r.class) == Some(class) => {
                        Some(succ)
                    }
                    _ => None,
                };
            }
        }

        let control = block_layout.control_bytes(user_len);
        if let Some(info) = self.classes.get_mut(class) {
            info.stats.on_free(user_len, control);
        }
        self.totals.on_free(user_len, control);
        self.free_count += 1;

        unsafe {
            // Stamp the tag before the memory goes back, so a debugger
            // looking at a stale pointer sees the released magic.
            layout::write_prefix(base, &block_layout, TagState::Released);
            if poison {
                poison::fill_freed(user_addr as *mut u8, user_len);
            }
            if let Some(alloc_layout) = block_layout.alloc_layout() {
                dealloc(base, alloc_layout);
            }
        }

        self.arena.retire(index);
        self.refresh_canary(prev);
        self.refresh_canary(next);
        Ok(())
    }

    /// Class, name and user length of a live block.
    pub(crate) fn block_meta(&self, user_addr: usize) -> Result<(ClassId, String, usize), ErrorCode> {
        let index = self.arena.lookup(user_addr).ok_or(ErrorCode::NotFound)?;
        let record = self.arena.record(index).ok_or(ErrorCode::NotFound)?;
        if !record.is_live() {
            return Err(ErrorCode::Released);
        }
        Ok((record.class, record.name.to_string(), record.user_len))
    }

    pub(crate) fn block_size(&self, user_addr: usize) -> Result<usize, ErrorCode> {
        self.block_meta(user_addr).map(|(_, _, len)| len)
    }

    /// The live block containing `addr`, if any (interior pointers
    /// included). Linear scan; this is a debugging allocator.
    pub(crate) fn containing_block(&self, addr: usize) -> Option<(usize, usize)> {
        self.arena.chain().into_iter().find_map(|index| {
            let record = self.arena.record(index)?;
            let start = record.user_addr;
            let end = start.checked_add(record.user_len)?;
            (addr >= start && addr < end).then(|| (start, record.user_len))
        })
    }

    /// Forward-only cursor over live blocks. `None` starts at the
    /// chain head; otherwise `prev` must be a pointer returned before.
    pub(crate) fn next_block(&self, prev: Option<usize>) -> Result<Option<*mut u8>, ErrorCode> {
        let next_index = match prev {
            None => self.arena.head(),
            Some(addr) => {
                let index = self.arena.lookup(addr).ok_or(ErrorCode::NotFound)?;
                let record = self.arena.record(index).ok_or(ErrorCode::NotFound)?;
                if !record.is_live() {
                    return Err(ErrorCode::Released);
                }
                record.next
            }
        };
        Ok(next_index
            .and_then(|index| self.arena.record(index))
            .map(BlockRecord::user_ptr))
    }

    pub(crate) fn stats(&self) -> AllocStats {
        AllocStats {
            current: self.totals.current,
            peak: self.totals.peak,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
        }
    }

    /// Rewrite the header canary of `index` and both neighbors.
    fn refresh_canaries_around(&mut self, index: u32) {
        let (prev, next) = match self.arena.record(index) {
            Some(record) => (record.prev, record.next),
            None => return,
        };
        self.refresh_canary(Some(index));
        self.refresh_canary(prev);
        self.refresh_canary(next);
    }

    /// Rewrite one record's header canary from arena ground truth.
    /// Guard tags are deliberately left alone: refreshing them would
    /// mask damage between detector runs.
    fn refresh_canary(&mut self, index: Option<u32>) {
        let Some(index) = index else { return };
        let Some(record) = self.arena.record(index) else {
            return;
        };
        if !record.is_live() || !record.layout.checked {
            return;
        }
        let neighbor_addr = |idx: Option<u32>| {
            idx.and_then(|i| self.arena.record(i))
                .map_or(0, |r| r.user_addr)
        };
        let mut header = BlockHeader {
            record: index,
            generation: record.generation,
            class: record.class.0,
            name_len: record.name.len() as u32,
            user_len: record.user_len,
            prev_addr: neighbor_addr(record.prev),
            next_addr: neighbor_addr(record.next),
            checksum: 0,
        };
        header.seal();
        unsafe { layout::write_header(record.base, &record.layout, &header) };
    }

    /// Release every live block's memory. Used on drop and when a
    /// prior unclosed session's blocks must be reclaimed.
    pub(crate) fn release_all(&mut self) {
        for slot_index in 0..self.arena.slots.len() {
            if let ArenaSlot::Occupied(record) = &self.arena.slots[slot_index] {
                if record.is_live() {
                    if let Some(alloc_layout) = record.layout.alloc_layout() {
                        unsafe { dealloc(record.base, alloc_layout) };
                    }
                }
            }
        }
        let limit = self.arena.tombstone_limit;
        self.arena = BlockArena::new(limit);
        self.classes = ClassTable::new();
        self.totals = UsageStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::stats::StatScope;

    fn heap() -> HeapState {
        HeapState::new(64)
    }

    #[test]
    fn test_allocate_free_round_trip() {
        let mut heap = heap();
        let ptr = heap
            .allocate(ClassId::DEFAULT, "blob", 64, false, false)
            .unwrap();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % layout::USER_ALIGN, 0);
        assert_eq!(heap.block_size(ptr as usize), Ok(64));
        assert_eq!(heap.arena.live_count(), 1);

        heap.release(ptr as usize, false).unwrap();
        assert_eq!(heap.arena.live_count(), 0);
        assert_eq!(heap.release(ptr as usize, false), Err(ErrorCode::Released));
    }

    #[test]
    fn test_unknown_pointer_is_not_found() {
        let mut heap = heap();
        let mut local = 0u64;
        let wild = &mut local as *mut u64 as usize;
        assert_eq!(heap.release(wild, false), Err(ErrorCode::NotFound));
        assert_eq!(heap.block_size(wild), Err(ErrorCode::NotFound));
    }

    #[test]
    fn test_zeroed_fill() {
        let mut heap = heap();
        let ptr = heap
            .allocate(ClassId::DEFAULT, "z", 32, true, false)
            .unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 32) };
        assert!(bytes.iter().all(|&b| b == 0));
        heap.release(ptr as usize, false).unwrap();
    }

    #[test]
    fn test_class_contiguity() {
        let mut heap = heap();
        let class = heap.classes.create("mesh").unwrap();
        let a = heap.allocate(ClassId::DEFAULT, "a", 16, false, false).unwrap();
        let m1 = heap.allocate(class, "m1", 16, false, false).unwrap();
        let b = heap.allocate(ClassId::DEFAULT, "b", 16, false, false).unwrap();
        let m2 = heap.allocate(class, "m2", 16, false, false).unwrap();

        // Walk the chain: blocks of `class` must be adjacent.
        let classes: Vec<ClassId> = heap
            .arena
            .chain()
            .into_iter()
            .map(|i| heap.arena.record(i).unwrap().class)
            .collect();
        let first = classes.iter().position(|&c| c == class).unwrap();
        let last = classes.iter().rposition(|&c| c == class).unwrap();
        assert_eq!(last - first + 1, 2, "class blocks not contiguous: {classes:?}");

        for ptr in [a, m1, b, m2] {
            heap.release(ptr as usize, false).unwrap();
        }
    }

    #[test]
    fn test_stats_balance() {
        let mut heap = heap();
        let a = heap.allocate(ClassId::DEFAULT, "a", 100, false, false).unwrap();
        let b = heap.allocate(ClassId::NO_CHECK, "", 50, false, false).unwrap();

        let total: usize = heap.classes.total_live_blocks();
        assert_eq!(total, heap.arena.live_count());
        assert_eq!(heap.totals.current.user_bytes, 150);

        heap.release(a as usize, false).unwrap();
        heap.release(b as usize, false).unwrap();
        assert_eq!(heap.totals.current.user_bytes, 0);
        assert_eq!(heap.classes.total_live_blocks(), 0);
        assert_eq!(
            heap.classes
                .memory(ClassId::DEFAULT, StatScope::Peak)
                .unwrap()
                .user_bytes,
            100
        );
    }

    #[test]
    fn test_cursor_enumerates_all_blocks() {
        let mut heap = heap();
        let mut ptrs = Vec::new();
        for i in 0..5 {
            ptrs.push(
                heap.allocate(ClassId::DEFAULT, "n", 8 + i, false, false)
                    .unwrap(),
            );
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        while let Some(ptr) = heap.next_block(cursor).unwrap() {
            seen.push(ptr);
            cursor = Some(ptr as usize);
        }
        assert_eq!(seen.len(), 5);
        for ptr in &ptrs {
            assert!(seen.contains(ptr));
        }
        for ptr in ptrs {
            heap.release(ptr as usize, false).unwrap();
        }
    }

    #[test]
    fn test_tombstone_eviction() {
        let mut heap = HeapState::new(2);
        let mut addrs = Vec::new();
        for _ in 0..4 {
            let ptr = heap.allocate(ClassId::DEFAULT, "t", 24, false, false).unwrap();
            addrs.push(ptr as usize);
        }
        for &addr in &addrs {
            heap.release(addr, false).unwrap();
        }
        // Only the last two tombstones survive the bound.
        let released = addrs
            .iter()
            .filter(|&&addr| heap.release(addr, false) == Err(ErrorCode::Released))
            .count();
        assert_eq!(released, 2);
    }

    #[test]
    fn test_containing_block_for_interior_pointer() {
        let mut heap = heap();
        let ptr = heap.allocate(ClassId::DEFAULT, "c", 64, false, false).unwrap();
        let addr = ptr as usize;
        assert_eq!(heap.containing_block(addr + 10), Some((addr, 64)));
        assert_eq!(heap.containing_block(addr + 64), None);
        heap.release(addr, false).unwrap();
    }
}
