//! Corruption detector.
//!
//! Classifies a pointer, possibly wild, against the arena without
//! ever dereferencing memory the arena does not own. For a live
//! checked block, four canaries are combined into a decision table:
//! prefix tag, postfix tag (with the control header as a fifth,
//! structural canary), the predecessor's forward-link canary, and the
//! successor's backward-link canary. Tags intact but exactly one
//! neighbor link wrong means the damage is in that neighbor's header,
//! so the neighbor gets the blame.

use crate::core::arena::HeapState;
use crate::core::classes::ClassId;
use crate::core::layout::{
    self, TagState, HEADER_SIZE, NEXT_FIELD_OFFSET, PREV_FIELD_OFFSET, TAG_SIZE,
};
use crate::diagnostics::error::ErrorCode;

/// Where damage was localized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DamageSpot {
    /// User pointer of the blamed block.
    pub addr: usize,
    /// Byte offset of the damage relative to that block's user data.
    pub offset: isize,
}

/// Result of classifying one pointer or the whole heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckOutcome {
    Ok,
    /// The block belongs to the no-check class; nothing to verify.
    NoCheckClass,
    /// The pointer names a released (tombstoned) block.
    Released,
    /// The pointer does not belong to the arena at all.
    NotFound,
    /// A canary is wrong; the spot names the blamed block.
    Damage(DamageSpot),
    /// The chain itself is inconsistent.
    Fatal,
}

impl CheckOutcome {
    pub(crate) fn error_code(self) -> Option<ErrorCode> {
        match self {
            CheckOutcome::Ok => None,
            CheckOutcome::NoCheckClass => Some(ErrorCode::NoCheckClass),
            CheckOutcome::Released => Some(ErrorCode::Released),
            CheckOutcome::NotFound => Some(ErrorCode::NotFound),
            CheckOutcome::Damage(_) => Some(ErrorCode::BlockDamage),
            CheckOutcome::Fatal => Some(ErrorCode::Fatal),
        }
    }
}

/// Classify one pointer.
pub(crate) fn check_ptr(heap: &HeapState, addr: usize) -> CheckOutcome {
    let Some(index) = heap.arena.lookup(addr) else {
        return CheckOutcome::NotFound;
    };
    let Some(record) = heap.arena.record(index) else {
        return CheckOutcome::NotFound;
    };
    if !record.is_live() {
        return CheckOutcome::Released;
    }
    check_record(heap, index)
}

/// Scan the whole heap: every block's canaries, plus a traversal-count
/// cross-check of the chain against the recorded totals.
pub(crate) fn check_heap(heap: &HeapState) -> CheckOutcome {
    let chain = heap.arena.chain();
    if chain.len() != heap.arena.live_count() {
        return CheckOutcome::Fatal;
    }
    if heap.classes.total_live_blocks() != heap.arena.live_count() {
        return CheckOutcome::Fatal;
    }
    for index in chain {
        match check_record(heap, index) {
            CheckOutcome::Ok | CheckOutcome::NoCheckClass => {}
            other => return other,
        }
    }
    CheckOutcome::Ok
}

fn check_record(heap: &HeapState, index: u32) -> CheckOutcome {
    let Some(record) = heap.arena.record(index) else {
        return CheckOutcome::NotFound;
    };

    // No-check blocks opted out of verification entirely: the answer
    // is always the class condition, never Ok and never damage.
    if record.class == ClassId::NO_CHECK || !record.layout.checked {
        return CheckOutcome::NoCheckClass;
    }

    let base = record.base as *const u8;
    let prefix = unsafe { layout::read_prefix(base, &record.layout) };

    // A prefix that exactly matches another state's magic is reported
    // as that condition, not as generic damage: it is the signature of
    // a stale or mis-stamped block, which is more actionable.
    match TagState::from_magic(prefix) {
        Some(TagState::Released) => return CheckOutcome::Released,
        Some(TagState::NoCheck) => return CheckOutcome::NoCheckClass,
        _ => {}
    }

    let prefix_ok = prefix == TagState::Live.magic();
    let postfix_ok =
        unsafe { layout::read_postfix(base, &record.layout, record.user_len) }
            == TagState::Live.magic();
    let header = unsafe { layout::read_header(base, &record.layout) };
    let header_ok = header.verify()
        && header.record == index
        && header.generation == record.generation
        && header.class == record.class.0
        && header.user_len == record.user_len;

    if prefix_ok && postfix_ok && header_ok {
        let pred_ok = neighbor_link_ok(heap, record.prev, |h| h.next_addr, record.user_addr);
        let succ_ok = neighbor_link_ok(heap, record.next, |h| h.prev_addr, record.user_addr);
        return match (pred_ok, succ_ok) {
            (true, true) => CheckOutcome::Ok,
            // Own canaries fine, one neighbor pointing elsewhere: the
            // overwrite happened in that neighbor's header.
            (false, true) => CheckOutcome::Damage(DamageSpot {
                addr: neighbor_addr(heap, record.prev),
                offset: NEXT_FIELD_OFFSET,
            }),
            (true, false) => CheckOutcome::Damage(DamageSpot {
                addr: neighbor_addr(heap, record.next),
                offset: PREV_FIELD_OFFSET,
            }),
            (false, false) => CheckOutcome::Damage(DamageSpot {
                addr: record.user_addr,
                offset: -((TAG_SIZE + HEADER_SIZE) as isize),
            }),
        };
    }

    // Innermost damaged canary wins the report.
    let spot = if !prefix_ok {
        DamageSpot {
            addr: record.user_addr,
            offset: -(TAG_SIZE as isize),
        }
    } else if !postfix_ok {
        DamageSpot {
            addr: record.user_addr,
            offset: record.user_len as isize,
        }
    } else {
        DamageSpot {
            addr: record.user_addr,
            offset: -((TAG_SIZE + HEADER_SIZE) as isize),
        }
    };
    CheckOutcome::Damage(spot)
}

/// Read a neighbor's link canary from its in-memory header. Bare
/// neighbors carry no header and cannot vouch either way.
fn neighbor_link_ok(
    heap: &HeapState,
    neighbor: Option<u32>,
    field: impl Fn(&layout::BlockHeader) -> usize,
    expected: usize,
) -> bool {
    let Some(index) = neighbor else { return true };
    let Some(record) = heap.arena.record(index) else {
        return true;
    };
    if !record.is_live() || !record.layout.checked {
        return true;
    }
    let header = unsafe { layout::read_header(record.base as *const u8, &record.layout) };
    field(&header) == expected
}

fn neighbor_addr(heap: &HeapState, neighbor: Option<u32>) -> usize {
    neighbor
        .and_then(|index| heap.arena.record(index))
        .map_or(0, |record| record.user_addr)
}
