//! Block classes: named groups of blocks with their own statistics.
//!
//! Class ids are slot indices into a growable table. Freed slots are
//! recycled through an intrusive free list, so an id stays valid for
//! exactly the lifetime of its class. Slots 0 and 1 are the permanent
//! built-in classes.

use crate::api::stats::{MemoryUse, StatScope, UsageStats};
use crate::diagnostics::error::ErrorCode;

/// Stable identifier of a block class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub(crate) u32);

impl ClassId {
    /// The built-in class with full bookkeeping.
    pub const DEFAULT: ClassId = ClassId(0);

    /// The built-in minimal-overhead class: leading tag only, no
    /// header, no per-block name, no postfix guard.
    pub const NO_CHECK: ClassId = ClassId(1);

    /// Sentinel for "no class"; never a valid table slot.
    pub const NONE: ClassId = ClassId(u32::MAX);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Descriptor of one created class.
pub(crate) struct ClassInfo {
    pub name: String,
    /// Arena index of the class's first block in the global chain.
    pub first_block: Option<u32>,
    pub stats: UsageStats,
    /// Creation sequence number, for ordered enumeration.
    seq: u64,
    predefined: bool,
}

enum Slot {
    Occupied(ClassInfo),
    Vacant { next_free: Option<u32> },
}

/// The class descriptor table.
pub(crate) struct ClassTable {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    next_seq: u64,
    user_classes: usize,
}

impl ClassTable {
    pub(crate) fn new() -> Self {
        let mut slots = Vec::with_capacity(8);
        slots.push(Slot::Occupied(Self::built_in("DEFAULT", 0)));
        slots.push(Slot::Occupied(Self::built_in("NO_CHECK", 1)));
        Self {
            slots,
            free_head: None,
            next_seq: 2,
            user_classes: 0,
        }
    }

    fn built_in(name: &str, seq: u64) -> ClassInfo {
        ClassInfo {
            name: name.to_string(),
            first_block: None,
            stats: UsageStats::default(),
            seq,
            predefined: true,
        }
    }

    /// Create a class, recycling a vacant slot when one exists.
    pub(crate) fn create(&mut self, name: &str) -> Result<ClassId, ErrorCode> {
        if name.is_empty() {
            return Err(ErrorCode::NullPointer);
        }

        let info = ClassInfo {
            name: name.to_string(),
            first_block: None,
            stats: UsageStats::default(),
            seq: self.next_seq,
            predefined: false,
        };
        self.next_seq += 1;
        self.user_classes += 1;

        match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                self.free_head = match slot {
                    Slot::Vacant { next_free } => *next_free,
                    Slot::Occupied(_) => None,
                };
                *slot = Slot::Occupied(info);
                Ok(ClassId(index))
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied(info));
                Ok(ClassId(index))
            }
        }
    }

    /// Close a class. Fails when the id is stale, the class still owns
    /// blocks, or the class is predefined. Closing the last user class
    /// collapses the table back to the built-in pair.
    pub(crate) fn close(&mut self, id: ClassId) -> Result<(), ErrorCode> {
        let info = self.get(id).ok_or(ErrorCode::ClassNotCreated)?;
        if info.predefined {
            return Err(ErrorCode::ClassPredefined);
        }
        if info.stats.current.blocks != 0 {
            return Err(ErrorCode::ClassNotReleased);
        }

        self.slots[id.index()] = Slot::Vacant {
            next_free: self.free_head,
        };
        self.free_head = Some(id.0);
        self.user_classes -= 1;

        if self.user_classes == 0 {
            self.slots.truncate(2);
            self.free_head = None;
        }
        Ok(())
    }

    /// Close every user class at once, collapsing the table back to
    /// the built-in pair. Callers ensure no class still owns blocks.
    pub(crate) fn close_all_user(&mut self) {
        self.slots.truncate(2);
        self.free_head = None;
        self.user_classes = 0;
    }

    pub(crate) fn get(&self, id: ClassId) -> Option<&ClassInfo> {
        match self.slots.get(id.index()) {
            Some(Slot::Occupied(info)) => Some(info),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: ClassId) -> Option<&mut ClassInfo> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::Occupied(info)) => Some(info),
            _ => None,
        }
    }

    pub(crate) fn name(&self, id: ClassId) -> Option<&str> {
        self.get(id).map(|info| info.name.as_str())
    }

    pub(crate) fn memory(&self, id: ClassId, scope: StatScope) -> Option<MemoryUse> {
        self.get(id).map(|info| info.stats.scoped(scope))
    }

    /// All class ids in creation order.
    pub(crate) fn ids_in_creation_order(&self) -> Vec<ClassId> {
        let mut ids: Vec<(u64, ClassId)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied(info) => Some((info.seq, ClassId(index as u32))),
                Slot::Vacant { .. } => None,
            })
            .collect();
        ids.sort_by_key(|(seq, _)| *seq);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Live blocks summed over every class.
    pub(crate) fn total_live_blocks(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Occupied(info) => Some(info.stats.current.blocks),
                Slot::Vacant { .. } => None,
            })
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn table_len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_in_classes() {
        let table = ClassTable::new();
        assert_eq!(table.name(ClassId::DEFAULT), Some("DEFAULT"));
        assert_eq!(table.name(ClassId::NO_CHECK), Some("NO_CHECK"));
        assert_eq!(table.name(ClassId::NONE), None);
    }

    #[test]
    fn test_create_and_close() {
        let mut table = ClassTable::new();
        let id = table.create("textures").unwrap();
        assert_eq!(id.index(), 2);
        assert_eq!(table.name(id), Some("textures"));
        table.close(id).unwrap();
        assert_eq!(table.name(id), None);
        assert_eq!(table.close(id), Err(ErrorCode::ClassNotCreated));
    }

    #[test]
    fn test_predefined_never_closable() {
        let mut table = ClassTable::new();
        assert_eq!(table.close(ClassId::DEFAULT), Err(ErrorCode::ClassPredefined));
        assert_eq!(table.close(ClassId::NO_CHECK), Err(ErrorCode::ClassPredefined));
    }

    #[test]
    fn test_slot_recycling_keeps_ids_stable() {
        let mut table = ClassTable::new();
        let a = table.create("a").unwrap();
        let b = table.create("b").unwrap();
        table.close(a).unwrap();
        // The vacant slot is recycled before the table grows.
        let c = table.create("c").unwrap();
        assert_eq!(c.0, a.0);
        assert_eq!(table.name(b), Some("b"));
        assert_eq!(table.name(c), Some("c"));
    }

    #[test]
    fn test_close_with_live_blocks_fails() {
        let mut table = ClassTable::new();
        let id = table.create("busy").unwrap();
        table.get_mut(id).unwrap().stats.on_alloc(64, 16);
        assert_eq!(table.close(id), Err(ErrorCode::ClassNotReleased));
        table.get_mut(id).unwrap().stats.on_free(64, 16);
        table.close(id).unwrap();
    }

    #[test]
    fn test_collapse_after_last_user_class() {
        let mut table = ClassTable::new();
        let a = table.create("a").unwrap();
        let b = table.create("b").unwrap();
        table.close(a).unwrap();
        assert!(table.table_len() > 2);
        table.close(b).unwrap();
        assert_eq!(table.table_len(), 2);
        // New ids start right after the built-ins again.
        let c = table.create("c").unwrap();
        assert_eq!(c.index(), 2);
    }

    #[test]
    fn test_close_all_user_collapses_table() {
        let mut table = ClassTable::new();
        let a = table.create("a").unwrap();
        let b = table.create("b").unwrap();
        table.close(a).unwrap();
        table.close_all_user();
        assert_eq!(table.name(b), None);
        assert_eq!(table.table_len(), 2);
        let c = table.create("c").unwrap();
        assert_eq!(c.index(), 2);
    }

    #[test]
    fn test_creation_order_enumeration() {
        let mut table = ClassTable::new();
        let a = table.create("a").unwrap();
        let b = table.create("b").unwrap();
        table.close(a).unwrap();
        let c = table.create("c").unwrap();
        let order = table.ids_in_creation_order();
        assert_eq!(order[0], ClassId::DEFAULT);
        assert_eq!(order[1], ClassId::NO_CHECK);
        assert_eq!(order[2], b);
        assert_eq!(order[3], c);
    }
}
