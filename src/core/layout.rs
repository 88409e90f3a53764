//! In-memory block layout and guard canaries.
//!
//! A checked block occupies one raw allocation laid out as:
//!
//! ```text
//! | name bytes | pad | control header | prefix tag | user bytes | postfix tag |
//! ```
//!
//! The header and both tags are canaries: the arena record is the
//! ground truth, and the detector cross-checks these bytes against it.
//! A no-check block carries only the leading tag:
//!
//! ```text
//! | pad | prefix tag | user bytes |
//! ```

/// Alignment of the user data area.
pub(crate) const USER_ALIGN: usize = 16;

/// Size of a guard tag in bytes.
pub(crate) const TAG_SIZE: usize = 8;

/// Size of the control header in bytes.
pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

/// Byte offset, relative to the user data start, of the header's
/// `prev_addr` field. Used to localize neighbor-canary damage.
pub(crate) const PREV_FIELD_OFFSET: isize = -((TAG_SIZE + HEADER_SIZE) as isize) + 24;

/// Byte offset of the header's `next_addr` field, as above.
pub(crate) const NEXT_FIELD_OFFSET: isize = -((TAG_SIZE + HEADER_SIZE) as isize) + 32;

const LIVE_MAGIC: u64 = 0xA110_CA7E_A110_CA7E;
const RELEASED_MAGIC: u64 = 0xDEAD_B10C_DEAD_B10C;
const NO_CHECK_MAGIC: u64 = 0xBA2E_B10C_BA2E_B10C;

const CHECKSUM_SALT: u64 = 0x6A7D_A110_C5A1_7EAD;

/// State a guard tag encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagState {
    Live,
    Released,
    NoCheck,
}

impl TagState {
    pub(crate) fn magic(self) -> u64 {
        match self {
            TagState::Live => LIVE_MAGIC,
            TagState::Released => RELEASED_MAGIC,
            TagState::NoCheck => NO_CHECK_MAGIC,
        }
    }

    /// Decode a tag word that exactly matches one of the magics.
    pub(crate) fn from_magic(word: u64) -> Option<TagState> {
        match word {
            LIVE_MAGIC => Some(TagState::Live),
            RELEASED_MAGIC => Some(TagState::Released),
            NO_CHECK_MAGIC => Some(TagState::NoCheck),
            _ => None,
        }
    }
}

/// Control header written directly before the prefix tag.
///
/// Field order is load-bearing: `PREV_FIELD_OFFSET`/`NEXT_FIELD_OFFSET`
/// above must track it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct BlockHeader {
    pub record: u32,
    pub generation: u32,
    pub class: u32,
    pub name_len: u32,
    pub user_len: usize,
    /// User address of the chain predecessor, 0 at the head.
    pub prev_addr: usize,
    /// User address of the chain successor, 0 at the tail.
    pub next_addr: usize,
    pub checksum: u64,
}

impl BlockHeader {
    fn compute_checksum(&self) -> u64 {
        CHECKSUM_SALT
            ^ (u64::from(self.record)
                .wrapping_add(u64::from(self.generation).rotate_left(8))
                .wrapping_add(u64::from(self.class).rotate_left(16))
                .wrapping_add(u64::from(self.name_len).rotate_left(24))
                .wrapping_add(self.user_len as u64)
                .wrapping_add((self.prev_addr as u64).rotate_left(32))
                .wrapping_add((self.next_addr as u64).rotate_left(40)))
    }

    /// Fill in the checksum over the other fields.
    pub(crate) fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub(crate) fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

/// Resolved offsets for one block allocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockLayout {
    /// Whether the block carries a control header and postfix tag.
    pub checked: bool,
    pub header_offset: usize,
    pub prefix_offset: usize,
    pub user_offset: usize,
    pub total_size: usize,
}

impl BlockLayout {
    /// Layout for a fully-checked block. `None` on arithmetic overflow.
    pub(crate) fn checked(name_len: usize, user_len: usize) -> Option<Self> {
        let control = name_len.checked_add(HEADER_SIZE + TAG_SIZE)?;
        let user_offset = align_up(control, USER_ALIGN)?;
        let total_size = user_offset.checked_add(user_len)?.checked_add(TAG_SIZE)?;
        Some(Self {
            checked: true,
            header_offset: user_offset - TAG_SIZE - HEADER_SIZE,
            prefix_offset: user_offset - TAG_SIZE,
            user_offset,
            total_size,
        })
    }

    /// Layout for a no-check block: leading tag only.
    pub(crate) fn bare(user_len: usize) -> Option<Self> {
        let total_size = USER_ALIGN.checked_add(user_len)?;
        Some(Self {
            checked: false,
            header_offset: 0,
            prefix_offset: USER_ALIGN - TAG_SIZE,
            user_offset: USER_ALIGN,
            total_size,
        })
    }

    /// Control overhead: everything that is not user data.
    pub(crate) fn control_bytes(&self, user_len: usize) -> usize {
        self.total_size - user_len
    }

    pub(crate) fn alloc_layout(&self) -> Option<std::alloc::Layout> {
        std::alloc::Layout::from_size_align(self.total_size.max(1), USER_ALIGN).ok()
    }
}

fn align_up(n: usize, align: usize) -> Option<usize> {
    n.checked_add(align - 1).map(|v| v & !(align - 1))
}

// Canary accessors. All of them read or write inside a single live
// allocation owned by the arena; `base` must be the allocation base
// and `layout`/`user_len` must describe that allocation.

pub(crate) unsafe fn write_name(base: *mut u8, name: &str) {
    std::ptr::copy_nonoverlapping(name.as_ptr(), base, name.len());
}

pub(crate) unsafe fn write_prefix(base: *mut u8, layout: &BlockLayout, state: TagState) {
    (base.add(layout.prefix_offset) as *mut u64).write_unaligned(state.magic());
}

pub(crate) unsafe fn read_prefix(base: *const u8, layout: &BlockLayout) -> u64 {
    (base.add(layout.prefix_offset) as *const u64).read_unaligned()
}

pub(crate) unsafe fn write_postfix(
    base: *mut u8,
    layout: &BlockLayout,
    user_len: usize,
    state: TagState,
) {
    (base.add(layout.user_offset + user_len) as *mut u64).write_unaligned(state.magic());
}

pub(crate) unsafe fn read_postfix(base: *const u8, layout: &BlockLayout, user_len: usize) -> u64 {
    (base.add(layout.user_offset + user_len) as *const u64).read_unaligned()
}

pub(crate) unsafe fn write_header(base: *mut u8, layout: &BlockLayout, header: &BlockHeader) {
    (base.add(layout.header_offset) as *mut BlockHeader).write_unaligned(*header);
}

pub(crate) unsafe fn read_header(base: *const u8, layout: &BlockLayout) -> BlockHeader {
    (base.add(layout.header_offset) as *const BlockHeader).read_unaligned()
}
