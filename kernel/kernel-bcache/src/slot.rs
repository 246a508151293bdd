use core::ops::{Deref, DerefMut};

use kernel_sync::{SleepLock, SpinLock};

use crate::device::{BlockNo, DeviceId};
use crate::BLOCK_SIZE;

/// One block's worth of bytes, page-aligned so the buffer itself can be
/// installed into a page table (cache-backed file mappings).
#[repr(C, align(4096))]
pub struct BlockData {
    bytes: [u8; BLOCK_SIZE],
}

impl BlockData {
    pub(crate) const fn zeroed() -> Self {
        Self {
            bytes: [0; BLOCK_SIZE],
        }
    }
}

impl Deref for BlockData {
    type Target = [u8; BLOCK_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for BlockData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

/// Identity and bookkeeping of one cache slot.
///
/// Guarded by the slot's short spin lock. The identity fields only change
/// while `refcount == 0` (repurposing) and under the steal discipline, so a
/// claimant holding a reference may read them lock-free.
pub(crate) struct SlotMeta {
    pub dev: DeviceId,
    pub block: BlockNo,
    /// Buffer holds the block's current bytes. Cleared on repurpose, set by
    /// the sleep-lock holder after a successful device read.
    pub valid: bool,
    /// Live claims (readers plus pins). Non-zero keeps the slot out of
    /// steal's reach.
    pub refcount: u32,
}

/// One entry of the cache arena.
///
/// Two locks with distinct roles: `meta` is innermost and held for a few
/// instructions; `buf` is the long lock held across device I/O and while a
/// caller inspects or edits the bytes.
pub(crate) struct Slot {
    pub meta: SpinLock<SlotMeta>,
    pub buf: SleepLock<BlockData>,
}

impl Slot {
    pub(crate) const fn new(dev: DeviceId, block: BlockNo) -> Self {
        Self {
            meta: SpinLock::new(
                "bcache_slot",
                SlotMeta {
                    dev,
                    block,
                    valid: false,
                    refcount: 0,
                },
            ),
            buf: SleepLock::new("bcache_buf", BlockData::zeroed()),
        }
    }
}
