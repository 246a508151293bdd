use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use kernel_addresses::PhysicalAddress;
use kernel_params::{CACHE_BUCKETS, CACHE_SLOTS};
use kernel_sync::{SleepLockGuard, SpinLock};

use crate::CacheFault;
use crate::device::{BlockDevice, BlockNo, DeviceId};
use crate::slot::{BlockData, Slot};

/// Block buffer cache: a fixed arena of [`CACHE_SLOTS`] slots indexed by
/// [`CACHE_BUCKETS`] hash buckets.
///
/// Each bucket is a list of slot indices behind its own spin lock, ordered
/// most-recently-claimed first. A hit, and a miss the home bucket can absorb
/// by repurposing one of its own unclaimed slots, touch exactly one bucket
/// lock; only a fully occupied home bucket escalates to the global steal
/// lock. Block bytes live behind each slot's sleep lock, so a caller can
/// hold a block across device I/O without spinning anyone else.
pub struct BufferCache<D> {
    device: D,
    /// Allocated once and never moved; buffer addresses handed out by
    /// [`pin`](Self::pin) stay stable for the cache's lifetime.
    slots: Box<[Slot]>,
    buckets: [SpinLock<Vec<usize>>; CACHE_BUCKETS],
    /// Total order over cross-bucket slot moves. Held together with the
    /// destination bucket's lock for the whole move, so a steal can never
    /// race a same-block claim into duplicate residency.
    steal: SpinLock<()>,
}

impl<D> BufferCache<D> {
    /// Build the arena over `device`. Slot `i` starts homed in bucket
    /// `i % CACHE_BUCKETS` under a placeholder identity.
    #[must_use]
    pub fn new(device: D) -> Self {
        let slots: Box<[Slot]> = (0..CACHE_SLOTS)
            .map(|i| Slot::new(DeviceId(0), BlockNo(i as u32)))
            .collect();
        let buckets = core::array::from_fn(|b| {
            SpinLock::new(
                "bcache_bucket",
                (b..CACHE_SLOTS).step_by(CACHE_BUCKETS).collect(),
            )
        });
        Self {
            device,
            slots,
            buckets,
            steal: SpinLock::new("bcache_steal", ()),
        }
    }

    /// The transport this cache sits on.
    #[must_use]
    pub const fn device(&self) -> &D {
        &self.device
    }

    const fn bucket_of(block: BlockNo) -> usize {
        block.0 as usize % CACHE_BUCKETS
    }

    /// Claim under `home`'s bucket lock alone: the slot already holding
    /// `(dev, block)`, or failing that the oldest unclaimed slot homed
    /// there. The match scan and the in-bucket repurpose share one critical
    /// section, so a racing miss on the same block finds this claim instead
    /// of giving the block a second slot.
    fn claim_in_bucket(&self, home: usize, dev: DeviceId, block: BlockNo) -> Option<usize> {
        let mut bucket = self.buckets[home].lock();
        self.claim_under(&mut bucket, dev, block)
    }

    fn claim_under(&self, bucket: &mut Vec<usize>, dev: DeviceId, block: BlockNo) -> Option<usize> {
        if let Some(pos) = bucket.iter().position(|&idx| {
            self.slots[idx]
                .meta
                .with_lock(|m| m.dev == dev && m.block == block)
        }) {
            let idx = bucket.remove(pos);
            bucket.insert(0, idx);
            self.slots[idx].meta.with_lock(|m| m.refcount += 1);
            return Some(idx);
        }

        // Oldest unclaimed slot. refcount zero means no claim, no pin, no
        // sleep-lock holder: the slot is ours to re-identify.
        let pos = bucket
            .iter()
            .rposition(|&idx| self.slots[idx].meta.with_lock(|m| m.refcount == 0))?;
        let idx = bucket.remove(pos);
        self.slots[idx].meta.with_lock(|m| {
            m.dev = dev;
            m.block = block;
            m.valid = false;
            m.refcount = 1;
        });
        bucket.insert(0, idx);
        Some(idx)
    }

    /// Claim a slot for `(dev, block)`, repurposing one on a miss.
    fn claim(&self, dev: DeviceId, block: BlockNo) -> Result<usize, CacheFault> {
        let home = Self::bucket_of(block);

        if let Some(idx) = self.claim_in_bucket(home, dev, block) {
            return Ok(idx);
        }

        // Home bucket fully occupied: steal a slot from another bucket.
        // Cross-bucket moves serialize on the steal lock and hold the home
        // bucket's lock for the whole move, so a racing claim of the same
        // block sees either no slot yet or the finished one, never a
        // second chance to insert. Only the steal holder ever holds two
        // bucket locks, so the nesting cannot deadlock.
        let _steal = self.steal.lock();
        let mut bucket = self.buckets[home].lock();

        // A racing claim may have cached the block, or a release may have
        // freed a home slot, while we waited.
        if let Some(idx) = self.claim_under(&mut bucket, dev, block) {
            log::debug!("bcache: claim of {dev}, {block} settled while awaiting steal");
            return Ok(idx);
        }

        for victim in (0..CACHE_BUCKETS).filter(|&b| b != home) {
            let mut donor = self.buckets[victim].lock();
            let Some(pos) = donor
                .iter()
                .rposition(|&idx| self.slots[idx].meta.with_lock(|m| m.refcount == 0))
            else {
                continue;
            };
            let idx = donor.remove(pos);
            drop(donor);

            self.slots[idx].meta.with_lock(|m| {
                m.dev = dev;
                m.block = block;
                m.valid = false;
                m.refcount = 1;
            });
            bucket.insert(0, idx);
            log::debug!("bcache: stole a slot from bucket {victim} for {dev}, {block}");
            return Ok(idx);
        }

        log::warn!("bcache: pool exhausted claiming {dev}, {block}");
        Err(CacheFault::PoolExhausted)
    }

    /// Drop one claim; the slot becomes a steal candidate at refcount zero.
    fn release_slot(&self, idx: usize) {
        // Identity is stable while our claim is live.
        let block = self.slots[idx].meta.with_lock(|m| m.block);
        let home = Self::bucket_of(block);

        let mut bucket = self.buckets[home].lock();
        let now_free = self.slots[idx].meta.with_lock(|m| {
            debug_assert!(m.refcount > 0, "release without a claim");
            m.refcount -= 1;
            m.refcount == 0
        });
        if now_free {
            // Most recently used to the head; steal scans from the tail.
            if let Some(pos) = bucket.iter().position(|&i| i == idx) {
                bucket.remove(pos);
                bucket.insert(0, idx);
            }
        }
    }
}

impl<D: BlockDevice> BufferCache<D> {
    /// Claim `(dev, block)` and return its bytes under the slot's sleep
    /// lock, reading from the device if the slot is not yet valid.
    ///
    /// # Errors
    /// [`CacheFault::PoolExhausted`] when every slot is claimed or pinned;
    /// [`CacheFault::Io`] when the device read fails (the claim is undone).
    pub fn read(&self, dev: DeviceId, block: BlockNo) -> Result<BlockGuard<'_, D>, CacheFault> {
        let idx = self.claim(dev, block)?;
        let slot = &self.slots[idx];

        let mut buf = slot.buf.lock();
        if !slot.meta.with_lock(|m| m.valid) {
            if let Err(e) = self.device.read(dev, block, &mut buf) {
                drop(buf);
                self.release_slot(idx);
                return Err(CacheFault::Io(e));
            }
            slot.meta.with_lock(|m| m.valid = true);
        }

        Ok(BlockGuard {
            cache: self,
            idx,
            dev,
            block,
            buf: ManuallyDrop::new(buf),
        })
    }

    /// Write the guarded block's bytes through to the device.
    ///
    /// Taking the guard proves the caller holds the slot's sleep lock.
    ///
    /// # Errors
    /// [`CacheFault::Io`] when the device write fails.
    pub fn write(&self, guard: &BlockGuard<'_, D>) -> Result<(), CacheFault> {
        self.device
            .write(guard.dev, guard.block, &guard.buf)
            .map_err(CacheFault::Io)
    }

    /// Hand the block back. Plain drop does the same; the method exists so
    /// call sites read as claim/release pairs.
    pub fn release(&self, guard: BlockGuard<'_, D>) {
        drop(guard);
    }

    /// Take an extra claim on the guarded slot and return its buffer
    /// address, for installing the buffer into a page table. The slot stays
    /// resident until a matching [`unpin`](Self::unpin).
    pub fn pin(&self, guard: &BlockGuard<'_, D>) -> PhysicalAddress {
        self.slots[guard.idx].meta.with_lock(|m| m.refcount += 1);
        PhysicalAddress::from_ptr(self.slots[guard.idx].buf.data_ptr())
    }

    /// Drop the claim a [`pin`](Self::pin) took on a resident block.
    ///
    /// # Errors
    /// The fatal tier: [`CacheFault::NotResident`] / [`CacheFault::NotPinned`]
    /// mean the caller's page tables reference a buffer the cache no longer
    /// (or never) backed.
    pub fn unpin(&self, dev: DeviceId, block: BlockNo) -> Result<(), CacheFault> {
        let home = Self::bucket_of(block);
        let mut bucket = self.buckets[home].lock();

        let Some(pos) = bucket.iter().position(|&idx| {
            self.slots[idx]
                .meta
                .with_lock(|m| m.dev == dev && m.block == block)
        }) else {
            return Err(CacheFault::NotResident { dev, block });
        };
        let idx = bucket[pos];

        let now_free = self.slots[idx].meta.with_lock(|m| {
            if m.refcount == 0 {
                return Err(CacheFault::NotPinned { dev, block });
            }
            m.refcount -= 1;
            Ok(m.refcount == 0)
        })?;
        if now_free {
            bucket.remove(pos);
            bucket.insert(0, idx);
        }
        Ok(())
    }
}

/// Exclusive access to one cached block.
///
/// Owns the slot's sleep lock and one claim on the slot, so the bytes cannot
/// change underneath the holder and the slot cannot be repurposed. Derefs to
/// the block bytes. Dropping the guard releases both.
pub struct BlockGuard<'a, D> {
    cache: &'a BufferCache<D>,
    idx: usize,
    dev: DeviceId,
    block: BlockNo,
    buf: ManuallyDrop<SleepLockGuard<'a, BlockData>>,
}

impl<D> BlockGuard<'_, D> {
    #[must_use]
    pub const fn dev(&self) -> DeviceId {
        self.dev
    }

    #[must_use]
    pub const fn block(&self) -> BlockNo {
        self.block
    }
}

impl<D> core::fmt::Debug for BlockGuard<'_, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockGuard")
            .field("dev", &self.dev)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

impl<D> Deref for BlockGuard<'_, D> {
    type Target = BlockData;
    fn deref(&self) -> &BlockData {
        &self.buf
    }
}

impl<D> DerefMut for BlockGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut BlockData {
        &mut self.buf
    }
}

impl<D> Drop for BlockGuard<'_, D> {
    fn drop(&mut self) {
        // Release the sleep lock before the claim, so the slot is never
        // steal-eligible while its lock is still held.
        // Safety: dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.buf) };
        self.cache.release_slot(self.idx);
    }
}
