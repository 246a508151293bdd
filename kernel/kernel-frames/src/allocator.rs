use alloc::vec;
use alloc::vec::Vec;
use core::ptr;

use kernel_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use kernel_params::{CpuId, MAX_CPUS};
use kernel_sync::SpinLock;

use crate::free_list::FreeList;
use crate::{FrameFault, OutOfFrames};

/// Byte written over a frame when it is handed out.
pub const ALLOC_FILL: u8 = 0x05;

/// Byte written over a frame when it returns to a free list.
pub const FREE_FILL: u8 = 0x01;

/// Physical frame allocator over a fixed page-aligned region.
///
/// Each CPU owns one free list behind its own [`SpinLock`], so the common
/// alloc/free path contends on nothing. A CPU whose list runs dry steals the
/// front half of another CPU's list in a single critical section.
///
/// Every frame also carries a sharing count: [`share`](Self::share) lets
/// copy-on-write duplicate a mapping without copying the frame, and
/// [`free`](Self::free) only recycles the frame once the last sharer lets go.
pub struct FrameAllocator {
    start: PhysicalAddress,
    end: PhysicalAddress,
    lists: [SpinLock<FreeList>; MAX_CPUS],
    /// Sharing count per frame, indexed by `(pa - start) / PAGE_SIZE`.
    /// Zero means the frame is free (or was never seeded).
    shares: SpinLock<Vec<u32>>,
}

impl FrameAllocator {
    /// Create an allocator managing `start..end`. The region starts fully
    /// unseeded; call [`free_range`](Self::free_range) to make frames
    /// available.
    ///
    /// # Safety
    /// `start..end` must be page-aligned, valid, writable memory that the
    /// caller hands over exclusively for the allocator's lifetime.
    ///
    /// # Panics
    /// If the bounds are misaligned or inverted.
    #[must_use]
    pub unsafe fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        assert!(start.is_page_aligned(), "region start not page aligned");
        assert!(end.is_page_aligned(), "region end not page aligned");
        assert!(start <= end, "region bounds inverted");

        let frames = ((end - start) >> PAGE_SHIFT) as usize;
        Self {
            start,
            end,
            lists: [const { SpinLock::new("frame_list", FreeList::new()) }; MAX_CPUS],
            shares: SpinLock::new("frame_shares", vec![0; frames]),
        }
    }

    /// Seed every page in `start..end` onto `cpu`'s free list.
    ///
    /// # Safety
    /// The range must lie within the managed region and contain no frame
    /// that is currently allocated.
    ///
    /// # Panics
    /// If the range is misaligned or escapes the managed region.
    pub unsafe fn free_range(&self, cpu: CpuId, start: PhysicalAddress, end: PhysicalAddress) {
        assert!(start.is_page_aligned() && end.is_page_aligned());
        assert!(self.start <= start && end <= self.end);

        let mut seeded = FreeList::new();
        let mut pa = start;
        while pa < end {
            // Safety: the frame is ours per this function's contract.
            unsafe {
                ptr::write_bytes(pa.as_mut_ptr(), FREE_FILL, PAGE_SIZE as usize);
                seeded.push(pa.as_mut_ptr());
            }
            pa += PAGE_SIZE;
        }

        let count = seeded.len();
        self.lists[cpu.as_index()].with_lock(|list| list.prepend(seeded));
        log::debug!("{cpu}: seeded {count} frames ({start}..{end})");
    }

    /// Hand out one frame, preferring `cpu`'s own list and stealing from
    /// another CPU when it is empty. The frame comes back filled with
    /// [`ALLOC_FILL`] and a sharing count of one.
    ///
    /// # Errors
    /// [`OutOfFrames`] when every list is empty.
    pub fn alloc(&self, cpu: CpuId) -> Result<PhysicalAddress, OutOfFrames> {
        let frame = self.lists[cpu.as_index()]
            .with_lock(FreeList::pop)
            .or_else(|| self.steal(cpu))
            .ok_or(OutOfFrames)?;

        let pa = PhysicalAddress::from_ptr(frame);
        let idx = self.index_of(pa).expect("free list held a foreign frame");
        self.shares.with_lock(|shares| shares[idx] = 1);

        // Safety: the frame just left a free list, so it is ours alone.
        unsafe { ptr::write_bytes(frame, ALLOC_FILL, PAGE_SIZE as usize) };
        log::trace!("{cpu}: alloc {pa}");
        Ok(pa)
    }

    /// Drop one share of `frame`; the last drop scrubs the frame with
    /// [`FREE_FILL`] and links it onto the **calling** CPU's list.
    ///
    /// # Errors
    /// The [`FrameFault`] tier signals caller corruption: a misaligned or
    /// foreign address, or a frame nobody holds (double free).
    pub fn free(&self, cpu: CpuId, frame: PhysicalAddress) -> Result<(), FrameFault> {
        let idx = self.index_of(frame)?;

        let last = self.shares.with_lock(|shares| {
            if shares[idx] == 0 {
                return Err(FrameFault::NotAllocated(frame));
            }
            shares[idx] -= 1;
            Ok(shares[idx] == 0)
        })?;
        if !last {
            log::trace!("{cpu}: unshare {frame}");
            return Ok(());
        }

        // Scrub before linking; the link node overwrites the first bytes.
        // Safety: the last share was ours, so no one else references the frame.
        unsafe {
            ptr::write_bytes(frame.as_mut_ptr(), FREE_FILL, PAGE_SIZE as usize);
            self.lists[cpu.as_index()].with_lock(|list| list.push(frame.as_mut_ptr()));
        }
        log::trace!("{cpu}: free {frame}");
        Ok(())
    }

    /// Add one share to an allocated frame, so a later [`free`](Self::free)
    /// keeps it alive. Copy-on-write uses this instead of copying.
    ///
    /// # Errors
    /// [`FrameFault`] if the address is invalid or the frame is not
    /// currently allocated.
    pub fn share(&self, frame: PhysicalAddress) -> Result<(), FrameFault> {
        let idx = self.index_of(frame)?;
        self.shares.with_lock(|shares| {
            if shares[idx] == 0 {
                return Err(FrameFault::NotAllocated(frame));
            }
            shares[idx] += 1;
            Ok(())
        })
    }

    /// Current sharing count of a frame (zero when free).
    ///
    /// # Errors
    /// [`FrameFault`] if the address is misaligned or out of range.
    pub fn share_count(&self, frame: PhysicalAddress) -> Result<u32, FrameFault> {
        let idx = self.index_of(frame)?;
        Ok(self.shares.with_lock(|shares| shares[idx]))
    }

    /// Total bytes sitting on free lists, across all CPUs.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.lists
            .iter()
            .map(|list| list.with_lock(|l| l.len() as u64))
            .sum::<u64>()
            * PAGE_SIZE
    }

    /// Number of free frames on one CPU's list.
    #[must_use]
    pub fn free_frames_on(&self, cpu: CpuId) -> usize {
        self.lists[cpu.as_index()].with_lock(|list| list.len())
    }

    /// Take the front half of some other CPU's list and keep the change.
    ///
    /// The thief's own lock is *not* held here, and at most one donor lock
    /// is held at a time, so two CPUs stealing from each other cannot
    /// deadlock.
    fn steal(&self, thief: CpuId) -> Option<*mut u8> {
        for donor in 0..MAX_CPUS {
            if donor == thief.as_index() {
                continue;
            }
            let mut taken = self.lists[donor].with_lock(FreeList::take_front_half);
            if taken.len() == 0 {
                continue;
            }
            log::debug!("{thief}: stole {} frames from cpu{donor}", taken.len());

            let frame = taken.pop();
            self.lists[thief.as_index()].with_lock(|list| list.prepend(taken));
            return frame;
        }
        None
    }

    fn index_of(&self, frame: PhysicalAddress) -> Result<usize, FrameFault> {
        if !frame.is_page_aligned() {
            return Err(FrameFault::Unaligned(frame));
        }
        if frame < self.start || frame >= self.end {
            return Err(FrameFault::OutOfRange(frame));
        }
        Ok(((frame - self.start) >> PAGE_SHIFT) as usize)
    }
}
