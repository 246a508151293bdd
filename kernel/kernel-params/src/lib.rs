//! # System-Wide Configuration
//!
//! The authoritative source for the fixed sizing constants shared by the
//! memory-management subsystems. Everything here is a compile-time constant;
//! growing any of these pools at runtime is deliberately unsupported.
//!
//! ## Mapped-file region
//!
//! File mappings placed without a caller-supplied address are packed downward
//! from the top of a dedicated window of user virtual address space:
//!
//! ```text
//! 0x0000_4000_0000_0000 ┌─────────────────────────────┐ MAP_REGION_TOP
//!                       │   file mappings (grow down) │
//! 0x0000_1000_0000_0000 ├─────────────────────────────┤ MAP_REGION_BASE
//!                       │   heap / stack / code       │
//! 0x0000_0000_0000_0000 └─────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

use core::fmt;

/// Maximum number of CPUs the frame allocator partitions its free lists for.
pub const MAX_CPUS: usize = 8;

/// Number of hash buckets in the block buffer cache.
///
/// Prime, so consecutive block numbers spread across buckets.
pub const CACHE_BUCKETS: usize = 17;

/// Total cache slots in the buffer-cache arena.
pub const CACHE_SLOTS: usize = 3 * CACHE_BUCKETS;

/// Maximum live file mappings per process.
pub const MAX_MAPPINGS: usize = 16;

/// Exclusive upper bound of the region mappings are placed in.
pub const MAP_REGION_TOP: u64 = 0x0000_4000_0000_0000;

/// Inclusive lower bound of the region mappings are placed in.
pub const MAP_REGION_BASE: u64 = 0x0000_1000_0000_0000;

const _: () = {
    assert!(MAX_CPUS >= 1);
    assert!(CACHE_SLOTS >= CACHE_BUCKETS);
    assert!(MAP_REGION_BASE < MAP_REGION_TOP);
    assert!(MAP_REGION_TOP % 4096 == 0);
    assert!(MAP_REGION_BASE % 4096 == 0);
};

/// Identity of the CPU an operation runs on.
///
/// Free-list selection in the frame allocator keys off this value, so callers
/// must stay pinned to the named CPU for the duration of any allocator call
/// they pass it to.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct CpuId(usize);

impl CpuId {
    /// # Panics
    /// If `id` is not below [`MAX_CPUS`].
    #[inline]
    #[must_use]
    pub const fn new(id: usize) -> Self {
        assert!(id < MAX_CPUS, "cpu id out of range");
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}
