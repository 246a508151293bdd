//! # Block Buffer Cache
//!
//! A fixed pool of in-memory copies of device blocks, giving the rest of the
//! kernel two guarantees:
//!
//! 1. **at most one copy** of any `(device, block)` pair is resident, and
//! 2. **at most one context at a time** holds a block's bytes, so reads and
//!    edits need no further synchronization.
//!
//! Residency is tracked in hash buckets with per-bucket spin locks; the
//! block bytes themselves sit behind per-slot sleep locks that are held
//! across device I/O. Exclusivity is expressed in the type system: reading a
//! block yields a [`BlockGuard`], and writing a block back requires that
//! guard, so "write without the lock" does not compile.
//!
//! Blocks are page-sized and page-aligned, which lets the fault-handling
//! layer install a pinned cache buffer directly into a page table instead of
//! copying it into a frame.

mod cache;
mod device;
mod slot;

pub use cache::{BlockGuard, BufferCache};
pub use device::{BlockDevice, BlockNo, DeviceError, DeviceId};
pub use slot::BlockData;

/// Bytes per cached block; equals the page size so buffers are mappable.
pub const BLOCK_SIZE: usize = kernel_addresses::PAGE_SIZE as usize;

/// Cache-level failures.
///
/// `Io` is an environment condition the caller may retry. The remaining
/// variants are the fatal tier: the pool is sized so it never runs out, so
/// `PoolExhausted` means claims or pins have leaked, and `NotResident` /
/// `NotPinned` mean page tables reference a buffer the cache is not
/// holding. The context halts rather than continuing on corrupt
/// bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheFault {
    #[error("every cache slot is claimed or pinned")]
    PoolExhausted,
    #[error(transparent)]
    Io(#[from] DeviceError),
    #[error("{block} on {dev} is not resident")]
    NotResident { dev: DeviceId, block: BlockNo },
    #[error("{block} on {dev} is not pinned")]
    NotPinned { dev: DeviceId, block: BlockNo },
}
