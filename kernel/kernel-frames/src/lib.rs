//! # Physical Frame Allocator
//!
//! Hands out 4 KiB frames from a fixed physical region. The design follows
//! the classic per-CPU split:
//!
//! * one free list per CPU, each behind its own spin lock, so steady-state
//!   allocation never crosses CPUs;
//! * when a list runs dry, the allocator *steals* the front half of another
//!   CPU's list (fast/slow midpoint walk, one critical section);
//! * frames carry a sharing count so copy-on-write can hold one frame from
//!   several page tables and only the last `free` recycles it.
//!
//! Freshly allocated frames are filled with `0x05` and freed frames with
//! `0x01`, so use-after-free and uninitialized reads show up as recognizable
//! garbage instead of silently working.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod allocator;
mod free_list;

pub use allocator::{ALLOC_FILL, FREE_FILL, FrameAllocator};

use kernel_addresses::PhysicalAddress;

/// Every list was empty, on every CPU. Recoverable: the caller typically
/// fails the allocation site (e.g. kills the faulting process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of physical frames")]
pub struct OutOfFrames;

/// The caller handed the allocator an address it cannot own.
///
/// This tier is fatal: it means kernel state is already corrupt, and the
/// host is expected to halt the offending context rather than continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameFault {
    #[error("frame address {0} is not page aligned")]
    Unaligned(PhysicalAddress),
    #[error("frame address {0} is outside the managed region")]
    OutOfRange(PhysicalAddress),
    #[error("frame {0} is not currently allocated")]
    NotAllocated(PhysicalAddress),
}
