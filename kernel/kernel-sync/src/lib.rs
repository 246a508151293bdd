//! # Kernel synchronization primitives
//!
//! Two lock classes, matching how the memory core uses them:
//!
//! * [`SpinLock`] — a *short* lock guarding pointer/list manipulation only.
//!   Never held across I/O. The holder must not be preempted and must not
//!   re-enter the same lock from a nested fault path; see the type docs for
//!   the no-reentrancy contract that stands in for interrupt masking.
//! * [`SleepLock`] — a *long* lock that may be held across a blocking disk
//!   operation. A contended caller parks instead of spinning and is woken
//!   when the holder releases. Requires the `std` feature.
//!
//! Both locks carry a `&'static str` name that shows up in diagnostics.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "std")]
mod sleep_lock;
mod spin_lock;

#[cfg(feature = "std")]
pub use sleep_lock::{SleepLock, SleepLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
