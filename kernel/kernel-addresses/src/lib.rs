//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses the memory-management core
//! passes around, so virtual and physical values cannot be mixed up at
//! compile time while staying zero-cost `u64` newtypes.
//!
//! The core manages memory exclusively in 4 KiB units ([`PAGE_SIZE`]): frames
//! handed out by the allocator, buffers in the block cache, and the pages a
//! fault resolver installs are all one page long. The helpers here
//! (`page_base`, `page_offset`, `is_page_aligned`, [`page_round_up`]) encode
//! that granularity once instead of scattering mask arithmetic.
//!
//! ```rust
//! # use kernel_addresses::*;
//! let va = VirtualAddress::new(0x0000_2000_0000_1234);
//! assert_eq!(va.page_base().as_u64(), 0x0000_2000_0000_1000);
//! assert_eq!(va.page_offset(), 0x234);
//! assert!(!va.is_page_aligned());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Size of one page / frame / cache block, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2([`PAGE_SIZE`]): number of low bits holding the in-page offset.
pub const PAGE_SHIFT: u32 = 12;

/// Align `value` up to the next page boundary.
#[inline]
#[must_use]
pub const fn page_round_up(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Align `value` down to the containing page boundary.
#[inline]
#[must_use]
pub const fn page_round_down(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

macro_rules! address_type {
    ($(#[$doc:meta])* $name:ident, $tag:literal) => {
        $(#[$doc])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn from_ptr<T>(ptr: *const T) -> Self {
                const _: () = assert!(
                    size_of::<*const ()>() == size_of::<u64>(),
                    "pointer size mismatch"
                );

                // const-time pointer-to-u64 conversion
                union Ptr<T> {
                    ptr: *const T,
                    raw: u64,
                }

                let ptr = Ptr { ptr };
                Self(unsafe { ptr.raw })
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Base of the page containing this address (low bits zeroed).
            #[inline]
            #[must_use]
            pub const fn page_base(self) -> Self {
                Self(page_round_down(self.0))
            }

            /// Offset of this address within its page (`0..PAGE_SIZE`).
            #[inline]
            #[must_use]
            pub const fn page_offset(self) -> u64 {
                self.0 & (PAGE_SIZE - 1)
            }

            #[inline]
            #[must_use]
            pub const fn is_page_aligned(self) -> bool {
                self.page_offset() == 0
            }

            /// Checked add, `None` on overflow.
            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u64) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;
            #[inline]
            fn sub(self, rhs: $name) -> u64 {
                self.0 - rhs.0
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(value: $name) -> u64 {
                value.0
            }
        }
    };
}

address_type!(
    /// Physical memory address.
    ///
    /// Carries the *kind* of address at the type level; it does not validate
    /// that the value refers to real memory. In this hosted core, physical
    /// addresses are host pointers into the region handed to the frame
    /// allocator (or into a cache slot's buffer).
    PhysicalAddress,
    "PA"
);

address_type!(
    /// Virtual memory address, as seen by a faulting process.
    VirtualAddress,
    "VA"
);

impl PhysicalAddress {
    /// View as a raw byte pointer.
    ///
    /// Dereferencing is only sound for addresses inside a region whose owner
    /// (frame allocator or buffer cache) currently grants the caller access.
    #[inline]
    #[must_use]
    pub const fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}
