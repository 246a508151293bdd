use kernel_addresses::{PhysicalAddress, VirtualAddress};

use crate::flags::PageFlags;

/// One live page translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub pa: PhysicalAddress,
    pub flags: PageFlags,
}

/// The paging structure a process executes under.
///
/// The resolver only needs the three page-granular primitives; walking,
/// TLB shootdown and intermediate-table bookkeeping are the implementor's
/// business. Addresses passed in are always page-aligned.
pub trait PageTable {
    /// Install (or replace) the translation for `va`.
    fn install(&mut self, va: VirtualAddress, pa: PhysicalAddress, flags: PageFlags);

    /// Current translation for `va`, if one is installed.
    fn translate(&self, va: VirtualAddress) -> Option<Translation>;

    /// Drop the translation for `va`, returning what was installed.
    fn remove(&mut self, va: VirtualAddress) -> Option<Translation>;
}
