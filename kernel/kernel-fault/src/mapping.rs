use std::sync::Arc;

use kernel_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_params::{MAP_REGION_BASE, MAP_REGION_TOP, MAX_MAPPINGS};

use crate::file::BackingFile;
use crate::flags::Protection;
use crate::page_table::PageTable;

/// Whether writes to a mapping are visible through the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Share {
    /// Writes reach the backing file on unmap.
    Shared,
    /// Writes stay in this process's frames; the file is never modified.
    Private,
}

/// One live file mapping in a process's address space.
///
/// `base..base + len` is page-aligned; `offset` is the file offset backing
/// `base`. The mapping holds its own reference to the file, so the file
/// outlives any close happening elsewhere until the mapping is torn down.
pub struct Mapping {
    pub(crate) base: VirtualAddress,
    pub(crate) len: u64,
    pub(crate) prot: Protection,
    pub(crate) share: Share,
    pub(crate) file: Arc<dyn BackingFile>,
    pub(crate) offset: u64,
}

impl Mapping {
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last mapped byte.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.len)
    }

    #[must_use]
    pub const fn protection(&self) -> Protection {
        self.prot
    }

    #[must_use]
    pub const fn share(&self) -> Share {
        self.share
    }

    #[must_use]
    pub const fn file_offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.base <= va && va < self.end()
    }
}

/// Fixed-capacity table of a process's mappings, unordered.
#[derive(Default)]
pub(crate) struct MappingTable {
    pub(crate) entries: Vec<Mapping>,
}

impl MappingTable {
    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= MAX_MAPPINGS
    }

    /// Index of the mapping covering `va`.
    pub(crate) fn covering(&self, va: VirtualAddress) -> Option<usize> {
        self.entries.iter().position(|m| m.contains(va))
    }

    /// Choose a base for a new mapping of `len` bytes: the highest free
    /// page-aligned range below [`MAP_REGION_TOP`], found by walking the
    /// existing mappings in descending base order.
    pub(crate) fn place(&self, len: u64) -> Option<VirtualAddress> {
        debug_assert!(len > 0 && len % PAGE_SIZE == 0);

        let mut order: Vec<&Mapping> = self.entries.iter().collect();
        order.sort_by(|a, b| b.base.cmp(&a.base));

        let mut ceiling = MAP_REGION_TOP;
        for m in order {
            let start = ceiling.checked_sub(len)?;
            if start >= m.end().as_u64() {
                break;
            }
            ceiling = ceiling.min(m.base.as_u64());
        }

        let start = ceiling.checked_sub(len)?;
        (start >= MAP_REGION_BASE).then(|| VirtualAddress::new(start))
    }
}

/// Everything the memory core knows about one process: its page table and
/// its file mappings. Owned by the host's process object; the resolver
/// borrows it mutably for the duration of one operation, which is also the
/// concurrency story — one fault or map call per process at a time. `Send`
/// when the page table is, so a process can migrate between CPUs between
/// operations.
pub struct ProcessMemory<P> {
    pub(crate) table: P,
    pub(crate) mappings: MappingTable,
}

impl<P: PageTable> ProcessMemory<P> {
    pub fn new(table: P) -> Self {
        Self {
            table,
            mappings: MappingTable::default(),
        }
    }

    #[must_use]
    pub const fn page_table(&self) -> &P {
        &self.table
    }

    /// Direct page-table access, for the host's fork/exec paths.
    pub const fn page_table_mut(&mut self) -> &mut P {
        &mut self.table
    }

    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.entries.iter()
    }

    #[must_use]
    pub fn mapping_at(&self, va: VirtualAddress) -> Option<&Mapping> {
        self.mappings.covering(va).map(|i| &self.mappings.entries[i])
    }
}
