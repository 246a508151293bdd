use std::sync::Arc;

use kernel_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_bcache::{BlockDevice, BlockNo, BufferCache, CacheFault, DeviceId};
use kernel_frames::{FrameAllocator, FrameFault, OutOfFrames};
use kernel_params::CpuId;

use crate::file::{BackingFile, FileError, Journal};
use crate::flags::{PageFlags, Protection};
use crate::mapping::{Mapping, ProcessMemory, Share};
use crate::page_table::{PageTable, Translation};

/// Why the hardware trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    Load,
    Store,
}

/// What a successfully resolved fault did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The faulting page was duplicated into a private writable frame.
    CowCopied(VirtualAddress),
    /// A demand mapping was populated; `pages` translations were installed.
    Populated { base: VirtualAddress, pages: usize },
}

/// A fault the resolver will not repair. The host kills the faulting
/// process; the variants say why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("no mapping covers {0}")]
    Unmapped(VirtualAddress),
    #[error("access at {0} exceeds the mapping's protection")]
    ProtectionViolation(VirtualAddress),
    #[error("fault at {0} on a resident page")]
    Spurious(VirtualAddress),
    #[error(transparent)]
    OutOfFrames(#[from] OutOfFrames),
    #[error(transparent)]
    Cache(#[from] CacheFault),
    #[error(transparent)]
    File(#[from] FileError),
    /// Fatal tier: frame bookkeeping is corrupt, halt rather than kill.
    #[error(transparent)]
    Frame(#[from] FrameFault),
}

/// Rejected [`create_mapping`](FaultResolver::create_mapping) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("mapping length must be at least one byte")]
    EmptyMapping,
    #[error("file offset {0:#x} is not page aligned")]
    UnalignedOffset(u64),
    #[error("file is not open for reading")]
    NotReadable,
    #[error("shared writable mapping of a read-only file")]
    ReadOnlyFile,
    #[error("process mapping table is full")]
    TableFull,
    #[error("no room left in the mapping region")]
    OutOfAddressSpace,
}

/// Rejected or failed [`remove_mapping`](FaultResolver::remove_mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnmapError {
    #[error("address {0} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("unmap length must be at least one byte")]
    EmptyRange,
    #[error("no mapping covers {0}")]
    NoMapping(VirtualAddress),
    #[error("range escapes the mapping")]
    OutOfRange,
    #[error("interior unmap would split the mapping in two")]
    WouldSplit,
    /// A cache-backed page whose file no longer names a device block;
    /// bookkeeping is corrupt. Fatal tier.
    #[error("page at {0} lost its backing block")]
    BackingMismatch(VirtualAddress),
    #[error(transparent)]
    Cache(#[from] CacheFault),
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Frame(#[from] FrameFault),
}

/// What `populate` put behind one translation, so a failed batch can be
/// unwound and a teardown can route each page to its owner.
enum PageBacking {
    Frame(PhysicalAddress),
    CacheBlock(DeviceId, BlockNo),
}

/// Page-fault resolution and mapping lifecycle over the two memory pools.
///
/// One resolver serves every process and is shared across CPUs; it keeps
/// no mutable state of its own. Per-process state comes in as
/// `&mut ProcessMemory`, and all frame traffic is tagged with the calling
/// CPU so frames come from and return to the right free lists.
pub struct FaultResolver<'a, D> {
    frames: &'a FrameAllocator,
    cache: &'a BufferCache<D>,
    journal: &'a dyn Journal,
}

impl<'a, D: BlockDevice> FaultResolver<'a, D> {
    pub const fn new(
        frames: &'a FrameAllocator,
        cache: &'a BufferCache<D>,
        journal: &'a dyn Journal,
    ) -> Self {
        Self {
            frames,
            cache,
            journal,
        }
    }

    /// Repair the fault at `addr`, or say why the process must die.
    ///
    /// Classification reads the page-table and mapping state rather than
    /// trusting the trap cause: a resident copy-on-write page under a store
    /// is duplicated; a non-resident address inside a mapping populates the
    /// mapping; anything else is the process's own error.
    ///
    /// # Errors
    /// [`FaultError`]; the caller kills the faulting process (except for
    /// the fatal [`FaultError::Frame`] tier, which halts).
    pub fn resolve_fault<P: PageTable>(
        &self,
        cpu: CpuId,
        proc: &mut ProcessMemory<P>,
        addr: VirtualAddress,
        cause: FaultCause,
    ) -> Result<Resolution, FaultError> {
        let page = addr.page_base();

        if let Some(t) = proc.table.translate(page) {
            let cow = PageFlags::VALID | PageFlags::USER | PageFlags::COPY_ON_WRITE;
            if cause == FaultCause::Store && t.flags.contains(cow) {
                return self.copy_on_write(cpu, proc, page, t);
            }
            if cause == FaultCause::Store && !t.flags.contains(PageFlags::WRITABLE) {
                log::warn!("{cpu}: store to read-only page at {addr}");
                return Err(FaultError::ProtectionViolation(addr));
            }
            return Err(FaultError::Spurious(addr));
        }

        let Some(idx) = proc.mappings.covering(addr) else {
            log::warn!("{cpu}: fault outside any mapping at {addr}");
            return Err(FaultError::Unmapped(addr));
        };
        let m = &proc.mappings.entries[idx];
        if cause == FaultCause::Store && !m.prot.contains(Protection::WRITE) {
            log::warn!("{cpu}: store to read-only mapping at {addr}");
            return Err(FaultError::ProtectionViolation(addr));
        }
        self.populate(cpu, proc, idx)
    }

    /// Give the faulting process its own copy of a shared frame.
    fn copy_on_write<P: PageTable>(
        &self,
        cpu: CpuId,
        proc: &mut ProcessMemory<P>,
        page: VirtualAddress,
        t: Translation,
    ) -> Result<Resolution, FaultError> {
        let copy = self.frames.alloc(cpu)?;
        // Safety: `copy` is ours alone, `t.pa` stays readable while the
        // share we are about to drop is still counted.
        unsafe {
            copy.as_mut_ptr()
                .copy_from_nonoverlapping(t.pa.as_mut_ptr(), PAGE_SIZE as usize);
        }

        let flags = (t.flags - PageFlags::COPY_ON_WRITE) | PageFlags::WRITABLE;
        proc.table.install(page, copy, flags);
        // Drop this process's share of the original; the last sharer's drop
        // recycles it.
        self.frames.free(cpu, t.pa)?;

        log::trace!("{cpu}: cow copy {page} ({} -> {copy})", t.pa);
        Ok(Resolution::CowCopied(page))
    }

    /// Install translations for every non-resident page of one mapping.
    ///
    /// The whole mapping is populated in one batch, so a sequential scan of
    /// the file faults once instead of once per page. Shared mappings whose
    /// file bytes sit block-aligned on disk borrow the cache's buffer
    /// directly (pinned); everything else is staged into a zeroed frame,
    /// where a short read near end of file leaves the zero tail intact.
    ///
    /// On any failure the batch is rolled back page by page before the
    /// error is returned, so a killed process leaks nothing.
    fn populate<P: PageTable>(
        &self,
        cpu: CpuId,
        proc: &mut ProcessMemory<P>,
        idx: usize,
    ) -> Result<Resolution, FaultError> {
        let m = &proc.mappings.entries[idx];
        let (base, pages, prot, share, offset) =
            (m.base, m.len / PAGE_SIZE, m.prot, m.share, m.offset);
        let file = Arc::clone(&m.file);

        let mut flags = PageFlags::VALID | PageFlags::USER;
        if prot.contains(Protection::WRITE) {
            flags |= PageFlags::WRITABLE;
        }

        let mut installed: Vec<(VirtualAddress, PageBacking)> = Vec::new();
        for i in 0..pages {
            let va = base + i * PAGE_SIZE;
            if proc.table.translate(va).is_some() {
                continue;
            }
            let foff = offset + i * PAGE_SIZE;

            let step = self.populate_page(cpu, proc, &*file, va, foff, share, flags);
            match step {
                Ok(backing) => installed.push((va, backing)),
                Err(e) => {
                    log::warn!("{cpu}: demand population of {base} failed at {va}: {e}");
                    self.rollback(cpu, proc, installed);
                    return Err(e);
                }
            }
        }

        log::trace!("{cpu}: populated {} pages at {base}", installed.len());
        Ok(Resolution::Populated {
            base,
            pages: installed.len(),
        })
    }

    fn populate_page<P: PageTable>(
        &self,
        cpu: CpuId,
        proc: &mut ProcessMemory<P>,
        file: &dyn BackingFile,
        va: VirtualAddress,
        foff: u64,
        share: Share,
        flags: PageFlags,
    ) -> Result<PageBacking, FaultError> {
        // Only shared mappings may alias the cache's buffer: a private
        // writable page must not scribble on bytes every other user of the
        // block sees.
        if share == Share::Shared {
            if let Some((dev, block)) = file.device_block(foff) {
                let guard = self.cache.read(dev, block)?;
                let pa = self.cache.pin(&guard);
                self.cache.release(guard);
                proc.table.install(va, pa, flags | PageFlags::CACHE_BACKED);
                return Ok(PageBacking::CacheBlock(dev, block));
            }
        }

        let pa = self.frames.alloc(cpu)?;
        // Safety: freshly allocated frame, exclusively ours.
        let buf = unsafe {
            pa.as_mut_ptr().write_bytes(0, PAGE_SIZE as usize);
            std::slice::from_raw_parts_mut(pa.as_mut_ptr(), PAGE_SIZE as usize)
        };
        if let Err(e) = file.read_at(foff, buf) {
            let _ = self.frames.free(cpu, pa);
            return Err(e.into());
        }
        proc.table.install(va, pa, flags);
        Ok(PageBacking::Frame(pa))
    }

    /// Undo a partially populated batch.
    fn rollback<P: PageTable>(
        &self,
        cpu: CpuId,
        proc: &mut ProcessMemory<P>,
        installed: Vec<(VirtualAddress, PageBacking)>,
    ) {
        for (va, backing) in installed {
            proc.table.remove(va);
            let undo = match backing {
                PageBacking::Frame(pa) => self.frames.free(cpu, pa).map_err(FaultError::from),
                PageBacking::CacheBlock(dev, block) => {
                    self.cache.unpin(dev, block).map_err(FaultError::from)
                }
            };
            if let Err(e) = undo {
                // Nothing sensible left to do mid-unwind; make it loud.
                log::error!("{cpu}: rollback of {va} failed: {e}");
            }
        }
    }

    /// Create a demand mapping of `len` bytes of `file` starting at
    /// `offset`, placed below the top of the mapping region. No page is
    /// populated here; the first touch faults them in.
    ///
    /// # Errors
    /// [`MapError`] when the request is malformed, exceeds the file's open
    /// mode, or no table slot / address range is left.
    pub fn create_mapping<P: PageTable>(
        &self,
        proc: &mut ProcessMemory<P>,
        len: u64,
        prot: Protection,
        share: Share,
        file: Arc<dyn BackingFile>,
        offset: u64,
    ) -> Result<VirtualAddress, MapError> {
        if len == 0 {
            return Err(MapError::EmptyMapping);
        }
        if offset % PAGE_SIZE != 0 {
            return Err(MapError::UnalignedOffset(offset));
        }
        if !file.readable() {
            return Err(MapError::NotReadable);
        }
        if share == Share::Shared && prot.contains(Protection::WRITE) && !file.writable() {
            return Err(MapError::ReadOnlyFile);
        }
        if proc.mappings.is_full() {
            return Err(MapError::TableFull);
        }

        let len = kernel_addresses::page_round_up(len);
        let base = proc
            .mappings
            .place(len)
            .ok_or(MapError::OutOfAddressSpace)?;

        proc.mappings.entries.push(Mapping {
            base,
            len,
            prot,
            share,
            file,
            offset,
        });
        log::trace!("mapped {len:#x} bytes at {base}");
        Ok(base)
    }

    /// Unmap `len` bytes at `addr`: write dirty shared pages back to the
    /// file, return every covered page to its pool, and shrink or retire
    /// the mapping. The range must start or end flush with the mapping;
    /// punching a hole in the middle is refused.
    ///
    /// # Errors
    /// [`UnmapError`]; writeback and teardown errors leave the mapping
    /// partially removed, which is acceptable because the caller's next
    /// step on error is tearing down the process.
    pub fn remove_mapping<P: PageTable>(
        &self,
        cpu: CpuId,
        proc: &mut ProcessMemory<P>,
        addr: VirtualAddress,
        len: u64,
    ) -> Result<(), UnmapError> {
        if !addr.is_page_aligned() {
            return Err(UnmapError::Unaligned(addr));
        }
        if len == 0 {
            return Err(UnmapError::EmptyRange);
        }
        let Some(idx) = proc.mappings.covering(addr) else {
            return Err(UnmapError::NoMapping(addr));
        };
        let len = kernel_addresses::page_round_up(len);

        let m = &proc.mappings.entries[idx];
        let (m_base, m_len, m_end) = (m.base, m.len, m.end());
        let end = match addr.checked_add(len) {
            Some(end) if end <= m_end => end,
            _ => return Err(UnmapError::OutOfRange),
        };
        if addr != m_base && end != m_end {
            return Err(UnmapError::WouldSplit);
        }

        let share = m.share;
        let m_offset = m.offset;
        let file = Arc::clone(&m.file);

        let mut va = addr;
        while va < end {
            if let Some(t) = proc.table.translate(va) {
                let foff = m_offset + (va - m_base);
                if share == Share::Shared && t.flags.contains(PageFlags::DIRTY) {
                    self.write_back(&*file, va, foff, t)?;
                }
                proc.table.remove(va);
                if t.flags.contains(PageFlags::CACHE_BACKED) {
                    let (dev, block) = file
                        .device_block(foff)
                        .ok_or(UnmapError::BackingMismatch(va))?;
                    self.cache.unpin(dev, block)?;
                } else {
                    self.frames.free(cpu, t.pa)?;
                }
            }
            va += PAGE_SIZE;
        }

        // Shrink from whichever edge the range touched; drop the mapping
        // (and with it the file reference) when nothing is left.
        if len == m_len {
            proc.mappings.entries.swap_remove(idx);
            log::trace!("{cpu}: unmapped all of {m_base}");
        } else if addr == m_base {
            let m = &mut proc.mappings.entries[idx];
            m.base = end;
            m.offset += len;
            m.len -= len;
        } else {
            proc.mappings.entries[idx].len -= len;
        }
        Ok(())
    }

    /// Flush one dirty shared page to its file.
    fn write_back(
        &self,
        file: &dyn BackingFile,
        va: VirtualAddress,
        foff: u64,
        t: Translation,
    ) -> Result<(), UnmapError> {
        if t.flags.contains(PageFlags::CACHE_BACKED) {
            // The installed page *is* the cache buffer, so claiming the
            // block sees the process's writes; push them to the device.
            let (dev, block) = file.device_block(foff).ok_or(UnmapError::BackingMismatch(va))?;
            let guard = self.cache.read(dev, block)?;
            self.cache.write(&guard)?;
            self.cache.release(guard);
        } else {
            // Safety: the translation is live, so the frame is readable
            // until we remove it below.
            let bytes =
                unsafe { std::slice::from_raw_parts(t.pa.as_mut_ptr(), PAGE_SIZE as usize) };
            self.journal.begin();
            let written = file.write_at(foff, bytes);
            self.journal.end();
            written?;
        }
        Ok(())
    }
}
