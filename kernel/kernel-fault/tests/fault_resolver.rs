use std::alloc::{Layout, alloc, dealloc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use kernel_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_bcache::{BLOCK_SIZE, BlockData, BlockDevice, BlockNo, BufferCache, DeviceError, DeviceId};
use kernel_fault::{
    BackingFile, FaultCause, FaultError, FaultResolver, FileError, Journal, MapError, PageFlags,
    PageTable, ProcessMemory, Protection, Resolution, Share, Translation, UnmapError,
};
use kernel_frames::FrameAllocator;
use kernel_params::{CpuId, MAX_MAPPINGS};

const CPU: CpuId = CpuId::new(0);
const DEV: DeviceId = DeviceId(1);

// ---------------------------------------------------------------------------
// Test doubles

struct Arena {
    ptr: *mut u8,
    layout: Layout,
}

impl Arena {
    fn new(frames: usize) -> Self {
        let layout =
            Layout::from_size_align(frames * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    fn allocator(&self) -> FrameAllocator {
        let start = PhysicalAddress::from_ptr(self.ptr);
        let end = start + self.layout.size() as u64;
        let fa = unsafe { FrameAllocator::new(start, end) };
        unsafe { fa.free_range(CPU, start, end) };
        fa
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Block store shared between a `DiskFile` and the buffer cache. Unwritten
/// blocks read as a stamp of their block number.
struct MemDisk {
    blocks: Mutex<HashMap<BlockNo, Box<[u8; BLOCK_SIZE]>>>,
}

impl MemDisk {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(HashMap::new()),
        })
    }

    fn stamp(block: BlockNo) -> u8 {
        (block.0 % 251) as u8
    }

    fn stored(&self, block: BlockNo) -> Option<Box<[u8; BLOCK_SIZE]>> {
        self.blocks.lock().unwrap().get(&block).cloned()
    }
}

/// Newtype so the foreign `BlockDevice` trait can be implemented for a
/// shared handle without tripping the orphan rule on `Arc`.
struct SharedDisk(Arc<MemDisk>);

impl BlockDevice for SharedDisk {
    fn read(&self, _dev: DeviceId, block: BlockNo, data: &mut BlockData) -> Result<(), DeviceError> {
        match self.0.blocks.lock().unwrap().get(&block) {
            Some(bytes) => data.copy_from_slice(&bytes[..]),
            None => data.fill(MemDisk::stamp(block)),
        }
        Ok(())
    }

    fn write(&self, _dev: DeviceId, block: BlockNo, data: &BlockData) -> Result<(), DeviceError> {
        self.0.blocks.lock().unwrap().insert(block, Box::new(**data));
        Ok(())
    }
}

/// File held entirely in memory; `device_block` is always `None`, so every
/// page of a mapping over it is staged through a frame.
struct RamFile {
    data: Mutex<Vec<u8>>,
    readable: bool,
    writable: bool,
}

impl RamFile {
    fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new((0..len).map(|i| (i % 251) as u8).collect()),
            readable: true,
            writable: true,
        })
    }

    fn read_only(len: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new((0..len).map(|i| (i % 251) as u8).collect()),
            readable: true,
            writable: false,
        })
    }

    fn byte(&self, offset: usize) -> u8 {
        self.data.lock().unwrap()[offset]
    }
}

impl BackingFile for RamFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FileError> {
        if !self.writable {
            return Err(FileError { offset });
        }
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn readable(&self) -> bool {
        self.readable
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn device_block(&self, _offset: u64) -> Option<(DeviceId, BlockNo)> {
        None
    }
}

/// File whose bytes sit block-aligned on the shared `MemDisk`, so shared
/// mappings of it can borrow cache buffers directly.
struct DiskFile {
    disk: Arc<MemDisk>,
    first_block: u32,
    blocks: u32,
}

impl BackingFile for DiskFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError> {
        // Only exercised for private mappings; serve whole blocks.
        let block = BlockNo(self.first_block + (offset / PAGE_SIZE) as u32);
        let n = buf.len().min(BLOCK_SIZE);
        match self.disk.stored(block) {
            Some(bytes) => buf[..n].copy_from_slice(&bytes[..n]),
            None => buf[..n].fill(MemDisk::stamp(block)),
        }
        Ok(n)
    }

    fn write_at(&self, offset: u64, _buf: &[u8]) -> Result<usize, FileError> {
        // Shared mappings write back through the cache, never through here.
        Err(FileError { offset })
    }

    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        true
    }

    fn device_block(&self, offset: u64) -> Option<(DeviceId, BlockNo)> {
        let index = (offset / PAGE_SIZE) as u32;
        (index < self.blocks).then(|| (DEV, BlockNo(self.first_block + index)))
    }
}

/// File that fails its read after a number of pages, to exercise batch
/// rollback.
struct FlakyFile {
    ok_pages: u64,
}

impl BackingFile for FlakyFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError> {
        if offset / PAGE_SIZE >= self.ok_pages {
            return Err(FileError { offset });
        }
        buf.fill(0x42);
        Ok(buf.len())
    }

    fn write_at(&self, offset: u64, _buf: &[u8]) -> Result<usize, FileError> {
        Err(FileError { offset })
    }

    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        false
    }

    fn device_block(&self, _offset: u64) -> Option<(DeviceId, BlockNo)> {
        None
    }
}

#[derive(Default)]
struct CountingJournal {
    begins: AtomicUsize,
    ends: AtomicUsize,
}

impl Journal for CountingJournal {
    fn begin(&self) {
        self.begins.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakePageTable {
    entries: HashMap<u64, Translation>,
}

impl PageTable for FakePageTable {
    fn install(&mut self, va: VirtualAddress, pa: PhysicalAddress, flags: PageFlags) {
        self.entries.insert(va.as_u64(), Translation { pa, flags });
    }

    fn translate(&self, va: VirtualAddress) -> Option<Translation> {
        self.entries.get(&va.as_u64()).copied()
    }

    fn remove(&mut self, va: VirtualAddress) -> Option<Translation> {
        self.entries.remove(&va.as_u64())
    }
}

fn process() -> ProcessMemory<FakePageTable> {
    ProcessMemory::new(FakePageTable::default())
}

/// Simulate the hardware's dirty tracking after a store through `va`.
fn store_byte(proc: &mut ProcessMemory<FakePageTable>, va: VirtualAddress, value: u8) {
    let t = proc.page_table().translate(va.page_base()).expect("page not resident");
    assert!(t.flags.contains(PageFlags::WRITABLE), "store through a read-only page");
    unsafe { *t.pa.as_mut_ptr().add(va.page_offset() as usize) = value };
    proc.page_table_mut()
        .install(va.page_base(), t.pa, t.flags | PageFlags::DIRTY);
}

fn load_byte(proc: &ProcessMemory<FakePageTable>, va: VirtualAddress) -> u8 {
    let t = proc.page_table().translate(va.page_base()).expect("page not resident");
    unsafe { *t.pa.as_mut_ptr().add(va.page_offset() as usize) }
}

// ---------------------------------------------------------------------------
// Copy-on-write

#[test]
fn cow_store_gives_each_process_its_own_page() {
    let arena = Arena::new(8);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    // One frame shared copy-on-write between two processes, the way a fork
    // would leave it.
    let va = VirtualAddress::new(0x4000_0000);
    let cow = PageFlags::VALID | PageFlags::USER | PageFlags::COPY_ON_WRITE;
    let original = fa.alloc(CPU).unwrap();
    unsafe { *original.as_mut_ptr() = 0xA1 };

    let mut p1 = process();
    let mut p2 = process();
    p1.page_table_mut().install(va, original, cow);
    fa.share(original).unwrap();
    p2.page_table_mut().install(va, original, cow);

    // p1 writes: it gets a private copy carrying the old bytes.
    let r = resolver.resolve_fault(CPU, &mut p1, va, FaultCause::Store).unwrap();
    assert_eq!(r, Resolution::CowCopied(va));

    let t1 = p1.page_table().translate(va).unwrap();
    assert_ne!(t1.pa, original);
    assert!(t1.flags.contains(PageFlags::WRITABLE));
    assert!(!t1.flags.contains(PageFlags::COPY_ON_WRITE));
    assert_eq!(load_byte(&p1, va), 0xA1);
    assert_eq!(fa.share_count(original), Ok(1));

    // The copy is private: p1's store is invisible to p2.
    store_byte(&mut p1, va, 0xB2);
    assert_eq!(load_byte(&p2, va), 0xA1);

    // p2's turn; the original frame goes back to the pool afterwards.
    resolver.resolve_fault(CPU, &mut p2, va, FaultCause::Store).unwrap();
    assert_eq!(fa.share_count(original), Ok(0));
    store_byte(&mut p2, va, 0xC3);
    assert_eq!(load_byte(&p1, va), 0xB2);

    // Conservation: two live frames out of eight.
    assert_eq!(fa.free_bytes(), 6 * PAGE_SIZE);
}

#[test]
fn concurrent_cow_stores_stay_private_per_sharer() {
    const SHARERS: usize = 4;
    const PAGES: u64 = 16;
    let total_frames = (SHARERS as u64 + 1) * PAGES;

    let arena = Arena::new(total_frames as usize);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    // A run of frames shared copy-on-write by every process, the way a
    // fork chain would leave them. Byte 1 of each frame carries the page
    // index so copies can be told apart from stale aliases.
    let base = VirtualAddress::new(0x4000_0000);
    let cow = PageFlags::VALID | PageFlags::USER | PageFlags::COPY_ON_WRITE;
    let mut originals = Vec::new();
    for i in 0..PAGES {
        let pa = fa.alloc(CPU).unwrap();
        unsafe { pa.as_mut_ptr().write_bytes(i as u8, PAGE_SIZE as usize) };
        for _ in 1..SHARERS {
            fa.share(pa).unwrap();
        }
        originals.push(pa);
    }
    let mut procs: Vec<ProcessMemory<FakePageTable>> = (0..SHARERS).map(|_| process()).collect();
    for p in &mut procs {
        for (i, &pa) in originals.iter().enumerate() {
            p.page_table_mut().install(base + i as u64 * PAGE_SIZE, pa, cow);
        }
    }

    // One resolver, every sharer storing through every page at once, each
    // from its own CPU.
    let ready = Barrier::new(SHARERS);
    let procs = thread::scope(|s| {
        let handles: Vec<_> = procs
            .into_iter()
            .enumerate()
            .map(|(who, mut p)| {
                let (resolver, ready) = (&resolver, &ready);
                s.spawn(move || {
                    let cpu = CpuId::new(who);
                    let tag = 0xB0 + who as u8;
                    ready.wait();
                    for i in 0..PAGES {
                        let va = base + i * PAGE_SIZE;
                        let r = resolver.resolve_fault(cpu, &mut p, va, FaultCause::Store).unwrap();
                        assert_eq!(r, Resolution::CowCopied(va));
                        store_byte(&mut p, va, tag);
                    }
                    p
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    // Every sharer sees its own stores and the original fill, nothing of
    // anyone else's.
    for (who, p) in procs.iter().enumerate() {
        let tag = 0xB0 + who as u8;
        for i in 0..PAGES {
            let va = base + i * PAGE_SIZE;
            assert_eq!(load_byte(p, va), tag);
            assert_eq!(load_byte(p, va + 1), i as u8);
        }
    }

    // Each original was dropped by its last sharer exactly once, and only
    // the private copies remain live.
    for &pa in &originals {
        assert_eq!(fa.share_count(pa), Ok(0));
    }
    assert_eq!(
        fa.free_bytes(),
        (total_frames - (SHARERS as u64) * PAGES) * PAGE_SIZE
    );
}

#[test]
fn faults_on_resident_pages_without_cow_are_refused() {
    let arena = Arena::new(4);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    let va = VirtualAddress::new(0x4000_0000);
    let pa = fa.alloc(CPU).unwrap();
    let mut p = process();
    p.page_table_mut()
        .install(va, pa, PageFlags::VALID | PageFlags::USER);

    // Store to a resident read-only page: protection violation, not COW.
    assert_eq!(
        resolver.resolve_fault(CPU, &mut p, va, FaultCause::Store),
        Err(FaultError::ProtectionViolation(va))
    );
    // Load fault on a resident readable page makes no sense.
    assert_eq!(
        resolver.resolve_fault(CPU, &mut p, va, FaultCause::Load),
        Err(FaultError::Spurious(va))
    );
    // And a fault with no translation and no mapping is simply unmapped.
    let wild = VirtualAddress::new(0x7777_0000);
    assert_eq!(
        resolver.resolve_fault(CPU, &mut p, wild, FaultCause::Load),
        Err(FaultError::Unmapped(wild))
    );
}

// ---------------------------------------------------------------------------
// Demand-paged mappings

#[test]
fn first_touch_populates_the_whole_mapping() {
    let arena = Arena::new(8);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    // 2 pages + 100 bytes of file content under a 3-page mapping.
    let file = RamFile::new(2 * PAGE_SIZE as usize + 100);
    let mut p = process();
    let len = 2 * PAGE_SIZE + 100;
    let base = resolver
        .create_mapping(&mut p, len, Protection::READ, Share::Private, file.clone(), 0)
        .unwrap();

    // Fault in the middle page; the whole mapping becomes resident.
    let r = resolver
        .resolve_fault(CPU, &mut p, base + PAGE_SIZE + 7, FaultCause::Load)
        .unwrap();
    assert_eq!(r, Resolution::Populated { base, pages: 3 });
    assert_eq!(fa.free_bytes(), 5 * PAGE_SIZE);

    // Bytes match the file...
    assert_eq!(load_byte(&p, base), file.byte(0));
    let off = PAGE_SIZE + 123;
    assert_eq!(load_byte(&p, base + off), file.byte(off as usize));
    // ...and the tail past end of file reads as zeros.
    assert_eq!(load_byte(&p, base + 2 * PAGE_SIZE + 99), file.byte(2 * PAGE_SIZE as usize + 99));
    assert_eq!(load_byte(&p, base + 2 * PAGE_SIZE + 100), 0);
    assert_eq!(load_byte(&p, base + (3 * PAGE_SIZE - 1)), 0);

    // Read-only mapping: pages came in non-writable.
    let t = p.page_table().translate(base).unwrap();
    assert!(!t.flags.contains(PageFlags::WRITABLE));

    // A second fault in the same mapping has nothing left to do.
    let r = resolver
        .resolve_fault(CPU, &mut p, base, FaultCause::Load)
        .unwrap_err();
    assert_eq!(r, FaultError::Spurious(base));
}

#[test]
fn store_fault_on_read_only_mapping_is_refused() {
    let arena = Arena::new(4);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    let file = RamFile::new(PAGE_SIZE as usize);
    let mut p = process();
    let base = resolver
        .create_mapping(&mut p, PAGE_SIZE, Protection::READ, Share::Private, file, 0)
        .unwrap();

    assert_eq!(
        resolver.resolve_fault(CPU, &mut p, base, FaultCause::Store),
        Err(FaultError::ProtectionViolation(base))
    );
    // Nothing was installed.
    assert!(p.page_table().translate(base).is_none());
    assert_eq!(fa.free_bytes(), 4 * PAGE_SIZE);
}

#[test]
fn failed_population_rolls_the_batch_back() {
    let arena = Arena::new(8);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    // Reads succeed for two pages, then fail.
    let file = Arc::new(FlakyFile { ok_pages: 2 });
    let mut p = process();
    let base = resolver
        .create_mapping(&mut p, 4 * PAGE_SIZE, Protection::READ, Share::Private, file, 0)
        .unwrap();

    assert!(matches!(
        resolver.resolve_fault(CPU, &mut p, base, FaultCause::Load),
        Err(FaultError::File(_))
    ));

    // The two pages installed before the failure are gone again.
    for i in 0..4 {
        assert!(p.page_table().translate(base + i * PAGE_SIZE).is_none());
    }
    assert_eq!(fa.free_bytes(), 8 * PAGE_SIZE);

    // The mapping itself survives; a repaired file would fault in fine.
    assert!(p.mapping_at(base).is_some());
}

#[test]
fn out_of_frames_mid_batch_rolls_back_and_reports() {
    let arena = Arena::new(2);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    let file = RamFile::new(4 * PAGE_SIZE as usize);
    let mut p = process();
    let base = resolver
        .create_mapping(&mut p, 4 * PAGE_SIZE, Protection::READ, Share::Private, file, 0)
        .unwrap();

    assert!(matches!(
        resolver.resolve_fault(CPU, &mut p, base, FaultCause::Load),
        Err(FaultError::OutOfFrames(_))
    ));
    assert_eq!(fa.free_bytes(), 2 * PAGE_SIZE);
}

// ---------------------------------------------------------------------------
// Writeback and teardown

#[test]
fn shared_dirty_pages_reach_the_file_private_ones_do_not() {
    let arena = Arena::new(16);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    let shared_file = RamFile::new(2 * PAGE_SIZE as usize);
    let private_file = RamFile::new(2 * PAGE_SIZE as usize);
    let mut p = process();
    let prot = Protection::READ | Protection::WRITE;

    let s_base = resolver
        .create_mapping(&mut p, 2 * PAGE_SIZE, prot, Share::Shared, shared_file.clone(), 0)
        .unwrap();
    let p_base = resolver
        .create_mapping(&mut p, 2 * PAGE_SIZE, prot, Share::Private, private_file.clone(), 0)
        .unwrap();

    resolver.resolve_fault(CPU, &mut p, s_base, FaultCause::Store).unwrap();
    resolver.resolve_fault(CPU, &mut p, p_base, FaultCause::Store).unwrap();

    // Dirty one page of each; leave each second page clean.
    store_byte(&mut p, s_base + 5, 0xD7);
    store_byte(&mut p, p_base + 5, 0xD8);

    resolver.remove_mapping(CPU, &mut p, s_base, 2 * PAGE_SIZE).unwrap();
    resolver.remove_mapping(CPU, &mut p, p_base, 2 * PAGE_SIZE).unwrap();

    // Shared write made it to the file; the clean page did not get written.
    assert_eq!(shared_file.byte(5), 0xD7);
    assert_eq!(journal.begins.load(Ordering::SeqCst), 1);
    assert_eq!(journal.ends.load(Ordering::SeqCst), 1);

    // Private write vanished with the process.
    assert_eq!(private_file.byte(5), (5 % 251) as u8);

    // Every frame is back.
    assert_eq!(fa.free_bytes(), 16 * PAGE_SIZE);
    assert!(p.mappings().next().is_none());
}

#[test]
fn shared_block_aligned_mapping_borrows_cache_buffers() {
    let arena = Arena::new(4);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    let file = Arc::new(DiskFile {
        disk: Arc::clone(&disk),
        first_block: 40,
        blocks: 2,
    });
    let mut p = process();
    let base = resolver
        .create_mapping(
            &mut p,
            2 * PAGE_SIZE,
            Protection::READ | Protection::WRITE,
            Share::Shared,
            file,
            0,
        )
        .unwrap();

    resolver.resolve_fault(CPU, &mut p, base, FaultCause::Store).unwrap();

    // No frames were consumed: the pages are pinned cache buffers.
    assert_eq!(fa.free_bytes(), 4 * PAGE_SIZE);
    let t = p.page_table().translate(base).unwrap();
    assert!(t.flags.contains(PageFlags::CACHE_BACKED));
    assert_eq!(load_byte(&p, base), MemDisk::stamp(BlockNo(40)));
    assert_eq!(load_byte(&p, base + PAGE_SIZE), MemDisk::stamp(BlockNo(41)));

    // Store through the mapping, then unmap: the block hits the device.
    store_byte(&mut p, base + 9, 0xE4);
    resolver.remove_mapping(CPU, &mut p, base, 2 * PAGE_SIZE).unwrap();

    let stored = disk.stored(BlockNo(40)).expect("dirty block not written back");
    assert_eq!(stored[9], 0xE4);
    // The clean second block was never written.
    assert!(disk.stored(BlockNo(41)).is_none());

    // Frame-backed writeback machinery stayed idle.
    assert_eq!(journal.begins.load(Ordering::SeqCst), 0);

    // The pins are gone: both slots can be repurposed again.
    assert!(matches!(
        cache.unpin(DEV, BlockNo(40)),
        Err(kernel_bcache::CacheFault::NotPinned { .. })
    ));
}

#[test]
fn unmap_trims_prefix_and_suffix_but_never_splits() {
    let arena = Arena::new(8);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    let file = RamFile::new(4 * PAGE_SIZE as usize);
    let mut p = process();
    let base = resolver
        .create_mapping(
            &mut p,
            4 * PAGE_SIZE,
            Protection::READ,
            Share::Private,
            file.clone(),
            0,
        )
        .unwrap();
    resolver.resolve_fault(CPU, &mut p, base, FaultCause::Load).unwrap();
    assert_eq!(fa.free_bytes(), 4 * PAGE_SIZE);

    // Interior unmap is refused outright.
    assert_eq!(
        resolver.remove_mapping(CPU, &mut p, base + PAGE_SIZE, PAGE_SIZE),
        Err(UnmapError::WouldSplit)
    );

    // Trim one page off the front: base and file offset both advance.
    resolver.remove_mapping(CPU, &mut p, base, PAGE_SIZE).unwrap();
    assert!(p.mapping_at(base).is_none());
    let m = p.mapping_at(base + PAGE_SIZE).unwrap();
    assert_eq!(m.base(), base + PAGE_SIZE);
    assert_eq!(m.len(), 3 * PAGE_SIZE);
    assert_eq!(m.file_offset(), PAGE_SIZE);
    assert_eq!(fa.free_bytes(), 5 * PAGE_SIZE);
    // Surviving pages still read the right file bytes.
    assert_eq!(load_byte(&p, base + PAGE_SIZE), file.byte(PAGE_SIZE as usize));

    // Trim one page off the back.
    resolver
        .remove_mapping(CPU, &mut p, base + 3 * PAGE_SIZE, PAGE_SIZE)
        .unwrap();
    let m = p.mapping_at(base + PAGE_SIZE).unwrap();
    assert_eq!(m.len(), 2 * PAGE_SIZE);
    assert_eq!(m.file_offset(), PAGE_SIZE);

    // Remove the rest: the mapping's file reference is dropped.
    assert_eq!(Arc::strong_count(&file), 2);
    resolver
        .remove_mapping(CPU, &mut p, base + PAGE_SIZE, 2 * PAGE_SIZE)
        .unwrap();
    assert_eq!(Arc::strong_count(&file), 1);
    assert!(p.mappings().next().is_none());
    assert_eq!(fa.free_bytes(), 8 * PAGE_SIZE);
}

#[test]
fn unmap_validates_its_range() {
    let arena = Arena::new(4);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    let file = RamFile::new(PAGE_SIZE as usize);
    let mut p = process();
    let base = resolver
        .create_mapping(&mut p, 2 * PAGE_SIZE, Protection::READ, Share::Private, file, 0)
        .unwrap();

    assert_eq!(
        resolver.remove_mapping(CPU, &mut p, base + 1, PAGE_SIZE),
        Err(UnmapError::Unaligned(base + 1))
    );
    let outside = VirtualAddress::new(0x100);
    assert_eq!(
        resolver.remove_mapping(CPU, &mut p, outside, PAGE_SIZE),
        Err(UnmapError::NoMapping(outside))
    );
    assert_eq!(
        resolver.remove_mapping(CPU, &mut p, base, 3 * PAGE_SIZE),
        Err(UnmapError::OutOfRange)
    );
    // A zero-length request is refused, not silently rounded or no-opped.
    assert_eq!(
        resolver.remove_mapping(CPU, &mut p, base, 0),
        Err(UnmapError::EmptyRange)
    );
    assert_eq!(
        resolver.remove_mapping(CPU, &mut p, base + PAGE_SIZE, 0),
        Err(UnmapError::EmptyRange)
    );
}

#[test]
fn create_mapping_validates_the_request() {
    let arena = Arena::new(4);
    let fa = arena.allocator();
    let disk = MemDisk::new();
    let cache = BufferCache::new(SharedDisk(Arc::clone(&disk)));
    let journal = CountingJournal::default();
    let resolver = FaultResolver::new(&fa, &cache, &journal);

    let mut p = process();
    let rw = Protection::READ | Protection::WRITE;

    let file = RamFile::new(PAGE_SIZE as usize);
    assert_eq!(
        resolver
            .create_mapping(&mut p, 0, Protection::READ, Share::Private, file.clone(), 0)
            .unwrap_err(),
        MapError::EmptyMapping
    );
    assert_eq!(
        resolver
            .create_mapping(&mut p, PAGE_SIZE, Protection::READ, Share::Private, file.clone(), 13)
            .unwrap_err(),
        MapError::UnalignedOffset(13)
    );

    let ro = RamFile::read_only(PAGE_SIZE as usize);
    assert_eq!(
        resolver
            .create_mapping(&mut p, PAGE_SIZE, rw, Share::Shared, ro.clone(), 0)
            .unwrap_err(),
        MapError::ReadOnlyFile
    );
    // Writing a *private* mapping of a read-only file is fine: the frames
    // are the process's own and never written back.
    resolver
        .create_mapping(&mut p, PAGE_SIZE, rw, Share::Private, ro, 0)
        .unwrap();

    // Fill the table to its fixed capacity.
    for _ in 1..MAX_MAPPINGS {
        resolver
            .create_mapping(&mut p, PAGE_SIZE, Protection::READ, Share::Private, file.clone(), 0)
            .unwrap();
    }
    assert_eq!(
        resolver
            .create_mapping(&mut p, PAGE_SIZE, Protection::READ, Share::Private, file.clone(), 0)
            .unwrap_err(),
        MapError::TableFull
    );
}
