use kernel_bcache::{BlockNo, DeviceId};

/// A transfer the backing file could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("backing file i/o failed at offset {offset:#x}")]
pub struct FileError {
    pub offset: u64,
}

/// The file object behind a mapping.
///
/// Implementations synchronize internally (an inode lock or equivalent);
/// the resolver calls these from fault and unmap paths on any CPU without
/// further locking, hence the `Send + Sync` bound. Offsets are byte
/// offsets into the file.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`; a short count
    /// means end of file and the untouched tail of `buf` stays as-is.
    ///
    /// # Errors
    /// [`FileError`] on device trouble; end of file is not an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError>;

    /// Write `buf` starting at `offset`, growing the file if needed.
    ///
    /// # Errors
    /// [`FileError`] on device trouble or a read-only file.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FileError>;

    fn readable(&self) -> bool;
    fn writable(&self) -> bool;

    /// Where the page-sized run at `offset` sits on disk, if file bytes are
    /// stored block-aligned so the block cache can serve the page directly.
    /// `None` means the page must be staged through `read_at` into a frame.
    fn device_block(&self, offset: u64) -> Option<(DeviceId, BlockNo)>;
}

/// Transaction brackets for crash-consistent file writes.
///
/// Every `write_at` the resolver issues during unmap writeback happens
/// between `begin` and `end`, so a crash never leaves a half-written page
/// journaled as complete. One journal serves every CPU, so implementations
/// synchronize internally.
pub trait Journal: Send + Sync {
    fn begin(&self);
    fn end(&self);
}
