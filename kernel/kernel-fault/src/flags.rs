use bitflags::bitflags;

bitflags! {
    /// Annotations carried by an installed translation.
    ///
    /// `VALID`, `USER`, `WRITABLE` and `DIRTY` mirror what paging hardware
    /// tracks; `COPY_ON_WRITE` and `CACHE_BACKED` live in the
    /// software-available bits and drive fault resolution and teardown:
    /// a write to a `COPY_ON_WRITE` page duplicates the frame, and a
    /// `CACHE_BACKED` page maps a pinned buffer-cache slot rather than an
    /// allocator frame, so teardown unpins instead of freeing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const VALID         = 1 << 0;
        const USER          = 1 << 1;
        const WRITABLE      = 1 << 2;
        /// Set by the page-table implementation when a write goes through.
        const DIRTY         = 1 << 3;
        const COPY_ON_WRITE = 1 << 4;
        const CACHE_BACKED  = 1 << 5;
    }
}

bitflags! {
    /// Access a mapping grants, requested at creation time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}
