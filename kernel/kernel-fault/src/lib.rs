//! # Page-Fault Resolution
//!
//! Turns page faults into memory: the [`FaultResolver`] sits between the
//! frame allocator and the block buffer cache on one side and per-process
//! page tables on the other, and implements two lazy-memory schemes:
//!
//! * **Copy-on-write** — a store to a page marked [`PageFlags::COPY_ON_WRITE`]
//!   gets a private copy of the frame; the original's sharing count drops by
//!   one and only the last holder's drop recycles it.
//! * **Demand-paged file mappings** — [`FaultResolver::create_mapping`]
//!   records a file-backed region without touching memory; the first fault
//!   into it populates the whole region. Shared mappings of block-aligned
//!   file ranges map the cache's own (pinned) buffers; private mappings get
//!   their own zero-filled frames loaded through the file.
//!
//! Unmapping writes dirty shared pages back to the file — through the cache
//! for cache-backed pages, through [`Journal`]-bracketed file writes for
//! frame-backed ones — then returns every page to its pool.
//!
//! The process side is abstract: [`PageTable`], [`BackingFile`] and
//! [`Journal`] are traits the host implements.

mod file;
mod flags;
mod mapping;
mod page_table;
mod resolver;

pub use file::{BackingFile, FileError, Journal};
pub use flags::{PageFlags, Protection};
pub use mapping::{Mapping, ProcessMemory, Share};
pub use page_table::{PageTable, Translation};
pub use resolver::{FaultCause, FaultError, FaultResolver, MapError, Resolution, UnmapError};
