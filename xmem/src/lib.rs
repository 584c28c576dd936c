//! `xmem`: an external-memory (out-of-core) computation library.
//!
//! A small stack of cooperating primitives lets callers process datasets
//! much larger than RAM through a bounded working set:
//!
//! - [`memory`] -- a shared accounting handle that every other component
//!   reserves bytes against, so the caller's memory budget is never
//!   silently exceeded.
//! - [`page_cache`] -- a block-granularity LRU cache sitting in front of any
//!   `ReadAt + WriteAt` backend.
//! - [`stream`] -- a typed, append/random-access sequence of fixed-size
//!   items backed by a single file, the unit every other component reads
//!   and writes.
//! - [`scan`] -- drives a user-supplied object across N input streams and M
//!   output streams in lockstep.
//! - [`merge`] -- a k-way loser-tree merge of already-sorted streams.
//! - [`sort`] -- an external merge sort built from the above: run
//!   formation, intermediate merge passes, and a final merge, with run
//!   length and fanout chosen by [`sort::planner::plan_sort`] from the
//!   caller's memory budget.
//!
//! The stream container format (header layout, magic, versioning) and the
//! block cache's page eviction policy follow the same discipline a
//! page/block-based binary container format always needs: a validated fixed
//! header, block-aligned data, and LRU eviction among unpinned pages, here
//! specialized to a single growable byte-oriented stream per file rather
//! than a catalog of named streams sharing one file.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod header;
pub mod memory;
pub mod merge;
pub mod page_cache;
pub mod scan;
pub mod sort;
pub mod stream;
pub mod temp;

pub use error::{Error, Result};
pub use memory::{MemoryManager, MemoryReservation};
pub use merge::{merge, MergeCursor};
pub use page_cache::BlockCache;
pub use scan::{scan, ScanObject, ScanSignal};
pub use sort::planner::{plan_sort, SortParams};
pub use sort::sort;
pub use stream::{Item, OpenMode, Persistence, Status, Stream};
pub use temp::{DefaultTempPathProvider, TempPathProvider};

#[cfg(test)]
mod tests;
