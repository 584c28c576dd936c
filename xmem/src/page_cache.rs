//! Fixed-size block cache over a random-access file backend (C2).
//!
//! Each stream owns one `BlockCache`. Pages are identified by block index
//! (`offset = block_index * block_size`); a page holds exactly `block_size`
//! bytes read from or to be written to the backing file. There is no
//! indirection table here: that machinery only earns its keep when many
//! streams share one file through a common free-page pool, while here every
//! stream owns a whole file to itself, so "block index" already *is* the
//! file offset (divided by block size).

use crate::error::{Error, Result};
use crate::memory::{MemoryManager, MemoryReservation};
use std::collections::HashMap;
use sync_file::{ReadAt, WriteAt};

/// Maps a disk-full OS error to [`Error::OutOfSpace`] instead of the
/// generic [`Error::Io`], since it's the one write-time failure this
/// crate's taxonomy names specifically.
fn map_write_err(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::StorageFull {
        Error::OutOfSpace
    } else {
        Error::Io(e)
    }
}

struct Page {
    bytes: Vec<u8>,
    dirty: bool,
    last_touched: u64,
    _reservation: MemoryReservation,
}

/// An LRU cache of fixed-size pages read from / written to a file backend.
pub struct BlockCache<F> {
    file: F,
    block_size: u64,
    mem: MemoryManager,
    pages: HashMap<u64, Page>,
    capacity: usize,
    clock: u64,
}

impl<F: ReadAt + WriteAt> BlockCache<F> {
    pub fn new(file: F, block_size: u64, mem: MemoryManager, capacity: usize) -> Self {
        BlockCache {
            file,
            block_size,
            mem,
            pages: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn into_inner(self) -> F {
        self.file
    }

    pub fn file(&self) -> &F {
        &self.file
    }

    pub fn mem(&self) -> &MemoryManager {
        &self.mem
    }

    /// Runs `f` against the read-only contents of block `index`, loading it
    /// from disk first if it isn't already cached.
    pub fn with_page<R>(&mut self, index: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.load(index)?;
        self.clock += 1;
        let clock = self.clock;
        let page = self.pages.get_mut(&index).expect("just loaded");
        page.last_touched = clock;
        Ok(f(&page.bytes))
    }

    /// Runs `f` against a mutable view of block `index`, loading it first
    /// (or, if `zero_fill_if_absent` is set, starting from a zeroed page --
    /// used when extending a `WRITE_ONLY` stream past its old EOF). Marks
    /// the page dirty so it is written back on eviction or cache drop.
    pub fn with_page_mut<R>(
        &mut self,
        index: u64,
        zero_fill_if_absent: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        if zero_fill_if_absent && !self.pages.contains_key(&index) {
            self.insert_zeroed(index)?;
        } else {
            self.load(index)?;
        }
        self.clock += 1;
        let clock = self.clock;
        let page = self.pages.get_mut(&index).expect("just loaded");
        page.last_touched = clock;
        page.dirty = true;
        Ok(f(&mut page.bytes))
    }

    /// Reads `len` bytes starting at byte offset `byte_offset` into `out`,
    /// walking as many pages as the span crosses. Used for items whose size
    /// does not evenly divide the block size and so may straddle a page
    /// boundary.
    pub fn read_span(&mut self, byte_offset: u64, out: &mut [u8]) -> Result<()> {
        let mut remaining = out.len();
        let mut src = byte_offset;
        let mut dst = 0usize;
        while remaining > 0 {
            let block_index = src / self.block_size;
            let within = (src % self.block_size) as usize;
            let take = remaining.min(self.block_size as usize - within);
            self.with_page(block_index, |page| {
                out[dst..dst + take].copy_from_slice(&page[within..within + take]);
            })?;
            src += take as u64;
            dst += take;
            remaining -= take;
        }
        Ok(())
    }

    /// Writes `data` starting at byte offset `byte_offset`, walking as many
    /// pages as the span crosses, zero-filling any newly-touched page.
    pub fn write_span(&mut self, byte_offset: u64, data: &[u8]) -> Result<()> {
        let mut remaining = data.len();
        let mut dst = byte_offset;
        let mut src = 0usize;
        while remaining > 0 {
            let block_index = dst / self.block_size;
            let within = (dst % self.block_size) as usize;
            let take = remaining.min(self.block_size as usize - within);
            self.with_page_mut(block_index, true, |page| {
                page[within..within + take].copy_from_slice(&data[src..src + take]);
            })?;
            dst += take as u64;
            src += take;
            remaining -= take;
        }
        Ok(())
    }

    /// Writes back every dirty page. Called from the owning stream's
    /// `Drop` impl and before any operation that must observe a consistent
    /// on-disk state (e.g. `truncate`).
    pub fn flush(&mut self) -> Result<()> {
        for (&index, page) in self.pages.iter_mut() {
            if page.dirty {
                self.file
                    .write_all_at(&page.bytes, index * self.block_size)
                    .map_err(map_write_err)?;
                page.dirty = false;
            }
        }
        Ok(())
    }

    pub fn invalidate(&mut self, index: u64) {
        self.pages.remove(&index);
    }

    /// Flushes every dirty page, then drops every resident page and its
    /// memory reservation. Used once a stream is done being written for a
    /// while (e.g. a sort run, parked until its turn to merge) so its cache
    /// doesn't sit at its peak footprint for the rest of the operation;
    /// the next touch simply reloads pages from disk as normal.
    pub fn release(&mut self) -> Result<()> {
        self.flush()?;
        self.pages.clear();
        Ok(())
    }

    fn load(&mut self, index: u64) -> Result<()> {
        if self.pages.contains_key(&index) {
            return Ok(());
        }
        self.evict_if_full()?;
        let mut bytes = vec![0u8; self.block_size as usize];
        let n = self.file.read_at(&mut bytes, index * self.block_size)?;
        // Short reads (tail block of a file shorter than one full block)
        // leave the remainder correctly zeroed by the `vec![0u8; ...]` init.
        let _ = n;
        let reservation = MemoryReservation::acquire(&self.mem, self.block_size)?;
        self.pages.insert(
            index,
            Page {
                bytes,
                dirty: false,
                last_touched: self.clock,
                _reservation: reservation,
            },
        );
        Ok(())
    }

    fn insert_zeroed(&mut self, index: u64) -> Result<()> {
        self.evict_if_full()?;
        let reservation = MemoryReservation::acquire(&self.mem, self.block_size)?;
        self.pages.insert(
            index,
            Page {
                bytes: vec![0u8; self.block_size as usize],
                dirty: false,
                last_touched: self.clock,
                _reservation: reservation,
            },
        );
        Ok(())
    }

    fn evict_if_full(&mut self) -> Result<()> {
        if self.pages.len() < self.capacity {
            return Ok(());
        }
        let victim = self
            .pages
            .iter()
            .min_by_key(|(_, page)| page.last_touched)
            .map(|(&index, _)| index);
        if let Some(index) = victim {
            if let Some(page) = self.pages.get(&index) {
                if page.dirty {
                    self.file
                    .write_all_at(&page.bytes, index * self.block_size)
                    .map_err(map_write_err)?;
                }
            }
            self.pages.remove(&index);
        }
        Ok(())
    }
}

impl<F> Drop for BlockCache<F> {
    fn drop(&mut self) {
        // Best-effort: a stream that wants guaranteed flush-before-drop
        // calls `flush()` explicitly before the cache is dropped. Dirty
        // pages still outstanding here (e.g. after a panic mid-write) are
        // silently discarded rather than risking a second fallible write
        // from within `Drop`.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemFile(Mutex<Vec<u8>>);

    impl ReadAt for MemFile {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
            let data = self.0.lock().unwrap();
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }
    }

    impl WriteAt for MemFile {
        fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
            let mut data = self.0.lock().unwrap();
            let offset = offset as usize;
            if data.len() < offset + buf.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[test]
    fn write_then_read_same_page() {
        let mem = MemoryManager::new(1 << 20);
        let mut cache = BlockCache::new(MemFile::default(), 64, mem, 4);
        cache
            .with_page_mut(0, true, |p| p[..5].copy_from_slice(b"hello"))
            .unwrap();
        cache.flush().unwrap();
        cache.invalidate(0);
        let got = cache.with_page(0, |p| p[..5].to_vec()).unwrap();
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn eviction_respects_capacity() {
        let mem = MemoryManager::new(1 << 20);
        let mut cache = BlockCache::new(MemFile::default(), 16, mem.clone(), 2);
        cache.with_page_mut(0, true, |_| ()).unwrap();
        cache.with_page_mut(1, true, |_| ()).unwrap();
        cache.with_page_mut(2, true, |_| ()).unwrap();
        assert!(cache.pages.len() <= 2);
        // in_use should never exceed 2 pages worth of reservations.
        assert!(mem.in_use() <= 32);
    }
}
