//! Typed, item-granular streams over a file (C3).

use crate::error::{Error, Result};
use crate::header::StreamHeader;
use crate::memory::MemoryManager;
use crate::page_cache::BlockCache;
use crate::temp::TempPathProvider;
use std::fs::File;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use sync_file::RandomAccessFile;
use tracing::{trace, trace_span};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// The OS block size this host's streams are written with. Recorded in the
/// header so a stream created on a host with a different block size is
/// rejected at open, per the header-validation contract.
pub const OS_BLOCK_SIZE: u64 = 4096;

/// Default on-disk block size for newly created streams. Must be a
/// multiple of [`OS_BLOCK_SIZE`].
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Page-count capacity of a full (non-substream) stream's block cache. The
/// sort planner's run-formation overhead budget is expressed in units of
/// this, since a freshly written run stream's cache grows to exactly this
/// many resident pages before LRU eviction caps it.
pub(crate) const STREAM_CACHE_PAGES: usize = 8;

/// Marker bound for anything that can be stored in a [`Stream`]: a
/// fixed-size, trivially copyable record with a stable byte layout.
pub trait Item: AsBytes + FromBytes + FromZeroes + Copy {}
impl<T: AsBytes + FromBytes + FromZeroes + Copy> Item for T {}

/// How a stream was opened, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only.
    Read,
    /// Read and write, random access.
    Write,
    /// Write at the current end of the stream only.
    Append,
    /// Write-only, strictly sequential; enables the fast append path used
    /// by run formation.
    WriteOnly,
}

impl OpenMode {
    fn is_writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// What happens to a stream's backing file when the stream is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// The file is removed.
    Delete,
    /// The file is retained.
    Persistent,
    /// The file is removed once the stream has been read to its end; if it
    /// never reaches end of stream, it is retained (matching "at most one
    /// forward pass" rather than "always deleted").
    ReadOnce,
}

/// Current state of a stream, independent of its cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Usable.
    Ok,
    /// Became unusable (bad header at open, or a prior I/O error).
    Invalid,
    /// The next `read_item` call will observe end of stream (and, for
    /// `ReadOnce` streams, trigger teardown).
    EosNextCall,
    /// Already reached end of stream.
    EndOfStream,
}

/// A bounded range `[lo, hi]` a substream is restricted to, in item indices.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    lo: u64,
    hi: u64,
}

/// A persisted sequence of fixed-size items, with a sequential cursor and a
/// destruction policy.
///
/// `F` is the random-access file backend; `T` is the item type. The
/// destructor performs the `OPEN -> CLOSED` transition: flush the header if
/// dirty, then delete the backing file if the persistence policy calls for
/// it. There is no separate explicit `close()` method; RAII drives the whole
/// lifetime, the same way any other owned file resource in this crate is
/// released.
pub struct Stream<T: Item, F = RandomAccessFile> {
    cache: BlockCache<F>,
    header: StreamHeader,
    header_dirty: bool,
    mode: OpenMode,
    persistence: Persistence,
    cursor: u64,
    path: Option<PathBuf>,
    bounds: Option<Bounds>,
    status: Status,
    _marker: PhantomData<T>,
}

/// Opens `path` with `opts`, translating a permission-denied OS error into
/// [`Error::Permission`] instead of the generic [`Error::Io`] -- the one
/// open-time failure ("cannot open with requested mode") this crate's error
/// type names specifically.
fn open_with_permission_check(opts: &std::fs::OpenOptions, path: &Path) -> Result<File> {
    opts.open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            Error::Permission(format!("{}: {e}", path.display()))
        } else {
            Error::Io(e)
        }
    })
}

impl<T: Item> Stream<T, RandomAccessFile> {
    /// Creates a fresh, uniquely-named temporary stream with
    /// `Persistence::Delete`.
    pub fn new_temp(mem: MemoryManager, temp: &dyn TempPathProvider) -> Result<Self> {
        let path = temp.make_temp_path()?;
        let file = open_with_permission_check(File::options().read(true).write(true), &path)?;
        let random = RandomAccessFile::from(file);
        let mut stream = Self::create_with_file(random, mem, OpenMode::WriteOnly)?;
        stream.path = Some(path);
        stream.persistence = Persistence::Delete;
        Ok(stream)
    }

    /// Opens or creates a named stream.
    pub fn new_named(path: impl AsRef<Path>, mode: OpenMode, mem: MemoryManager) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut stream = match mode {
            OpenMode::Read => {
                let file = open_with_permission_check(File::options().read(true), &path)?;
                let random = RandomAccessFile::from(file);
                Self::open_with_file(random, mem, mode)?
            }
            OpenMode::Write | OpenMode::Append | OpenMode::WriteOnly => {
                let exists = path.exists();
                let file = open_with_permission_check(
                    File::options().read(true).write(true).create(true),
                    &path,
                )?;
                let random = RandomAccessFile::from(file);
                if exists {
                    Self::open_with_file(random, mem, mode)?
                } else {
                    Self::create_with_file(random, mem, mode)?
                }
            }
        };
        stream.path = Some(path);
        if mode == OpenMode::Read {
            stream.persistence = Persistence::Persistent;
        }
        if mode == OpenMode::Append {
            stream.cursor = stream.header.logical_eof();
        }
        Ok(stream)
    }
}

/// Returns `Err(Error::IllegalAlias)` if the same canonicalized path occurs
/// more than once among `paths`. Temp streams have unique paths and never
/// alias; this only ever fires when the same named file backs two of the
/// streams passed to one `scan`/`merge`/`sort` call (most commonly: calling
/// one of them with a stream as both an input and the output).
pub(crate) fn reject_path_aliases(paths: impl IntoIterator<Item = Option<PathBuf>>) -> Result<()> {
    let mut seen: Vec<PathBuf> = Vec::new();
    for p in paths.into_iter().flatten() {
        if seen.contains(&p) {
            return Err(Error::IllegalAlias(format!(
                "{} is used as more than one stream in the same operation",
                p.display()
            )));
        }
        seen.push(p);
    }
    Ok(())
}

impl<T: Item, F: sync_file::ReadAt + sync_file::WriteAt> Stream<T, F> {
    fn create_with_file(file: F, mem: MemoryManager, mode: OpenMode) -> Result<Self> {
        let _span = trace_span!("Stream::create_with_file").entered();
        let item_size = std::mem::size_of::<T>() as u64;
        let header = StreamHeader::new(item_size, OS_BLOCK_SIZE, DEFAULT_BLOCK_SIZE);
        let block_size = header.block_size();
        let capacity = STREAM_CACHE_PAGES;
        let mut cache = BlockCache::new(file, block_size, mem, capacity);
        cache.with_page_mut(0, true, |page| {
            page[..std::mem::size_of::<StreamHeader>()].copy_from_slice(header.as_bytes());
        })?;
        cache.flush()?;
        trace!("created new stream, item_size={item_size}");
        Ok(Stream {
            cache,
            header,
            header_dirty: false,
            mode,
            persistence: Persistence::Delete,
            cursor: 0,
            path: None,
            bounds: None,
            status: Status::Ok,
            _marker: PhantomData,
        })
    }

    fn open_with_file(file: F, mem: MemoryManager, mode: OpenMode) -> Result<Self> {
        let _span = trace_span!("Stream::open_with_file").entered();
        let item_size = std::mem::size_of::<T>() as u64;
        let mut cache = BlockCache::new(file, DEFAULT_BLOCK_SIZE, mem, STREAM_CACHE_PAGES);
        let header = cache.with_page(0, |page| {
            StreamHeader::read_from_prefix(page)
                .ok_or_else(|| Error::BadHeader("file too small for header".into()))
        })??;
        header
            .validate(item_size, OS_BLOCK_SIZE)
            .map_err(Error::BadHeader)?;
        if header.block_size() != DEFAULT_BLOCK_SIZE {
            return Err(Error::BadHeader(format!(
                "unsupported block size {} (expected {DEFAULT_BLOCK_SIZE})",
                header.block_size()
            )));
        }
        Ok(Stream {
            cache,
            header,
            header_dirty: false,
            mode,
            persistence: Persistence::Persistent,
            cursor: 0,
            path: None,
            bounds: None,
            status: Status::Ok,
            _marker: PhantomData,
        })
    }

    /// Sets the persistence policy applied when this stream is dropped.
    pub fn set_persist(&mut self, policy: Persistence) {
        self.persistence = policy;
    }

    pub fn persist(&self) -> Persistence {
        self.persistence
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.status != Status::Invalid
    }

    /// Item-index length of this stream (or, for a substream, of its bound
    /// range).
    pub fn stream_len(&self) -> u64 {
        match self.bounds {
            Some(b) => b.hi - b.lo + 1,
            None => self.header.logical_eof(),
        }
    }

    /// Current cursor position, as an absolute item index into the
    /// underlying file. For a substream `[lo, hi]` this stays within
    /// `lo..=hi + 1` (`lo` at the start, `hi + 1` once every bounded item
    /// has been read), rather than resetting to a `0`-based index local to
    /// the substream's own range.
    pub fn tell(&self) -> u64 {
        self.cursor
    }

    /// Cursor position relative to this stream's own numbering: `0`-based
    /// for a full stream, and `0`-based within `[lo, hi]` for a substream.
    /// Used internally wherever a count of remaining items is computed
    /// against [`Stream::stream_len`], which is likewise expressed in the
    /// stream's own numbering.
    pub(crate) fn relative_tell(&self) -> u64 {
        match self.bounds {
            Some(b) => self.cursor - b.lo,
            None => self.cursor,
        }
    }

    pub fn name(&self) -> Option<String> {
        self.path.as_ref().map(|p| p.display().to_string())
    }

    /// The canonicalized backing path, if this stream is named and its file
    /// currently exists. Used to detect two streams aliasing the same file
    /// (e.g. passing the same named stream as both a scan's input and its
    /// output), which `Error::IllegalAlias` guards against at call sites
    /// that accept more than one stream.
    pub fn canonical_path(&self) -> Option<PathBuf> {
        self.path.as_ref().and_then(|p| std::fs::canonicalize(p).ok())
    }

    fn absolute_index(&self, relative: u64) -> u64 {
        match self.bounds {
            Some(b) => b.lo + relative,
            None => relative,
        }
    }

    fn hi_bound(&self) -> u64 {
        match self.bounds {
            Some(b) => b.hi,
            None => self.header.logical_eof().saturating_sub(1),
        }
    }

    /// Moves the cursor to item index `i` (relative to this stream's own
    /// bounds, if it is a substream).
    pub fn seek(&mut self, i: u64) -> Result<()> {
        if self.status == Status::Invalid {
            return Err(Error::InvalidState("stream is invalid".into()));
        }
        let len = self.stream_len();
        if i > len {
            return Err(Error::OutOfBounds(format!(
                "seek to {i} exceeds stream length {len}"
            )));
        }
        self.cursor = self.absolute_index(i);
        self.status = Status::Ok;
        Ok(())
    }

    /// Flushes and drops every page this stream's cache currently holds,
    /// releasing their memory reservations. Meant for a stream that's about
    /// to sit idle for a while (a sort run parked until its turn to merge)
    /// so its block cache isn't charged against the budget the whole time,
    /// only while actually being read or written.
    pub(crate) fn release_cache(&mut self) -> Result<()> {
        self.cache.release()
    }

    /// Shrinks the stream to `i` items. Extension is rejected: this
    /// implementation never needs it, and the bound-range source this
    /// format was modeled on leaves extend-via-truncate semantics
    /// unspecified.
    pub fn truncate(&mut self, i: u64) -> Result<()> {
        if !self.mode.is_writable() {
            return Err(Error::ReadOnly);
        }
        if i > self.header.logical_eof() {
            return Err(Error::OutOfBounds(format!(
                "truncate to {i} would extend past current length {}",
                self.header.logical_eof()
            )));
        }
        self.header.set_logical_eof(i);
        self.header_dirty = true;
        if self.cursor > i {
            self.cursor = i;
        }
        self.flush_header()?;
        Ok(())
    }

    fn flush_header(&mut self) -> Result<()> {
        if !self.header_dirty {
            return Ok(());
        }
        let header = self.header;
        self.cache.with_page_mut(0, true, |page| {
            page[..std::mem::size_of::<StreamHeader>()].copy_from_slice(header.as_bytes());
        })?;
        self.header_dirty = false;
        Ok(())
    }

    fn byte_offset_of(&self, item_index: u64) -> u64 {
        self.header.data_start() + item_index * self.header.item_size()
    }

    /// Reads the item at the cursor and advances it, or returns `Ok(None)`
    /// at end of stream. A `ReadOnce` stream that reaches end of stream is
    /// torn down (deleted) on this call.
    pub fn read_item(&mut self) -> Result<Option<T>> {
        if self.status == Status::Invalid {
            return Err(Error::InvalidState("stream is invalid".into()));
        }
        let hi = self.hi_bound();
        if self.header.logical_eof() == 0 || self.cursor > hi {
            self.status = Status::EndOfStream;
            self.maybe_teardown_read_once();
            return Ok(None);
        }
        let item_size = self.header.item_size() as usize;
        let byte_offset = self.byte_offset_of(self.cursor);
        let mut buf = vec![0u8; item_size];
        self.cache.read_span(byte_offset, &mut buf)?;
        let item = T::read_from(buf.as_slice())
            .ok_or_else(|| Error::BadHeader("item does not fit in its byte span".into()))?;
        self.cursor += 1;
        if self.cursor > hi {
            self.status = Status::EosNextCall;
        }
        if self.cursor > self.header.logical_eof() {
            self.maybe_teardown_read_once();
        }
        Ok(Some(item))
    }

    fn maybe_teardown_read_once(&mut self) {
        if self.persistence == Persistence::ReadOnce {
            let _ = self.cache.flush();
            if let Some(path) = &self.path {
                let _ = std::fs::remove_file(path);
            }
            self.status = Status::Invalid;
        }
    }

    /// Appends `item` at the cursor, extending the stream if the cursor
    /// was at the previous end.
    pub fn write_item(&mut self, item: T) -> Result<()> {
        if !self.mode.is_writable() {
            return Err(Error::ReadOnly);
        }
        if let Some(b) = self.bounds {
            if self.cursor > b.hi {
                return Err(Error::OutOfBounds("write past substream bound".into()));
            }
        }
        let byte_offset = self.byte_offset_of(self.cursor);
        self.cache.write_span(byte_offset, item.as_bytes())?;
        self.cursor += 1;
        if self.cursor > self.header.logical_eof() {
            self.header.set_logical_eof(self.cursor);
            self.header_dirty = true;
        }
        self.status = Status::Ok;
        Ok(())
    }

    /// Creates a read-only, range-bounded view over `[lo, hi]` (inclusive
    /// item indices) of this stream's *current* file. `ReadOnce` is
    /// forbidden on substreams because a substream's teardown must never
    /// delete the parent's file; callers that want the effect can wrap the
    /// parent itself in `ReadOnce`. The returned substream owns its own
    /// cursor, starting positioned at `lo`.
    pub fn new_substream(&self, lo: u64, hi: u64, policy: Persistence) -> Result<Stream<T, F>>
    where
        F: Clone,
    {
        if policy == Persistence::ReadOnce {
            return Err(Error::InvalidState(
                "READ_ONCE is not permitted on substreams".into(),
            ));
        }
        if hi < lo || hi >= self.header.logical_eof() {
            return Err(Error::OutOfBounds(format!(
                "substream range [{lo}, {hi}] is outside stream of length {}",
                self.header.logical_eof()
            )));
        }
        let file = self.cache.file().clone();
        let mem = self.cache.mem().clone();
        let block_size = self.cache.block_size();
        let cache = BlockCache::new(file, block_size, mem, 4);
        Ok(Stream {
            cache,
            header: self.header,
            header_dirty: false,
            mode: OpenMode::Read,
            persistence: policy,
            cursor: lo,
            path: None,
            bounds: Some(Bounds { lo, hi }),
            status: Status::Ok,
            _marker: PhantomData,
        })
    }
}

impl<T: Item, F> Drop for Stream<T, F>
where
    F: sync_file::ReadAt + sync_file::WriteAt,
{
    fn drop(&mut self) {
        let _ = self.flush_header();
        let _ = self.cache.flush();
        match self.persistence {
            Persistence::Delete => {
                if let Some(path) = &self.path {
                    let _ = std::fs::remove_file(path);
                }
            }
            Persistence::Persistent => {}
            Persistence::ReadOnce => {
                // Already torn down in `read_item` if it ever reached EOF;
                // otherwise it's retained, matching "at most one pass".
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::DefaultTempPathProvider;

    #[test]
    fn write_then_read_back_in_order() {
        let mem = MemoryManager::new(1 << 20);
        let temp = DefaultTempPathProvider::new();
        let mut s: Stream<u64> = Stream::new_temp(mem, &temp).unwrap();
        for i in 0..1000u64 {
            s.write_item(i).unwrap();
        }
        assert_eq!(s.stream_len(), 1000);
        s.seek(0).unwrap();
        for i in 0..1000u64 {
            assert_eq!(s.read_item().unwrap(), Some(i));
        }
        assert_eq!(s.read_item().unwrap(), None);
    }

    #[test]
    fn seek_past_end_is_out_of_bounds() {
        let mem = MemoryManager::new(1 << 20);
        let temp = DefaultTempPathProvider::new();
        let mut s: Stream<u32> = Stream::new_temp(mem, &temp).unwrap();
        s.write_item(1).unwrap();
        assert!(s.seek(5).is_err());
        assert_eq!(s.stream_len(), 1);
    }

    #[test]
    fn delete_policy_removes_file_on_drop() {
        let mem = MemoryManager::new(1 << 20);
        let temp = DefaultTempPathProvider::new();
        let path;
        {
            let s: Stream<u32> = Stream::new_temp(mem, &temp).unwrap();
            path = s.name().unwrap();
            assert!(std::path::Path::new(&path).exists());
        }
        assert!(!std::path::Path::new(&path).exists());
    }
}
