use std::{
    collections::HashMap,
    fs::File,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};

use crate::utils::io::BlockIO;

use super::{Error, MIN_CACHE_SIZE, NOT_FOUND, PAGE_SIZE, PageNumber, Result};

/// Cache statistics kinds, see [`PagedCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStat {
    TotalRequests,
    TotalCacheMisses,
    TotalCacheHits,
    TotalBytesWritten,
    TotalBytesRead,
    /// Cache hits rate, 0-100%.
    CacheHitsRate,
    /// Cache misses rate, 0-100%.
    CacheMissesRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    /// Page matches what is on disk.
    Clean,
    /// Page has been rewritten and must be persisted.
    Dirty,
}

/// Contents of one pool slot holding a single page worth of data.
struct FrameBuf {
    /// Page number in file, or `NOT_FOUND` while the frame is empty.
    page_no: PageNumber,
    state: PageState,
    /// Valid prefix of `data`: bytes read from disk plus any writes.
    available: usize,
    data: Box<[u8]>,
}

/// One cache frame. The lock serializes frame content against concurrent
/// readers, writers and the eviction path.
struct Frame {
    buf: RwLock<FrameBuf>,
}

impl Frame {
    fn empty() -> Self {
        Self {
            buf: RwLock::new(FrameBuf {
                page_no: NOT_FOUND,
                state: PageState::Clean,
                available: 0,
                data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            }),
        }
    }
}

const NIL: usize = usize::MAX;

#[derive(Clone, Copy)]
struct LruLink {
    prev: usize,
    next: usize,
}

/// Cache structure: page map plus an LRU list threaded through the frame
/// pool by index. All of it sits under one mutex with short critical
/// sections: map probe, list splice, eviction pop.
struct CacheIndex {
    /// File page number -> frame id.
    map: HashMap<PageNumber, usize>,
    /// Doubly linked LRU list over frame ids, front = most recent.
    links: Vec<LruLink>,
    /// Frame id -> file page number currently mapped to it.
    page_of: Vec<PageNumber>,
    head: usize,
    tail: usize,
    /// Frames not holding any page.
    free: Vec<usize>,
}

impl CacheIndex {
    fn new(frames: usize) -> Self {
        Self {
            map: HashMap::with_capacity(frames),
            links: vec![LruLink { prev: NIL, next: NIL }; frames],
            page_of: vec![NOT_FOUND; frames],
            head: NIL,
            tail: NIL,
            free: (0..frames).rev().collect(),
        }
    }

    fn unlink(&mut self, id: usize) {
        let LruLink { prev, next } = self.links[id];

        if prev != NIL {
            self.links[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.links[next].prev = prev;
        } else {
            self.tail = prev;
        }

        self.links[id] = LruLink { prev: NIL, next: NIL };
    }

    fn push_front(&mut self, id: usize) {
        self.links[id] = LruLink {
            prev: NIL,
            next: self.head,
        };

        if self.head != NIL {
            self.links[self.head].prev = id;
        } else {
            self.tail = id;
        }
        self.head = id;
    }

    /// LRU touch: splices a resident frame to the front of the list.
    fn touch(&mut self, id: usize) {
        self.unlink(id);
        self.push_front(id);
    }

    /// Publishes a loaded frame as the most recently used one.
    fn insert(&mut self, page_no: PageNumber, id: usize) {
        self.map.insert(page_no, id);
        self.page_of[id] = page_no;
        self.push_front(id);
    }

    /// Pops the least recently used frame and unmaps it. Returns the frame
    /// id and the page it held.
    fn pop_tail(&mut self) -> Option<(usize, PageNumber)> {
        if self.tail == NIL {
            return None;
        }

        let id = self.tail;
        self.unlink(id);

        let page_no = self.page_of[id];
        self.map.remove(&page_no);
        self.page_of[id] = NOT_FOUND;

        Some((id, page_no))
    }
}

/// LRU cache of fixed-size page frames over page-aligned block I/O.
///
/// Services byte-range reads and writes of arbitrary offset and length by
/// translating them into page-level operations. Partial page writes fetch
/// the page first so the surrounding bytes are preserved; full page writes
/// overwrite directly. Dirty frames go back to disk on eviction and on
/// [`PagedCache::flush`].
pub struct PagedCache {
    io: BlockIO<File>,
    /// Preallocated frame pool; replaced wholesale by `set_cache_size`.
    pool: RwLock<Vec<Frame>>,
    index: Mutex<CacheIndex>,

    requests: CachePadded<AtomicU64>,
    misses: CachePadded<AtomicU64>,
    bytes_read: CachePadded<AtomicU64>,
    bytes_written: CachePadded<AtomicU64>,
}

impl PagedCache {
    /// Opens `path` and allocates a pool of `cache_bytes / PAGE_SIZE`
    /// frames, raised to the minimum pool size.
    pub fn open(path: impl AsRef<Path>, read_only: bool, cache_bytes: usize) -> Result<Self> {
        let io = BlockIO::new(PAGE_SIZE);
        io.open(path, read_only)?;

        let frames = Self::frames_for(cache_bytes);

        Ok(Self {
            io,
            pool: RwLock::new(Self::allocate_pool(frames)),
            index: Mutex::new(CacheIndex::new(frames)),
            requests: CachePadded::new(AtomicU64::new(0)),
            misses: CachePadded::new(AtomicU64::new(0)),
            bytes_read: CachePadded::new(AtomicU64::new(0)),
            bytes_written: CachePadded::new(AtomicU64::new(0)),
        })
    }

    /// Flushes dirty frames, closes the file and releases the pool.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.io.is_open() {
            return Ok(());
        }

        if !self.io.is_read_only() {
            self.flush()?;
        }
        self.io.close()?;

        let mut pool = self.pool.write();
        let mut index = self.index.lock();
        pool.clear();
        *index = CacheIndex::new(0);

        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.io.is_open()
    }

    pub fn is_read_only(&self) -> bool {
        self.io.is_read_only()
    }

    /// Current pool capacity in bytes.
    pub fn cache_size(&self) -> usize {
        self.pool.read().len() * PAGE_SIZE
    }

    /// Number of pages currently resident in the pool.
    pub fn cached_pages(&self) -> usize {
        self.index.lock().map.len()
    }

    /// Underlying file length in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.io.size()?)
    }

    /// Reads `dst.len()` bytes starting at `position`. Returns the number
    /// of bytes actually read, which is short when the logical file ends
    /// inside the requested range. Returns 0 after close.
    pub fn read(&self, position: u64, dst: &mut [u8]) -> Result<usize> {
        if !self.io.is_open() || dst.is_empty() {
            return Ok(0);
        }

        let pool = self.pool.read();
        let page = PAGE_SIZE as u64;

        // Aligned read of exactly one page bypasses the slicing logic.
        if position % page == 0 && dst.len() == PAGE_SIZE {
            let copied = self.with_page_read(&pool, position / page, |buf| {
                dst[..buf.available].copy_from_slice(&buf.data[..buf.available]);
                buf.available
            })?;
            self.bytes_read.fetch_add(copied as u64, Ordering::Relaxed);
            return Ok(copied);
        }

        let end = position + dst.len() as u64;
        let first_page = position / page;
        let last_page = (end - 1) / page;
        let mut bytes_read = 0usize;

        for page_no in first_page..=last_page {
            let page_start = page_no * page;
            let from = (position.max(page_start) - page_start) as usize;
            let to = (end.min(page_start + page) - page_start) as usize;
            let want = to - from;

            let dst_at = bytes_read;
            let copied = self.with_page_read(&pool, page_no, |buf| {
                let upto = buf.available.min(to);
                let copy = upto.saturating_sub(from);
                dst[dst_at..dst_at + copy].copy_from_slice(&buf.data[from..from + copy]);
                copy
            })?;

            bytes_read += copied;
            if copied < want {
                break;
            }
        }

        self.bytes_read.fetch_add(bytes_read as u64, Ordering::Relaxed);
        Ok(bytes_read)
    }

    /// Writes `src` starting at `position`, extending the file when the
    /// range lies past its end. Every touched page becomes dirty. Returns
    /// 0 after close and in read only mode.
    pub fn write(&self, position: u64, src: &[u8]) -> Result<usize> {
        if !self.io.is_open() || self.io.is_read_only() || src.is_empty() {
            return Ok(0);
        }

        let pool = self.pool.read();
        let page = PAGE_SIZE as u64;

        let end = position + src.len() as u64;
        let first_page = position / page;
        let last_page = (end - 1) / page;
        let mut bytes_written = 0usize;

        for page_no in first_page..=last_page {
            let page_start = page_no * page;
            let from = (position.max(page_start) - page_start) as usize;
            let to = (end.min(page_start + page) - page_start) as usize;

            let chunk = &src[bytes_written..bytes_written + (to - from)];

            if chunk.len() == PAGE_SIZE {
                // Full page is overwritten directly, no fetch needed.
                self.overwrite_page(&pool, page_no, chunk)?;
            } else {
                // Fetch-before-write: partial pages are loaded first so the
                // bytes around the written range survive.
                self.with_page_write(&pool, page_no, |buf| {
                    buf.data[from..to].copy_from_slice(chunk);
                    buf.state = PageState::Dirty;
                    buf.available = buf.available.max(to);
                })?;
            }

            bytes_written += chunk.len();
        }

        self.bytes_written
            .fetch_add(bytes_written as u64, Ordering::Relaxed);
        Ok(bytes_written)
    }

    /// Persists every dirty frame in ascending page order, then flushes the
    /// underlying file. Fails if any dirty page could not be written back.
    pub fn flush(&self) -> Result<()> {
        if !self.io.is_open() || self.io.is_read_only() {
            return Ok(());
        }

        let pool = self.pool.read();

        let mut resident: Vec<(PageNumber, usize)> = {
            let index = self.index.lock();
            index.map.iter().map(|(&page, &id)| (page, id)).collect()
        };
        // Ascending page order gives the device a sequential write pattern.
        resident.sort_unstable_by_key(|&(page_no, _)| page_no);

        for (page_no, id) in resident {
            let mut buf = pool[id].buf.write();
            if buf.page_no != page_no || buf.state != PageState::Dirty {
                continue;
            }

            let written = self.io.write_page(page_no, &buf.data)?;
            if written != PAGE_SIZE {
                return Err(Error::IoShort {
                    op: "page write",
                    expected: PAGE_SIZE,
                    actual: written,
                });
            }
            buf.state = PageState::Clean;
        }

        self.io.flush()?;
        Ok(())
    }

    /// Flushes, releases the pool and allocates a new one. The size floors
    /// at the minimum pool size; returns the actual capacity in bytes.
    /// Statistics are reset.
    pub fn set_cache_size(&self, cache_bytes: usize) -> Result<usize> {
        if self.io.is_open() && !self.io.is_read_only() {
            self.flush()?;
        }

        let frames = Self::frames_for(cache_bytes);

        let mut pool = self.pool.write();
        let mut index = self.index.lock();
        *pool = Self::allocate_pool(frames);
        *index = CacheIndex::new(frames);
        drop(index);
        drop(pool);

        self.reset_stats();
        Ok(frames * PAGE_SIZE)
    }

    pub fn reset_stats(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self, stat: CacheStat) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;

        match stat {
            CacheStat::TotalRequests => requests,
            CacheStat::TotalCacheMisses => misses,
            CacheStat::TotalCacheHits => requests - misses,
            CacheStat::TotalBytesRead => self.bytes_read.load(Ordering::Relaxed) as f64,
            CacheStat::TotalBytesWritten => self.bytes_written.load(Ordering::Relaxed) as f64,
            CacheStat::CacheHitsRate => {
                if requests == 0.0 {
                    0.0
                } else {
                    (requests - misses) / requests * 100.0
                }
            }
            CacheStat::CacheMissesRate => {
                if requests == 0.0 {
                    0.0
                } else {
                    misses / requests * 100.0
                }
            }
        }
    }

    fn frames_for(cache_bytes: usize) -> usize {
        cache_bytes.max(MIN_CACHE_SIZE) / PAGE_SIZE
    }

    fn allocate_pool(frames: usize) -> Vec<Frame> {
        (0..frames).map(|_| Frame::empty()).collect()
    }

    /// Looks the page up in the index, loading it from disk on a miss.
    /// Returns the frame id; the caller re-verifies the frame still holds
    /// the page once it has the frame lock.
    fn lookup(&self, pool: &[Frame], page_no: PageNumber) -> Result<usize> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        {
            let mut index = self.index.lock();
            if let Some(&id) = index.map.get(&page_no) {
                index.touch(id);
                return Ok(id);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.load_page(pool, page_no)
    }

    /// Loads `page_no` from disk into a fresh frame and publishes it. When
    /// another thread published the same page in the meantime, the local
    /// frame goes back to the pool and the winner's frame is used.
    fn load_page(&self, pool: &[Frame], page_no: PageNumber) -> Result<usize> {
        let id = self.acquire_frame(pool)?;

        {
            let mut buf = pool[id].buf.write();
            buf.data.fill(0);
            let bytes_read = self.io.read_page(page_no, &mut buf.data)?;
            buf.page_no = page_no;
            buf.state = PageState::Clean;
            buf.available = bytes_read;
        }

        let mut index = self.index.lock();
        if let Some(&winner) = index.map.get(&page_no) {
            index.free.push(id);
            index.touch(winner);
            return Ok(winner);
        }

        index.insert(page_no, id);
        Ok(id)
    }

    /// Returns a frame holding no page: from the pool while it is not yet
    /// full, afterwards by evicting the least recently used frame. A dirty
    /// evicted frame is persisted first, under its exclusive lock.
    fn acquire_frame(&self, pool: &[Frame]) -> Result<usize> {
        let evicted = {
            let mut index = self.index.lock();
            if let Some(id) = index.free.pop() {
                return Ok(id);
            }
            index
                .pop_tail()
                .ok_or(crate::utils::Error::Closed)?
        };

        // The frame is unmapped now, no lookup can reach it anymore; the
        // write lock waits out any reader that got in before.
        let (id, page_no) = evicted;
        let mut buf = pool[id].buf.write();

        let result = if buf.page_no == page_no && buf.state == PageState::Dirty {
            log::debug!("evicting dirty page {page_no}");
            self.io.write_page(page_no, &buf.data).map(|_| ())
        } else {
            Ok(())
        };

        buf.page_no = NOT_FOUND;
        buf.state = PageState::Clean;
        buf.available = 0;
        drop(buf);

        match result {
            Ok(()) => Ok(id),
            Err(err) => {
                // Keep the pool intact even when the write back failed.
                self.index.lock().free.push(id);
                Err(err.into())
            }
        }
    }

    /// Runs `f` with shared access to the frame of `page_no`, retrying the
    /// lookup when the frame got recycled before the lock was taken.
    fn with_page_read<R>(
        &self,
        pool: &[Frame],
        page_no: PageNumber,
        f: impl FnOnce(&FrameBuf) -> R,
    ) -> Result<R> {
        let mut f = Some(f);
        loop {
            let id = self.lookup(pool, page_no)?;
            let buf = pool[id].buf.read();
            if buf.page_no == page_no {
                return Ok(f.take().unwrap()(&buf));
            }
        }
    }

    /// Runs `f` with exclusive access to the frame of `page_no`, retrying
    /// the lookup when the frame got recycled before the lock was taken.
    fn with_page_write<R>(
        &self,
        pool: &[Frame],
        page_no: PageNumber,
        f: impl FnOnce(&mut FrameBuf) -> R,
    ) -> Result<R> {
        let mut f = Some(f);
        loop {
            let id = self.lookup(pool, page_no)?;
            let mut buf = pool[id].buf.write();
            if buf.page_no == page_no {
                return Ok(f.take().unwrap()(&mut buf));
            }
        }
    }

    /// Replaces the full contents of `page_no` without fetching it from
    /// disk first. A missing page gets a fresh frame that is filled before
    /// it becomes visible in the index.
    fn overwrite_page(&self, pool: &[Frame], page_no: PageNumber, src: &[u8]) -> Result<()> {
        loop {
            self.requests.fetch_add(1, Ordering::Relaxed);

            let resident = {
                let mut index = self.index.lock();
                match index.map.get(&page_no).copied() {
                    Some(id) => {
                        index.touch(id);
                        Some(id)
                    }
                    None => None,
                }
            };

            if let Some(id) = resident {
                let mut buf = pool[id].buf.write();
                if buf.page_no != page_no {
                    continue;
                }
                buf.data.copy_from_slice(src);
                buf.state = PageState::Dirty;
                buf.available = PAGE_SIZE;
                return Ok(());
            }

            self.misses.fetch_add(1, Ordering::Relaxed);

            let id = self.acquire_frame(pool)?;
            {
                let mut buf = pool[id].buf.write();
                buf.data.copy_from_slice(src);
                buf.page_no = page_no;
                buf.state = PageState::Dirty;
                buf.available = PAGE_SIZE;
            }

            let mut index = self.index.lock();
            if index.map.contains_key(&page_no) {
                // Another thread published this page first, write through
                // its frame instead.
                index.free.push(id);
                continue;
            }

            index.insert(page_no, id);
            return Ok(());
        }
    }
}

impl Drop for PagedCache {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
