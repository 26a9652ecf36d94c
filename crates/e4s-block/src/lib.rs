#![forbid(unsafe_code)]
//! Paged, read-only access to the rescued image.
//!
//! The image is read in 4 KiB pages shared via `Arc`: the cache holds one
//! reference to each resident page and every outstanding view holds another,
//! so a view can never observe a page going away underneath it. Eviction is
//! LRU restricted to pages only the cache still references; when every
//! resident page is pinned the cache grows past its capacity rather than
//! refusing service.
//!
//! Readability flows from the damage map: each page records whether its
//! whole byte range is readable, and each view narrows that to the exact
//! range it covers.

use e4s_damage::DamageMap;
use e4s_error::Result;
use e4s_types::{align_down, align_up, BlockNumber, ByteOffset, BlockSize, PageNumber, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ── Pages ───────────────────────────────────────────────────────────────────

/// One resident 4 KiB page of the image.
///
/// `ok` covers the page's whole byte range (clamped to the image end);
/// views narrow it per range. Pages past the end of the image decode as
/// zeroes and are never `ok`, which turns wild block pointers into not-ok
/// views instead of hard errors.
#[derive(Debug)]
pub struct Page {
    number: PageNumber,
    bytes: Vec<u8>,
    ok: bool,
}

impl Page {
    #[must_use]
    pub fn number(&self) -> PageNumber {
        self.number
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        self.ok
    }
}

// ── Views ───────────────────────────────────────────────────────────────────

/// Refcounted view of a byte range inside a cached page.
///
/// Holding a `CachedBytes` keeps its page resident; the bytes it exposes
/// are stable for the lifetime of the view regardless of cache eviction.
#[derive(Debug, Clone)]
pub struct CachedBytes {
    page: Arc<Page>,
    start: usize,
    len: usize,
    ok: bool,
    abs: ByteOffset,
}

impl CachedBytes {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.page.bytes[self.start..self.start + self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether every byte of this view is readable.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Absolute byte offset of the first byte of this view within the image.
    #[must_use]
    pub fn abs_offset(&self) -> ByteOffset {
        self.abs
    }
}

pub use e4s_types::OnDisk;

/// A decoded on-disk record plus the readability of the bytes it came from.
///
/// Keeps the backing page referenced so the decoded value can always be
/// traced back to live bytes. The unmapped sentinel decodes all-zero bytes
/// and is never `ok`.
#[derive(Debug, Clone)]
pub struct StructView<S> {
    value: S,
    ok: bool,
    page: Option<Arc<Page>>,
}

impl<S: OnDisk> StructView<S> {
    /// Sentinel view for structures the caller already knows are unreachable.
    #[must_use]
    pub fn unmapped() -> Self {
        Self {
            value: S::decode(&vec![0_u8; S::SIZE]),
            ok: false,
            page: None,
        }
    }
}

impl<S> StructView<S> {
    #[must_use]
    pub fn get(&self) -> &S {
        &self.value
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        self.ok
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.page.is_some()
    }
}

/// A page-aligned mapping of a contiguous physical block range.
///
/// Unlike cached pages this buffer is private to the caller: it is read
/// directly from the image, never enters the LRU cache, and is freed on
/// drop. `ok` covers the whole page-aligned range, mirroring how the
/// mapping was established.
#[derive(Debug)]
pub struct MappedExtent {
    buf: Vec<u8>,
    extent_start: usize,
    extent_len: usize,
    ok: bool,
}

impl MappedExtent {
    /// The extent's own bytes (excluding alignment padding).
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.extent_start..self.extent_start + self.extent_len]
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        self.ok
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extent_len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extent_len == 0
    }
}

// ── Cache statistics ────────────────────────────────────────────────────────

/// Shared cache counters.
///
/// The handle outlives the cache itself so teardown accounting (pages still
/// referenced by views when the cache was dropped) stays observable.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub leaked_pages: AtomicU64,
}

impl CacheStats {
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn leaked_pages(&self) -> u64 {
        self.leaked_pages.load(Ordering::Relaxed)
    }
}

// ── Cache ───────────────────────────────────────────────────────────────────

struct CacheInner {
    pages: HashMap<u64, Arc<Page>>,
    /// Recency order, front = least recently used.
    lru: VecDeque<u64>,
}

/// LRU page cache over a read-only image file.
pub struct BlockCache {
    file: File,
    path: PathBuf,
    image_size: u64,
    damage: Arc<DamageMap>,
    block_size: BlockSize,
    capacity: usize,
    inner: Mutex<CacheInner>,
    stats: Arc<CacheStats>,
}

impl BlockCache {
    /// Open `path` read-only and build a cache holding at most
    /// `capacity_pages` resident pages.
    pub fn new(
        path: impl AsRef<Path>,
        damage: Arc<DamageMap>,
        block_size: BlockSize,
        capacity_pages: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let image_size = file.metadata()?.len();
        debug!(
            target: "e4s::block",
            path = %path.display(),
            image_size,
            block_size = %block_size,
            capacity_pages,
            "opened image"
        );
        Ok(Self {
            file,
            path,
            image_size,
            damage,
            block_size,
            capacity: capacity_pages.max(1),
            inner: Mutex::new(CacheInner {
                pages: HashMap::new(),
                lru: VecDeque::new(),
            }),
            stats: Arc::new(CacheStats::default()),
        })
    }

    /// Reopen the same image with a different filesystem block size.
    ///
    /// Used by the bootstrap path once the superblock reveals the real
    /// block size. The old cache's pages are dropped with it.
    pub fn reopen(&self, block_size: BlockSize) -> Result<Self> {
        Self::new(&self.path, Arc::clone(&self.damage), block_size, self.capacity)
    }

    #[must_use]
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn damage(&self) -> &Arc<DamageMap> {
        &self.damage
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Read `buf.len()` bytes at `offset`, zero-filling anything past the
    /// end of the image.
    fn read_filled(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        if offset >= self.image_size {
            return Ok(());
        }
        let available = usize::try_from((self.image_size - offset).min(buf.len() as u64))
            .unwrap_or(buf.len());
        let mut done = 0_usize;
        while done < available {
            let n = self.file.read_at(&mut buf[done..available], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(())
    }

    fn load_page(&self, number: PageNumber) -> Result<Arc<Page>> {
        let start = number.start_byte().0;
        let mut bytes = vec![0_u8; PAGE_SIZE];
        self.read_filled(start, &mut bytes)?;
        let end = (start + PAGE_SIZE as u64).min(self.image_size);
        let ok = start < self.image_size && self.damage.all_good(start, end);
        trace!(target: "e4s::block", page = %number, ok, "page load");
        Ok(Arc::new(Page { number, bytes, ok }))
    }

    /// Get (inserting or promoting) the page with the given number.
    fn page(&self, number: PageNumber) -> Result<Arc<Page>> {
        {
            let mut inner = self.inner.lock();
            if let Some(page) = inner.pages.get(&number.0).cloned() {
                promote(&mut inner.lru, number.0);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(page);
            }
        }

        // Miss: load outside the lock, then insert.
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let page = self.load_page(number)?;
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.pages.get(&number.0).cloned() {
            // Raced with another insert of the same page; keep the resident one.
            promote(&mut inner.lru, number.0);
            return Ok(existing);
        }
        if inner.pages.len() >= self.capacity {
            self.evict_one(&mut inner);
        }
        inner.pages.insert(number.0, Arc::clone(&page));
        inner.lru.push_back(number.0);
        Ok(page)
    }

    /// Evict the least recently used page that only the cache references.
    ///
    /// If every resident page is pinned by an outstanding view, no eviction
    /// happens and the cache temporarily exceeds its capacity.
    fn evict_one(&self, inner: &mut CacheInner) {
        let victim = inner.lru.iter().copied().find(|key| {
            inner
                .pages
                .get(key)
                .is_some_and(|page| Arc::strong_count(page) == 1)
        });
        match victim {
            Some(key) => {
                inner.pages.remove(&key);
                if let Some(pos) = inner.lru.iter().position(|k| *k == key) {
                    inner.lru.remove(pos);
                }
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(target: "e4s::block", page = key, "evict");
            }
            None => {
                debug!(
                    target: "e4s::block",
                    resident = inner.pages.len(),
                    capacity = self.capacity,
                    "all resident pages pinned; growing past capacity"
                );
            }
        }
    }

    /// View of `[block * block_size + byte_offset, (block + 1) * block_size)`.
    pub fn request(&self, block: BlockNumber, byte_offset: u32) -> Result<CachedBytes> {
        let bs = self.block_size.get();
        let byte_offset = byte_offset.min(bs);
        let len = (bs - byte_offset) as usize;
        self.request_bytes(block, byte_offset, len)
    }

    /// View of `len` bytes at `offset_in_block` within `block`.
    ///
    /// The range must lie within a single block (and therefore within a
    /// single page, since the block size divides the page size).
    pub fn request_bytes(
        &self,
        block: BlockNumber,
        offset_in_block: u32,
        len: usize,
    ) -> Result<CachedBytes> {
        let bs = u64::from(self.block_size.get());
        let abs = block.0.saturating_mul(bs) + u64::from(offset_in_block);
        debug_assert!(u64::from(offset_in_block) + len as u64 <= bs);

        let page_no = PageNumber::containing(ByteOffset(abs));
        let page = self.page(page_no)?;
        let start = (abs - page_no.start_byte().0) as usize;
        let end_abs = abs + len as u64;
        let ok = page.ok && self.damage.all_good(abs, end_abs);
        Ok(CachedBytes {
            page,
            start,
            len,
            ok,
            abs: ByteOffset(abs),
        })
    }

    /// Typed view of `S` at `offset_in_block` within `block`.
    pub fn request_struct<S: OnDisk>(
        &self,
        block: BlockNumber,
        offset_in_block: u32,
    ) -> Result<StructView<S>> {
        let view = self.request_bytes(block, offset_in_block, S::SIZE)?;
        Ok(StructView {
            value: S::decode(view.as_slice()),
            ok: view.ok,
            page: Some(view.page),
        })
    }

    /// Map `block_count` blocks starting at `physical_block`, page-aligned.
    ///
    /// The mapping bypasses the LRU cache entirely and is released when the
    /// returned handle drops.
    pub fn map_extent(&self, physical_block: BlockNumber, block_count: u64) -> Result<MappedExtent> {
        let bs = u64::from(self.block_size.get());
        let extent_bytes = block_count.saturating_mul(bs);
        let start = physical_block.0.saturating_mul(bs);
        let end = start.saturating_add(extent_bytes);

        let aligned_start = align_down(start, PAGE_SIZE as u64).unwrap_or(start);
        let aligned_end = align_up(end, PAGE_SIZE as u64).unwrap_or(end);
        let aligned_len = usize::try_from(aligned_end - aligned_start).map_err(|_| {
            e4s_types::ParseError::IntegerConversion {
                field: "mapped_extent_len",
            }
        })?;

        let mut buf = vec![0_u8; aligned_len];
        self.read_filled(aligned_start, &mut buf)?;
        let ok = self.damage.all_good(aligned_start, aligned_end);
        trace!(
            target: "e4s::block",
            physical_block = %physical_block,
            block_count,
            ok,
            "map extent"
        );
        Ok(MappedExtent {
            buf,
            extent_start: (start - aligned_start) as usize,
            extent_len: usize::try_from(extent_bytes).map_err(|_| {
                e4s_types::ParseError::IntegerConversion {
                    field: "mapped_extent_len",
                }
            })?,
            ok,
        })
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let leaked = inner
            .pages
            .values()
            .filter(|page| Arc::strong_count(page) > 1)
            .count() as u64;
        if leaked > 0 {
            self.stats.leaked_pages.store(leaked, Ordering::Relaxed);
            warn!(
                target: "e4s::block",
                leaked,
                "cache dropped while views still reference pages"
            );
        }
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("path", &self.path)
            .field("image_size", &self.image_size)
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

fn promote(lru: &mut VecDeque<u64>, key: u64) {
    if let Some(pos) = lru.iter().position(|k| *k == key) {
        lru.remove(pos);
    }
    lru.push_back(key);
}
