//! Connection-scoped pool of buffer descriptors and chain links.
//!
//! A [Pool] owns everything a connection's output pipeline allocates: the
//! region allocator for payload bytes, a slab of [Buf] descriptors, and a
//! slab of link cells threaded into singly-linked chains. Nothing is freed
//! individually. Descriptors keep their slab slot for the pool's lifetime,
//! and link cells circulate through a pool-local free-list because they are
//! allocated and released far more often than buffers. Dropping the pool
//! tears everything down wholesale.
//!
//! # Thread Safety
//!
//! A pool serves one connection and is not synchronized. All operations are
//! bounded-time data-structure manipulations; none block or perform I/O.

use crate::{Buf, BufId, BumpArena, Error, Region, RegionAllocator};
use bytes::Buf as BytesBuf;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use tracing::{debug, trace};

/// Returns the system page size.
///
/// On Unix systems, queries the actual page size via `sysconf`.
/// On other systems (Windows), defaults to 4KB.
#[cfg(unix)]
fn page_size() -> u64 {
    // SAFETY: sysconf is safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096 // Safe fallback if sysconf fails
    } else {
        size as u64
    }
}

#[cfg(not(unix))]
fn page_size() -> u64 {
    4096
}

/// Index of a link cell in its pool's link slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LinkId(pub(crate) u32);

impl LinkId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Head of a singly-linked chain of links; `None` is the terminal.
pub type Chain = Option<LinkId>;

/// A link cell: one descriptor reference plus the next cell in the chain.
///
/// Cells on the pool free-list keep a stale `buf` reference; it is
/// overwritten when the cell is reassigned.
pub(crate) struct Link {
    pub(crate) buf: BufId,
    pub(crate) next: Chain,
}

/// Configuration for a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of buffer descriptors.
    pub max_bufs: usize,
    /// Maximum number of link cells.
    pub max_links: usize,
    /// I/O page size, used to round coalesced file extents up to page
    /// granularity. Must be a nonzero power of two.
    pub page_size: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_bufs: 65_536,
            max_links: 65_536,
            page_size: page_size(),
        }
    }
}

impl PoolConfig {
    /// Validates the configuration, panicking on invalid values.
    ///
    /// # Panics
    ///
    /// - `page_size` is not a power of two
    /// - `max_bufs` or `max_links` is zero or exceeds `u32::MAX`
    fn validate(&self) {
        assert!(
            self.page_size.is_power_of_two(),
            "page_size must be a power of two"
        );
        assert!(
            self.max_bufs > 0 && self.max_bufs <= u32::MAX as usize,
            "max_bufs must be in 1..=u32::MAX"
        );
        assert!(
            self.max_links > 0 && self.max_links <= u32::MAX as usize,
            "max_links must be in 1..=u32::MAX"
        );
    }
}

/// Metrics for a pool.
pub(crate) struct PoolMetrics {
    /// Total number of buffer descriptors created.
    pub(crate) bufs_allocated: Counter,
    /// Total number of link cells created fresh from the slab.
    pub(crate) links_allocated: Counter,
    /// Total number of link cells reused from the pool free-list.
    pub(crate) links_recycled: Counter,
    /// Total number of buffers reset and recycled by triage.
    pub(crate) bufs_recycled: Counter,
    /// Total number of allocations refused because a cap was reached.
    pub(crate) exhaustions: Counter,
}

impl PoolMetrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            bufs_allocated: Counter::default(),
            links_allocated: Counter::default(),
            links_recycled: Counter::default(),
            bufs_recycled: Counter::default(),
            exhaustions: Counter::default(),
        };

        registry.register(
            "chain_bufs_allocated",
            "Total number of buffer descriptors created",
            metrics.bufs_allocated.clone(),
        );
        registry.register(
            "chain_links_allocated",
            "Total number of link cells created fresh",
            metrics.links_allocated.clone(),
        );
        registry.register(
            "chain_links_recycled",
            "Total number of link cells reused from the pool free-list",
            metrics.links_recycled.clone(),
        );
        registry.register(
            "chain_bufs_recycled",
            "Total number of buffers reset and recycled by triage",
            metrics.bufs_recycled.clone(),
        );
        registry.register(
            "chain_exhaustions",
            "Total number of allocations refused because a cap was reached",
            metrics.exhaustions.clone(),
        );

        metrics
    }
}

/// Connection-scoped pool of descriptors and chain links.
///
/// All chain operations live here because links are slab cells: walking a
/// chain means following indices through the pool.
pub struct Pool<A: RegionAllocator> {
    pub(crate) arena: A,
    pub(crate) config: PoolConfig,
    pub(crate) bufs: Vec<Buf>,
    pub(crate) links: Vec<Link>,
    /// Pool-local free-list of recycled link cells.
    pub(crate) free: Chain,
    pub(crate) metrics: PoolMetrics,
}

impl<A: RegionAllocator> Pool<A> {
    /// Creates a pool over `arena`, registering its metrics.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(arena: A, config: PoolConfig, registry: &mut Registry) -> Self {
        config.validate();
        debug!(
            max_bufs = config.max_bufs,
            max_links = config.max_links,
            page_size = config.page_size,
            "created pool"
        );
        Self {
            arena,
            metrics: PoolMetrics::new(registry),
            bufs: Vec::new(),
            links: Vec::new(),
            free: None,
            config,
        }
    }

    /// Creates a blank (all-zero) buffer descriptor.
    pub fn create_buf(&mut self) -> Result<BufId, Error> {
        if self.bufs.len() >= self.config.max_bufs {
            trace!(cap = self.config.max_bufs, "descriptor slab exhausted");
            self.metrics.exhaustions.inc();
            return Err(Error::BufsExhausted(self.config.max_bufs));
        }
        let id = BufId(self.bufs.len() as u32);
        self.bufs.push(Buf::default());
        self.metrics.bufs_allocated.inc();
        Ok(id)
    }

    /// Creates a writable buffer backed by `size` fresh bytes from the arena.
    ///
    /// The active window starts empty at the head of the backing region:
    /// `start == pos == last` and `end == start + size`.
    pub fn create_temp_buf(&mut self, size: u64) -> Result<BufId, Error> {
        let Region { start, end } = self.arena.allocate(size)?;
        let id = self.create_buf()?;
        let b = &mut self.bufs[id.index()];
        b.start = start;
        b.pos = start;
        b.last = start;
        b.end = end;
        b.temporary = true;
        Ok(id)
    }

    /// Creates a descriptor aliasing the same bytes as `src`.
    ///
    /// Both descriptors end up pointing at each other through their `shadow`
    /// fields, and the new view is marked [Buf::last_shadow]. Neither side
    /// owns the bytes: the call site that creates the alias decides which
    /// side is responsible for the backing allocation's lifetime.
    pub fn create_shadow(&mut self, src: BufId) -> Result<BufId, Error> {
        let id = self.create_buf()?;
        let mut view = self.bufs[src.index()];
        view.shadow = Some(src);
        view.last_shadow = true;
        self.bufs[id.index()] = view;
        let original = &mut self.bufs[src.index()];
        original.shadow = Some(id);
        original.last_shadow = false;
        Ok(id)
    }

    /// Allocates a link cell referencing `buf`, reusing a recycled cell when
    /// one is available (O(1), no allocation). The returned cell's `next` is
    /// always cleared.
    pub fn alloc_chain_link(&mut self, buf: BufId) -> Result<LinkId, Error> {
        if let Some(cl) = self.free {
            self.free = self.links[cl.index()].next;
            self.links[cl.index()] = Link { buf, next: None };
            self.metrics.links_recycled.inc();
            return Ok(cl);
        }
        if self.links.len() >= self.config.max_links {
            trace!(cap = self.config.max_links, "link slab exhausted");
            self.metrics.exhaustions.inc();
            return Err(Error::LinksExhausted(self.config.max_links));
        }
        let id = LinkId(self.links.len() as u32);
        self.links.push(Link { buf, next: None });
        self.metrics.links_allocated.inc();
        Ok(id)
    }

    /// Returns a link cell to the pool free-list (O(1)).
    ///
    /// The referenced buffer is untouched; the cell keeps a stale reference
    /// to it until the cell is reassigned.
    pub fn free_chain_link(&mut self, link: LinkId) {
        self.links[link.index()].next = self.free;
        self.free = Some(link);
    }

    /// Pops the head of the caller's `free` chain with `next` cleared, or
    /// allocates a fresh link around a blank descriptor.
    ///
    /// This is the standard entry point for any stage that needs a buffer to
    /// write into: links recycled by triage come back with their (reset)
    /// buffers still attached, so reuse is preferred over allocation.
    pub fn get_free_buf(&mut self, free: &mut Chain) -> Result<LinkId, Error> {
        if let Some(cl) = *free {
            *free = self.links[cl.index()].next;
            self.links[cl.index()].next = None;
            return Ok(cl);
        }
        let buf = self.create_buf()?;
        self.alloc_chain_link(buf)
    }

    /// Returns the descriptor `id` refers to.
    pub fn buf(&self, id: BufId) -> &Buf {
        &self.bufs[id.index()]
    }

    /// Returns the descriptor `id` refers to, mutably.
    pub fn buf_mut(&mut self, id: BufId) -> &mut Buf {
        &mut self.bufs[id.index()]
    }

    /// Returns the descriptor referenced by `link`.
    pub fn link_buf(&self, link: LinkId) -> BufId {
        self.links[link.index()].buf
    }

    /// Points `link` at a different descriptor.
    pub fn set_link_buf(&mut self, link: LinkId, buf: BufId) {
        self.links[link.index()].buf = buf;
    }

    /// Returns the link following `link`, if any.
    pub fn next(&self, link: LinkId) -> Chain {
        self.links[link.index()].next
    }

    /// Sets the link following `link`.
    pub fn set_next(&mut self, link: LinkId, next: Chain) {
        self.links[link.index()].next = next;
    }

    /// Iterates over the links of `chain` in producer order.
    pub fn iter(&self, chain: Chain) -> ChainIter<'_, A> {
        ChainIter {
            pool: self,
            cursor: chain,
        }
    }

    /// Returns a reference to the region allocator.
    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Returns a mutable reference to the region allocator.
    pub fn arena_mut(&mut self) -> &mut A {
        &mut self.arena
    }
}

impl Pool<BumpArena> {
    /// Returns the bytes of `buf`'s pending memory window `[pos, last)`.
    pub fn pending_bytes(&self, buf: BufId) -> &[u8] {
        let b = &self.bufs[buf.index()];
        self.arena.slice(b.pos, b.last)
    }

    /// Copies bytes from `src` into the unused tail of `buf`'s backing
    /// region, advancing `last`. Returns the number of bytes copied, which
    /// is the smaller of `src.remaining()` and the free space `end - last`.
    pub fn fill_buf(&mut self, buf: BufId, src: &mut impl BytesBuf) -> u64 {
        let b = self.bufs[buf.index()];
        let n = (b.end - b.last).min(src.remaining() as u64) as usize;
        let dst = self.arena.slice_mut(b.last, b.last + n as u64);
        let mut copied = 0;
        while copied < n {
            let chunk = src.chunk();
            let take = chunk.len().min(n - copied);
            dst[copied..copied + take].copy_from_slice(&chunk[..take]);
            src.advance(take);
            copied += take;
        }
        self.bufs[buf.index()].last += n as u64;
        n as u64
    }
}

/// Iterator over the links of a chain.
pub struct ChainIter<'a, A: RegionAllocator> {
    pool: &'a Pool<A>,
    cursor: Chain,
}

impl<A: RegionAllocator> Iterator for ChainIter<'_, A> {
    type Item = LinkId;

    fn next(&mut self) -> Option<Self::Item> {
        let cl = self.cursor?;
        self.cursor = self.pool.next(cl);
        Some(cl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BumpArena;

    fn pool(capacity: usize) -> Pool<BumpArena> {
        let mut registry = Registry::default();
        Pool::new(
            BumpArena::new(capacity),
            PoolConfig::default(),
            &mut registry,
        )
    }

    fn tiny_pool(capacity: usize, max_bufs: usize, max_links: usize) -> Pool<BumpArena> {
        let mut registry = Registry::default();
        Pool::new(
            BumpArena::new(capacity),
            PoolConfig {
                max_bufs,
                max_links,
                page_size: 4096,
            },
            &mut registry,
        )
    }

    #[test]
    fn test_create_temp_buf() {
        let mut pool = pool(128);
        let id = pool.create_temp_buf(64).unwrap();
        let b = pool.buf(id);
        assert_eq!((b.start, b.pos, b.last, b.end), (0, 0, 0, 64));
        assert!(b.temporary);
        assert_eq!(b.size(), 0);

        // A second buffer slices the next region.
        let id = pool.create_temp_buf(64).unwrap();
        assert_eq!(pool.buf(id).start, 64);

        // Arena is now exhausted.
        assert!(matches!(
            pool.create_temp_buf(1),
            Err(Error::ArenaExhausted(1, 0))
        ));
    }

    #[test]
    fn test_link_cell_recycling() {
        let mut pool = pool(0);
        let a = pool.create_buf().unwrap();
        let b = pool.create_buf().unwrap();
        let cl = pool.alloc_chain_link(a).unwrap();

        // Freeing then allocating reuses the same cell with a fresh buf and
        // a cleared next.
        pool.free_chain_link(cl);
        let reused = pool.alloc_chain_link(b).unwrap();
        assert_eq!(reused, cl);
        assert_eq!(pool.link_buf(reused), b);
        assert_eq!(pool.next(reused), None);

        // Free-list is LIFO.
        let other = pool.alloc_chain_link(a).unwrap();
        pool.free_chain_link(cl);
        pool.free_chain_link(other);
        assert_eq!(pool.alloc_chain_link(a).unwrap(), other);
        assert_eq!(pool.alloc_chain_link(a).unwrap(), cl);
    }

    #[test]
    fn test_slab_caps() {
        let mut pool = tiny_pool(0, 1, 1);
        let buf = pool.create_buf().unwrap();
        assert!(matches!(pool.create_buf(), Err(Error::BufsExhausted(1))));
        let cl = pool.alloc_chain_link(buf).unwrap();
        assert!(matches!(
            pool.alloc_chain_link(buf),
            Err(Error::LinksExhausted(1))
        ));

        // Recycled cells do not count against the cap.
        pool.free_chain_link(cl);
        assert_eq!(pool.alloc_chain_link(buf).unwrap(), cl);
    }

    #[test]
    fn test_get_free_buf_prefers_free_chain() {
        let mut pool = pool(32);
        let buf = pool.create_temp_buf(32).unwrap();
        let cl = pool.alloc_chain_link(buf).unwrap();

        let mut free = Some(cl);
        let got = pool.get_free_buf(&mut free).unwrap();
        assert_eq!(got, cl);
        assert_eq!(pool.link_buf(got), buf);
        assert_eq!(free, None);

        // Empty free chain falls back to a fresh blank descriptor.
        let fresh = pool.get_free_buf(&mut free).unwrap();
        assert_ne!(fresh, cl);
        assert_eq!(*pool.buf(pool.link_buf(fresh)), Buf::default());

        // A stage can point the link at an existing descriptor instead.
        pool.set_link_buf(fresh, buf);
        assert_eq!(pool.link_buf(fresh), buf);
    }

    #[test]
    fn test_create_shadow() {
        let mut pool = pool(16);
        let src = pool.create_temp_buf(16).unwrap();
        let view = pool.create_shadow(src).unwrap();

        assert_eq!(pool.buf(view).shadow, Some(src));
        assert_eq!(pool.buf(src).shadow, Some(view));
        assert!(pool.buf(view).last_shadow);
        assert!(!pool.buf(src).last_shadow);
        // The view shares the backing window.
        assert_eq!(pool.buf(view).start, pool.buf(src).start);
        assert_eq!(pool.buf(view).end, pool.buf(src).end);
    }

    #[test]
    fn test_fill_and_pending_bytes() {
        let mut pool = pool(8);
        let buf = pool.create_temp_buf(8).unwrap();

        let mut src: &[u8] = b"hello world";
        let copied = pool.fill_buf(buf, &mut src);
        assert_eq!(copied, 8);
        assert_eq!(pool.pending_bytes(buf), b"hello wo");
        assert_eq!(pool.buf(buf).size(), 8);
        // The source was only advanced by what fit.
        assert_eq!(src, b"rld");

        // A full buffer accepts nothing more.
        assert_eq!(pool.fill_buf(buf, &mut src), 0);
    }

    #[test]
    #[should_panic(expected = "page_size must be a power of two")]
    fn test_invalid_page_size() {
        let mut registry = Registry::default();
        Pool::new(
            BumpArena::new(0),
            PoolConfig {
                max_bufs: 1,
                max_links: 1,
                page_size: 1000,
            },
            &mut registry,
        );
    }
}
