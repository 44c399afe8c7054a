//! Zero-copy buffer chains for scatter-gather output pipelines.
//!
//! # Overview
//!
//! This crate is the buffer-chain substrate underneath a high-throughput
//! server's output path. A [Buf] describes one contiguous extent of data
//! (memory-resident, file-resident, or a payload-free control marker) and a
//! chain is a singly-linked sequence of [Buf] references passed between
//! processing stages without copying payload bytes. A connection-scoped
//! [Pool] owns the descriptors, the link cells, and the region allocator
//! backing payload memory; everything is reclaimed wholesale when the pool
//! is dropped, and in steady state link cells and drained buffers circulate
//! through free-lists instead of being reallocated.
//!
//! The primitives an output pipeline composes on every write:
//! - [Pool::get_free_buf] hands a stage a buffer to write into, preferring
//!   recycled ones;
//! - [Pool::update_chains] is the free/busy/out triage that reclassifies
//!   links once their bytes are fully consumed, recycling only buffers
//!   carrying the caller's [OwnerTag];
//! - [Pool::coalesce_file] batches byte-contiguous on-disk extents across
//!   links into one I/O-sized range;
//! - [Pool::update_sent] advances per-buffer cursors after a (possibly
//!   partial) send.
//!
//! None of these operations block, suspend, or perform I/O; issuing the
//! actual reads and writes belongs to the [ChainFilter] and [ChainWriter]
//! collaborators. A pool serves a single connection and is not synchronized.
//!
//! # Example
//!
//! ```
//! use outflow_chain::{BumpArena, Pool, PoolConfig, OwnerTag};
//! use prometheus_client::registry::Registry;
//!
//! let mut registry = Registry::default();
//! let mut pool = Pool::new(BumpArena::new(1024), PoolConfig::default(), &mut registry);
//!
//! // Stage a 10-byte buffer and fill it.
//! let chain = pool.create_chain_of_bufs(1, 10).unwrap();
//! let head = chain.unwrap();
//! let buf = pool.link_buf(head);
//! let mut payload: &[u8] = b"hello";
//! pool.fill_buf(buf, &mut payload);
//! assert_eq!(pool.pending_bytes(buf), b"hello");
//!
//! // The network writer reports a partial send; cursors advance.
//! let rest = pool.update_sent(chain, 3);
//! assert_eq!(rest, chain);
//! assert_eq!(pool.pending_bytes(buf), b"lo");
//!
//! // Once everything is sent, nothing remains.
//! assert_eq!(pool.update_sent(rest, 2), None);
//! ```

use thiserror::Error;

mod arena;
mod buf;
mod chain;
mod pool;

pub use arena::{BumpArena, Region, RegionAllocator};
pub use buf::{Buf, BufId, BufKind, FileId, OwnerTag};
pub use pool::{Chain, ChainIter, LinkId, Pool, PoolConfig};

/// Errors that can occur when allocating from a pool.
///
/// Allocation exhaustion is the only real failure class: no operation
/// raises on malformed input (mismatched tags, already-consumed buffers),
/// and no failure leaves a pool structurally corrupted: multi-step builds
/// terminate any already-linked prefix before surfacing the error.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("arena exhausted: requested {0} bytes, {1} available")]
    ArenaExhausted(u64, u64), // requested, available
    #[error("descriptor slab exhausted: cap {0}")]
    BufsExhausted(usize),
    #[error("link slab exhausted: cap {0}")]
    LinksExhausted(usize),
    #[error("offset overflow")]
    OffsetOverflow,
}

/// A chain-transforming stage in the output pipeline.
///
/// Filters decide when to copy into temporary buffers or stage file reads;
/// they build their output with [Pool::get_free_buf] and recycle it with
/// [Pool::update_chains], identifying themselves with their tag.
pub trait ChainFilter<A: RegionAllocator> {
    /// Identity used for triage ownership checks.
    fn tag(&self) -> OwnerTag;

    /// Absorbs `input` into the filter's pending output.
    fn filter(&mut self, pool: &mut Pool<A>, input: Chain) -> Result<(), Error>;
}

/// The stage that moves chains onto the wire.
///
/// Writers consume extents batched by [Pool::coalesce_file] and report
/// transmitted bytes through [Pool::update_sent], identifying themselves
/// with their tag.
pub trait ChainWriter<A: RegionAllocator> {
    /// Identity used for triage ownership checks.
    fn tag(&self) -> OwnerTag;

    /// Writes as much of `chain` as possible, returning the unconsumed
    /// suffix.
    fn write(&mut self, pool: &mut Pool<A>, chain: Chain) -> Result<Chain, Error>;
}
