//! Region allocation backing buffer payloads.
//!
//! Payload bytes live in a flat address space handed out by a [RegionAllocator].
//! The descriptor layer ([crate::Buf]) stores offsets into that space as
//! cursors and never dereferences them itself, so any allocator that can hand
//! out non-overlapping ranges works. Regions are never individually freed:
//! the allocator is torn down wholesale when the owning connection closes,
//! which is what bounds the leak of any chain abandoned without triage.

use crate::Error;
use tracing::trace;

/// A contiguous range of bytes in a region allocator's address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// First byte of the region.
    pub start: u64,
    /// One past the last byte of the region.
    pub end: u64,
}

impl Region {
    /// Returns the length of the region in bytes.
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true if the region contains no bytes.
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Hands out raw regions from preallocated memory.
///
/// Implementations never free individual regions. If multiple connections
/// share one allocator, the implementation must be internally synchronized
/// or thread-confined; the chain layer itself assumes single-threaded access.
pub trait RegionAllocator {
    /// Allocates `size` bytes, failing if the backing memory is exhausted.
    fn allocate(&mut self, size: u64) -> Result<Region, Error>;
}

/// Fixed-capacity bump allocator over heap memory.
///
/// The backing storage is zero-initialized up front and sliced out linearly.
/// There is no deallocation: dropping the arena releases everything at once.
pub struct BumpArena {
    bytes: Vec<u8>,
    next: u64,
}

impl BumpArena {
    /// Creates an arena with `capacity` bytes of zeroed backing storage.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity],
            next: 0,
        }
    }

    /// Returns the number of bytes not yet handed out.
    pub const fn remaining(&self) -> u64 {
        self.bytes.len() as u64 - self.next
    }

    /// Returns the bytes in `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is inverted or extends past allocated space.
    pub fn slice(&self, start: u64, end: u64) -> &[u8] {
        assert!(start <= end, "inverted range");
        assert!(end <= self.next, "range extends past allocated space");
        &self.bytes[start as usize..end as usize]
    }

    /// Returns the bytes in `[start, end)` mutably.
    ///
    /// # Panics
    ///
    /// Panics if the range is inverted or extends past allocated space.
    pub fn slice_mut(&mut self, start: u64, end: u64) -> &mut [u8] {
        assert!(start <= end, "inverted range");
        assert!(end <= self.next, "range extends past allocated space");
        &mut self.bytes[start as usize..end as usize]
    }
}

impl RegionAllocator for BumpArena {
    fn allocate(&mut self, size: u64) -> Result<Region, Error> {
        let available = self.remaining();
        if size > available {
            trace!(size, available, "arena exhausted");
            return Err(Error::ArenaExhausted(size, available));
        }
        let start = self.next;
        self.next += size;
        Ok(Region {
            start,
            end: self.next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_allocation() {
        let mut arena = BumpArena::new(64);
        let a = arena.allocate(16).unwrap();
        let b = arena.allocate(48).unwrap();
        assert_eq!(a, Region { start: 0, end: 16 });
        assert_eq!(b, Region { start: 16, end: 64 });
        assert_eq!(a.len(), 16);
        assert_eq!(arena.remaining(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut arena = BumpArena::new(10);
        arena.allocate(8).unwrap();
        assert!(matches!(
            arena.allocate(4),
            Err(Error::ArenaExhausted(4, 2))
        ));
        // A fitting request still succeeds after a failed one.
        assert_eq!(arena.allocate(2).unwrap(), Region { start: 8, end: 10 });
    }

    #[test]
    fn test_zero_sized_region() {
        let mut arena = BumpArena::new(0);
        let r = arena.allocate(0).unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn test_slice_access() {
        let mut arena = BumpArena::new(8);
        let r = arena.allocate(4).unwrap();
        arena.slice_mut(r.start, r.end).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(arena.slice(r.start, r.end), &[1, 2, 3, 4]);
        assert_eq!(arena.slice(1, 3), &[2, 3]);
    }

    #[test]
    #[should_panic(expected = "range extends past allocated space")]
    fn test_slice_past_allocated() {
        let mut arena = BumpArena::new(8);
        arena.allocate(4).unwrap();
        arena.slice(0, 5);
    }
}
