//! Buffer descriptors.
//!
//! A [Buf] describes one contiguous extent of data, resident in memory (a
//! window into region-allocator space), on disk (a window into a file), or
//! neither (a control marker carrying a flush/end-of-stream signal and no
//! bytes). Classification is derived from the flags and cursors on every
//! call, never stored, so it cannot go stale when a producer flips flags
//! mid-construction. A descriptor may legitimately be both memory- and
//! file-resident while a producer is staging it; consumers then treat the
//! memory side as authoritative for size accounting.

/// Index of a buffer descriptor in its pool's descriptor slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufId(pub(crate) u32);

impl BufId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Opaque identity of the stage that owns a buffer's payload semantics.
///
/// Tags are compared during triage and never dereferenced: a pool only
/// recycles buffers carrying its caller's tag, so chains may freely mix
/// buffers produced by different stages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OwnerTag(u64);

impl OwnerTag {
    /// The untagged identity carried by zeroed descriptors.
    pub const NONE: Self = Self(0);

    /// Creates a tag from an arbitrary stage identity.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Opaque identity of a file object.
///
/// The chain layer never touches the file itself; it only compares
/// identities when deciding whether two on-disk extents can be submitted
/// as one I/O operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(u64);

impl FileId {
    /// Creates a file identity from an arbitrary handle value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Closed set of derived buffer states for downstream matching.
///
/// The flags on [Buf] remain the source of truth; this enum is recomputed
/// by [Buf::kind] on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufKind {
    /// Carries no bytes, only control signaling (flush, sync, end of stream).
    Special,
    /// Memory-resident only.
    Memory,
    /// File-resident only.
    File,
    /// Both memory- and file-resident (transient, producer-side staging).
    Mixed,
    /// Neither payload nor control signaling.
    Empty,
}

/// Describes one contiguous extent of data.
///
/// Cursor pairs are half-open windows: `[pos, last)` into memory for the
/// bytes still pending consumption, `[file_pos, file_last)` into a file.
/// `[start, end)` bounds the full backing allocation; recycling resets the
/// active window back to `start` without touching the allocation.
///
/// The zero value (`Buf::default()`) is the blank descriptor every
/// constructor starts from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Buf {
    /// Start of the pending memory window.
    pub pos: u64,
    /// End of the pending memory window.
    pub last: u64,
    /// Start of the pending file window.
    pub file_pos: u64,
    /// End of the pending file window.
    pub file_last: u64,

    /// Start of the backing allocation.
    pub start: u64,
    /// End of the backing allocation.
    pub end: u64,
    /// Identity of the stage owning this buffer's payload semantics.
    pub tag: OwnerTag,
    /// File this buffer's on-disk extent lives in, if any. Borrowed identity;
    /// the chain layer owns nothing about the file.
    pub file: Option<FileId>,
    /// Descriptor aliasing the same underlying bytes, if any.
    ///
    /// Shadows point at each other and neither owns the bytes: exactly one
    /// side is responsible for the backing allocation's lifetime, chosen by
    /// the call site that created the alias. This field expresses the
    /// aliasing relationship, never a release obligation.
    pub shadow: Option<BufId>,

    /// Memory window contents may be modified in place.
    pub temporary: bool,
    /// Memory window is cache-sourced or otherwise read-only.
    pub memory: bool,
    /// Memory window is memory-mapped and must not be modified.
    pub mmap: bool,
    /// Buffer may be recycled by downstream stages.
    pub recycled: bool,
    /// Buffer carries an on-disk extent.
    pub in_file: bool,
    /// Downstream must flush everything buffered up to here.
    pub flush: bool,
    /// Downstream may block to complete the flush.
    pub sync: bool,
    /// Last buffer of the whole output stream.
    pub last_buf: bool,
    /// Last buffer of the chain it currently sits in.
    pub last_in_chain: bool,
    /// Last of the shadow views onto the underlying bytes.
    pub last_shadow: bool,
    /// Backing bytes live in a temporary file.
    pub temp_file: bool,
}

impl Buf {
    /// Returns true if the buffer carries a memory-resident window.
    pub const fn in_memory(&self) -> bool {
        self.temporary || self.memory || self.mmap
    }

    /// Returns true if the buffer is memory-resident and not file-resident.
    pub const fn in_memory_only(&self) -> bool {
        self.in_memory() && !self.in_file
    }

    /// Returns true if the buffer is a control marker: it signals flush,
    /// sync, or end of stream and carries no bytes on either side.
    pub const fn is_special(&self) -> bool {
        (self.flush || self.last_buf || self.sync) && !self.in_memory() && !self.in_file
    }

    /// Returns true if the buffer signals sync and nothing else.
    pub const fn sync_only(&self) -> bool {
        self.sync && !self.in_memory() && !self.in_file && !self.flush && !self.last_buf
    }

    /// Returns the number of bytes pending consumption.
    ///
    /// Memory residency takes priority: a buffer that is both memory- and
    /// file-resident reports its memory window.
    pub const fn size(&self) -> u64 {
        if self.in_memory() {
            self.last - self.pos
        } else {
            self.file_last - self.file_pos
        }
    }

    /// Returns the derived state for downstream matching.
    pub const fn kind(&self) -> BufKind {
        if self.is_special() {
            BufKind::Special
        } else if self.in_memory() && self.in_file {
            BufKind::Mixed
        } else if self.in_memory() {
            BufKind::Memory
        } else if self.in_file {
            BufKind::File
        } else {
            BufKind::Empty
        }
    }

    /// Resets the active memory window back to the start of the backing
    /// allocation, making the full allocation writable again.
    pub fn reset(&mut self) {
        self.pos = self.start;
        self.last = self.start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_buf(pos: u64, last: u64) -> Buf {
        Buf {
            pos,
            last,
            start: pos,
            end: last,
            temporary: true,
            ..Buf::default()
        }
    }

    fn file_buf(file_pos: u64, file_last: u64) -> Buf {
        Buf {
            file_pos,
            file_last,
            file: Some(FileId::new(3)),
            in_file: true,
            ..Buf::default()
        }
    }

    #[test]
    fn test_residency_predicates() {
        let b = mem_buf(0, 10);
        assert!(b.in_memory());
        assert!(b.in_memory_only());
        assert!(!b.is_special());
        assert_eq!(b.size(), 10);
        assert_eq!(b.kind(), BufKind::Memory);

        let b = file_buf(100, 250);
        assert!(!b.in_memory());
        assert!(!b.in_memory_only());
        assert_eq!(b.size(), 150);
        assert_eq!(b.kind(), BufKind::File);

        // Read-only and mapped memory count as memory-resident too.
        let setters: [fn(&mut Buf); 2] = [|b| b.memory = true, |b| b.mmap = true];
        for set in setters {
            let mut b = Buf {
                pos: 4,
                last: 9,
                ..Buf::default()
            };
            set(&mut b);
            assert!(b.in_memory());
            assert_eq!(b.size(), 5);
        }
    }

    #[test]
    fn test_mixed_prefers_memory_size() {
        let mut b = mem_buf(0, 10);
        b.in_file = true;
        b.file_pos = 0;
        b.file_last = 999;
        assert_eq!(b.kind(), BufKind::Mixed);
        assert!(!b.in_memory_only());
        // Memory residency wins for size accounting.
        assert_eq!(b.size(), 10);
    }

    #[test]
    fn test_special_markers() {
        let setters: [fn(&mut Buf); 3] =
            [|b| b.flush = true, |b| b.last_buf = true, |b| b.sync = true];
        for set in setters {
            let mut b = Buf::default();
            set(&mut b);
            assert!(b.is_special());
            assert_eq!(b.size(), 0);
            assert_eq!(b.kind(), BufKind::Special);
        }

        // A flush marker with memory residency is not special.
        let mut b = mem_buf(0, 10);
        b.flush = true;
        assert!(!b.is_special());

        // Nor is one with file residency.
        let mut b = file_buf(0, 10);
        b.last_buf = true;
        assert!(!b.is_special());
    }

    #[test]
    fn test_sync_only() {
        let mut b = Buf::default();
        b.sync = true;
        assert!(b.sync_only());
        b.flush = true;
        assert!(!b.sync_only());
    }

    #[test]
    fn test_blank_is_empty() {
        let b = Buf::default();
        assert!(!b.in_memory());
        assert!(!b.is_special());
        assert_eq!(b.size(), 0);
        assert_eq!(b.kind(), BufKind::Empty);
        assert_eq!(b.tag, OwnerTag::NONE);
    }

    #[test]
    fn test_reset_restores_full_window() {
        let mut b = Buf {
            pos: 7,
            last: 7,
            start: 4,
            end: 16,
            temporary: true,
            ..Buf::default()
        };
        b.reset();
        assert_eq!((b.pos, b.last), (4, 4));
        assert_eq!(b.end, 16);
    }
}
