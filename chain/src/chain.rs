//! Chain construction, recycling triage, file-region coalescing, and
//! send-progress accounting.
//!
//! These are the primitives an output pipeline composes on every write:
//! producers build or extend chains without copying payload bytes, the
//! writer reports how many bytes actually left the socket, and the triage
//! reclassifies fully-drained links so their cells and buffers can be
//! reused. All operations are bounded-time walks over slab indices; none
//! allocate on the hot path beyond the pool's own free-lists.

use crate::{Chain, Error, LinkId, OwnerTag, Pool, RegionAllocator};
use tracing::trace;

impl<A: RegionAllocator> Pool<A> {
    /// Builds a chain of `count` writable buffers of `size` bytes each,
    /// backed by a single `count * size` region sliced contiguously.
    ///
    /// Returns `Ok(None)` when `count` is zero. Failure is atomic from the
    /// caller's perspective: no partial chain is ever returned, and any
    /// links built before the failure go back to the pool free-list. (The
    /// bulk region and any descriptors built before the failure stay in the
    /// arena until teardown, like every other allocation.)
    pub fn create_chain_of_bufs(&mut self, count: usize, size: u64) -> Result<Chain, Error> {
        if count == 0 {
            return Ok(None);
        }
        let total = (count as u64)
            .checked_mul(size)
            .ok_or(Error::OffsetOverflow)?;
        let region = self.arena.allocate(total)?;

        let mut head: Chain = None;
        let mut tail: Option<LinkId> = None;
        let mut p = region.start;
        for _ in 0..count {
            let buf = match self.create_buf() {
                Ok(buf) => buf,
                Err(err) => {
                    self.discard(head);
                    return Err(err);
                }
            };
            {
                let b = &mut self.bufs[buf.index()];
                b.pos = p;
                b.last = p;
                b.start = p;
                p += size;
                b.end = p;
                b.temporary = true;
            }
            let cl = match self.alloc_chain_link(buf) {
                Ok(cl) => cl,
                Err(err) => {
                    self.discard(head);
                    return Err(err);
                }
            };
            match tail {
                None => head = Some(cl),
                Some(t) => self.links[t.index()].next = Some(cl),
            }
            tail = Some(cl);
        }
        Ok(head)
    }

    /// Returns every link cell of `chain` to the pool free-list.
    fn discard(&mut self, mut chain: Chain) {
        while let Some(cl) = chain {
            chain = self.next(cl);
            self.free_chain_link(cl);
        }
    }

    /// Appends shallow copies of every link in `src` to the tail of `chain`:
    /// new link cells, same buffer references. Buffers are not duplicated,
    /// so both chains see cursor movement on the shared descriptors.
    ///
    /// On mid-append allocation failure `chain` keeps the links appended so
    /// far and remains correctly terminated, so the caller can discard or
    /// partially use it.
    pub fn chain_add_copy(&mut self, chain: &mut Chain, src: Chain) -> Result<(), Error> {
        let mut tail: Option<LinkId> = None;
        let mut cursor = *chain;
        while let Some(cl) = cursor {
            tail = Some(cl);
            cursor = self.next(cl);
        }

        let mut cursor = src;
        while let Some(scl) = cursor {
            let buf = self.link_buf(scl);
            let cl = self.alloc_chain_link(buf)?;
            match tail {
                None => *chain = Some(cl),
                Some(t) => self.links[t.index()].next = Some(cl),
            }
            tail = Some(cl);
            cursor = self.next(scl);
        }
        Ok(())
    }

    /// Reclassifies chain links as consumption completes.
    ///
    /// Newly produced links in `out` are appended to the tail of `busy`
    /// (consumption is monotonic from `busy`'s head, so production order is
    /// preserved). Then `busy` is drained from the head: the walk stops at
    /// the first link whose buffer still has pending bytes. A drained head
    /// carrying a foreign tag is detached and its cell returned to the pool
    /// free-list. The buffer itself is abandoned without a reset; the owning
    /// stage must reclaim it through its own triage. A drained head carrying the
    /// caller's `tag` has its window reset to the start of its backing
    /// allocation and is pushed onto `free` for reuse via
    /// [Pool::get_free_buf].
    pub fn update_chains(&mut self, free: &mut Chain, busy: &mut Chain, out: &mut Chain, tag: OwnerTag) {
        if out.is_some() {
            match *busy {
                None => *busy = *out,
                Some(head) => {
                    let mut tail = head;
                    while let Some(n) = self.next(tail) {
                        tail = n;
                    }
                    self.links[tail.index()].next = *out;
                }
            }
            *out = None;
        }

        let mut recycled = 0;
        let mut abandoned = 0;
        while let Some(cl) = *busy {
            let buf = self.link_buf(cl);
            if self.bufs[buf.index()].size() != 0 {
                break;
            }

            if self.bufs[buf.index()].tag != tag {
                *busy = self.next(cl);
                self.free_chain_link(cl);
                abandoned += 1;
                continue;
            }

            self.bufs[buf.index()].reset();
            *busy = self.next(cl);
            self.links[cl.index()].next = *free;
            *free = Some(cl);
            recycled += 1;
        }
        if recycled > 0 || abandoned > 0 {
            trace!(recycled, abandoned, "triaged busy chain");
            self.metrics.bufs_recycled.inc_by(recycled);
        }
    }

    /// Accumulates byte-contiguous on-disk extents from the head of `chain`
    /// into one batch of at most `limit` bytes, for submission as a single
    /// I/O operation.
    ///
    /// Accumulation continues while each next link is file-resident, on the
    /// same file, starts exactly where the previous extent ended, and the
    /// running total stays under `limit`. When `limit` lands mid-extent, the
    /// final extent is capped to fit and then rounded up to the next I/O
    /// page boundary if that does not overshoot the link's own valid
    /// region, so for a non-page-aligned `limit` the batch can exceed it by
    /// less than one page.
    ///
    /// Rewrites `chain` to the first link not absorbed into the batch
    /// (`None` if every link was absorbed) and returns the batch size. A
    /// chain whose head is not file-resident is left untouched and reports
    /// zero.
    pub fn coalesce_file(&self, chain: &mut Chain, limit: u64) -> u64 {
        let Some(head) = *chain else {
            return 0;
        };
        let first = self.buf(self.link_buf(head));
        let Some(fd) = first.file else {
            return 0;
        };
        debug_assert!(first.in_file, "coalescing a chain with a non-file head");

        let page = self.config.page_size;
        let mut total = 0;
        let mut cl = head;
        loop {
            let b = self.buf(self.link_buf(cl));
            let mut size = b.file_last - b.file_pos;

            if size > limit - total {
                size = limit - total;
                let aligned = (b.file_pos + size).next_multiple_of(page);
                if aligned <= b.file_last {
                    size = aligned - b.file_pos;
                }
                total += size;
                *chain = Some(cl);
                return total;
            }

            total += size;
            let fprev = b.file_pos + size;

            match self.next(cl) {
                None => {
                    *chain = None;
                    return total;
                }
                Some(n) => {
                    let nb = self.buf(self.link_buf(n));
                    if nb.in_file && total < limit && nb.file == Some(fd) && nb.file_pos == fprev {
                        cl = n;
                    } else {
                        *chain = Some(n);
                        return total;
                    }
                }
            }
        }
    }

    /// Advances per-buffer cursors after `sent` bytes have been transmitted
    /// and returns the chain's unconsumed suffix.
    ///
    /// Special (control-marker) links are stepped over without consuming
    /// any budget. A link whose pending size fits in the remaining budget
    /// has its memory and/or file cursor snapped to the window end,
    /// whichever residencies apply; a link only partially covered has the
    /// applicable cursors advanced by the remainder and becomes the new
    /// head. Returns `None` when everything was consumed.
    pub fn update_sent(&mut self, mut chain: Chain, mut sent: u64) -> Chain {
        while let Some(cl) = chain {
            let buf = self.link_buf(cl);

            if self.bufs[buf.index()].is_special() {
                chain = self.next(cl);
                continue;
            }

            if sent == 0 {
                break;
            }

            let size = self.bufs[buf.index()].size();

            if sent >= size {
                sent -= size;

                let b = &mut self.bufs[buf.index()];
                if b.in_memory() {
                    b.pos = b.last;
                }
                if b.in_file {
                    b.file_pos = b.file_last;
                }

                chain = self.next(cl);
                continue;
            }

            let b = &mut self.bufs[buf.index()];
            if b.in_memory() {
                b.pos += sent;
            }
            if b.in_file {
                b.file_pos += sent;
            }
            break;
        }

        chain
    }
}
