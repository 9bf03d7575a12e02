//! Explicit free-list heap over a caller-supplied arena.
//!
//! This module provides [`FreeListHeap`], an allocator that carves a single
//! fixed-size memory region into `[header][payload]` blocks and tracks the
//! free ones on a doubly linked list threaded through their payload bytes.
//!
//! # Algorithm
//!
//! - **Free list**: free blocks form an unordered doubly linked list with
//!   LIFO head insertion; allocated blocks carry no linkage at all, their
//!   payload belongs entirely to the caller.
//! - **Allocation**: first-fit over the free list, splitting the chosen
//!   block when the tail remainder is large enough to stand on its own.
//! - **Release**: the block is pushed back onto the list head, then every
//!   immediately following free block is folded into it. Coalescing is
//!   right-only: headers carry no footer or back link, so a free *left*
//!   neighbor absorbs this block only when that neighbor is itself released
//!   or resized later.
//! - **Resize**: shrink in place, then grow in place by absorbing free right
//!   neighbors, and only then fall back to allocate-copy-release.
//!
//! # Memory Layout
//!
//! ```text
//! arena:  [hdr|payload........][hdr|payload..][hdr|payload.......]
//!              └ allocated          └ free         └ allocated
//!
//! free block payload:
//! ┌────────────┬────────────┬───────────────────────┐
//! │ prev: word │ next: word │ rest of payload       │
//! └────────────┴────────────┴───────────────────────┘
//! ```
//!
//! Every header is one machine word: payload size in the high bits, status
//! in bit 0. Link words hold byte offsets from the arena base, with
//! `usize::MAX` as the nil sentinel; internal bookkeeping never stores a raw
//! address.
//!
//! # Performance
//!
//! - Allocation and resize: O(n) in the number of free blocks
//! - Release: O(1) plus the blocks coalesced
//! - Memory overhead: one word per block
//!
//! # Thread Safety
//!
//! The heap is `Send` but not `Sync`. It can be moved between threads but
//! requires external synchronization for concurrent access.

use core::{cmp, ptr};

use snafu::{Location, Snafu, ensure};

use crate::header::{ALIGNMENT, HEADER_SIZE, Header, MIN_PAYLOAD, round_up};

/// Largest single request the allocator will consider, in bytes.
pub const MAX_REQUEST_SIZE: usize = 1 << 30;

/// Nil sentinel for free-list link words.
pub(crate) const NIL: usize = usize::MAX;

/// Error returned when [`FreeListHeap::init`] rejects a region.
#[derive(Debug, Snafu)]
pub enum InitError {
    /// The region cannot host one header plus the minimum payload.
    #[snafu(display("region of {len} bytes is below the {min}-byte minimum"))]
    RegionTooSmall {
        len: usize,
        min: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The region base is not aligned to the alignment unit.
    #[snafu(display("region address {addr:#x} is not aligned to the 8-byte unit"))]
    RegionMisaligned {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A first-fit allocator backed by an explicit free list inside a
/// caller-supplied arena.
///
/// The heap starts empty; [`init`](Self::init) installs a region and resets
/// all state, and may be called again at any time to discard every prior
/// allocation. All bookkeeping lives inside the arena itself — the heap
/// value holds only the region bounds, the free-list head offset and the
/// free-block counter, so independent arenas are simply independent values.
///
/// # Example
///
/// ```
/// use arena_heap::FreeListHeap;
///
/// // Word-sized backing keeps the region 8-byte aligned.
/// let mut backing = vec![0_u64; 512];
/// let mut heap = FreeListHeap::new();
/// unsafe {
///     heap.init(backing.as_mut_ptr().cast(), backing.len() * 8).unwrap();
/// }
///
/// let ptr = heap.allocate(100).unwrap();
/// let ptr = unsafe { heap.resize(ptr, 200) }.unwrap();
/// unsafe { heap.release(ptr) };
/// assert!(heap.validate().is_ok());
/// ```
pub struct FreeListHeap {
    /// Arena base address; null until [`init`](Self::init) succeeds.
    pub(crate) base: *mut u8,
    /// Managed extent in bytes: block spans tile `0..extent` exactly.
    pub(crate) extent: usize,
    /// Offset of the first free block's header, or [`NIL`].
    pub(crate) free_head: usize,
    /// Incrementally maintained free-block count, cross-checked by
    /// [`validate`](Self::validate).
    pub(crate) free_blocks: usize,
}

unsafe impl Send for FreeListHeap {}

impl Default for FreeListHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeListHeap {
    /// Creates a heap with no arena installed.
    ///
    /// Until [`init`](Self::init) succeeds, [`allocate`](Self::allocate)
    /// returns `None` and [`validate`](Self::validate) holds vacuously.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base: ptr::null_mut(),
            extent: 0,
            free_head: NIL,
            free_blocks: 0,
        }
    }

    /// Installs `region` as the arena, discarding any previous state.
    ///
    /// On success the whole usable region (its length minus one header,
    /// rounded down to the alignment unit) becomes a single free block and
    /// the free list contains exactly that block. Re-invocation is a full
    /// reset, never an incremental change.
    ///
    /// # Errors
    ///
    /// [`RegionTooSmall`](InitError::RegionTooSmall) if `len` cannot host a
    /// header plus the minimum payload, [`RegionMisaligned`](InitError::RegionMisaligned)
    /// if `region` is not 8-byte aligned. On error the previous arena, if
    /// any, stays installed untouched.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `region..region + len` is valid, writable memory owned by the
    ///   caller and used by nothing else while the heap manages it
    /// - the region outlives every pointer handed out by this heap
    /// - pointers obtained from a previous arena are not used afterwards
    pub unsafe fn init(&mut self, region: *mut u8, len: usize) -> Result<(), InitError> {
        ensure!(
            region.addr().is_multiple_of(ALIGNMENT),
            RegionMisalignedSnafu {
                addr: region.addr()
            }
        );
        let min = HEADER_SIZE + MIN_PAYLOAD;
        ensure!(len >= min, RegionTooSmallSnafu { len, min });

        let usable = (len - HEADER_SIZE) & !(ALIGNMENT - 1);
        self.base = region;
        self.extent = HEADER_SIZE + usable;
        self.free_head = NIL;
        self.free_blocks = 0;
        self.set_header(0, Header::new(usable, true));
        self.push_free(0);
        Ok(())
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// Performs a first-fit scan of the free list in list order. The chosen
    /// block is split when the remainder could host a block of its own;
    /// otherwise the whole block is handed out and the slack becomes
    /// internal fragmentation. Returns the payload pointer, aligned to the
    /// 8-byte unit, never the header address.
    ///
    /// Returns `None` for a zero-sized request, a request above
    /// [`MAX_REQUEST_SIZE`], or when no free block fits — the arena is never
    /// compacted or grown, and failure leaves the heap unchanged.
    #[must_use]
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        if size == 0 || size > MAX_REQUEST_SIZE {
            return None;
        }
        let needed = Self::needed_size(size);

        let mut cur = self.free_head;
        while cur != NIL {
            let have = self.header(cur).size();
            if have >= needed {
                self.unlink_free(cur);
                self.carve(cur, have, needed);
                return Some(self.payload_ptr(cur));
            }
            cur = self.next_free(cur);
        }
        None
    }

    /// Releases a block previously returned by [`allocate`](Self::allocate)
    /// or [`resize`](Self::resize). A null `ptr` is a no-op.
    ///
    /// The block is marked free, pushed onto the free-list head, and merged
    /// with every immediately following free block. The left physical
    /// neighbor is never inspected; see the module docs on right-only
    /// coalescing.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload pointer obtained from this heap
    /// since the last [`init`](Self::init), and must not be used again after
    /// this call.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let off = self.offset_of(ptr);
        let size = self.header(off).size();
        self.set_header(off, Header::new(size, true));
        self.push_free(off);
        self.absorb_right(off);
    }

    /// Resizes a block, preferring to leave it in place.
    ///
    /// A null `ptr` behaves as [`allocate`](Self::allocate); a zero
    /// `new_size` behaves as [`release`](Self::release) and returns `None`.
    /// Otherwise the heap tries, in order: shrinking in place (splitting off
    /// the remainder when worthwhile), growing in place by absorbing free
    /// right neighbors, and relocating to a fresh allocation with the first
    /// `min(old payload size, new block size)` bytes copied over.
    ///
    /// Returns the (possibly unchanged) payload pointer, or `None` when the
    /// request is oversized or no block can satisfy it. On failure the
    /// original block is still live and its contents are intact.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload pointer obtained from this heap
    /// since the last [`init`](Self::init). When the call returns a new
    /// pointer, or `None` after `new_size == 0`, the old pointer must not be
    /// used again.
    #[must_use]
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> Option<*mut u8> {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            unsafe { self.release(ptr) };
            return None;
        }
        if new_size > MAX_REQUEST_SIZE {
            return None;
        }
        let off = self.offset_of(ptr);
        let needed = Self::needed_size(new_size);

        let have = self.header(off).size();
        if have >= needed {
            self.carve(off, have, needed);
            return Some(ptr);
        }

        // Grow in place: the block keeps its allocated bit while free right
        // neighbors are folded in, so the validator never sees it on both
        // sides of the fence.
        self.absorb_right(off);
        let have = self.header(off).size();
        if have >= needed {
            self.carve(off, have, needed);
            return Some(ptr);
        }

        let new_ptr = self.allocate(new_size)?;
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr, cmp::min(have, needed));
            self.release(ptr);
        }
        Some(new_ptr)
    }

    /// Number of blocks currently on the free list.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.free_blocks
    }

    /// Total payload-plus-interior-header bytes under management: the region
    /// length minus the leading header, rounded down to the alignment unit.
    /// Zero until [`init`](Self::init) succeeds.
    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.extent.saturating_sub(HEADER_SIZE)
    }

    /// Request-to-block-size policy: small requests are forced up to
    /// [`MIN_PAYLOAD`] so the block can host its link words once freed.
    fn needed_size(size: usize) -> usize {
        cmp::max(MIN_PAYLOAD, round_up(size, ALIGNMENT))
    }

    /// Shrinks the block at `off` (currently `have` payload bytes) to
    /// `needed`, splitting the tail into a new free block when the remainder
    /// can host a header plus the minimum payload. The block's header always
    /// ends up in the allocated state, sizes finalized before the remainder
    /// is linked in.
    fn carve(&mut self, off: usize, have: usize, needed: usize) {
        if have - needed >= HEADER_SIZE + MIN_PAYLOAD {
            let rest = off + HEADER_SIZE + needed;
            self.set_header(rest, Header::new(have - needed - HEADER_SIZE, true));
            self.push_free(rest);
            self.set_header(off, Header::new(needed, false));
        } else {
            self.set_header(off, Header::new(have, false));
        }
    }

    /// Folds every immediately following free block into the block at `off`,
    /// preserving `off`'s own status bit.
    fn absorb_right(&mut self, off: usize) {
        loop {
            let header = self.header(off);
            let next = off + HEADER_SIZE + header.size();
            if next >= self.extent {
                break;
            }
            let neighbor = self.header(next);
            if !neighbor.is_free() {
                break;
            }
            self.unlink_free(next);
            let merged = header.size() + HEADER_SIZE + neighbor.size();
            self.set_header(off, Header::new(merged, header.is_free()));
        }
    }

    /// Inserts the free block at `off` at the list head (LIFO).
    fn push_free(&mut self, off: usize) {
        self.set_prev_free(off, NIL);
        self.set_next_free(off, self.free_head);
        if self.free_head != NIL {
            self.set_prev_free(self.free_head, off);
        }
        self.free_head = off;
        self.free_blocks += 1;
    }

    /// Unlinks the free block at `off` using its own links; O(1), no scan.
    fn unlink_free(&mut self, off: usize) {
        let prev = self.prev_free(off);
        let next = self.next_free(off);
        if prev == NIL {
            self.free_head = next;
        } else {
            self.set_next_free(prev, next);
        }
        if next != NIL {
            self.set_prev_free(next, prev);
        }
        self.free_blocks -= 1;
    }

    fn payload_ptr(&self, off: usize) -> *mut u8 {
        unsafe { self.base.add(off + HEADER_SIZE) }
    }

    /// Recovers a block's header offset from its payload pointer.
    fn offset_of(&self, ptr: *mut u8) -> usize {
        ptr.addr() - self.base.addr() - HEADER_SIZE
    }

    pub(crate) fn header(&self, off: usize) -> Header {
        Header::from_word(self.read_word(off))
    }

    fn set_header(&mut self, off: usize, header: Header) {
        self.write_word(off, header.word());
    }

    // Link words overlay the first two payload words of a free block; they
    // are meaningful only while the block is free.

    fn prev_free(&self, off: usize) -> usize {
        self.read_word(off + HEADER_SIZE)
    }

    pub(crate) fn next_free(&self, off: usize) -> usize {
        self.read_word(off + HEADER_SIZE + HEADER_SIZE)
    }

    fn set_prev_free(&mut self, off: usize, link: usize) {
        self.write_word(off + HEADER_SIZE, link);
    }

    fn set_next_free(&mut self, off: usize, link: usize) {
        self.write_word(off + HEADER_SIZE + HEADER_SIZE, link);
    }

    fn read_word(&self, at: usize) -> usize {
        debug_assert!(at + size_of::<usize>() <= self.extent);
        #[expect(clippy::cast_ptr_alignment)]
        let word_ptr = unsafe { self.base.add(at) }.cast::<usize>();
        unsafe { word_ptr.read() }
    }

    fn write_word(&mut self, at: usize, word: usize) {
        debug_assert!(at + size_of::<usize>() <= self.extent);
        #[expect(clippy::cast_ptr_alignment)]
        let word_ptr = unsafe { self.base.add(at) }.cast::<usize>();
        unsafe { word_ptr.write(word) };
    }
}
