//! Consistency checking and diagnostics.
//!
//! The validator audits the heap through two independent, read-only views:
//! the address-order walk (headers only, the physical tiling of the arena)
//! and the free-list walk (link words only). Each view is checked for
//! internal structure, then their free-block counts are cross-checked
//! against the incrementally maintained counter. Corruption is reported,
//! never repaired.
//!
//! [`FreeListHeap::blocks`] exposes the address-order view as an iterator;
//! [`FreeListHeap::dump`] renders it for humans. Neither is used by the
//! allocation paths.

use core::fmt;

use snafu::{Location, Snafu, ensure};

use crate::{
    free_list::{FreeListHeap, NIL},
    header::{ALIGNMENT, HEADER_SIZE, MIN_PAYLOAD},
};

/// Invariant violation found by [`FreeListHeap::validate`].
///
/// Any variant means the in-arena structures no longer describe a coherent
/// heap; by convention callers treat this as fatal and stop issuing
/// operations against the arena.
#[derive(Debug, Snafu)]
pub enum CheckError {
    /// A header's span runs past the arena end, so the address walk cannot
    /// land on the boundary.
    #[snafu(display("block at {at:#x} with payload size {size} runs past the arena end"))]
    BlockOverrun {
        at: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// A header stores a payload size below the minimum or off the
    /// alignment unit.
    #[snafu(display("block at {at:#x} has invalid payload size {size}"))]
    BadBlockSize {
        at: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// A free-list link points outside the arena or off the alignment unit.
    #[snafu(display("free-list link {at:#x} does not address a block"))]
    BadFreeLink {
        at: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// A free-list entry's status bit says allocated: stale linkage.
    #[snafu(display("free-list entry at {at:#x} is marked allocated"))]
    LinkedBlockNotFree {
        at: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The free list revisits a block instead of terminating.
    #[snafu(display("free list cycles at {at:#x}"))]
    FreeListCycle {
        at: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The two traversals and the counter disagree on how many free blocks
    /// exist.
    #[snafu(display(
        "free-block views disagree: address walk {walked}, list walk {linked}, counter {counted}"
    ))]
    FreeCountMismatch {
        walked: usize,
        linked: usize,
        counted: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// One block as seen by the address-order walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRecord {
    /// Byte offset of the block's header from the arena base.
    pub offset: usize,
    /// Payload size in bytes.
    pub size: usize,
    /// Status bit.
    pub free: bool,
}

/// Address-order iterator over the arena's blocks.
///
/// Stops early instead of reading out of bounds when a corrupt header makes
/// a span overrun the arena; [`FreeListHeap::validate`] is the authority on
/// whether the walk is trustworthy.
pub struct Blocks<'a> {
    heap: &'a FreeListHeap,
    pos: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockRecord;

    fn next(&mut self) -> Option<BlockRecord> {
        if self.pos >= self.heap.extent {
            return None;
        }
        let header = self.heap.header(self.pos);
        let size = header.size();
        let end = HEADER_SIZE
            .checked_add(size)
            .and_then(|span| self.pos.checked_add(span))
            .filter(|&end| end <= self.heap.extent)?;
        let record = BlockRecord {
            offset: self.pos,
            size,
            free: header.is_free(),
        };
        self.pos = end;
        Some(record)
    }
}

impl FreeListHeap {
    /// Iterates the arena's blocks in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks { heap: self, pos: 0 }
    }

    /// Cross-checks the physical block tiling, the free list, and the
    /// free-block counter. Read-only; an uninitialized heap (zero blocks,
    /// empty list, zero counter) passes vacuously.
    ///
    /// # Errors
    ///
    /// The first [`CheckError`] encountered, address walk first.
    pub fn validate(&self) -> Result<(), CheckError> {
        // Address-order traversal. Each step proves the block's span stays
        // inside the arena before advancing, so exiting the loop means the
        // walk landed exactly on the arena end.
        let mut pos = 0;
        let mut walked = 0;
        while pos < self.extent {
            let header = self.header(pos);
            let size = header.size();
            ensure!(
                size >= MIN_PAYLOAD && size.is_multiple_of(ALIGNMENT),
                BadBlockSizeSnafu { at: pos, size }
            );
            let end = HEADER_SIZE
                .checked_add(size)
                .and_then(|span| pos.checked_add(span))
                .filter(|&end| end <= self.extent);
            let Some(end) = end else {
                return BlockOverrunSnafu { at: pos, size }.fail();
            };
            if header.is_free() {
                walked += 1;
            }
            pos = end;
        }

        // Free-list traversal. Links are untrusted: bounds come first, and
        // the iteration is capped at the densest possible block tiling so a
        // cycle longer than a self-loop still terminates.
        let max_blocks = self.extent / (HEADER_SIZE + MIN_PAYLOAD);
        let mut linked = 0;
        let mut cur = self.free_head;
        while cur != NIL {
            let reachable = cur.is_multiple_of(ALIGNMENT)
                && cur
                    .checked_add(HEADER_SIZE + MIN_PAYLOAD)
                    .is_some_and(|end| end <= self.extent);
            ensure!(reachable, BadFreeLinkSnafu { at: cur });
            ensure!(
                self.header(cur).is_free(),
                LinkedBlockNotFreeSnafu { at: cur }
            );
            linked += 1;
            ensure!(linked <= max_blocks, FreeListCycleSnafu { at: cur });
            let next = self.next_free(cur);
            ensure!(next != cur, FreeListCycleSnafu { at: cur });
            cur = next;
        }

        ensure!(
            walked == linked && linked == self.free_blocks,
            FreeCountMismatchSnafu {
                walked,
                linked,
                counted: self.free_blocks,
            }
        );
        Ok(())
    }

    /// Writes a human-readable block listing to `out`. Diagnostic only.
    ///
    /// # Errors
    ///
    /// Propagates formatting errors from `out`.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "arena {:#x}..{:#x}: {} usable bytes, {} free block(s)",
            self.base.addr(),
            self.base.addr() + self.extent,
            self.usable_size(),
            self.free_block_count(),
        )?;
        for block in self.blocks() {
            writeln!(
                out,
                "  {:#08x}  {:>10} B  {}",
                block.offset,
                block.size,
                if block.free { "free" } else { "used" },
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::{string::String, vec::Vec};
    use core::alloc::Layout;

    use super::*;
    use crate::header::Header;

    fn with_region<F>(len: usize, test_fn: F)
    where
        F: FnOnce(*mut u8, usize),
    {
        unsafe {
            let layout = Layout::from_size_align(len, ALIGNMENT).unwrap();
            let region = alloc::alloc::alloc(layout);
            region.write_bytes(0x11, len);
            test_fn(region, len);
            alloc::alloc::dealloc(region, layout);
        }
    }

    unsafe fn write_word(region: *mut u8, at: usize, word: usize) {
        #[expect(clippy::cast_ptr_alignment)]
        let word_ptr = unsafe { region.add(at) }.cast::<usize>();
        unsafe { word_ptr.write(word) };
    }

    #[test]
    fn uninitialized_heap_validates_vacuously() {
        let heap = FreeListHeap::new();
        heap.validate().unwrap();
        assert_eq!(heap.blocks().count(), 0);
    }

    #[test]
    fn blocks_tile_the_arena_in_address_order() {
        with_region(512, |region, len| unsafe {
            let mut heap = FreeListHeap::new();
            heap.init(region, len).unwrap();
            let a = heap.allocate(32).unwrap();
            let _b = heap.allocate(64).unwrap();
            heap.release(a);

            let records: Vec<BlockRecord> = heap.blocks().collect();
            assert_eq!(records.len(), 3);
            assert_eq!(records[0], BlockRecord { offset: 0, size: 32, free: true });
            assert_eq!(records[1], BlockRecord { offset: 40, size: 64, free: false });
            assert!(records[2].free);

            // Spans chain without gap or overlap and land on the extent.
            let mut pos = 0;
            for record in &records {
                assert_eq!(record.offset, pos);
                pos += HEADER_SIZE + record.size;
            }
            assert_eq!(pos, HEADER_SIZE + heap.usable_size());
        });
    }

    #[test]
    fn dump_lists_every_block() {
        with_region(512, |region, len| unsafe {
            let mut heap = FreeListHeap::new();
            heap.init(region, len).unwrap();
            let _a = heap.allocate(32).unwrap();

            let mut out = String::new();
            heap.dump(&mut out).unwrap();
            assert!(out.contains("1 free block(s)"));
            assert!(out.contains("used"));
            assert!(out.contains("free"));
            assert_eq!(out.lines().count(), 3);
        });
    }

    #[test]
    fn detects_header_overrun() {
        with_region(256, |region, len| unsafe {
            let mut heap = FreeListHeap::new();
            heap.init(region, len).unwrap();
            let ptr = heap.allocate(32).unwrap();

            // Inflate the allocated block's size far past the arena end.
            write_word(region, 0, Header::new(1 << 20, false).word());
            assert!(matches!(
                heap.validate(),
                Err(CheckError::BlockOverrun { at: 0, .. })
            ));

            write_word(region, 0, Header::new(32, false).word());
            heap.validate().unwrap();
            heap.release(ptr);
        });
    }

    #[test]
    fn detects_undersized_block() {
        with_region(256, |region, len| unsafe {
            let mut heap = FreeListHeap::new();
            heap.init(region, len).unwrap();
            let _ptr = heap.allocate(32).unwrap();

            write_word(region, 0, Header::new(8, false).word());
            assert!(matches!(
                heap.validate(),
                Err(CheckError::BadBlockSize { at: 0, size: 8, .. })
            ));
        });
    }

    #[test]
    fn detects_stale_free_link() {
        with_region(512, |region, len| unsafe {
            let mut heap = FreeListHeap::new();
            heap.init(region, len).unwrap();
            let a = heap.allocate(32).unwrap();
            let _fence = heap.allocate(32).unwrap();
            heap.release(a);

            // Flip the listed block to allocated without unlinking it.
            write_word(region, 0, Header::new(32, false).word());
            assert!(matches!(
                heap.validate(),
                Err(CheckError::LinkedBlockNotFree { at: 0, .. })
            ));
        });
    }

    #[test]
    fn detects_free_list_self_loop() {
        with_region(256, |region, len| unsafe {
            let mut heap = FreeListHeap::new();
            heap.init(region, len).unwrap();

            let head = heap.free_head;
            write_word(region, head + 2 * HEADER_SIZE, head);
            assert!(matches!(
                heap.validate(),
                Err(CheckError::FreeListCycle { .. })
            ));
        });
    }

    #[test]
    fn detects_out_of_bounds_link() {
        with_region(256, |region, len| unsafe {
            let mut heap = FreeListHeap::new();
            heap.init(region, len).unwrap();

            heap.free_head = len;
            assert!(matches!(
                heap.validate(),
                Err(CheckError::BadFreeLink { .. })
            ));
        });
    }

    #[test]
    fn detects_counter_drift() {
        with_region(256, |region, len| unsafe {
            let mut heap = FreeListHeap::new();
            heap.init(region, len).unwrap();

            heap.free_blocks += 1;
            assert!(matches!(
                heap.validate(),
                Err(CheckError::FreeCountMismatch {
                    walked: 1,
                    linked: 1,
                    counted: 2,
                    ..
                })
            ));
        });
    }
}
