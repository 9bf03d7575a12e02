//! Fixed-arena memory allocation over an explicit free list.
//!
//! This crate provides [`FreeListHeap`], a user-space allocator that manages
//! one caller-supplied memory region ("the arena") and hands out
//! malloc/free/realloc-equivalent operations over it. All metadata is
//! self-describing and in-band: every block starts with a one-word header
//! packing its payload size and status bit, and free blocks additionally
//! thread a doubly linked list through their first two payload words. There
//! is no separate metadata store and no interaction with the system
//! allocator.
//!
//! # Algorithm
//!
//! - **First-fit** search over an unordered, LIFO-insertion free list
//! - **Splitting** of oversized blocks on allocate and on in-place resize
//! - **Right-only coalescing** on release: a freed block folds in every free
//!   block that follows it physically, while a free left neighbor catches up
//!   the next time it is itself released or resized
//! - **In-place-preferring resize**: shrink, then grow by coalescing, then
//!   relocate
//! - A read-only **validator** cross-checking the physical tiling, the free
//!   list, and the free-block counter against each other
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────┬─────────────┬─────┬─────────┬─────┬───────────────────┐
//! │ hdr │ payload     │ hdr │ payload │ hdr │ payload           │
//! └─────┴─────────────┴─────┴─────────┴─────┴───────────────────┘
//!   8 B   ≥ 16 B, 8-aligned, headers and payloads tile the arena
//! ```
//!
//! # Usage Example
//!
//! ```
//! use arena_heap::FreeListHeap;
//!
//! // Any 8-byte-aligned region works; word-sized backing keeps it simple.
//! let mut backing = vec![0_u64; 1024];
//! let mut heap = FreeListHeap::new();
//! unsafe {
//!     heap.init(backing.as_mut_ptr().cast(), backing.len() * 8).unwrap();
//! }
//!
//! let ptr = heap.allocate(64).unwrap();
//! unsafe {
//!     ptr.write_bytes(0xAB, 64);
//!     heap.release(ptr);
//! }
//! assert!(heap.validate().is_ok());
//! ```
//!
//! # Performance Characteristics
//!
//! | Operation | Cost |
//! |-----------|------|
//! | `allocate` | O(free blocks) |
//! | `release` | O(1) + blocks coalesced |
//! | `resize` | O(free blocks) worst case |
//! | `validate` | O(total blocks) |
//!
//! # Thread Safety
//!
//! [`FreeListHeap`] is `Send` but not `Sync`: operations are non-reentrant
//! and must be serialized by the caller.

#![cfg_attr(not(test), no_std)]

mod check;
mod free_list;
mod header;

pub use self::{
    check::{BlockRecord, Blocks, CheckError},
    free_list::{FreeListHeap, InitError, MAX_REQUEST_SIZE},
    header::{ALIGNMENT, HEADER_SIZE, MIN_PAYLOAD},
};
