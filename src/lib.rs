#![no_std]

//! A best-fit memory allocator.
//!
//! The heap is a single region grown with `sbrk(2)` and carved into
//! boundary-tagged blocks: a size word at each end of every block, with the
//! low bit marking the block allocated or free. Freed blocks are indexed in
//! an AVL tree ordered by `(size, address)` whose nodes live inside the free
//! blocks themselves, so an allocation finds the smallest sufficient block
//! in logarithmic time and a free merges with its neighbors in constant
//! time.
//!
//! The layers, bottom up:
//!
//! - [`block`] - the on-heap block format and tag arithmetic.
//! - [`freetree`] - the intrusive best-fit index over free blocks.
//! - [`allocators`] - the heap growers, the raw allocator
//!   ([`RawAlloc`]), and the spin-locked [`SbrkAllocator`] that can serve as
//!   `#[global_allocator]`.

pub mod allocators;
pub mod block;
pub mod freetree;

pub use allocators::{
    GenericAllocator, HeapGrower, RawAlloc, SbrkAllocator, SbrkHeapGrower, Stats, ToyHeap,
    Validity,
};
pub use freetree::FreeTree;
