//! Allocator types, from the OS boundary up to a usable global allocator.
//!
//! ## Basic Types
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` abstracts the calls to the OS that extend the heap. The real
//! implementation is [`SbrkHeapGrower`](struct.SbrkHeapGrower.html), which
//! moves the program break; [`ToyHeap`](struct.ToyHeap.html) is a static
//! array pretending to be a data segment, mainly useful for testing.
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded, non-thread-safe heap manager. It owns
//! the heap watermarks and the free-block index, and implements the actual
//! allocation policy: best-fit reuse with block splitting, and eager
//! coalescing of freed blocks with their neighbors.
//!
//! ### [`SbrkAllocator`](struct.SbrkAllocator.html)
//!
//! `SbrkAllocator` wraps a `RawAlloc<SbrkHeapGrower>` in a spin lock so that
//! it can serve as the global allocator.

use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::ptr::{self, null_mut, NonNull};

use errno::Errno;
use spin::{Mutex, MutexGuard, Once};

use crate::block::{self, BlockPtr, ALIGN, MIN_BLOCK_SIZE, TAG_OVERHEAD, WORD};
use crate::freetree::{FreeTree, NodeRef};

pub trait HeapGrower {
    type Err;

    /// Extend the heap by exactly `size` bytes and return a pointer to the
    /// first new byte.
    ///
    /// `size` is always a multiple of [`ALIGN`] and at least
    /// [`MIN_BLOCK_SIZE`]. Successive extensions must be contiguous (each
    /// starts where the previous one ended) and the first must start on an
    /// [`ALIGN`] boundary; the allocator lays blocks back to back across
    /// extension seams.
    ///
    /// # Safety
    ///
    /// This deals in raw, unowned memory. The returned bytes must not be in
    /// use by or reachable from any other code, including the allocator
    /// itself, and nothing else may move the heap top while an allocator is
    /// using this grower.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// The current top of the grown region; one past the last usable byte.
    fn current_top(&self) -> *mut u8;
}

/// Grows the heap by moving the program break with `sbrk(2)`.
#[derive(Default)]
pub struct SbrkHeapGrower {
    // Successful extensions so far; also tells us whether the break still
    // needs its initial alignment.
    extensions: usize,
}

impl SbrkHeapGrower {
    pub const fn new() -> Self {
        SbrkHeapGrower { extensions: 0 }
    }
}

impl HeapGrower for SbrkHeapGrower {
    type Err = Errno;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        // Block starts derive their alignment from the first extension, so
        // push the break up to an ALIGN boundary before the first block.
        if self.extensions == 0 {
            let top = libc::sbrk(0) as usize;
            let pad = top.wrapping_neg() & (ALIGN - 1);
            if pad != 0 && libc::sbrk(pad as libc::intptr_t) as isize == -1 {
                return Err(errno::errno());
            }
        }

        let old_top = libc::sbrk(size as libc::intptr_t);
        if old_top as isize == -1 {
            return Err(errno::errno());
        }

        self.extensions += 1;
        Ok(NonNull::new_unchecked(old_top as *mut u8))
    }

    fn current_top(&self) -> *mut u8 {
        unsafe { libc::sbrk(0) as *mut u8 }
    }
}

/// Capacity of a [`ToyHeap`].
pub const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A static array that can pretend to be a heap, for tests and experiments.
///
/// Because the "heap" lives inside the struct, an allocator using a `ToyHeap`
/// must not be moved after its first allocation; every handed-out pointer
/// aims into the array.
#[repr(C, align(16))]
pub struct ToyHeap {
    heap: [u8; TOY_HEAP_SIZE],
    pub size: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            size: 0,
        }
    }
}

#[derive(Debug)]
pub struct ToyHeapOverflowError();

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        if self.size + size > self.heap.len() {
            return Err(ToyHeapOverflowError());
        }
        let ptr = self.heap.as_mut_ptr().add(self.size);
        self.size += size;
        Ok(NonNull::new_unchecked(ptr))
    }

    fn current_top(&self) -> *mut u8 {
        self.heap.as_ptr().wrapping_add(self.size) as *mut u8
    }
}

/// A raw allocator: grows the heap on demand, hands out blocks by best fit,
/// and tracks freed memory for reuse.
///
/// All allocator state lives here: the grower, the `[lo, hi)` watermarks of
/// the managed region, and the free-block index. Memory is never returned to
/// the OS.
///
/// Not thread-safe; see [`SbrkAllocator`] for the locked version.
pub struct RawAlloc<G> {
    pub grower: G,
    tree: FreeTree,
    lo: *mut u8,
    hi: *mut u8,
}

// The watermarks and the tree aim into heap memory that is reachable only
// through this allocator, so it moves between threads as a unit.
unsafe impl<G: Send> Send for RawAlloc<G> {}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    pub fn new(grower: G) -> Self {
        RawAlloc {
            grower,
            tree: FreeTree::new(),
            lo: null_mut(),
            hi: null_mut(),
        }
    }

    /// Bytes currently under management: `hi - lo`.
    pub fn heap_size(&self) -> usize {
        self.hi as usize - self.lo as usize
    }

    /// The free-block index, mainly for logging its `Display` form.
    pub fn free_tree(&self) -> &FreeTree {
        &self.tree
    }

    /// Allocate a block with room for at least `size` bytes of payload.
    /// Returns null if the OS refuses to grow the heap or `size` is
    /// unrepresentable once rounded.
    ///
    /// # Safety
    ///
    /// This is very unsafe. See GlobalAlloc for details.
    pub unsafe fn alloc(&mut self, size: usize) -> *mut u8 {
        let block_size = match block::block_size(size) {
            Some(s) => s,
            None => return null_mut(),
        };

        if let Some(node) = self.tree.pop_best_fit(block_size) {
            let found = node.size();
            let block = BlockPtr::new(node.payload());
            log::trace!(
                "reusing a {}-byte block for a {}-byte request",
                found,
                block_size
            );

            if found - block_size >= MIN_BLOCK_SIZE {
                self.split(block, block_size, found);
            } else {
                // The leftover couldn't hold a block of its own; hand the
                // whole thing out.
                block.set_tags(found, true);
            }
            return block.payload();
        }

        self.extend(block_size)
    }

    /// Carve an allocated block of `block_size` bytes out of the front of
    /// `block` (total size `found`, already out of the index) and index the
    /// remainder as a free block of its own.
    unsafe fn split(&mut self, block: BlockPtr, block_size: usize, found: usize) {
        let remainder = found - block_size;
        block.set_tags(block_size, true);

        let rest = block.next();
        rest.set_tags(remainder, false);
        self.tree.insert(rest.payload_nonnull(), remainder);
    }

    /// Grow the heap by `block_size` bytes and stamp the new bytes as a
    /// single allocated block. On grower failure nothing changes and null is
    /// returned.
    unsafe fn extend(&mut self, block_size: usize) -> *mut u8 {
        let start = match self.grower.grow_heap(block_size) {
            Ok(p) => p,
            Err(_) => {
                log::debug!("heap extension of {} bytes refused", block_size);
                return null_mut();
            }
        };

        if self.lo.is_null() {
            self.lo = start.as_ptr();
        }
        self.hi = self.grower.current_top();
        log::debug!(
            "extended heap by {} bytes, top now {:?}",
            block_size,
            self.hi
        );

        let block = BlockPtr::new(NonNull::new_unchecked(start.as_ptr().add(WORD)));
        block.set_tags(block_size, true);
        block.payload()
    }

    /// Free an allocation. Freeing null is a no-op.
    ///
    /// The freed block merges with any free neighbor before going into the
    /// index, so no two adjacent blocks are ever both free.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer previously returned by this
    /// allocator. Double frees are not detected.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let block = match BlockPtr::from_raw(ptr) {
            None => return,
            Some(b) => b,
        };

        block.set_tags(block.size(), false);
        let merged = self.coalesce(block);
        self.tree.insert(merged.payload_nonnull(), merged.size());
    }

    /// Merge a free, unindexed block with free neighbors on either side.
    /// Absorbed neighbors come out of the index; the survivor's tags span
    /// the union. Returns the head of the merged block, still unindexed.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        let prev = self.prev_block(block).filter(|b| !b.is_allocated());
        let next = self.next_block(block).filter(|b| !b.is_allocated());

        let mut size = block.size();

        match (prev, next) {
            (None, None) => block,
            (Some(prev), None) => {
                self.tree
                    .remove(NodeRef::from_payload(prev.payload_nonnull()));
                size += prev.size();
                prev.set_tags(size, false);
                prev
            }
            (None, Some(next)) => {
                self.tree
                    .remove(NodeRef::from_payload(next.payload_nonnull()));
                size += next.size();
                block.set_tags(size, false);
                block
            }
            (Some(prev), Some(next)) => {
                self.tree
                    .remove(NodeRef::from_payload(prev.payload_nonnull()));
                self.tree
                    .remove(NodeRef::from_payload(next.payload_nonnull()));
                size += prev.size() + next.size();
                prev.set_tags(size, false);
                prev
            }
        }
    }

    /// The block before `block`, or `None` for the first block in the heap.
    /// The guard compares addresses only, so the nonexistent footer before
    /// the first block is never read.
    unsafe fn prev_block(&self, block: BlockPtr) -> Option<BlockPtr> {
        if block.start() as usize <= self.lo as usize {
            return None;
        }
        Some(block.prev())
    }

    /// The block after `block`, or `None` for the last block in the heap.
    unsafe fn next_block(&self, block: BlockPtr) -> Option<BlockPtr> {
        if block.end() as usize >= self.hi as usize {
            return None;
        }
        Some(block.next())
    }

    /// Resize an allocation, preserving the payload prefix common to the old
    /// and new sizes.
    ///
    /// Null behaves like [`Self::alloc`]; a zero `new_size` behaves like
    /// [`Self::free`] and returns null. Shrinking stays in place, splitting
    /// off and freeing the tail when it is big enough to stand alone.
    /// Growing allocates fresh, copies, then frees; if that allocation fails
    /// the original block is left untouched and null is returned.
    ///
    /// # Safety
    ///
    /// As for [`Self::free`].
    pub unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let block = match BlockPtr::from_raw(ptr) {
            None => return self.alloc(new_size),
            Some(b) => b,
        };

        if new_size == 0 {
            self.free(ptr);
            return null_mut();
        }

        let old_block = block.size();
        let old_payload = old_block - TAG_OVERHEAD;

        let new_block = match block::block_size(new_size) {
            Some(s) => s,
            None => return null_mut(),
        };

        if new_block <= old_block {
            let remainder = old_block - new_block;
            if remainder < MIN_BLOCK_SIZE {
                // Not enough slack to carve a block out of; keep it all.
                return ptr;
            }

            block.set_tags(new_block, true);
            let rest = block.next();
            rest.set_tags(remainder, false);
            // Route the tail through free so it merges with whatever
            // follows it.
            self.free(rest.payload());
            return ptr;
        }

        let new_ptr = self.alloc(new_size);
        if new_ptr.is_null() {
            return null_mut();
        }

        ptr::copy_nonoverlapping(ptr, new_ptr, cmp::min(old_payload, new_size));
        self.free(ptr);
        new_ptr
    }

    /// Allocate zeroed memory for `nitems` elements of `size` bytes each.
    /// Returns null when either count is zero or their product overflows.
    ///
    /// # Safety
    ///
    /// As for [`Self::alloc`].
    pub unsafe fn calloc(&mut self, nitems: usize, size: usize) -> *mut u8 {
        if nitems == 0 || size == 0 {
            return null_mut();
        }
        let total = match nitems.checked_mul(size) {
            Some(t) => t,
            None => return null_mut(),
        };

        let ptr = self.alloc(total);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, total);
        }
        ptr
    }

    /// Payload capacity of a live allocation. May exceed what was asked for:
    /// a best-fit block whose leftover was too small to split keeps it all.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer from this allocator.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        match BlockPtr::from_raw(ptr) {
            None => 0,
            Some(b) => b.size() - TAG_OVERHEAD,
        }
    }

    /// Get statistics on this allocator, and verify the heap and the index
    /// against each other.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        let (tree_validity, tree_stats) = self.tree.stats();
        validity.tree = tree_validity;

        if self.lo.is_null() {
            validity.index_count_off = tree_stats.nodes;
            return (validity, stats);
        }

        stats.heap_size = self.heap_size();

        unsafe {
            let mut at = self.lo;
            let mut prev_free = false;

            while (at as usize) < self.hi as usize {
                let cursor = BlockPtr::new(NonNull::new_unchecked(at.add(WORD)));
                let size = cursor.size();

                if size < MIN_BLOCK_SIZE || size % ALIGN != 0 {
                    // A mangled size would send the walk into the weeds.
                    validity.corrupt_sizes += 1;
                    break;
                }

                if cursor.footer_word() != cursor.header_word() {
                    validity.mismatched_tags += 1;
                }

                let free = !cursor.is_allocated();
                if free {
                    if prev_free {
                        validity.adjacent_free += 1;
                    }
                    stats.free_blocks += 1;
                    stats.free_bytes += size;

                    let node = NodeRef::from_payload(cursor.payload_nonnull());
                    if node.size() != size {
                        validity.stale_node_sizes += 1;
                    }
                    if !self.tree.contains(node) {
                        validity.unindexed_free += 1;
                    }
                }

                stats.blocks += 1;
                prev_free = free;
                at = at.add(size);
            }

            if at as usize != self.hi as usize && validity.corrupt_sizes == 0 {
                validity.partition_broken = true;
            }
        }

        validity.index_count_off = tree_stats.nodes.abs_diff(stats.free_blocks);

        (validity, stats)
    }
}

/// Invalid states found in a heap walk. Everything zero means the heap and
/// the free index agree and all structural invariants hold.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks whose header and footer words disagree.
    pub mismatched_tags: usize,
    /// Pairs of adjacent blocks that are both free (should have merged).
    pub adjacent_free: usize,
    /// Blocks whose size field is undersized or misaligned; aborts the walk.
    pub corrupt_sizes: usize,
    /// The block sizes did not sum to exactly `hi - lo`.
    pub partition_broken: bool,
    /// Free blocks with no matching node in the index.
    pub unindexed_free: usize,
    /// Free blocks whose cached node size disagrees with their header.
    pub stale_node_sizes: usize,
    /// Difference between the index node count and the free block count.
    pub index_count_off: usize,
    /// Structural problems inside the index itself.
    pub tree: crate::freetree::TreeValidity,
}

impl Validity {
    /// Returns a boolean - a simple check that nothing was flagged.
    pub fn is_valid(&self) -> bool {
        self.mismatched_tags == 0
            && self.adjacent_free == 0
            && self.corrupt_sizes == 0
            && !self.partition_broken
            && self.unindexed_free == 0
            && self.stale_node_sizes == 0
            && self.index_count_off == 0
            && self.tree.is_valid()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct Stats {
    /// Bytes between the watermarks.
    pub heap_size: usize,
    /// Blocks in the heap, free or not.
    pub blocks: usize,
    /// Free blocks (equivalently, index nodes when valid).
    pub free_blocks: usize,
    /// Total bytes in free blocks, tags included.
    pub free_bytes: usize,
}

/// A thread-safe allocator: a spin lock around a lazily initialized
/// [`RawAlloc`].
///
/// Thread-safety is required for an allocator to be used as the global
/// allocator, and the global allocator must be constructible in a `const`
/// context, so the inner allocator is built on first use behind a
/// [`spin::Once`].
pub struct GenericAllocator<G> {
    raw: Once<Mutex<RawAlloc<G>>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator { raw: Once::new() }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Lock the underlying [`RawAlloc`], initializing it on first use.
    ///
    /// Allocation is blocked for as long as the returned guard lives; drop
    /// it before anything on the same thread needs the heap again.
    pub fn get_raw(&self) -> MutexGuard<RawAlloc<G>> {
        self.raw
            .call_once(|| Mutex::new(RawAlloc::default()))
            .lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.get_raw().stats()
    }
}

/// The program-break-backed allocator, usable as `#[global_allocator]`.
///
/// Payloads sit one word past an [`ALIGN`]ed block start, so the strongest
/// alignment this can honor is [`WORD`]; layouts that demand more get null.
#[derive(Default)]
pub struct SbrkAllocator {
    alloc: GenericAllocator<SbrkHeapGrower>,
}

impl SbrkAllocator {
    pub const fn new() -> Self {
        SbrkAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

unsafe impl GlobalAlloc for SbrkAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > WORD {
            return null_mut();
        }
        self.alloc.get_raw().alloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // The boundary tags know the size; the layout isn't needed.
        self.alloc.get_raw().free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > WORD {
            return null_mut();
        }
        self.alloc.get_raw().realloc(ptr, new_size)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > WORD {
            return null_mut();
        }
        self.alloc.get_raw().calloc(layout.size(), 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::slice;

    use test_log::test;

    fn assert_valid<G: HeapGrower>(allocator: &RawAlloc<G>) -> Stats {
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid(), "Validity: {:?}", validity);
        stats
    }

    #[test]
    fn test_basic() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.alloc(32);
            assert!(!p.is_null());
            // 32 bytes plus two tags rounds up to 48 exactly.
            assert_eq!(allocator.usable_size(p), 48 - TAG_OVERHEAD);

            let stats = assert_valid(&allocator);
            assert_eq!(stats.heap_size, 48);
            assert_eq!(stats.blocks, 1);
            assert_eq!(stats.free_blocks, 0);

            allocator.free(p);
            let stats = assert_valid(&allocator);
            assert_eq!(stats.blocks, 1);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, 48);
            log::info!("free blocks: {}", allocator.free_tree());
        }
    }

    #[test]
    fn zero_sized_request_gets_minimum_block() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.alloc(0);
            assert!(!p.is_null());
            assert_eq!(allocator.usable_size(p), MIN_BLOCK_SIZE - TAG_OVERHEAD);
            let stats = assert_valid(&allocator);
            assert_eq!(stats.heap_size, MIN_BLOCK_SIZE);
        }
    }

    #[test]
    fn free_null_is_a_noop() {
        let mut allocator = RawAlloc::<ToyHeap>::default();
        unsafe { allocator.free(null_mut()) };
        let stats = assert_valid(&allocator);
        assert_eq!(stats.blocks, 0);
    }

    #[test]
    fn exact_fit_is_taken_whole() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.alloc(64);
            allocator.free(p);

            // 56 plus tags rounds to 80, exactly the freed block; the
            // remainder would be zero, so the whole block comes back.
            let q = allocator.alloc(56);
            assert_eq!(q, p);
            assert_eq!(allocator.usable_size(q), 80 - TAG_OVERHEAD);

            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 0);
            assert_eq!(stats.heap_size, 80);
        }
    }

    #[test]
    fn freed_neighbors_merge_in_all_directions() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let a = allocator.alloc(64);
            let b = allocator.alloc(64);
            let c = allocator.alloc(64);
            assert_valid(&allocator);

            // Free the outer two: no merging across the live middle.
            allocator.free(a);
            allocator.free(c);
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 2);

            // Freeing the middle merges all three into one block.
            allocator.free(b);
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, stats.heap_size);
        }
    }

    #[test]
    fn calloc_zeroes_and_rejects_bad_products() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.calloc(5, 32);
            assert!(!p.is_null());
            let payload = slice::from_raw_parts(p as *const u8, 160);
            assert!(payload.iter().all(|&b| b == 0));
            assert_valid(&allocator);

            assert!(allocator.calloc(0, 32).is_null());
            assert!(allocator.calloc(32, 0).is_null());
            assert!(allocator.calloc(usize::MAX, 2).is_null());
            assert!(allocator.calloc(usize::MAX / 2, 3).is_null());
        }
    }

    #[test]
    fn realloc_null_and_zero_dispatch() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.realloc(null_mut(), 100);
            assert!(!p.is_null());
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 0);

            let q = allocator.realloc(p, 0);
            assert!(q.is_null());
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 1);
        }
    }

    #[test]
    fn realloc_grow_preserves_contents() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.alloc(64);
            ptr::write_bytes(p, 0x5A, 64);

            let q = allocator.realloc(p, 2000);
            assert!(!q.is_null());
            assert_ne!(q, p);
            assert!(allocator.usable_size(q) >= 2000);

            let payload = slice::from_raw_parts(q as *const u8, 64);
            assert!(payload.iter().all(|&b| b == 0x5A));

            // The old block went back to the index.
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 1);
        }
    }

    #[test]
    fn realloc_small_shrink_keeps_the_block() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.alloc(100);
            let before = allocator.usable_size(p);

            // 90 plus tags rounds to 112; the slack off a 128-byte block is
            // 16, too small to stand alone, so nothing changes.
            let q = allocator.realloc(p, 90);
            assert_eq!(q, p);
            assert_eq!(allocator.usable_size(q), before);
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 0);
        }
    }

    #[test]
    fn realloc_shrink_splits_and_free_coalesces() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let a = allocator.alloc(256);
            let b = allocator.alloc(256);
            ptr::write_bytes(a, 0x11, 256);
            ptr::write_bytes(b, 0x22, 256);
            let heap_size = allocator.heap_size();

            // Shrinking in place frees a 208-byte tail.
            let a2 = allocator.realloc(a, 64);
            assert_eq!(a2, a);
            let payload = slice::from_raw_parts(a2 as *const u8, 64);
            assert!(payload.iter().all(|&b| b == 0x11));
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 1);

            // b's block merges backwards into the tail...
            allocator.free(b);
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 1);

            // ...and freeing a2 leaves the whole heap as one free block.
            allocator.free(a2);
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, heap_size);

            // Which a large allocation can now use without growing the heap.
            let c = allocator.alloc(400);
            assert_eq!(c, a);
            assert_eq!(allocator.heap_size(), heap_size);
            assert_valid(&allocator);
        }
    }

    #[test]
    fn best_fit_chooses_the_tightest_block() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let _a = allocator.alloc(100);
            let x = allocator.alloc(200); // 224-byte block
            let _y = allocator.alloc(100);
            let z = allocator.alloc(300); // 320-byte block
            allocator.free(x);
            allocator.free(z);
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 2);

            // 150 needs a 176-byte block; the 224-byte hole fits tighter
            // than the 320-byte one.
            let w = allocator.alloc(150);
            assert_eq!(w, x);
            assert_valid(&allocator);
        }
    }

    #[test]
    fn extension_failure_leaves_no_trace() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            assert!(allocator.alloc(TOY_HEAP_SIZE + 1).is_null());
            let stats = assert_valid(&allocator);
            assert_eq!(stats.heap_size, 0);
            assert_eq!(stats.blocks, 0);

            // A request whose rounding would overflow is refused before it
            // reaches the grower.
            assert!(allocator.alloc(usize::MAX).is_null());
            assert!(allocator.realloc(null_mut(), usize::MAX).is_null());
        }
    }

    #[test]
    fn generic_allocator_initializes_once() {
        let allocator: GenericAllocator<ToyHeap> = GenericAllocator::new();

        let p = unsafe { allocator.get_raw().alloc(48) };
        assert!(!p.is_null());
        unsafe { allocator.get_raw().free(p) };

        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid(), "Validity: {:?}", validity);
        assert_eq!(stats.free_blocks, 1);
    }
}
