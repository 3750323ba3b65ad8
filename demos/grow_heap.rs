//! This is a very minimal example to show using the HeapGrower functions.

use bestfit_allocator::allocators::{HeapGrower, SbrkHeapGrower};

fn main() {
    // SbrkHeapGrower moves the program break; each call returns the old top,
    // and the new bytes sit right behind the previous call's. Both calls
    // happen before any printing: println can make the C library touch the
    // break too, and that would wedge itself between our extensions.
    let mut grower = SbrkHeapGrower::new();

    let first = unsafe { grower.grow_heap(64).unwrap() };
    let second = unsafe { grower.grow_heap(128).unwrap() };
    let top = grower.current_top();

    assert_eq!(unsafe { first.as_ptr().add(64) }, second.as_ptr());

    println!("First extension at:  {:p}", first);
    println!("Second extension at: {:p}", second);
    println!("Top afterwards:      {:p}", top);
}
