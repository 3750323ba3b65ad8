//! The smallest possible demonstration: run an ordinary program on top of
//! the best-fit allocator.

use bestfit_allocator::SbrkAllocator;

// This is the magic line that makes every heap allocation in the program go
// through the best-fit allocator.
#[global_allocator]
static ALLOCATOR: SbrkAllocator = SbrkAllocator::new();

fn main() {
    env_logger::init();
    println!("Hello, World!");

    let s: String = "abc".to_owned();
    println!("Got a string {}", s);

    let mut v = vec![0, 1, 2, 3];
    for n in 10..2048 {
        v.push(n);
    }
    println!("Got a vec {}", v.len());

    let (validity, stats) = ALLOCATOR.stats();
    println!("Heap after the fact: {:?}", stats);
    assert!(validity.is_valid(), "Validity: {:?}", validity);
}
