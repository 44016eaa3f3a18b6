//! Installs [`MemAlloc`] as the global allocator and shows a few of its habits
//! through ordinary std collections.

use segalloc::{CHUNK_HEADER_SIZE, MemAlloc};
use std::thread;

#[global_allocator]
static ALLOCATOR: MemAlloc = MemAlloc::new();

/// Payload of the chunk left behind by freeing two adjacent 64 byte blocks.
const MERGED: usize = 64 + CHUNK_HEADER_SIZE + 64;

fn addr<T: ?Sized>(value: &T) -> usize {
    value as *const T as *const u8 as usize
}

fn main() {
    // A vector at the end of the heap keeps growing into the free chunk after it,
    // so most reallocations don't move it.
    let mut samples: Vec<u64> = Vec::with_capacity(4);
    let mut moves = 0;
    for sample in 0..256 {
        let before = samples.as_ptr();
        samples.push(sample);
        if samples.as_ptr() != before {
            moves += 1;
            println!("grew to {} slots, moved to {:p}", samples.capacity(), samples.as_ptr());
        }
    }
    println!("{} pushes, {moves} moves\n", samples.len());

    // 40 bytes round up to the same 48 byte class the freed block went back to.
    let first = Box::new([0u8; 48]);
    let freed_at = addr(&*first);
    drop(first);
    let second = Box::new([1u8; 40]);
    println!(
        "48 byte block freed at {freed_at:#x}, 40 byte block placed at {:#x} (same: {})\n",
        addr(&*second),
        freed_at == addr(&*second)
    );

    // Two neighbours freed one after the other become a single chunk, header included.
    let left = Box::new([0u8; 64]);
    let right = Box::new([0u8; 64]);
    let _guard = Box::new([0u8; 16]);
    let adjacent = addr(&*left) + 64 + CHUNK_HEADER_SIZE == addr(&*right);
    let left_at = addr(&*left);
    drop(left);
    drop(right);

    let merged = Box::new([0u8; MERGED]);
    println!(
        "neighbours: {adjacent}, {MERGED} byte block placed at {:#x}, merged chunk at {left_at:#x}",
        addr(&*merged)
    );

    // Every call takes the allocator lock, so threads share the heap safely.
    let workers: Vec<_> = (0..4)
        .map(|worker| {
            thread::spawn(move || (0..100).map(|len| vec![worker; len].len()).sum::<usize>())
        })
        .collect();
    let lengths: Vec<usize> = workers
        .into_iter()
        .map(|handle| handle.join().unwrap_or_default())
        .collect();
    println!("\nworkers allocated {lengths:?} elements");
}
