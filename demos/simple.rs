#![feature(allocator_api)]

extern crate buddy_arena;

use buddy_arena::{BuddyArena, ThreadEnv};

use std::{alloc::Global, cell::Cell, sync::Arc};

thread_local! {
    static MY_ID: Cell<usize> = Cell::new(0);
}

const NUM_THREADS: usize = 4;

struct Cpu;

impl ThreadEnv for Cpu {
    fn my_id() -> usize {
        MY_ID.with(Cell::get)
    }

    fn num_threads() -> usize {
        NUM_THREADS
    }
}

fn main() {
    let arena: BuddyArena<8, 16384, 4096, Cpu, Global> =
        BuddyArena::new(12, &Global).unwrap();
    let arena = Arc::new(arena);

    std::thread::scope(|s| {
        for id in 0..NUM_THREADS {
            let arena = arena.clone();
            s.spawn(move || {
                MY_ID.with(|c| c.set(id));

                let block = arena.request_memory(16).unwrap();
                arena.free(block).unwrap();
            });
        }
    });
}
