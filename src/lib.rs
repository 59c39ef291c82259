//! Lock-free buddy-system arena allocator.
//!
//! Partitions a single contiguous arena among many concurrent requesters
//! using a binary buddy scheme. Allocation and deallocation make progress
//! through CAS operations on per-node bitmaps arranged as an implicit
//! binary tree — no caller ever takes a lock.
//!
//! The allocator itself doesn't know which thread it's being called from;
//! implement [`ThreadEnv`] to supply that, the way the host application
//! already tracks its own thread/process ids.
#![feature(allocator_api)]
#![feature(slice_ptr_get)]
#![allow(dead_code)]

extern crate alloc;

mod error;
mod node;
mod thread_env;
mod tree;

pub mod arena;

pub use arena::{AllocatedBlock, BuddyArena};
pub use error::{ConfigError, FreeError};
pub use thread_env::{SingleThreaded, ThreadEnv};

// Sanity-check the documented defaults (MIN=8, MAX=16384, PAGE=4096) at
// compile time. Arbitrary instantiations are checked per-use in
// `BuddyArena::ASSERT_CONFIG`, since `const_assert!` can't see generic
// const parameters from outside the impl that declares them.
static_assertions::const_assert!(8usize.is_power_of_two());
static_assertions::const_assert!(16384usize.is_power_of_two());
static_assertions::const_assert!(4096usize.is_power_of_two());
static_assertions::const_assert!(8usize <= 16384usize);
