//! Error types surfaced at the edges of the allocator.
//!
//! Allocation itself never raises an error: `request_memory` returns
//! `None` on size-out-of-range or out-of-memory, exactly as the lock-free
//! search/claim protocol specifies. Only construction-time configuration
//! and free-time contract violations are reported as `Result`s.

use thiserror_no_std::Error;

/// Returned by [`crate::arena::BuddyArena::new`] when the runtime `levels`
/// argument, or the backing allocator, can't satisfy the arena's
/// preconditions. The compile-time size constants are checked separately,
/// at compile time (see `BuddyArena::ASSERT_CONFIG`).
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `levels` is too small to hold even one node at `MAX_ALLOCABLE_BYTE`.
    #[error("arena of {levels} levels cannot host a max-size block of {max} bytes")]
    LevelsTooFew { levels: u32, max: usize },

    /// The backing allocator failed to supply the arena or tree storage.
    #[error("failed to allocate backing storage")]
    AllocationFailed,
}

/// Returned by [`crate::arena::BuddyArena::free`] when the node handed back
/// was not actually occupied (double free, or a handle from a different
/// arena).
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum FreeError {
    /// `free` was called on a node whose state was not `OCCUPY_BLOCK`.
    #[error("node at position {pos} was not occupied")]
    NotOccupied { pos: usize },
}
