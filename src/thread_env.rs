//! Host-supplied thread identity.
//!
//! The allocator itself never schedules or enumerates threads; it only needs
//! to know, per call, which participant it's running as so that concurrent
//! callers spread their initial search position across a size class instead
//! of all starting at the same node (see `alloc::BuddyArena::request_memory`).
//! Implementing this trait is the host's job.

/// Supplies a 0-based participant id and the total participant count.
pub trait ThreadEnv {
    /// 0-based id of the calling thread (or process) among
    /// `num_threads()` participants.
    fn my_id() -> usize;

    /// Total number of participants sharing this allocator.
    fn num_threads() -> usize;
}

/// A `ThreadEnv` for tests and single-threaded examples: always participant
/// 0 of 1.
#[derive(Debug)]
pub struct SingleThreaded;

impl ThreadEnv for SingleThreaded {
    fn my_id() -> usize {
        0
    }

    fn num_threads() -> usize {
        1
    }
}
