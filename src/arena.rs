//! The allocator itself: search/placement policy, single-node claim,
//! ancestor marking, rollback, and free.

use core::alloc::{Allocator, Layout};
use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::error::{ConfigError, FreeError};
use crate::node::{MarkOutcome, Side, OCCUPY_BLOCK};
use crate::thread_env::ThreadEnv;
use crate::tree::{Node, Tree};

/// A handle to a granted region, returned by [`BuddyArena::request_memory`]
/// and consumed by [`BuddyArena::free`].
///
/// Borrowed from the arena it came from; the caller cannot mutate it and
/// must hand it back via `free`.
#[derive(Debug)]
pub struct AllocatedBlock<'s> {
    pos: usize,
    mem_start: usize,
    mem_size: usize,
    _marker: PhantomData<&'s ()>,
}

impl<'s> AllocatedBlock<'s> {
    /// Byte offset of this region within the arena.
    #[inline]
    pub fn mem_start(&self) -> usize {
        self.mem_start
    }

    /// Size in bytes of this region (a power of two, `>= MIN_ALLOCABLE_BYTES`).
    #[inline]
    pub fn mem_size(&self) -> usize {
        self.mem_size
    }
}

/// Lock-free buddy-system arena allocator.
///
/// `MIN_ALLOCABLE_BYTES` and `MAX_ALLOCABLE_BYTE` bound the sizes this
/// allocator will hand out; both must be powers of two with
/// `MIN_ALLOCABLE_BYTES <= MAX_ALLOCABLE_BYTE`. `PAGE_SIZE` is used only to
/// align the arena's backing allocation, not as a size-class boundary.
/// `T` supplies the calling thread's identity so concurrent callers spread
/// their initial search position across a size class. `A` backs the
/// internal tree and arena storage.
pub struct BuddyArena<
    'a,
    const MIN_ALLOCABLE_BYTES: usize = 8,
    const MAX_ALLOCABLE_BYTE: usize = 16384,
    const PAGE_SIZE: usize = 4096,
    T: ThreadEnv = crate::thread_env::SingleThreaded,
    A: Allocator = alloc::alloc::Global,
> {
    tree: Tree<'a, A>,
    arena_ptr: NonNull<u8>,
    arena_layout: Layout,
    backend: &'a A,
    _thread: PhantomData<T>,
}

impl<
        'a,
        const MIN_ALLOCABLE_BYTES: usize,
        const MAX_ALLOCABLE_BYTE: usize,
        const PAGE_SIZE: usize,
        T: ThreadEnv,
        A: Allocator,
    > BuddyArena<'a, MIN_ALLOCABLE_BYTES, MAX_ALLOCABLE_BYTE, PAGE_SIZE, T, A>
{
    /// Checked at first use of any instantiation: `MIN_ALLOCABLE_BYTES`,
    /// `MAX_ALLOCABLE_BYTE`, and `PAGE_SIZE` must all be powers of two, and
    /// `MIN_ALLOCABLE_BYTES` must not exceed `MAX_ALLOCABLE_BYTE`. These are
    /// compile-time consts, so a violation is a hard compile error at the
    /// call site that monomorphizes the bad combination, not a `ConfigError`
    /// (`ConfigError` covers the runtime `levels` argument instead).
    const ASSERT_CONFIG: () = {
        assert!(
            MIN_ALLOCABLE_BYTES.is_power_of_two(),
            "MIN_ALLOCABLE_BYTES must be a power of two"
        );
        assert!(
            MAX_ALLOCABLE_BYTE.is_power_of_two(),
            "MAX_ALLOCABLE_BYTE must be a power of two"
        );
        assert!(PAGE_SIZE.is_power_of_two(), "PAGE_SIZE must be a power of two");
        assert!(
            MIN_ALLOCABLE_BYTES <= MAX_ALLOCABLE_BYTE,
            "MIN_ALLOCABLE_BYTES must not exceed MAX_ALLOCABLE_BYTE"
        );
    };

    /// Builds a new arena of `levels` tree levels, i.e.
    /// `MIN_ALLOCABLE_BYTES * 2^(levels - 1)` bytes, backed by `backend`.
    ///
    /// Fails if `levels == 0` or the resulting arena is too small to ever
    /// host a `MAX_ALLOCABLE_BYTE` block (the size class for `MAX` would
    /// not exist).
    pub fn new(levels: u32, backend: &'a A) -> Result<Self, ConfigError> {
        let _ = Self::ASSERT_CONFIG;

        if levels == 0 {
            return Err(ConfigError::LevelsTooFew {
                levels,
                max: MAX_ALLOCABLE_BYTE,
            });
        }

        let overall_memory_size = MIN_ALLOCABLE_BYTES << (levels - 1);

        if overall_memory_size < MAX_ALLOCABLE_BYTE {
            return Err(ConfigError::LevelsTooFew {
                levels,
                max: MAX_ALLOCABLE_BYTE,
            });
        }

        let arena_layout = Layout::from_size_align(overall_memory_size, PAGE_SIZE)
            .map_err(|_| ConfigError::AllocationFailed)?;

        let arena_ptr = backend
            .allocate_zeroed(arena_layout)
            .map_err(|_| ConfigError::AllocationFailed)?
            .as_non_null_ptr();

        let tree = match Tree::new(levels, overall_memory_size, backend) {
            Ok(tree) => tree,
            Err(e) => {
                // SAFETY: `arena_ptr`/`arena_layout` came from this same
                // `backend.allocate_zeroed` call above and nothing else
                // observed it yet.
                unsafe { backend.deallocate(arena_ptr, arena_layout) };
                return Err(e);
            }
        };

        Ok(Self {
            tree,
            arena_ptr,
            arena_layout,
            backend,
            _thread: PhantomData,
        })
    }

    /// Raw pointer to the start of the backing arena. Combine with an
    /// [`AllocatedBlock`]'s `mem_start`/`mem_size` to address a granted
    /// region.
    #[inline]
    pub fn arena_ptr(&self) -> NonNull<u8> {
        self.arena_ptr
    }

    /// Total arena size in bytes (`MIN_ALLOCABLE_BYTES * 2^(levels - 1)`).
    #[inline]
    pub fn arena_size(&self) -> usize {
        self.tree.root().mem_size
    }

    #[inline]
    fn side_of<'t>(&'t self, parent: &'t Node, child: &Node) -> Side {
        if self.tree.left_of(parent).pos == child.pos {
            Side::Left
        } else {
            Side::Right
        }
    }

    /// Request a region of at least `bytes` bytes. `bytes` is rounded up to
    /// the next power of two and floored at `MIN_ALLOCABLE_BYTES`. Returns
    /// `None` if `bytes` exceeds `MAX_ALLOCABLE_BYTE` or the arena size, or
    /// if one full scan of the size class found no free block.
    pub fn request_memory(&self, bytes: usize) -> Option<AllocatedBlock<'_>> {
        if bytes > MAX_ALLOCABLE_BYTE || bytes > self.arena_size() {
            return None;
        }

        let bytes = bytes.next_power_of_two().max(MIN_ALLOCABLE_BYTES);

        let class_start = self.arena_size() / bytes;
        let class_end = class_start * 2 - 1;

        let my_id = T::my_id();
        let num_threads = T::num_threads().max(1);
        let span = (class_end - class_start + 1) / num_threads;

        let mut actual = class_start + my_id * span;
        let started_at = actual;
        let mut restarted = false;

        loop {
            match self.try_claim_node(actual) {
                Ok(()) => {
                    let node = self.tree.node(actual);
                    return Some(AllocatedBlock {
                        pos: node.pos,
                        mem_start: node.mem_start,
                        mem_size: node.mem_size,
                        _marker: PhantomData,
                    });
                }
                Err(failed) => {
                    let level_actual = self.tree.level(self.tree.node(actual));
                    let level_failed = self.tree.level(self.tree.node(failed));
                    actual = (failed + 1) * (1usize << (level_actual - level_failed));
                }
            }

            if actual > class_end {
                actual = class_start;
                restarted = true;
            }

            if restarted && actual >= started_at {
                return None;
            }
        }
    }

    /// Single-node claim (spec §4.4): CAS `0 -> OCCUPY_BLOCK`, then mark
    /// ancestors on success. Returns the position at which the attempt
    /// failed (the node itself, or the ancestor where marking was blocked)
    /// so the caller can skip the corresponding subtree.
    fn try_claim_node(&self, pos: usize) -> Result<(), usize> {
        let node = self.tree.node(pos);

        if !node.state().try_claim() {
            return Err(pos);
        }

        if node.pos == self.tree.root().pos {
            return Ok(());
        }

        self.mark_ancestors(node)
    }

    /// Ancestor occupation marking (spec §4.2.1). On failure, rolls back
    /// via the free protocol with `upper_bound` set to the highest
    /// successfully-marked ancestor (or `n` itself if the immediate parent
    /// was already occupied).
    fn mark_ancestors(&self, n: &Node) -> Result<(), usize> {
        let mut child = n;

        loop {
            let a = self.tree.parent_of(child);
            let side = self.side_of(a, child);

            match a.state().mark_occupied(side) {
                MarkOutcome::Blocked => {
                    self.free_protocol(n, child);
                    return Err(a.pos);
                }
                MarkOutcome::Marked => {}
            }

            if a.pos == self.tree.root().pos {
                return Ok(());
            }

            child = a;
        }
    }

    /// Coalescing + occupancy rollback, shared by rollback-on-failed-mark
    /// and `free` (spec §4.2.2).
    fn free_protocol(&self, n: &Node, upper_bound: &Node) {
        if n.pos != upper_bound.pos {
            self.mark_coalescing(n, upper_bound);
        }

        n.state().release();

        if n.pos != upper_bound.pos {
            self.clear_ancestors(n, upper_bound);
        }
    }

    /// Phase 1: set `COAL_side` at every ancestor from `parent(n)` up
    /// through `upper_bound`, inclusive (Q3: `upper_bound` is inclusive).
    fn mark_coalescing(&self, n: &Node, upper_bound: &Node) {
        let mut runner = n;

        loop {
            let actual = self.tree.parent_of(runner);
            let side = self.side_of(actual, runner);

            actual.state().set_coalescing(side);

            if actual.pos == upper_bound.pos {
                return;
            }

            runner = actual;
        }
    }

    /// Phase 3 (`smarca_`): clear `COAL_side`/`OCC_side` from `parent(n)`
    /// upward, stopping as soon as the coalesce bit is already clear
    /// (someone else finished, or the branch was re-allocated) or the
    /// sibling subtree is still occupied.
    fn clear_ancestors(&self, n: &Node, upper_bound: &Node) {
        let mut runner = n;

        loop {
            let actual = self.tree.parent_of(runner);
            let side = self.side_of(actual, runner);

            if !actual.state().clear_occupied(side) {
                return;
            }

            if actual.pos == upper_bound.pos {
                return;
            }

            let sibling_side = match side {
                Side::Left => Side::Right,
                Side::Right => Side::Left,
            };

            if actual.state().is_occupied_on(sibling_side) {
                return;
            }

            runner = actual;
        }
    }

    /// Frees a previously granted block. A no-op (reported as
    /// `Err(FreeError::NotOccupied)` and logged) if the node was not
    /// actually occupied — a double free, or a handle from a different
    /// arena.
    pub fn free(&self, block: AllocatedBlock<'_>) -> Result<(), FreeError> {
        let node = self.tree.node(block.pos);

        if node.state().load() != OCCUPY_BLOCK {
            log::warn!("free called on node {} which is not occupied", block.pos);
            return Err(FreeError::NotOccupied { pos: block.pos });
        }

        self.free_protocol(node, self.tree.root());
        Ok(())
    }
}

impl<
        const MIN_ALLOCABLE_BYTES: usize,
        const MAX_ALLOCABLE_BYTE: usize,
        const PAGE_SIZE: usize,
        T: ThreadEnv,
        A: Allocator,
    > Drop for BuddyArena<'_, MIN_ALLOCABLE_BYTES, MAX_ALLOCABLE_BYTE, PAGE_SIZE, T, A>
{
    fn drop(&mut self) {
        // SAFETY: `arena_ptr`/`arena_layout` came from `backend.allocate_zeroed`
        // in `new` and are dropped exactly once.
        unsafe { self.backend.deallocate(self.arena_ptr, self.arena_layout) };
    }
}

unsafe impl<
        const MIN_ALLOCABLE_BYTES: usize,
        const MAX_ALLOCABLE_BYTE: usize,
        const PAGE_SIZE: usize,
        T: ThreadEnv,
        A: Allocator,
    > Send for BuddyArena<'_, MIN_ALLOCABLE_BYTES, MAX_ALLOCABLE_BYTE, PAGE_SIZE, T, A>
{
}

unsafe impl<
        const MIN_ALLOCABLE_BYTES: usize,
        const MAX_ALLOCABLE_BYTE: usize,
        const PAGE_SIZE: usize,
        T: ThreadEnv,
        A: Allocator,
    > Sync for BuddyArena<'_, MIN_ALLOCABLE_BYTES, MAX_ALLOCABLE_BYTE, PAGE_SIZE, T, A>
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_env::SingleThreaded;
    use alloc::alloc::Global;
    use std::thread;

    // MIN=8, MAX=64, levels=4 -> arena=64 bytes, 15 nodes (matches spec
    // §8's concrete scenarios; MAX is pinned to the arena size itself so
    // `new` doesn't trip its own "arena big enough to host MAX" check).
    type TestArena<'a> = BuddyArena<'a, 8, 64, 4096, SingleThreaded, Global>;

    fn small_arena() -> TestArena<'static> {
        TestArena::new(4, &Global).unwrap()
    }

    #[test]
    fn s1_allocate_leaf_and_free() {
        let arena = small_arena();

        let block = arena.request_memory(8).unwrap();
        assert_eq!(block.mem_size(), 8);
        assert!((8..=15).contains(&block.pos));

        let leaf = arena.tree.node(block.pos);
        assert_eq!(leaf.state().load(), OCCUPY_BLOCK);

        let mut a = leaf.pos;
        while a > 1 {
            let parent = arena.tree.node(a / 2);
            let side = if a % 2 == 0 { Side::Left } else { Side::Right };
            assert!(parent.state().is_occupied_on(side));
            a /= 2;
        }

        arena.free(block).unwrap();

        for i in 1..=arena.tree.node_count() {
            assert_eq!(arena.tree.node(i).state().load(), 0);
        }
    }

    #[test]
    fn s2_allocate_whole_arena() {
        let arena = small_arena();

        let block = arena.request_memory(64).unwrap();
        assert_eq!(block.pos, 1);

        assert!(arena.request_memory(8).is_none());

        arena.free(block).unwrap();

        assert!(arena.request_memory(8).is_some());
    }

    #[test]
    fn s3_four_quarter_blocks_then_full() {
        let arena = small_arena();
        let mut blocks = Vec::new();
        let mut starts = Vec::new();

        for _ in 0..4 {
            let b = arena.request_memory(16).unwrap();
            assert_eq!(b.mem_size(), 16);
            starts.push(b.mem_start());
            blocks.push(b);
        }

        starts.sort_unstable();
        assert_eq!(starts, vec![0, 16, 32, 48]);

        assert!(arena.request_memory(8).is_none());

        for b in blocks {
            arena.free(b).unwrap();
        }
    }

    #[test]
    fn s5_allocate_all_leaves_then_free_reverse() {
        let arena = small_arena();
        let mut blocks = Vec::new();

        for _ in 0..8 {
            blocks.push(arena.request_memory(8).unwrap());
        }
        assert!(arena.request_memory(8).is_none());

        for b in blocks.into_iter().rev() {
            arena.free(b).unwrap();
        }

        for i in 1..=arena.tree.node_count() {
            assert_eq!(arena.tree.node(i).state().load(), 0);
        }
    }

    #[test]
    fn s6_sibling_search_skips_occupied_subtree() {
        let arena = small_arena();

        // Occupy leaf-pair node 5 (16-byte class) so node 2's OCC_L is set.
        arena.try_claim_node(5).expect("node 5 should be claimable");

        assert!(arena.tree.node(2).state().is_occupied_on(Side::Left));

        let block = arena.request_memory(32).unwrap();
        assert_eq!(block.pos, 3);
    }

    #[test]
    fn size_rounds_up_and_floors_at_min() {
        let arena = small_arena();

        let block = arena.request_memory(1).unwrap();
        assert_eq!(block.mem_size(), 8);

        arena.free(block).unwrap();

        let block = arena.request_memory(9).unwrap();
        assert_eq!(block.mem_size(), 16);
        arena.free(block).unwrap();
    }

    #[test]
    fn rejects_over_max_and_over_arena() {
        let arena = small_arena();
        assert!(arena.request_memory(64 + 1).is_none());

        // MIN=8, MAX=16, levels=2 -> arena=16 bytes: the smallest config
        // that can host a MAX-size block.
        let tiny: BuddyArena<8, 16, 4096, SingleThreaded, Global> =
            BuddyArena::new(2, &Global).unwrap();
        assert!(tiny.request_memory(100).is_none());
    }

    #[test]
    fn double_free_is_reported_and_noop() {
        let arena = small_arena();
        let block = arena.request_memory(8).unwrap();
        let pos = block.pos;

        arena.free(block).unwrap();

        let fake = AllocatedBlock {
            pos,
            mem_start: arena.tree.node(pos).mem_start,
            mem_size: arena.tree.node(pos).mem_size,
            _marker: PhantomData,
        };

        assert!(arena.free(fake).is_err());
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let arena: TestArena<'static> = TestArena::new(6, &Global).unwrap();
        let arena = std::sync::Arc::new(arena);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let arena = arena.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    for _ in 0..8 {
                        if let Some(b) = arena.request_memory(8) {
                            got.push((b.mem_start(), b.mem_size()));
                            arena.free(b).unwrap();
                        }
                    }
                    got
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        for i in 1..=arena.tree.node_count() {
            assert_eq!(arena.tree.node(i).state().load(), 0);
        }
    }
}
