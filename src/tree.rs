//! The implicit heap array and its backing storage.
//!
//! Geometry (`pos`, `mem_start`, `mem_size`) is frozen once the tree is
//! built; only each node's [`NodeState`] is mutated afterwards. `tree[0]` is
//! an unused dummy slot so that `tree[1]` is the root and child indices fall
//! out of plain arithmetic (`2*i`, `2*i+1`).

use core::alloc::{Allocator, Layout};
use core::ptr::NonNull;

use crate::error::ConfigError;
use crate::node::NodeState;
use crossbeam_utils::CachePadded;

/// One node of the implicit buddy tree.
pub(crate) struct Node {
    pub pos: usize,
    pub mem_start: usize,
    pub mem_size: usize,
    state: CachePadded<NodeState>,
}

impl Node {
    #[inline]
    pub(crate) fn state(&self) -> &NodeState {
        &self.state
    }
}

pub(crate) struct Tree<'a, A: Allocator> {
    tree: &'a mut [Node],
    backend: &'a A,
    layout: Layout,
}

impl<'a, A: Allocator> Tree<'a, A> {
    #[inline]
    pub(crate) fn node_count_for_levels(levels: u32) -> usize {
        (1usize << levels) - 1
    }

    pub(crate) fn new(
        levels: u32,
        overall_memory_size: usize,
        backend: &'a A,
    ) -> Result<Self, ConfigError> {
        let node_count = Self::node_count_for_levels(levels);
        let slot_count = node_count + 1;

        let layout =
            Layout::array::<Node>(slot_count).map_err(|_| ConfigError::AllocationFailed)?;

        let raw = backend
            .allocate_zeroed(layout)
            .map_err(|_| ConfigError::AllocationFailed)?;

        // SAFETY: `raw` is a fresh zeroed allocation sized for `slot_count`
        // `Node`s. Every field of `Node` (plain integers and an
        // `AtomicU32`-backed state behind `CachePadded`) is valid at its
        // all-zero bit pattern, so the slice is a well-formed `&mut [Node]`
        // before `init_tree` overwrites the geometry fields below.
        let tree: &'a mut [Node] = unsafe {
            core::slice::from_raw_parts_mut(
                raw.as_non_null_ptr().as_ptr() as *mut Node,
                slot_count,
            )
        };

        Self::init_tree(tree, overall_memory_size);

        Ok(Self {
            tree,
            backend,
            layout,
        })
    }

    fn init_tree(tree: &mut [Node], overall_memory_size: usize) {
        tree[1].pos = 1;
        tree[1].mem_start = 0;
        tree[1].mem_size = overall_memory_size;

        for i in 2..tree.len() {
            let parent_size = tree[i / 2].mem_size;
            let parent_start = tree[i / 2].mem_start;
            let is_left = i % 2 == 0;

            tree[i].pos = i;
            tree[i].mem_size = parent_size / 2;
            tree[i].mem_start = if is_left {
                parent_start
            } else {
                parent_start + parent_size / 2
            };
        }
    }

    #[inline]
    pub(crate) fn node_count(&self) -> usize {
        self.tree.len() - 1
    }

    #[inline]
    pub(crate) fn root(&self) -> &Node {
        &self.tree[1]
    }

    #[inline]
    pub(crate) fn node(&self, pos: usize) -> &Node {
        &self.tree[pos]
    }

    #[inline]
    pub(crate) fn parent_of(&self, node: &Node) -> &Node {
        &self.tree[node.pos / 2]
    }

    #[inline]
    pub(crate) fn left_of(&self, node: &Node) -> &Node {
        &self.tree[node.pos * 2]
    }

    #[inline]
    pub(crate) fn right_of(&self, node: &Node) -> &Node {
        &self.tree[node.pos * 2 + 1]
    }

    /// 1-based depth of `node`: the root is level 1. Implicit-heap indices
    /// already encode depth as their bit length, so this needs no mem_size
    /// arithmetic (equivalent to the spec's
    /// `overall_height - log2(mem_size / MIN_ALLOCABLE_BYTES)`).
    #[inline]
    pub(crate) fn level(&self, node: &Node) -> u32 {
        usize::BITS - node.pos.leading_zeros()
    }
}

impl<A: Allocator> Drop for Tree<'_, A> {
    fn drop(&mut self) {
        // SAFETY: `self.tree.as_mut_ptr()` is the same pointer obtained from
        // `backend.allocate_zeroed` with `self.layout` in `new`, and no
        // other reference to it outlives `self`.
        unsafe {
            let ptr = NonNull::new_unchecked(self.tree.as_mut_ptr() as *mut u8);
            self.backend.deallocate(ptr, self.layout);
        }
    }
}
