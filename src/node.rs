//! Per-node atomic bitmap.
//!
//! Each tree node owns a single 32-bit atomic word with 5 live bits:
//!
//! ```text
//!  bit 4        bit 3     bit 2      bit 1    bit 0
//!  OCC_SELF     COAL_L    COAL_R     OCC_L    OCC_R
//! ```
//!
//! `OCC_SELF` means the node itself was claimed as one block. `OCC_L`/`OCC_R`
//! mean some descendant in that subtree is occupied or partially occupied.
//! `COAL_L`/`COAL_R` are advisory: a free is in the middle of tearing that
//! subtree down. A node is fully free when its word is zero.

#[cfg(not(loom))]
use core::sync::atomic::{AtomicU32, Ordering};
#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, Ordering};

pub(crate) const OCC_R: u32 = 0x1;
pub(crate) const OCC_L: u32 = 0x2;
pub(crate) const COAL_R: u32 = 0x4;
pub(crate) const COAL_L: u32 = 0x8;
pub(crate) const OCC_SELF: u32 = 0x10;

/// `OCC_SELF | OCC_L | OCC_R`: the word of a node claimed whole.
pub(crate) const OCCUPY_BLOCK: u32 = OCC_SELF | OCC_L | OCC_R;

/// Which child subtree an ancestor update concerns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

impl Side {
    #[inline]
    fn occ_mask(self) -> u32 {
        match self {
            Side::Left => OCC_L,
            Side::Right => OCC_R,
        }
    }

    #[inline]
    fn coal_mask(self) -> u32 {
        match self {
            Side::Left => COAL_L,
            Side::Right => COAL_R,
        }
    }
}

/// Outcome of an attempted occupation-mark CAS at one ancestor.
pub(crate) enum MarkOutcome {
    /// The ancestor is occupied as a whole block; marking (and the caller's
    /// allocation) must fail here.
    Blocked,
    /// The CAS committed (or was skipped as a no-op because the bits were
    /// already set).
    Marked,
}

/// Atomic bitmap for one tree node. Lives behind `CachePadded` in `tree.rs`.
#[derive(Debug)]
pub(crate) struct NodeState(AtomicU32);

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeState {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub(crate) fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.load() == 0
    }

    /// Claim a fully free node whole: `0 -> OCCUPY_BLOCK`.
    ///
    /// Returns `true` on success. The transition out of zero is single-writer
    /// by construction, so there is no ABA hazard here.
    pub(crate) fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(0, OCCUPY_BLOCK, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Propagate occupation upward into an ancestor: set `OCC_side`, clear
    /// `COAL_side`. Fails if the ancestor already has `OCC_SELF` set.
    pub(crate) fn mark_occupied(&self, side: Side) -> MarkOutcome {
        loop {
            let v = self.0.load(Ordering::Acquire);

            if v & OCC_SELF != 0 {
                return MarkOutcome::Blocked;
            }

            let v_new = (v & !side.coal_mask()) | side.occ_mask();

            if v_new == v {
                return MarkOutcome::Marked;
            }

            if self
                .0
                .compare_exchange(v, v_new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return MarkOutcome::Marked;
            }
        }
    }

    /// Release a claimed node: plain store of zero. Safe because while
    /// `OCC_SELF` is set, no other party may CAS this node (I3 + the claim
    /// rule), so nothing races this store.
    pub(crate) fn release(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Idempotent OR of the coalesce bit for `side`. No CAS loop needed.
    pub(crate) fn set_coalescing(&self, side: Side) {
        self.0.fetch_or(side.coal_mask(), Ordering::AcqRel);
    }

    /// Clear `COAL_side` and `OCC_side` at this node if `COAL_side` is
    /// still set. Returns `true` if the clearing CAS committed (or was
    /// already satisfied as a no-op), `false` if the coalesce bit was
    /// already clear (another party got here first, or the branch was
    /// re-allocated) — the caller must stop walking upward in that case.
    pub(crate) fn clear_occupied(&self, side: Side) -> bool {
        loop {
            let v = self.0.load(Ordering::Acquire);

            if v & side.coal_mask() == 0 {
                return false;
            }

            let v_new = v & !side.coal_mask() & !side.occ_mask();

            if v_new == v {
                return true;
            }

            if self
                .0
                .compare_exchange(v, v_new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    #[inline]
    pub(crate) fn is_occupied_on(&self, side: Side) -> bool {
        self.load() & side.occ_mask() != 0
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn claim_is_single_writer() {
        let n = NodeState::new();
        assert!(n.try_claim());
        assert!(!n.try_claim());
        assert_eq!(n.load(), OCCUPY_BLOCK);
    }

    #[test]
    fn mark_occupied_sets_side_and_clears_coalesce() {
        let n = NodeState::new();
        n.set_coalescing(Side::Left);
        assert!(matches!(n.mark_occupied(Side::Left), MarkOutcome::Marked));
        assert_eq!(n.load(), OCC_L);
    }

    #[test]
    fn mark_occupied_blocked_by_occ_self() {
        let n = NodeState::new();
        assert!(n.try_claim());
        assert!(matches!(n.mark_occupied(Side::Right), MarkOutcome::Blocked));
    }

    #[test]
    fn set_coalescing_is_idempotent() {
        let n = NodeState::new();
        n.set_coalescing(Side::Left);
        let v1 = n.load();
        n.set_coalescing(Side::Left);
        assert_eq!(n.load(), v1);
    }

    #[test]
    fn clear_occupied_no_op_when_coal_already_clear() {
        let n = NodeState::new();
        assert!(!n.clear_occupied(Side::Left));
    }

    #[test]
    fn release_then_reclaim() {
        let n = NodeState::new();
        assert!(n.try_claim());
        n.release();
        assert!(n.is_free());
        assert!(n.try_claim());
    }
}
