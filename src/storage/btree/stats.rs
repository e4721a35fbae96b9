use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B-tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeStatsSnapshot {
    /// Number of leaf node splits performed
    pub leaf_splits: u64,
    /// Number of internal node splits performed
    pub internal_splits: u64,
    /// Number of leaf rebalances that moved entries from a sibling
    pub leaf_steals: u64,
    /// Number of internal rebalances that moved children from a sibling
    pub internal_steals: u64,
    /// Number of leaf node merges performed
    pub leaf_merges: u64,
    /// Number of internal node merges performed
    pub internal_merges: u64,
    /// Number of frozen nodes copied before modification
    pub cow_copies: u64,
    /// Number of unfrozen nodes modified where they live
    pub in_place_edits: u64,
    /// Number of times the tree grew a level
    pub root_splits: u64,
    /// Number of times the tree lost a level
    pub root_collapses: u64,
}

/// Thread-safe statistics tracking for B-tree operations.
#[derive(Default, Debug)]
pub struct BTreeStats {
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    leaf_steals: AtomicU64,
    internal_steals: AtomicU64,
    leaf_merges: AtomicU64,
    internal_merges: AtomicU64,
    cow_copies: AtomicU64,
    in_place_edits: AtomicU64,
    root_splits: AtomicU64,
    root_collapses: AtomicU64,
}

impl BTreeStats {
    /// Returns the current count of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of internal splits.
    pub fn internal_splits(&self) -> u64 {
        self.internal_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf steals.
    pub fn leaf_steals(&self) -> u64 {
        self.leaf_steals.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of internal steals.
    pub fn internal_steals(&self) -> u64 {
        self.internal_steals.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf merges.
    pub fn leaf_merges(&self) -> u64 {
        self.leaf_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of internal merges.
    pub fn internal_merges(&self) -> u64 {
        self.internal_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of copy-on-write node copies.
    pub fn cow_copies(&self) -> u64 {
        self.cow_copies.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of nodes edited without copying.
    pub fn in_place_edits(&self) -> u64 {
        self.in_place_edits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of root splits.
    pub fn root_splits(&self) -> u64 {
        self.root_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of root collapses.
    pub fn root_collapses(&self) -> u64 {
        self.root_collapses.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_splits(&self, leaf: bool) {
        let counter = if leaf {
            &self.leaf_splits
        } else {
            &self.internal_splits
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_steals(&self, leaf: bool) {
        let counter = if leaf {
            &self.leaf_steals
        } else {
            &self.internal_steals
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self, leaf: bool) {
        let counter = if leaf {
            &self.leaf_merges
        } else {
            &self.internal_merges
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_cow_copies(&self) {
        self.cow_copies.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_in_place_edits(&self) {
        self.in_place_edits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            leaf_splits: self.leaf_splits(),
            internal_splits: self.internal_splits(),
            leaf_steals: self.leaf_steals(),
            internal_steals: self.internal_steals(),
            leaf_merges: self.leaf_merges(),
            internal_merges: self.internal_merges(),
            cow_copies: self.cow_copies(),
            in_place_edits: self.in_place_edits(),
            root_splits: self.root_splits(),
            root_collapses: self.root_collapses(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "epochtree::btree::stats",
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            leaf_steals = snapshot.leaf_steals,
            internal_steals = snapshot.internal_steals,
            leaf_merges = snapshot.leaf_merges,
            internal_merges = snapshot.internal_merges,
            cow_copies = snapshot.cow_copies,
            in_place_edits = snapshot.in_place_edits,
            root_splits = snapshot.root_splits,
            root_collapses = snapshot.root_collapses,
            "btree stats snapshot"
        );
    }
}
