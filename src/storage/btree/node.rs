use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::primitives::datastore::{DataStore, DataStoreStats, SlotTable};
use crate::storage::options::BTreeOptions;
use crate::types::{EntryRef, Generation, Result};

use super::aggregation::AggrCalc;
use super::iterator::SnapshotPin;
use super::stats::BTreeStats;

/// Sorted run of key/value pairs plus their cached aggregate.
#[derive(Clone, Debug)]
pub struct LeafNode<K, V, G> {
    pub(crate) keys: Vec<K>,
    pub(crate) values: Vec<V>,
    pub(crate) aggr: G,
}

/// Separators and children plus cached subtree summaries.
///
/// Separator `i` equals the largest key stored below child `i`.
#[derive(Clone, Debug)]
pub struct InternalNode<K, G> {
    pub(crate) keys: Vec<K>,
    pub(crate) children: Vec<EntryRef>,
    pub(crate) valid_leaves: usize,
    pub(crate) aggr: G,
}

/// A tree node as stored in the arena.
#[derive(Clone, Debug)]
pub enum Node<K, V, G> {
    /// Entry-holding node.
    Leaf(LeafNode<K, V, G>),
    /// Routing node.
    Internal(InternalNode<K, G>),
}

/// Node type stored for a tree aggregating with `A`.
pub type TreeNode<K, V, A> = Node<K, V, <A as AggrCalc<V>>::Aggregate>;

impl<K, V, G: Default> LeafNode<K, V, G> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            aggr: G::default(),
        }
    }

    pub(crate) fn split_off(&mut self, at: usize) -> Self {
        Self {
            keys: self.keys.split_off(at),
            values: self.values.split_off(at),
            aggr: G::default(),
        }
    }

    fn append(&mut self, mut other: Self) {
        self.keys.append(&mut other.keys);
        self.values.append(&mut other.values);
    }

    fn move_from_left(&mut self, left: &mut Self, count: usize) {
        let mut moved = left.split_off(left.len() - count);
        moved.append(std::mem::replace(self, Self::with_capacity(0)));
        *self = moved;
    }

    fn move_from_right(&mut self, right: &mut Self, count: usize) {
        let rest = right.split_off(count);
        let front = std::mem::replace(right, rest);
        self.append(front);
    }
}

impl<K, V, G> LeafNode<K, V, G> {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the leaf holds no entries.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in order.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Values, parallel to [`LeafNode::keys`].
    pub fn values(&self) -> &[V] {
        &self.values
    }

    /// Cached aggregate over the values.
    pub fn aggregated(&self) -> &G {
        &self.aggr
    }
}

impl<K, G: Default> InternalNode<K, G> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            children: Vec::with_capacity(capacity),
            valid_leaves: 0,
            aggr: G::default(),
        }
    }

    pub(crate) fn split_off(&mut self, at: usize) -> Self {
        Self {
            keys: self.keys.split_off(at),
            children: self.children.split_off(at),
            valid_leaves: 0,
            aggr: G::default(),
        }
    }

    fn append(&mut self, mut other: Self) {
        self.keys.append(&mut other.keys);
        self.children.append(&mut other.children);
    }

    fn move_from_left(&mut self, left: &mut Self, count: usize) {
        let mut moved = left.split_off(left.len() - count);
        moved.append(std::mem::replace(self, Self::with_capacity(0)));
        *self = moved;
    }

    fn move_from_right(&mut self, right: &mut Self, count: usize) {
        let rest = right.split_off(count);
        let front = std::mem::replace(right, rest);
        self.append(front);
    }
}

impl<K, G> InternalNode<K, G> {
    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Returns `true` if the node has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Separator keys in order.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Child handles, parallel to [`InternalNode::keys`].
    pub fn children(&self) -> &[EntryRef] {
        &self.children
    }

    /// Number of leaf entries in this subtree.
    pub fn valid_leaves(&self) -> usize {
        self.valid_leaves
    }

    /// Cached aggregate over the children.
    pub fn aggregated(&self) -> &G {
        &self.aggr
    }
}

impl<K, V, G> Node<K, V, G> {
    /// Returns `true` for leaves.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Views the node as a leaf.
    ///
    /// # Panics
    /// Panics on internal nodes.
    pub fn as_leaf(&self) -> &LeafNode<K, V, G> {
        match self {
            Node::Leaf(leaf) => leaf,
            Node::Internal(_) => panic!("expected a leaf node, found an internal node"),
        }
    }

    /// Views the node as an internal node.
    ///
    /// # Panics
    /// Panics on leaves.
    pub fn as_internal(&self) -> &InternalNode<K, G> {
        match self {
            Node::Internal(inner) => inner,
            Node::Leaf(_) => panic!("expected an internal node, found a leaf"),
        }
    }

    pub(crate) fn into_leaf(self) -> LeafNode<K, V, G> {
        match self {
            Node::Leaf(leaf) => leaf,
            Node::Internal(_) => panic!("expected a leaf node, found an internal node"),
        }
    }

    pub(crate) fn into_internal(self) -> InternalNode<K, G> {
        match self {
            Node::Internal(inner) => inner,
            Node::Leaf(_) => panic!("expected an internal node, found a leaf"),
        }
    }

    /// Entries (leaf) or children (internal).
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.len(),
            Node::Internal(inner) => inner.len(),
        }
    }

    /// Returns `true` if the node holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys (leaf) or separators (internal).
    pub fn keys(&self) -> &[K] {
        match self {
            Node::Leaf(leaf) => &leaf.keys,
            Node::Internal(inner) => &inner.keys,
        }
    }

    /// Largest key in the subtree.
    pub fn last_key(&self) -> Option<&K> {
        self.keys().last()
    }

    /// Number of leaf entries in the subtree.
    pub fn valid_leaves(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.len(),
            Node::Internal(inner) => inner.valid_leaves,
        }
    }

    /// Cached aggregate of the subtree.
    pub fn aggregated(&self) -> &G {
        match self {
            Node::Leaf(leaf) => &leaf.aggr,
            Node::Internal(inner) => &inner.aggr,
        }
    }
}

impl<K, V, G: Default> Node<K, V, G> {
    pub(crate) fn append(&mut self, other: Self) {
        match (self, other) {
            (Node::Leaf(dst), Node::Leaf(src)) => dst.append(src),
            (Node::Internal(dst), Node::Internal(src)) => dst.append(src),
            _ => panic!("merging siblings of different kinds"),
        }
    }

    pub(crate) fn move_from_left(&mut self, left: &mut Self, count: usize) {
        match (self, left) {
            (Node::Leaf(dst), Node::Leaf(src)) => dst.move_from_left(src, count),
            (Node::Internal(dst), Node::Internal(src)) => dst.move_from_left(src, count),
            _ => panic!("stealing from a sibling of a different kind"),
        }
    }

    pub(crate) fn move_from_right(&mut self, right: &mut Self, count: usize) {
        match (self, right) {
            (Node::Leaf(dst), Node::Leaf(src)) => dst.move_from_right(src, count),
            (Node::Internal(dst), Node::Internal(src)) => dst.move_from_right(src, count),
            _ => panic!("stealing from a sibling of a different kind"),
        }
    }
}

/// Token shared by every writer-side cursor of one allocator.
pub(crate) struct WriterPin;

/// Owns the node arena of one or more trees.
///
/// Readers resolve nodes through [`NodeAllocator::reader`]; all mutation goes
/// through the allocator's copy-on-write helpers.
///
/// Cursors handed out to the writer share a [`WriterPin`]. While any of them
/// is alive, the next mutation freezes the arena first and trimming is
/// deferred, so those cursors keep the snapshot they were positioned on.
pub struct NodeAllocator<K, V, A: AggrCalc<V>> {
    nodes: DataStore<TreeNode<K, V, A>>,
    options: BTreeOptions,
    calc: A,
    stats: Arc<BTreeStats>,
    cursors: Arc<WriterPin>,
    cursor_issued: AtomicBool,
}

impl<K, V, A> NodeAllocator<K, V, A>
where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
{
    /// Creates an allocator after validating `options`.
    pub fn new(options: BTreeOptions, calc: A) -> Result<Self> {
        options.validate()?;
        Ok(Self::with_valid_options(options, calc))
    }

    pub(crate) fn with_valid_options(options: BTreeOptions, calc: A) -> Self {
        Self {
            nodes: DataStore::new(),
            options,
            calc,
            stats: Arc::new(BTreeStats::default()),
            cursors: Arc::new(WriterPin),
            cursor_issued: AtomicBool::new(false),
        }
    }

    /// Options the trees of this allocator are shaped by.
    pub fn options(&self) -> &BTreeOptions {
        &self.options
    }

    /// Aggregation hooks.
    pub fn calc(&self) -> &A {
        &self.calc
    }

    /// Shared operation counters.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Arena accounting.
    pub fn memory_stats(&self) -> DataStoreStats {
        self.nodes.stats()
    }

    /// Read view shared with other threads.
    pub fn reader(&self) -> Arc<SlotTable<TreeNode<K, V, A>>> {
        self.nodes.reader()
    }

    /// Resolves `node`.
    ///
    /// # Panics
    /// Panics if `node` is invalid or has been reclaimed.
    pub fn resolve(&self, node: EntryRef) -> Arc<TreeNode<K, V, A>> {
        self.nodes.get(node)
    }

    /// Returns `true` once `node` has been published by a freeze.
    pub fn is_frozen(&self, node: EntryRef) -> bool {
        self.nodes.is_frozen(node)
    }

    /// Stores a new node, refreshing its cached summaries first.
    pub fn allocate(&mut self, mut node: TreeNode<K, V, A>) -> EntryRef {
        self.refresh(&mut node);
        self.nodes.allocate(node)
    }

    /// Copy-on-write access: returns the slot to write back and the content.
    pub fn edit(&mut self, node: EntryRef) -> (EntryRef, TreeNode<K, V, A>) {
        let (slot, content) = self.nodes.edit(node);
        if slot == node {
            self.stats.inc_in_place_edits();
        } else {
            self.stats.inc_cow_copies();
        }
        (slot, content)
    }

    /// Writes `content` into a slot returned by [`NodeAllocator::edit`],
    /// refreshing its cached summaries first.
    pub fn put(&mut self, slot: EntryRef, mut content: TreeNode<K, V, A>) {
        self.refresh(&mut content);
        self.nodes.put(slot, content);
    }

    /// Retires `node` for deferred release.
    pub fn hold(&mut self, node: EntryRef) {
        self.nodes.hold(node);
    }

    /// Retires every node of the subtree under `root`.
    pub fn hold_subtree(&mut self, root: EntryRef) {
        if !root.valid() {
            return;
        }
        let mut pending = vec![root];
        while let Some(node) = pending.pop() {
            if let Node::Internal(inner) = &*self.nodes.get(node) {
                pending.extend_from_slice(&inner.children);
            }
            self.nodes.hold(node);
        }
    }

    /// Marks every node allocated since the previous freeze as published.
    pub fn freeze(&mut self) {
        *self.cursor_issued.get_mut() = false;
        self.nodes.freeze();
    }

    /// Tags nodes retired since the last transfer with `generation`.
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.nodes.transfer_hold_lists(generation);
    }

    /// Releases nodes retired before `first_used`.
    ///
    /// Nothing is released while a writer-side cursor is alive.
    pub fn trim_hold_lists(&mut self, first_used: Generation) -> usize {
        let cursors = self.writer_cursors();
        if cursors > 0 {
            debug!(cursors, first_used, "btree.trim.deferred");
            return 0;
        }
        self.nodes.trim_hold_lists(first_used)
    }

    /// Number of writer-side cursors currently alive.
    pub fn writer_cursors(&self) -> usize {
        Arc::strong_count(&self.cursors) - 1
    }

    pub(crate) fn writer_pin(&self) -> SnapshotPin {
        self.note_cursor();
        SnapshotPin::Writer(Arc::clone(&self.cursors))
    }

    pub(crate) fn note_cursor(&self) {
        self.cursor_issued.store(true, Ordering::Relaxed);
    }

    /// Freezes the arena if a cursor issued since the last freeze is still
    /// alive. `exempt` counts cursors the caller rewrites itself.
    pub(crate) fn settle_cursors(&mut self, exempt: usize) {
        if !std::mem::take(self.cursor_issued.get_mut()) {
            return;
        }
        let cursors = self.writer_cursors();
        if cursors > exempt {
            debug!(cursors, "btree.cursors.freeze");
            self.nodes.freeze();
        }
    }

    /// Starts a compaction cycle; see [`DataStore::start_compact`].
    pub fn start_compact(&mut self) -> Vec<u32> {
        self.nodes.start_compact()
    }

    /// Ends a compaction cycle.
    pub fn finish_compact(&mut self, ids: Vec<u32>) {
        self.nodes.finish_compact(ids);
    }

    /// Returns `true` if `node` lives in a chunk being compacted.
    pub fn needs_move(&self, node: EntryRef) -> bool {
        self.nodes.needs_move(node)
    }

    /// Copies `node` into a fresh slot and retires the original.
    pub fn relocate(&mut self, node: EntryRef) -> EntryRef {
        let (slot, content) = self.nodes.relocate(node);
        self.nodes.put(slot, content);
        slot
    }

    pub(crate) fn relocate_for_edit(&mut self, node: EntryRef) -> (EntryRef, TreeNode<K, V, A>) {
        self.nodes.relocate(node)
    }

    /// Recomputes the aggregate (and entry count) of `node` from its content.
    ///
    /// Children of an internal node must already be resolvable.
    pub(crate) fn refresh(&self, node: &mut TreeNode<K, V, A>) {
        match node {
            Node::Leaf(leaf) => {
                leaf.aggr = self.calc.from_values(&leaf.values);
            }
            Node::Internal(inner) => {
                let mut aggr = A::Aggregate::default();
                let mut valid_leaves = 0usize;
                for &child in &inner.children {
                    let child = self.nodes.get(child);
                    self.calc.merge(&mut aggr, child.aggregated());
                    valid_leaves += child.valid_leaves();
                }
                inner.aggr = aggr;
                inner.valid_leaves = valid_leaves;
            }
        }
    }

    /// Leaf (`true`) or internal capacity.
    pub(crate) fn max_slots(&self, leaf: bool) -> usize {
        if leaf {
            self.options.leaf_slots
        } else {
            self.options.internal_slots
        }
    }

    /// Leaf (`true`) or internal underflow bound.
    pub(crate) fn min_slots(&self, leaf: bool) -> usize {
        if leaf {
            self.options.min_leaf_slots()
        } else {
            self.options.min_internal_slots()
        }
    }

    pub(crate) fn threshold(&self) -> usize {
        self.options.binary_search_threshold
    }

    pub(crate) fn stats_ref(&self) -> &BTreeStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::aggregation::MinMaxAggrCalc;

    type Alloc = NodeAllocator<u32, i32, MinMaxAggrCalc>;

    fn leaf(keys: &[u32]) -> TreeNode<u32, i32, MinMaxAggrCalc> {
        Node::Leaf(LeafNode {
            keys: keys.to_vec(),
            values: keys.iter().map(|&k| k as i32 + 100).collect(),
            aggr: Default::default(),
        })
    }

    #[test]
    fn allocate_refreshes_aggregates() -> Result<()> {
        let mut alloc = Alloc::new(BTreeOptions::default(), MinMaxAggrCalc)?;
        let a = alloc.allocate(leaf(&[1, 5]));
        let b = alloc.allocate(leaf(&[7, 9]));
        let root = alloc.allocate(Node::Internal(InternalNode {
            keys: vec![5, 9],
            children: vec![a, b],
            valid_leaves: 0,
            aggr: Default::default(),
        }));
        let root = alloc.resolve(root);
        assert_eq!(root.valid_leaves(), 4);
        assert_eq!(root.aggregated().to_string(), "min=101,max=109");
        Ok(())
    }

    #[test]
    fn frozen_nodes_are_copied_on_edit() -> Result<()> {
        let mut alloc = Alloc::new(BTreeOptions::default(), MinMaxAggrCalc)?;
        let a = alloc.allocate(leaf(&[1]));
        let (slot, node) = alloc.edit(a);
        assert_eq!(slot, a);
        alloc.put(slot, node);
        alloc.freeze();
        let (copy, node) = alloc.edit(a);
        assert_ne!(copy, a);
        alloc.put(copy, node);
        let stats = alloc.stats().snapshot();
        assert_eq!(stats.in_place_edits, 1);
        assert_eq!(stats.cow_copies, 1);
        Ok(())
    }

    #[test]
    fn sibling_moves_preserve_order() {
        let mut left = leaf(&[1, 2, 3, 4, 5]);
        let mut right = leaf(&[8, 9]);
        right.move_from_left(&mut left, 2);
        assert_eq!(left.keys(), &[1, 2, 3]);
        assert_eq!(right.keys(), &[4, 5, 8, 9]);
        left.move_from_right(&mut right, 1);
        assert_eq!(left.keys(), &[1, 2, 3, 4]);
        assert_eq!(right.keys(), &[5, 8, 9]);
        left.append(right);
        assert_eq!(left.keys(), &[1, 2, 3, 4, 5, 8, 9]);
    }

    #[test]
    #[should_panic(expected = "expected a leaf node")]
    fn wrong_kind_is_fatal() {
        let inner: TreeNode<u32, i32, MinMaxAggrCalc> =
            Node::Internal(InternalNode::with_capacity(0));
        inner.as_leaf();
    }
}
