use std::ops::Sub;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::primitives::datastore::SlotTable;
use crate::primitives::generation::GenerationGuard;
use crate::types::EntryRef;

use super::aggregation::AggrCalc;
use super::compare::{lower_bound, KeyComparator};
use super::node::{LeafNode, Node, NodeAllocator, TreeNode, WriterPin};

/// Keeps every node reachable from a cursor's snapshot resolvable.
#[derive(Clone)]
pub(crate) enum SnapshotPin {
    /// Reader generation registered with a handler.
    Reader(Arc<GenerationGuard>),
    /// Writer-side cursor; see [`NodeAllocator`].
    Writer(Arc<WriterPin>),
}

struct PathEntry<N> {
    node_ref: EntryRef,
    node: Arc<N>,
    idx: usize,
}

impl<N> Clone for PathEntry<N> {
    fn clone(&self) -> Self {
        Self {
            node_ref: self.node_ref,
            node: Arc::clone(&self.node),
            idx: self.idx,
        }
    }
}

/// Cursor over the entries of one tree snapshot.
///
/// The cursor owns `Arc` handles to every node on its path, so it keeps
/// observing the snapshot it was positioned on even after the writer replaced
/// those nodes. Cursors obtained from a [`super::FrozenView`] additionally pin
/// the reader generation, which keeps every node of the snapshot resolvable.
/// Cursors obtained from the writer pin its allocator instead: later edits
/// copy the nodes they can reach and nothing is trimmed until they are dropped.
///
/// An invalid cursor is the end position. Stepping backward from the first
/// entry also yields the end position; stepping backward from the end returns
/// the last entry.
pub struct TreeIterator<K, V, A: AggrCalc<V>> {
    table: Arc<SlotTable<TreeNode<K, V, A>>>,
    pin: Option<SnapshotPin>,
    root: EntryRef,
    root_node: Option<Arc<TreeNode<K, V, A>>>,
    path: SmallVec<[PathEntry<TreeNode<K, V, A>>; 8]>,
    leaf: Option<PathEntry<TreeNode<K, V, A>>>,
}

impl<K, V, A: AggrCalc<V>> Clone for TreeIterator<K, V, A> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            pin: self.pin.clone(),
            root: self.root,
            root_node: self.root_node.clone(),
            path: self.path.clone(),
            leaf: self.leaf.clone(),
        }
    }
}

impl<K, V, A: AggrCalc<V>> TreeIterator<K, V, A> {
    /// Creates an end cursor over the tree rooted at `root`.
    pub(crate) fn end(
        table: Arc<SlotTable<TreeNode<K, V, A>>>,
        root: EntryRef,
        pin: Option<SnapshotPin>,
    ) -> Self {
        let root_node = root.valid().then(|| table.get(root));
        Self {
            table,
            pin,
            root,
            root_node,
            path: SmallVec::new(),
            leaf: None,
        }
    }

    pub(crate) fn begin(
        table: Arc<SlotTable<TreeNode<K, V, A>>>,
        root: EntryRef,
        pin: Option<SnapshotPin>,
    ) -> Self {
        let mut itr = Self::end(table, root, pin);
        itr.seek_first();
        itr
    }

    pub(crate) fn last(
        table: Arc<SlotTable<TreeNode<K, V, A>>>,
        root: EntryRef,
        pin: Option<SnapshotPin>,
    ) -> Self {
        let mut itr = Self::end(table, root, pin);
        itr.seek_last();
        itr
    }

    pub(crate) fn lower_bound<C>(
        table: Arc<SlotTable<TreeNode<K, V, A>>>,
        root: EntryRef,
        pin: Option<SnapshotPin>,
        key: &K,
        cmp: &C,
        threshold: usize,
    ) -> Self
    where
        C: KeyComparator<K> + ?Sized,
    {
        let mut itr = Self::end(table, root, pin);
        if !root.valid() {
            return itr;
        }
        let mut node_ref = root;
        loop {
            let node = itr.table.get(node_ref);
            let idx = lower_bound(node.keys(), key, cmp, threshold);
            if idx == node.len() {
                itr.invalidate();
                return itr;
            }
            match &*node {
                Node::Internal(inner) => {
                    let child = inner.children[idx];
                    itr.path.push(PathEntry { node_ref, node, idx });
                    node_ref = child;
                }
                Node::Leaf(_) => {
                    itr.leaf = Some(PathEntry { node_ref, node, idx });
                    return itr;
                }
            }
        }
    }

    pub(crate) fn find<C>(
        table: Arc<SlotTable<TreeNode<K, V, A>>>,
        root: EntryRef,
        pin: Option<SnapshotPin>,
        key: &K,
        cmp: &C,
        threshold: usize,
    ) -> Self
    where
        C: KeyComparator<K> + ?Sized,
    {
        let mut itr = Self::lower_bound(table, root, pin, key, cmp, threshold);
        if itr.valid() && cmp.compare(itr.key(), key).is_ne() {
            itr.invalidate();
        }
        itr
    }

    /// Returns `true` while positioned on an entry.
    pub fn valid(&self) -> bool {
        self.leaf.is_some()
    }

    /// Key at the current position.
    ///
    /// # Panics
    /// Panics on an invalid cursor.
    pub fn key(&self) -> &K {
        let leaf = self.leaf.as_ref().expect("key() on an invalid tree iterator");
        &leaf.node.as_leaf().keys[leaf.idx]
    }

    /// Value at the current position.
    ///
    /// # Panics
    /// Panics on an invalid cursor.
    pub fn data(&self) -> &V {
        let leaf = self.leaf.as_ref().expect("data() on an invalid tree iterator");
        &leaf.node.as_leaf().values[leaf.idx]
    }

    /// Current entry, or `None` at the end position.
    pub fn entry(&self) -> Option<(&K, &V)> {
        self.leaf.as_ref().map(|leaf| {
            let node = leaf.node.as_leaf();
            (&node.keys[leaf.idx], &node.values[leaf.idx])
        })
    }

    /// Leaf the cursor is positioned in.
    pub fn leaf_node(&self) -> Option<&LeafNode<K, V, A::Aggregate>> {
        self.leaf.as_ref().map(|leaf| leaf.node.as_leaf())
    }

    /// Root of the snapshot this cursor walks.
    pub fn root(&self) -> EntryRef {
        self.root
    }

    /// Number of entries in the snapshot.
    pub fn size(&self) -> usize {
        self.root_node.as_ref().map_or(0, |root| root.valid_leaves())
    }

    /// Root aggregate of the snapshot.
    pub fn aggregated(&self) -> A::Aggregate {
        self.root_node
            .as_ref()
            .map(|root| root.aggregated().clone())
            .unwrap_or_default()
    }

    /// Zero-based rank of the current entry; the end position equals [`TreeIterator::size`].
    pub fn position(&self) -> usize {
        let Some(leaf) = &self.leaf else {
            return self.size();
        };
        let mut position = leaf.idx;
        for entry in &self.path {
            let inner = entry.node.as_internal();
            for &child in &inner.children[..entry.idx] {
                position += self.table.get(child).valid_leaves();
            }
        }
        position
    }

    /// Signed rank difference `self - other`.
    pub fn distance(&self, other: &Self) -> isize {
        self.position() as isize - other.position() as isize
    }

    /// Advances to the next entry; a no-op at the end position.
    pub fn step_forward(&mut self) {
        let Some(leaf) = self.leaf.as_mut() else {
            return;
        };
        if leaf.idx + 1 < leaf.node.len() {
            leaf.idx += 1;
            return;
        }
        if !self.advance_leaf() {
            self.invalidate();
        }
    }

    /// Moves to the previous entry; from the end position moves to the last entry.
    pub fn step_backward(&mut self) {
        let Some(leaf) = self.leaf.as_mut() else {
            self.seek_last();
            return;
        };
        if leaf.idx > 0 {
            leaf.idx -= 1;
            return;
        }
        while let Some(entry) = self.path.last_mut() {
            if entry.idx > 0 {
                entry.idx -= 1;
                let child = entry.node.as_internal().children[entry.idx];
                self.descend(child, false);
                return;
            }
            self.path.pop();
        }
        self.invalidate();
    }

    pub(crate) fn seek_first(&mut self) {
        self.invalidate();
        if self.root.valid() {
            self.descend(self.root, true);
        }
    }

    pub(crate) fn seek_last(&mut self) {
        self.invalidate();
        if self.root.valid() {
            self.descend(self.root, false);
        }
    }

    pub(crate) fn pins_writer(&self) -> bool {
        matches!(self.pin, Some(SnapshotPin::Writer(_)))
    }

    /// Handle and slot of the current leaf position.
    pub(crate) fn leaf_slot(&self) -> Option<(EntryRef, usize)> {
        self.leaf.as_ref().map(|leaf| (leaf.node_ref, leaf.idx))
    }

    /// Handles and child indices of the internal levels, root first.
    pub(crate) fn internal_slots(&self) -> impl DoubleEndedIterator<Item = (EntryRef, usize)> + '_ {
        self.path.iter().map(|entry| (entry.node_ref, entry.idx))
    }

    /// Re-walks the same slot indices from a new root.
    pub(crate) fn reposition(&mut self, root: EntryRef) {
        let mut indices: SmallVec<[usize; 9]> = self.path.iter().map(|entry| entry.idx).collect();
        if let Some(leaf) = &self.leaf {
            indices.push(leaf.idx);
        }
        self.root = root;
        self.root_node = root.valid().then(|| self.table.get(root));
        self.invalidate();
        if !root.valid() || indices.is_empty() {
            return;
        }
        let mut node_ref = root;
        for idx in indices {
            let node = self.table.get(node_ref);
            match &*node {
                Node::Internal(inner) => {
                    let child = inner.children[idx];
                    self.path.push(PathEntry { node_ref, node, idx });
                    node_ref = child;
                }
                Node::Leaf(_) => {
                    self.leaf = Some(PathEntry { node_ref, node, idx });
                    return;
                }
            }
        }
    }

    fn invalidate(&mut self) {
        self.path.clear();
        self.leaf = None;
    }

    fn advance_leaf(&mut self) -> bool {
        self.leaf = None;
        while let Some(entry) = self.path.last_mut() {
            if entry.idx + 1 < entry.node.len() {
                entry.idx += 1;
                let child = entry.node.as_internal().children[entry.idx];
                self.descend(child, true);
                return true;
            }
            self.path.pop();
        }
        false
    }

    fn descend(&mut self, mut node_ref: EntryRef, leftmost: bool) {
        loop {
            let node = self.table.get(node_ref);
            let idx = if leftmost { 0 } else { node.len() - 1 };
            match &*node {
                Node::Internal(inner) => {
                    let child = inner.children[idx];
                    self.path.push(PathEntry { node_ref, node, idx });
                    node_ref = child;
                }
                Node::Leaf(_) => {
                    self.leaf = Some(PathEntry { node_ref, node, idx });
                    return;
                }
            }
        }
    }
}

impl<K, V, A> TreeIterator<K, V, A>
where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
{
    /// Positions on the first leaf of `root`, relocating every node on the
    /// path that lives in a chunk being compacted. Returns the possibly new root.
    pub fn move_first_leaf_node(
        &mut self,
        alloc: &mut NodeAllocator<K, V, A>,
        root: EntryRef,
    ) -> EntryRef {
        self.table = alloc.reader();
        self.root = root;
        self.root_node = root.valid().then(|| alloc.resolve(root));
        self.seek_first();
        self.relocate_path(alloc);
        self.root
    }

    /// Moves to the first entry of the next leaf, relocating as
    /// [`TreeIterator::move_first_leaf_node`] does. Becomes invalid past the last leaf.
    pub fn move_next_leaf_node(&mut self, alloc: &mut NodeAllocator<K, V, A>) {
        if !self.valid() {
            return;
        }
        if self.advance_leaf() {
            self.relocate_path(alloc);
        } else {
            self.invalidate();
        }
    }

    fn relocate_path(&mut self, alloc: &mut NodeAllocator<K, V, A>) {
        let Some(leaf) = self.leaf.as_mut() else {
            return;
        };
        let mut moved = None;
        if alloc.needs_move(leaf.node_ref) {
            let fresh = alloc.relocate(leaf.node_ref);
            leaf.node_ref = fresh;
            leaf.node = alloc.resolve(fresh);
            moved = Some(fresh);
        }
        for entry in self.path.iter_mut().rev() {
            let must_move = alloc.needs_move(entry.node_ref);
            if moved.is_none() && !must_move {
                continue;
            }
            let (slot, mut node) = if must_move {
                alloc.relocate_for_edit(entry.node_ref)
            } else {
                alloc.edit(entry.node_ref)
            };
            if let (Some(child), Node::Internal(inner)) = (moved, &mut node) {
                inner.children[entry.idx] = child;
            }
            alloc.put(slot, node);
            moved = (slot != entry.node_ref).then_some(slot);
            entry.node_ref = slot;
            entry.node = alloc.resolve(slot);
        }
        if let Some(root) = moved {
            self.root = root;
        }
        self.root_node = Some(alloc.resolve(self.root));
    }
}

impl<K, V, A: AggrCalc<V>> PartialEq for TreeIterator<K, V, A> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.leaf, &other.leaf) {
            (None, None) => self.root == other.root,
            (Some(a), Some(b)) => Arc::ptr_eq(&a.node, &b.node) && a.idx == b.idx,
            _ => false,
        }
    }
}

impl<'a, K, V, A: AggrCalc<V>> Sub for &'a TreeIterator<K, V, A> {
    type Output = isize;

    fn sub(self, rhs: Self) -> isize {
        self.distance(rhs)
    }
}

impl<K, V, A: AggrCalc<V>> std::fmt::Debug for TreeIterator<K, V, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIterator")
            .field("root", &self.root)
            .field("leaf", &self.leaf_slot())
            .field("depth", &self.path.len())
            .finish()
    }
}
