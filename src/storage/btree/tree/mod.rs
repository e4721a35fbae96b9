//! Tree algorithms over a [`NodeAllocator`].
//!
//! A [`TreeRoot`] is nothing but the root handle; every operation borrows the
//! allocator that owns the nodes, which lets many trees share one arena.

use std::fmt::{self, Write as _};
use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::types::{EntryRef, Result, TreeError};

use super::aggregation::AggrCalc;
use super::builder::TreeBuilder;
use super::compare::KeyComparator;
use super::iterator::TreeIterator;
use super::node::{LeafNode, Node, NodeAllocator};

mod insert;
mod remove;

/// Root handle of a copy-on-write B-tree.
pub struct TreeRoot<K, V, A> {
    root: EntryRef,
    _marker: PhantomData<fn() -> (K, V, A)>,
}

impl<K, V, A> Clone for TreeRoot<K, V, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V, A> Copy for TreeRoot<K, V, A> {}

impl<K, V, A> Default for TreeRoot<K, V, A> {
    fn default() -> Self {
        Self::from_root(EntryRef::INVALID)
    }
}

impl<K, V, A> fmt::Debug for TreeRoot<K, V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TreeRoot").field(&self.root).finish()
    }
}

impl<K, V, A> TreeRoot<K, V, A> {
    /// Wraps an existing root handle.
    pub fn from_root(root: EntryRef) -> Self {
        Self {
            root,
            _marker: PhantomData,
        }
    }

    /// Current root handle; invalid for an empty tree.
    pub fn root(&self) -> EntryRef {
        self.root
    }

    /// Replaces the root handle.
    pub fn set_root(&mut self, root: EntryRef) {
        self.root = root;
    }

    /// Returns `true` for the empty tree.
    pub fn is_empty(&self) -> bool {
        !self.root.valid()
    }
}

type PathVec = SmallVec<[(EntryRef, usize); 8]>;

impl<K, V, A> TreeRoot<K, V, A>
where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
{
    /// Number of entries.
    pub fn size(&self, alloc: &NodeAllocator<K, V, A>) -> usize {
        if self.root.valid() {
            alloc.resolve(self.root).valid_leaves()
        } else {
            0
        }
    }

    /// Aggregate over every value; the empty aggregate for an empty tree.
    pub fn aggregated(&self, alloc: &NodeAllocator<K, V, A>) -> A::Aggregate {
        if self.root.valid() {
            alloc.resolve(self.root).aggregated().clone()
        } else {
            A::Aggregate::default()
        }
    }

    /// Cursor on the first entry.
    ///
    /// Writer cursors keep their snapshot across later mutations of this
    /// allocator; hold-list trimming waits until they are dropped.
    pub fn begin(&self, alloc: &NodeAllocator<K, V, A>) -> TreeIterator<K, V, A> {
        TreeIterator::begin(alloc.reader(), self.root, Some(alloc.writer_pin()))
    }

    /// Cursor on the last entry.
    pub fn last(&self, alloc: &NodeAllocator<K, V, A>) -> TreeIterator<K, V, A> {
        TreeIterator::last(alloc.reader(), self.root, Some(alloc.writer_pin()))
    }

    /// End cursor.
    pub fn end(&self, alloc: &NodeAllocator<K, V, A>) -> TreeIterator<K, V, A> {
        TreeIterator::end(alloc.reader(), self.root, Some(alloc.writer_pin()))
    }

    /// Cursor on `key`, or the end cursor when absent.
    pub fn find_by<C>(&self, alloc: &NodeAllocator<K, V, A>, key: &K, cmp: &C) -> TreeIterator<K, V, A>
    where
        C: KeyComparator<K> + ?Sized,
    {
        TreeIterator::find(
            alloc.reader(),
            self.root,
            Some(alloc.writer_pin()),
            key,
            cmp,
            alloc.threshold(),
        )
    }

    /// Cursor on the first entry not less than `key`.
    pub fn lower_bound_by<C>(
        &self,
        alloc: &NodeAllocator<K, V, A>,
        key: &K,
        cmp: &C,
    ) -> TreeIterator<K, V, A>
    where
        C: KeyComparator<K> + ?Sized,
    {
        TreeIterator::lower_bound(
            alloc.reader(),
            self.root,
            Some(alloc.writer_pin()),
            key,
            cmp,
            alloc.threshold(),
        )
    }

    /// Removes every key in `removals`, then inserts or overwrites every
    /// pair in `additions`.
    pub fn apply_by<C, I, R>(
        &mut self,
        alloc: &mut NodeAllocator<K, V, A>,
        additions: I,
        removals: R,
        cmp: &C,
    ) where
        C: KeyComparator<K> + ?Sized,
        I: IntoIterator<Item = (K, V)>,
        R: IntoIterator<Item = K>,
    {
        for key in removals {
            self.remove_by(alloc, &key, cmp);
        }
        for (key, value) in additions {
            let mut itr = self.find_by(alloc, &key, cmp);
            if itr.valid() {
                self.update_data(alloc, &mut itr, value);
            } else {
                self.insert_by(alloc, key, value, cmp);
            }
        }
    }

    /// Makes every node on the cursor's path writable, copying frozen ones,
    /// and repositions the cursor on the rewritten path.
    pub fn thaw(&mut self, alloc: &mut NodeAllocator<K, V, A>, itr: &mut TreeIterator<K, V, A>) {
        self.rewrite_path(alloc, itr, |_, _| {});
    }

    /// Overwrites the value under the cursor and refreshes aggregates up to the root.
    pub fn update_data(
        &mut self,
        alloc: &mut NodeAllocator<K, V, A>,
        itr: &mut TreeIterator<K, V, A>,
        value: V,
    ) {
        self.rewrite_path(alloc, itr, |leaf, idx| leaf.values[idx] = value);
    }

    /// Overwrites the key under the cursor, including every separator equal to it.
    ///
    /// The caller guarantees the new key sorts between its neighbours.
    pub fn write_key(
        &mut self,
        alloc: &mut NodeAllocator<K, V, A>,
        itr: &mut TreeIterator<K, V, A>,
        key: K,
    ) {
        self.rewrite_path(alloc, itr, |leaf, idx| leaf.keys[idx] = key);
    }

    /// Retires every node and empties the tree.
    pub fn clear(&mut self, alloc: &mut NodeAllocator<K, V, A>) {
        alloc.settle_cursors(0);
        alloc.hold_subtree(self.root);
        self.root = EntryRef::INVALID;
    }

    /// Replaces the content with the entries collected by `builder`.
    pub fn assign(&mut self, alloc: &mut NodeAllocator<K, V, A>, builder: TreeBuilder<K, V>) {
        self.clear(alloc);
        self.root = builder.build(alloc);
    }

    /// Renders the node structure, e.g. `[1:101,3:103[min=101,max=103]]`.
    pub fn render(&self, alloc: &NodeAllocator<K, V, A>) -> String
    where
        K: fmt::Display,
        V: fmt::Display,
    {
        let mut out = String::new();
        render_node(alloc, self.root, &mut out);
        out
    }

    /// Checks ordering, occupancy, separators, entry counts and aggregates.
    pub fn validate_by<C>(&self, alloc: &NodeAllocator<K, V, A>, cmp: &C) -> Result<()>
    where
        C: KeyComparator<K> + ?Sized,
    {
        if self.root.valid() {
            validate_node(alloc, self.root, cmp, true)?;
        }
        Ok(())
    }

    fn rewrite_path<F>(
        &mut self,
        alloc: &mut NodeAllocator<K, V, A>,
        itr: &mut TreeIterator<K, V, A>,
        edit: F,
    ) where
        F: FnOnce(&mut LeafNode<K, V, A::Aggregate>, usize),
    {
        let (leaf_ref, idx) = itr
            .leaf_slot()
            .expect("rewriting through an invalid tree iterator");
        assert_eq!(itr.root(), self.root, "tree iterator belongs to another root");
        let parents: PathVec = itr.internal_slots().collect();
        let own_pin = usize::from(itr.pins_writer());
        alloc.settle_cursors(own_pin);

        let (mut child_ref, node) = alloc.edit(leaf_ref);
        let mut leaf = node.into_leaf();
        edit(&mut leaf, idx);
        let mut child_last = leaf.keys.last().cloned();
        alloc.put(child_ref, Node::Leaf(leaf));

        for &(parent_ref, slot) in parents.iter().rev() {
            let (parent_slot, node) = alloc.edit(parent_ref);
            let mut parent = node.into_internal();
            parent.children[slot] = child_ref;
            if let Some(last) = child_last {
                parent.keys[slot] = last;
            }
            child_last = parent.keys.last().cloned();
            alloc.put(parent_slot, Node::Internal(parent));
            child_ref = parent_slot;
        }
        self.root = child_ref;
        itr.reposition(child_ref);
        if own_pin > 0 {
            // The rewritten path is unfrozen again and the cursor still reaches it.
            alloc.note_cursor();
        }
    }
}

pub(super) fn last_key<K: Clone, V, G>(node: &Node<K, V, G>) -> K {
    node.last_key()
        .cloned()
        .expect("tree nodes on a live path are never empty")
}

fn render_node<K, V, A>(alloc: &NodeAllocator<K, V, A>, node_ref: EntryRef, out: &mut String)
where
    K: Clone + fmt::Display,
    V: Clone + fmt::Display,
    A: AggrCalc<V>,
{
    if !node_ref.valid() {
        out.push_str("[]");
        return;
    }
    let node = alloc.resolve(node_ref);
    out.push('[');
    match &*node {
        Node::Leaf(leaf) => {
            for (i, (key, value)) in leaf.keys.iter().zip(&leaf.values).enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{key}:{value}");
            }
        }
        Node::Internal(inner) => {
            for (i, (key, &child)) in inner.keys.iter().zip(&inner.children).enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{key}:");
                render_node(alloc, child, out);
            }
        }
    }
    let _ = write!(out, "[{}]]", node.aggregated());
}

struct Summary<K, G> {
    depth: usize,
    count: usize,
    first: K,
    last: K,
    aggr: G,
}

fn validate_node<K, V, A, C>(
    alloc: &NodeAllocator<K, V, A>,
    node_ref: EntryRef,
    cmp: &C,
    is_root: bool,
) -> Result<Summary<K, A::Aggregate>>
where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
    C: KeyComparator<K> + ?Sized,
{
    let corrupt = |msg: String| TreeError::Corruption(format!("{node_ref:?}: {msg}"));
    let node = alloc.resolve(node_ref);
    let keys = node.keys();
    if keys.is_empty() {
        return Err(corrupt("empty node".into()));
    }
    if keys.windows(2).any(|pair| cmp.compare(&pair[0], &pair[1]).is_ge()) {
        return Err(corrupt("keys out of order".into()));
    }
    let leaf = node.is_leaf();
    if node.len() > alloc.max_slots(leaf) {
        return Err(corrupt(format!("{} slots exceed capacity", node.len())));
    }
    if !is_root && node.len() < alloc.min_slots(leaf) {
        return Err(corrupt(format!("{} slots underflow", node.len())));
    }
    let first = keys[0].clone();
    let last = keys[keys.len() - 1].clone();
    match &*node {
        Node::Leaf(leaf) => {
            let aggr = alloc.calc().from_values(&leaf.values);
            if aggr != leaf.aggr {
                return Err(corrupt(format!("stale aggregate {}, expected {aggr}", leaf.aggr)));
            }
            Ok(Summary {
                depth: 0,
                count: leaf.len(),
                first,
                last,
                aggr,
            })
        }
        Node::Internal(inner) => {
            if is_root && inner.len() < 2 {
                return Err(corrupt("internal root with a single child".into()));
            }
            let mut aggr = A::Aggregate::default();
            let mut count = 0usize;
            let mut depth = None;
            let mut prev_last: Option<K> = None;
            let mut first_entry = None;
            for (separator, &child) in inner.keys.iter().zip(&inner.children) {
                let summary = validate_node(alloc, child, cmp, false)?;
                if *depth.get_or_insert(summary.depth) != summary.depth {
                    return Err(corrupt("leaves at different depths".into()));
                }
                if cmp.compare(separator, &summary.last).is_ne() {
                    return Err(corrupt(format!("separator mismatch for {child:?}")));
                }
                if let Some(prev) = &prev_last {
                    if cmp.compare(prev, &summary.first).is_ge() {
                        return Err(corrupt(format!("{child:?} overlaps its left sibling")));
                    }
                }
                alloc.calc().merge(&mut aggr, &summary.aggr);
                count += summary.count;
                first_entry.get_or_insert(summary.first);
                prev_last = Some(summary.last);
            }
            if count != inner.valid_leaves {
                return Err(corrupt(format!(
                    "entry count {} differs from {count}",
                    inner.valid_leaves
                )));
            }
            if aggr != inner.aggr {
                return Err(corrupt(format!("stale aggregate {}, expected {aggr}", inner.aggr)));
            }
            Ok(Summary {
                depth: depth.unwrap_or(0) + 1,
                count,
                first: first_entry.unwrap_or(first),
                last,
                aggr,
            })
        }
    }
}
