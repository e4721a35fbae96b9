use crate::types::EntryRef;

use super::super::aggregation::AggrCalc;
use super::super::compare::{lower_bound, KeyComparator};
use super::super::node::{InternalNode, Node, NodeAllocator, TreeNode};
use super::{last_key, PathVec, TreeRoot};

impl<K, V, A> TreeRoot<K, V, A>
where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
{
    /// Removes `key`. Returns `false` and leaves the tree untouched when absent.
    pub fn remove_by<C>(&mut self, alloc: &mut NodeAllocator<K, V, A>, key: &K, cmp: &C) -> bool
    where
        C: KeyComparator<K> + ?Sized,
    {
        if !self.root.valid() {
            return false;
        }
        alloc.settle_cursors(0);
        let threshold = alloc.threshold();
        let mut path = PathVec::new();
        let mut node_ref = self.root;
        let leaf_idx = loop {
            let node = alloc.resolve(node_ref);
            let idx = lower_bound(node.keys(), key, cmp, threshold);
            if idx == node.len() {
                return false;
            }
            match &*node {
                Node::Internal(inner) => {
                    path.push((node_ref, idx));
                    node_ref = inner.children[idx];
                }
                Node::Leaf(leaf) => {
                    if cmp.compare(&leaf.keys[idx], key).is_ne() {
                        return false;
                    }
                    break idx;
                }
            }
        };

        let (mut child_slot, node) = alloc.edit(node_ref);
        let mut leaf = node.into_leaf();
        leaf.keys.remove(leaf_idx);
        leaf.values.remove(leaf_idx);
        let mut child = Node::Leaf(leaf);

        for &(parent_ref, idx) in path.iter().rev() {
            let (parent_slot, node) = alloc.edit(parent_ref);
            let mut parent = node.into_internal();
            rebalance(alloc, &mut parent, idx, child_slot, child);
            child_slot = parent_slot;
            child = Node::Internal(parent);
        }

        self.root = match child {
            Node::Leaf(leaf) if leaf.is_empty() => {
                alloc.hold(child_slot);
                EntryRef::INVALID
            }
            Node::Internal(inner) if inner.len() == 1 => {
                alloc.hold(child_slot);
                alloc.stats_ref().inc_root_collapses();
                tracing::trace!(
                    target: "epochtree::btree::merge",
                    root = inner.children[0].raw(),
                    "tree lost a level"
                );
                inner.children[0]
            }
            node => {
                alloc.put(child_slot, node);
                child_slot
            }
        };
        true
    }
}

/// Stores `child` back under `parent[idx]`, fixing an underflow by merging
/// with or stealing from an adjacent sibling.
///
/// Merges are preferred: into the left sibling when the union fits, else the
/// right sibling into the child. Otherwise the fuller sibling (left on ties)
/// gives up `victim - (victim + child) / 2` entries so both end up even.
fn rebalance<K, V, A>(
    alloc: &mut NodeAllocator<K, V, A>,
    parent: &mut InternalNode<K, A::Aggregate>,
    idx: usize,
    child_slot: EntryRef,
    mut child: TreeNode<K, V, A>,
) where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
{
    let is_leaf = child.is_leaf();
    if child.len() >= alloc.min_slots(is_leaf) {
        parent.keys[idx] = last_key(&child);
        parent.children[idx] = child_slot;
        alloc.put(child_slot, child);
        return;
    }

    let max = alloc.max_slots(is_leaf);
    let left_len = (idx > 0).then(|| alloc.resolve(parent.children[idx - 1]).len());
    let right_len =
        (idx + 1 < parent.len()).then(|| alloc.resolve(parent.children[idx + 1]).len());

    if left_len.is_some_and(|len| len + child.len() <= max) {
        let (left_slot, mut left) = alloc.edit(parent.children[idx - 1]);
        left.append(child);
        alloc.hold(child_slot);
        parent.keys[idx - 1] = last_key(&left);
        parent.children[idx - 1] = left_slot;
        alloc.put(left_slot, left);
        parent.keys.remove(idx);
        parent.children.remove(idx);
        alloc.stats_ref().inc_merges(is_leaf);
        tracing::trace!(
            target: "epochtree::btree::merge",
            survivor = left_slot.raw(),
            removed = child_slot.raw(),
            direction = "left",
            leaf = is_leaf,
            "merged node into left sibling"
        );
        return;
    }

    if right_len.is_some_and(|len| len + child.len() <= max) {
        let right_ref = parent.children[idx + 1];
        let right = (*alloc.resolve(right_ref)).clone();
        alloc.hold(right_ref);
        child.append(right);
        parent.keys[idx] = last_key(&child);
        parent.children[idx] = child_slot;
        alloc.put(child_slot, child);
        parent.keys.remove(idx + 1);
        parent.children.remove(idx + 1);
        alloc.stats_ref().inc_merges(is_leaf);
        tracing::trace!(
            target: "epochtree::btree::merge",
            survivor = child_slot.raw(),
            removed = right_ref.raw(),
            direction = "right",
            leaf = is_leaf,
            "merged right sibling into node"
        );
        return;
    }

    let from_left = match (left_len, right_len) {
        (Some(left), Some(right)) => left >= right,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => panic!("underflowing node {child_slot:?} has no siblings"),
    };
    let victim_idx = if from_left { idx - 1 } else { idx + 1 };
    let (victim_slot, mut victim) = alloc.edit(parent.children[victim_idx]);
    let count = victim.len() - (victim.len() + child.len()) / 2;
    if from_left {
        child.move_from_left(&mut victim, count);
    } else {
        child.move_from_right(&mut victim, count);
    }
    parent.keys[victim_idx] = last_key(&victim);
    parent.children[victim_idx] = victim_slot;
    alloc.put(victim_slot, victim);
    parent.keys[idx] = last_key(&child);
    parent.children[idx] = child_slot;
    alloc.put(child_slot, child);
    alloc.stats_ref().inc_steals(is_leaf);
    tracing::trace!(
        target: "epochtree::btree::steal",
        node = child_slot.raw(),
        victim = victim_slot.raw(),
        moved = count,
        leaf = is_leaf,
        "stole entries from sibling"
    );
}
