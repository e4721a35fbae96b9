use crate::types::EntryRef;

use super::super::aggregation::AggrCalc;
use super::super::compare::{lower_bound, KeyComparator};
use super::super::node::{InternalNode, LeafNode, Node, NodeAllocator, TreeNode};
use super::{last_key, PathVec, TreeRoot};

/// Result of rewriting one level: the (possibly split) node and its separators.
struct Carry<K> {
    left: EntryRef,
    left_last: K,
    right: Option<(EntryRef, K)>,
}

impl<K, V, A> TreeRoot<K, V, A>
where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
{
    /// Inserts `key` unless present. Returns `false` and leaves the tree
    /// untouched when the key already exists.
    pub fn insert_by<C>(
        &mut self,
        alloc: &mut NodeAllocator<K, V, A>,
        key: K,
        value: V,
        cmp: &C,
    ) -> bool
    where
        C: KeyComparator<K> + ?Sized,
    {
        alloc.settle_cursors(0);
        if !self.root.valid() {
            let mut leaf = LeafNode::with_capacity(alloc.max_slots(true));
            leaf.keys.push(key);
            leaf.values.push(value);
            self.root = alloc.allocate(Node::Leaf(leaf));
            return true;
        }

        let threshold = alloc.threshold();
        let mut path = PathVec::new();
        let mut node_ref = self.root;
        let leaf_idx = loop {
            let node = alloc.resolve(node_ref);
            let idx = lower_bound(node.keys(), &key, cmp, threshold);
            match &*node {
                Node::Internal(inner) => {
                    // Keys above the last separator extend the last child.
                    let idx = idx.min(inner.len() - 1);
                    path.push((node_ref, idx));
                    node_ref = inner.children[idx];
                }
                Node::Leaf(leaf) => {
                    if idx < leaf.len() && cmp.compare(&leaf.keys[idx], &key).is_eq() {
                        return false;
                    }
                    break idx;
                }
            }
        };

        let (leaf_slot, node) = alloc.edit(node_ref);
        let mut leaf = node.into_leaf();
        leaf.keys.insert(leaf_idx, key);
        leaf.values.insert(leaf_idx, value);
        let right = (leaf.len() > alloc.max_slots(true))
            .then(|| Node::Leaf(leaf.split_off((leaf.len() + 1) / 2)));
        let mut carry = store_level(alloc, leaf_slot, Node::Leaf(leaf), right);

        for &(parent_ref, idx) in path.iter().rev() {
            let (parent_slot, node) = alloc.edit(parent_ref);
            let mut parent = node.into_internal();
            parent.children[idx] = carry.left;
            parent.keys[idx] = carry.left_last;
            if let Some((right_ref, right_last)) = carry.right {
                parent.children.insert(idx + 1, right_ref);
                parent.keys.insert(idx + 1, right_last);
            }
            let right = (parent.len() > alloc.max_slots(false))
                .then(|| Node::Internal(parent.split_off((parent.len() + 1) / 2)));
            carry = store_level(alloc, parent_slot, Node::Internal(parent), right);
        }

        self.root = match carry.right {
            Some((right_ref, right_last)) => {
                let mut root = InternalNode::with_capacity(alloc.max_slots(false));
                root.keys.push(carry.left_last);
                root.keys.push(right_last);
                root.children.push(carry.left);
                root.children.push(right_ref);
                let root = alloc.allocate(Node::Internal(root));
                alloc.stats_ref().inc_root_splits();
                tracing::trace!(
                    target: "epochtree::btree::split",
                    root = root.raw(),
                    "tree grew a level"
                );
                root
            }
            None => carry.left,
        };
        true
    }
}

fn store_level<K, V, A>(
    alloc: &mut NodeAllocator<K, V, A>,
    slot: EntryRef,
    left: TreeNode<K, V, A>,
    right: Option<TreeNode<K, V, A>>,
) -> Carry<K>
where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
{
    let is_leaf = left.is_leaf();
    let left_last = last_key(&left);
    alloc.put(slot, left);
    let right = right.map(|node| {
        let right_last = last_key(&node);
        let right_ref = alloc.allocate(node);
        alloc.stats_ref().inc_splits(is_leaf);
        tracing::trace!(
            target: "epochtree::btree::split",
            left = slot.raw(),
            right = right_ref.raw(),
            leaf = is_leaf,
            "split node"
        );
        (right_ref, right_last)
    });
    Carry {
        left: slot,
        left_last,
        right,
    }
}
