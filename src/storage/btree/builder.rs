use crate::types::EntryRef;

use super::aggregation::AggrCalc;
use super::compare::{KeyComparator, NaturalOrder};
use super::node::{InternalNode, LeafNode, Node, NodeAllocator};

/// Bulk loader building a balanced tree from entries in strictly increasing
/// key order.
///
/// Every level is cut into the fewest nodes that fit its capacity, with
/// entries spread evenly so no node underflows.
#[derive(Clone, Debug)]
pub struct TreeBuilder<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
}

impl<K, V> Default for TreeBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TreeBuilder<K, V> {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Creates a builder with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    /// Number of collected entries.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Appends an entry ordered by [`Ord`].
    ///
    /// # Panics
    /// Panics unless `key` is greater than the previously appended key.
    pub fn insert(&mut self, key: K, value: V)
    where
        K: Ord,
    {
        self.insert_by(key, value, &NaturalOrder);
    }

    /// Appends an entry ordered by `cmp`.
    ///
    /// # Panics
    /// Panics unless `key` is greater than the previously appended key.
    pub fn insert_by<C>(&mut self, key: K, value: V, cmp: &C)
    where
        C: KeyComparator<K> + ?Sized,
    {
        if let Some(last) = self.keys.last() {
            assert!(
                cmp.compare(last, &key).is_lt(),
                "tree builder keys must be strictly increasing"
            );
        }
        self.keys.push(key);
        self.values.push(value);
    }

    /// Allocates the tree into `alloc` and returns its root.
    pub fn build<A>(self, alloc: &mut NodeAllocator<K, V, A>) -> EntryRef
    where
        K: Clone,
        V: Clone,
        A: AggrCalc<V>,
    {
        let total = self.keys.len();
        if total == 0 {
            return EntryRef::INVALID;
        }
        let mut keys = self.keys.into_iter();
        let mut values = self.values.into_iter();
        let mut level: Vec<(EntryRef, K)> = Vec::new();
        for size in even_parts(total, alloc.max_slots(true)) {
            let mut leaf = LeafNode::with_capacity(size);
            leaf.keys.extend(keys.by_ref().take(size));
            leaf.values.extend(values.by_ref().take(size));
            let last = leaf.keys[size - 1].clone();
            level.push((alloc.allocate(Node::Leaf(leaf)), last));
        }
        while level.len() > 1 {
            let count = level.len();
            let mut children = level.into_iter();
            level = Vec::new();
            for size in even_parts(count, alloc.max_slots(false)) {
                let mut inner = InternalNode::with_capacity(size);
                for (child, last) in children.by_ref().take(size) {
                    inner.children.push(child);
                    inner.keys.push(last);
                }
                let last = inner.keys[size - 1].clone();
                level.push((alloc.allocate(Node::Internal(inner)), last));
            }
        }
        tracing::trace!(
            target: "epochtree::btree::builder",
            entries = total,
            "built tree"
        );
        level[0].0
    }
}

/// Splits `total` into the fewest parts of at most `capacity`, sizes differing by at most one.
fn even_parts(total: usize, capacity: usize) -> impl Iterator<Item = usize> {
    let parts = total.div_ceil(capacity);
    let base = total / parts;
    let extra = total % parts;
    (0..parts).map(move |i| base + usize::from(i < extra))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_parts_respect_capacity() {
        assert_eq!(even_parts(4, 4).collect::<Vec<_>>(), vec![4]);
        assert_eq!(even_parts(5, 4).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(even_parts(9, 4).collect::<Vec<_>>(), vec![3, 3, 3]);
        assert_eq!(even_parts(17, 16).collect::<Vec<_>>(), vec![9, 8]);
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn unsorted_input_is_rejected() {
        let mut builder = TreeBuilder::new();
        builder.insert(5u32, ());
        builder.insert(5u32, ());
    }
}
