use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::primitives::datastore::{DataStoreStats, SlotTable};
use crate::primitives::generation::{GenerationGuard, GenerationHandler};
use crate::storage::options::BTreeOptions;
use crate::types::{EntryRef, Generation, Result};

use super::aggregation::AggrCalc;
use super::builder::TreeBuilder;
use super::compare::{KeyComparator, NaturalOrder};
use super::iterator::{SnapshotPin, TreeIterator};
use super::node::{NodeAllocator, TreeNode};
use super::stats::BTreeStats;
use super::tree::TreeRoot;

/// Single-writer handle owning one tree and its node arena.
///
/// Mutations are invisible to readers until [`BTree::freeze`] publishes the
/// current root. Readers on other threads go through [`BTree::reader`].
pub struct BTree<K, V, A: AggrCalc<V>> {
    tree: TreeRoot<K, V, A>,
    alloc: NodeAllocator<K, V, A>,
    published: Arc<AtomicU32>,
}

impl<K, V, A> Default for BTree<K, V, A>
where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
{
    fn default() -> Self {
        Self::from_allocator(NodeAllocator::with_valid_options(
            BTreeOptions::default(),
            A::default(),
        ))
    }
}

impl<K, V, A> BTree<K, V, A>
where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
{
    /// Creates an empty tree shaped by `options`.
    pub fn new(options: BTreeOptions) -> Result<Self> {
        Self::with_calc(options, A::default())
    }

    /// Creates an empty tree with explicit aggregation hooks.
    pub fn with_calc(options: BTreeOptions, calc: A) -> Result<Self> {
        Ok(Self::from_allocator(NodeAllocator::new(options, calc)?))
    }

    fn from_allocator(alloc: NodeAllocator<K, V, A>) -> Self {
        Self {
            tree: TreeRoot::default(),
            alloc,
            published: Arc::new(AtomicU32::new(EntryRef::INVALID.raw())),
        }
    }

    /// Inserts `key` unless present; see [`TreeRoot::insert_by`].
    pub fn insert(&mut self, key: K, value: V) -> bool
    where
        K: Ord,
    {
        self.tree.insert_by(&mut self.alloc, key, value, &NaturalOrder)
    }

    /// Inserts `key` ordered by `cmp`.
    pub fn insert_by<C>(&mut self, key: K, value: V, cmp: &C) -> bool
    where
        C: KeyComparator<K> + ?Sized,
    {
        self.tree.insert_by(&mut self.alloc, key, value, cmp)
    }

    /// Removes `key`; returns whether it was present.
    pub fn remove(&mut self, key: &K) -> bool
    where
        K: Ord,
    {
        self.tree.remove_by(&mut self.alloc, key, &NaturalOrder)
    }

    /// Removes `key` ordered by `cmp`.
    pub fn remove_by<C>(&mut self, key: &K, cmp: &C) -> bool
    where
        C: KeyComparator<K> + ?Sized,
    {
        self.tree.remove_by(&mut self.alloc, key, cmp)
    }

    /// Removes `removals`, then inserts or overwrites `additions`.
    pub fn apply<I, R>(&mut self, additions: I, removals: R)
    where
        K: Ord,
        I: IntoIterator<Item = (K, V)>,
        R: IntoIterator<Item = K>,
    {
        self.tree
            .apply_by(&mut self.alloc, additions, removals, &NaturalOrder);
    }

    /// [`BTree::apply`] ordered by `cmp`.
    pub fn apply_by<C, I, R>(&mut self, additions: I, removals: R, cmp: &C)
    where
        C: KeyComparator<K> + ?Sized,
        I: IntoIterator<Item = (K, V)>,
        R: IntoIterator<Item = K>,
    {
        self.tree.apply_by(&mut self.alloc, additions, removals, cmp);
    }

    /// Cursor on `key` or the end cursor.
    pub fn find(&self, key: &K) -> TreeIterator<K, V, A>
    where
        K: Ord,
    {
        self.tree.find_by(&self.alloc, key, &NaturalOrder)
    }

    /// Cursor on `key` ordered by `cmp`.
    pub fn find_by<C>(&self, key: &K, cmp: &C) -> TreeIterator<K, V, A>
    where
        C: KeyComparator<K> + ?Sized,
    {
        self.tree.find_by(&self.alloc, key, cmp)
    }

    /// Cursor on the first entry not less than `key`.
    pub fn lower_bound(&self, key: &K) -> TreeIterator<K, V, A>
    where
        K: Ord,
    {
        self.tree.lower_bound_by(&self.alloc, key, &NaturalOrder)
    }

    /// [`BTree::lower_bound`] ordered by `cmp`.
    pub fn lower_bound_by<C>(&self, key: &K, cmp: &C) -> TreeIterator<K, V, A>
    where
        C: KeyComparator<K> + ?Sized,
    {
        self.tree.lower_bound_by(&self.alloc, key, cmp)
    }

    /// Cursor on the first entry.
    pub fn begin(&self) -> TreeIterator<K, V, A> {
        self.tree.begin(&self.alloc)
    }

    /// Cursor on the last entry.
    pub fn last(&self) -> TreeIterator<K, V, A> {
        self.tree.last(&self.alloc)
    }

    /// End cursor.
    pub fn end(&self) -> TreeIterator<K, V, A> {
        self.tree.end(&self.alloc)
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        self.tree.size(&self.alloc)
    }

    /// Returns `true` when the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Aggregate over every value.
    pub fn aggregated(&self) -> A::Aggregate {
        self.tree.aggregated(&self.alloc)
    }

    /// Retires every node.
    pub fn clear(&mut self) {
        self.tree.clear(&mut self.alloc);
    }

    /// Replaces the content with the entries of `builder`.
    pub fn assign(&mut self, builder: TreeBuilder<K, V>) {
        self.tree.assign(&mut self.alloc, builder);
    }

    /// See [`TreeRoot::thaw`].
    pub fn thaw(&mut self, itr: &mut TreeIterator<K, V, A>) {
        self.tree.thaw(&mut self.alloc, itr);
    }

    /// See [`TreeRoot::update_data`].
    pub fn update_data(&mut self, itr: &mut TreeIterator<K, V, A>, value: V) {
        self.tree.update_data(&mut self.alloc, itr, value);
    }

    /// See [`TreeRoot::write_key`].
    pub fn write_key(&mut self, itr: &mut TreeIterator<K, V, A>, key: K) {
        self.tree.write_key(&mut self.alloc, itr, key);
    }

    /// Renders the node structure.
    pub fn render(&self) -> String
    where
        K: fmt::Display,
        V: fmt::Display,
    {
        self.tree.render(&self.alloc)
    }

    /// Structural self-check under the natural key order.
    pub fn validate(&self) -> Result<()>
    where
        K: Ord,
    {
        self.tree.validate_by(&self.alloc, &NaturalOrder)
    }

    /// Structural self-check under `cmp`.
    pub fn validate_by<C>(&self, cmp: &C) -> Result<()>
    where
        C: KeyComparator<K> + ?Sized,
    {
        self.tree.validate_by(&self.alloc, cmp)
    }

    /// Writer's current root.
    pub fn root(&self) -> EntryRef {
        self.tree.root()
    }

    /// Replaces the writer's root, e.g. after compacting with a cursor.
    pub fn set_root(&mut self, root: EntryRef) {
        self.tree.set_root(root);
    }

    /// Node arena.
    pub fn allocator(&self) -> &NodeAllocator<K, V, A> {
        &self.alloc
    }

    /// Mutable node arena, for incremental compaction.
    pub fn allocator_mut(&mut self) -> &mut NodeAllocator<K, V, A> {
        &mut self.alloc
    }

    /// Operation counters.
    pub fn stats(&self) -> Arc<BTreeStats> {
        self.alloc.stats()
    }

    /// Arena accounting.
    pub fn memory_stats(&self) -> DataStoreStats {
        self.alloc.memory_stats()
    }

    /// Freezes every node written so far and publishes the root to readers.
    pub fn freeze(&mut self) {
        self.alloc.freeze();
        self.published.store(self.tree.root().raw(), Ordering::Release);
    }

    /// Tags nodes retired since the last transfer with `generation`.
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.alloc.transfer_hold_lists(generation);
    }

    /// Releases nodes retired before `first_used`.
    pub fn trim_hold_lists(&mut self, first_used: Generation) -> usize {
        self.alloc.trim_hold_lists(first_used)
    }

    /// Publishes the current state and reclaims what no reader can observe.
    ///
    /// Runs freeze, hold-list transfer, generation advance and trim in order.
    /// Returns the new current generation.
    pub fn commit_generation(&mut self, handler: &GenerationHandler) -> Generation {
        self.freeze();
        self.transfer_hold_lists(handler.current_generation());
        let generation = handler.inc_generation();
        self.trim_hold_lists(handler.first_used_generation());
        generation
    }

    /// Relocates every live node out of the arena chunks that existed when
    /// compaction started.
    ///
    /// The old chunks are released once a later [`BTree::commit_generation`]
    /// trims the held copies.
    pub fn compact(&mut self) {
        self.alloc.settle_cursors(0);
        let ids = self.alloc.start_compact();
        let mut itr = self.tree.end(&self.alloc);
        let root = itr.move_first_leaf_node(&mut self.alloc, self.tree.root());
        self.tree.set_root(root);
        while itr.valid() {
            itr.move_next_leaf_node(&mut self.alloc);
        }
        self.tree.set_root(itr.root());
        self.alloc.finish_compact(ids);
    }

    /// Read handle for other threads, pinned through `handler`.
    pub fn reader(&self, handler: &Arc<GenerationHandler>) -> TreeReader<K, V, A> {
        TreeReader {
            table: self.alloc.reader(),
            published: Arc::clone(&self.published),
            handler: Arc::clone(handler),
            threshold: self.alloc.threshold(),
        }
    }
}

/// Cloneable, thread-safe entry point for readers of a [`BTree`].
pub struct TreeReader<K, V, A: AggrCalc<V>> {
    table: Arc<SlotTable<TreeNode<K, V, A>>>,
    published: Arc<AtomicU32>,
    handler: Arc<GenerationHandler>,
    threshold: usize,
}

impl<K, V, A: AggrCalc<V>> Clone for TreeReader<K, V, A> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            published: Arc::clone(&self.published),
            handler: Arc::clone(&self.handler),
            threshold: self.threshold,
        }
    }
}

impl<K, V, A: AggrCalc<V>> TreeReader<K, V, A> {
    /// Pins the current generation and captures the last published root.
    pub fn snapshot(&self) -> FrozenView<K, V, A> {
        // The guard must be registered before the root is read.
        let guard = Arc::new(self.handler.take_guard());
        let root = EntryRef::from_raw(self.published.load(Ordering::Acquire));
        FrozenView {
            table: Arc::clone(&self.table),
            guard,
            root,
            threshold: self.threshold,
        }
    }
}

/// Immutable snapshot of a published tree.
///
/// Cursors created from the view share its generation guard and stay valid
/// after the view is dropped.
pub struct FrozenView<K, V, A: AggrCalc<V>> {
    table: Arc<SlotTable<TreeNode<K, V, A>>>,
    guard: Arc<GenerationGuard>,
    root: EntryRef,
    threshold: usize,
}

impl<K, V, A: AggrCalc<V>> FrozenView<K, V, A> {
    fn pin(&self) -> Option<SnapshotPin> {
        Some(SnapshotPin::Reader(Arc::clone(&self.guard)))
    }

    /// Published root.
    pub fn root(&self) -> EntryRef {
        self.root
    }

    /// Generation pinned by this view.
    pub fn generation(&self) -> Generation {
        self.guard.generation()
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        if self.root.valid() {
            self.table.get(self.root).valid_leaves()
        } else {
            0
        }
    }

    /// Returns `true` for an empty snapshot.
    pub fn is_empty(&self) -> bool {
        !self.root.valid()
    }

    /// Aggregate over every value of the snapshot.
    pub fn aggregated(&self) -> A::Aggregate {
        if self.root.valid() {
            self.table.get(self.root).aggregated().clone()
        } else {
            A::Aggregate::default()
        }
    }

    /// Cursor on the first entry.
    pub fn begin(&self) -> TreeIterator<K, V, A> {
        TreeIterator::begin(self.table.clone(), self.root, self.pin())
    }

    /// Cursor on the last entry.
    pub fn last(&self) -> TreeIterator<K, V, A> {
        TreeIterator::last(self.table.clone(), self.root, self.pin())
    }

    /// End cursor.
    pub fn end(&self) -> TreeIterator<K, V, A> {
        TreeIterator::end(self.table.clone(), self.root, self.pin())
    }

    /// Cursor on `key` or the end cursor.
    pub fn find(&self, key: &K) -> TreeIterator<K, V, A>
    where
        K: Ord,
    {
        self.find_by(key, &NaturalOrder)
    }

    /// Cursor on the first entry not less than `key`.
    pub fn lower_bound(&self, key: &K) -> TreeIterator<K, V, A>
    where
        K: Ord,
    {
        self.lower_bound_by(key, &NaturalOrder)
    }

    /// Cursor on `key` ordered by `cmp`.
    pub fn find_by<C>(&self, key: &K, cmp: &C) -> TreeIterator<K, V, A>
    where
        C: KeyComparator<K> + ?Sized,
    {
        TreeIterator::find(
            self.table.clone(),
            self.root,
            self.pin(),
            key,
            cmp,
            self.threshold,
        )
    }

    /// Cursor on the first entry not less than `key`, ordered by `cmp`.
    pub fn lower_bound_by<C>(&self, key: &K, cmp: &C) -> TreeIterator<K, V, A>
    where
        C: KeyComparator<K> + ?Sized,
    {
        TreeIterator::lower_bound(
            self.table.clone(),
            self.root,
            self.pin(),
            key,
            cmp,
            self.threshold,
        )
    }
}
