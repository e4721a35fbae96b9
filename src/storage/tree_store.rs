//! Clustered store of many small ordered sets.
//!
//! Each cluster is addressed by one [`EntryRef`] handle. Clusters with at most
//! `cluster_limit` entries are kept as a flat sorted array; larger ones are
//! promoted to a B-tree sharing the store's node arena. Handles change when a
//! frozen cluster is rewritten, so mutating calls take `&mut EntryRef`.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::primitives::datastore::{DataStore, DataStoreStats, SlotTable};
use crate::primitives::generation::{GenerationGuard, GenerationHandler};
use crate::storage::btree::{
    AggrCalc, BTreeStats, KeyComparator, NaturalOrder, NodeAllocator, SnapshotPin, TreeBuilder,
    TreeIterator, TreeNode, TreeRoot,
};
use crate::storage::options::TreeStoreOptions;
use crate::types::{EntryRef, Generation, Result};

type Entries<K, V> = SmallVec<[(K, V); 8]>;

#[derive(Clone, Debug)]
enum Cluster<K, V> {
    Array(Entries<K, V>),
    Tree(EntryRef),
}

enum Located<K, V, A> {
    Array(std::result::Result<usize, usize>),
    Tree(TreeRoot<K, V, A>),
}

fn search<K, V, C>(entries: &[(K, V)], key: &K, cmp: &C) -> std::result::Result<usize, usize>
where
    C: KeyComparator<K> + ?Sized,
{
    entries.binary_search_by(|(probe, _)| cmp.compare(probe, key))
}

/// Arena of clusters plus the node arena of every promoted cluster.
pub struct TreeStore<K, V, A: AggrCalc<V>> {
    clusters: DataStore<Cluster<K, V>>,
    nodes: NodeAllocator<K, V, A>,
    options: TreeStoreOptions,
}

impl<K, V, A> TreeStore<K, V, A>
where
    K: Clone,
    V: Clone,
    A: AggrCalc<V>,
{
    /// Creates an empty store.
    pub fn new(options: TreeStoreOptions) -> Result<Self> {
        Self::with_calc(options, A::default())
    }

    /// Creates an empty store with explicit aggregation hooks.
    pub fn with_calc(options: TreeStoreOptions, calc: A) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            clusters: DataStore::new(),
            nodes: NodeAllocator::new(options.tree.clone(), calc)?,
            options,
        })
    }

    /// Store configuration.
    pub fn options(&self) -> &TreeStoreOptions {
        &self.options
    }

    /// Inserts into the cluster behind `handle`, creating it when invalid.
    pub fn insert(&mut self, handle: &mut EntryRef, key: K, value: V) -> bool
    where
        K: Ord,
    {
        self.insert_by(handle, key, value, &NaturalOrder)
    }

    /// Inserts `key` unless present; promotes the cluster to a tree once it
    /// outgrows the array limit.
    pub fn insert_by<C>(&mut self, handle: &mut EntryRef, key: K, value: V, cmp: &C) -> bool
    where
        C: KeyComparator<K> + ?Sized,
    {
        if !handle.valid() {
            let mut entries = Entries::new();
            entries.push((key, value));
            *handle = self.clusters.allocate(Cluster::Array(entries));
            return true;
        }
        let idx = match self.locate(*handle, &key, cmp) {
            Located::Array(Ok(_)) => return false,
            Located::Array(Err(idx)) => idx,
            Located::Tree(mut tree) => {
                if !tree.insert_by(&mut self.nodes, key, value, cmp) {
                    return false;
                }
                self.store(handle, Cluster::Tree(tree.root()));
                return true;
            }
        };
        let (slot, mut entries) = self.edit_array(*handle);
        entries.insert(idx, (key, value));
        *handle = slot;
        if entries.len() > self.options.cluster_limit {
            let size = entries.len();
            let root = self.build(entries, cmp);
            self.clusters.put(slot, Cluster::Tree(root));
            tracing::trace!(
                target: "epochtree::tree_store",
                cluster = slot.raw(),
                size,
                "tree_store.promote"
            );
        } else {
            self.clusters.put(slot, Cluster::Array(entries));
        }
        true
    }

    /// Removes `key` from the cluster behind `handle`.
    pub fn remove(&mut self, handle: &mut EntryRef, key: &K) -> bool
    where
        K: Ord,
    {
        self.remove_by(handle, key, &NaturalOrder)
    }

    /// Removes `key`; demotes a tree back to an array once it fits the limit
    /// and invalidates `handle` when the cluster becomes empty.
    pub fn remove_by<C>(&mut self, handle: &mut EntryRef, key: &K, cmp: &C) -> bool
    where
        C: KeyComparator<K> + ?Sized,
    {
        if !handle.valid() {
            return false;
        }
        match self.locate(*handle, key, cmp) {
            Located::Array(Err(_)) => false,
            Located::Array(Ok(idx)) => {
                let (slot, mut entries) = self.edit_array(*handle);
                entries.remove(idx);
                self.clusters.put(slot, Cluster::Array(entries));
                *handle = slot;
                self.drop_if_empty(handle);
                true
            }
            Located::Tree(mut tree) => {
                if !tree.remove_by(&mut self.nodes, key, cmp) {
                    return false;
                }
                let size = tree.size(&self.nodes);
                if size <= self.options.cluster_limit {
                    let entries = self.collect(&tree);
                    tree.clear(&mut self.nodes);
                    self.store(handle, Cluster::Array(entries));
                    tracing::trace!(
                        target: "epochtree::tree_store",
                        cluster = handle.raw(),
                        size,
                        "tree_store.demote"
                    );
                    self.drop_if_empty(handle);
                } else {
                    self.store(handle, Cluster::Tree(tree.root()));
                }
                true
            }
        }
    }

    /// Removes `removals`, then inserts or overwrites `additions`.
    pub fn apply<I, R>(&mut self, handle: &mut EntryRef, additions: I, removals: R)
    where
        K: Ord,
        I: IntoIterator<Item = (K, V)>,
        R: IntoIterator<Item = K>,
    {
        self.apply_by(handle, additions, removals, &NaturalOrder);
    }

    /// [`TreeStore::apply`] ordered by `cmp`.
    pub fn apply_by<C, I, R>(&mut self, handle: &mut EntryRef, additions: I, removals: R, cmp: &C)
    where
        C: KeyComparator<K> + ?Sized,
        I: IntoIterator<Item = (K, V)>,
        R: IntoIterator<Item = K>,
    {
        for key in removals {
            self.remove_by(handle, &key, cmp);
        }
        for (key, value) in additions {
            if !handle.valid() {
                self.insert_by(handle, key, value, cmp);
                continue;
            }
            match self.locate(*handle, &key, cmp) {
                Located::Array(Ok(idx)) => {
                    let (slot, mut entries) = self.edit_array(*handle);
                    entries[idx].1 = value;
                    self.clusters.put(slot, Cluster::Array(entries));
                    *handle = slot;
                }
                Located::Tree(mut tree) => {
                    let mut itr = tree.find_by(&self.nodes, &key, cmp);
                    if itr.valid() {
                        tree.update_data(&mut self.nodes, &mut itr, value);
                        self.store(handle, Cluster::Tree(tree.root()));
                    } else {
                        self.insert_by(handle, key, value, cmp);
                    }
                }
                Located::Array(Err(_)) => {
                    self.insert_by(handle, key, value, cmp);
                }
            }
        }
    }

    /// Value stored under `key`.
    pub fn find(&self, handle: EntryRef, key: &K) -> Option<V>
    where
        K: Ord,
    {
        self.find_by(handle, key, &NaturalOrder)
    }

    /// Value stored under `key`, ordered by `cmp`.
    pub fn find_by<C>(&self, handle: EntryRef, key: &K, cmp: &C) -> Option<V>
    where
        C: KeyComparator<K> + ?Sized,
    {
        if !handle.valid() {
            return None;
        }
        match &*self.clusters.get(handle) {
            Cluster::Array(entries) => search(entries, key, cmp)
                .ok()
                .map(|idx| entries[idx].1.clone()),
            Cluster::Tree(root) => {
                let itr = TreeRoot::<K, V, A>::from_root(*root).find_by(&self.nodes, key, cmp);
                itr.valid().then(|| itr.data().clone())
            }
        }
    }

    /// Number of entries in the cluster; zero for an invalid handle.
    pub fn size(&self, handle: EntryRef) -> usize {
        cluster_size::<K, V, A>(&self.clusters.reader(), &self.nodes.reader(), handle)
    }

    /// Returns `true` while the cluster is stored as a flat array.
    ///
    /// An invalid handle names the empty set and counts as an array.
    pub fn is_small_array(&self, handle: EntryRef) -> bool {
        !handle.valid() || matches!(&*self.clusters.get(handle), Cluster::Array(_))
    }

    /// Aggregate over the cluster's values, identical for both representations.
    pub fn aggregated(&self, handle: EntryRef) -> A::Aggregate {
        cluster_aggregate(
            self.nodes.calc(),
            &self.clusters.reader(),
            &self.nodes.reader(),
            handle,
        )
    }

    /// Cursor on the first entry of the cluster.
    pub fn begin(&self, handle: EntryRef) -> ClusterIterator<K, V, A> {
        ClusterIterator::begin(
            &self.clusters.reader(),
            self.nodes.reader(),
            handle,
            Some(self.nodes.writer_pin()),
        )
    }

    /// Retires the cluster and everything below it.
    pub fn clear(&mut self, handle: &mut EntryRef) {
        if !handle.valid() {
            return;
        }
        if let Cluster::Tree(root) = &*self.clusters.get(*handle) {
            self.nodes.hold_subtree(*root);
        }
        self.clusters.hold(*handle);
        *handle = EntryRef::INVALID;
    }

    /// Freezes clusters and nodes written since the previous freeze.
    ///
    /// Handles the caller publishes to readers after this call stay readable
    /// until they are retired and trimmed.
    pub fn freeze(&mut self) {
        self.clusters.freeze();
        self.nodes.freeze();
    }

    /// Tags everything retired since the last transfer with `generation`.
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.clusters.transfer_hold_lists(generation);
        self.nodes.transfer_hold_lists(generation);
    }

    /// Releases everything retired before `first_used`.
    pub fn trim_hold_lists(&mut self, first_used: Generation) -> usize {
        self.clusters.trim_hold_lists(first_used) + self.nodes.trim_hold_lists(first_used)
    }

    /// Freeze, transfer, advance and trim in one step; returns the new generation.
    pub fn commit_generation(&mut self, handler: &GenerationHandler) -> Generation {
        self.freeze();
        self.transfer_hold_lists(handler.current_generation());
        let generation = handler.inc_generation();
        self.trim_hold_lists(handler.first_used_generation());
        generation
    }

    /// Cluster arena accounting.
    pub fn cluster_stats(&self) -> DataStoreStats {
        self.clusters.stats()
    }

    /// Node arena accounting.
    pub fn node_stats(&self) -> DataStoreStats {
        self.nodes.memory_stats()
    }

    /// Operation counters of the promoted trees.
    pub fn stats(&self) -> Arc<BTreeStats> {
        self.nodes.stats()
    }

    /// Read handle for other threads, pinned through `handler`.
    pub fn reader(&self, handler: &Arc<GenerationHandler>) -> TreeStoreReader<K, V, A> {
        TreeStoreReader {
            clusters: self.clusters.reader(),
            nodes: self.nodes.reader(),
            calc: self.nodes.calc().clone(),
            handler: Arc::clone(handler),
            threshold: self.nodes.threshold(),
        }
    }

    fn locate<C>(&self, handle: EntryRef, key: &K, cmp: &C) -> Located<K, V, A>
    where
        C: KeyComparator<K> + ?Sized,
    {
        match &*self.clusters.get(handle) {
            Cluster::Array(entries) => Located::Array(search(entries, key, cmp)),
            Cluster::Tree(root) => Located::Tree(TreeRoot::from_root(*root)),
        }
    }

    fn edit_array(&mut self, handle: EntryRef) -> (EntryRef, Entries<K, V>) {
        match self.clusters.edit(handle) {
            (slot, Cluster::Array(entries)) => (slot, entries),
            (_, Cluster::Tree(_)) => panic!("expected a small array cluster, found a tree"),
        }
    }

    fn store(&mut self, handle: &mut EntryRef, cluster: Cluster<K, V>) {
        let (slot, _) = self.clusters.edit(*handle);
        self.clusters.put(slot, cluster);
        *handle = slot;
    }

    fn drop_if_empty(&mut self, handle: &mut EntryRef) {
        let empty = matches!(&*self.clusters.get(*handle), Cluster::Array(entries) if entries.is_empty());
        if empty {
            self.clusters.hold(*handle);
            *handle = EntryRef::INVALID;
        }
    }

    fn build<C>(&mut self, entries: Entries<K, V>, cmp: &C) -> EntryRef
    where
        C: KeyComparator<K> + ?Sized,
    {
        let mut builder = TreeBuilder::with_capacity(entries.len());
        for (key, value) in entries {
            builder.insert_by(key, value, cmp);
        }
        builder.build(&mut self.nodes)
    }

    fn collect(&self, tree: &TreeRoot<K, V, A>) -> Entries<K, V> {
        let mut entries = Entries::new();
        let mut itr = tree.begin(&self.nodes);
        while let Some((key, value)) = itr.entry() {
            entries.push((key.clone(), value.clone()));
            itr.step_forward();
        }
        entries
    }
}

fn cluster_size<K, V, A: AggrCalc<V>>(
    clusters: &SlotTable<Cluster<K, V>>,
    nodes: &SlotTable<TreeNode<K, V, A>>,
    handle: EntryRef,
) -> usize {
    if !handle.valid() {
        return 0;
    }
    match &*clusters.get(handle) {
        Cluster::Array(entries) => entries.len(),
        Cluster::Tree(root) => nodes.get(*root).valid_leaves(),
    }
}

fn cluster_aggregate<K, V, A: AggrCalc<V>>(
    calc: &A,
    clusters: &SlotTable<Cluster<K, V>>,
    nodes: &SlotTable<TreeNode<K, V, A>>,
    handle: EntryRef,
) -> A::Aggregate {
    if !handle.valid() {
        return A::Aggregate::default();
    }
    match &*clusters.get(handle) {
        Cluster::Array(entries) => calc.from_values(entries.iter().map(|(_, value)| value)),
        Cluster::Tree(root) => nodes.get(*root).aggregated().clone(),
    }
}

enum Cursor<K, V, A: AggrCalc<V>> {
    Array {
        cluster: Arc<Cluster<K, V>>,
        idx: usize,
    },
    Tree(TreeIterator<K, V, A>),
}

/// Cursor over one cluster in either representation.
pub struct ClusterIterator<K, V, A: AggrCalc<V>> {
    cursor: Option<Cursor<K, V, A>>,
}

impl<K, V, A: AggrCalc<V>> ClusterIterator<K, V, A> {
    fn begin(
        clusters: &SlotTable<Cluster<K, V>>,
        nodes: Arc<SlotTable<TreeNode<K, V, A>>>,
        handle: EntryRef,
        pin: Option<SnapshotPin>,
    ) -> Self {
        if !handle.valid() {
            return Self { cursor: None };
        }
        let cluster = clusters.get(handle);
        let root = match &*cluster {
            Cluster::Tree(root) => Some(*root),
            Cluster::Array(_) => None,
        };
        let cursor = match root {
            Some(root) => Cursor::Tree(TreeIterator::begin(nodes, root, pin)),
            None => Cursor::Array { cluster, idx: 0 },
        };
        let mut itr = Self {
            cursor: Some(cursor),
        };
        itr.settle();
        itr
    }

    /// Returns `true` while positioned on an entry.
    pub fn valid(&self) -> bool {
        self.cursor.is_some()
    }

    /// Current entry, or `None` past the end.
    pub fn entry(&self) -> Option<(&K, &V)> {
        match self.cursor.as_ref()? {
            Cursor::Array { cluster, idx } => match &**cluster {
                Cluster::Array(entries) => entries.get(*idx).map(|(key, value)| (key, value)),
                Cluster::Tree(_) => None,
            },
            Cursor::Tree(itr) => itr.entry(),
        }
    }

    /// Key at the current position.
    ///
    /// # Panics
    /// Panics past the end.
    pub fn key(&self) -> &K {
        self.entry().expect("key() on an invalid cluster iterator").0
    }

    /// Value at the current position.
    ///
    /// # Panics
    /// Panics past the end.
    pub fn data(&self) -> &V {
        self.entry().expect("data() on an invalid cluster iterator").1
    }

    /// Advances to the next entry; a no-op past the end.
    pub fn step_forward(&mut self) {
        match self.cursor.as_mut() {
            Some(Cursor::Array { idx, .. }) => *idx += 1,
            Some(Cursor::Tree(itr)) => itr.step_forward(),
            None => return,
        }
        self.settle();
    }

    fn settle(&mut self) {
        let exhausted = match &self.cursor {
            Some(Cursor::Array { cluster, idx }) => match &**cluster {
                Cluster::Array(entries) => *idx >= entries.len(),
                Cluster::Tree(_) => true,
            },
            Some(Cursor::Tree(itr)) => !itr.valid(),
            None => false,
        };
        if exhausted {
            self.cursor = None;
        }
    }
}

/// Cloneable, thread-safe entry point for readers of a [`TreeStore`].
pub struct TreeStoreReader<K, V, A: AggrCalc<V>> {
    clusters: Arc<SlotTable<Cluster<K, V>>>,
    nodes: Arc<SlotTable<TreeNode<K, V, A>>>,
    calc: A,
    handler: Arc<GenerationHandler>,
    threshold: usize,
}

impl<K, V, A: AggrCalc<V>> Clone for TreeStoreReader<K, V, A> {
    fn clone(&self) -> Self {
        Self {
            clusters: Arc::clone(&self.clusters),
            nodes: Arc::clone(&self.nodes),
            calc: self.calc.clone(),
            handler: Arc::clone(&self.handler),
            threshold: self.threshold,
        }
    }
}

impl<K, V, A: AggrCalc<V>> TreeStoreReader<K, V, A> {
    /// Pins the current generation.
    ///
    /// Handles read after this call and published by a freeze stay resolvable
    /// for the lifetime of the returned view.
    pub fn snapshot(&self) -> TreeStoreView<K, V, A> {
        TreeStoreView {
            clusters: Arc::clone(&self.clusters),
            nodes: Arc::clone(&self.nodes),
            calc: self.calc.clone(),
            guard: Arc::new(self.handler.take_guard()),
            threshold: self.threshold,
        }
    }
}

/// Read-only access to published clusters under one generation guard.
pub struct TreeStoreView<K, V, A: AggrCalc<V>> {
    clusters: Arc<SlotTable<Cluster<K, V>>>,
    nodes: Arc<SlotTable<TreeNode<K, V, A>>>,
    calc: A,
    guard: Arc<GenerationGuard>,
    threshold: usize,
}

impl<K, V, A: AggrCalc<V>> TreeStoreView<K, V, A> {
    /// Generation pinned by this view.
    pub fn generation(&self) -> Generation {
        self.guard.generation()
    }

    /// Number of entries in the cluster.
    pub fn size(&self, handle: EntryRef) -> usize {
        cluster_size::<K, V, A>(&self.clusters, &self.nodes, handle)
    }

    /// Returns `true` while the cluster is stored as a flat array.
    pub fn is_small_array(&self, handle: EntryRef) -> bool {
        !handle.valid() || matches!(&*self.clusters.get(handle), Cluster::Array(_))
    }

    /// Aggregate over the cluster's values.
    pub fn aggregated(&self, handle: EntryRef) -> A::Aggregate {
        cluster_aggregate(&self.calc, &self.clusters, &self.nodes, handle)
    }

    /// Cursor on the first entry of the cluster.
    pub fn begin(&self, handle: EntryRef) -> ClusterIterator<K, V, A> {
        ClusterIterator::begin(
            &self.clusters,
            Arc::clone(&self.nodes),
            handle,
            Some(SnapshotPin::Reader(Arc::clone(&self.guard))),
        )
    }

    /// Value stored under `key`.
    pub fn find(&self, handle: EntryRef, key: &K) -> Option<V>
    where
        K: Ord,
        V: Clone,
    {
        self.find_by(handle, key, &NaturalOrder)
    }

    /// Value stored under `key`, ordered by `cmp`.
    pub fn find_by<C>(&self, handle: EntryRef, key: &K, cmp: &C) -> Option<V>
    where
        V: Clone,
        C: KeyComparator<K> + ?Sized,
    {
        if !handle.valid() {
            return None;
        }
        match &*self.clusters.get(handle) {
            Cluster::Array(entries) => search(entries, key, cmp)
                .ok()
                .map(|idx| entries[idx].1.clone()),
            Cluster::Tree(root) => {
                let itr: TreeIterator<K, V, A> = TreeIterator::find(
                    Arc::clone(&self.nodes),
                    *root,
                    Some(SnapshotPin::Reader(Arc::clone(&self.guard))),
                    key,
                    cmp,
                    self.threshold,
                );
                itr.valid().then(|| itr.data().clone())
            }
        }
    }
}
