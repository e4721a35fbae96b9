//! Ordered containers built on the generation-managed arenas.

/// Copy-on-write B-tree.
pub mod btree;
mod options;
mod tree_store;

pub use btree::{BTree, FrozenView, TreeReader};
pub use options::{BTreeOptions, TreeStoreOptions};
pub use tree_store::{ClusterIterator, TreeStore, TreeStoreReader, TreeStoreView};
