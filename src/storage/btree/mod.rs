#![forbid(unsafe_code)]

//! Copy-on-write B-tree with per-node aggregation.
//!
//! Nodes live in a [`NodeAllocator`] arena. A writer edits nodes in place
//! until they are frozen; afterwards every change copies the node and retires
//! the original through the generation hold lists, so readers that captured an
//! older root keep a consistent snapshot.

/// Aggregation hooks and the built-in min/max aggregate.
pub mod aggregation;
mod builder;
mod compare;
mod iterator;
mod node;
mod stats;
mod tree;
mod view;

pub use aggregation::{AggrCalc, AggrValue, MinMax, MinMaxAggrCalc, NoAggrCalc, NoAggregated};
pub use builder::TreeBuilder;
pub use compare::{CompareFn, KeyComparator, NaturalOrder};
pub(crate) use iterator::SnapshotPin;
pub use iterator::TreeIterator;
pub use node::{InternalNode, LeafNode, Node, NodeAllocator, TreeNode};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::TreeRoot;
pub use view::{BTree, FrozenView, TreeReader};
