//! Concurrent copy-on-write B-trees with generation-based reclamation.
//!
//! A single writer mutates a [`storage::BTree`] (or a clustered
//! [`storage::TreeStore`]) while any number of readers iterate over frozen
//! snapshots. Retired nodes are released only once no registered reader
//! generation can still reach them.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use primitives::datastore::{DataStore, DataStoreStats};
pub use primitives::generation::{GenerationGuard, GenerationHandler, ReaderSnapshot};
pub use storage::btree::{
    AggrCalc, MinMax, MinMaxAggrCalc, NoAggrCalc, TreeBuilder, TreeIterator,
};
pub use storage::{BTree, BTreeOptions, TreeStore, TreeStoreOptions};
pub use types::{EntryRef, Generation, Result, TreeError};
