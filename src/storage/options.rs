use serde::{Deserialize, Serialize};

use crate::types::{Result, TreeError};

const MIN_LEAF_SLOTS: usize = 3;
// Non-root internal nodes must keep at least two children.
const MIN_INTERNAL_SLOTS: usize = 4;
const MAX_SLOTS: usize = 1024;
const MAX_CLUSTER_LIMIT: usize = 256;

/// Configuration knobs for a copy-on-write B-tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BTreeOptions {
    /// Maximum number of entries in a leaf node.
    pub leaf_slots: usize,
    /// Maximum number of children in an internal node.
    pub internal_slots: usize,
    /// Nodes with more keys than this are searched with binary search.
    pub binary_search_threshold: usize,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            leaf_slots: 16,
            internal_slots: 16,
            binary_search_threshold: 8,
        }
    }
}

impl BTreeOptions {
    /// Sets the leaf capacity.
    pub fn leaf_slots(mut self, slots: usize) -> Self {
        self.leaf_slots = slots;
        self
    }

    /// Sets the internal node capacity.
    pub fn internal_slots(mut self, slots: usize) -> Self {
        self.internal_slots = slots;
        self
    }

    /// Sets leaf and internal capacity at once.
    pub fn slots(self, slots: usize) -> Self {
        self.leaf_slots(slots).internal_slots(slots)
    }

    /// Sets the node size above which lookups switch to binary search.
    pub fn binary_search_threshold(mut self, threshold: usize) -> Self {
        self.binary_search_threshold = threshold;
        self
    }

    /// Leaves with fewer entries than this underflow.
    pub fn min_leaf_slots(&self) -> usize {
        self.leaf_slots / 2
    }

    /// Internal nodes with fewer children than this underflow.
    pub fn min_internal_slots(&self) -> usize {
        self.internal_slots / 2
    }

    /// Checks every knob against its accepted range.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_LEAF_SLOTS..=MAX_SLOTS).contains(&self.leaf_slots) {
            return Err(TreeError::InvalidOptions("leaf_slots must be within 3..=1024"));
        }
        if !(MIN_INTERNAL_SLOTS..=MAX_SLOTS).contains(&self.internal_slots) {
            return Err(TreeError::InvalidOptions(
                "internal_slots must be within 4..=1024",
            ));
        }
        Ok(())
    }

    /// Parses and validates options from a TOML document.
    ///
    /// Missing keys fall back to their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let options: Self = toml::from_str(src)?;
        options.validate()?;
        Ok(options)
    }
}

/// Configuration for a [`super::TreeStore`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeStoreOptions {
    /// Largest cluster kept as a flat sorted array.
    pub cluster_limit: usize,
    /// Options for clusters promoted to trees.
    pub tree: BTreeOptions,
}

impl Default for TreeStoreOptions {
    fn default() -> Self {
        Self {
            cluster_limit: 8,
            tree: BTreeOptions::default(),
        }
    }
}

impl TreeStoreOptions {
    /// Sets the small-array cardinality limit.
    pub fn cluster_limit(mut self, limit: usize) -> Self {
        self.cluster_limit = limit;
        self
    }

    /// Sets the options used for promoted trees.
    pub fn tree(mut self, tree: BTreeOptions) -> Self {
        self.tree = tree;
        self
    }

    /// Checks every knob against its accepted range.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_CLUSTER_LIMIT).contains(&self.cluster_limit) {
            return Err(TreeError::InvalidOptions(
                "cluster_limit must be within 1..=256",
            ));
        }
        self.tree.validate()
    }

    /// Parses and validates options from a TOML document.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let options: Self = toml::from_str(src)?;
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() -> Result<()> {
        BTreeOptions::default().validate()?;
        TreeStoreOptions::default().validate()?;
        assert_eq!(BTreeOptions::default().min_leaf_slots(), 8);
        Ok(())
    }

    #[test]
    fn rejects_tiny_nodes() {
        let err = BTreeOptions::default().slots(2).validate().unwrap_err();
        assert!(matches!(err, TreeError::InvalidOptions(_)));
        let err = BTreeOptions::default().slots(3).validate().unwrap_err();
        assert!(matches!(
            err,
            TreeError::InvalidOptions("internal_slots must be within 4..=1024")
        ));
        BTreeOptions::default().leaf_slots(3).validate().unwrap();
        let err = TreeStoreOptions::default()
            .cluster_limit(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidOptions(_)));
    }

    #[test]
    fn parses_partial_toml() -> Result<()> {
        let options = BTreeOptions::from_toml_str("leaf_slots = 4\n")?;
        assert_eq!(options.leaf_slots, 4);
        assert_eq!(options.internal_slots, 16);

        let store = TreeStoreOptions::from_toml_str(
            "cluster_limit = 4\n[tree]\ninternal_slots = 6\n",
        )?;
        assert_eq!(store.cluster_limit, 4);
        assert_eq!(store.tree.internal_slots, 6);
        assert_eq!(store.tree.leaf_slots, 16);
        Ok(())
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = BTreeOptions::from_toml_str("leaf_slots = \"many\"").unwrap_err();
        assert!(matches!(err, TreeError::Config(_)));
        let err = BTreeOptions::from_toml_str("leaf_slots = 2048").unwrap_err();
        assert!(matches!(err, TreeError::InvalidOptions(_)));
    }
}
