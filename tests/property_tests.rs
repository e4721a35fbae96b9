use std::collections::BTreeMap;

use epochtree::storage::btree::{MinMaxAggrCalc, TreeBuilder};
use epochtree::{BTree, BTreeOptions, GenerationHandler};
use proptest::prelude::*;

type MyTree = BTree<u16, i64, MinMaxAggrCalc>;

#[derive(Debug, Clone)]
enum Operation {
    Insert { key: u16, value: i64 },
    Remove { key: u16 },
    Update { key: u16, value: i64 },
    Commit,
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => (0u16..512, any::<i64>()).prop_map(|(key, value)| Operation::Insert { key, value }),
        3 => (0u16..512).prop_map(|key| Operation::Remove { key }),
        1 => (0u16..512, any::<i64>()).prop_map(|(key, value)| Operation::Update { key, value }),
        1 => Just(Operation::Commit),
    ]
}

fn check_tree(tree: &MyTree, mock: &BTreeMap<u16, i64>) -> Result<(), TestCaseError> {
    prop_assert!(tree.validate().is_ok(), "{:?}", tree.validate());
    prop_assert_eq!(tree.size(), mock.len());
    let mut itr = tree.begin();
    for (position, (key, value)) in mock.iter().enumerate() {
        prop_assert_eq!(itr.entry(), Some((key, value)));
        prop_assert_eq!(itr.position(), position);
        itr.step_forward();
    }
    prop_assert!(!itr.valid());
    let aggr = tree.aggregated();
    prop_assert_eq!(aggr.min(), mock.values().copied().min().unwrap_or(i64::MAX));
    prop_assert_eq!(aggr.max(), mock.values().copied().max().unwrap_or(i64::MIN));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tree_matches_btreemap(
        slots in 4usize..=9,
        ops in prop::collection::vec(arb_operation(), 1..400),
    ) {
        let handler = GenerationHandler::new();
        let mut tree = MyTree::new(BTreeOptions::default().slots(slots)).unwrap();
        let mut mock = BTreeMap::new();
        for op in ops {
            match op {
                Operation::Insert { key, value } => {
                    let fresh = !mock.contains_key(&key);
                    prop_assert_eq!(tree.insert(key, value), fresh);
                    mock.entry(key).or_insert(value);
                }
                Operation::Remove { key } => {
                    prop_assert_eq!(tree.remove(&key), mock.remove(&key).is_some());
                }
                Operation::Update { key, value } => {
                    let mut itr = tree.find(&key);
                    prop_assert_eq!(itr.valid(), mock.contains_key(&key));
                    if itr.valid() {
                        tree.update_data(&mut itr, value);
                        mock.insert(key, value);
                    }
                }
                Operation::Commit => {
                    tree.commit_generation(&handler);
                }
            }
        }
        check_tree(&tree, &mock)?;
    }

    #[test]
    fn prop_snapshots_survive_later_writes(
        before in prop::collection::btree_map(0u16..256, any::<i64>(), 0..120),
        ops in prop::collection::vec(arb_operation(), 1..200),
    ) {
        let handler = GenerationHandler::new();
        let mut tree = MyTree::new(BTreeOptions::default().slots(4)).unwrap();
        for (&key, &value) in &before {
            tree.insert(key, value);
        }
        tree.commit_generation(&handler);
        let reader = tree.reader(&handler);
        let view = reader.snapshot();

        for op in ops {
            match op {
                Operation::Insert { key, value } => {
                    tree.insert(key, value);
                }
                Operation::Remove { key } => {
                    tree.remove(&key);
                }
                Operation::Update { key, value } => {
                    let mut itr = tree.find(&key);
                    if itr.valid() {
                        tree.update_data(&mut itr, value);
                    }
                }
                Operation::Commit => {
                    tree.commit_generation(&handler);
                }
            }
        }
        tree.commit_generation(&handler);

        prop_assert_eq!(view.size(), before.len());
        let mut itr = view.begin();
        for (key, value) in &before {
            prop_assert_eq!(itr.entry(), Some((key, value)));
            itr.step_forward();
        }
        prop_assert!(!itr.valid());
    }

    #[test]
    fn prop_builder_equals_incremental(
        entries in prop::collection::btree_map(any::<u16>(), any::<i64>(), 0..600),
        slots in 4usize..=12,
    ) {
        let options = BTreeOptions::default().slots(slots);
        let mut incremental = MyTree::new(options.clone()).unwrap();
        let mut builder = TreeBuilder::with_capacity(entries.len());
        for (&key, &value) in &entries {
            incremental.insert(key, value);
            builder.insert(key, value);
        }
        let mut built = MyTree::new(options).unwrap();
        built.assign(builder);
        check_tree(&built, &entries)?;
        prop_assert_eq!(built.aggregated(), incremental.aggregated());
        prop_assert_eq!(built.size(), incremental.size());
    }

    #[test]
    fn prop_distance_is_antisymmetric(
        keys in prop::collection::btree_set(any::<u16>(), 1..300),
        a in any::<prop::sample::Index>(),
        b in any::<prop::sample::Index>(),
    ) {
        let mut tree = MyTree::new(BTreeOptions::default().slots(4)).unwrap();
        for &key in &keys {
            tree.insert(key, i64::from(key));
        }
        let keys: Vec<u16> = keys.into_iter().collect();
        let (ia, ib) = (a.index(keys.len()), b.index(keys.len()));
        let (ta, tb) = (tree.find(&keys[ia]), tree.find(&keys[ib]));
        prop_assert_eq!(&ta - &tb, ia as isize - ib as isize);
        prop_assert_eq!(&ta - &tb, -(&tb - &ta));
        let mut end = tree.end();
        end.step_backward();
        prop_assert!(end == tree.last());
    }

    #[test]
    fn prop_apply_matches_btreemap(
        initial in prop::collection::btree_map(0u16..256, any::<i64>(), 0..150),
        additions in prop::collection::vec((0u16..256, any::<i64>()), 0..80),
        removals in prop::collection::vec(0u16..256, 0..80),
        slots in 4usize..=8,
    ) {
        let mut tree = MyTree::new(BTreeOptions::default().slots(slots)).unwrap();
        for (&key, &value) in &initial {
            tree.insert(key, value);
        }
        let mut mock = initial;
        for key in &removals {
            mock.remove(key);
        }
        for &(key, value) in &additions {
            mock.insert(key, value);
        }
        tree.apply(additions, removals);
        check_tree(&tree, &mock)?;
    }
}
