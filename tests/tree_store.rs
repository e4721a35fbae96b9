use std::collections::BTreeMap;

use epochtree::storage::btree::MinMaxAggrCalc;
use epochtree::{BTreeOptions, EntryRef, GenerationHandler, Result, TreeStore, TreeStoreOptions};

type MyStore = TreeStore<u32, i32, MinMaxAggrCalc>;

fn to_val(key: u32) -> i32 {
    key as i32 + 1000
}

fn to_not_val(key: u32) -> i32 {
    key as i32 + 2000
}

fn check(store: &MyStore, handle: EntryRef, mock: &BTreeMap<u32, i32>) {
    assert_eq!(store.size(handle), mock.len());
    let mut itr = store.begin(handle);
    for (key, value) in mock {
        assert_eq!(itr.entry(), Some((key, value)));
        itr.step_forward();
    }
    assert!(!itr.valid());
    let aggr = store.aggregated(handle);
    assert_eq!(aggr.min(), mock.values().copied().min().unwrap_or(i32::MAX));
    assert_eq!(aggr.max(), mock.values().copied().max().unwrap_or(i32::MIN));
    for (key, value) in mock {
        assert_eq!(store.find(handle, key), Some(*value));
    }
}

#[test]
fn clusters_promote_and_demote_at_the_limit() -> Result<()> {
    let handler = GenerationHandler::new();
    let mut store = MyStore::new(TreeStoreOptions::default())?;
    let limit = store.options().cluster_limit;
    assert_eq!(limit, 8);
    let mut handle = EntryRef::INVALID;
    let mut mock = BTreeMap::new();
    assert!(store.is_small_array(handle));
    assert_eq!(store.size(handle), 0);

    for key in [40, 20, 60, 50] {
        assert!(store.insert(&mut handle, key, to_val(key)));
        assert!(!store.insert(&mut handle, key, to_not_val(key)));
        mock.insert(key, to_val(key));
        check(&store, handle, &mock);
        assert!(store.is_small_array(handle));
    }

    for i in 0..100u32 {
        let key = 1000 + i;
        assert!(store.insert(&mut handle, key, to_val(key)));
        assert!(!store.insert(&mut handle, key, to_not_val(key)));
        mock.insert(key, to_val(key));
        check(&store, handle, &mock);
        assert_eq!(store.is_small_array(handle), 5 + i as usize <= limit, "after {i}");
        if i % 10 == 0 {
            store.commit_generation(&handler);
        }
    }

    for key in [40, 20, 50] {
        assert!(store.remove(&mut handle, &key));
        assert!(!store.remove(&mut handle, &key));
        mock.remove(&key);
        check(&store, handle, &mock);
    }

    for i in 0..100u32 {
        let key = 1000 + i;
        assert!(store.remove(&mut handle, &key));
        mock.remove(&key);
        check(&store, handle, &mock);
        assert_eq!(store.is_small_array(handle), 100 - i as usize <= limit, "after {i}");
        if i % 10 == 0 {
            store.commit_generation(&handler);
        }
    }
    assert_eq!(store.size(handle), 1);
    assert!(store.is_small_array(handle));

    store.clear(&mut handle);
    assert!(!handle.valid());
    store.freeze();
    store.transfer_hold_lists(handler.current_generation());
    handler.inc_generation();
    store.trim_hold_lists(handler.first_used_generation());
    assert_eq!(store.cluster_stats().live, 0);
    assert_eq!(store.node_stats().live, 0);
    Ok(())
}

#[test]
fn aggregates_agree_across_representations() -> Result<()> {
    let mut store = MyStore::new(TreeStoreOptions::default().cluster_limit(4))?;
    let mut small = EntryRef::INVALID;
    let mut large = EntryRef::INVALID;
    let values = [(5u32, -7i32), (9, 3), (2, 11), (7, 0)];
    for (key, value) in values {
        store.insert(&mut small, key, value);
        store.insert(&mut large, key, value);
    }
    store.insert(&mut large, 100, 1);
    store.remove(&mut large, &100);
    assert!(store.is_small_array(small));
    assert!(store.is_small_array(large));
    assert_eq!(store.aggregated(small), store.aggregated(large));

    store.insert(&mut large, 100, 1);
    assert!(!store.is_small_array(large));
    let aggr = store.aggregated(large);
    assert_eq!((aggr.min(), aggr.max()), (-7, 11));
    Ok(())
}

#[test]
fn published_clusters_are_readable_from_views() -> Result<()> {
    let handler = GenerationHandler::new();
    let mut store = MyStore::new(TreeStoreOptions::default().cluster_limit(2))?;
    let reader = store.reader(&handler);
    let mut handle = EntryRef::INVALID;
    for key in 0..3 {
        store.insert(&mut handle, key, to_val(key));
    }
    store.commit_generation(&handler);
    let published = handle;

    let view = reader.snapshot();
    assert!(!view.is_small_array(published));
    assert_eq!(view.size(published), 3);
    assert_eq!(view.find(published, &1), Some(to_val(1)));

    // Shrinking rewrites the frozen cluster under a new handle.
    store.remove(&mut handle, &0);
    store.remove(&mut handle, &1);
    assert_ne!(handle, published);
    store.commit_generation(&handler);

    assert_eq!(view.size(published), 3);
    let mut itr = view.begin(published);
    let mut keys = Vec::new();
    while itr.valid() {
        keys.push(*itr.key());
        itr.step_forward();
    }
    assert_eq!(keys, vec![0, 1, 2]);
    assert_eq!(view.aggregated(published).max(), to_val(2));
    drop(itr);
    drop(view);

    let fresh = reader.snapshot();
    assert!(fresh.is_small_array(handle));
    assert_eq!(fresh.find(handle, &2), Some(to_val(2)));
    assert_eq!(fresh.find(handle, &0), None);
    Ok(())
}

#[test]
fn apply_drives_promotion_and_demotion() -> Result<()> {
    let handler = GenerationHandler::new();
    let mut store = MyStore::new(TreeStoreOptions::default())?;
    let limit = store.options().cluster_limit;
    let mut handle = EntryRef::INVALID;
    let mut mock = BTreeMap::new();

    for key in [40, 20, 60, 50] {
        store.apply(&mut handle, [(key, to_val(key))], None);
        store.apply(&mut handle, [(key, to_not_val(key))], None);
        mock.insert(key, to_not_val(key));
        check(&store, handle, &mock);
        assert!(store.is_small_array(handle));
    }

    for i in 0..100u32 {
        let key = 1000 + i;
        store.apply(&mut handle, [(key, to_val(key))], None);
        mock.insert(key, to_val(key));
        check(&store, handle, &mock);
        assert_eq!(store.is_small_array(handle), 5 + i as usize <= limit, "after {i}");
        if i % 10 == 0 {
            store.commit_generation(&handler);
        }
    }

    // Overwrites on a promoted cluster keep its shape.
    store.apply(&mut handle, [(1050, to_not_val(1050)), (60, to_val(60))], [1051]);
    mock.insert(1050, to_not_val(1050));
    mock.insert(60, to_val(60));
    mock.remove(&1051);
    check(&store, handle, &mock);
    assert!(!store.is_small_array(handle));

    for key in [40, 20, 50] {
        store.apply(&mut handle, None, [key]);
        mock.remove(&key);
        check(&store, handle, &mock);
    }

    let tail: Vec<u32> = mock.keys().copied().filter(|&key| key >= 1000).collect();
    for key in tail {
        store.apply(&mut handle, None, [key]);
        mock.remove(&key);
        check(&store, handle, &mock);
        assert_eq!(store.is_small_array(handle), mock.len() <= limit);
        if key % 10 == 0 {
            store.commit_generation(&handler);
        }
    }
    assert_eq!(store.size(handle), 1);
    store.apply(&mut handle, None, [60]);
    assert!(!handle.valid());
    Ok(())
}

#[test]
fn writer_cursors_keep_their_cluster_snapshot() -> Result<()> {
    let options = TreeStoreOptions::default()
        .cluster_limit(2)
        .tree(BTreeOptions::default().slots(4));
    let mut store = MyStore::new(options)?;
    let mut handle = EntryRef::INVALID;
    for key in 0..20 {
        store.insert(&mut handle, key, to_val(key));
    }
    let mut itr = store.begin(handle);
    for key in 0..8 {
        assert!(store.remove(&mut handle, &key));
    }
    assert!(store.insert(&mut handle, 100, to_val(100)));

    let mut keys = Vec::new();
    while itr.valid() {
        assert_eq!(*itr.data(), to_val(*itr.key()));
        keys.push(*itr.key());
        itr.step_forward();
    }
    assert_eq!(keys, (0..20).collect::<Vec<_>>());
    assert_eq!(store.size(handle), 13);
    Ok(())
}
