use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use epochtree::storage::btree::MinMaxAggrCalc;
use epochtree::storage::TreeReader;
use epochtree::{BTree, BTreeOptions, GenerationHandler, Result};

const NUM_READERS: usize = 4;
const ROUNDS: u32 = 200;
const BATCH: u32 = 25;

type MyTree = BTree<u32, i64, MinMaxAggrCalc>;

/// Walks one snapshot and checks it is internally consistent.
fn check_snapshot(reader: &TreeReader<u32, i64, MinMaxAggrCalc>) -> usize {
    let view = reader.snapshot();
    let mut itr = view.begin();
    let mut count = 0usize;
    let mut prev: Option<u32> = None;
    let (mut min, mut max) = (i64::MAX, i64::MIN);
    while let Some((&key, &value)) = itr.entry() {
        assert!(prev.map_or(true, |prev| prev < key), "keys out of order");
        assert_eq!(value, i64::from(key) * 3);
        min = min.min(value);
        max = max.max(value);
        prev = Some(key);
        count += 1;
        itr.step_forward();
    }
    assert_eq!(count, view.size());
    let aggr = view.aggregated();
    assert_eq!((aggr.min(), aggr.max()), (min, max));
    count
}

#[test]
fn readers_observe_consistent_snapshots_while_writer_commits() -> Result<()> {
    let handler = GenerationHandler::new();
    let mut tree = MyTree::new(BTreeOptions::default().slots(6))?;
    let reader = tree.reader(&handler);
    let done = Arc::new(AtomicBool::new(false));
    let snapshots = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(NUM_READERS + 1));

    let mut handles = Vec::new();
    for _ in 0..NUM_READERS {
        let reader = reader.clone();
        let done = Arc::clone(&done);
        let snapshots = Arc::clone(&snapshots);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            while !done.load(Ordering::Acquire) {
                check_snapshot(&reader);
                snapshots.fetch_add(1, Ordering::Relaxed);
            }
            check_snapshot(&reader)
        }));
    }

    barrier.wait();
    for round in 0..ROUNDS {
        for key in round * BATCH..(round + 1) * BATCH {
            tree.insert(key, i64::from(key) * 3);
        }
        if round >= 2 {
            for key in (round - 2) * BATCH..(round - 2) * BATCH + BATCH / 2 {
                tree.remove(&key);
            }
        }
        tree.commit_generation(&handler);
    }
    done.store(true, Ordering::Release);

    for handle in handles {
        let seen = handle.join().expect("reader thread panicked");
        assert_eq!(seen, tree.size());
    }
    assert!(snapshots.load(Ordering::Relaxed) > 0);

    tree.commit_generation(&handler);
    let stats = tree.memory_stats();
    assert_eq!(stats.held, 0);
    assert_eq!(handler.reader_snapshot().active, 0);
    Ok(())
}

#[test]
fn pinned_reader_holds_back_reclamation() -> Result<()> {
    let handler = GenerationHandler::new();
    let mut tree = MyTree::new(BTreeOptions::default().slots(4))?;
    for key in 0..500 {
        tree.insert(key, i64::from(key) * 3);
    }
    tree.commit_generation(&handler);
    let reader = tree.reader(&handler);

    let (pinned_tx, pinned_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let worker = thread::spawn(move || {
        let view = reader.snapshot();
        pinned_tx.send(view.generation()).expect("writer alive");
        release_rx.recv().expect("writer alive");
        let mut itr = view.begin();
        let mut count = 0u32;
        while itr.valid() {
            assert_eq!(*itr.key(), count);
            assert_eq!(*itr.data(), i64::from(count) * 3);
            count += 1;
            itr.step_forward();
        }
        count
    });

    let pinned = pinned_rx.recv().expect("reader alive");
    for key in 0..500 {
        tree.remove(&key);
        if key % 50 == 0 {
            tree.commit_generation(&handler);
        }
    }
    tree.commit_generation(&handler);
    assert_eq!(handler.first_used_generation(), pinned);
    assert!(tree.memory_stats().held > 0);

    release_tx.send(()).expect("reader alive");
    assert_eq!(worker.join().expect("reader thread panicked"), 500);

    tree.commit_generation(&handler);
    let stats = tree.memory_stats();
    assert_eq!(stats.held, 0);
    assert_eq!(stats.live, 0);
    Ok(())
}
