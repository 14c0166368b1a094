use std::sync::Arc;
use std::thread;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tempfile::TempDir;

use vellum::buffer::{BufferPoolManager, INVALID_PAGE_ID};
use vellum::config::BTreeConfig;
use vellum::index::{default_comparator, BPlusTreeIndex};
use vellum::storage::page::RecordId;
use vellum::storage::{DiskManager, DiskScheduler};

fn key(i: i64) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn decode_key(bytes: &[u8]) -> i64 {
    i64::from_be_bytes(bytes.try_into().expect("8-byte key"))
}

fn rid(i: i64) -> RecordId {
    RecordId::new(i as u32, i as u32)
}

fn setup(
    leaf_max_size: u32,
    internal_max_size: u32,
    pool_size: usize,
) -> (TempDir, Arc<BufferPoolManager>, BPlusTreeIndex) {
    let temp_dir = TempDir::new().unwrap();
    let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("index.db")).unwrap());
    let scheduler = Arc::new(DiskScheduler::new(disk_manager));
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, 2, scheduler));
    let index = BPlusTreeIndex::new(
        "test_index",
        default_comparator,
        buffer_pool.clone(),
        BTreeConfig {
            leaf_max_size,
            internal_max_size,
        },
    )
    .unwrap();
    (temp_dir, buffer_pool, index)
}

fn iterate_keys(index: &BPlusTreeIndex) -> Vec<i64> {
    let mut iter = index.begin().unwrap();
    iter.collect_remaining()
        .unwrap()
        .into_iter()
        .map(|(k, _)| decode_key(&k))
        .collect()
}

#[test]
fn inserts_with_point_lookups_and_ordered_scan() {
    let (_dir, buffer_pool, index) = setup(4, 5, 64);
    let keys = [5i64, 2, 8, 1, 9, 7, 3];

    for (n, &k) in keys.iter().enumerate() {
        assert!(index.insert(&key(k), rid(k)).unwrap());
        index.verify_integrity().unwrap();

        for &seen in &keys[..=n] {
            assert_eq!(index.get(&key(seen)).unwrap(), Some(rid(seen)), "key {}", seen);
        }
        assert_eq!(index.get(&key(4)).unwrap(), None);
    }

    assert_eq!(iterate_keys(&index), vec![1, 2, 3, 5, 7, 8, 9]);
    assert_eq!(buffer_pool.pinned_page_count(), 0);
}

#[test]
fn removals_keep_scan_order_and_invariants() {
    let (_dir, buffer_pool, index) = setup(4, 5, 64);
    for k in [5i64, 2, 8, 1, 9, 7, 3] {
        index.insert(&key(k), rid(k)).unwrap();
    }

    index.remove(&key(8)).unwrap();
    index.verify_integrity().unwrap();
    index.remove(&key(1)).unwrap();
    index.verify_integrity().unwrap();

    assert_eq!(iterate_keys(&index), vec![2, 3, 5, 7, 9]);
    assert_eq!(index.get(&key(8)).unwrap(), None);
    assert_eq!(index.get(&key(1)).unwrap(), None);
    assert_eq!(buffer_pool.pinned_page_count(), 0);
}

#[test]
fn duplicate_insert_is_a_noop() {
    let (_dir, _bp, index) = setup(4, 5, 64);

    assert!(index.insert(&key(7), rid(7)).unwrap());
    assert!(!index.insert(&key(7), RecordId::new(99, 99)).unwrap());
    // The original value survives.
    assert_eq!(index.get(&key(7)).unwrap(), Some(rid(7)));
}

#[test]
fn removing_absent_keys_is_a_noop() {
    let (_dir, _bp, index) = setup(4, 5, 64);

    index.remove(&key(1)).unwrap();
    assert!(index.is_empty());

    index.insert(&key(1), rid(1)).unwrap();
    index.remove(&key(2)).unwrap();
    assert_eq!(index.get(&key(1)).unwrap(), Some(rid(1)));
}

#[test]
fn sequential_fill_then_drain_leaves_empty_tree() {
    let (_dir, buffer_pool, index) = setup(4, 5, 64);

    for k in 1..=16i64 {
        assert!(index.insert(&key(k), rid(k)).unwrap());
        index.verify_integrity().unwrap();
    }
    assert_eq!(iterate_keys(&index), (1..=16).collect::<Vec<_>>());

    for k in 1..=16i64 {
        index.remove(&key(k)).unwrap();
        index.verify_integrity().unwrap();
        assert_eq!(index.get(&key(k)).unwrap(), None);
        assert_eq!(iterate_keys(&index), ((k + 1)..=16).collect::<Vec<_>>());
        assert_eq!(buffer_pool.pinned_page_count(), 0);
    }

    assert!(index.is_empty());
    assert_eq!(index.root_page_id(), INVALID_PAGE_ID);
    assert_eq!(
        index.persisted_root_page_id().unwrap(),
        Some(INVALID_PAGE_ID)
    );
}

#[test]
fn deleting_the_only_key_empties_the_tree() {
    let (_dir, _bp, index) = setup(4, 5, 64);

    index.insert(&key(42), rid(42)).unwrap();
    assert!(!index.is_empty());

    index.remove(&key(42)).unwrap();
    assert!(index.is_empty());
    assert_eq!(index.root_page_id(), INVALID_PAGE_ID);
    assert_eq!(
        index.persisted_root_page_id().unwrap(),
        Some(INVALID_PAGE_ID)
    );
}

#[test]
fn root_with_single_child_is_promoted() {
    // Small fanout so a few keys build height and a few deletes shrink it.
    let (_dir, buffer_pool, index) = setup(2, 3, 64);

    for k in 1..=6i64 {
        index.insert(&key(k), rid(k)).unwrap();
        index.verify_integrity().unwrap();
    }
    let tall = index.pretty_format().unwrap().lines().count();
    assert!(tall >= 2, "expected a multi-level tree");
    let old_root = index.root_page_id();

    for k in (2..=6i64).rev() {
        index.remove(&key(k)).unwrap();
        index.verify_integrity().unwrap();
    }

    let short = index.pretty_format().unwrap().lines().count();
    assert!(short < tall, "tree height should shrink");
    assert_ne!(index.root_page_id(), old_root);
    // The abandoned root was handed back to the buffer pool.
    assert_eq!(buffer_pool.pin_count(old_root), None);
    assert_eq!(iterate_keys(&index), vec![1]);
    assert_eq!(
        index.persisted_root_page_id().unwrap(),
        Some(index.root_page_id())
    );
}

#[test]
fn root_persists_in_header_after_every_mutation() {
    let (_dir, _bp, index) = setup(2, 3, 64);

    for k in 1..=32i64 {
        index.insert(&key(k), rid(k)).unwrap();
        assert_eq!(
            index.persisted_root_page_id().unwrap(),
            Some(index.root_page_id())
        );
    }
    for k in 1..=32i64 {
        index.remove(&key(k)).unwrap();
        assert_eq!(
            index.persisted_root_page_id().unwrap(),
            Some(index.root_page_id())
        );
    }
}

#[test]
fn index_reopens_from_header_record() {
    let (_dir, buffer_pool, index) = setup(4, 5, 64);
    for k in 1..=50i64 {
        index.insert(&key(k), rid(k)).unwrap();
    }
    let root = index.root_page_id();
    drop(index);

    let reopened = BPlusTreeIndex::new(
        "test_index",
        default_comparator,
        buffer_pool,
        BTreeConfig {
            leaf_max_size: 4,
            internal_max_size: 5,
        },
    )
    .unwrap();
    assert_eq!(reopened.root_page_id(), root);
    for k in 1..=50i64 {
        assert_eq!(reopened.get(&key(k)).unwrap(), Some(rid(k)));
    }
}

#[test]
fn shuffled_insert_then_shuffled_remove_round_trip() {
    let (_dir, buffer_pool, index) = setup(4, 5, 256);
    let mut rng = thread_rng();

    let mut keys: Vec<i64> = (1..=200).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        assert!(index.insert(&key(k), rid(k)).unwrap());
    }
    index.verify_integrity().unwrap();
    assert_eq!(iterate_keys(&index), (1..=200).collect::<Vec<_>>());

    keys.shuffle(&mut rng);
    for (n, &k) in keys.iter().enumerate() {
        index.remove(&key(k)).unwrap();
        if n % 10 == 0 {
            index.verify_integrity().unwrap();
        }
    }

    assert!(index.is_empty());
    assert_eq!(index.root_page_id(), INVALID_PAGE_ID);
    assert_eq!(buffer_pool.pinned_page_count(), 0);
}

#[test]
fn begin_at_positions_inside_the_leaf_chain() {
    let (_dir, _bp, index) = setup(4, 5, 64);
    for k in (2..=20i64).step_by(2) {
        index.insert(&key(k), rid(k)).unwrap();
    }

    // Present key: iteration starts at it.
    let mut iter = index.begin_at(&key(8)).unwrap();
    let from_eight: Vec<i64> = iter
        .collect_remaining()
        .unwrap()
        .into_iter()
        .map(|(k, _)| decode_key(&k))
        .collect();
    assert_eq!(from_eight, vec![8, 10, 12, 14, 16, 18, 20]);

    // Absent key: iteration starts at its successor.
    let mut iter = index.begin_at(&key(13)).unwrap();
    let from_thirteen: Vec<i64> = iter
        .collect_remaining()
        .unwrap()
        .into_iter()
        .map(|(k, _)| decode_key(&k))
        .collect();
    assert_eq!(from_thirteen, vec![14, 16, 18, 20]);

    // Past the last key: immediately exhausted.
    let mut iter = index.begin_at(&key(21)).unwrap();
    assert_eq!(iter.next().unwrap(), None);
}

#[test]
fn empty_tree_iteration_and_lookup() {
    let (_dir, _bp, index) = setup(4, 5, 64);

    assert!(index.is_empty());
    assert_eq!(index.get(&key(1)).unwrap(), None);
    let mut iter = index.begin().unwrap();
    assert!(iter.is_end());
    assert_eq!(iter.next().unwrap(), None);
}

#[test]
fn concurrent_disjoint_inserts_enumerate_fully() {
    let (_dir, buffer_pool, index) = setup(4, 5, 512);
    let index = Arc::new(index);

    let threads: i64 = 8;
    let per_thread: i64 = 125;
    let mut handles = Vec::new();
    for t in 0..threads {
        let index = index.clone();
        handles.push(thread::spawn(move || {
            let mut keys: Vec<i64> =
                ((t * per_thread + 1)..=((t + 1) * per_thread)).collect();
            keys.shuffle(&mut thread_rng());
            for k in keys {
                assert!(index.insert(&key(k), rid(k)).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    index.verify_integrity().unwrap();
    assert_eq!(iterate_keys(&index), (1..=1000).collect::<Vec<_>>());
    assert_eq!(buffer_pool.pinned_page_count(), 0);
}

#[test]
fn concurrent_mixed_workload_stays_consistent() {
    let (_dir, buffer_pool, index) = setup(4, 5, 512);
    let index = Arc::new(index);

    // Every thread owns a disjoint range; inside it, inserts, lookups and
    // deletes interleave freely with the other threads' traffic.
    let threads: i64 = 4;
    let per_thread: i64 = 200;
    let mut handles = Vec::new();
    for t in 0..threads {
        let index = index.clone();
        handles.push(thread::spawn(move || {
            let low = t * per_thread + 1;
            let high = (t + 1) * per_thread;
            let mut keys: Vec<i64> = (low..=high).collect();
            keys.shuffle(&mut thread_rng());
            for &k in &keys {
                assert!(index.insert(&key(k), rid(k)).unwrap());
            }
            for &k in &keys {
                assert_eq!(index.get(&key(k)).unwrap(), Some(rid(k)));
            }
            // Drop the odd keys again.
            for &k in keys.iter().filter(|k| *k % 2 == 1) {
                index.remove(&key(k)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    index.verify_integrity().unwrap();
    let expected: Vec<i64> = (1..=threads * per_thread).filter(|k| k % 2 == 0).collect();
    assert_eq!(iterate_keys(&index), expected);
    assert_eq!(buffer_pool.pinned_page_count(), 0);
}

#[test]
fn bulk_load_and_drain_from_files() {
    let (_dir, _bp, index) = setup(4, 5, 64);

    let dir = TempDir::new().unwrap();
    let insert_path = dir.path().join("insert.txt");
    let remove_path = dir.path().join("remove.txt");
    std::fs::write(&insert_path, "3 1 4\n1 5 9 2 6\n").unwrap();
    std::fs::write(&remove_path, "4 9\n").unwrap();

    index.insert_from_file(&insert_path).unwrap();
    // Duplicates in the file are ignored.
    assert_eq!(iterate_keys(&index), vec![1, 2, 3, 4, 5, 6, 9]);

    index.remove_from_file(&remove_path).unwrap();
    assert_eq!(iterate_keys(&index), vec![1, 2, 3, 5, 6]);
}
