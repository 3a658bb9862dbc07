//! E2E: elements representation switching.
//!
//! Dense writes stay in the simple array; a sparse write promotes to the
//! number dictionary; dense rewrites demote back. Values must be identical
//! across every switch, and tombstoned dictionary slots must be reused.

use anyhow::Result;
use pmstore::store::ARRAY_MAX_GAP;
use pmstore::{ObjectPool, PersistentValue, SnapshotFlag, MIN_POOL_SIZE};
use tempfile::tempdir;

const LAYOUT: &str = "e2e-representation";

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: index 0 on a fresh object takes the dense path
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn index_zero_stays_dense() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let mut obj = pool.new_object(true)?;
    obj.set_at(0, pool.persist_f64(0.5), SnapshotFlag::Snapshot)?;
    assert!(obj.elements().is_dense());
    assert_eq!(obj.len()?, 1);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: writing far past the capacity promotes to the dictionary
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn sparse_write_promotes_to_dictionary() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");
    let sparse_index = 10_000u32;
    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        let mut obj = pool.new_object(true)?;
        for i in 0..5 {
            obj.set_at(i, pool.persist_f64(i as f64), SnapshotFlag::Snapshot)?;
        }
        assert!(obj.elements().is_dense());

        obj.set_at(sparse_index, pool.persist_f64(99.0), SnapshotFlag::Snapshot)?;
        assert!(!obj.elements().is_dense());

        assert_eq!(pool.get_value(obj.get_at(2)?)?, PersistentValue::Number(2.0));
        assert_eq!(
            pool.get_value(obj.get_at(sparse_index)?)?,
            PersistentValue::Number(99.0)
        );
        assert_eq!(obj.len()?, sparse_index + 1);
        pool.set_root(obj.pptr())?;
        pool.close();
    }

    // The dictionary representation is durable.
    let pool = ObjectPool::open(&path, LAYOUT)?;
    let root = match pool.get_value(pool.get_root()?)? {
        PersistentValue::Object(p) => pool.object(p)?,
        other => panic!("unexpected root {other:?}"),
    };
    assert!(!root.elements().is_dense());
    assert_eq!(root.len()?, sparse_index + 1);
    assert_eq!(pool.get_value(root.get_at(4)?)?, PersistentValue::Number(4.0));
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: the exact gap boundary
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn promotion_fires_just_past_the_gap() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let mut obj = pool.new_object(true)?;
    obj.set_at(0, pool.persist_f64(0.0), SnapshotFlag::Snapshot)?;

    // One step below the gap threshold keeps the array dense.
    let gap_edge = ARRAY_MAX_GAP as u32;
    obj.set_at(gap_edge, pool.persist_f64(1.0), SnapshotFlag::Snapshot)?;
    assert!(obj.elements().is_dense());

    // Far past the gap from the current capacity: promoted.
    let len = obj.len()?;
    obj.set_at(len + gap_edge + ARRAY_MAX_GAP as u32, pool.persist_f64(2.0), SnapshotFlag::Snapshot)?;
    assert!(!obj.elements().is_dense());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: dense keys in a dictionary demote back to the array
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn dense_dictionary_demotes_to_array() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let mut obj = pool.new_object(true)?;

    // Force the dictionary representation, then cut it back to a dense
    // prefix {0..4}.
    for i in 0..5 {
        obj.set_at(i, pool.persist_f64(i as f64), SnapshotFlag::Snapshot)?;
    }
    obj.set_at(20_000, pool.persist_f64(9.0), SnapshotFlag::Snapshot)?;
    assert!(!obj.elements().is_dense());
    obj.set_len(5)?;

    obj.set_at(5, pool.persist_f64(5.0), SnapshotFlag::Snapshot)?;
    assert!(obj.elements().is_dense());

    for i in 0..6 {
        assert_eq!(
            pool.get_value(obj.get_at(i)?)?,
            PersistentValue::Number(i as f64)
        );
    }
    // Promote + demote preserved the index/value multiset; the shape of
    // property_names reflects it.
    let names = obj.property_names()?;
    assert_eq!(names, vec!["length", "0", "1", "2", "3", "4", "5"]);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: tombstoned dictionary slot is reused on reinsert
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn tombstone_reuse_in_number_dictionary() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let mm = pool.memory();
    let d = pmstore::NumDict::create(mm)?;

    d.set(6, pool.persist_f64(6.0), SnapshotFlag::Snapshot)?;
    let cap_before = d.allocated()?;
    d.del(6, SnapshotFlag::Snapshot)?;
    d.set(6, pool.persist_f64(60.0), SnapshotFlag::Snapshot)?;

    assert_eq!(d.get(6)?, pool.persist_f64(60.0));
    assert_eq!(d.allocated()?, cap_before);
    assert_eq!(d.used()?, 1);

    // Deleting the largest key and inserting a small colliding one must
    // still probe correctly: 6 and 14 share a bucket in a 8-slot table.
    d.del(6, SnapshotFlag::Snapshot)?;
    d.set(14, pool.persist_f64(14.0), SnapshotFlag::Snapshot)?;
    assert_eq!(d.get(14)?, pool.persist_f64(14.0));
    assert_eq!(d.get(6)?, pmstore::PPTR_UNDEFINED);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: push/pop across representations
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn push_pop_work_in_both_representations() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let mut obj = pool.new_object(true)?;

    obj.push(pool.persist_f64(1.0), SnapshotFlag::Snapshot)?;
    obj.push(pool.persist_f64(2.0), SnapshotFlag::Snapshot)?;
    assert_eq!(pool.get_value(obj.pop()?)?, PersistentValue::Number(2.0));
    assert_eq!(obj.len()?, 1);

    obj.set_at(50_000, pool.persist_f64(3.0), SnapshotFlag::Snapshot)?;
    assert!(!obj.elements().is_dense());
    assert_eq!(pool.get_value(obj.pop()?)?, PersistentValue::Number(3.0));
    assert_eq!(obj.len()?, 50_000);
    Ok(())
}
