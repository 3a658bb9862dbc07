//! E2E: reachability collection over a populated pool.
//!
//! Builds a large population of orphans around one rooted graph, collects,
//! and verifies that exactly the transitive closure of the root survives
//! and that the census numbers add up.

use anyhow::Result;
use pmstore::{ObjectPool, PersistentValue, SnapshotFlag, MIN_POOL_SIZE};
use tempfile::tempdir;

const LAYOUT: &str = "e2e-gc";

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: mass orphan sweep around one survivor graph
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn only_the_rooted_closure_survives() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");
    let pool = ObjectPool::create(&path, LAYOUT, 8 * MIN_POOL_SIZE, 0o600)?;

    // The survivor: {name: "kept", items: [1.0, "two"]}.
    let keeper = pool.new_object(false)?;
    keeper.set("name", pool.persist_str("kept")?, SnapshotFlag::Snapshot)?;
    let mut items = pool.new_object(true)?;
    items.set_at(0, pool.persist_f64(1.0), SnapshotFlag::Snapshot)?;
    items.set_at(1, pool.persist_str("two")?, SnapshotFlag::Snapshot)?;
    keeper.set("items", items.pptr(), SnapshotFlag::Snapshot)?;
    pool.set_root(keeper.pptr())?;

    // Ten thousand orphaned strings and a few hundred orphaned objects.
    for i in 0..10_000 {
        pool.persist_str(&format!("orphan-{i}"))?;
    }
    for _ in 0..200 {
        pool.new_object(false)?;
    }

    let report = pool.gc()?;
    // Live containers: keeper + its two children, items + its two children.
    assert_eq!(report.containers_live, 6);
    assert_eq!(report.containers_total, 6 + 200 * 3);
    // Live others: "kept", "two", and the two dict key strings.
    assert_eq!(report.others_live, 4);
    assert_eq!(report.others_total, 10_000 + 4);

    // Survivors are intact after the sweep.
    let keeper = pool.object(keeper.pptr())?;
    assert_eq!(
        pool.get_value(keeper.get("name")?)?,
        PersistentValue::String("kept".into())
    );
    let items = match pool.get_value(keeper.get("items")?)? {
        PersistentValue::Object(p) => pool.object(p)?,
        other => panic!("unexpected items {other:?}"),
    };
    assert_eq!(
        pool.get_value(items.get_at(1)?)?,
        PersistentValue::String("two".into())
    );

    // A second census finds exactly the survivors.
    let report2 = pool.gc()?;
    assert_eq!(report2.containers_total, report2.containers_live);
    assert_eq!(report2.containers_total, 6);
    assert_eq!(report2.others_total, 4);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: collection frees space that can be reused
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn collected_space_is_reusable() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    pool.set_root(pool.persist_undefined())?;

    // Fill-collect cycles: without reclamation the second pass would
    // exhaust the 1 MiB pool.
    for _round in 0..8 {
        for i in 0..1_000 {
            pool.persist_str(&format!("round-trip filler {i:05}"))?;
        }
        let report = pool.gc()?;
        assert_eq!(report.others_live, 0);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: collection across reopen
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn gc_after_reopen_sees_the_same_graph() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");
    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        let obj = pool.new_object(false)?;
        obj.set("v", pool.persist_str("value")?, SnapshotFlag::Snapshot)?;
        pool.set_root(obj.pptr())?;
        pool.persist_str("orphan")?;
        pool.close();
    }
    let pool = ObjectPool::open(&path, LAYOUT)?;
    let report = pool.gc()?;
    assert_eq!(report.containers_live, 3);
    assert_eq!(report.others_live, 2);
    assert_eq!(report.others_total, 3);

    let root = match pool.get_value(pool.get_root()?)? {
        PersistentValue::Object(p) => pool.object(p)?,
        other => panic!("unexpected root {other:?}"),
    };
    assert_eq!(
        pool.get_value(root.get("v")?)?,
        PersistentValue::String("value".into())
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: a dictionary-represented elements container traces its values
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn numdict_values_survive_collection() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let mut obj = pool.new_object(true)?;
    obj.set_at(0, pool.persist_str("dense")?, SnapshotFlag::Snapshot)?;
    obj.set_at(30_000, pool.persist_str("sparse")?, SnapshotFlag::Snapshot)?;
    assert!(!obj.elements().is_dense());
    pool.set_root(obj.pptr())?;

    let report = pool.gc()?;
    assert_eq!(report.others_live, 2);

    let obj = pool.object(obj.pptr())?;
    assert_eq!(
        pool.get_value(obj.get_at(30_000)?)?,
        PersistentValue::String("sparse".into())
    );
    assert_eq!(
        pool.get_value(obj.get_at(0)?)?,
        PersistentValue::String("dense".into())
    );
    Ok(())
}
