//! E2E: composite objects.
//!
//! Builds `{a: 1, b: [10, 20, 30]}`, persists it as the root, reopens the
//! pool, and navigates the graph back out. Also covers property-name
//! introspection and the rewrite-identity law.

use anyhow::Result;
use pmstore::{ObjectPool, PersistentValue, SnapshotFlag, MIN_POOL_SIZE};
use tempfile::tempdir;

const LAYOUT: &str = "e2e-composite";

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: nested object graph survives reopen
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn nested_graph_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");

    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        let obj = pool.new_object(false)?;
        obj.set("a", pool.persist_f64(1.0), SnapshotFlag::Snapshot)?;

        let mut arr = pool.new_object(true)?;
        for (i, v) in [10.0, 20.0, 30.0].iter().enumerate() {
            arr.set_at(i as u32, pool.persist_f64(*v), SnapshotFlag::Snapshot)?;
        }
        obj.set("b", arr.pptr(), SnapshotFlag::Snapshot)?;
        pool.set_root(obj.pptr())?;
        pool.close();
    }

    let pool = ObjectPool::open(&path, LAYOUT)?;
    let root = match pool.get_value(pool.get_root()?)? {
        PersistentValue::Object(p) => pool.object(p)?,
        other => panic!("root should be an object, got {other:?}"),
    };
    assert_eq!(
        pool.get_value(root.get("a")?)?,
        PersistentValue::Number(1.0)
    );

    let b = match pool.get_value(root.get("b")?)? {
        PersistentValue::Object(p) => pool.object(p)?,
        other => panic!("b should be an object, got {other:?}"),
    };
    assert!(b.is_array()?);
    assert_eq!(b.len()?, 3);
    assert_eq!(pool.get_value(b.get_at(1)?)?, PersistentValue::Number(20.0));

    let mut names = root.property_names()?;
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: missing keys classify as KeyNotFound at the value boundary
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn missing_key_is_key_not_found() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let obj = pool.new_object(false)?;
    obj.set("present", pool.persist_bool(true), SnapshotFlag::Snapshot)?;

    assert!(matches!(
        pool.get_value(obj.get("absent")?),
        Err(pmstore::Error::KeyNotFound)
    ));
    // A key holding undefined is present, not missing.
    obj.set("undef", pool.persist_undefined(), SnapshotFlag::Snapshot)?;
    assert_eq!(pool.get_value(obj.get("undef")?)?, PersistentValue::Undefined);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: rewriting every property with its own value is value-identity
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn rewrite_with_own_values_is_identity() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let obj = pool.new_object(false)?;
    obj.set("x", pool.persist_f64(1.5), SnapshotFlag::Snapshot)?;
    obj.set("y", pool.persist_str("why")?, SnapshotFlag::Snapshot)?;
    obj.set("z", pool.persist_null(), SnapshotFlag::Snapshot)?;

    let before: Vec<(String, PersistentValue)> = {
        let mut names = obj.property_names()?;
        names.sort();
        names
            .into_iter()
            .map(|k| {
                let v = pool.get_value(obj.get(&k).unwrap()).unwrap();
                (k, v)
            })
            .collect()
    };

    for (k, _) in &before {
        let v = obj.get(k)?;
        obj.set(k, v, SnapshotFlag::Snapshot)?;
    }

    let after: Vec<(String, PersistentValue)> = {
        let mut names = obj.property_names()?;
        names.sort();
        names
            .into_iter()
            .map(|k| {
                let v = pool.get_value(obj.get(&k).unwrap()).unwrap();
                (k, v)
            })
            .collect()
    };
    assert_eq!(before, after);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: delete / reinsert cycle on string keys
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn delete_then_reinsert_string_key() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let obj = pool.new_object(false)?;

    obj.set("k", pool.persist_f64(1.0), SnapshotFlag::Snapshot)?;
    obj.del("k", SnapshotFlag::Snapshot)?;
    assert!(matches!(
        pool.get_value(obj.get("k")?),
        Err(pmstore::Error::KeyNotFound)
    ));
    obj.set("k", pool.persist_f64(2.0), SnapshotFlag::Snapshot)?;
    assert_eq!(pool.get_value(obj.get("k")?)?, PersistentValue::Number(2.0));
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: byte buffers as object properties
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn buffer_property_round_trips() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");
    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        let obj = pool.new_object(false)?;
        let buf = pool.persist_bytes(&[0xde, 0xad, 0xbe, 0xef])?;
        obj.set("blob", buf, SnapshotFlag::Snapshot)?;
        pool.set_root(obj.pptr())?;
        pool.close();
    }
    let pool = ObjectPool::open(&path, LAYOUT)?;
    let root = match pool.get_value(pool.get_root()?)? {
        PersistentValue::Object(p) => pool.object(p)?,
        other => panic!("unexpected root {other:?}"),
    };
    match pool.get_value(root.get("blob")?)? {
        PersistentValue::ArrayBuffer(b) => {
            assert_eq!(pool.buffer(b)?.bytes()?, &[0xde, 0xad, 0xbe, 0xef]);
        }
        other => panic!("expected buffer, got {other:?}"),
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: many string keys force keys-table growth and stay navigable
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn many_keys_grow_the_dictionary() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");
    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        let obj = pool.new_object(false)?;
        for i in 0..200 {
            obj.set(
                &format!("key-{i:03}"),
                pool.persist_f64(i as f64),
                SnapshotFlag::Snapshot,
            )?;
        }
        pool.set_root(obj.pptr())?;
        pool.close();
    }
    let pool = ObjectPool::open(&path, LAYOUT)?;
    let root = match pool.get_value(pool.get_root()?)? {
        PersistentValue::Object(p) => pool.object(p)?,
        other => panic!("unexpected root {other:?}"),
    };
    for i in (0..200).step_by(7) {
        assert_eq!(
            pool.get_value(root.get(&format!("key-{i:03}"))?)?,
            PersistentValue::Number(i as f64)
        );
    }
    assert_eq!(root.property_names()?.len(), 200);
    Ok(())
}
