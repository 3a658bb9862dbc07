//! E2E: crash recovery.
//!
//! A "crash" is simulated by leaking the pool handle mid-transaction: the
//! mapping stays dirty, the undo log stays active, and nothing commits.
//! Reopening the same file must roll the interrupted transaction back, so
//! `get_root` always observes either the last committed state or the
//! previous one, never a mix.

use anyhow::Result;
use pmstore::{ObjectPool, PersistentValue, SnapshotFlag, MIN_POOL_SIZE};
use tempfile::tempdir;

const LAYOUT: &str = "e2e-recovery";

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: uncommitted root swap rolls back on reopen
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn uncommitted_root_swap_is_rolled_back() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");

    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        let first = pool.persist_str("first")?;
        pool.set_root(first)?;

        // Open an outer transaction and never commit it; the nested scope
        // inside set_root flattens onto it.
        pool.tx_begin()?;
        let second = pool.persist_str("second")?;
        pool.set_root(second)?;
        assert_eq!(
            pool.get_value(pool.get_root()?)?,
            PersistentValue::String("second".into())
        );
        std::mem::forget(pool); // crash
    }

    let pool = ObjectPool::open(&path, LAYOUT)?;
    assert_eq!(
        pool.get_value(pool.get_root()?)?,
        PersistentValue::String("first".into())
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: committed state survives a later crash untouched
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn committed_state_survives_crash() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");

    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        let committed = pool.persist_str("committed")?;
        pool.set_root(committed)?;
        std::mem::forget(pool); // crash with an idle log
    }

    let pool = ObjectPool::open(&path, LAYOUT)?;
    assert_eq!(
        pool.get_value(pool.get_root()?)?,
        PersistentValue::String("committed".into())
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: uncommitted property writes on a composite roll back
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn uncommitted_property_writes_roll_back() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");
    let obj_pptr;

    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        let obj = pool.new_object(false)?;
        obj.set("k", pool.persist_f64(1.0), SnapshotFlag::Snapshot)?;
        pool.set_root(obj.pptr())?;
        obj_pptr = obj.pptr();

        pool.tx_begin()?;
        obj.set("k", pool.persist_f64(2.0), SnapshotFlag::Snapshot)?;
        obj.set("extra", pool.persist_bool(true), SnapshotFlag::Snapshot)?;
        assert_eq!(pool.get_value(obj.get("k")?)?, PersistentValue::Number(2.0));
        std::mem::forget(pool); // crash
    }

    let pool = ObjectPool::open(&path, LAYOUT)?;
    let obj = pool.object(obj_pptr)?;
    assert_eq!(pool.get_value(obj.get("k")?)?, PersistentValue::Number(1.0));
    assert!(matches!(
        pool.get_value(obj.get("extra")?),
        Err(pmstore::Error::KeyNotFound)
    ));
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: allocations of an interrupted transaction are reclaimed
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn interrupted_allocations_are_reclaimed() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");

    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        pool.tx_begin()?;
        for i in 0..50 {
            pool.persist_str(&format!("leak-{i}"))?;
        }
        std::mem::forget(pool); // crash
    }

    // After recovery nothing of the aborted transaction remains, so the
    // collector census sees an empty heap.
    let pool = ObjectPool::open(&path, LAYOUT)?;
    let report = pool.gc()?;
    assert_eq!(report.containers_total, 0);
    assert_eq!(report.others_total, 0);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: explicit abort behaves like recovery, without the reopen
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn explicit_abort_restores_previous_state() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let keep = pool.persist_str("keep")?;
    pool.set_root(keep)?;

    pool.tx_begin()?;
    let replace = pool.persist_str("replace")?;
    pool.set_root(replace)?;
    pool.tx_abort()?;
    pool.tx_end()?;

    assert_eq!(
        pool.get_value(pool.get_root()?)?,
        PersistentValue::String("keep".into())
    );
    Ok(())
}
