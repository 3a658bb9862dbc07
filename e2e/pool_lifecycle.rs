//! E2E: pool lifecycle.
//!
//! Create / close / reopen cycles, the static consistency check, layout
//! validation, and scalar roots surviving reopen.

use anyhow::Result;
use pmstore::{ObjectPool, PersistentValue, MIN_POOL_SIZE};
use tempfile::tempdir;

const LAYOUT: &str = "e2e-lifecycle";

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: string root survives close + reopen
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn string_root_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");

    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        let s = pool.persist_str("hello")?;
        pool.set_root(s)?;
        pool.close();
    }

    let pool = ObjectPool::open(&path, LAYOUT)?;
    let root = pool.get_root()?;
    assert_eq!(
        pool.get_value(root)?,
        PersistentValue::String("hello".into())
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: every scalar kind round-trips through the root slot
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn scalar_roots_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");
    let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;

    let cases: Vec<(pmstore::PPtr, PersistentValue)> = vec![
        (pool.persist_f64(-12.75), PersistentValue::Number(-12.75)),
        (pool.persist_bool(true), PersistentValue::True),
        (pool.persist_bool(false), PersistentValue::False),
        (pool.persist_null(), PersistentValue::Null),
        (pool.persist_undefined(), PersistentValue::Undefined),
        (pool.persist_str("")?, PersistentValue::EmptyString),
        (
            pool.persist_str("snowman \u{2603}")?,
            PersistentValue::String("snowman \u{2603}".into()),
        ),
    ];
    for (ptr, expected) in cases {
        pool.set_root(ptr)?;
        assert_eq!(pool.get_value(pool.get_root()?)?, expected);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: fresh pool starts with an undefined root
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn fresh_pool_root_is_undefined() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    assert_eq!(pool.get_value(pool.get_root()?)?, PersistentValue::Undefined);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: check() verdicts
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn check_accepts_matching_layout_only() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");
    {
        let _pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
    }
    assert!(ObjectPool::check(&path, LAYOUT)?);
    assert!(!ObjectPool::check(&path, "some-other-layout")?);
    assert!(ObjectPool::check(dir.path().join("missing.pm"), LAYOUT).is_err());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: open failures
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn open_rejects_wrong_layout_missing_file_and_garbage() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");
    {
        let _pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
    }
    assert!(ObjectPool::open(&path, "wrong").is_err());
    assert!(ObjectPool::open(dir.path().join("missing.pm"), LAYOUT).is_err());

    // A file full of zeros is not a pool.
    let garbage = dir.path().join("garbage.pm");
    std::fs::write(&garbage, vec![0u8; MIN_POOL_SIZE as usize])?;
    assert!(ObjectPool::open(&garbage, LAYOUT).is_err());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: creating over an existing file fails, pool identity is stable
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn create_refuses_existing_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pool.pm");
    let first;
    {
        let pool = ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600)?;
        let s = pool.persist_str("anchor")?;
        pool.set_root(s)?;
        first = pool.get_root()?;
    }
    assert!(ObjectPool::create(&path, LAYOUT, MIN_POOL_SIZE, 0o600).is_err());

    // The failed create left the original pool untouched.
    let pool = ObjectPool::open(&path, LAYOUT)?;
    assert_eq!(pool.get_root()?, first);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 7: repeated get_root is idempotent
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn get_root_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let pool = ObjectPool::create(dir.path().join("pool.pm"), LAYOUT, MIN_POOL_SIZE, 0o600)?;
    let s = pool.persist_str("same")?;
    pool.set_root(s)?;
    let a = pool.get_root()?;
    let b = pool.get_root()?;
    assert_eq!(a, b);
    Ok(())
}
