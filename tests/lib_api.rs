// Public API surface checks: everything a binding layer needs must be
// reachable from the crate root, and the re-exports must agree with their
// defining modules.

use pmstore::{
    Error, ObjectPool, PersistentValue, SnapshotFlag, TxStage, MIN_POOL_SIZE, PPTR_EMPTY,
    PPTR_NULL, PPTR_UNDEFINED,
};
use tempfile::tempdir;

#[test]
fn reexports_agree_with_module_paths() {
    // Compile-time identity between crate-root re-exports and their
    // defining modules.
    let p: pmstore::pptr::PPtr = pmstore::PPtr::from_f64(1.0);
    let _: pmstore::store::PersistentValue = PersistentValue::Number(p.as_f64());
    assert_eq!(PPTR_NULL, pmstore::pptr::PPTR_NULL);
    assert_eq!(MIN_POOL_SIZE, pmstore::pmem::MIN_POOL_SIZE);
}

#[test]
fn minimal_session_through_the_facade() {
    let dir = tempdir().unwrap();
    let pool = ObjectPool::create(
        dir.path().join("api.pool"),
        "lib-api",
        MIN_POOL_SIZE,
        0o600,
    )
    .unwrap();

    assert_eq!(pool.tx_stage(), TxStage::None);
    assert!(!pool.in_transaction());
    assert_eq!(pool.get_root().unwrap(), PPTR_UNDEFINED);

    let mut obj = pool.new_object(true).unwrap();
    obj.set("kind", pool.persist_str("demo").unwrap(), SnapshotFlag::Snapshot)
        .unwrap();
    obj.set_at(0, pool.persist_f64(3.25), SnapshotFlag::Snapshot)
        .unwrap();
    pool.set_root(obj.pptr()).unwrap();

    match pool.get_value(pool.get_root().unwrap()).unwrap() {
        PersistentValue::Object(p) => {
            let o = pool.object(p).unwrap();
            assert!(o.is_array().unwrap());
            assert_eq!(o.property_names().unwrap(), vec!["kind", "length", "0"]);
        }
        other => panic!("unexpected root {other:?}"),
    }

    // The miss sentinel is observable and classifies as KeyNotFound.
    assert_eq!(obj.get("nope").unwrap(), PPTR_EMPTY);
    assert!(matches!(pool.get_value(PPTR_EMPTY), Err(Error::KeyNotFound)));

    let report = pool.gc().unwrap();
    assert_eq!(report.containers_live, 3);
    pool.close();
}

#[test]
fn errors_render_and_chain() {
    let e = Error::PoolOpen("no such file".into());
    assert!(e.to_string().contains("no such file"));
    let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
    assert!(std::error::Error::source(&io).is_some());
}
