#![no_main]
use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;
use pmstore::{
    MemoryManager, PPtr, PmObject, SnapshotFlag, MIN_POOL_SIZE, PPTR_NULL, PPTR_UNDEFINED,
};

// Random indexed writes/deletes on a composite object, checked against a
// BTreeMap model. Index 3 of every op byte pair selects between a dense
// band and a sparse band so representation promotion and demotion both
// fire along the way.
fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(_) => return,
    };
    let mm = match MemoryManager::create(
        &dir.path().join("fuzz.pool"),
        "elements-fuzz",
        4 * MIN_POOL_SIZE,
        0o600,
    ) {
        Ok(mm) => mm,
        Err(_) => return,
    };
    let mut obj = PmObject::create(&mm, true).expect("create object");
    let mut model: BTreeMap<u32, PPtr> = BTreeMap::new();
    let mut length = 0u32;

    for chunk in data.chunks(3) {
        let op = chunk[0] % 4;
        let raw = chunk.get(1).copied().unwrap_or(0) as u32;
        let index = if op == 3 { 2_000 + raw * 37 } else { raw % 64 };
        match op {
            0 | 3 => {
                let value = PPtr::from_f64(chunk.get(2).copied().unwrap_or(0) as f64);
                obj.set_at(index, value, SnapshotFlag::Snapshot).expect("set");
                model.insert(index, value);
                length = length.max(index + 1);
            }
            1 => {
                obj.del_at(index, SnapshotFlag::Snapshot).expect("del");
                if index < length {
                    model.insert(index, PPTR_UNDEFINED);
                }
            }
            _ => {
                let got = obj.get_at(index).expect("get");
                check(index, got, model.get(&index));
            }
        }
    }

    assert_eq!(obj.len().expect("len"), length);
    for (index, value) in &model {
        check(*index, obj.get_at(*index).expect("get"), Some(value));
    }
});

// A deleted or never-written slot reads as UNDEFINED in the dictionary
// representation and as the null pointer in the dense one; both are
// "absent" to the model.
fn check(index: u32, got: PPtr, expected: Option<&PPtr>) {
    match expected {
        Some(v) if *v != PPTR_UNDEFINED => assert_eq!(got, *v, "mismatch at {index}"),
        _ => assert!(
            got == PPTR_UNDEFINED || got == PPTR_NULL,
            "ghost entry at {index}: {got:?}"
        ),
    }
}
