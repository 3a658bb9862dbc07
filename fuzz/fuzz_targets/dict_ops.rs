#![no_main]
use std::collections::HashMap;

use libfuzzer_sys::fuzz_target;
use pmstore::{MemoryManager, PPtr, SnapshotFlag, StringDict, PPTR_EMPTY, MIN_POOL_SIZE};

// Random set/get/del sequences against the string dictionary, checked
// against a std HashMap model. Keys are drawn from a small alphabet so
// collisions, overwrites, and tombstone reuse all happen.
fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(_) => return,
    };
    let mm = match MemoryManager::create(
        &dir.path().join("fuzz.pool"),
        "dict-fuzz",
        MIN_POOL_SIZE,
        0o600,
    ) {
        Ok(mm) => mm,
        Err(_) => return,
    };
    let dict = StringDict::create(&mm).expect("create dict");
    let mut model: HashMap<String, PPtr> = HashMap::new();

    for chunk in data.chunks(3) {
        let op = chunk[0] % 3;
        let key = format!("k{}", chunk.get(1).copied().unwrap_or(0) % 32);
        match op {
            0 => {
                let value = PPtr::from_f64(chunk.get(2).copied().unwrap_or(0) as f64);
                dict.set(&key, value, SnapshotFlag::Snapshot).expect("set");
                model.insert(key, value);
            }
            1 => {
                dict.del(&key, SnapshotFlag::Snapshot).expect("del");
                model.remove(&key);
            }
            _ => {
                let got = dict.get(&key).expect("get");
                match model.get(&key) {
                    Some(v) => assert_eq!(got, *v, "mismatch for {key}"),
                    None => assert_eq!(got, PPTR_EMPTY, "ghost entry for {key}"),
                }
            }
        }
    }

    assert_eq!(dict.used().expect("used") as usize, model.len());
    for (key, value) in &model {
        assert_eq!(dict.get(key).expect("get"), *value);
    }
});
