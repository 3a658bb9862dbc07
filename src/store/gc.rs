//! Offline mark-and-sweep reachability collector.
//!
//! Runs in three phases over the whole pool, assuming no live mutator:
//!
//! 1. **Census** — walk every live block via the allocator's linear
//!    iterator. Headed object blocks are split into `containers`
//!    (traceable) and `other` (scalars, buffers); raw blocks (items
//!    arrays, keys tables) are only tallied, they are reached through
//!    their owners and freed by their owners' destructors.
//! 2. **Mark** — trace from the root object, removing every reached block
//!    from the census sets. Removal doubles as the visited check, so
//!    cycles cannot re-enqueue a block.
//! 3. **Sweep** — deallocate every container still in the census (the
//!    type-specific destructor frees its raw sub-blocks), then free the
//!    remaining `other` blocks. One transaction per phase.

use core::mem::size_of;
use std::collections::BTreeSet;

use log::debug;

use crate::error::{Error, Result};
use crate::pptr::PPtr;

use super::array::{NumDict, SimpleArray};
use super::dict::StringDict;
use super::memory::MemoryManager;
use super::object::PmObject;
use super::types::{CompositeRepr, RootRepr, TypeCode, TN_OBJECT};

/// Census and survival counts of one collector run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Container blocks found by the census.
    pub containers_total: usize,
    /// Scalar/buffer blocks found by the census.
    pub others_total: usize,
    /// Containers reached from the root.
    pub containers_live: usize,
    /// Scalars/buffers reached from the root (or serving as the root).
    pub others_live: usize,
    /// Header-less blocks (items arrays, keys tables); never swept here.
    pub raw_blocks: usize,
}

/// Collect garbage: everything unreachable from the root object is freed.
pub(super) fn collect(mm: &MemoryManager) -> Result<GcReport> {
    let pool = mm.pool();
    let mut containers: BTreeSet<PPtr> = BTreeSet::new();
    let mut other: BTreeSet<PPtr> = BTreeSet::new();
    let mut raw_blocks = 0usize;

    // Phase 1: census.
    let mut cur = pool.first();
    while let Some(p) = cur {
        if pool.type_num(p)? == TN_OBJECT {
            let code = mm.type_code(p)?;
            if code.is_container() {
                containers.insert(p);
            } else {
                other.insert(p);
            }
        } else {
            raw_blocks += 1;
        }
        cur = pool.next(p);
    }
    let containers_total = containers.len();
    let others_total = other.len();

    // Phase 2: mark from the root object.
    let root = mm.root(size_of::<RootRepr>() as u64)?;
    let root_obj = unsafe { (*(mm.addr(root)? as *const RootRepr)).root_object };
    let mut live: Vec<PPtr> = Vec::new();
    if root_obj.is_heap() {
        let code = mm.type_code(root_obj)?;
        if code == TypeCode::Object {
            if containers.remove(&root_obj) {
                live.push(root_obj);
            }
        } else if code.is_container() {
            return Err(Error::Corrupt(
                "root object is a bare container block".into(),
            ));
        } else {
            other.remove(&root_obj);
        }
    }

    let mut next = 0usize;
    while next < live.len() {
        let p = live[next];
        next += 1;
        match mm.type_code(p)? {
            TypeCode::Object => {
                let repr = mm.addr(p)? as *const CompositeRepr;
                let (elements, extra) = unsafe { ((*repr).elements, (*repr).extra_props) };
                if containers.remove(&elements) {
                    live.push(elements);
                }
                if containers.remove(&extra) {
                    live.push(extra);
                }
            }
            TypeCode::Array => {
                let arr = SimpleArray::attach(mm, p);
                if let Some(items) = arr.items()? {
                    let n = arr.allocated()?;
                    for i in 0..n {
                        let v = unsafe { *items.add(i as usize) };
                        if containers.remove(&v) {
                            live.push(v);
                        } else {
                            other.remove(&v);
                        }
                    }
                }
            }
            TypeCode::Dict => {
                let dict = StringDict::attach(mm, p);
                for (key, value) in dict.slots()? {
                    other.remove(&key);
                    if containers.remove(&value) {
                        live.push(value);
                    } else {
                        other.remove(&value);
                    }
                }
            }
            TypeCode::NumDict => {
                let dict = NumDict::attach(mm, p);
                for value in dict.full_values()? {
                    if containers.remove(&value) {
                        live.push(value);
                    } else {
                        other.remove(&value);
                    }
                }
            }
            code => {
                return Err(Error::Corrupt(format!(
                    "non-container {code:?} on the trace queue"
                )))
            }
        }
    }
    let containers_live = live.len();
    let others_live = others_total - other.len();

    debug!(
        "gc: {} of {} containers live, {} of {} others live, {} raw blocks",
        containers_live, containers_total, others_live, others_total, raw_blocks
    );

    // Phase 3: sweep. Destructors free the owned raw sub-blocks.
    let tx = mm.tx_scope()?;
    for &p in &containers {
        match mm.type_code(p)? {
            TypeCode::Object => PmObject::attach(mm, p)?.deallocate()?,
            TypeCode::Array => SimpleArray::attach(mm, p).deallocate()?,
            TypeCode::Dict => StringDict::attach(mm, p).deallocate()?,
            TypeCode::NumDict => NumDict::attach(mm, p).deallocate()?,
            _ => {}
        }
    }
    tx.commit()?;

    let tx = mm.tx_scope()?;
    for &p in &other {
        mm.free(p)?;
    }
    tx.commit()?;

    Ok(GcReport {
        containers_total,
        others_total,
        containers_live,
        others_live,
        raw_blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::MIN_POOL_SIZE;
    use crate::pptr::{PPtr, PPTR_UNDEFINED};
    use crate::store::memory::SnapshotFlag;
    use tempfile::tempdir;

    fn fresh(dir: &tempfile::TempDir) -> MemoryManager {
        MemoryManager::create(&dir.path().join("t.pool"), "gc-tests", MIN_POOL_SIZE, 0o600)
            .unwrap()
    }

    fn set_root(mm: &MemoryManager, value: PPtr) {
        let root = mm.root(size_of::<RootRepr>() as u64).unwrap();
        let repr = mm.addr(root).unwrap() as *mut RootRepr;
        let tx = mm.tx_scope().unwrap();
        unsafe {
            mm.snapshot(repr as *const u8, size_of::<RootRepr>()).unwrap();
            (*repr).root_object = value;
        }
        tx.commit().unwrap();
    }

    #[test]
    fn orphaned_strings_are_swept() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        set_root(&mm, PPTR_UNDEFINED);
        for i in 0..10 {
            mm.persist_string(&format!("orphan-{i}")).unwrap();
        }
        let report = collect(&mm).unwrap();
        assert_eq!(report.others_total, 10);
        assert_eq!(report.others_live, 0);
        let report = collect(&mm).unwrap();
        assert_eq!(report.others_total, 0);
    }

    #[test]
    fn rooted_object_graph_survives() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let mut obj = PmObject::create(&mm, false).unwrap();
        let name = mm.persist_string("kept").unwrap();
        obj.set("name", name, SnapshotFlag::Snapshot).unwrap();
        obj.set_at(0, PPtr::from_f64(1.0), SnapshotFlag::Snapshot).unwrap();
        set_root(&mm, obj.pptr());

        // An unreachable sibling object plus a loose string.
        let _doomed = PmObject::create(&mm, true).unwrap();
        mm.persist_string("loose").unwrap();

        let report = collect(&mm).unwrap();
        // Live: the composite, its elements array, its extra-props dict.
        assert_eq!(report.containers_live, 3);
        assert_eq!(report.containers_total, 6);
        // Live others: the value string plus the dict's key string.
        assert_eq!(report.others_live, 2);

        // The survivor is intact.
        let obj = PmObject::attach(&mm, obj.pptr()).unwrap();
        assert_eq!(mm.string_lossy(obj.get("name").unwrap()).unwrap(), "kept");
        assert_eq!(obj.get_at(0).unwrap(), PPtr::from_f64(1.0));

        // A second run finds exactly the live blocks and frees nothing.
        let report2 = collect(&mm).unwrap();
        assert_eq!(report2.containers_total, 3);
        assert_eq!(report2.containers_live, 3);
        assert_eq!(report2.others_total, 2);
        assert_eq!(report2.others_live, 2);
    }

    #[test]
    fn string_root_survives_collection() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let s = mm.persist_string("root string").unwrap();
        set_root(&mm, s);
        let report = collect(&mm).unwrap();
        assert_eq!(report.others_total, 1);
        assert_eq!(mm.string_lossy(s).unwrap(), "root string");
    }

    #[test]
    fn cycles_do_not_hang_the_mark_phase() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let a = PmObject::create(&mm, false).unwrap();
        let b = PmObject::create(&mm, false).unwrap();
        a.set("peer", b.pptr(), SnapshotFlag::Snapshot).unwrap();
        b.set("peer", a.pptr(), SnapshotFlag::Snapshot).unwrap();
        set_root(&mm, a.pptr());

        let report = collect(&mm).unwrap();
        // Both composites and their four children survive.
        assert_eq!(report.containers_live, 6);
        assert!(PmObject::attach(&mm, b.pptr()).is_ok());
    }

    #[test]
    fn nested_containers_survive_through_values() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let outer = PmObject::create(&mm, false).unwrap();
        let mut inner = PmObject::create(&mm, true).unwrap();
        inner
            .set_at(0, PPtr::from_f64(7.0), SnapshotFlag::Snapshot)
            .unwrap();
        outer.set("inner", inner.pptr(), SnapshotFlag::Snapshot).unwrap();
        set_root(&mm, outer.pptr());

        let report = collect(&mm).unwrap();
        assert_eq!(report.containers_live, 6);
        let inner = PmObject::attach(&mm, inner.pptr()).unwrap();
        assert_eq!(inner.get_at(0).unwrap(), PPtr::from_f64(7.0));
    }
}
