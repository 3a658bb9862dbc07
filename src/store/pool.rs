//! Object pool facade: lifecycle, the root slot, scalar persistence, value
//! classification, and collector/transaction forwarding.
//!
//! This is the crate boundary a host binding talks to. Values cross it as
//! tagged pointers; [`ObjectPool::get_value`] classifies a pointer into a
//! [`PersistentValue`] the host can unwrap, and the `persist_*` family maps
//! host scalars onto pointers.

use core::mem::size_of;

use log::debug;

use std::path::Path;

use crate::error::{Error, Result};
use crate::pmem::TxStage;
use crate::pptr::{
    PPtr, Singleton, PPTR_EMPTY_STRING, PPTR_FALSE, PPTR_JS_NULL, PPTR_TRUE, PPTR_UNDEFINED,
};

use super::buffer::ByteBuffer;
use super::gc::{collect, GcReport};
use super::memory::MemoryManager;
use super::object::PmObject;
use super::types::{RootRepr, TypeCode};

/// A classified persistent value, ready for the host boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistentValue {
    Number(f64),
    String(String),
    True,
    False,
    /// The host language's null (distinct from an uninitialized slot).
    Null,
    Undefined,
    EmptyString,
    /// A composite object; open it with [`ObjectPool::object`].
    Object(PPtr),
    /// A byte buffer; open it with [`ObjectPool::buffer`].
    ArrayBuffer(PPtr),
}

/// Handle to one attached pool.
pub struct ObjectPool {
    mm: MemoryManager,
}

impl ObjectPool {
    /// Static consistency verdict on a pool file.
    pub fn check(path: impl AsRef<Path>, layout: &str) -> Result<bool> {
        MemoryManager::check(path.as_ref(), layout)
    }

    /// Attach to an existing pool.
    pub fn open(path: impl AsRef<Path>, layout: &str) -> Result<ObjectPool> {
        Ok(ObjectPool { mm: MemoryManager::open(path.as_ref(), layout)? })
    }

    /// Create a pool of `size` bytes and initialise its root slot to
    /// `UNDEFINED`.
    pub fn create(
        path: impl AsRef<Path>,
        layout: &str,
        size: u64,
        mode: u32,
    ) -> Result<ObjectPool> {
        let pool = ObjectPool {
            mm: MemoryManager::create(path.as_ref(), layout, size, mode)?,
        };
        pool.set_root(PPTR_UNDEFINED)?;
        Ok(pool)
    }

    /// The memory manager, for container-level access.
    #[inline]
    pub fn memory(&self) -> &MemoryManager {
        &self.mm
    }

    /// Flush and detach.
    pub fn close(self) {
        self.mm.close();
    }

    /// Read the root object pointer.
    pub fn get_root(&self) -> Result<PPtr> {
        let root = self.mm.root(size_of::<RootRepr>() as u64)?;
        let repr = self.mm.addr(root)? as *const RootRepr;
        Ok(unsafe { (*repr).root_object })
    }

    /// Overwrite the root object pointer. Heap pointers must resolve to a
    /// live block in this pool.
    pub fn set_root(&self, value: PPtr) -> Result<()> {
        if !value.is_number() && !value.is_singleton() && self.mm.direct(value).is_none() {
            return Err(Error::InvalidArgument);
        }
        let root = self.mm.root(size_of::<RootRepr>() as u64)?;
        let repr = self.mm.addr(root)? as *mut RootRepr;
        let tx = self.mm.tx_scope()?;
        unsafe {
            self.mm.snapshot(repr as *const u8, size_of::<RootRepr>())?;
            (*repr).root_object = value;
        }
        tx.commit()?;
        debug!("root object set to {:?}", value);
        Ok(())
    }

    /// Classify a tagged pointer. The `EMPTY` lookup-miss sentinel becomes
    /// [`Error::KeyNotFound`] here; unknown singletons and dangling heap
    /// pointers are [`Error::InvalidArgument`].
    pub fn get_value(&self, p: PPtr) -> Result<PersistentValue> {
        if p.is_number() {
            return Ok(PersistentValue::Number(p.as_f64()));
        }
        if p.is_singleton() {
            return match p.singleton() {
                Some(Singleton::True) => Ok(PersistentValue::True),
                Some(Singleton::False) => Ok(PersistentValue::False),
                Some(Singleton::JsNull) => Ok(PersistentValue::Null),
                Some(Singleton::Undefined) => Ok(PersistentValue::Undefined),
                Some(Singleton::EmptyString) => Ok(PersistentValue::EmptyString),
                Some(Singleton::Empty) => Err(Error::KeyNotFound),
                _ => Err(Error::InvalidArgument),
            };
        }
        match self.mm.type_code(p)? {
            TypeCode::String => Ok(PersistentValue::String(self.mm.string_lossy(p)?)),
            TypeCode::ArrayBuffer => Ok(PersistentValue::ArrayBuffer(p)),
            TypeCode::Object => Ok(PersistentValue::Object(p)),
            _ => Err(Error::InvalidArgument),
        }
    }

    // ── Scalar persistence ───────────────────────────────────────────────────

    /// Numbers are inline; nothing is allocated.
    pub fn persist_f64(&self, value: f64) -> PPtr {
        PPtr::from_f64(value)
    }

    pub fn persist_bool(&self, value: bool) -> PPtr {
        if value {
            PPTR_TRUE
        } else {
            PPTR_FALSE
        }
    }

    pub fn persist_null(&self) -> PPtr {
        PPTR_JS_NULL
    }

    pub fn persist_undefined(&self) -> PPtr {
        PPTR_UNDEFINED
    }

    /// Persist a string; the empty string is a singleton and allocates
    /// nothing.
    pub fn persist_str(&self, value: &str) -> Result<PPtr> {
        if value.is_empty() {
            return Ok(PPTR_EMPTY_STRING);
        }
        self.mm.persist_string(value)
    }

    /// Persist a byte buffer.
    pub fn persist_bytes(&self, value: &[u8]) -> Result<PPtr> {
        Ok(ByteBuffer::create(&self.mm, value)?.pptr())
    }

    // ── Composite values ─────────────────────────────────────────────────────

    /// Create an empty composite object (array-flavoured or not).
    pub fn new_object(&self, is_array: bool) -> Result<PmObject<'_>> {
        PmObject::create(&self.mm, is_array)
    }

    /// Open an existing composite object.
    pub fn object(&self, p: PPtr) -> Result<PmObject<'_>> {
        PmObject::attach(&self.mm, p)
    }

    /// Open an existing byte buffer.
    pub fn buffer(&self, p: PPtr) -> Result<ByteBuffer<'_>> {
        ByteBuffer::attach(&self.mm, p)
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Run the reachability collector over the whole pool.
    pub fn gc(&self) -> Result<GcReport> {
        collect(&self.mm)
    }

    // ── Transactions ─────────────────────────────────────────────────────────

    #[inline]
    pub fn tx_begin(&self) -> Result<()> {
        self.mm.tx_begin()
    }

    #[inline]
    pub fn tx_commit(&self) -> Result<()> {
        self.mm.tx_commit()
    }

    #[inline]
    pub fn tx_abort(&self) -> Result<()> {
        self.mm.tx_abort()
    }

    #[inline]
    pub fn tx_end(&self) -> Result<()> {
        self.mm.tx_end()
    }

    #[inline]
    pub fn tx_stage(&self) -> TxStage {
        self.mm.tx_stage()
    }

    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.mm.in_transaction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::MIN_POOL_SIZE;
    use crate::pptr::PPTR_EMPTY;
    use crate::store::memory::SnapshotFlag;
    use tempfile::tempdir;

    fn fresh(dir: &tempfile::TempDir) -> ObjectPool {
        ObjectPool::create(&dir.path().join("t.pool"), "pool-tests", MIN_POOL_SIZE, 0o600)
            .unwrap()
    }

    #[test]
    fn fresh_pool_has_undefined_root() {
        let dir = tempdir().unwrap();
        let pool = fresh(&dir);
        assert_eq!(pool.get_root().unwrap(), PPTR_UNDEFINED);
    }

    #[test]
    fn scalar_classification_round_trips() {
        let dir = tempdir().unwrap();
        let pool = fresh(&dir);

        assert_eq!(
            pool.get_value(pool.persist_f64(2.5)).unwrap(),
            PersistentValue::Number(2.5)
        );
        assert_eq!(
            pool.get_value(pool.persist_bool(true)).unwrap(),
            PersistentValue::True
        );
        assert_eq!(
            pool.get_value(pool.persist_bool(false)).unwrap(),
            PersistentValue::False
        );
        assert_eq!(
            pool.get_value(pool.persist_null()).unwrap(),
            PersistentValue::Null
        );
        assert_eq!(
            pool.get_value(pool.persist_undefined()).unwrap(),
            PersistentValue::Undefined
        );
        assert_eq!(
            pool.get_value(pool.persist_str("").unwrap()).unwrap(),
            PersistentValue::EmptyString
        );
        assert_eq!(
            pool.get_value(pool.persist_str("hi").unwrap()).unwrap(),
            PersistentValue::String("hi".into())
        );
    }

    #[test]
    fn empty_sentinel_maps_to_key_not_found() {
        let dir = tempdir().unwrap();
        let pool = fresh(&dir);
        assert!(matches!(pool.get_value(PPTR_EMPTY), Err(Error::KeyNotFound)));
    }

    #[test]
    fn unknown_singleton_offset_is_invalid() {
        let dir = tempdir().unwrap();
        let pool = fresh(&dir);
        let bogus = PPtr { tag: crate::pptr::TAG_SINGLETON, off: 42 };
        assert!(matches!(pool.get_value(bogus), Err(Error::InvalidArgument)));
    }

    #[test]
    fn set_root_rejects_dangling_heap_pointers() {
        let dir = tempdir().unwrap();
        let pool = fresh(&dir);
        let bogus = PPtr { tag: 0xdead_beef_dead_beef, off: 8192 };
        assert!(matches!(pool.set_root(bogus), Err(Error::InvalidArgument)));
        pool.set_root(pool.persist_f64(1.0)).unwrap();
        assert_eq!(pool.get_root().unwrap(), pool.persist_f64(1.0));
    }

    #[test]
    fn object_round_trip_through_root() {
        let dir = tempdir().unwrap();
        let pool = fresh(&dir);
        let mut obj = pool.new_object(false).unwrap();
        obj.set("answer", pool.persist_f64(42.0), SnapshotFlag::Snapshot)
            .unwrap();
        pool.set_root(obj.pptr()).unwrap();

        match pool.get_value(pool.get_root().unwrap()).unwrap() {
            PersistentValue::Object(p) => {
                let obj = pool.object(p).unwrap();
                assert_eq!(obj.get("answer").unwrap(), pool.persist_f64(42.0));
            }
            other => panic!("expected an object, got {other:?}"),
        }
    }

    #[test]
    fn buffer_round_trip() {
        let dir = tempdir().unwrap();
        let pool = fresh(&dir);
        let p = pool.persist_bytes(&[1, 2, 3]).unwrap();
        match pool.get_value(p).unwrap() {
            PersistentValue::ArrayBuffer(b) => {
                assert_eq!(pool.buffer(b).unwrap().bytes().unwrap(), &[1, 2, 3]);
            }
            other => panic!("expected a buffer, got {other:?}"),
        }
    }
}
