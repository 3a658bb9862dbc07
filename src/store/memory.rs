//! Memory manager: the typed face of the primitive pool layer.
//!
//! Wraps a [`RawPool`] with the operations the containers speak in: typed
//! allocation, string persistence, type-code reads, and scope-based
//! transactions. The convention for every mutation in the crate is
//!
//! 1. open a scope ([`MemoryManager::tx_scope`]),
//! 2. snapshot each byte range about to be written,
//! 3. write,
//! 4. commit on the success path; dropping the scope on an error path
//!    aborts.
//!
//! Writes made outside a transaction may take a shortcut: when an overwrite
//! preserves the pointer tag, only the offset word is updated in place and
//! persisted. A torn offset word under a still-valid tag is
//! indistinguishable from a valid pointer to a block that is still traced,
//! so the shortcut cannot corrupt the graph. Any tag change goes through a
//! transaction.

use std::ffi::CStr;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::pmem::{RawPool, TxStage};
use crate::pptr::PPtr;

use super::types::{ObjectHead, StringHead, TypeCode, TN_OBJECT};

/// Whether a mutation must snapshot the ranges it writes. Callers that
/// batch many writes under one enclosing transaction and snapshot coarsely
/// themselves pass [`SnapshotFlag::NoSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFlag {
    NoSnapshot,
    Snapshot,
}

/// Typed memory manager bound to one pool.
pub struct MemoryManager {
    pool: RawPool,
}

impl MemoryManager {
    /// Attach to an existing pool file.
    pub fn open(path: &Path, layout: &str) -> Result<MemoryManager> {
        Ok(MemoryManager { pool: RawPool::open(path, layout)? })
    }

    /// Create a pool file and attach to it.
    pub fn create(path: &Path, layout: &str, size: u64, mode: u32) -> Result<MemoryManager> {
        Ok(MemoryManager { pool: RawPool::create(path, layout, size, mode)? })
    }

    /// Static consistency verdict on a pool file.
    pub fn check(path: &Path, layout: &str) -> Result<bool> {
        RawPool::check(path, layout)
    }

    /// The underlying primitive pool.
    #[inline]
    pub fn pool(&self) -> &RawPool {
        &self.pool
    }

    /// Flush and detach.
    pub fn close(self) {
        self.pool.close();
    }

    /// The pool root pointer, allocating the root block on first call.
    pub fn root(&self, size: u64) -> Result<PPtr> {
        self.pool.root(size)
    }

    /// Resolve a heap pointer, or `None` for immediates and foreign tags.
    #[inline]
    pub fn direct(&self, p: PPtr) -> Option<*mut u8> {
        self.pool.direct(p)
    }

    /// Resolve a heap pointer that is required to be live in this pool.
    #[inline]
    pub fn addr(&self, p: PPtr) -> Result<*mut u8> {
        self.pool.direct(p).ok_or(Error::InvalidArgument)
    }

    /// Reverse translation from an in-pool address.
    ///
    /// # Safety
    /// `addr` must point inside this pool's mapping.
    #[inline]
    pub unsafe fn ptr_of(&self, addr: *const u8) -> PPtr {
        self.pool.ptr_of(addr)
    }

    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.pool.in_transaction()
    }

    /// Register a byte range for rollback logging.
    ///
    /// # Safety
    /// `addr..addr+len` must lie inside this pool's mapping.
    #[inline]
    pub unsafe fn snapshot(&self, addr: *const u8, len: usize) -> Result<()> {
        self.pool.snapshot(addr, len)
    }

    /// Flush a byte range to durable media.
    #[inline]
    pub fn persist(&self, addr: *const u8, len: usize) -> Result<()> {
        self.pool.persist(addr, len)
    }

    #[inline]
    pub fn tx_zalloc(&self, size: u64, type_num: u64) -> Result<PPtr> {
        self.pool.tx_zalloc(size, type_num)
    }

    #[inline]
    pub fn tx_zrealloc(&self, p: PPtr, size: u64, type_num: u64) -> Result<PPtr> {
        self.pool.tx_zrealloc(p, size, type_num)
    }

    #[inline]
    pub fn zalloc(&self, size: u64, type_num: u64) -> Result<PPtr> {
        self.pool.zalloc(size, type_num)
    }

    /// Transactional free; tolerates null and already-freed blocks.
    pub fn free(&self, p: PPtr) -> Result<()> {
        debug!("free: {:?}", p);
        self.pool.tx_free(p)
    }

    /// Read the in-head type code of an object block.
    pub fn type_code(&self, p: PPtr) -> Result<TypeCode> {
        let addr = self.addr(p)?;
        let raw = unsafe { (*(addr as *const ObjectHead)).type_code };
        TypeCode::from_u64(raw)
            .ok_or_else(|| Error::Corrupt(format!("type code {raw} out of range")))
    }

    /// Allocate a string object and copy `s` into it, honouring the current
    /// transaction state. The payload starts right after the head on both
    /// paths.
    pub fn persist_string(&self, s: &str) -> Result<PPtr> {
        let head = core::mem::size_of::<StringHead>();
        let total = (head + s.len() + 1) as u64;
        let in_tx = self.in_transaction();
        let p = if in_tx {
            self.tx_zalloc(total, TN_OBJECT)?
        } else {
            self.zalloc(total, TN_OBJECT)?
        };
        let addr = self.addr(p)?;
        unsafe {
            (*(addr as *mut StringHead)).base.type_code = TypeCode::String as u64;
            core::ptr::copy_nonoverlapping(s.as_ptr(), addr.add(head), s.len());
            // zalloc already left the terminating NUL.
        }
        if !in_tx {
            self.persist(addr, total as usize)?;
        }
        Ok(p)
    }

    /// Borrow the bytes of a persisted string object (without the NUL).
    pub fn string_bytes(&self, p: PPtr) -> Result<&[u8]> {
        if self.type_code(p)? != TypeCode::String {
            return Err(Error::InvalidArgument);
        }
        let addr = self.addr(p)?;
        let head = core::mem::size_of::<StringHead>();
        let c = unsafe { CStr::from_ptr(addr.add(head) as *const libc::c_char) };
        Ok(c.to_bytes())
    }

    /// Owned, lossily-decoded copy of a persisted string object.
    pub fn string_lossy(&self, p: PPtr) -> Result<String> {
        Ok(String::from_utf8_lossy(self.string_bytes(p)?).into_owned())
    }

    // ── Transactions ─────────────────────────────────────────────────────────

    #[inline]
    pub fn tx_begin(&self) -> Result<()> {
        self.pool.tx_begin()
    }

    #[inline]
    pub fn tx_commit(&self) -> Result<()> {
        self.pool.tx_commit()
    }

    #[inline]
    pub fn tx_abort(&self) -> Result<()> {
        self.pool.tx_abort()
    }

    #[inline]
    pub fn tx_end(&self) -> Result<()> {
        self.pool.tx_end()
    }

    #[inline]
    pub fn tx_stage(&self) -> TxStage {
        self.pool.tx_stage()
    }

    /// Open a transaction scope that commits on [`TxScope::commit`] and
    /// aborts when dropped on an error path. Nests trivially: inner scopes
    /// flatten onto the outermost transaction.
    pub fn tx_scope(&self) -> Result<TxScope<'_>> {
        self.pool.tx_begin()?;
        Ok(TxScope { mm: self, done: false })
    }
}

/// Scope guard for one transaction frame.
pub struct TxScope<'a> {
    mm: &'a MemoryManager,
    done: bool,
}

impl TxScope<'_> {
    /// Commit the frame (outermost frames durably, inner frames flatten)
    /// and close it.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        let commit_res = if self.mm.tx_stage() == TxStage::Work {
            self.mm.tx_commit()
        } else {
            Ok(())
        };
        let end_res = self.mm.tx_end();
        commit_res.and(end_res)
    }
}

impl Drop for TxScope<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.mm.tx_stage() == TxStage::Work {
            let _ = self.mm.tx_abort();
        }
        let _ = self.mm.tx_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::MIN_POOL_SIZE;
    use crate::pptr::PPTR_TRUE;
    use tempfile::tempdir;

    fn fresh(dir: &tempfile::TempDir) -> MemoryManager {
        MemoryManager::create(&dir.path().join("t.pool"), "mm-tests", MIN_POOL_SIZE, 0o600)
            .unwrap()
    }

    #[test]
    fn persist_string_round_trips_in_and_out_of_tx() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);

        let outside = mm.persist_string("outside").unwrap();
        assert_eq!(mm.string_bytes(outside).unwrap(), b"outside");

        let tx = mm.tx_scope().unwrap();
        let inside = mm.persist_string("inside").unwrap();
        tx.commit().unwrap();
        assert_eq!(mm.string_lossy(inside).unwrap(), "inside");
        assert_eq!(mm.type_code(inside).unwrap(), TypeCode::String);
    }

    #[test]
    fn aborted_scope_rolls_string_allocation_back() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let p;
        {
            let _tx = mm.tx_scope().unwrap();
            p = mm.persist_string("doomed").unwrap();
            // dropped without commit
        }
        assert!(mm.string_bytes(p).is_err());
        assert_eq!(mm.tx_stage(), TxStage::None);
    }

    #[test]
    fn addr_rejects_immediates() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        assert!(matches!(mm.addr(PPTR_TRUE), Err(Error::InvalidArgument)));
        assert!(matches!(
            mm.addr(PPtr::from_f64(4.2)),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn nested_scopes_flatten() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let outer = mm.tx_scope().unwrap();
        {
            let inner = mm.tx_scope().unwrap();
            inner.commit().unwrap();
        }
        assert!(mm.in_transaction());
        outer.commit().unwrap();
        assert_eq!(mm.tx_stage(), TxStage::None);
    }
}
