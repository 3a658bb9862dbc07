//! Persistent byte buffers: a type-coded block holding a length and inline
//! bytes. The store treats the contents as opaque; callers mutate in place
//! through [`ByteBuffer::snapshot`] + direct writes, or rely on
//! [`ByteBuffer::persist`] for non-transactional flushes.

use core::mem::size_of;

use crate::error::{Error, Result};
use crate::pptr::PPtr;

use super::memory::MemoryManager;
use super::types::{BufferHead, TypeCode, TN_OBJECT};

/// View over a pool-resident byte buffer.
pub struct ByteBuffer<'p> {
    mm: &'p MemoryManager,
    pptr: PPtr,
}

impl<'p> ByteBuffer<'p> {
    /// Allocate a buffer holding a copy of `data`, honouring the current
    /// transaction state.
    pub fn create(mm: &'p MemoryManager, data: &[u8]) -> Result<ByteBuffer<'p>> {
        if data.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument);
        }
        let head = size_of::<BufferHead>();
        let total = (head + data.len()) as u64;
        let in_tx = mm.in_transaction();
        let pptr = if in_tx {
            mm.tx_zalloc(total, TN_OBJECT)?
        } else {
            mm.zalloc(total, TN_OBJECT)?
        };
        let addr = mm.addr(pptr)?;
        unsafe {
            let hdr = addr as *mut BufferHead;
            (*hdr).base.type_code = TypeCode::ArrayBuffer as u64;
            (*hdr).len = data.len() as u32;
            core::ptr::copy_nonoverlapping(data.as_ptr(), addr.add(head), data.len());
        }
        if !in_tx {
            mm.persist(addr, total as usize)?;
        }
        Ok(ByteBuffer { mm, pptr })
    }

    /// View an existing buffer block.
    pub fn attach(mm: &'p MemoryManager, pptr: PPtr) -> Result<ByteBuffer<'p>> {
        if mm.type_code(pptr)? != TypeCode::ArrayBuffer {
            return Err(Error::InvalidArgument);
        }
        Ok(ByteBuffer { mm, pptr })
    }

    #[inline]
    pub fn pptr(&self) -> PPtr {
        self.pptr
    }

    pub fn len(&self) -> Result<u32> {
        let addr = self.mm.addr(self.pptr)?;
        Ok(unsafe { (*(addr as *const BufferHead)).len })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Borrow the buffer contents.
    pub fn bytes(&self) -> Result<&[u8]> {
        let addr = self.mm.addr(self.pptr)?;
        let len = self.len()? as usize;
        Ok(unsafe { core::slice::from_raw_parts(addr.add(size_of::<BufferHead>()), len) })
    }

    /// Raw mutable pointer to the contents, for in-place mutation under a
    /// caller-managed snapshot.
    pub fn bytes_mut(&self) -> Result<*mut u8> {
        let addr = self.mm.addr(self.pptr)?;
        Ok(unsafe { addr.add(size_of::<BufferHead>()) })
    }

    /// Flush a byte range of the contents to durable media.
    pub fn persist(&self, offset: u32, len: u32) -> Result<()> {
        self.check_range(offset, len)?;
        let addr = self.mm.addr(self.pptr)?;
        self.mm
            .persist(unsafe { addr.add(size_of::<BufferHead>() + offset as usize) }, len as usize)
    }

    /// Snapshot a byte range of the contents for rollback.
    pub fn snapshot(&self, offset: u32, len: u32) -> Result<()> {
        self.check_range(offset, len)?;
        let addr = self.mm.addr(self.pptr)?;
        unsafe {
            self.mm
                .snapshot(addr.add(size_of::<BufferHead>() + offset as usize), len as usize)
        }
    }

    fn check_range(&self, offset: u32, len: u32) -> Result<()> {
        let total = self.len()?;
        if offset.checked_add(len).map_or(true, |end| end > total) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::MIN_POOL_SIZE;
    use tempfile::tempdir;

    fn fresh(dir: &tempfile::TempDir) -> MemoryManager {
        MemoryManager::create(&dir.path().join("t.pool"), "buffer-tests", MIN_POOL_SIZE, 0o600)
            .unwrap()
    }

    #[test]
    fn create_and_read_back() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let buf = ByteBuffer::create(&mm, b"hello buffer").unwrap();
        assert_eq!(buf.len().unwrap(), 12);
        assert_eq!(buf.bytes().unwrap(), b"hello buffer");

        let again = ByteBuffer::attach(&mm, buf.pptr()).unwrap();
        assert_eq!(again.bytes().unwrap(), b"hello buffer");
    }

    #[test]
    fn create_inside_transaction_rolls_back_with_it() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let p;
        {
            let _tx = mm.tx_scope().unwrap();
            p = ByteBuffer::create(&mm, b"doomed").unwrap().pptr();
        }
        assert!(ByteBuffer::attach(&mm, p).is_err());
    }

    #[test]
    fn in_place_mutation_under_snapshot() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let buf = ByteBuffer::create(&mm, b"aaaa").unwrap();

        let tx = mm.tx_scope().unwrap();
        buf.snapshot(1, 2).unwrap();
        unsafe {
            let p = buf.bytes_mut().unwrap();
            *p.add(1) = b'b';
            *p.add(2) = b'b';
        }
        tx.commit().unwrap();
        assert_eq!(buf.bytes().unwrap(), b"abba");
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let buf = ByteBuffer::create(&mm, b"xy").unwrap();
        assert!(buf.persist(1, 2).is_err());
        assert!(buf.snapshot(3, 1).is_err());
        assert!(buf.persist(0, 2).is_ok());
    }

    #[test]
    fn attach_rejects_non_buffer_blocks() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let s = mm.persist_string("string").unwrap();
        assert!(ByteBuffer::attach(&mm, s).is_err());
    }
}
