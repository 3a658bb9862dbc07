//! Pool attachment: mapping a pool file, creating a fresh one, the static
//! consistency check, direct/reverse address translation, durable flushes,
//! and the well-known root block.
//!
//! A [`RawPool`] is the one process-side handle onto a pool file. It holds
//! the raw mapping plus the volatile state the allocator and transaction
//! machinery need (free list, transaction frame). It is deliberately
//! `!Send`/`!Sync`: a pool is single-threaded by contract.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::error::{Error, Result};
use crate::hash::xxh64_seeded;
use crate::pptr::{PPtr, TAG_RESERVED_MAX};

use super::layout::*;
use super::tx::TxState;

/// A memory-mapped pool file.
pub struct RawPool {
    pub(super) base: *mut u8,
    pub(super) map_len: usize,
    pub(super) uuid: u64,
    pub(super) tx: RefCell<TxState>,
    /// Offsets (block header, not payload) of free blocks, ascending.
    pub(super) free_list: RefCell<Vec<u64>>,
    _file: File,
}

/// Encode a layout name as the NUL-padded on-file form.
fn layout_bytes(layout: &str) -> Result<[u8; LAYOUT_MAX]> {
    let raw = layout.as_bytes();
    if raw.is_empty() || raw.len() >= LAYOUT_MAX || raw.contains(&0) {
        return Err(Error::InvalidArgument);
    }
    let mut out = [0u8; LAYOUT_MAX];
    out[..raw.len()].copy_from_slice(raw);
    Ok(out)
}

impl RawPool {
    /// Create a pool file of `size` bytes with the given layout name and
    /// file permission bits, and attach to it.
    ///
    /// Fails if the file already exists, the size is below
    /// [`MIN_POOL_SIZE`], or the layout name does not fit.
    pub fn create(path: &Path, layout: &str, size: u64, mode: u32) -> Result<RawPool> {
        let layout_buf = layout_bytes(layout)?;
        if size < MIN_POOL_SIZE {
            return Err(Error::PoolOpen(format!(
                "pool size {size} below minimum {MIN_POOL_SIZE}"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)
            .map_err(|e| Error::PoolOpen(format!("{}: {e}", path.display())))?;
        nix::unistd::ftruncate(&file, size as libc::off_t)?;

        let pool = Self::map(file, size as usize)?;

        let log_off = PAGE_SIZE as u64;
        let log_size = log_region_size(size);
        let heap_off = log_off + log_size;
        if heap_off + BLOCK_HDR_SIZE + ALLOC_ALIGN > size {
            return Err(Error::PoolOpen("pool too small for heap".into()));
        }
        let heap_size = (size - heap_off) & !(ALLOC_ALIGN - 1);

        let uuid = derive_uuid(path, layout);
        unsafe {
            let hdr = &mut *pool.header();
            hdr.magic = POOL_MAGIC;
            hdr.version = FORMAT_VERSION;
            hdr.uuid = uuid;
            hdr.layout = layout_buf;
            hdr.pool_size = size;
            hdr.log_off = log_off;
            hdr.log_size = log_size;
            hdr.heap_off = heap_off;
            hdr.heap_size = heap_size;
            hdr.root_off = 0;
            hdr.root_size = 0;

            let log = &mut *(pool.at(log_off) as *mut LogHeader);
            log.state = LOG_IDLE;
            log.entry_count = 0;

            // The heap starts life as a single free block.
            let first = &mut *(pool.at(heap_off) as *mut BlockHeader);
            first.size = heap_size - BLOCK_HDR_SIZE;
            first.type_num = TYPE_NUM_NONE;
            first.state = BLOCK_FREE;
        }
        pool.persist_off(0, PAGE_SIZE as u64)?;
        pool.persist_off(log_off, core::mem::size_of::<LogHeader>() as u64)?;
        pool.persist_off(heap_off, BLOCK_HDR_SIZE)?;

        let mut pool = pool;
        pool.uuid = uuid;
        pool.free_list.borrow_mut().push(heap_off);
        debug!(
            "pool created: {} ({} bytes, uuid {:#x})",
            path.display(),
            size,
            uuid
        );
        Ok(pool)
    }

    /// Attach to an existing pool file, validating its header against the
    /// expected layout name and rolling back or completing any transaction
    /// that was interrupted by a crash.
    pub fn open(path: &Path, layout: &str) -> Result<RawPool> {
        let layout_buf = layout_bytes(layout)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::PoolOpen(format!("{}: {e}", path.display())))?;
        let stat = nix::sys::stat::fstat(&file)?;
        let file_len = stat.st_size as u64;
        if file_len < MIN_POOL_SIZE {
            return Err(Error::PoolOpen("file too small to be a pool".into()));
        }

        let mut pool = Self::map(file, file_len as usize)?;
        unsafe {
            let hdr = &*pool.header();
            if hdr.magic != POOL_MAGIC {
                return Err(Error::PoolOpen("bad magic".into()));
            }
            if hdr.version != FORMAT_VERSION {
                return Err(Error::PoolOpen(format!(
                    "format version {} unsupported",
                    hdr.version
                )));
            }
            if hdr.layout != layout_buf {
                return Err(Error::PoolOpen("layout mismatch".into()));
            }
            if hdr.pool_size != file_len
                || hdr.heap_off + hdr.heap_size > file_len
                || hdr.log_off + hdr.log_size > hdr.heap_off
            {
                return Err(Error::PoolOpen("inconsistent geometry".into()));
            }
            pool.uuid = hdr.uuid;
        }
        pool.recover()?;
        pool.rebuild_free_list()?;
        debug!("pool opened: {} (uuid {:#x})", path.display(), pool.uuid);
        Ok(pool)
    }

    /// Static consistency verdict on a pool file, without attaching to it.
    ///
    /// `Ok(true)` means the header is sound for this layout. A pending
    /// interrupted transaction still yields `true`: recovery on open is
    /// deterministic.
    pub fn check(path: &Path, layout: &str) -> Result<bool> {
        let layout_buf = layout_bytes(layout)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut file = File::open(path)
            .map_err(|e| Error::PoolOpen(format!("{}: {e}", path.display())))?;
        io::Read::read_exact(&mut file, &mut buf)
            .map_err(|e| Error::PoolOpen(format!("short header: {e}")))?;
        let hdr: PoolHeader = unsafe { ptr::read_unaligned(buf.as_ptr() as *const PoolHeader) };
        let len = file.metadata()?.len();
        Ok(hdr.magic == POOL_MAGIC
            && hdr.version == FORMAT_VERSION
            && hdr.layout == layout_buf
            && hdr.pool_size == len
            && hdr.heap_off + hdr.heap_size <= len)
    }

    fn map(file: File, len: usize) -> Result<RawPool> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(RawPool {
            base: base as *mut u8,
            map_len: len,
            uuid: 0,
            tx: RefCell::new(TxState::new()),
            free_list: RefCell::new(Vec::new()),
            _file: file,
        })
    }

    /// Flush everything and unmap. Dropping the pool does the same.
    pub fn close(self) {}

    /// The pool identity carried as the tag of every heap pointer into it.
    #[inline]
    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    #[inline]
    pub(super) fn header(&self) -> *mut PoolHeader {
        self.base as *mut PoolHeader
    }

    /// Raw in-process address of pool offset `off`.
    ///
    /// Callers must have validated `off` against the pool geometry.
    #[inline]
    pub(super) fn at(&self, off: u64) -> *mut u8 {
        debug_assert!((off as usize) < self.map_len);
        unsafe { self.base.add(off as usize) }
    }

    #[inline]
    pub(super) fn heap_off(&self) -> u64 {
        unsafe { (*self.header()).heap_off }
    }

    #[inline]
    pub(super) fn heap_end(&self) -> u64 {
        unsafe { (*self.header()).heap_off + (*self.header()).heap_size }
    }

    #[inline]
    pub(super) fn log_off(&self) -> u64 {
        unsafe { (*self.header()).log_off }
    }

    #[inline]
    pub(super) fn log_size(&self) -> u64 {
        unsafe { (*self.header()).log_size }
    }

    /// Resolve a heap pointer into this pool to a raw in-process address.
    ///
    /// `None` for null/dummy/singleton/number pointers, pointers into a
    /// different pool, and out-of-range offsets.
    pub fn direct(&self, p: PPtr) -> Option<*mut u8> {
        if p.tag != self.uuid || self.uuid == 0 {
            return None;
        }
        if p.off < PAGE_SIZE as u64 || p.off as usize >= self.map_len {
            return None;
        }
        Some(self.at(p.off))
    }

    /// Reverse translation: in-process address back to a pool pointer.
    ///
    /// # Safety
    /// `addr` must point inside this pool's mapping.
    pub unsafe fn ptr_of(&self, addr: *const u8) -> PPtr {
        let off = addr as usize - self.base as usize;
        debug_assert!(off < self.map_len);
        PPtr { tag: self.uuid, off: off as u64 }
    }

    /// Flush a byte range to durable media (`msync` of the page-aligned
    /// superset).
    pub fn persist(&self, addr: *const u8, len: usize) -> Result<()> {
        let a = addr as usize;
        let delta = a & (PAGE_SIZE - 1);
        let rc = unsafe {
            libc::msync(
                (a - delta) as *mut libc::c_void,
                len + delta,
                libc::MS_SYNC,
            )
        };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    #[inline]
    pub(super) fn persist_off(&self, off: u64, len: u64) -> Result<()> {
        self.persist(self.at(off), len as usize)
    }

    /// The pool's root pointer, allocating a zeroed root block of `size`
    /// bytes on first call. Subsequent calls (including `root(0)`) return
    /// the existing block; a larger `size` than the allocated one is an
    /// error.
    pub fn root(&self, size: u64) -> Result<PPtr> {
        let (root_off, root_size) = unsafe {
            let hdr = &*self.header();
            (hdr.root_off, hdr.root_size)
        };
        if root_off != 0 {
            if size > root_size {
                return Err(Error::InvalidArgument);
            }
            return Ok(PPtr { tag: self.uuid, off: root_off });
        }
        if size == 0 {
            return Err(Error::InvalidArgument);
        }

        self.tx_begin()?;
        let out = (|| {
            let p = self.tx_zalloc(size, TYPE_NUM_ROOT)?;
            let hdr = self.header();
            unsafe {
                let field = &(*hdr).root_off as *const u64 as *const u8;
                self.snapshot(field, 2 * core::mem::size_of::<u64>())?;
                (*hdr).root_off = p.off;
                (*hdr).root_size = size;
            }
            Ok(p)
        })();
        let out = match out {
            Ok(v) => self.tx_commit().map(|_| v),
            Err(e) => {
                let _ = self.tx_abort();
                Err(e)
            }
        };
        self.tx_end()?;
        out
    }
}

impl Drop for RawPool {
    fn drop(&mut self) {
        unsafe {
            libc::msync(self.base as *mut libc::c_void, self.map_len, libc::MS_SYNC);
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
        }
    }
}

/// Derive a pool uuid that never collides with the reserved pointer tags.
fn derive_uuid(path: &Path, layout: &str) -> u64 {
    let mut material = Vec::new();
    material.extend_from_slice(path.to_string_lossy().as_bytes());
    material.extend_from_slice(layout.as_bytes());
    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    loop {
        let uuid = xxh64_seeded(&material, seed);
        if uuid >= TAG_RESERVED_MAX {
            return uuid;
        }
        seed = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_check_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.pool");
        let uuid;
        {
            let pool = RawPool::create(&path, "layout-a", MIN_POOL_SIZE, 0o600).unwrap();
            uuid = pool.uuid();
            assert!(uuid >= TAG_RESERVED_MAX);
        }
        assert!(RawPool::check(&path, "layout-a").unwrap());
        assert!(!RawPool::check(&path, "layout-b").unwrap());
        let pool = RawPool::open(&path, "layout-a").unwrap();
        assert_eq!(pool.uuid(), uuid);
    }

    #[test]
    fn open_rejects_wrong_layout_and_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.pool");
        RawPool::create(&path, "layout-a", MIN_POOL_SIZE, 0o600).unwrap();
        assert!(matches!(
            RawPool::open(&path, "layout-b"),
            Err(Error::PoolOpen(_))
        ));
        assert!(matches!(
            RawPool::open(&dir.path().join("absent.pool"), "layout-a"),
            Err(Error::PoolOpen(_))
        ));
    }

    #[test]
    fn create_rejects_undersized_pool() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.pool");
        assert!(matches!(
            RawPool::create(&path, "l", 4096, 0o600),
            Err(Error::PoolOpen(_))
        ));
    }

    #[test]
    fn root_is_idempotent_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.pool");
        let first;
        {
            let pool = RawPool::create(&path, "l", MIN_POOL_SIZE, 0o600).unwrap();
            first = pool.root(32).unwrap();
            assert_eq!(pool.root(32).unwrap(), first);
            assert_eq!(pool.root(0).unwrap(), first);
        }
        let pool = RawPool::open(&path, "l").unwrap();
        assert_eq!(pool.root(32).unwrap().off, first.off);
    }

    #[test]
    fn direct_rejects_foreign_and_immediate_pointers() {
        let dir = tempdir().unwrap();
        let pool =
            RawPool::create(&dir.path().join("t.pool"), "l", MIN_POOL_SIZE, 0o600).unwrap();
        assert!(pool.direct(crate::pptr::PPTR_NULL).is_none());
        assert!(pool.direct(crate::pptr::PPTR_TRUE).is_none());
        assert!(pool
            .direct(PPtr { tag: pool.uuid() ^ 1, off: 4096 })
            .is_none());
        let root = pool.root(16).unwrap();
        assert!(pool.direct(root).is_some());
    }
}
