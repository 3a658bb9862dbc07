//! Undo-log transactions.
//!
//! The protocol for every mutation is: open a transaction, snapshot each
//! byte range about to be written, write, commit. A snapshot appends a
//! record holding the range's prior contents to the on-file log; the record
//! bytes are persisted before the entry counter covering them, and the
//! counter is persisted before the caller gets control back to mutate. An
//! abort (or crash recovery on reopen) therefore always sees a complete set
//! of records and replays them in reverse.
//!
//! Frees are deferred: `tx_free` only appends a `REC_FREE` record and the
//! block is reclaimed at commit, after the commit point. Recovery re-applies
//! deferred frees when it finds the log in the committed state, which is why
//! freeing is idempotent.
//!
//! Nesting is flat. Inner `tx_begin`/`tx_commit` pairs only move a depth
//! counter; the outermost commit is the durable one, and an inner abort
//! poisons the whole flat transaction.

use std::ptr;

use log::debug;

use crate::error::{Error, Result};

use super::layout::*;
use super::pool::RawPool;

/// Transaction stage, mirrored by [`RawPool::tx_stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    /// No transaction frame is open.
    None,
    /// Inside an open transaction; mutations are legal.
    Work,
    /// The outermost frame committed; awaiting `tx_end`.
    Committed,
    /// The transaction rolled back; awaiting `tx_end` of every open frame.
    Aborted,
}

/// Volatile per-pool transaction frame.
pub(super) struct TxState {
    pub depth: u32,
    pub stage: TxStage,
    /// Append offset relative to the first log record.
    pub tail: u64,
    /// Mirror of the on-file entry count.
    pub entries: u64,
    /// Ranges written this transaction, flushed at commit.
    pub written: Vec<(u64, u64)>,
    /// Header offsets of blocks freed this transaction, applied at commit.
    pub frees: Vec<u64>,
}

impl TxState {
    pub fn new() -> TxState {
        TxState {
            depth: 0,
            stage: TxStage::None,
            tail: 0,
            entries: 0,
            written: Vec::new(),
            frees: Vec::new(),
        }
    }
}

impl RawPool {
    #[inline]
    fn log_header(&self) -> *mut LogHeader {
        self.at(self.log_off()) as *mut LogHeader
    }

    /// True iff a transaction frame is open and usable.
    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.tx.borrow().stage == TxStage::Work
    }

    /// Current transaction stage.
    #[inline]
    pub fn tx_stage(&self) -> TxStage {
        self.tx.borrow().stage
    }

    /// Open a transaction frame. Nested frames flatten onto the outermost.
    pub fn tx_begin(&self) -> Result<()> {
        let mut t = self.tx.borrow_mut();
        if t.depth > 0 && t.stage != TxStage::Work {
            return Err(Error::NotInTx);
        }
        t.depth += 1;
        if t.depth == 1 {
            debug_assert_eq!(t.entries, 0);
            t.stage = TxStage::Work;
            t.tail = 0;
            t.entries = 0;
            t.written.clear();
            t.frees.clear();
        }
        Ok(())
    }

    /// Commit the current frame. Only the outermost frame flushes, applies
    /// deferred frees, and clears the log; inner commits are no-ops.
    pub fn tx_commit(&self) -> Result<()> {
        {
            let t = self.tx.borrow();
            if t.stage != TxStage::Work {
                return Err(Error::NotInTx);
            }
            if t.depth > 1 {
                return Ok(());
            }
        }
        let (written, frees) = {
            let mut t = self.tx.borrow_mut();
            (std::mem::take(&mut t.written), std::mem::take(&mut t.frees))
        };
        for &(off, len) in &written {
            self.persist_off(off, len)?;
        }
        if !written.is_empty() || !frees.is_empty() {
            let lh = self.log_header();
            unsafe { (*lh).state = LOG_COMMITTED };
            self.persist_off(self.log_off(), 8)?;
            for hdr_off in frees {
                self.mark_free(hdr_off);
            }
            self.clear_log()?;
        }
        let mut t = self.tx.borrow_mut();
        t.stage = TxStage::Committed;
        t.entries = 0;
        t.tail = 0;
        Ok(())
    }

    /// Roll back every mutation of the flat transaction and poison the open
    /// frames; each still needs its `tx_end`.
    pub fn tx_abort(&self) -> Result<()> {
        if self.tx.borrow().stage != TxStage::Work {
            return Err(Error::NotInTx);
        }
        debug!("tx_abort: rolling back {} undo records", self.tx.borrow().entries);
        self.rollback_from_log()?;
        self.clear_log()?;
        self.rebuild_free_list()?;
        let mut t = self.tx.borrow_mut();
        t.stage = TxStage::Aborted;
        t.entries = 0;
        t.tail = 0;
        t.written.clear();
        t.frees.clear();
        Ok(())
    }

    /// Close the innermost frame. Closing the outermost frame of a
    /// still-working transaction rolls it back.
    pub fn tx_end(&self) -> Result<()> {
        let (depth, stage) = {
            let t = self.tx.borrow();
            (t.depth, t.stage)
        };
        if depth == 0 {
            return Err(Error::NotInTx);
        }
        if depth > 1 {
            self.tx.borrow_mut().depth = depth - 1;
            return Ok(());
        }
        if stage == TxStage::Work {
            self.rollback_from_log()?;
            self.clear_log()?;
            self.rebuild_free_list()?;
        }
        let mut t = self.tx.borrow_mut();
        t.depth = 0;
        t.stage = TxStage::None;
        t.entries = 0;
        t.tail = 0;
        t.written.clear();
        t.frees.clear();
        Ok(())
    }

    /// Register a byte range for rollback logging. Must be called before
    /// the range is mutated.
    ///
    /// # Safety
    /// `addr` must point into this pool's mapping and `addr..addr+len` must
    /// stay inside it.
    pub unsafe fn snapshot(&self, addr: *const u8, len: usize) -> Result<()> {
        if !self.in_transaction() {
            return Err(Error::NotInTx);
        }
        let off = addr as usize - self.base as usize;
        if off.checked_add(len).map_or(true, |end| end > self.map_len) {
            return Err(Error::InvalidArgument);
        }
        self.snapshot_off(off as u64, len as u64)
    }

    /// Offset-addressed variant of [`Self::snapshot`].
    pub(super) fn snapshot_off(&self, off: u64, len: u64) -> Result<()> {
        if !self.in_transaction() {
            return Err(Error::NotInTx);
        }
        self.log_append(REC_SNAPSHOT, off, len, true)?;
        self.tx.borrow_mut().written.push((off, len));
        Ok(())
    }

    /// Append a deferred-free record for the block at `hdr_off`.
    pub(super) fn log_append_free(&self, hdr_off: u64, size: u64) -> Result<()> {
        self.log_append(REC_FREE, hdr_off, size, false)
    }

    /// Append one log record, honouring the durability ordering: record
    /// bytes first, entry counter second.
    fn log_append(&self, kind: u64, off: u64, len: u64, with_payload: bool) -> Result<()> {
        let log_off = self.log_off();
        let cap = self.log_size() - LOG_DATA_OFF;
        let payload = if with_payload { log_pad(len) } else { 0 };
        let rec_size = core::mem::size_of::<LogRecord>() as u64 + payload;
        let (tail, entries) = {
            let t = self.tx.borrow();
            (t.tail, t.entries)
        };
        if tail + rec_size > cap {
            return Err(Error::AllocFail);
        }
        let lh = self.log_header();
        if entries == 0 {
            unsafe { (*lh).state = LOG_ACTIVE };
            self.persist_off(log_off, 8)?;
        }
        let rec_off = log_off + LOG_DATA_OFF + tail;
        unsafe {
            let rec = self.at(rec_off) as *mut LogRecord;
            (*rec).kind = kind;
            (*rec).off = off;
            (*rec).len = len;
            if with_payload {
                ptr::copy_nonoverlapping(
                    self.at(off),
                    self.at(rec_off + core::mem::size_of::<LogRecord>() as u64),
                    len as usize,
                );
            }
        }
        self.persist_off(rec_off, rec_size)?;
        unsafe { (*lh).entry_count = entries + 1 };
        self.persist_off(log_off + 8, 8)?;
        let mut t = self.tx.borrow_mut();
        t.tail = tail + rec_size;
        t.entries = entries + 1;
        Ok(())
    }

    /// Parse the on-file log: `(kind, off, len, payload_off)` per record.
    fn log_records(&self) -> Result<Vec<(u64, u64, u64, u64)>> {
        let log_off = self.log_off();
        let cap = self.log_size() - LOG_DATA_OFF;
        let count = unsafe { (*self.log_header()).entry_count };
        let mut out = Vec::with_capacity(count as usize);
        let mut cursor = 0u64;
        for _ in 0..count {
            if cursor + core::mem::size_of::<LogRecord>() as u64 > cap {
                return Err(Error::Corrupt("undo log overruns its region".into()));
            }
            let rec_off = log_off + LOG_DATA_OFF + cursor;
            let (kind, off, len) = unsafe {
                let rec = &*(self.at(rec_off) as *const LogRecord);
                (rec.kind, rec.off, rec.len)
            };
            let payload = match kind {
                REC_SNAPSHOT => log_pad(len),
                REC_FREE => 0,
                _ => return Err(Error::Corrupt(format!("unknown log record kind {kind}"))),
            };
            if off.checked_add(len).map_or(true, |end| end > self.map_len as u64) {
                return Err(Error::Corrupt("log record points outside the pool".into()));
            }
            let payload_off = rec_off + core::mem::size_of::<LogRecord>() as u64;
            if cursor + core::mem::size_of::<LogRecord>() as u64 + payload > cap {
                return Err(Error::Corrupt("undo log overruns its region".into()));
            }
            out.push((kind, off, len, payload_off));
            cursor += core::mem::size_of::<LogRecord>() as u64 + payload;
        }
        Ok(out)
    }

    /// Restore every snapshotted range, newest first.
    fn rollback_from_log(&self) -> Result<()> {
        let recs = self.log_records()?;
        for &(kind, off, len, payload_off) in recs.iter().rev() {
            if kind == REC_SNAPSHOT {
                unsafe {
                    ptr::copy_nonoverlapping(
                        self.at(payload_off),
                        self.at(off),
                        len as usize,
                    );
                }
                self.persist_off(off, len)?;
            }
        }
        Ok(())
    }

    fn clear_log(&self) -> Result<()> {
        let lh = self.log_header();
        unsafe {
            (*lh).entry_count = 0;
            (*lh).state = LOG_IDLE;
        }
        self.persist_off(self.log_off(), core::mem::size_of::<LogHeader>() as u64)
    }

    /// Reopen-time recovery: roll an interrupted transaction back, or finish
    /// the deferred frees of a transaction that crashed after its commit
    /// point.
    pub(super) fn recover(&self) -> Result<()> {
        let (state, count) = unsafe {
            let lh = &*self.log_header();
            (lh.state, lh.entry_count)
        };
        match state {
            LOG_ACTIVE => {
                debug!("recovery: rolling back {count} undo records");
                self.rollback_from_log()?;
                self.clear_log()
            }
            LOG_COMMITTED => {
                debug!("recovery: re-applying deferred frees of a committed transaction");
                for (kind, off, _len, _payload) in self.log_records()? {
                    if kind == REC_FREE {
                        self.mark_free(off);
                    }
                }
                self.clear_log()
            }
            _ if count != 0 => self.clear_log(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::layout::MIN_POOL_SIZE;
    use tempfile::tempdir;

    fn fresh_pool(dir: &tempfile::TempDir) -> RawPool {
        RawPool::create(&dir.path().join("t.pool"), "tx-tests", MIN_POOL_SIZE, 0o600).unwrap()
    }

    #[test]
    fn stages_follow_begin_commit_end() {
        let dir = tempdir().unwrap();
        let pool = fresh_pool(&dir);
        assert_eq!(pool.tx_stage(), TxStage::None);
        pool.tx_begin().unwrap();
        assert!(pool.in_transaction());
        pool.tx_commit().unwrap();
        assert_eq!(pool.tx_stage(), TxStage::Committed);
        pool.tx_end().unwrap();
        assert_eq!(pool.tx_stage(), TxStage::None);
    }

    #[test]
    fn nested_frames_flatten() {
        let dir = tempdir().unwrap();
        let pool = fresh_pool(&dir);
        pool.tx_begin().unwrap();
        pool.tx_begin().unwrap();
        pool.tx_commit().unwrap(); // inner: no-op
        pool.tx_end().unwrap();
        assert!(pool.in_transaction());
        pool.tx_commit().unwrap();
        pool.tx_end().unwrap();
        assert_eq!(pool.tx_stage(), TxStage::None);
    }

    #[test]
    fn snapshot_outside_tx_is_rejected() {
        let dir = tempdir().unwrap();
        let pool = fresh_pool(&dir);
        let root = pool.root(32).unwrap();
        let addr = pool.direct(root).unwrap();
        assert!(matches!(
            unsafe { pool.snapshot(addr, 8) },
            Err(Error::NotInTx)
        ));
    }

    #[test]
    fn abort_restores_snapshotted_bytes() {
        let dir = tempdir().unwrap();
        let pool = fresh_pool(&dir);
        let root = pool.root(32).unwrap();
        let addr = pool.direct(root).unwrap();
        unsafe { *addr = 7 };

        pool.tx_begin().unwrap();
        unsafe {
            pool.snapshot(addr, 1).unwrap();
            *addr = 42;
        }
        pool.tx_abort().unwrap();
        pool.tx_end().unwrap();
        assert_eq!(unsafe { *addr }, 7);
    }

    #[test]
    fn commit_makes_mutation_stick() {
        let dir = tempdir().unwrap();
        let pool = fresh_pool(&dir);
        let root = pool.root(32).unwrap();
        let addr = pool.direct(root).unwrap();

        pool.tx_begin().unwrap();
        unsafe {
            pool.snapshot(addr, 1).unwrap();
            *addr = 42;
        }
        pool.tx_commit().unwrap();
        pool.tx_end().unwrap();
        assert_eq!(unsafe { *addr }, 42);
    }

    #[test]
    fn unended_work_frame_rolls_back_on_end() {
        let dir = tempdir().unwrap();
        let pool = fresh_pool(&dir);
        let root = pool.root(32).unwrap();
        let addr = pool.direct(root).unwrap();

        pool.tx_begin().unwrap();
        unsafe {
            pool.snapshot(addr, 1).unwrap();
            *addr = 9;
        }
        pool.tx_end().unwrap(); // no commit
        assert_eq!(unsafe { *addr }, 0);
    }
}
