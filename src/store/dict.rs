//! String-keyed open-addressed dictionary.
//!
//! Keys are persisted string objects referenced by pointer; slot occupancy
//! is signalled on the key pointer itself (null = empty, dummy = tombstone).
//! The key hash is XXH64 over the key bytes and is stored per entry so
//! probing can skip mismatches without touching the key strings.
//!
//! The dictionary owns its keys table and its key strings. It does not own
//! values beyond the slot pointer: a deleted or replaced value block is
//! left for the reachability collector.

use core::mem::size_of;

use log::debug;

use crate::error::{Error, Result};
use crate::hash::xxh64_oneshot;
use crate::pptr::{PPtr, PPTR_DUMMY, PPTR_EMPTY, PPTR_NULL};

use super::memory::{MemoryManager, SnapshotFlag};
use super::types::*;

/// String-keyed open-addressed hash table over pool blocks.
pub struct StringDict<'p> {
    mm: &'p MemoryManager,
    pptr: PPtr,
}

impl<'p> StringDict<'p> {
    /// Allocate an empty dictionary with the initial keys table.
    pub fn create(mm: &'p MemoryManager) -> Result<StringDict<'p>> {
        let tx = mm.tx_scope()?;
        let pptr = mm.tx_zalloc(size_of::<DictRepr>() as u64, TN_OBJECT)?;
        let repr = mm.addr(pptr)? as *mut DictRepr;
        unsafe {
            (*repr).base.type_code = TypeCode::Dict as u64;
            (*repr).keys = Self::new_keys(mm, MIN_SIZE_COMBINED)?;
        }
        tx.commit()?;
        debug!("string dict created at {:?}", pptr);
        Ok(StringDict { mm, pptr })
    }

    /// View an existing dictionary block. The caller vouches for the type
    /// code.
    pub fn attach(mm: &'p MemoryManager, pptr: PPtr) -> StringDict<'p> {
        StringDict { mm, pptr }
    }

    #[inline]
    pub fn pptr(&self) -> PPtr {
        self.pptr
    }

    fn repr(&self) -> Result<*mut DictRepr> {
        Ok(self.mm.addr(self.pptr)? as *mut DictRepr)
    }

    fn keys_repr(&self) -> Result<*mut DictKeysRepr> {
        let keys = unsafe { (*self.repr()?).keys };
        Ok(self.mm.addr(keys)? as *mut DictKeysRepr)
    }

    fn entries(keys: *mut DictKeysRepr) -> *mut DictEntry {
        unsafe { (keys as *mut u8).add(size_of::<DictKeysRepr>()) as *mut DictEntry }
    }

    pub fn used(&self) -> Result<u64> {
        Ok(unsafe { (*self.repr()?).used })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.used()? == 0)
    }

    /// Keys-table capacity.
    pub fn allocated(&self) -> Result<u64> {
        Ok(unsafe { (*self.keys_repr()?).size })
    }

    /// Insert or overwrite `key`. A fresh insert persists the key string
    /// into the pool; an overwrite touches only the value word.
    pub fn set(&self, key: &str, value: PPtr, flag: SnapshotFlag) -> Result<()> {
        let khash = xxh64_oneshot(key.as_bytes());
        let mut ep = self.lookup(key.as_bytes(), khash)?;
        let tx = self.mm.tx_scope()?;
        unsafe {
            if !(*ep).value.is_null() {
                debug_assert!(!(*ep).key.is_null() && !(*ep).key.is_dummy());
                if flag == SnapshotFlag::Snapshot {
                    self.mm
                        .snapshot(&(*ep).value as *const PPtr as *const u8, size_of::<PPtr>())?;
                }
                (*ep).value = value;
            } else {
                let key_pptr = self.mm.persist_string(key)?;
                if flag == SnapshotFlag::Snapshot {
                    self.mm.snapshot(ep as *const u8, size_of::<DictEntry>())?;
                }
                if (*ep).key.is_null() {
                    if (*self.keys_repr()?).usable <= 0 {
                        self.insertion_resize()?;
                        ep = self.find_empty_slot(khash)?;
                    }
                    let keys = self.keys_repr()?;
                    if flag == SnapshotFlag::Snapshot {
                        self.mm
                            .snapshot(&(*keys).usable as *const i64 as *const u8, 8)?;
                    }
                    (*keys).usable -= 1;
                    debug_assert!((*keys).usable >= 0);
                    (*ep).key = key_pptr;
                    (*ep).hash = khash;
                } else {
                    debug_assert!((*ep).key.is_dummy());
                    (*ep).key = key_pptr;
                    (*ep).hash = khash;
                }
                let repr = self.repr()?;
                if flag == SnapshotFlag::Snapshot {
                    self.mm
                        .snapshot(&(*repr).used as *const u64 as *const u8, 8)?;
                }
                (*repr).used += 1;
                (*ep).value = value;
            }
        }
        tx.commit()
    }

    /// Value for `key`, or the `EMPTY` sentinel when absent. `EMPTY` is a
    /// miss signal, distinct from a key that maps to `UNDEFINED`.
    pub fn get(&self, key: &str) -> Result<PPtr> {
        let khash = xxh64_oneshot(key.as_bytes());
        let ep = self.lookup(key.as_bytes(), khash)?;
        unsafe {
            if !(*ep).key.is_heap() {
                return Ok(PPTR_EMPTY);
            }
            Ok((*ep).value)
        }
    }

    /// Remove `key`: frees the key string and tombstones the slot. The
    /// value block is left alone; orphans belong to the collector.
    pub fn del(&self, key: &str, flag: SnapshotFlag) -> Result<()> {
        let khash = xxh64_oneshot(key.as_bytes());
        let ep = self.lookup(key.as_bytes(), khash)?;
        unsafe {
            if !(*ep).key.is_heap() || (*ep).value.is_null() {
                return Ok(());
            }
            debug!("string dict {:?}: deleting key {key:?}", self.pptr);
            let tx = self.mm.tx_scope()?;
            if flag == SnapshotFlag::Snapshot {
                self.mm.snapshot(ep as *const u8, size_of::<DictEntry>())?;
            }
            let old_key = (*ep).key;
            (*ep).value = PPTR_NULL;
            let repr = self.repr()?;
            if flag == SnapshotFlag::Snapshot {
                self.mm
                    .snapshot(&(*repr).used as *const u64 as *const u8, 8)?;
            }
            (*repr).used -= 1;
            (*ep).key = PPTR_DUMMY;
            self.mm.free(old_key)?;
            tx.commit()
        }
    }

    /// Pointers to the key strings of every occupied slot, in table order.
    pub fn keys(&self) -> Result<Vec<PPtr>> {
        let keys = self.keys_repr()?;
        let size = unsafe { (*keys).size };
        let ep0 = Self::entries(keys);
        let mut out = Vec::new();
        for i in 0..size {
            let key = unsafe { (*ep0.add(i as usize)).key };
            if key.is_heap() {
                out.push(key);
            }
        }
        Ok(out)
    }

    /// Every `(key, value)` slot pair of the keys table, occupied or not.
    /// The collector walks these; null and dummy keys fall out naturally
    /// when matched against the census sets.
    pub(super) fn slots(&self) -> Result<Vec<(PPtr, PPtr)>> {
        let keys = self.keys_repr()?;
        let size = unsafe { (*keys).size };
        let ep0 = Self::entries(keys);
        let mut out = Vec::with_capacity(size as usize);
        for i in 0..size {
            unsafe {
                let ep = ep0.add(i as usize);
                out.push(((*ep).key, (*ep).value));
            }
        }
        Ok(out)
    }

    /// Free the keys table and the dictionary head. Key strings are freed
    /// too; they are owned by the table.
    pub fn deallocate(&self) -> Result<()> {
        let tx = self.mm.tx_scope()?;
        let keys_pptr = unsafe { (*self.repr()?).keys };
        for key in self.keys()? {
            self.mm.free(key)?;
        }
        self.mm.free(keys_pptr)?;
        self.mm.free(self.pptr)?;
        tx.commit()
    }

    /// Probe for `key`: the matching occupied entry, else the first
    /// tombstone on the chain, else the terminating empty slot. Hash
    /// equality gates the byte comparison against the stored key string.
    fn lookup(&self, key: &[u8], khash: u64) -> Result<*mut DictEntry> {
        let keys = self.keys_repr()?;
        let mask = unsafe { (*keys).size } - 1;
        let ep0 = Self::entries(keys);
        let mut idx = khash & mask;
        unsafe {
            let mut ep = ep0.add(idx as usize);
            let me_key = (*ep).key;
            let mut freeslot = if me_key.is_null() {
                return Ok(ep);
            } else if me_key.is_dummy() {
                Some(ep)
            } else {
                if (*ep).hash == khash && self.mm.string_bytes(me_key)? == key {
                    return Ok(ep);
                }
                None
            };
            let mut perturb = khash;
            loop {
                idx = idx
                    .wrapping_mul(5)
                    .wrapping_add(perturb)
                    .wrapping_add(1);
                ep = ep0.add((idx & mask) as usize);
                let me_key = (*ep).key;
                if me_key.is_null() {
                    return Ok(freeslot.unwrap_or(ep));
                }
                if me_key.is_dummy() {
                    if freeslot.is_none() {
                        freeslot = Some(ep);
                    }
                } else if (*ep).hash == khash && self.mm.string_bytes(me_key)? == key {
                    return Ok(ep);
                }
                perturb >>= PERTURB_SHIFT;
            }
        }
    }

    /// First empty slot on the probe chain; skips tombstones.
    fn find_empty_slot(&self, khash: u64) -> Result<*mut DictEntry> {
        let keys = self.keys_repr()?;
        let mask = unsafe { (*keys).size } - 1;
        let ep0 = Self::entries(keys);
        let mut idx = khash & mask;
        let mut perturb = khash;
        unsafe {
            let mut ep = ep0.add(idx as usize);
            while !(*ep).key.is_null() {
                idx = idx
                    .wrapping_mul(5)
                    .wrapping_add(perturb)
                    .wrapping_add(1);
                ep = ep0.add((idx & mask) as usize);
                perturb >>= PERTURB_SHIFT;
            }
            Ok(ep)
        }
    }

    fn grow_rate(&self) -> Result<u64> {
        Ok(self.used()? * 2 + (self.allocated()? >> 1))
    }

    /// Move every occupied entry into a larger table. Key strings move by
    /// pointer; only the keys-pointer swap needs a snapshot.
    fn insertion_resize(&self) -> Result<()> {
        let minused = self.grow_rate()?;
        let mut newsize = MIN_SIZE_COMBINED;
        while newsize <= minused && newsize > 0 {
            newsize <<= 1;
        }
        debug!("string dict {:?} resizing keys table to {}", self.pptr, newsize);
        let repr = self.repr()?;
        let old_keys_pptr = unsafe { (*repr).keys };
        let old_keys = self.mm.addr(old_keys_pptr)? as *mut DictKeysRepr;

        let tx = self.mm.tx_scope()?;
        unsafe {
            self.mm
                .snapshot(&(*repr).keys as *const PPtr as *const u8, size_of::<PPtr>())?;
            (*repr).keys = Self::new_keys(self.mm, newsize)?;

            let oldsize = (*old_keys).size;
            let old_ep0 = Self::entries(old_keys);
            for i in 0..oldsize {
                let old_ep = old_ep0.add(i as usize);
                if !(*old_ep).value.is_null() {
                    debug_assert!(!(*old_ep).key.is_dummy());
                    let new_ep = self.find_empty_slot((*old_ep).hash)?;
                    (*new_ep).key = (*old_ep).key;
                    (*new_ep).hash = (*old_ep).hash;
                    (*new_ep).value = (*old_ep).value;
                }
            }
            let new_keys = self.keys_repr()?;
            (*new_keys).usable -= (*repr).used as i64;
        }
        self.mm.free(old_keys_pptr)?;
        tx.commit()
    }

    /// Allocate a zeroed keys table of `size` slots (zero is both the null
    /// key pointer and the null value).
    fn new_keys(mm: &MemoryManager, size: u64) -> Result<PPtr> {
        debug_assert!(size > MIN_SIZE_SPLIT);
        debug_assert!(size.is_power_of_two());
        let tx = mm.tx_scope()?;
        let bytes = size_of::<DictKeysRepr>() as u64 + size * size_of::<DictEntry>() as u64;
        let pptr = mm.tx_zalloc(bytes, TN_STRING_DICT_KEYS)?;
        let keys = mm.addr(pptr)? as *mut DictKeysRepr;
        unsafe {
            (*keys).size = size;
            (*keys).usable = usable_fraction(size) as i64;
        }
        tx.commit()?;
        Ok(pptr)
    }
}
