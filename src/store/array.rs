//! Indexed element containers: the dense simple array and the sparse
//! integer-keyed number dictionary, plus the conversions between them.
//!
//! Both are views over pool-resident blocks; a container value holds only
//! the memory manager handle and the block pointer, so dropping it never
//! touches the pool. Ownership of the underlying blocks flows through the
//! composite object (or the root slot) that references them.
//!
//! The number dictionary is an open-addressed table with perturbed probing:
//! from `idx0 = hash & mask`, each step takes `idx = 5*idx + perturb + 1`
//! with `perturb >>= 5`. Tombstoned slots keep probe chains intact and are
//! reused by the first insert whose chain passes them.

use core::mem::size_of;

use log::debug;

use crate::error::{Error, Result};
use crate::pptr::{PPtr, PPTR_NULL, PPTR_UNDEFINED};

use super::memory::{MemoryManager, SnapshotFlag};
use super::types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Simple array
// ─────────────────────────────────────────────────────────────────────────────

/// Dense zero-based sequence of tagged pointers with geometric
/// reallocation of its owned items block.
pub struct SimpleArray<'p> {
    mm: &'p MemoryManager,
    pptr: PPtr,
}

impl<'p> SimpleArray<'p> {
    /// Allocate an empty array (no items block yet).
    pub fn create(mm: &'p MemoryManager) -> Result<SimpleArray<'p>> {
        let tx = mm.tx_scope()?;
        let pptr = mm.tx_zalloc(size_of::<ArrayRepr>() as u64, TN_OBJECT)?;
        let repr = mm.addr(pptr)? as *mut ArrayRepr;
        unsafe { (*repr).base.base.type_code = TypeCode::Array as u64 };
        tx.commit()?;
        debug!("simple array created at {:?}", pptr);
        Ok(SimpleArray { mm, pptr })
    }

    /// View an existing array block. The caller vouches for the type code.
    pub fn attach(mm: &'p MemoryManager, pptr: PPtr) -> SimpleArray<'p> {
        SimpleArray { mm, pptr }
    }

    #[inline]
    pub fn pptr(&self) -> PPtr {
        self.pptr
    }

    fn repr(&self) -> Result<*mut ArrayRepr> {
        Ok(self.mm.addr(self.pptr)? as *mut ArrayRepr)
    }

    pub(super) fn items(&self) -> Result<Option<*mut PPtr>> {
        let items = unsafe { (*self.repr()?).items };
        if items.is_null() {
            return Ok(None);
        }
        Ok(Some(self.mm.addr(items)? as *mut PPtr))
    }

    pub fn len(&self) -> Result<u32> {
        Ok(unsafe { (*self.repr()?).base.size } as u32)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn allocated(&self) -> Result<u64> {
        Ok(unsafe { (*self.repr()?).allocated })
    }

    /// Write `value` at `index`, growing the items block as needed.
    ///
    /// Inside a transaction the touched slot (and length word) are
    /// snapshotted per `flag`. Outside one, a tag-preserving overwrite
    /// updates only the offset word in place and persists it; a tag change
    /// falls back to a short transaction.
    pub fn set(&self, index: u32, value: PPtr, flag: SnapshotFlag) -> Result<()> {
        if index == u32::MAX {
            return Err(Error::InvalidArgument);
        }
        if index as u64 + 1 > self.allocated()? {
            self.resize(index + 1)?;
        }
        let repr = self.repr()?;
        let items = self
            .items()?
            .ok_or_else(|| Error::Corrupt("array items missing after resize".into()))?;
        let slot = unsafe { items.add(index as usize) };

        if self.mm.in_transaction() {
            let tx = self.mm.tx_scope()?;
            unsafe {
                if flag == SnapshotFlag::Snapshot {
                    self.mm.snapshot(slot as *const u8, size_of::<PPtr>())?;
                }
                *slot = value;
                if index as u64 + 1 > (*repr).base.size {
                    if flag == SnapshotFlag::Snapshot {
                        self.mm
                            .snapshot(&(*repr).base.size as *const u64 as *const u8, 8)?;
                    }
                    (*repr).base.size = index as u64 + 1;
                }
            }
            tx.commit()
        } else {
            unsafe {
                if (*slot).tag != value.tag {
                    let tx = self.mm.tx_scope()?;
                    self.mm.snapshot(slot as *const u8, size_of::<PPtr>())?;
                    *slot = value;
                    tx.commit()?;
                } else {
                    (*slot).off = value.off;
                    self.mm
                        .persist(&(*slot).off as *const u64 as *const u8, 8)?;
                }
                if index as u64 + 1 > (*repr).base.size {
                    (*repr).base.size = index as u64 + 1;
                    self.mm
                        .persist(&(*repr).base.size as *const u64 as *const u8, 8)?;
                }
            }
            Ok(())
        }
    }

    /// `items[index]`, or `UNDEFINED` past the length.
    pub fn get(&self, index: u32) -> Result<PPtr> {
        if index >= self.len()? {
            return Ok(PPTR_UNDEFINED);
        }
        let items = self
            .items()?
            .ok_or_else(|| Error::Corrupt("array length exceeds items block".into()))?;
        Ok(unsafe { *items.add(index as usize) })
    }

    /// Overwrite with `UNDEFINED`; never shrinks.
    pub fn del(&self, index: u32, flag: SnapshotFlag) -> Result<()> {
        if index < self.len()? {
            self.set(index, PPTR_UNDEFINED, flag)?;
        }
        Ok(())
    }

    /// Indices in `[0, len)` whose slot is occupied. `UNDEFINED` counts as
    /// present; only never-written slots are skipped.
    pub fn valid_indices(&self) -> Result<Vec<u32>> {
        let len = self.len()?;
        let mut out = Vec::new();
        if len == 0 {
            return Ok(out);
        }
        let items = self
            .items()?
            .ok_or_else(|| Error::Corrupt("array length exceeds items block".into()))?;
        for i in 0..len {
            if unsafe { *items.add(i as usize) } != PPTR_NULL {
                out.push(i);
            }
        }
        Ok(out)
    }

    pub fn push(&self, value: PPtr, flag: SnapshotFlag) -> Result<()> {
        let index = self.len()?;
        self.set(index, value, flag)
    }

    /// Remove and return the last slot, shrinking the array.
    pub fn pop(&self) -> Result<PPtr> {
        let len = self.len()?;
        if len == 0 {
            return Ok(PPTR_UNDEFINED);
        }
        let items = self
            .items()?
            .ok_or_else(|| Error::Corrupt("array length exceeds items block".into()))?;
        let value = unsafe { *items.add(len as usize - 1) };
        let tx = self.mm.tx_scope()?;
        self.resize(len - 1)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn set_len(&self, new_length: u32) -> Result<()> {
        self.resize(new_length)
    }

    /// Free the items block and the array head. The view is dead afterwards.
    pub fn deallocate(&self) -> Result<()> {
        let tx = self.mm.tx_scope()?;
        let items = unsafe { (*self.repr()?).items };
        self.mm.free(items)?;
        self.mm.free(self.pptr)?;
        tx.commit()
    }

    /// Promotion guard: a write at `index` should switch this array to the
    /// number-dictionary representation when the index leaves a gap larger
    /// than [`ARRAY_MAX_GAP`], or the grown capacity passes
    /// [`ARRAY_MAX_UNCHECK`] while the dictionary rendition would take less
    /// than a third of the space.
    pub fn should_convert_to_numdict(&self, index: u32) -> Result<bool> {
        let allocated = self.allocated()?;
        if (index as u64) < allocated {
            return Ok(false);
        }
        if index as u64 - allocated > ARRAY_MAX_GAP {
            return Ok(true);
        }
        let new_allocated = array_overallocate(index as u64 + 1);
        if new_allocated < ARRAY_MAX_UNCHECK {
            return Ok(false);
        }
        let array_space = new_allocated * size_of::<PPtr>() as u64;
        let dict_space = allocated * size_of::<NumDictEntry>() as u64;
        Ok(dict_space * ARRAY_ELEMENTS_SIZE_FACTOR < array_space)
    }

    /// Copy every occupied slot into a fresh number dictionary and free
    /// this array's blocks. The receiver must be discarded afterwards.
    pub fn convert_to_numdict(&self) -> Result<NumDict<'p>> {
        debug!("converting simple array {:?} to numdict", self.pptr);
        let dict = NumDict::create(self.mm)?;
        let tx = self.mm.tx_scope()?;
        let len = self.len()?;
        if let Some(items) = self.items()? {
            for i in 0..len {
                let v = unsafe { *items.add(i as usize) };
                if v != PPTR_NULL {
                    dict.set(i, v, SnapshotFlag::Snapshot)?;
                }
            }
        }
        let items = unsafe { (*self.repr()?).items };
        self.mm.free(items)?;
        self.mm.free(self.pptr)?;
        tx.commit()?;
        Ok(dict)
    }

    /// Grow or shrink to `new_size` slots. Within half the current capacity
    /// the items block is kept and trailing slots are zeroed; otherwise the
    /// block is reallocated with the over-allocation ramp.
    fn resize(&self, new_size: u32) -> Result<()> {
        let repr = self.repr()?;
        let allocated = self.allocated()?;
        let ns = new_size as u64;

        if allocated >= ns && ns >= (allocated >> 1) {
            let tx = self.mm.tx_scope()?;
            unsafe {
                self.mm
                    .snapshot(&(*repr).base.size as *const u64 as *const u8, 8)?;
                (*repr).base.size = ns;
                if let Some(items) = self.items()? {
                    let tail = items.add(new_size as usize);
                    let bytes = (allocated - ns) as usize * size_of::<PPtr>();
                    core::ptr::write_bytes(tail as *mut u8, 0, bytes);
                    if bytes > 0 {
                        self.mm.persist(tail as *const u8, bytes)?;
                    }
                }
            }
            return tx.commit();
        }

        let new_allocated = array_overallocate(ns);
        let tx = self.mm.tx_scope()?;
        let old_items = unsafe { (*repr).items };
        let new_items = self.mm.tx_zrealloc(
            old_items,
            new_allocated * size_of::<PPtr>() as u64,
            TN_ARRAY_ITEMS,
        )?;
        unsafe {
            self.mm
                .snapshot(repr as *const u8, size_of::<ArrayRepr>())?;
            (*repr).items = new_items;
            (*repr).base.size = ns;
            (*repr).allocated = new_allocated;
        }
        tx.commit()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Number dictionary
// ─────────────────────────────────────────────────────────────────────────────

/// Sparse integer-keyed open-addressed hash table. Length is one past the
/// largest key ever inserted until explicitly shortened.
pub struct NumDict<'p> {
    mm: &'p MemoryManager,
    pptr: PPtr,
}

impl<'p> NumDict<'p> {
    /// Allocate an empty dictionary with the initial keys table.
    pub fn create(mm: &'p MemoryManager) -> Result<NumDict<'p>> {
        let tx = mm.tx_scope()?;
        let pptr = mm.tx_zalloc(size_of::<NumDictRepr>() as u64, TN_OBJECT)?;
        let repr = mm.addr(pptr)? as *mut NumDictRepr;
        unsafe {
            (*repr).base.base.type_code = TypeCode::NumDict as u64;
            (*repr).keys = Self::new_keys(mm, MIN_SIZE_COMBINED)?;
        }
        tx.commit()?;
        debug!("numdict created at {:?}", pptr);
        Ok(NumDict { mm, pptr })
    }

    /// View an existing dictionary block. The caller vouches for the type
    /// code.
    pub fn attach(mm: &'p MemoryManager, pptr: PPtr) -> NumDict<'p> {
        NumDict { mm, pptr }
    }

    #[inline]
    pub fn pptr(&self) -> PPtr {
        self.pptr
    }

    fn repr(&self) -> Result<*mut NumDictRepr> {
        Ok(self.mm.addr(self.pptr)? as *mut NumDictRepr)
    }

    fn keys_repr(&self) -> Result<*mut NumKeysRepr> {
        let keys = unsafe { (*self.repr()?).keys };
        Ok(self.mm.addr(keys)? as *mut NumKeysRepr)
    }

    fn entries(keys: *mut NumKeysRepr) -> *mut NumDictEntry {
        unsafe { (keys as *mut u8).add(size_of::<NumKeysRepr>()) as *mut NumDictEntry }
    }

    /// Identity: a 32-bit key is its own 64-bit hash.
    #[inline]
    fn fixed_hash(key: u32) -> u64 {
        key as u64
    }

    pub fn len(&self) -> Result<u32> {
        Ok(unsafe { (*self.repr()?).base.size } as u32)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(unsafe { (*self.repr()?).used } == 0)
    }

    pub fn used(&self) -> Result<u64> {
        Ok(unsafe { (*self.repr()?).used })
    }

    /// Keys-table capacity.
    pub fn allocated(&self) -> Result<u64> {
        Ok(unsafe { (*self.keys_repr()?).size })
    }

    /// Insert or overwrite `key`.
    pub fn set(&self, key: u32, value: PPtr, flag: SnapshotFlag) -> Result<()> {
        if key == u32::MAX {
            return Err(Error::InvalidArgument);
        }
        let khash = Self::fixed_hash(key);
        let mut ep = self.lookup(key, khash)?;
        let tx = self.mm.tx_scope()?;
        unsafe {
            if !(*ep).value.is_null() {
                debug_assert_eq!((*ep).state, ENTRY_FULL);
                if flag == SnapshotFlag::Snapshot {
                    self.mm
                        .snapshot(&(*ep).value as *const PPtr as *const u8, size_of::<PPtr>())?;
                }
                (*ep).value = value;
            } else {
                if flag == SnapshotFlag::Snapshot {
                    self.mm.snapshot(ep as *const u8, size_of::<NumDictEntry>())?;
                }
                match (*ep).state {
                    ENTRY_EMPTY => {
                        if (*self.keys_repr()?).usable <= 0 {
                            self.insertion_resize()?;
                        }
                        ep = self.find_empty_slot(khash)?;
                        let keys = self.keys_repr()?;
                        if flag == SnapshotFlag::Snapshot {
                            self.mm
                                .snapshot(&(*keys).usable as *const i64 as *const u8, 8)?;
                        }
                        (*keys).usable -= 1;
                        debug_assert!((*keys).usable >= 0);
                        (*ep).key = key;
                        (*ep).hash = khash;
                        (*ep).state = ENTRY_FULL;
                    }
                    ENTRY_DUMMY => {
                        // Tombstone reuse: the slot was already charged
                        // against `usable` when first filled.
                        (*ep).key = key;
                        (*ep).hash = khash;
                        (*ep).state = ENTRY_FULL;
                    }
                    _ => return Err(Error::InvalidArgument),
                }
                let repr = self.repr()?;
                if (*repr).base.size < key as u64 + 1 {
                    if flag == SnapshotFlag::Snapshot {
                        self.mm
                            .snapshot(&(*repr).base.size as *const u64 as *const u8, 8)?;
                    }
                    (*repr).base.size = key as u64 + 1;
                }
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

    /// Value at `key`, or `UNDEFINED` when the key is absent, tombstoned,
    /// or at/past the length.
    pub fn get(&self, key: u32) -> Result<PPtr> {
        if key >= self.len()? {
            return Ok(PPTR_UNDEFINED);
        }
        let ep = self.lookup(key, Self::fixed_hash(key))?;
        unsafe {
            if (*ep).state != ENTRY_FULL {
                return Ok(PPTR_UNDEFINED);
            }
            Ok((*ep).value)
        }
    }

    /// Tombstone `key`. The entry keeps forwarding probes; no rehash.
    pub fn del(&self, key: u32, flag: SnapshotFlag) -> Result<()> {
        if key >= self.len()? {
            return Ok(());
        }
        self.del_unchecked(key, flag)
    }

    fn del_unchecked(&self, key: u32, flag: SnapshotFlag) -> Result<()> {
        let ep = self.lookup(key, Self::fixed_hash(key))?;
        if unsafe { (*ep).state } != ENTRY_FULL {
            return Ok(());
        }
        let tx = self.mm.tx_scope()?;
        unsafe {
            if flag == SnapshotFlag::Snapshot {
                self.mm.snapshot(ep as *const u8, size_of::<NumDictEntry>())?;
            }
            (*ep).value = PPTR_NULL;
            (*ep).state = ENTRY_DUMMY;
            let repr = self.repr()?;
            if flag == SnapshotFlag::Snapshot {
                self.mm
                    .snapshot(&(*repr).used as *const u64 as *const u8, 8)?;
            }
            (*repr).used -= 1;
        }
        tx.commit()
    }

    /// Keys of full entries, in table order.
    pub fn valid_indices(&self) -> Result<Vec<u32>> {
        let keys = self.keys_repr()?;
        let size = unsafe { (*keys).size };
        let ep0 = Self::entries(keys);
        let mut out = Vec::new();
        for i in 0..size {
            unsafe {
                let ep = ep0.add(i as usize);
                if (*ep).state == ENTRY_FULL {
                    out.push((*ep).key);
                }
            }
        }
        Ok(out)
    }

    /// Values of full entries, in table order. Collector traversal.
    pub(super) fn full_values(&self) -> Result<Vec<PPtr>> {
        let keys = self.keys_repr()?;
        let size = unsafe { (*keys).size };
        let ep0 = Self::entries(keys);
        let mut out = Vec::new();
        for i in 0..size {
            unsafe {
                let ep = ep0.add(i as usize);
                if (*ep).state == ENTRY_FULL {
                    out.push((*ep).value);
                }
            }
        }
        Ok(out)
    }

    pub fn push(&self, value: PPtr, flag: SnapshotFlag) -> Result<()> {
        let index = self.len()?;
        self.set(index, value, flag)
    }

    /// Remove and return the entry at `len - 1`, shrinking the length.
    pub fn pop(&self) -> Result<PPtr> {
        let len = self.len()?;
        if len == 0 {
            return Ok(PPTR_UNDEFINED);
        }
        let key = len - 1;
        let ep = self.lookup(key, Self::fixed_hash(key))?;
        if unsafe { (*ep).state } == ENTRY_EMPTY {
            return Ok(PPTR_UNDEFINED);
        }
        let tx = self.mm.tx_scope()?;
        let out = unsafe {
            self.mm.snapshot(ep as *const u8, size_of::<NumDictEntry>())?;
            let repr = self.repr()?;
            self.mm
                .snapshot(repr as *const u8, size_of::<NumDictRepr>())?;
            let out = if (*ep).state == ENTRY_FULL {
                let v = (*ep).value;
                (*ep).value = PPTR_NULL;
                (*ep).state = ENTRY_DUMMY;
                (*repr).used -= 1;
                v
            } else {
                PPTR_UNDEFINED
            };
            (*repr).base.size = len as u64 - 1;
            out
        };
        tx.commit()?;
        Ok(out)
    }

    /// Write the new length; shrinking deletes every key in
    /// `[new_length, len)` first.
    pub fn set_len(&self, new_length: u32) -> Result<()> {
        let len = self.len()?;
        if len == new_length {
            return Ok(());
        }
        let tx = self.mm.tx_scope()?;
        if new_length < len {
            for i in new_length..len {
                self.del_unchecked(i, SnapshotFlag::Snapshot)?;
            }
        }
        let repr = self.repr()?;
        unsafe {
            self.mm
                .snapshot(&(*repr).base.size as *const u64 as *const u8, 8)?;
            (*repr).base.size = new_length as u64;
        }
        tx.commit()
    }

    /// Free the keys table and the dictionary head.
    pub fn deallocate(&self) -> Result<()> {
        let tx = self.mm.tx_scope()?;
        let keys = unsafe { (*self.repr()?).keys };
        self.mm.free(keys)?;
        self.mm.free(self.pptr)?;
        tx.commit()
    }

    /// Demotion guard: a write at `key` should switch back to the dense
    /// representation when the key is small enough and the keys table
    /// occupies at least half of what the dense items block would.
    pub fn should_convert_to_simple_array(&self, key: u32) -> Result<bool> {
        if key > SMI_MAX {
            return Ok(false);
        }
        let length = self.len()? as u64;
        let allocated = self.allocated()?;
        let new_length = length.max(key as u64 + 1);
        let array_space = array_overallocate(new_length) * size_of::<PPtr>() as u64;
        let dict_space = allocated * size_of::<NumDictEntry>() as u64;
        Ok(dict_space >= array_space >> 1)
    }

    /// Copy every full entry into a fresh simple array and free this
    /// dictionary's blocks. The receiver must be discarded afterwards.
    pub fn convert_to_simple_array(&self) -> Result<SimpleArray<'p>> {
        debug!("converting numdict {:?} to simple array", self.pptr);
        let arr = SimpleArray::create(self.mm)?;
        let tx = self.mm.tx_scope()?;
        let size = self.len()?;
        if size > 0 {
            // Largest index first: a single items allocation, and the
            // freshly allocated block needs no per-slot snapshots.
            arr.set(size - 1, PPTR_UNDEFINED, SnapshotFlag::NoSnapshot)?;
            let items = arr
                .items()?
                .ok_or_else(|| Error::Corrupt("fresh array has no items block".into()))?;
            let keys = self.keys_repr()?;
            let n = unsafe { (*keys).size };
            let ep0 = Self::entries(keys);
            for i in 0..n {
                unsafe {
                    let ep = ep0.add(i as usize);
                    if (*ep).state == ENTRY_FULL && ((*ep).key as u64) < size as u64 {
                        *items.add((*ep).key as usize) = (*ep).value;
                    }
                }
            }
        }
        let keys = unsafe { (*self.repr()?).keys };
        self.mm.free(keys)?;
        self.mm.free(self.pptr)?;
        tx.commit()?;
        Ok(arr)
    }

    /// Probe for `key`: the matching full entry, else the first tombstone
    /// on the chain, else the terminating empty slot.
    fn lookup(&self, key: u32, khash: u64) -> Result<*mut NumDictEntry> {
        let keys = self.keys_repr()?;
        let mask = unsafe { (*keys).size } - 1;
        let ep0 = Self::entries(keys);
        let mut idx = khash & mask;
        unsafe {
            let mut ep = ep0.add(idx as usize);
            let mut freeslot = match (*ep).state {
                ENTRY_EMPTY => return Ok(ep),
                ENTRY_DUMMY => Some(ep),
                _ => {
                    if (*ep).key == key {
                        return Ok(ep);
                    }
                    None
                }
            };
            let mut perturb = khash;
            loop {
                idx = idx
                    .wrapping_mul(5)
                    .wrapping_add(perturb)
                    .wrapping_add(1);
                ep = ep0.add((idx & mask) as usize);
                match (*ep).state {
                    ENTRY_EMPTY => return Ok(freeslot.unwrap_or(ep)),
                    ENTRY_DUMMY => {
                        if freeslot.is_none() {
                            freeslot = Some(ep);
                        }
                    }
                    _ => {
                        if (*ep).key == key {
                            return Ok(ep);
                        }
                    }
                }
                perturb >>= PERTURB_SHIFT;
            }
        }
    }

    /// First empty slot on the probe chain; skips tombstones.
    fn find_empty_slot(&self, khash: u64) -> Result<*mut NumDictEntry> {
        let keys = self.keys_repr()?;
        let mask = unsafe { (*keys).size } - 1;
        let ep0 = Self::entries(keys);
        let mut idx = khash & mask;
        let mut perturb = khash;
        unsafe {
            let mut ep = ep0.add(idx as usize);
            while (*ep).state != ENTRY_EMPTY {
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
        let used = self.used()?;
        let size = self.allocated()?;
        Ok(used * 2 + (size >> 1))
    }

    /// Move every full entry into a larger table; the freshly allocated
    /// table needs no snapshots, only the keys pointer swap does.
    fn insertion_resize(&self) -> Result<()> {
        let minused = self.grow_rate()?;
        let mut newsize = MIN_SIZE_COMBINED;
        while newsize <= minused && newsize > 0 {
            newsize <<= 1;
        }
        debug!("numdict {:?} resizing keys table to {}", self.pptr, newsize);
        let repr = self.repr()?;
        let old_keys_pptr = unsafe { (*repr).keys };
        let old_keys = self.mm.addr(old_keys_pptr)? as *mut NumKeysRepr;

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
                    debug_assert_eq!((*old_ep).state, ENTRY_FULL);
                    let new_ep = self.find_empty_slot((*old_ep).hash)?;
                    (*new_ep).key = (*old_ep).key;
                    (*new_ep).state = (*old_ep).state;
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

    /// Allocate a zeroed keys table of `size` slots (zero is the empty
    /// entry state).
    fn new_keys(mm: &MemoryManager, size: u64) -> Result<PPtr> {
        debug_assert!(size > MIN_SIZE_SPLIT);
        debug_assert!(size.is_power_of_two());
        let tx = mm.tx_scope()?;
        let bytes =
            size_of::<NumKeysRepr>() as u64 + size * size_of::<NumDictEntry>() as u64;
        let pptr = mm.tx_zalloc(bytes, TN_NUM_DICT_KEYS)?;
        let keys = mm.addr(pptr)? as *mut NumKeysRepr;
        unsafe {
            (*keys).size = size;
            (*keys).usable = usable_fraction(size) as i64;
        }
        tx.commit()?;
        Ok(pptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::MIN_POOL_SIZE;
    use crate::pptr::PPTR_TRUE;
    use tempfile::tempdir;

    fn fresh(dir: &tempfile::TempDir) -> MemoryManager {
        MemoryManager::create(&dir.path().join("t.pool"), "array-tests", MIN_POOL_SIZE, 0o600)
            .unwrap()
    }

    fn num(v: f64) -> PPtr {
        PPtr::from_f64(v)
    }

    #[test]
    fn array_set_get_grows_length() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let arr = SimpleArray::create(&mm).unwrap();
        assert_eq!(arr.len().unwrap(), 0);
        assert_eq!(arr.get(0).unwrap(), PPTR_UNDEFINED);

        arr.set(0, num(1.0), SnapshotFlag::Snapshot).unwrap();
        arr.set(4, num(5.0), SnapshotFlag::Snapshot).unwrap();
        assert_eq!(arr.len().unwrap(), 5);
        assert_eq!(arr.get(0).unwrap(), num(1.0));
        assert_eq!(arr.get(4).unwrap(), num(5.0));
        // Unwritten slots inside the length read as null, exposed as such.
        assert_eq!(arr.get(2).unwrap(), PPTR_NULL);
        assert_eq!(arr.get(100).unwrap(), PPTR_UNDEFINED);
    }

    #[test]
    fn array_valid_indices_skip_holes_but_not_undefined() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let arr = SimpleArray::create(&mm).unwrap();
        arr.set(0, num(0.0), SnapshotFlag::Snapshot).unwrap();
        arr.set(3, num(3.0), SnapshotFlag::Snapshot).unwrap();
        arr.del(0, SnapshotFlag::Snapshot).unwrap();
        assert_eq!(arr.valid_indices().unwrap(), vec![0, 3]);
        assert_eq!(arr.get(0).unwrap(), PPTR_UNDEFINED);
    }

    #[test]
    fn array_push_pop() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let arr = SimpleArray::create(&mm).unwrap();
        for i in 0..10 {
            arr.push(num(i as f64), SnapshotFlag::Snapshot).unwrap();
        }
        assert_eq!(arr.len().unwrap(), 10);
        assert_eq!(arr.pop().unwrap(), num(9.0));
        assert_eq!(arr.len().unwrap(), 9);
        let empty = SimpleArray::create(&mm).unwrap();
        assert_eq!(empty.pop().unwrap(), PPTR_UNDEFINED);
    }

    #[test]
    fn array_resize_keeps_contents_within_capacity() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let arr = SimpleArray::create(&mm).unwrap();
        for i in 0..8 {
            arr.set(i, num(i as f64), SnapshotFlag::Snapshot).unwrap();
        }
        arr.set_len(4).unwrap();
        assert_eq!(arr.len().unwrap(), 4);
        assert_eq!(arr.get(3).unwrap(), num(3.0));
        arr.set_len(6).unwrap();
        // Slots reexposed by growing read as null (they were zeroed).
        assert_eq!(arr.get(5).unwrap(), PPTR_NULL);
    }

    #[test]
    fn array_promotion_guard() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let arr = SimpleArray::create(&mm).unwrap();
        arr.set(0, num(0.0), SnapshotFlag::Snapshot).unwrap();
        assert!(!arr.should_convert_to_numdict(1).unwrap());
        // A gap beyond ARRAY_MAX_GAP past the capacity trips the guard.
        let far = arr.allocated().unwrap() as u32 + ARRAY_MAX_GAP as u32 + 1;
        assert!(arr.should_convert_to_numdict(far).unwrap());
    }

    #[test]
    fn array_converts_to_numdict_preserving_values() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let arr = SimpleArray::create(&mm).unwrap();
        for i in 0..5 {
            arr.set(i, num(i as f64 * 10.0), SnapshotFlag::Snapshot).unwrap();
        }
        arr.del(2, SnapshotFlag::Snapshot).unwrap();
        let dict = arr.convert_to_numdict().unwrap();
        assert_eq!(dict.len().unwrap(), 5);
        assert_eq!(dict.get(1).unwrap(), num(10.0));
        assert_eq!(dict.get(2).unwrap(), PPTR_UNDEFINED);
        assert_eq!(dict.get(4).unwrap(), num(40.0));
    }

    #[test]
    fn numdict_set_get_del() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let d = NumDict::create(&mm).unwrap();
        d.set(7, num(7.0), SnapshotFlag::Snapshot).unwrap();
        d.set(10_000, PPTR_TRUE, SnapshotFlag::Snapshot).unwrap();
        assert_eq!(d.len().unwrap(), 10_001);
        assert_eq!(d.used().unwrap(), 2);
        assert_eq!(d.get(7).unwrap(), num(7.0));
        assert_eq!(d.get(10_000).unwrap(), PPTR_TRUE);
        assert_eq!(d.get(8).unwrap(), PPTR_UNDEFINED);

        d.del(7, SnapshotFlag::Snapshot).unwrap();
        assert_eq!(d.get(7).unwrap(), PPTR_UNDEFINED);
        assert_eq!(d.used().unwrap(), 1);
        // Length keeps the high-water mark after deletion.
        assert_eq!(d.len().unwrap(), 10_001);
    }

    #[test]
    fn numdict_overwrite_keeps_used_stable() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let d = NumDict::create(&mm).unwrap();
        d.set(1, num(1.0), SnapshotFlag::Snapshot).unwrap();
        d.set(1, num(2.0), SnapshotFlag::Snapshot).unwrap();
        assert_eq!(d.used().unwrap(), 1);
        assert_eq!(d.get(1).unwrap(), num(2.0));
    }

    #[test]
    fn numdict_grows_past_usable_fraction() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let d = NumDict::create(&mm).unwrap();
        for i in 0..100 {
            d.set(i, num(i as f64), SnapshotFlag::Snapshot).unwrap();
        }
        assert_eq!(d.used().unwrap(), 100);
        assert!(d.allocated().unwrap() >= 128);
        assert!(d.allocated().unwrap().is_power_of_two());
        for i in 0..100 {
            assert_eq!(d.get(i).unwrap(), num(i as f64));
        }
    }

    #[test]
    fn numdict_tombstone_slot_is_reused() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let d = NumDict::create(&mm).unwrap();
        d.set(3, num(3.0), SnapshotFlag::Snapshot).unwrap();
        let cap_before = d.allocated().unwrap();
        let used_before = d.used().unwrap();

        d.del(3, SnapshotFlag::Snapshot).unwrap();
        d.set(3, num(33.0), SnapshotFlag::Snapshot).unwrap();

        assert_eq!(d.get(3).unwrap(), num(33.0));
        assert_eq!(d.used().unwrap(), used_before);
        // Reuse must not have consumed capacity.
        assert_eq!(d.allocated().unwrap(), cap_before);
    }

    #[test]
    fn numdict_pop_and_set_len() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let d = NumDict::create(&mm).unwrap();
        for i in 0..5 {
            d.set(i, num(i as f64), SnapshotFlag::Snapshot).unwrap();
        }
        assert_eq!(d.pop().unwrap(), num(4.0));
        assert_eq!(d.len().unwrap(), 4);
        assert_eq!(d.used().unwrap(), 4);

        d.set_len(2).unwrap();
        assert_eq!(d.len().unwrap(), 2);
        assert_eq!(d.used().unwrap(), 2);
        assert_eq!(d.get(3).unwrap(), PPTR_UNDEFINED);
        assert_eq!(d.get(1).unwrap(), num(1.0));
    }

    #[test]
    fn numdict_demotion_guard_fires_when_dense() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let d = NumDict::create(&mm).unwrap();
        for i in 0..5 {
            d.set(i, num(i as f64), SnapshotFlag::Snapshot).unwrap();
        }
        assert!(d.should_convert_to_simple_array(5).unwrap());
        // A huge key disqualifies the dense rendition outright.
        assert!(!d.should_convert_to_simple_array(u32::MAX - 1).unwrap());
    }

    #[test]
    fn numdict_converts_to_simple_array() {
        let dir = tempdir().unwrap();
        let mm = fresh(&dir);
        let d = NumDict::create(&mm).unwrap();
        for i in 0..5 {
            d.set(i, num(i as f64), SnapshotFlag::Snapshot).unwrap();
        }
        d.del(2, SnapshotFlag::Snapshot).unwrap();
        let arr = d.convert_to_simple_array().unwrap();
        assert_eq!(arr.len().unwrap(), 5);
        assert_eq!(arr.get(0).unwrap(), num(0.0));
        assert_eq!(arr.get(4).unwrap(), num(4.0));
        // The deleted key comes back as an empty slot.
        assert_eq!(arr.get(2).unwrap(), PPTR_NULL);
    }
}
