//! Composite persistent object: an indexed elements container fused with a
//! string-keyed extra-props dictionary, plus an array flag.
//!
//! The elements container is polymorphic: dense writes live in a simple
//! array, sparse ones in a number dictionary. Before every indexed write
//! the promotion/demotion guard of the current representation is evaluated;
//! when it fires, the replacement container is built, every valid entry
//! moved, and the elements pointer swapped, all inside one transaction.

use core::mem::size_of;

use log::debug;

use crate::error::{Error, Result};
use crate::pptr::PPtr;

use super::array::{NumDict, SimpleArray};
use super::dict::StringDict;
use super::memory::{MemoryManager, SnapshotFlag};
use super::types::{CompositeRepr, TypeCode, TN_OBJECT};

/// The two concrete representations of the indexed elements container.
pub enum Elements<'p> {
    Array(SimpleArray<'p>),
    NumDict(NumDict<'p>),
}

impl<'p> Elements<'p> {
    pub fn pptr(&self) -> PPtr {
        match self {
            Elements::Array(a) => a.pptr(),
            Elements::NumDict(d) => d.pptr(),
        }
    }

    pub fn set(&self, index: u32, value: PPtr, flag: SnapshotFlag) -> Result<()> {
        match self {
            Elements::Array(a) => a.set(index, value, flag),
            Elements::NumDict(d) => d.set(index, value, flag),
        }
    }

    pub fn get(&self, index: u32) -> Result<PPtr> {
        match self {
            Elements::Array(a) => a.get(index),
            Elements::NumDict(d) => d.get(index),
        }
    }

    pub fn del(&self, index: u32, flag: SnapshotFlag) -> Result<()> {
        match self {
            Elements::Array(a) => a.del(index, flag),
            Elements::NumDict(d) => d.del(index, flag),
        }
    }

    pub fn len(&self) -> Result<u32> {
        match self {
            Elements::Array(a) => a.len(),
            Elements::NumDict(d) => d.len(),
        }
    }

    pub fn set_len(&self, new_length: u32) -> Result<()> {
        match self {
            Elements::Array(a) => a.set_len(new_length),
            Elements::NumDict(d) => d.set_len(new_length),
        }
    }

    pub fn push(&self, value: PPtr, flag: SnapshotFlag) -> Result<()> {
        match self {
            Elements::Array(a) => a.push(value, flag),
            Elements::NumDict(d) => d.push(value, flag),
        }
    }

    pub fn pop(&self) -> Result<PPtr> {
        match self {
            Elements::Array(a) => a.pop(),
            Elements::NumDict(d) => d.pop(),
        }
    }

    pub fn valid_indices(&self) -> Result<Vec<u32>> {
        match self {
            Elements::Array(a) => a.valid_indices(),
            Elements::NumDict(d) => d.valid_indices(),
        }
    }

    /// True when the container currently uses the dense representation.
    pub fn is_dense(&self) -> bool {
        matches!(self, Elements::Array(_))
    }
}

/// A pool-resident composite object.
pub struct PmObject<'p> {
    mm: &'p MemoryManager,
    pptr: PPtr,
    elements: Elements<'p>,
    extra_props: StringDict<'p>,
}

impl<'p> PmObject<'p> {
    /// Create an empty object (dense elements, empty extra-props) inside
    /// one transaction.
    pub fn create(mm: &'p MemoryManager, is_array: bool) -> Result<PmObject<'p>> {
        let tx = mm.tx_scope()?;
        let pptr = mm.tx_zalloc(size_of::<CompositeRepr>() as u64, TN_OBJECT)?;
        let repr = mm.addr(pptr)? as *mut CompositeRepr;
        let extra_props = StringDict::create(mm)?;
        let elements = SimpleArray::create(mm)?;
        unsafe {
            (*repr).base.type_code = TypeCode::Object as u64;
            (*repr).extra_props = extra_props.pptr();
            (*repr).elements = elements.pptr();
            (*repr).is_array = is_array as u64;
        }
        tx.commit()?;
        debug!("composite object created at {:?} (array: {is_array})", pptr);
        Ok(PmObject {
            mm,
            pptr,
            elements: Elements::Array(elements),
            extra_props,
        })
    }

    /// Attach to an existing composite block, dispatching on the concrete
    /// type of its elements container.
    pub fn attach(mm: &'p MemoryManager, pptr: PPtr) -> Result<PmObject<'p>> {
        if mm.type_code(pptr)? != TypeCode::Object {
            return Err(Error::InvalidArgument);
        }
        let repr = mm.addr(pptr)? as *const CompositeRepr;
        let (elements_pptr, extra_pptr) = unsafe { ((*repr).elements, (*repr).extra_props) };
        let elements = match mm.type_code(elements_pptr)? {
            TypeCode::Array => Elements::Array(SimpleArray::attach(mm, elements_pptr)),
            TypeCode::NumDict => Elements::NumDict(NumDict::attach(mm, elements_pptr)),
            other => {
                return Err(Error::Corrupt(format!(
                    "elements container has type code {other:?}"
                )))
            }
        };
        if mm.type_code(extra_pptr)? != TypeCode::Dict {
            return Err(Error::Corrupt("extra-props block is not a dictionary".into()));
        }
        Ok(PmObject {
            mm,
            pptr,
            elements,
            extra_props: StringDict::attach(mm, extra_pptr),
        })
    }

    #[inline]
    pub fn pptr(&self) -> PPtr {
        self.pptr
    }

    fn repr(&self) -> Result<*mut CompositeRepr> {
        Ok(self.mm.addr(self.pptr)? as *mut CompositeRepr)
    }

    /// Set a string-keyed property.
    pub fn set(&self, key: &str, value: PPtr, flag: SnapshotFlag) -> Result<()> {
        self.extra_props.set(key, value, flag)
    }

    /// Set an indexed property, switching the elements representation first
    /// when the guard of the current one fires.
    pub fn set_at(&mut self, index: u32, value: PPtr, flag: SnapshotFlag) -> Result<()> {
        let promote = match &self.elements {
            Elements::Array(a) => a.should_convert_to_numdict(index)?,
            Elements::NumDict(_) => false,
        };
        if promote {
            self.promote()?;
        } else {
            let demote = match &self.elements {
                Elements::NumDict(d) => d.should_convert_to_simple_array(index)?,
                Elements::Array(_) => false,
            };
            if demote {
                self.demote()?;
            }
        }
        self.elements.set(index, value, flag)
    }

    pub fn get(&self, key: &str) -> Result<PPtr> {
        self.extra_props.get(key)
    }

    pub fn get_at(&self, index: u32) -> Result<PPtr> {
        self.elements.get(index)
    }

    pub fn del(&self, key: &str, flag: SnapshotFlag) -> Result<()> {
        self.extra_props.del(key, flag)
    }

    pub fn del_at(&self, index: u32, flag: SnapshotFlag) -> Result<()> {
        self.elements.del(index, flag)
    }

    /// Property names: string keys first; array-flavoured objects append
    /// the literal `"length"` and then the stringified valid indices,
    /// matching host-language array introspection.
    pub fn property_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for key in self.extra_props.keys()? {
            names.push(self.mm.string_lossy(key)?);
        }
        if self.is_array()? {
            names.push("length".to_string());
            for index in self.elements.valid_indices()? {
                names.push(index.to_string());
            }
        }
        Ok(names)
    }

    pub fn valid_indices(&self) -> Result<Vec<u32>> {
        self.elements.valid_indices()
    }

    pub fn push(&self, value: PPtr, flag: SnapshotFlag) -> Result<()> {
        self.elements.push(value, flag)
    }

    pub fn pop(&self) -> Result<PPtr> {
        self.elements.pop()
    }

    pub fn is_array(&self) -> Result<bool> {
        Ok(unsafe { (*self.repr()?).is_array } != 0)
    }

    pub fn len(&self) -> Result<u32> {
        self.elements.len()
    }

    pub fn set_len(&self, new_length: u32) -> Result<()> {
        self.elements.set_len(new_length)
    }

    /// The current elements representation.
    pub fn elements(&self) -> &Elements<'p> {
        &self.elements
    }

    /// Free only this object's head block. Children are reclaimed by their
    /// own destructors; the collector drives them separately.
    pub fn deallocate(&self) -> Result<()> {
        let tx = self.mm.tx_scope()?;
        self.mm.free(self.pptr)?;
        tx.commit()
    }

    fn promote(&mut self) -> Result<()> {
        let tx = self.mm.tx_scope()?;
        let dict = match &self.elements {
            Elements::Array(a) => a.convert_to_numdict()?,
            Elements::NumDict(_) => return Err(Error::InvalidArgument),
        };
        let repr = self.repr()?;
        unsafe {
            self.mm
                .snapshot(&(*repr).elements as *const PPtr as *const u8, size_of::<PPtr>())?;
            (*repr).elements = dict.pptr();
        }
        self.elements = Elements::NumDict(dict);
        tx.commit()
    }

    fn demote(&mut self) -> Result<()> {
        let tx = self.mm.tx_scope()?;
        let arr = match &self.elements {
            Elements::NumDict(d) => d.convert_to_simple_array()?,
            Elements::Array(_) => return Err(Error::InvalidArgument),
        };
        let repr = self.repr()?;
        unsafe {
            self.mm
                .snapshot(&(*repr).elements as *const PPtr as *const u8, size_of::<PPtr>())?;
            (*repr).elements = arr.pptr();
        }
        self.elements = Elements::Array(arr);
        tx.commit()
    }
}
