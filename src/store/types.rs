//! On-pool value shapes, the type-code discriminator, the allocator
//! type-number registry, and the sizing constants shared by the containers.
//!
//! Every "object" heap block starts with an [`ObjectHead`] whose first word
//! is a [`TypeCode`]. Raw blocks (items arrays, keys tables) carry no head;
//! they are reached only through their owning container and are told apart
//! at the allocator level by their type number.

use crate::pptr::PPtr;

// ─────────────────────────────────────────────────────────────────────────────
// Allocator type numbers (block-level, distinct from in-head type codes)
// ─────────────────────────────────────────────────────────────────────────────

/// Headed object blocks: scalars, buffers, containers.
pub const TN_OBJECT: u64 = 20;
/// Reserved base for element containers.
pub const TN_ELEMENTS_BASE: u64 = 10;
/// Raw items array owned by a simple array.
pub const TN_ARRAY_ITEMS: u64 = 30;
/// Raw keys table owned by a string dictionary.
pub const TN_STRING_DICT_KEYS: u64 = 40;
/// Raw keys table owned by a number dictionary.
pub const TN_NUM_DICT_KEYS: u64 = 50;

// ─────────────────────────────────────────────────────────────────────────────
// In-head type codes
// ─────────────────────────────────────────────────────────────────────────────

/// Discriminator at offset 0 of every headed block. The `Singleton` and
/// `Number` values never appear in a head; they are reserved so the pointer
/// tag space and the type-code space stay congruent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TypeCode {
    Null = 0,
    String = 1,
    ArrayBuffer = 2,
    Singleton = 3,
    Number = 4,
    Object = 5,
    Dict = 6,
    Array = 7,
    NumDict = 8,
}

/// First invalid type-code value; anything at or above this is corruption.
pub const TYPE_CODE_INTERNAL_MAX: u64 = 9;

impl TypeCode {
    pub fn from_u64(v: u64) -> Option<TypeCode> {
        match v {
            0 => Some(TypeCode::Null),
            1 => Some(TypeCode::String),
            2 => Some(TypeCode::ArrayBuffer),
            3 => Some(TypeCode::Singleton),
            4 => Some(TypeCode::Number),
            5 => Some(TypeCode::Object),
            6 => Some(TypeCode::Dict),
            7 => Some(TypeCode::Array),
            8 => Some(TypeCode::NumDict),
            _ => None,
        }
    }

    /// Container types hold tagged pointers that the collector must trace.
    #[inline]
    pub fn is_container(self) -> bool {
        (self as u64) > TypeCode::Number as u64
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Block shapes
// ─────────────────────────────────────────────────────────────────────────────

/// Common head of every object block.
#[repr(C)]
pub struct ObjectHead {
    pub type_code: u64,
}

/// Head of variable-length containers; `size` is the exposed length.
#[repr(C)]
pub struct VarHead {
    pub base: ObjectHead,
    pub size: u64,
}

/// String object: head followed by NUL-terminated bytes.
#[repr(C)]
pub struct StringHead {
    pub base: ObjectHead,
}

/// Byte buffer: head, byte length, then the inline bytes.
#[repr(C)]
pub struct BufferHead {
    pub base: ObjectHead,
    pub len: u32,
    pub _pad: u32,
}

/// Simple array: dense items block plus its allocated capacity.
#[repr(C)]
pub struct ArrayRepr {
    pub base: VarHead,
    /// Raw run of tagged pointers, owned by this array. Null when empty.
    pub items: PPtr,
    pub allocated: u64,
}

/// Number dictionary: `size` in the var head is the length (one past the
/// largest key ever inserted), `used` counts full entries.
#[repr(C)]
pub struct NumDictRepr {
    pub base: VarHead,
    pub used: u64,
    pub keys: PPtr,
}

/// Entry states for the number dictionary.
pub const ENTRY_EMPTY: u32 = 0;
pub const ENTRY_DUMMY: u32 = 1;
pub const ENTRY_FULL: u32 = 2;

#[repr(C)]
pub struct NumDictEntry {
    pub hash: u64,
    pub state: u32,
    pub key: u32,
    pub value: PPtr,
}

/// Keys-table header for the number dictionary, followed inline by
/// `size` entries.
#[repr(C)]
pub struct NumKeysRepr {
    pub size: u64,
    pub usable: i64,
}

/// String dictionary head.
#[repr(C)]
pub struct DictRepr {
    pub base: ObjectHead,
    pub used: u64,
    pub keys: PPtr,
}

/// String-dictionary entry. Occupancy is signalled on the key pointer:
/// null means empty, dummy means tombstone, anything else points at the
/// persisted key string.
#[repr(C)]
pub struct DictEntry {
    pub hash: u64,
    pub key: PPtr,
    pub value: PPtr,
}

/// Keys-table header for the string dictionary, followed inline by
/// `size` entries.
#[repr(C)]
pub struct DictKeysRepr {
    pub size: u64,
    pub usable: i64,
}

/// Composite object: an indexed elements container (array or number dict)
/// fused with a string-keyed extra-props dictionary.
#[repr(C)]
pub struct CompositeRepr {
    pub base: ObjectHead,
    pub elements: PPtr,
    pub extra_props: PPtr,
    pub is_array: u64,
}

/// Root block contents: exactly one tagged pointer.
#[repr(C)]
pub struct RootRepr {
    pub root_object: PPtr,
}

// ─────────────────────────────────────────────────────────────────────────────
// Table sizing
// ─────────────────────────────────────────────────────────────────────────────

/// Initial keys-table capacity.
pub const MIN_SIZE_COMBINED: u64 = 8;
/// Keys tables are always strictly larger than this.
pub const MIN_SIZE_SPLIT: u64 = 4;
/// Probe perturbation decay per step.
pub const PERTURB_SHIFT: u32 = 5;

/// Largest index gap a dense array tolerates before promotion.
pub const ARRAY_MAX_GAP: u64 = 1024;
/// Capacity under which the promotion space heuristic is skipped.
pub const ARRAY_MAX_UNCHECK: u64 = 5000;
/// Promotion fires when the dict rendition is this many times smaller.
pub const ARRAY_ELEMENTS_SIZE_FACTOR: u64 = 3;

/// Largest index eligible for the dense-array representation.
pub const SMI_MAX: u32 = 2_147_483_647;

/// Insertions a fresh table of `size` slots accepts before resizing.
pub fn usable_fraction(size: u64) -> u64 {
    if size >= u32::MAX as u64 {
        size / 3 * 2
    } else {
        (2 * size + 1) / 3
    }
}

/// Capacity a dense items block gets for a logical size, with the
/// over-allocation ramp: `new_size/8 + (3 or 6) + new_size`, 0 for empty.
pub fn array_overallocate(new_size: u64) -> u64 {
    if new_size == 0 {
        return 0;
    }
    (new_size >> 3) + if new_size < 9 { 3 } else { 6 } + new_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn shape_sizes_are_stable() {
        assert_eq!(size_of::<ObjectHead>(), 8);
        assert_eq!(size_of::<VarHead>(), 16);
        assert_eq!(size_of::<BufferHead>(), 16);
        assert_eq!(size_of::<ArrayRepr>(), 40);
        assert_eq!(size_of::<NumDictRepr>(), 40);
        assert_eq!(size_of::<NumDictEntry>(), 32);
        assert_eq!(size_of::<DictEntry>(), 40);
        assert_eq!(size_of::<CompositeRepr>(), 48);
        assert_eq!(size_of::<RootRepr>(), 16);
    }

    #[test]
    fn tag_space_and_type_codes_agree() {
        assert_eq!(TypeCode::Singleton as u64, crate::pptr::TAG_SINGLETON);
        assert_eq!(TypeCode::Number as u64, crate::pptr::TAG_NUMBER);
    }

    #[test]
    fn container_classification() {
        assert!(TypeCode::Object.is_container());
        assert!(TypeCode::Dict.is_container());
        assert!(TypeCode::Array.is_container());
        assert!(TypeCode::NumDict.is_container());
        assert!(!TypeCode::String.is_container());
        assert!(!TypeCode::ArrayBuffer.is_container());
        assert!(!TypeCode::Null.is_container());
    }

    #[test]
    fn usable_fraction_matches_two_thirds() {
        assert_eq!(usable_fraction(8), 5);
        assert_eq!(usable_fraction(16), 11);
        assert_eq!(usable_fraction(u32::MAX as u64), (u32::MAX as u64) / 3 * 2);
    }

    #[test]
    fn overallocation_ramp() {
        assert_eq!(array_overallocate(0), 0);
        assert_eq!(array_overallocate(1), 4);
        assert_eq!(array_overallocate(8), 12);
        assert_eq!(array_overallocate(9), 16);
        assert_eq!(array_overallocate(100), 118);
    }
}
