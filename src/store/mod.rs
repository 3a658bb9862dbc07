//! The on-pool object layer: typed memory management, containers, the
//! composite object, the reachability collector, and the pool facade.

mod array;
mod buffer;
mod dict;
mod gc;
mod memory;
mod object;
mod pool;
mod types;

pub use array::{NumDict, SimpleArray};
pub use buffer::ByteBuffer;
pub use dict::StringDict;
pub use gc::GcReport;
pub use memory::{MemoryManager, SnapshotFlag, TxScope};
pub use object::{Elements, PmObject};
pub use pool::{ObjectPool, PersistentValue};
pub use types::{
    TypeCode, ARRAY_MAX_GAP, ARRAY_MAX_UNCHECK, SMI_MAX, TN_ARRAY_ITEMS, TN_ELEMENTS_BASE,
    TN_NUM_DICT_KEYS, TN_OBJECT, TN_STRING_DICT_KEYS, TYPE_CODE_INTERNAL_MAX,
};
