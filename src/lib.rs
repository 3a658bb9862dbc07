// pmstore — a persistent object store over memory-mapped pool files.

pub mod error;
pub mod hash;
pub mod pmem;
pub mod pptr;
pub mod store;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level re-exports for the common API entry points.
// ─────────────────────────────────────────────────────────────────────────────

/// Crate-wide error and result types.
pub use error::{Error, Result};

/// Tagged persistent pointer and its sentinel/singleton constants.
pub use pptr::{
    PPtr, Singleton, PPTR_DUMMY, PPTR_EMPTY, PPTR_EMPTY_STRING, PPTR_FALSE, PPTR_JS_NULL,
    PPTR_NULL, PPTR_TRUE, PPTR_UNDEFINED, PPTR_ZERO,
};

/// Pool facade: lifecycle, root slot, scalar persistence, classification.
pub use store::{ObjectPool, PersistentValue};

/// Composite object and its elements representations.
pub use store::{Elements, PmObject};

/// Containers, usable standalone through a [`store::MemoryManager`].
pub use store::{ByteBuffer, NumDict, SimpleArray, StringDict};

/// Typed memory manager, snapshot flag, and the transaction scope guard.
pub use store::{MemoryManager, SnapshotFlag, TxScope};

/// Reachability-collector report.
pub use store::GcReport;

/// Transaction stage, as reported by `tx_stage`.
pub use pmem::TxStage;

/// Smallest pool size `create` accepts.
pub use pmem::MIN_POOL_SIZE;
