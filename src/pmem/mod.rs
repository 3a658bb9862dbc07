//! Persistent-memory primitive layer.
//!
//! Everything the object store needs from a pool file lives here: attach
//! and create ([`RawPool::open`] / [`RawPool::create`]), the static
//! consistency check, direct-mapped addressing (`direct` / `ptr_of`), a
//! typed block allocator with linear live-block iteration (`first` /
//! `next` / `type_num`), byte-range undo logging (`snapshot`), flat nested
//! transactions (`tx_begin` / `tx_commit` / `tx_abort` / `tx_end`), and
//! durable flushes (`persist`).
//!
//! The upper layers treat this module as a contract and never reach past
//! it to the mapping.

mod alloc;
mod layout;
mod pool;
mod tx;

pub use layout::{MIN_POOL_SIZE, TYPE_NUM_NONE, TYPE_NUM_ROOT};
pub use pool::RawPool;
pub use tx::TxStage;
