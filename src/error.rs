//! Crate-wide error type.
//!
//! Every fallible operation in the pool, allocator, transaction, and
//! container layers funnels into [`Error`]. The variants map one-to-one onto
//! the failure classes a caller can meaningfully react to; anything else
//! (torn headers, impossible type codes) is [`Error::Corrupt`].

use core::fmt;
use std::io;

/// Failure classes surfaced by the persistent object store.
#[derive(Debug)]
pub enum Error {
    /// The pool file could not be opened or created: missing file, magic or
    /// format-version mismatch, or a layout string that differs from the one
    /// the pool was created with.
    PoolOpen(String),
    /// The pool (or its transaction log) is out of space.
    AllocFail,
    /// A transactional operation (snapshot, transactional alloc/free) was
    /// invoked with no transaction open.
    NotInTx,
    /// A caller handed in something structurally impossible: an unknown
    /// singleton offset, a tagged pointer whose tag belongs to no attached
    /// pool, or a heap pointer that does not resolve to a live block.
    InvalidArgument,
    /// A string-dictionary lookup missed. Only produced at the value
    /// classification boundary; the raw lookup returns the `EMPTY` sentinel.
    KeyNotFound,
    /// On-pool state that violates the format: a block header carrying a
    /// type code outside the known range, or a log region that cannot be
    /// replayed.
    Corrupt(String),
    /// An operating-system level failure underneath the pool mapping.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PoolOpen(msg) => write!(f, "cannot open pool: {msg}"),
            Error::AllocFail => write!(f, "pool allocation failed"),
            Error::NotInTx => write!(f, "operation requires an open transaction"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::KeyNotFound => write!(f, "key not found"),
            Error::Corrupt(msg) => write!(f, "pool corruption detected: {msg}"),
            Error::Io(e) => write!(f, "pool I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(e as i32))
    }
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::AllocFail.to_string(), "pool allocation failed");
        assert_eq!(Error::NotInTx.to_string(), "operation requires an open transaction");
        assert_eq!(
            Error::PoolOpen("bad layout".into()).to_string(),
            "cannot open pool: bad layout"
        );
    }

    #[test]
    fn io_source_is_preserved() {
        let e = Error::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(std::error::Error::source(&e).is_some());
    }
}
