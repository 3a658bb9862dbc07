//! Thin wrapper around the `xxhash-rust` crate providing the 64-bit hashes
//! used by the rest of this crate.
//!
//! Two call sites: the string dictionary hashes key bytes, and pool creation
//! derives the pool uuid. XXH64 is used for distribution only, not security.
//! The string-dictionary hash is part of the on-pool format: changing it
//! requires a format-version bump and a pool rebuild.

/// One-shot XXH64 over `data` with seed 0. The string-dictionary key hash.
#[inline]
pub fn xxh64_oneshot(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, 0)
}

/// One-shot XXH64 with an explicit seed. Used for uuid derivation where the
/// seed folds in a clock reading.
#[inline]
pub fn xxh64_seeded(data: &[u8], seed: u64) -> u64 {
    xxhash_rust::xxh64::xxh64(data, seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(xxh64_oneshot(b"length"), xxh64_oneshot(b"length"));
        assert_ne!(xxh64_oneshot(b"a"), xxh64_oneshot(b"b"));
    }

    #[test]
    fn seed_changes_output() {
        assert_ne!(xxh64_seeded(b"pool", 1), xxh64_seeded(b"pool", 2));
    }
}
