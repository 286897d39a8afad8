//! Pluggable hash function for ring positions.

use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use twox_hash::XxHash64;

/// Hash function used to place vnodes and keys on the ring.
///
/// Cheap to clone: the wrapped function is shared. Every process in a group
/// must use the same hasher, otherwise they disagree on ownership.
#[derive(Clone)]
pub struct RingHasher {
    f: Arc<dyn Fn(&[u8]) -> u64 + Send + Sync>,
}

impl RingHasher {
    /// Wrap a custom hash function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> u64 + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Hash a byte string.
    pub fn hash(&self, data: &[u8]) -> u64 {
        (self.f)(data)
    }
}

impl Default for RingHasher {
    /// XxHash64 with seed 0.
    fn default() -> Self {
        Self::new(xxhash64)
    }
}

impl fmt::Debug for RingHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingHasher").finish_non_exhaustive()
    }
}

fn xxhash64(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}
