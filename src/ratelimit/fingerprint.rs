//! Key fingerprinting strategies.
//!
//! Counters never store the caller's key string directly; they store a
//! fingerprint of it. The default [`HashedKey`] strategy reduces every key to
//! a 64-bit hash, so two distinct keys that collide share a count. Callers
//! that need exact isolation can use [`ExactKey`] instead.

use ahash::RandomState;
use std::fmt::Debug;
use std::hash::Hash;

/// Maps an opaque rate limit key to the value counters are indexed by.
pub trait KeyFingerprint: Send + Sync {
    /// The fingerprint type stored in the counter maps.
    type Fingerprint: Eq + Hash + Clone + Debug + Send;

    /// Compute the fingerprint of `key`.
    fn fingerprint(&self, key: &str) -> Self::Fingerprint;
}

// Fixed so that fingerprints do not change between counter instances.
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// 64-bit non-cryptographic fingerprint.
#[derive(Clone)]
pub struct HashedKey {
    state: RandomState,
}

impl HashedKey {
    /// Create a hasher with the built-in seeds.
    pub fn new() -> Self {
        Self {
            state: RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]),
        }
    }

    /// Use caller-provided seeds instead of the built-in ones.
    pub fn with_seeds(k0: u64, k1: u64, k2: u64, k3: u64) -> Self {
        Self {
            state: RandomState::with_seeds(k0, k1, k2, k3),
        }
    }
}

impl Default for HashedKey {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for HashedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashedKey").finish_non_exhaustive()
    }
}

impl KeyFingerprint for HashedKey {
    type Fingerprint = u64;

    #[inline]
    fn fingerprint(&self, key: &str) -> u64 {
        self.state.hash_one(key)
    }
}

/// Collision-free fingerprint: the key itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactKey;

impl KeyFingerprint for ExactKey {
    type Fingerprint = Box<str>;

    fn fingerprint(&self, key: &str) -> Box<str> {
        key.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_hashed_key_is_deterministic() {
        let a = HashedKey::new();
        let b = HashedKey::new();
        assert_eq!(a.fingerprint("10.0.0.1"), b.fingerprint("10.0.0.1"));
    }

    #[test]
    fn test_hashed_key_distribution() {
        let hasher = HashedKey::new();
        let fingerprints: HashSet<u64> = (0..10_000)
            .map(|i| hasher.fingerprint(&format!("key:{}", i)))
            .collect();
        assert_eq!(fingerprints.len(), 10_000);
    }

    #[test]
    fn test_seeds_change_fingerprint() {
        let default = HashedKey::new();
        let seeded = HashedKey::with_seeds(1, 2, 3, 4);
        assert_ne!(default.fingerprint("user-42"), seeded.fingerprint("user-42"));
    }

    #[test]
    fn test_exact_key() {
        assert_eq!(&*ExactKey.fingerprint("user-42"), "user-42");
        assert_ne!(ExactKey.fingerprint("a"), ExactKey.fingerprint("b"));
    }
}
