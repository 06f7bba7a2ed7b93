//! Deterministic key hashing for keyed routing (spec.md §4.4).
//!
//! `std`'s `HashMap`'s `DefaultHasher` is fine in-process but we want a hash
//! that is trivially reproducible across test runs without depending on
//! hasher-seed semantics we don't control. FNV-1a is small enough to write
//! by hand and deterministic by construction.

use std::hash::{Hash, Hasher};

/// A tiny deterministic hasher (FNV-1a, 64-bit). Not cryptographic, not
/// DoS-resistant — it exists purely to map keys to downstream replicas.
struct Fnv1a(u64);

impl Fnv1a {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    fn new() -> Self {
        Self(Self::OFFSET_BASIS)
    }
}

impl Hasher for Fnv1a {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= byte as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }
}

/// `stable_hash(K(record))` from spec.md §4.4: deterministic across replicas
/// and across calls within a run.
pub fn stable_hash<K: Hash>(key: &K) -> u64 {
    let mut hasher = Fnv1a::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A key extractor declared on a stage (spec.md §3: "key extractor K: Input
/// → KeyType"), normalized to produce a `u64` routing hash directly so the
/// transport layer never needs to know the application's `KeyType`.
pub type KeyExtractor<T> = std::sync::Arc<dyn Fn(&T) -> u64 + Send + Sync>;

/// Wraps a user-supplied `Input -> KeyType` extractor into a [`KeyExtractor`].
pub fn key_by<T, K, F>(f: F) -> KeyExtractor<T>
where
    F: Fn(&T) -> K + Send + Sync + 'static,
    K: Hash,
{
    std::sync::Arc::new(move |value: &T| stable_hash(&f(value)))
}
