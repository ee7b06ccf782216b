//! Call-site signatures used as compile-cache keys.
//!
//! A [`SignatureScheme`] decides which properties of the flattened arguments make two calls
//! cache-equivalent. Values never take part: calls that only differ in numbers share a key.
//! Everything a scheme writes is kept as an owned encoding next to its digest, so distinct
//! classes never share a key even when their digests collide.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::graph::DType;
use crate::value::TensorValue;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

/// Deterministic FNV-1a hasher that also records the bytes it was fed.
#[derive(Debug, Clone)]
pub struct FingerprintHasher {
    state: u64,
    encoding: Vec<u8>,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            state: FNV1A_OFFSET,
            encoding: Vec::new(),
        }
    }

    pub fn write_value<T: Hash + ?Sized>(&mut self, value: &T) {
        value.hash(self);
    }

    pub fn into_signature(self) -> Signature {
        Signature {
            digest: self.state,
            encoding: Arc::from(self.encoding),
        }
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for FingerprintHasher {
    fn write(&mut self, bytes: &[u8]) {
        self.encoding.extend_from_slice(bytes);
        for byte in bytes {
            self.state ^= u64::from(*byte);
            self.state = self.state.wrapping_mul(FNV1A_PRIME);
        }
    }

    fn finish(&self) -> u64 {
        self.state
    }
}

/// Derived signature of one call: the FNV-1a digest plus the encoding it was computed from.
///
/// Equality compares encodings; hashing only feeds the digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    digest: u64,
    encoding: Arc<[u8]>,
}

impl Signature {
    #[cfg(test)]
    pub(crate) fn from_parts(digest: u64, encoding: &[u8]) -> Self {
        Self {
            digest,
            encoding: Arc::from(encoding),
        }
    }

    pub fn digest(&self) -> u64 {
        self.digest
    }

    pub fn encoding(&self) -> &[u8] {
        &self.encoding
    }
}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.digest);
    }
}

/// Properties of one flattened leaf visible to a signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafSignature<'a> {
    pub dtype: DType,
    pub shape: &'a [usize],
    pub requires_grad: bool,
}

impl<'a> LeafSignature<'a> {
    pub fn of<V: TensorValue>(value: &'a V) -> Self {
        Self {
            dtype: value.dtype(),
            shape: value.shape(),
            requires_grad: value.requires_grad(),
        }
    }
}

/// Decides which calls share a compiled unit.
///
/// Traced graphs carry concrete shapes and dtypes, so a scheme must not merge leaves that
/// differ in either unless the tracer and both compilers are shape-polymorphic. The
/// `requires_grad` mask is always part of the cache key, whatever the scheme hashes.
pub trait SignatureScheme: Send + Sync {
    /// Name stored in cache keys; entries produced under different tags never match.
    fn tag(&self) -> &str;

    fn hash_leaf(&self, leaf: &LeafSignature<'_>, hasher: &mut FingerprintHasher);
}

/// Signature of `leaves` under `scheme`: the leaf count, then every leaf in order.
pub fn signature<V: TensorValue>(scheme: &dyn SignatureScheme, leaves: &[V]) -> Signature {
    let mut hasher = FingerprintHasher::new();
    hasher.write_usize(leaves.len());
    for leaf in leaves {
        scheme.hash_leaf(&LeafSignature::of(leaf), &mut hasher);
    }
    hasher.into_signature()
}

pub fn fingerprint<V: TensorValue>(scheme: &dyn SignatureScheme, leaves: &[V]) -> u64 {
    signature(scheme, leaves).digest()
}

/// Specializes on dtype, exact shape and the requires-grad flag of every leaf.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticShapeScheme;

impl SignatureScheme for StaticShapeScheme {
    fn tag(&self) -> &str {
        "StaticShapeHasher"
    }

    fn hash_leaf(&self, leaf: &LeafSignature<'_>, hasher: &mut FingerprintHasher) {
        hasher.write_value(&leaf.dtype);
        hasher.write_value(leaf.shape);
        hasher.write_value(&leaf.requires_grad);
    }
}
