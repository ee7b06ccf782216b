//! Signature-keyed store of compiled artifacts.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::signature::{signature, Signature, SignatureScheme};
use crate::value::TensorValue;

/// Identity of a wrapped callable. Every wrap hands out a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FnId(pub u64);

impl fmt::Display for FnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Identifies one compiled unit. The `requires_grad` mask is stored next to the scheme's
/// signature because the traced joint graph depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fn_id: FnId,
    pub arg_count: usize,
    pub scheme: Arc<str>,
    pub grad_mask: Vec<bool>,
    pub signature: Signature,
}

impl CacheKey {
    pub fn derive<V: TensorValue>(fn_id: FnId, scheme: &dyn SignatureScheme, args: &[V]) -> Self {
        CacheKey {
            fn_id,
            arg_count: args.len(),
            scheme: Arc::from(scheme.tag()),
            grad_mask: args.iter().map(TensorValue::requires_grad).collect(),
            signature: signature(scheme, args),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask: String = self
            .grad_mask
            .iter()
            .map(|&needs| if needs { 'g' } else { '-' })
            .collect();
        write!(
            f,
            "{}/{} args/{}:{:016x}/{mask}",
            self.fn_id,
            self.arg_count,
            self.scheme,
            self.signature.digest()
        )
    }
}

/// Explicitly constructed compile cache, usually shared through an `Arc`.
///
/// Lookups and inserts are serialized by one mutex. [`CompileCache::get_or_try_insert_with`]
/// runs its builder while holding that mutex, so concurrent first calls for a key compile
/// once. A builder must not re-enter the same cache.
pub struct CompileCache<A> {
    entries: Mutex<HashMap<CacheKey, A>>,
}

impl<A> Default for CompileCache<A> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<A> fmt::Debug for CompileCache<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileCache")
            .field("size", &self.size())
            .finish()
    }
}

impl<A> CompileCache<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, A>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Stores `artifact` under `key`, replacing and returning any previous entry.
    pub fn insert(&self, key: CacheKey, artifact: A) -> Option<A> {
        self.lock().insert(key, artifact)
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        let dropped = entries.len();
        entries.clear();
        log::debug!("compile cache cleared ({dropped} entries)");
    }
}

impl<A: Clone> CompileCache<A> {
    pub fn lookup(&self, key: &CacheKey) -> Option<A> {
        self.lock().get(key).cloned()
    }

    /// Returns the artifact stored under `key`, building and inserting it on a miss.
    ///
    /// Nothing is inserted when `build` fails; the error is returned unchanged.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: CacheKey,
        build: impl FnOnce() -> Result<A, E>,
    ) -> Result<A, E> {
        let mut entries = self.lock();
        if let Some(artifact) = entries.get(&key) {
            crate::profiling::cache_event("compile_cache_hit");
            log::trace!("compile cache hit for {key}");
            return Ok(artifact.clone());
        }
        crate::profiling::cache_event("compile_cache_miss");
        log::debug!("compile cache miss for {key}");
        let artifact = build()?;
        entries.insert(key, artifact.clone());
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fn_id: u64, digest: u64) -> CacheKey {
        CacheKey {
            fn_id: FnId(fn_id),
            arg_count: 1,
            scheme: Arc::from("shape-only"),
            grad_mask: vec![true],
            signature: Signature::from_parts(digest, &digest.to_le_bytes()),
        }
    }

    #[test]
    fn lookups_after_insert_return_the_same_artifact() {
        let cache = CompileCache::new();
        assert!(cache.insert(key(1, 7), Arc::new(42)).is_none());
        let first = cache.lookup(&key(1, 7)).expect("present");
        for _ in 0..3 {
            let again = cache.lookup(&key(1, 7)).expect("present");
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert!(cache.lookup(&key(2, 7)).is_none());
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn clear_forgets_every_key() {
        let cache = CompileCache::new();
        cache.insert(key(1, 1), "a");
        cache.insert(key(1, 2), "b");
        cache.clear();
        assert!(cache.lookup(&key(1, 1)).is_none());
        assert!(cache.lookup(&key(1, 2)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_if_absent_builds_once() {
        let cache = CompileCache::new();
        let mut builds = 0;
        for _ in 0..3 {
            let value: Result<u32, ()> = cache.get_or_try_insert_with(key(1, 1), || {
                builds += 1;
                Ok(5)
            });
            assert_eq!(value, Ok(5));
        }
        assert_eq!(builds, 1);
    }

    #[test]
    fn failed_build_inserts_nothing() {
        let cache: CompileCache<u32> = CompileCache::new();
        let result = cache.get_or_try_insert_with(key(1, 1), || Err("compiler exploded"));
        assert_eq!(result, Err("compiler exploded"));
        assert!(!cache.contains(&key(1, 1)));

        let retried: Result<u32, &str> = cache.get_or_try_insert_with(key(1, 1), || Ok(3));
        assert_eq!(retried, Ok(3));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn colliding_digests_keep_separate_entries() {
        let cache = CompileCache::new();
        let mut first = key(1, 9);
        first.signature = Signature::from_parts(9, b"f32[2]");
        let mut second = key(1, 9);
        second.signature = Signature::from_parts(9, b"f32[3]");
        cache.insert(first.clone(), "two");
        cache.insert(second.clone(), "three");
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.lookup(&first), Some("two"));
        assert_eq!(cache.lookup(&second), Some("three"));
    }

    #[test]
    fn grad_mask_separates_keys() {
        let cache = CompileCache::new();
        let mut frozen = key(1, 4);
        frozen.grad_mask = vec![false];
        cache.insert(key(1, 4), 1);
        assert!(cache.lookup(&frozen).is_none());
    }
}
