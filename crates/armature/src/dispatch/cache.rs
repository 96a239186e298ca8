// Resolution cache
//
// Bounded LRU of fallback resolutions, shared process-wide. Pure
// performance optimization: evicting any entry at any time is harmless, a
// miss just re-triggers the linear scan.

use std::any::TypeId;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::table::ArgKind;

pub const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Cache key: receiver type, method name, ordered argument kind signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey {
    pub type_id: TypeId,
    pub method: String,
    pub kinds: Vec<ArgKind>,
}

/// Process-wide bounded cache mapping a resolution key to the method-table
/// slot the fallback scan settled on. Many services invoke concurrently;
/// one coarse lock protects lookup and insert.
pub struct ResolutionCache {
    inner: Mutex<LruCache<ResolutionKey, usize>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &ResolutionKey) -> Option<usize> {
        self.inner.lock().get(key).copied()
    }

    pub fn insert(&self, key: ResolutionKey, slot: usize) {
        self.inner.lock().put(key, slot);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::new()
    }
}
