use crate::block::{BLOCK_REF_BYTE_SIZE, BlockRef};
use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

pub const MIN_READ_CACHE_ENTRIES: usize = 100;

/// Recency-bounded cache of blocks fetched from remote peers.
pub struct ReadCache {
    entries: Mutex<LruCache<[u8; BLOCK_REF_BYTE_SIZE], Bytes>>,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// One entry per block that fits in `budget_bytes`, at least
    /// `MIN_READ_CACHE_ENTRIES`.
    pub fn with_budget(budget_bytes: u64, block_size: u64) -> Self {
        let entries = budget_bytes.checked_div(block_size).unwrap_or(0) as usize;
        Self::new(entries.max(MIN_READ_CACHE_ENTRIES))
    }

    pub fn get(&self, block_ref: &BlockRef) -> Option<Bytes> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&block_ref.to_bytes()).cloned()
    }

    pub fn put(&self, block_ref: &BlockRef, data: Bytes) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.put(block_ref.to_bytes(), data);
    }

    pub fn remove(&self, block_ref: &BlockRef) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.pop(&block_ref.to_bytes());
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cap()
            .get()
    }
}
