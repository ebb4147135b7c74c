use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHasher;

use crate::config::CacheConfig;
use crate::labels::Fingerprint;

struct Entry {
    hash: String,
    inserted: Instant,
}

/// Bounded fingerprint → hash cache with per-entry expiry.
///
/// Shared by the write worker and both writer stages; all access goes
/// through its own locking, one shard per lookup. A missing or expired
/// entry only means the label set must be looked up or (re)created in
/// the store — not that it is unknown there.
pub struct HashCache {
    shards: Vec<Mutex<LruCache<Fingerprint, Entry>>>,
    mask: usize,
    ttl: Duration,
}

impl HashCache {
    pub fn new(config: &CacheConfig) -> Self {
        let shards = config.shards.max(1).next_power_of_two();
        // bigcache-style byte budget reduced to an entry budget
        let budget = (config.max_size_mb * 1024 * 1024) / config.item_size.max(1);
        let capacity = config.items.min(budget).max(shards);
        let per_shard = NonZeroUsize::new((capacity / shards).max(1))
            .expect("per-shard capacity is at least 1");
        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            mask: shards - 1,
            ttl: Duration::from_secs(config.ttl_secs),
        }
    }

    fn shard(&self, fingerprint: &Fingerprint) -> &Mutex<LruCache<Fingerprint, Entry>> {
        let mut hasher = FxHasher::default();
        fingerprint.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.mask]
    }

    /// Cached hash for the fingerprint, unless the entry has expired.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<String> {
        let mut shard = self.shard(fingerprint).lock();
        match shard.get(fingerprint) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => Some(entry.hash.clone()),
            Some(_) => {
                shard.pop(fingerprint);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, fingerprint: Fingerprint, hash: String) {
        self.shard(&fingerprint).lock().put(
            fingerprint,
            Entry {
                hash,
                inserted: Instant::now(),
            },
        );
    }
}
