use moka::{policy::EvictionPolicy, sync::Cache};
use std::hash::Hash;
use tokio::time::{Duration, Instant};

/// Decisions and identities resolved by delegation are reused for this long.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Entries beyond this are evicted least-recently-used first.
pub const DEFAULT_CAPACITY: u64 = 256;

/// A bounded LRU cache whose entries expire a fixed time after insertion.
///
/// Expiry is checked on read against the tokio clock so that an entry
/// present but expired is a miss.
#[derive(Clone)]
pub struct TtlCache<K, V> {
    entries: Cache<K, Entry<V>>,
    ttl: Duration,
}

#[derive(Clone)]
struct Entry<V> {
    value: V,
    expiry: Instant,
}

// === impl TtlCache ===

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self { entries, ttl }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if Instant::now() < entry.expiry {
            return Some(entry.value);
        }
        self.entries.invalidate(key);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        let expiry = Instant::now() + self.ttl;
        self.entries.insert(key, Entry { value, expiry });
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("entries", &self.entries.entry_count())
            .field("ttl", &self.ttl)
            .finish()
    }
}
