// Caches for expensive external lookups within one orchestrator run

use moka::sync::Cache;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Entries vanish once their TTL has elapsed, checked on read
#[derive(Debug, Clone)]
pub struct TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<K, V>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    pub fn invalidate(&self, key: &K) {
        self.inner.invalidate(key);
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }
}

#[derive(Debug, Clone)]
struct LruEntry<V> {
    value: V,
    inserted_at: Instant,
    tick: u64,
}

/// Bounded cache evicting the least recently accessed key; entries also expire lazily
#[derive(Debug)]
pub struct LruCache<K, V> {
    entries: HashMap<K, LruEntry<V>>,
    order: BTreeMap<u64, K>,
    max_size: usize,
    ttl: Option<Duration>,
    tick: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            max_size: max_size.max(1),
            ttl,
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn is_stale(&self, entry: &LruEntry<V>) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() > ttl)
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let stale = self.entries.get(key).map(|entry| self.is_stale(entry))?;
        if stale {
            self.remove(key);
            return None;
        }
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        let tick = self.next_tick();
        if let Some(old) = self.entries.insert(
            key.clone(),
            LruEntry {
                value,
                inserted_at: Instant::now(),
                tick,
            },
        ) {
            self.order.remove(&old.tick);
        }
        self.order.insert(tick, key);

        while self.entries.len() > self.max_size {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry.value)
    }
}
