//! Expiring key/value cache
//!
//! Every entry owns exactly one deletion timer. Re-setting a key aborts the
//! previous timer and bumps the entry generation, so a timer that already
//! fired but lost the race to the lock still cannot remove the newer value.
//! Only timer-driven removals notify the expiry listeners.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Default time-to-live for cached device status
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Handler invoked with the key of an entry whose timer expired
pub type ExpiryListener<K> = Box<dyn Fn(&K) + Send + Sync>;

struct CacheEntry<V> {
    value: V,
    generation: u64,
    timer: JoinHandle<()>,
}

struct CacheInner<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    listeners: RwLock<Vec<ExpiryListener<K>>>,
    next_generation: AtomicU64,
    default_ttl: Duration,
}

/// Key/value store with per-entry TTL
///
/// Absence of a key only means "unknown, fetch it"; it never says anything
/// about the device behind the key. `set` must be called from within a
/// tokio runtime since it spawns the deletion timer.
pub struct ExpiringCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for ExpiringCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    /// Create a cache using `default_ttl` for plain `set` calls
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                next_generation: AtomicU64::new(0),
                default_ttl,
            }),
        }
    }

    /// The TTL applied by `set`
    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Store a value with the default TTL
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.inner.default_ttl);
    }

    /// Store a value and (re)start its deletion timer
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let weak: Weak<CacheInner<K, V>> = Arc::downgrade(&self.inner);
        let timer_key = key.clone();

        // Spawned under the lock so a zero TTL cannot expire before insertion
        let mut entries = self.inner.lock_entries();
        let timer = tokio::spawn(async move {
            sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&timer_key, generation);
            }
        });

        let previous = entries.insert(
            key,
            CacheEntry {
                value,
                generation,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }
    }

    /// Get a cached value, if present
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner
            .lock_entries()
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Remove a value and cancel its timer without notifying listeners
    pub fn delete(&self, key: &K) -> bool {
        match self.inner.lock_entries().remove(key) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Check whether a key is currently cached
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock_entries().contains_key(key)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a handler called with the key of every expired entry
    pub fn add_expiry_listener<F>(&self, listener: F)
    where
        F: Fn(&K) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(listener));
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash,
{
    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expire(&self, key: &K, generation: u64) {
        let removed = {
            let mut entries = self.lock_entries();
            match entries.get(key) {
                Some(entry) if entry.generation == generation => entries.remove(key).is_some(),
                _ => false,
            }
        };

        if !removed {
            return;
        }

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for listener in listeners.iter() {
            listener(key);
        }
    }
}

impl<K, V> Drop for CacheInner<K, V> {
    fn drop(&mut self) {
        let entries = self
            .entries
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, entry) in entries.drain() {
            entry.timer.abort();
        }
    }
}
