//! In-memory cache with a per-entry time-to-live.
//!
//! Every entry carries its own absolute lifetime measured from insertion (or
//! from the last update). Reads never extend that lifetime. Expired entries
//! are evicted lazily by the read that discovers them; an optional background
//! sweeper reclaims memory held by keys that are never read again.
//!
//! The map is a [`DashMap`](dashmap::DashMap), so independent keys never
//! contend on a global lock. The cache is cheaply cloneable and clones share
//! the same storage.

mod entry;

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::Thread;
use std::time::Duration;

use chatfront_common::{GatewayError, GatewayResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

pub use entry::CacheEntry;

/// A concurrent key/value cache whose entries expire after a fixed lifetime.
pub struct TtlCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

struct CacheInner<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    default_lifetime: Duration,
    disposed: AtomicBool,
    sweeper: Mutex<Option<Thread>>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create an empty cache. `default_lifetime` is used by [`insert`](Self::insert).
    pub fn new(default_lifetime: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                default_lifetime,
                disposed: AtomicBool::new(false),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn default_lifetime(&self) -> Duration {
        self.inner.default_lifetime
    }

    /// Insert `value` only if `key` is absent or its entry has expired.
    ///
    /// Returns whether the insertion happened.
    pub fn try_add(&self, key: K, value: V, lifetime: Duration) -> GatewayResult<bool> {
        self.ensure_live()?;
        let now = Instant::now();

        match self.inner.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired_at(now) {
                    occupied.insert(CacheEntry::new(value, lifetime, now));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value, lifetime, now));
                Ok(true)
            }
        }
    }

    /// Insert or replace `key` using the cache's default lifetime.
    pub fn insert(&self, key: K, value: V) -> GatewayResult<()> {
        self.ensure_live()?;
        let entry = CacheEntry::new(value, self.inner.default_lifetime, Instant::now());
        self.inner.entries.insert(key, entry);
        Ok(())
    }

    /// Look up `key`, returning its value and the lifetime it was stored with.
    ///
    /// An expired entry is evicted and reported as a miss.
    pub fn try_get(&self, key: &K) -> GatewayResult<Option<(V, Duration)>> {
        self.ensure_live()?;
        let now = Instant::now();

        match self.inner.entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired_at(now) => {
                let live = entry.value();
                return Ok(Some((live.value().clone(), live.lifetime())));
            }
            Some(_) => {}
        }

        // A writer may have replaced the entry since we looked; only drop it
        // if it is still expired.
        if self
            .inner
            .entries
            .remove_if(key, |_, entry| entry.is_expired_at(now))
            .is_some()
        {
            trace!("evicted expired cache entry on read");
        }
        Ok(None)
    }

    /// Return the live value for `key`, creating it with `factory` if missing.
    ///
    /// The factory runs outside the map's locks, so racing callers for the
    /// same missing key may each invoke their factory. The first result to
    /// be stored wins; every other caller gets the stored value back and its
    /// own result is dropped. The factory is never invoked when a live entry
    /// already exists.
    pub fn get_or_add<S, F>(&self, key: K, factory: F, state: S) -> GatewayResult<V>
    where
        F: FnOnce(&K, S) -> (V, Duration),
    {
        if let Some((value, _)) = self.try_get(&key)? {
            return Ok(value);
        }

        let (value, lifetime) = factory(&key, state);
        let now = Instant::now();

        match self.inner.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired_at(now) {
                    occupied.insert(CacheEntry::new(value.clone(), lifetime, now));
                    Ok(value)
                } else {
                    Ok(occupied.get().value().clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value.clone(), lifetime, now));
                Ok(value)
            }
        }
    }

    /// Create `key` with `add_factory` if it is missing, otherwise replace
    /// its entry with the result of `update_factory`.
    ///
    /// Both factories run while the key's shard is locked, so updates to one
    /// key are serialized and each update observes the previous one. A
    /// factory must not call back into the same cache.
    pub fn add_or_update<S, A, U>(
        &self,
        key: K,
        add_factory: A,
        update_factory: U,
        state: S,
    ) -> GatewayResult<V>
    where
        A: FnOnce(&K, S) -> (V, Duration),
        U: FnOnce(&K, &CacheEntry<V>, S) -> (V, Duration),
    {
        self.ensure_live()?;
        let now = Instant::now();

        match self.inner.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let (value, lifetime) = if occupied.get().is_expired_at(now) {
                    add_factory(occupied.key(), state)
                } else {
                    update_factory(occupied.key(), occupied.get(), state)
                };
                occupied.insert(CacheEntry::new(value.clone(), lifetime, now));
                Ok(value)
            }
            Entry::Vacant(vacant) => {
                let (value, lifetime) = add_factory(vacant.key(), state);
                vacant.insert(CacheEntry::new(value.clone(), lifetime, now));
                Ok(value)
            }
        }
    }

    /// Remove `key` regardless of its remaining lifetime.
    pub fn try_remove(&self, key: &K) -> GatewayResult<Option<V>> {
        self.ensure_live()?;
        Ok(self
            .inner
            .entries
            .remove(key)
            .map(|(_, entry)| entry.into_value()))
    }

    /// Evict every expired entry. Returns the number of entries removed.
    pub fn sweep(&self) -> GatewayResult<usize> {
        self.ensure_live()?;
        Ok(self.inner.sweep())
    }

    /// Spawn a background thread that calls [`sweep`](Self::sweep) every
    /// `interval`.
    ///
    /// The thread only holds a weak reference to the cache and exits once
    /// the cache is disposed or dropped. Calling this again while a sweeper
    /// is running has no effect.
    pub fn start_sweeper(&self, interval: Duration) -> GatewayResult<()>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.ensure_live()?;
        if interval.is_zero() {
            return Err(GatewayError::InvalidArgument(
                "sweep interval must be greater than zero".into(),
            ));
        }

        let mut slot = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("cache sweeper already running");
            return Ok(());
        }

        let weak: Weak<CacheInner<K, V>> = Arc::downgrade(&self.inner);
        let handle = std::thread::Builder::new()
            .name("ttl-cache-sweeper".into())
            .spawn(move || loop {
                std::thread::park_timeout(interval);

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.disposed.load(Ordering::Acquire) {
                    break;
                }
                inner.sweep();
            })?;

        *slot = Some(handle.thread().clone());
        debug!(interval_ms = interval.as_millis() as u64, "started cache sweeper");
        Ok(())
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Release every entry and stop the background sweeper.
    ///
    /// Any later operation fails with [`GatewayError::Disposed`]. Disposing
    /// twice is a no-op.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let released = self.inner.entries.len();
        self.inner.entries.clear();
        self.inner.wake_sweeper();
        debug!(released, "cache disposed");
    }

    fn ensure_live(&self) -> GatewayResult<()> {
        if self.is_disposed() {
            Err(GatewayError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl<K: Eq + Hash, V> CacheInner<K, V> {
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before.saturating_sub(self.entries.len());

        debug!(
            removed,
            remaining = self.entries.len(),
            "cache sweep complete"
        );
        removed
    }
}

impl<K, V> CacheInner<K, V> {
    fn wake_sweeper(&self) {
        let slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(thread) = slot.as_ref() {
            thread.unpark();
        }
    }
}

impl<K, V> Drop for CacheInner<K, V> {
    fn drop(&mut self) {
        self.wake_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[test]
    fn ttl_round_trip() {
        let cache = TtlCache::new(HOUR);

        assert!(cache.try_add(1, "1", Duration::from_millis(250)).unwrap());
        assert_eq!(
            cache.try_get(&1).unwrap(),
            Some(("1", Duration::from_millis(250)))
        );

        thread::sleep(Duration::from_millis(300));
        assert_eq!(cache.try_get(&1).unwrap(), None);
        assert!(cache.is_empty(), "expired entry should be evicted by the read");
    }

    #[tokio::test(start_paused = true)]
    async fn try_add_treats_expired_entry_as_absent() {
        let cache = TtlCache::new(HOUR);

        assert!(cache.try_add("k", 1, Duration::from_secs(1)).unwrap());
        assert!(!cache.try_add("k", 2, Duration::from_secs(1)).unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(cache.try_add("k", 3, Duration::from_secs(1)).unwrap());
        assert_eq!(cache.try_get(&"k").unwrap(), Some((3, Duration::from_secs(1))));
    }

    #[test]
    fn get_or_add_does_not_overwrite_live_entry() {
        let cache = TtlCache::new(HOUR);
        assert!(cache.try_add(1, "1", HOUR).unwrap());

        let calls = AtomicUsize::new(0);
        let value = cache
            .get_or_add(
                1,
                |_, calls: &AtomicUsize| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ("2", DAY)
                },
                &calls,
            )
            .unwrap();

        assert_eq!(value, "1");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.try_get(&1).unwrap(), Some(("1", HOUR)));
    }

    #[test]
    fn get_or_add_creates_missing_entry() {
        let cache = TtlCache::new(HOUR);

        let value = cache
            .get_or_add("alice", |key, suffix| (format!("{key}-{suffix}"), DAY), 7)
            .unwrap();

        assert_eq!(value, "alice-7");
        assert_eq!(
            cache.try_get(&"alice").unwrap(),
            Some(("alice-7".to_string(), DAY))
        );
    }

    #[test]
    fn get_or_add_keeps_single_winner_under_contention() {
        let cache: TtlCache<&str, usize> = TtlCache::new(HOUR);

        let results: Vec<usize> = thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let cache = cache.clone();
                    scope.spawn(move || cache.get_or_add("shared", |_, n| (n, HOUR), i).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let stored = cache.try_get(&"shared").unwrap().unwrap().0;
        assert!(results.iter().all(|&r| r == stored));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn add_or_update_update_path() {
        let cache = TtlCache::new(HOUR);
        assert!(cache.try_add(1, "1", HOUR).unwrap());

        let value = cache
            .add_or_update(
                1,
                |_, _: ()| ("2", Duration::ZERO),
                |_, existing, _| ("3", existing.lifetime() * 2),
                (),
            )
            .unwrap();

        assert_eq!(value, "3");
        assert_eq!(cache.try_get(&1).unwrap(), Some(("3", 2 * HOUR)));
    }

    #[test]
    fn add_or_update_add_path() {
        let cache = TtlCache::new(HOUR);

        let value = cache
            .add_or_update(
                9,
                |_, lifetime| ("added", lifetime),
                |_, _, _| ("updated", HOUR),
                DAY,
            )
            .unwrap();

        assert_eq!(value, "added");
        assert_eq!(cache.try_get(&9).unwrap(), Some(("added", DAY)));
    }

    #[tokio::test(start_paused = true)]
    async fn add_or_update_on_expired_entry_uses_add_factory() {
        let cache = TtlCache::new(HOUR);
        cache.try_add(1, 10, Duration::from_secs(1)).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;

        let value = cache
            .add_or_update(1, |_, _: ()| (20, HOUR), |_, e, _| (e.value() + 1, HOUR), ())
            .unwrap();
        assert_eq!(value, 20);
    }

    #[test]
    fn add_or_update_serializes_concurrent_updates() {
        let cache: TtlCache<&str, u64> = TtlCache::new(HOUR);

        thread::scope(|scope| {
            for _ in 0..8 {
                let cache = cache.clone();
                scope.spawn(move || {
                    for _ in 0..100 {
                        cache
                            .add_or_update(
                                "counter",
                                |_, _: ()| (1, HOUR),
                                |_, e, _| (e.value() + 1, HOUR),
                                (),
                            )
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(cache.try_get(&"counter").unwrap(), Some((800, HOUR)));
    }

    #[tokio::test(start_paused = true)]
    async fn try_remove_returns_expired_value_once() {
        let cache = TtlCache::new(HOUR);
        cache.try_add(1, "1", Duration::from_millis(10)).unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;

        assert_eq!(cache.try_remove(&1).unwrap(), Some("1"));
        assert_eq!(cache.try_remove(&1).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() {
        let cache = TtlCache::new(HOUR);
        cache.try_add("short", 1, Duration::from_secs(1)).unwrap();
        cache.try_add("long", 2, HOUR).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(cache.sweep().unwrap(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.try_get(&"long").unwrap(), Some((2, HOUR)));
    }

    #[test]
    fn insert_uses_default_lifetime() {
        let cache = TtlCache::new(Duration::from_secs(42));
        cache.insert("k", 'v').unwrap();
        cache.insert("k", 'w').unwrap();

        assert_eq!(
            cache.try_get(&"k").unwrap(),
            Some(('w', Duration::from_secs(42)))
        );
    }

    #[test]
    fn disposed_cache_rejects_operations() {
        let cache = TtlCache::new(HOUR);
        cache.try_add(1, 1, HOUR).unwrap();

        cache.dispose();
        cache.dispose();

        assert!(cache.is_disposed());
        assert!(cache.is_empty());
        assert!(matches!(cache.try_get(&1), Err(GatewayError::Disposed)));
        assert!(matches!(cache.try_add(2, 2, HOUR), Err(GatewayError::Disposed)));
        assert!(matches!(
            cache.get_or_add(3, |_, _: ()| (3, HOUR), ()),
            Err(GatewayError::Disposed)
        ));
        assert!(matches!(cache.try_remove(&1), Err(GatewayError::Disposed)));
        assert!(matches!(cache.sweep(), Err(GatewayError::Disposed)));
    }

    #[test]
    fn background_sweeper_reclaims_untouched_keys() {
        let cache = TtlCache::new(HOUR);
        cache.try_add("idle", 1, Duration::from_millis(20)).unwrap();
        cache.start_sweeper(Duration::from_millis(10)).unwrap();
        cache.start_sweeper(Duration::from_millis(10)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !cache.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert!(cache.is_empty(), "sweeper should have evicted the idle key");
        cache.dispose();
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let cache: TtlCache<u8, u8> = TtlCache::new(HOUR);
        assert!(matches!(
            cache.start_sweeper(Duration::ZERO),
            Err(GatewayError::InvalidArgument(_))
        ));
    }
}
