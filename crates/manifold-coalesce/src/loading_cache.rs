use crate::error::Error;
use crate::keyed_mutex::KeyedMutex;
use ahash::RandomState;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Loader<K, V> =
    Arc<dyn Fn(K) -> Pin<Box<dyn Future<Output = Result<V, Error>> + Send>> + Send + Sync>;
type Unload<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

/// Keyed cache with bounded capacity, optional load-through and per-entry
/// expiry.
///
/// Capacity eviction is FIFO — insertion order, not recency; overwriting a
/// key keeps its original position. When full, inserting evicts the oldest
/// key and runs the unload callback on a detached task, so unload can never
/// block the cache's own operations.
///
/// At most one of `write_timeout` / `read_timeout` governs the per-entry
/// timer: a write timeout is armed on insert and overwrite, a read (idle)
/// timeout is additionally reset on every read access. With neither, entries
/// persist until capacity eviction or explicit removal.
///
/// With `lock_load` enabled, a miss loads under a per-key [`KeyedMutex`]
/// with a re-check inside the lock, so concurrent misses on one key invoke
/// the loader exactly once while other keys load in parallel. Loader errors
/// are returned to the caller and never cached.
///
/// `LoadingCache` is a cheap handle; clones share state.
pub struct LoadingCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for LoadingCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V> {
    state: RwLock<State<K, V>>,
    loader: Option<Loader<K, V>>,
    unload: Option<Unload<K, V>>,
    max_count: usize,
    write_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    lock_load: bool,
    locks: KeyedMutex<K>,
    cancel: CancellationToken,
    epochs: AtomicU64,
}

struct State<K, V> {
    entries: HashMap<K, Entry<V>, RandomState>,
    // Insertion order, maintained only under a capacity bound.
    order: VecDeque<K>,
}

struct Entry<V> {
    value: V,
    deadline: Option<Instant>,
    epoch: u64,
    timer: Option<AbortHandle>,
}

/// Configures a [`LoadingCache`].
pub struct Builder<K, V> {
    loader: Option<Loader<K, V>>,
    unload: Option<Unload<K, V>>,
    max_count: usize,
    write_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    lock_load: bool,
    cancel: Option<CancellationToken>,
}

impl<K, V> Builder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Load-through function invoked on misses by
    /// [`get`](LoadingCache::get).
    pub fn with_loader<F, Fut>(mut self, loader: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, Error>> + Send + 'static,
    {
        self.loader = Some(Arc::new(move |key| Box::pin(loader(key))));
        self
    }

    /// Callback invoked (on a detached task) for every entry that leaves
    /// the cache: capacity eviction, timer expiry, removal and clear.
    pub fn with_unload<F>(mut self, unload: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.unload = Some(Arc::new(unload));
        self
    }

    /// Capacity bound; 0 means unbounded (default).
    pub fn max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    /// Entry lifetime measured from the last write.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Entry lifetime measured from the last access, read or write.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Serialize loader invocations per key (default false).
    pub fn lock_load(mut self, lock_load: bool) -> Self {
        self.lock_load = lock_load;
        self
    }

    /// Cancellation handle; on trigger, pending expiry timers are released
    /// without evicting.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> LoadingCache<K, V> {
        assert!(
            self.write_timeout.is_none() || self.read_timeout.is_none(),
            "configure at most one of write_timeout and read_timeout"
        );
        tracing::debug!(
            max_count = self.max_count,
            write_timeout_ms = self.write_timeout.map(|d| d.as_millis() as u64),
            read_timeout_ms = self.read_timeout.map(|d| d.as_millis() as u64),
            lock_load = self.lock_load,
            "loading cache created"
        );
        LoadingCache {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    entries: HashMap::default(),
                    order: VecDeque::new(),
                }),
                loader: self.loader,
                unload: self.unload,
                max_count: self.max_count,
                write_timeout: self.write_timeout,
                read_timeout: self.read_timeout,
                lock_load: self.lock_load,
                locks: KeyedMutex::new(),
                cancel: self.cancel.unwrap_or_default(),
                epochs: AtomicU64::new(0),
            }),
        }
    }
}

impl<K, V> LoadingCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder() -> Builder<K, V> {
        Builder {
            loader: None,
            unload: None,
            max_count: 0,
            write_timeout: None,
            read_timeout: None,
            lock_load: false,
            cancel: None,
        }
    }

    /// Whether `key` is cached. Under a read timeout, a hit counts as an
    /// access and resets the idle timer.
    pub fn contains(&self, key: &K) -> bool {
        if let Some(read_timeout) = self.inner.read_timeout {
            let mut state = self.inner.state.write();
            match state.entries.get_mut(key) {
                Some(entry) => {
                    entry.deadline = Some(Instant::now() + read_timeout);
                    true
                }
                None => false,
            }
        } else {
            self.inner.state.read().entries.contains_key(key)
        }
    }

    /// Return the cached value for `key`, loading it through the configured
    /// loader on a miss.
    ///
    /// A miss with no loader is `Ok(None)` — a distinct state, not an
    /// error. Loader failures propagate and nothing is stored, so the next
    /// call retries. When two unlocked loads race, the first stored value
    /// wins and the loser's result is discarded.
    pub async fn get(&self, key: &K) -> Result<Option<V>, Error> {
        if let Some(value) = self.lookup(key) {
            return Ok(Some(value));
        }
        let Some(loader) = self.inner.loader.clone() else {
            return Ok(None);
        };

        if self.inner.lock_load {
            let _guard = self.inner.locks.lock(key.clone()).await;
            // Re-check: the previous holder may have loaded this key.
            if let Some(value) = self.lookup(key) {
                return Ok(Some(value));
            }
            let loaded = loader(key.clone()).await?;
            Ok(Some(self.store(key.clone(), loaded, false)))
        } else {
            let loaded = loader(key.clone()).await?;
            Ok(Some(self.store(key.clone(), loaded, false)))
        }
    }

    /// Insert or overwrite. Overwrite keeps the key's FIFO position and
    /// re-arms its timer; insert may capacity-evict the FIFO head.
    pub fn insert(&self, key: K, value: V) {
        self.store(key, value, true);
    }

    /// Atomic test-and-set on absence. Returns whether the key was already
    /// present; the stored value is untouched when it was.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        self.store_checked(key, value, false).1
    }

    /// Run `f` under the per-key lock and install its return value.
    ///
    /// `f` receives the current cached value (if any); the whole
    /// read-modify-write is exclusive against other `update_locked` and
    /// lock-load calls for the same key.
    pub async fn update_locked<F, Fut>(&self, key: K, f: F) -> V
    where
        F: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = V>,
    {
        let _guard = self.inner.locks.lock(key.clone()).await;
        let current = {
            let state = self.inner.state.read();
            state.entries.get(&key).map(|entry| entry.value.clone())
        };
        let value = f(current).await;
        self.store(key, value.clone(), true);
        value
    }

    /// Remove `key`, stop its timer and run unload. Returns whether it was
    /// present.
    pub fn remove(&self, key: &K) -> bool {
        let removed = {
            let mut state = self.inner.state.write();
            match state.entries.remove(key) {
                Some(entry) => {
                    if self.inner.max_count > 0 {
                        state.order.retain(|k| k != key);
                    }
                    Some(entry)
                }
                None => None,
            }
        };
        match removed {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                self.inner.run_unload(key.clone(), entry.value);
                true
            }
            None => false,
        }
    }

    /// Remove every entry, stopping timers and running unload for each.
    pub fn clear(&self) {
        let drained: Vec<(K, Entry<V>)> = {
            let mut state = self.inner.state.write();
            state.order.clear();
            state.entries.drain().collect()
        };
        for (key, entry) in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            self.inner.run_unload(key, entry.value);
        }
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.inner.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `key`, counting the access against a configured read timeout.
    fn lookup(&self, key: &K) -> Option<V> {
        if let Some(read_timeout) = self.inner.read_timeout {
            let mut state = self.inner.state.write();
            let entry = state.entries.get_mut(key)?;
            entry.deadline = Some(Instant::now() + read_timeout);
            Some(entry.value.clone())
        } else {
            let state = self.inner.state.read();
            state.entries.get(key).map(|entry| entry.value.clone())
        }
    }

    /// Shared write path. With `overwrite`, an existing value is replaced
    /// and its timer re-armed; without it, an existing value wins and is
    /// returned (the load-race rule).
    fn store(&self, key: K, value: V, overwrite: bool) -> V {
        self.store_checked(key, value, overwrite).0
    }

    /// [`store`](Self::store) that also reports whether the key was present
    /// before the call, decided under the same write acquisition.
    fn store_checked(&self, key: K, value: V, overwrite: bool) -> (V, bool) {
        let (result, was_present, evicted) = {
            let mut state = self.inner.state.write();
            if let Some(entry) = state.entries.get_mut(&key) {
                if !overwrite {
                    return (entry.value.clone(), true);
                }
                entry.value = value.clone();
                if let Some(timeout) = self.inner.entry_timeout() {
                    entry.deadline = Some(Instant::now() + timeout);
                }
                (value, true, Vec::new())
            } else {
                let mut evicted = Vec::new();
                if self.inner.max_count > 0 {
                    while state.order.len() >= self.inner.max_count {
                        let oldest = state.order.pop_front().unwrap();
                        if let Some(entry) = state.entries.remove(&oldest) {
                            evicted.push((oldest, entry));
                        }
                    }
                    state.order.push_back(key.clone());
                }
                let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
                let deadline = self
                    .inner
                    .entry_timeout()
                    .map(|timeout| Instant::now() + timeout);
                let timer = deadline
                    .is_some()
                    .then(|| spawn_expiry(&self.inner, key.clone(), epoch));
                state.entries.insert(
                    key,
                    Entry {
                        value: value.clone(),
                        deadline,
                        epoch,
                        timer,
                    },
                );
                (value, false, evicted)
            }
        };
        for (key, entry) in evicted {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            tracing::trace!("capacity eviction");
            self.inner.run_unload(key, entry.value);
        }
        (result, was_present)
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn entry_timeout(&self) -> Option<Duration> {
        self.write_timeout.or(self.read_timeout)
    }

    fn run_unload(&self, key: K, value: V) {
        if let Some(unload) = &self.unload {
            let unload = Arc::clone(unload);
            tokio::spawn(async move { unload(key, value) });
        }
    }
}

/// Per-entry expiry task: sleeps to the entry's deadline and re-sleeps when
/// an access has pushed it out. The epoch guards against a stale task
/// expiring a re-inserted key.
fn spawn_expiry<K, V>(inner: &Arc<Inner<K, V>>, key: K, epoch: u64) -> AbortHandle
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let weak: Weak<Inner<K, V>> = Arc::downgrade(inner);
    let cancel = inner.cancel.clone();
    tokio::spawn(async move {
        loop {
            let deadline = {
                let Some(inner) = weak.upgrade() else { return };
                let state = inner.state.read();
                match state.entries.get(&key) {
                    Some(entry) if entry.epoch == epoch => entry.deadline,
                    _ => return,
                }
            };
            let Some(deadline) = deadline else { return };

            if Instant::now() >= deadline {
                let Some(inner) = weak.upgrade() else { return };
                let expired = {
                    let mut state = inner.state.write();
                    match state.entries.get(&key) {
                        Some(entry)
                            if entry.epoch == epoch
                                && entry.deadline.is_some_and(|d| d <= Instant::now()) =>
                        {
                            let entry = state.entries.remove(&key).unwrap();
                            if inner.max_count > 0 {
                                state.order.retain(|k| k != &key);
                            }
                            Some(entry.value)
                        }
                        _ => None,
                    }
                };
                if let Some(value) = expired {
                    tracing::trace!("entry expired");
                    inner.run_unload(key, value);
                }
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    })
    .abort_handle()
}

/// Embeddable configuration for a [`LoadingCache`], deserializable from the
/// host application's config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub max_count: usize,
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub lock_load: bool,
}

impl CacheConfig {
    /// Start a builder with this configuration applied.
    pub fn into_builder<K, V>(self) -> Builder<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let mut builder = LoadingCache::builder().max_count(self.max_count);
        if let Some(ms) = self.write_timeout_ms {
            builder = builder.write_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.read_timeout_ms {
            builder = builder.read_timeout(Duration::from_millis(ms));
        }
        builder.lock_load(self.lock_load)
    }
}
