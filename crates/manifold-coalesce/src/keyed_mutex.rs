use ahash::RandomState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};

/// A mutex per key, created lazily on first lock.
///
/// Lookup is a read acquisition on the key→mutex map; a missing entry is
/// created under a double-checked write acquisition, so two racing first
/// lockers end up sharing one mutex. Unlocking is dropping the returned
/// guard — there is nothing to "unlock" for a key that was never locked.
///
/// The map never shrinks: a key's mutex is retained for reuse. For very
/// large key spaces prefer hashing keys down to a fixed stripe count before
/// locking; the callers here only need exclusion per key, not identity.
pub struct KeyedMutex<K> {
    locks: RwLock<HashMap<K, Arc<Mutex<()>>, RandomState>>,
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::default()),
        }
    }

    /// Lock the mutex for `key`, creating it on first use. The critical
    /// section lasts until the guard is dropped.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        self.mutex_for(key).lock_owned().await
    }

    /// Number of keys that have materialized a mutex.
    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }

    fn mutex_for(&self, key: K) -> Arc<Mutex<()>> {
        if let Some(m) = self.locks.read().get(&key) {
            return Arc::clone(m);
        }
        let mut locks = self.locks.write();
        // Re-check: another task may have created it between the two
        // acquisitions.
        Arc::clone(locks.entry(key).or_default())
    }
}

/// Read-write variant of [`KeyedMutex`]: shared `read` access and exclusive
/// `write` access per key.
pub struct KeyedRwMutex<K> {
    locks: RwLock<HashMap<K, Arc<AsyncRwLock<()>>, RandomState>>,
}

impl<K> Default for KeyedRwMutex<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedRwMutex<K>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::default()),
        }
    }

    /// Acquire shared access for `key`.
    pub async fn read(&self, key: K) -> OwnedRwLockReadGuard<()> {
        self.lock_for(key).read_owned().await
    }

    /// Acquire exclusive access for `key`.
    pub async fn write(&self, key: K) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(key).write_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }

    fn lock_for(&self, key: K) -> Arc<AsyncRwLock<()>> {
        if let Some(l) = self.locks.read().get(&key) {
            return Arc::clone(l);
        }
        let mut locks = self.locks.write();
        Arc::clone(locks.entry(key).or_default())
    }
}
