use crate::error::Error;
use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DESTROY_TTL: Duration = Duration::from_secs(5 * 60);

/// Rendezvous on completion of a keyed transaction.
///
/// Unlike [`Rendezvous`](crate::Rendezvous), where producers hand a value to
/// consumers, a `CompletionMap` holder carries a mutable payload installed by
/// the first waiter; producers then [`release`](CompletionMap::release) or
/// [`fail`](CompletionMap::fail) the key and every waiter observes the same
/// outcome. Operations on unknown keys return [`Error::NotFound`] —
/// informational, the caller decides whether that matters.
///
/// A completed holder is retained for a destroy-TTL so late `get`/`wait`
/// calls still observe the outcome, then removed.
pub struct CompletionMap<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for CompletionMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V> {
    state: Mutex<HashMap<K, Holder<V>, RandomState>>,
    timeout: Duration,
    destroy_ttl: Duration,
    cancel: CancellationToken,
}

struct Holder<V> {
    payload: V,
    outcome: Option<Result<(), Error>>,
    waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    timer: Option<AbortHandle>,
}

/// Configures a [`CompletionMap`].
pub struct Builder<K, V> {
    timeout: Duration,
    destroy_ttl: Duration,
    cancel: Option<CancellationToken>,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V> Builder<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// How long a holder may stay incomplete before waiters receive
    /// [`Error::Timeout`] (default 10 s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// How long a completed holder is retained for late observers
    /// (default 5 min).
    pub fn destroy_ttl(mut self, ttl: Duration) -> Self {
        self.destroy_ttl = ttl;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> CompletionMap<K, V> {
        CompletionMap {
            inner: Arc::new(Inner {
                state: Mutex::new(HashMap::default()),
                timeout: self.timeout,
                destroy_ttl: self.destroy_ttl,
                cancel: self.cancel.unwrap_or_default(),
            }),
        }
    }
}

impl<K, V> CompletionMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn builder() -> Builder<K, V> {
        Builder {
            timeout: DEFAULT_TIMEOUT,
            destroy_ttl: DEFAULT_DESTROY_TTL,
            cancel: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Block until `key` is released, failed, or timed out.
    ///
    /// The first waiter installs the holder with `payload` and arms its
    /// timeout; later waiters join it (their payload argument is ignored —
    /// the holder already carries one). Waiters arriving after completion
    /// observe the stored outcome immediately.
    pub async fn wait(&self, key: K, payload: V) -> Result<(), Error> {
        let rx = {
            let mut state = self.inner.state.lock();
            let (tx, rx) = oneshot::channel();
            match state.entry(key.clone()) {
                MapEntry::Occupied(mut occupied) => {
                    if let Some(outcome) = &occupied.get().outcome {
                        return outcome.clone();
                    }
                    occupied.get_mut().waiters.push(tx);
                }
                MapEntry::Vacant(vacant) => {
                    vacant.insert(Holder {
                        payload,
                        outcome: None,
                        waiters: vec![tx],
                        timer: Some(self.spawn_timeout_timer(key)),
                    });
                }
            }
            rx
        };
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Current payload for `key`, or the holder's failure if it completed
    /// with one.
    pub fn get(&self, key: &K) -> Result<V, Error> {
        let state = self.inner.state.lock();
        let holder = state.get(key).ok_or(Error::NotFound)?;
        match &holder.outcome {
            Some(Err(err)) => Err(err.clone()),
            _ => Ok(holder.payload.clone()),
        }
    }

    /// Replace the payload of a live holder.
    pub fn update(&self, key: &K, payload: V) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        let holder = state.get_mut(key).ok_or(Error::NotFound)?;
        holder.payload = payload;
        Ok(())
    }

    /// Complete `key` successfully, waking every waiter.
    pub fn release(&self, key: &K) -> Result<(), Error> {
        Inner::complete(&self.inner, key, Ok(()))
    }

    /// Complete `key` with `err`; waiters and late observers see it.
    pub fn fail(&self, key: &K, err: Error) -> Result<(), Error> {
        Inner::complete(&self.inner, key, Err(err))
    }

    /// Live holders, completed ones included until their destroy-TTL.
    pub fn count(&self) -> usize {
        self.inner.state.lock().len()
    }

    fn spawn_timeout_timer(&self, key: K) -> AbortHandle {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let timeout = self.inner.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        inner.teardown(&key);
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    if let Some(inner) = weak.upgrade() {
                        let _ = Inner::complete(&inner, &key, Err(Error::Timeout));
                    }
                }
            }
        })
        .abort_handle()
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn complete(inner: &Arc<Self>, key: &K, outcome: Result<(), Error>) -> Result<(), Error> {
        let (waiters, old_timer) = {
            let mut state = inner.state.lock();
            let holder = state.get_mut(key).ok_or(Error::NotFound)?;
            if holder.outcome.is_some() {
                // Already completed; releasing twice is not an error.
                return Ok(());
            }
            holder.outcome = Some(outcome.clone());
            let old_timer = holder.timer.take();
            holder.timer = Some(Self::spawn_destroy_timer(inner, key.clone()));
            (std::mem::take(&mut holder.waiters), old_timer)
        };
        if let Some(timer) = old_timer {
            timer.abort();
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        Ok(())
    }

    fn spawn_destroy_timer(inner: &Arc<Self>, key: K) -> AbortHandle {
        let weak = Arc::downgrade(inner);
        let cancel = inner.cancel.clone();
        let ttl = inner.destroy_ttl;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {}
            }
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().remove(&key);
            }
        })
        .abort_handle()
    }

    fn teardown(&self, key: &K) {
        let waiters = {
            let mut state = self.state.lock();
            match state.remove(key) {
                Some(holder) => holder.waiters,
                None => return,
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Error::Cancelled));
        }
    }
}
