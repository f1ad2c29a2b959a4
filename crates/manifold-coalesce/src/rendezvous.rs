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

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(5 * 60);

/// Publish/wait rendezvous keyed by `K`.
///
/// Producers [`set`](Rendezvous::set) a value once per key — the first
/// writer wins, later writes are silently ignored. Consumers
/// [`wait`](Rendezvous::wait) for it: waiters already parked are woken,
/// waiters arriving after publication (and before the value's TTL) return
/// immediately.
///
/// The two sides age on independent clocks. A key that nobody publishes
/// within `request_timeout` is latched to `V::default()` so current *and*
/// late waiters observe the zero value; a published (or latched) value is
/// discarded `response_ttl` later. Exactly one timer is live per entry at
/// any time: the wait-timer until publication, then the TTL timer. After
/// all work finishes and TTLs elapse the map holds zero entries.
pub struct Rendezvous<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Rendezvous<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V> {
    state: Mutex<HashMap<K, Entry<V>, RandomState>>,
    request_timeout: Duration,
    response_ttl: Duration,
    cancel: CancellationToken,
}

struct Entry<V> {
    value: Option<V>,
    waiters: Vec<oneshot::Sender<V>>,
    timer: Option<AbortHandle>,
}

impl<V> Entry<V> {
    fn empty() -> Self {
        Self {
            value: None,
            waiters: Vec::new(),
            timer: None,
        }
    }
}

/// Configures a [`Rendezvous`] map.
pub struct Builder<K, V> {
    request_timeout: Duration,
    response_ttl: Duration,
    cancel: Option<CancellationToken>,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V> Builder<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Default + Send + 'static,
{
    /// Consumer-side bound: how long a wait may go unanswered (default 10 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Value-side bound: how long a published value is retained (default
    /// 5 min).
    pub fn response_ttl(mut self, ttl: Duration) -> Self {
        self.response_ttl = ttl;
        self
    }

    /// Cancellation handle; on trigger, pending waiters receive the zero
    /// value and all entry timers are released.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> Rendezvous<K, V> {
        Rendezvous {
            inner: Arc::new(Inner {
                state: Mutex::new(HashMap::default()),
                request_timeout: self.request_timeout,
                response_ttl: self.response_ttl,
                cancel: self.cancel.unwrap_or_default(),
            }),
        }
    }
}

impl<K, V> Rendezvous<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Default + Send + 'static,
{
    pub fn builder() -> Builder<K, V> {
        Builder {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            response_ttl: DEFAULT_RESPONSE_TTL,
            cancel: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Publish `value` for `key`. The first publication wins; this is a
    /// no-op once the key carries a value (including the latched zero after
    /// a wait-timeout). Must be called within a Tokio runtime.
    pub fn set(&self, key: K, value: V) {
        Inner::publish(&self.inner, key, value);
    }

    /// Wait for the value published under `key`.
    ///
    /// Returns immediately when the key is already published; otherwise
    /// parks until publication, the wait-timeout (zero value), or
    /// cancellation (zero value).
    pub async fn wait(&self, key: K) -> V {
        let rx = {
            let mut state = self.inner.state.lock();
            let (tx, rx) = oneshot::channel();
            match state.entry(key.clone()) {
                MapEntry::Occupied(mut occupied) => {
                    if let Some(v) = &occupied.get().value {
                        return v.clone();
                    }
                    occupied.get_mut().waiters.push(tx);
                }
                MapEntry::Vacant(vacant) => {
                    // First waiter arms the wait-timer for this key.
                    let mut entry = Entry::empty();
                    entry.waiters.push(tx);
                    entry.timer = Some(self.spawn_wait_timer(key.clone()));
                    vacant.insert(entry);
                }
            }
            rx
        };
        // A dropped sender means the map itself went away; zero value then
        // too.
        rx.await.unwrap_or_default()
    }

    /// Keys holding either a pending waiter list or a stored value.
    pub fn count(&self) -> usize {
        self.inner.state.lock().len()
    }

    fn spawn_wait_timer(&self, key: K) -> AbortHandle {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let timeout = self.inner.request_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        inner.teardown(&key);
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    // Nobody answered: latch the zero value so current and
                    // late waiters agree, and let the TTL reap the entry.
                    if let Some(inner) = weak.upgrade() {
                        Inner::publish(&inner, key, V::default());
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
    V: Clone + Default + Send + 'static,
{
    fn publish(inner: &Arc<Self>, key: K, value: V) {
        let old_timer = {
            let mut state = inner.state.lock();
            let entry = state.entry(key.clone()).or_insert_with(Entry::empty);
            if entry.value.is_some() {
                return;
            }
            entry.value = Some(value.clone());
            let old_timer = entry.timer.take();
            entry.timer = Some(Self::spawn_ttl_timer(inner, key));
            // Slot-1 buffered sends under the lock: the publisher never
            // blocks on a slow waiter.
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(value.clone());
            }
            old_timer
        };
        if let Some(timer) = old_timer {
            timer.abort();
        }
    }

    fn spawn_ttl_timer(inner: &Arc<Self>, key: K) -> AbortHandle {
        let weak = Arc::downgrade(inner);
        let cancel = inner.cancel.clone();
        let ttl = inner.response_ttl;
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
                Some(entry) => entry.waiters,
                None => return,
            }
        };
        for waiter in waiters {
            let _ = waiter.send(V::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_map() -> Rendezvous<i32, Option<&'static str>> {
        Rendezvous::builder()
            .request_timeout(Duration::from_millis(50))
            .response_ttl(Duration::from_millis(300))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn first_writer_wins() {
        let rv: Rendezvous<i32, Option<&'static str>> = Rendezvous::builder().build();
        rv.set(1, Some("demo"));
        assert_eq!(rv.wait(1).await, Some("demo"));
        rv.set(1, Some("demo-bad"));
        assert_eq!(rv.wait(1).await, Some("demo"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_then_set_and_wait_timeout() {
        let rv = small_map();

        {
            let rv = rv.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                rv.set(1, Some("demo"));
            });
        }
        {
            let rv = rv.clone();
            tokio::spawn(async move {
                // Arrives after key 2's wait-timeout already latched zero.
                tokio::time::sleep(Duration::from_millis(100)).await;
                rv.set(2, Some("demo-w2"));
            });
        }

        let w1 = rv.wait(1).await;
        assert_eq!(w1, Some("demo"));
        assert_eq!(rv.count(), 1);

        let w2 = rv.wait(2).await;
        assert_eq!(w2, None);
        assert_eq!(rv.count(), 2);

        // Both entries latched; late waiters observe the same answers.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rv.wait(1).await, Some("demo"));
        assert_eq!(rv.wait(2).await, None);
        assert_eq!(rv.count(), 2);

        // TTL reaps everything.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(rv.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_before_any_wait_is_retained_for_ttl() {
        let rv = small_map();
        rv.set(5, Some("early"));
        assert_eq!(rv.count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rv.wait(5).await, Some("early"));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(rv.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_leak_after_full_workload() {
        let rv = small_map();

        let mut handles = vec![];
        for k in 0..32 {
            let rv = rv.clone();
            handles.push(tokio::spawn(async move { rv.wait(k).await }));
        }
        for k in 0..16 {
            rv.set(k, Some("v"));
        }
        for (k, h) in handles.into_iter().enumerate() {
            let got = h.await.unwrap();
            if k < 16 {
                assert_eq!(got, Some("v"));
            } else {
                assert_eq!(got, None);
            }
        }

        // request_timeout + response_ttl + epsilon.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(rv.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_waiters_with_zero() {
        let cancel = CancellationToken::new();
        let rv: Rendezvous<i32, Option<&'static str>> = Rendezvous::builder()
            .request_timeout(Duration::from_secs(60))
            .with_cancel(cancel.clone())
            .build();

        let waiter = {
            let rv = rv.clone();
            tokio::spawn(async move { rv.wait(9).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(rv.count(), 0);
    }
}
