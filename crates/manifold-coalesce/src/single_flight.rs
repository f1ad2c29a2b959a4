use crate::error::Error;
use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// At-most-once computation per key.
///
/// Concurrent `get_or_create` calls for the same key share one underlying
/// computation: the first caller becomes the owner and runs the loader on a
/// spawned task, everyone else subscribes and receives the owner's result.
/// A resolved result — value *or* error — is retained for `ttl` and served
/// to late callers without re-invoking the loader; after the TTL a sweeper
/// removes the record and the next call recomputes.
///
/// Errors are cached by default so that a failing backend dedupes retry
/// storms the same way a healthy one dedupes loads; callers that want
/// re-attempts shorten the TTL or disable [`Builder::cache_errors`].
///
/// `SingleFlight` is a cheap handle; clones share state.
pub struct SingleFlight<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V> {
    state: Mutex<State<K, V>>,
    ttl: Duration,
    cache_errors: bool,
    cancel: CancellationToken,
}

struct State<K, V> {
    flights: HashMap<K, Flight<V>, RandomState>,
    resolved: HashMap<K, Resolved<V>, RandomState>,
    // Time-ordered sweep queue; one sweeper amortizes removal over many
    // ephemeral records instead of one timer per entry.
    sweep: VecDeque<(Instant, K)>,
    next_flight_id: u64,
}

struct Flight<V> {
    id: u64,
    waiters: Vec<oneshot::Sender<Result<V, Error>>>,
}

struct Resolved<V> {
    result: Result<V, Error>,
    resolved_at: Instant,
}

/// Configures a [`SingleFlight`] map.
pub struct Builder<K, V> {
    ttl: Duration,
    seeds: Vec<(K, Result<V, Error>)>,
    cache_errors: bool,
    cancel: Option<CancellationToken>,
}

impl<K, V> Builder<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Install a pre-computed record. Seeds age out through the normal TTL
    /// sweep, counted from build time.
    pub fn seed(mut self, key: K, result: Result<V, Error>) -> Self {
        self.seeds.push((key, result));
        self
    }

    /// Whether resolved errors are retained for the TTL like values
    /// (default: true). When disabled an error is still broadcast to the
    /// flight's waiters but the next call re-invokes the loader.
    pub fn cache_errors(mut self, cache: bool) -> Self {
        self.cache_errors = cache;
        self
    }

    /// Cancellation handle governing the sweeper and parked callers.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the map and start its sweeper. Must be called within a Tokio
    /// runtime.
    pub fn build(self) -> SingleFlight<K, V> {
        let now = Instant::now();
        let mut state = State {
            flights: HashMap::default(),
            resolved: HashMap::default(),
            sweep: VecDeque::new(),
            next_flight_id: 0,
        };
        for (key, result) in self.seeds {
            state.sweep.push_back((now, key.clone()));
            state.resolved.insert(
                key,
                Resolved {
                    result,
                    resolved_at: now,
                },
            );
        }

        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            ttl: self.ttl,
            cache_errors: self.cache_errors,
            cancel: self.cancel.unwrap_or_default(),
        });

        spawn_sweeper(&inner);
        SingleFlight { inner }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Start configuring a map whose resolved records live for `ttl`.
    pub fn builder(ttl: Duration) -> Builder<K, V> {
        Builder {
            ttl,
            seeds: Vec::new(),
            cache_errors: true,
            cancel: None,
        }
    }

    /// Return the resolved record for `key`, subscribing to an in-flight
    /// computation or becoming its owner as needed.
    ///
    /// The loader runs on a spawned task, outside any lock, so it survives
    /// the initiating caller being dropped and a slow subscriber cannot
    /// stall it. Every caller that shares a flight observes the identical
    /// `Result`.
    pub async fn get_or_create<F, Fut>(&self, key: K, loader: F) -> Result<V, Error>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, Error>> + Send + 'static,
    {
        let rx = {
            let mut state = self.inner.state.lock();
            if let Some(rec) = state.resolved.get(&key) {
                // Lazy expiry covers the window between sweeps.
                if rec.resolved_at.elapsed() < self.inner.ttl {
                    return rec.result.clone();
                }
                state.resolved.remove(&key);
            }

            let (tx, rx) = oneshot::channel();
            match state.flights.get_mut(&key) {
                Some(flight) => flight.waiters.push(tx),
                None => {
                    let id = state.next_flight_id;
                    state.next_flight_id += 1;
                    state.flights.insert(
                        key.clone(),
                        Flight {
                            id,
                            waiters: vec![tx],
                        },
                    );
                    let inner = Arc::clone(&self.inner);
                    let owned_key = key.clone();
                    tokio::spawn(async move {
                        let result = loader(owned_key.clone()).await;
                        inner.resolve(owned_key, id, result);
                    });
                }
            }
            rx
        };

        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::Cancelled),
            res = rx => res.unwrap_or(Err(Error::Cancelled)),
        }
    }

    /// [`get_or_create`](Self::get_or_create) bounded by `dur`.
    ///
    /// On expiry the flight is abandoned: its record is dropped, every
    /// subscriber receives [`Error::Timeout`], and the owner's eventual
    /// result is discarded without being cached.
    pub async fn get_or_create_timeout<F, Fut>(
        &self,
        key: K,
        dur: Duration,
        loader: F,
    ) -> Result<V, Error>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, Error>> + Send + 'static,
    {
        match tokio::time::timeout(dur, self.get_or_create(key.clone(), loader)).await {
            Ok(res) => res,
            Err(_) => {
                self.inner.abandon(&key);
                Err(Error::Timeout)
            }
        }
    }

    /// Pending flights plus cached records.
    pub fn count(&self) -> usize {
        let state = self.inner.state.lock();
        state.flights.len() + state.resolved.len()
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn resolve(&self, key: K, id: u64, result: Result<V, Error>) {
        let waiters = {
            let mut state = self.state.lock();
            match state.flights.get(&key) {
                // Flight was abandoned (or superseded): drop the late result.
                Some(flight) if flight.id == id => {}
                _ => return,
            }
            let flight = state.flights.remove(&key).unwrap();
            if result.is_ok() || self.cache_errors {
                let now = Instant::now();
                state.sweep.push_back((now, key.clone()));
                state.resolved.insert(
                    key,
                    Resolved {
                        result: result.clone(),
                        resolved_at: now,
                    },
                );
            }
            flight.waiters
        };
        // Buffered one-shot sends: a gone waiter is not an error and a slow
        // one cannot block the broadcast.
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn abandon(&self, key: &K) {
        let waiters = {
            let mut state = self.state.lock();
            match state.flights.remove(key) {
                Some(flight) => flight.waiters,
                None => return,
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Error::Timeout));
        }
    }

    fn sweep_expired(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        loop {
            match state.sweep.front() {
                Some((resolved_at, _)) if now.duration_since(*resolved_at) >= self.ttl => {}
                _ => break,
            }
            let (resolved_at, key) = state.sweep.pop_front().unwrap();
            // The key may have re-resolved since; only the matching record
            // generation is removed.
            if state
                .resolved
                .get(&key)
                .is_some_and(|rec| rec.resolved_at == resolved_at)
            {
                state.resolved.remove(&key);
            }
        }
    }
}

fn spawn_sweeper<K, V>(inner: &Arc<Inner<K, V>>)
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    let weak: Weak<Inner<K, V>> = Arc::downgrade(inner);
    let cancel = inner.cancel.clone();
    let period = (inner.ttl / 4).clamp(Duration::from_millis(5), Duration::from_secs(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            inner.sweep_expired();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn long_loader(
        work: Arc<AtomicU32>,
    ) -> impl Fn(i32) -> std::pin::Pin<Box<dyn Future<Output = Result<String, Error>> + Send>>
           + Clone
           + Send
           + 'static {
        move |k| {
            let work = Arc::clone(&work);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                work.fetch_add(1, Ordering::SeqCst);
                Ok(format!("long:{k}"))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_flight() {
        let sf: SingleFlight<i32, String> = SingleFlight::builder(Duration::from_millis(200)).build();
        let work = Arc::new(AtomicU32::new(0));
        let loader = long_loader(Arc::clone(&work));

        let mut handles = vec![];
        for _ in 0..4 {
            let sf = sf.clone();
            let loader = loader.clone();
            handles.push(tokio::spawn(async move { sf.get_or_create(1, loader).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "long:1");
        }
        assert_eq!(work.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_recomputes_after_expiry() {
        let sf: SingleFlight<i32, String> = SingleFlight::builder(Duration::from_millis(200)).build();
        let work = Arc::new(AtomicU32::new(0));
        let loader = long_loader(Arc::clone(&work));

        assert_eq!(sf.get_or_create(1, loader.clone()).await.unwrap(), "long:1");
        assert_eq!(sf.get_or_create(2, loader.clone()).await.unwrap(), "long:2");
        assert_eq!(work.load(Ordering::SeqCst), 2);

        // Still cached: no extra work.
        assert_eq!(sf.get_or_create(2, loader.clone()).await.unwrap(), "long:2");
        assert_eq!(work.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sf.get_or_create(2, loader.clone()).await.unwrap(), "long:2");
        assert_eq!(work.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_cached_and_shared() {
        let sf: SingleFlight<&str, String> = SingleFlight::builder(Duration::from_secs(60)).build();
        let work = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let work = Arc::clone(&work);
            let res = sf
                .get_or_create("k", move |_| async move {
                    work.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(Error::load("backend down"))
                })
                .await;
            assert!(matches!(res, Err(Error::Load(_))));
        }
        assert_eq!(work.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn uncached_errors_retry() {
        let sf: SingleFlight<&str, String> = SingleFlight::builder(Duration::from_secs(60))
            .cache_errors(false)
            .build();
        let work = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let work = Arc::clone(&work);
            let res = sf
                .get_or_create("k", move |_| async move {
                    work.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(Error::load("backend down"))
                })
                .await;
            assert!(res.is_err());
            // Let the owner task publish before the next attempt.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(work.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_abandons_the_flight() {
        let sf: SingleFlight<i32, String> = SingleFlight::builder(Duration::from_millis(200)).build();
        let work = Arc::new(AtomicU32::new(0));
        let loader = long_loader(Arc::clone(&work));

        let res = sf
            .get_or_create_timeout(1, Duration::from_millis(50), loader.clone())
            .await;
        assert!(matches!(res, Err(Error::Timeout)));

        // The owner finishes after the deadline; its result must not be
        // cached.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sf.count(), 0);
        assert_eq!(sf.get_or_create(1, loader).await.unwrap(), "long:1");
        assert_eq!(work.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn seeds_serve_without_loading() {
        let sf: SingleFlight<i32, String> = SingleFlight::builder(Duration::from_millis(100))
            .seed(7, Ok("seeded".to_string()))
            .build();
        let work = Arc::new(AtomicU32::new(0));
        let loader = long_loader(Arc::clone(&work));

        assert_eq!(sf.get_or_create(7, loader.clone()).await.unwrap(), "seeded");
        assert_eq!(work.load(Ordering::SeqCst), 0);

        // Seeds age out like any other record.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sf.get_or_create(7, loader).await.unwrap(), "long:7");
        assert_eq!(work.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn count_tracks_flights_and_records() {
        let sf: SingleFlight<i32, String> = SingleFlight::builder(Duration::from_millis(100)).build();
        let work = Arc::new(AtomicU32::new(0));
        let loader = long_loader(Arc::clone(&work));

        let pending = {
            let sf = sf.clone();
            let loader = loader.clone();
            tokio::spawn(async move { sf.get_or_create(1, loader).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sf.count(), 1);

        pending.await.unwrap().unwrap();
        assert_eq!(sf.count(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sf.count(), 0);
    }
}
