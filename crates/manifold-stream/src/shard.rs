use crate::chunker::{DEFAULT_INCOMING_BUFFER, DEFAULT_OUTGOING_BUFFER};
use crate::error::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) const DEFAULT_SHARD_COUNT: usize = 4;

/// Key function deciding which shard an item belongs to. Any integer is
/// accepted; the router normalizes it into `[0, shard_count)`.
pub type ShardFn<T> = Arc<dyn Fn(&T) -> i64 + Send + Sync>;

/// Partitions one input stream into N per-shard queues.
///
/// A background task reads the input queue and forwards each item to shard
/// `shard_fn(item).rem_euclid(N)`, so a deterministic key function pins an
/// item to one shard and per-shard arrival order is the input order. There
/// is no ordering across shards and no drop policy — a full shard queue
/// backpressures the router, and the router backpressures producers.
#[derive(Debug)]
pub struct ShardRouter<T> {
    input: Option<mpsc::Sender<T>>,
    shards: Vec<Option<mpsc::Receiver<T>>>,
    shard_txs: Vec<mpsc::Sender<T>>,
    cancel: CancellationToken,
}

/// Configures a [`ShardRouter`].
pub struct Builder<T> {
    shard_fn: Option<ShardFn<T>>,
    shard_count: usize,
    incoming_buffer: usize,
    outgoing_buffer: usize,
    input: Option<mpsc::Receiver<T>>,
    cancel: Option<CancellationToken>,
}

impl<T> Builder<T>
where
    T: Send + 'static,
{
    /// The shard key function. Required: building without one fails with
    /// [`Error::ShardFuncMissing`].
    pub fn shard_fn<F>(mut self, shard_fn: F) -> Self
    where
        F: Fn(&T) -> i64 + Send + Sync + 'static,
    {
        self.shard_fn = Some(Arc::new(shard_fn));
        self
    }

    pub(crate) fn shard_fn_shared(mut self, shard_fn: ShardFn<T>) -> Self {
        self.shard_fn = Some(shard_fn);
        self
    }

    /// Number of shards (default 4).
    pub fn shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    /// Input queue capacity (default 1000). Ignored when the input queue is
    /// caller-provided.
    pub fn incoming_buffer(mut self, capacity: usize) -> Self {
        self.incoming_buffer = capacity;
        self
    }

    /// Per-shard queue capacity (default 100).
    pub fn outgoing_buffer(mut self, capacity: usize) -> Self {
        self.outgoing_buffer = capacity;
        self
    }

    /// Consume an existing queue instead of creating one. The builder keeps
    /// no sender for it, so [`ShardRouter::push`] reports
    /// [`Error::Closed`] — push through your own sender.
    pub fn with_input(mut self, input: mpsc::Receiver<T>) -> Self {
        self.input = Some(input);
        self
    }

    /// Cancellation handle; on trigger, the router stops without draining.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the router and start its background task. Fails with
    /// [`Error::ShardFuncMissing`] — synchronously, spawning nothing — when
    /// no shard function was configured. Must be called within a Tokio
    /// runtime.
    pub fn build(self) -> Result<ShardRouter<T>, Error> {
        let shard_fn = self.shard_fn.ok_or(Error::ShardFuncMissing)?;
        let cancel = self.cancel.unwrap_or_default();

        let (input_tx, input_rx) = match self.input {
            Some(rx) => (None, rx),
            None => {
                let (tx, rx) = mpsc::channel(self.incoming_buffer);
                (Some(tx), rx)
            }
        };

        let mut shard_txs = Vec::with_capacity(self.shard_count);
        let mut shards = Vec::with_capacity(self.shard_count);
        for _ in 0..self.shard_count {
            let (tx, rx) = mpsc::channel(self.outgoing_buffer);
            shard_txs.push(tx);
            shards.push(Some(rx));
        }

        tracing::debug!(
            shard_count = self.shard_count,
            outgoing_buffer = self.outgoing_buffer,
            "shard router started"
        );
        tokio::spawn(route(
            input_rx,
            shard_txs.clone(),
            shard_fn,
            cancel.clone(),
        ));

        Ok(ShardRouter {
            input: input_tx,
            shards,
            shard_txs,
            cancel,
        })
    }
}

impl<T> ShardRouter<T>
where
    T: Send + 'static,
{
    pub fn builder() -> Builder<T> {
        Builder {
            shard_fn: None,
            shard_count: DEFAULT_SHARD_COUNT,
            incoming_buffer: DEFAULT_INCOMING_BUFFER,
            outgoing_buffer: DEFAULT_OUTGOING_BUFFER,
            input: None,
            cancel: None,
        }
    }

    /// Enqueue one item, suspending under backpressure.
    pub async fn push(&self, item: T) -> Result<(), Error> {
        let Some(input) = &self.input else {
            return Err(Error::Closed);
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Closed),
            res = input.send(item) => res.map_err(|_| Error::Closed),
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shard_txs.len()
    }

    /// Take shard `idx`'s queue. `None` when out of range or already taken.
    pub fn take_shard(&mut self, idx: usize) -> Option<mpsc::Receiver<T>> {
        self.shards.get_mut(idx)?.take()
    }

    /// Items waiting in each shard queue.
    pub fn backlogs(&self) -> Vec<usize> {
        self.shard_txs
            .iter()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .collect()
    }
}

async fn route<T>(
    mut input: mpsc::Receiver<T>,
    shards: Vec<mpsc::Sender<T>>,
    shard_fn: ShardFn<T>,
    cancel: CancellationToken,
) {
    let count = shards.len() as i64;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = input.recv() => match item {
                Some(item) => {
                    let idx = shard_fn(&item).rem_euclid(count) as usize;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        res = shards[idx].send(item) => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn items_land_on_their_shard() {
        let mut router: ShardRouter<i64> = ShardRouter::builder()
            .shard_fn(|item| *item)
            .shard_count(4)
            .build()
            .unwrap();
        let mut receivers: Vec<_> = (0..4).map(|i| router.take_shard(i).unwrap()).collect();

        for item in 0..20 {
            router.push(item).await.unwrap();
        }

        for (idx, rx) in receivers.iter_mut().enumerate() {
            for _ in 0..5 {
                let item = rx.recv().await.unwrap();
                assert_eq!(item.rem_euclid(4) as usize, idx);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn negative_keys_are_normalized() {
        let mut router: ShardRouter<i64> = ShardRouter::builder()
            .shard_fn(|item| *item)
            .shard_count(4)
            .build()
            .unwrap();
        let mut shard3 = router.take_shard(3).unwrap();

        // -1 mod 4 normalizes to 3, not -1.
        router.push(-1).await.unwrap();
        assert_eq!(shard3.recv().await.unwrap(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_shard_fn_fails_construction() {
        let err = ShardRouter::<i64>::builder().build().unwrap_err();
        assert_eq!(err, Error::ShardFuncMissing);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_shard_is_none() {
        let mut router: ShardRouter<i64> = ShardRouter::builder()
            .shard_fn(|item| *item)
            .shard_count(2)
            .build()
            .unwrap();
        assert!(router.take_shard(2).is_none());
        assert!(router.take_shard(0).is_some());
        assert!(router.take_shard(0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn caller_provided_input_is_routed() {
        let (tx, rx) = mpsc::channel(64);
        let mut router: ShardRouter<i64> = ShardRouter::builder()
            .shard_fn(|item| *item)
            .shard_count(2)
            .with_input(rx)
            .build()
            .unwrap();
        let mut shard0 = router.take_shard(0).unwrap();

        tx.send(2).await.unwrap();
        assert_eq!(shard0.recv().await.unwrap(), 2);
        // The router kept no sender for a caller-provided queue.
        assert_eq!(router.push(4).await, Err(Error::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_closes_the_router() {
        let cancel = CancellationToken::new();
        let router: ShardRouter<i64> = ShardRouter::builder()
            .shard_fn(|item| *item)
            .with_cancel(cancel.clone())
            .build()
            .unwrap();

        router.push(1).await.unwrap();
        cancel.cancel();
        assert_eq!(router.push(2).await, Err(Error::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn backlogs_reflect_unconsumed_shards() {
        let router: ShardRouter<i64> = ShardRouter::builder()
            .shard_fn(|_| 0)
            .shard_count(2)
            .build()
            .unwrap();

        for item in 0..5 {
            router.push(item).await.unwrap();
        }
        // Nothing consumes shard 0; let the router drain the input queue.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let backlogs = router.backlogs();
        assert_eq!(backlogs[0], 5);
        assert_eq!(backlogs[1], 0);
    }
}
