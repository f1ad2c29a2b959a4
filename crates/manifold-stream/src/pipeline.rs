use crate::chunker::{Chunker, DEFAULT_CHUNK_TIMEOUT, DEFAULT_INCOMING_BUFFER, DEFAULT_OUTGOING_BUFFER};
use crate::error::Error;
use crate::shard::{ShardFn, ShardRouter, DEFAULT_SHARD_COUNT};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_PIPELINE_CHUNK_SIZE: usize = 500;

/// Worker invoked with a shard index and one batch from that shard.
pub type ShardWorker<T> = Arc<dyn Fn(usize, Vec<T>) + Send + Sync>;

/// Shard-then-chunk pipeline.
///
/// Items pushed into the pipeline are routed to one of N shards by the
/// shard function, and each shard aggregates its items into size- or
/// time-bounded batches independently. Batches either feed the configured
/// `shard_worker` or are exposed per shard via
/// [`take_batches`](ShardChunkPipeline::take_batches).
///
/// Per-shard arrival order is preserved into batches; nothing is ordered
/// across shards. Every queue along the path blocks when full, so a slow
/// worker backpressures the whole pipeline back to the producers.
#[derive(Debug)]
pub struct ShardChunkPipeline<T> {
    router: ShardRouter<T>,
    batches: Vec<Option<mpsc::Receiver<Vec<T>>>>,
}

/// Configures a [`ShardChunkPipeline`].
pub struct Builder<T> {
    shard_fn: Option<ShardFn<T>>,
    shard_count: usize,
    chunk_size: usize,
    chunk_timeout: Duration,
    incoming_buffer: usize,
    outgoing_buffer: usize,
    input: Option<mpsc::Receiver<T>>,
    shard_worker: Option<ShardWorker<T>>,
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

    /// Number of shards (default 4).
    pub fn shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    /// Per-shard batch size bound (default 500).
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Per-shard flush tick (default 50 ms).
    pub fn chunk_timeout(mut self, chunk_timeout: Duration) -> Self {
        self.chunk_timeout = chunk_timeout;
        self
    }

    /// Pipeline input capacity (default 1000); the per-shard queues are
    /// sized to `incoming_buffer / shard_count`.
    pub fn incoming_buffer(mut self, capacity: usize) -> Self {
        self.incoming_buffer = capacity;
        self
    }

    /// Per-shard batch queue capacity (default 100).
    pub fn outgoing_buffer(mut self, capacity: usize) -> Self {
        self.outgoing_buffer = capacity;
        self
    }

    /// Consume an existing queue instead of creating one. The builder keeps
    /// no sender for it, so [`ShardChunkPipeline::push`] reports
    /// [`Error::Closed`] — push through your own sender.
    pub fn with_input(mut self, input: mpsc::Receiver<T>) -> Self {
        self.input = Some(input);
        self
    }

    /// Install a per-shard batch worker. One consumer task per shard reads
    /// its batches and invokes the worker with the shard index; blocking
    /// inside backpressures that shard only. With a worker installed,
    /// [`ShardChunkPipeline::take_batches`] returns `None`.
    pub fn shard_worker<F>(mut self, worker: F) -> Self
    where
        F: Fn(usize, Vec<T>) + Send + Sync + 'static,
    {
        self.shard_worker = Some(Arc::new(worker));
        self
    }

    /// Cancellation handle governing the router, chunkers and workers.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the pipeline and start its background tasks. Fails with
    /// [`Error::ShardFuncMissing`] when no shard function was configured.
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Result<ShardChunkPipeline<T>, Error> {
        let shard_fn = self.shard_fn.ok_or(Error::ShardFuncMissing)?;
        let cancel = self.cancel.unwrap_or_default();

        let mut router_builder = ShardRouter::builder()
            .shard_fn_shared(shard_fn)
            .shard_count(self.shard_count)
            .incoming_buffer(self.incoming_buffer)
            .outgoing_buffer((self.incoming_buffer / self.shard_count).max(1))
            .with_cancel(cancel.clone());
        if let Some(input) = self.input {
            router_builder = router_builder.with_input(input);
        }
        let mut router = router_builder.build()?;

        let shard_count = router.shard_count();
        let mut batches = Vec::with_capacity(shard_count);
        for idx in 0..shard_count {
            let shard_rx = router
                .take_shard(idx)
                .expect("freshly built router exposes every shard");
            let mut chunker_builder = Chunker::builder()
                .chunk_size(self.chunk_size)
                .chunk_timeout(self.chunk_timeout)
                .outgoing_buffer(self.outgoing_buffer)
                .with_input(shard_rx)
                .with_cancel(cancel.clone());
            if let Some(worker) = &self.shard_worker {
                let worker = Arc::clone(worker);
                chunker_builder =
                    chunker_builder.with_consumer(move |batch| worker(idx, batch));
            }
            let mut chunker = chunker_builder.build();
            batches.push(chunker.take_output());
        }

        tracing::debug!(
            shard_count,
            chunk_size = self.chunk_size,
            chunk_timeout_ms = self.chunk_timeout.as_millis() as u64,
            worker = self.shard_worker.is_some(),
            "shard chunk pipeline started"
        );
        Ok(ShardChunkPipeline { router, batches })
    }
}

impl<T> ShardChunkPipeline<T>
where
    T: Send + 'static,
{
    pub fn builder() -> Builder<T> {
        Builder {
            shard_fn: None,
            shard_count: DEFAULT_SHARD_COUNT,
            chunk_size: DEFAULT_PIPELINE_CHUNK_SIZE,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            incoming_buffer: DEFAULT_INCOMING_BUFFER,
            outgoing_buffer: DEFAULT_OUTGOING_BUFFER,
            input: None,
            shard_worker: None,
            cancel: None,
        }
    }

    /// Enqueue one item, suspending under backpressure.
    pub async fn push(&self, item: T) -> Result<(), Error> {
        self.router.push(item).await
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.router.shard_count()
    }

    /// Take shard `idx`'s batch queue. `None` when out of range, already
    /// taken, or a shard worker consumes the batches.
    pub fn take_batches(&mut self, idx: usize) -> Option<mpsc::Receiver<Vec<T>>> {
        self.batches.get_mut(idx)?.take()
    }

    /// Items waiting in each shard queue, ahead of the chunkers.
    pub fn backlogs(&self) -> Vec<usize> {
        self.router.backlogs()
    }
}

/// Embeddable configuration for a [`ShardChunkPipeline`], deserializable
/// from the host application's config file. The shard function and worker
/// stay code-side.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    #[serde(default = "default_incoming_buffer")]
    pub incoming_buffer: usize,
    #[serde(default = "default_outgoing_buffer")]
    pub outgoing_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            chunk_size: default_chunk_size(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            incoming_buffer: default_incoming_buffer(),
            outgoing_buffer: default_outgoing_buffer(),
        }
    }
}

impl PipelineConfig {
    /// Start a builder with this configuration applied.
    pub fn into_builder<T>(self) -> Builder<T>
    where
        T: Send + 'static,
    {
        ShardChunkPipeline::builder()
            .shard_count(self.shard_count)
            .chunk_size(self.chunk_size)
            .chunk_timeout(Duration::from_millis(self.chunk_timeout_ms))
            .incoming_buffer(self.incoming_buffer)
            .outgoing_buffer(self.outgoing_buffer)
    }
}

fn default_shard_count() -> usize {
    DEFAULT_SHARD_COUNT
}
fn default_chunk_size() -> usize {
    DEFAULT_PIPELINE_CHUNK_SIZE
}
fn default_chunk_timeout_ms() -> u64 {
    DEFAULT_CHUNK_TIMEOUT.as_millis() as u64
}
fn default_incoming_buffer() -> usize {
    DEFAULT_INCOMING_BUFFER
}
fn default_outgoing_buffer() -> usize {
    DEFAULT_OUTGOING_BUFFER
}
