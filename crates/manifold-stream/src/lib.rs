//! Pipelined stream routing over tokio channels.
//!
//! A [`ShardRouter`] partitions one input stream into N per-shard queues by
//! a key function; a [`Chunker`] aggregates a stream into size- or
//! time-bounded batches; a [`ShardChunkPipeline`] composes the two so that
//! each shard batches independently and hands its batches to a worker.
//!
//! Ordering holds within a shard (arrival order into batches) and nowhere
//! else. Emission blocks under backpressure — there is no drop policy.
//! Cancelling the governing [`CancellationToken`] halts every background
//! task without draining; dropping a component instead closes its input and
//! lets the stream wind down (the chunker flushes its partial batch once).
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod chunker;
pub mod error;
pub mod pipeline;
pub mod shard;

pub use chunker::Chunker;
pub use error::Error;
pub use pipeline::{PipelineConfig, ShardChunkPipeline};
pub use shard::ShardRouter;
