use crate::error::Error;
use std::mem;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub(crate) const DEFAULT_CHUNK_SIZE: usize = 100;
pub(crate) const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_millis(50);
pub(crate) const DEFAULT_INCOMING_BUFFER: usize = 1000;
pub(crate) const DEFAULT_OUTGOING_BUFFER: usize = 100;

/// Accumulates a stream of items into batches bounded by size and time.
///
/// A batch is emitted when the in-progress buffer reaches `chunk_size`, or
/// when the periodic tick (`chunk_timeout`) finds the buffer nonempty — a
/// repeating timer, not a deadline on the first item, so worst-case latency
/// is twice the timeout. An empty tick emits nothing; a batch is never
/// empty and items are never split across batches.
///
/// Emission blocks when the outbound queue is full; that backpressure is
/// the only flow control. When the last input sender is dropped the
/// in-progress buffer is flushed once and the background task exits.
pub struct Chunker<T> {
    input: Option<mpsc::Sender<T>>,
    output: Option<mpsc::Receiver<Vec<T>>>,
    cancel: CancellationToken,
}

/// Configures a [`Chunker`].
pub struct Builder<T> {
    chunk_size: usize,
    chunk_timeout: Duration,
    incoming_buffer: usize,
    outgoing_buffer: usize,
    input: Option<mpsc::Receiver<T>>,
    consumer: Option<Box<dyn FnMut(Vec<T>) + Send>>,
    cancel: Option<CancellationToken>,
}

impl<T> Builder<T>
where
    T: Send + 'static,
{
    /// Batch size bound (default 100).
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Periodic flush tick (default 50 ms).
    pub fn chunk_timeout(mut self, chunk_timeout: Duration) -> Self {
        self.chunk_timeout = chunk_timeout;
        self
    }

    /// Input queue capacity (default 1000). Ignored when the input queue is
    /// caller-provided.
    pub fn incoming_buffer(mut self, capacity: usize) -> Self {
        self.incoming_buffer = capacity;
        self
    }

    /// Outbound batch queue capacity (default 100).
    pub fn outgoing_buffer(mut self, capacity: usize) -> Self {
        self.outgoing_buffer = capacity;
        self
    }

    /// Consume an existing queue instead of creating one. The builder keeps
    /// no sender for it, so [`Chunker::push`] reports
    /// [`Error::Closed`] — push through your own sender.
    pub fn with_input(mut self, input: mpsc::Receiver<T>) -> Self {
        self.input = Some(input);
        self
    }

    /// Install a batch consumer. A background task reads every emitted
    /// batch and invokes it; blocking inside backpressures the chunker.
    /// With a consumer installed, [`Chunker::take_output`] returns `None`.
    pub fn with_consumer<F>(mut self, consumer: F) -> Self
    where
        F: FnMut(Vec<T>) + Send + 'static,
    {
        self.consumer = Some(Box::new(consumer));
        self
    }

    /// Cancellation handle; on trigger, the chunker and its consumer stop
    /// without draining.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the chunker and start its background task. Must be called
    /// within a Tokio runtime.
    pub fn build(self) -> Chunker<T> {
        let cancel = self.cancel.unwrap_or_default();
        let (input_tx, input_rx) = match self.input {
            Some(rx) => (None, rx),
            None => {
                let (tx, rx) = mpsc::channel(self.incoming_buffer);
                (Some(tx), rx)
            }
        };
        let (output_tx, output_rx) = mpsc::channel(self.outgoing_buffer);

        tokio::spawn(run(
            input_rx,
            output_tx,
            self.chunk_size,
            self.chunk_timeout,
            cancel.clone(),
        ));

        let output = match self.consumer {
            Some(consumer) => {
                tokio::spawn(consume(output_rx, consumer, cancel.clone()));
                None
            }
            None => Some(output_rx),
        };

        Chunker {
            input: input_tx,
            output,
            cancel,
        }
    }
}

impl<T> Chunker<T>
where
    T: Send + 'static,
{
    pub fn builder() -> Builder<T> {
        Builder {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            incoming_buffer: DEFAULT_INCOMING_BUFFER,
            outgoing_buffer: DEFAULT_OUTGOING_BUFFER,
            input: None,
            consumer: None,
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

    /// Take the outbound batch queue. `None` once taken or when a consumer
    /// callback was installed.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Vec<T>>> {
        self.output.take()
    }

    /// Items waiting in the input queue.
    pub fn backlog(&self) -> usize {
        self.input
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }
}

async fn run<T>(
    mut input: mpsc::Receiver<T>,
    output: mpsc::Sender<Vec<T>>,
    chunk_size: usize,
    chunk_timeout: Duration,
    cancel: CancellationToken,
) {
    // First tick one period out; a ticker, not a per-item deadline. Skip
    // missed ticks so a long backpressure stall flushes once, not N times.
    let mut tick = tokio::time::interval_at(Instant::now() + chunk_timeout, chunk_timeout);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut chunk: Vec<T> = Vec::with_capacity(chunk_size);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                if !chunk.is_empty() {
                    let full = mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        res = output.send(full) => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            item = input.recv() => match item {
                Some(item) => {
                    chunk.push(item);
                    if chunk.len() >= chunk_size {
                        let full = mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            res = output.send(full) => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                None => {
                    // End of stream: flush what is buffered and stop.
                    if !chunk.is_empty() {
                        let _ = output.send(chunk).await;
                    }
                    return;
                }
            }
        }
    }
}

async fn consume<T>(
    mut batches: mpsc::Receiver<Vec<T>>,
    mut consumer: Box<dyn FnMut(Vec<T>) + Send>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            batch = batches.recv() => match batch {
                Some(batch) => consumer(batch),
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn emits_on_size() {
        let mut chunker: Chunker<i32> = Chunker::builder()
            .chunk_size(5)
            .chunk_timeout(Duration::from_millis(100))
            .build();
        let mut output = chunker.take_output().unwrap();

        for i in 0..100 {
            chunker.push(i).await.unwrap();
        }

        let mut last = None;
        while last != Some(99) {
            let batch = output.recv().await.unwrap();
            assert!(!batch.is_empty());
            assert!(batch.len() <= 5);
            last = batch.last().copied();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_partial_batch_on_tick() {
        let mut chunker: Chunker<i32> = Chunker::builder()
            .chunk_size(5)
            .chunk_timeout(Duration::from_millis(100))
            .build();
        let mut output = chunker.take_output().unwrap();

        let started = Instant::now();
        for i in 0..4 {
            chunker.push(i).await.unwrap();
        }

        let batch = output.recv().await.unwrap();
        assert_eq!(batch, vec![0, 1, 2, 3]);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ticks_emit_nothing() {
        let mut chunker: Chunker<i32> = Chunker::builder()
            .chunk_timeout(Duration::from_millis(10))
            .build();
        let mut output = chunker.take_output().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        chunker.push(1).await.unwrap();

        // The only batch is the one holding the item, despite many elapsed
        // ticks.
        let batch = output.recv().await.unwrap();
        assert_eq!(batch, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_callback_receives_batches() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let chunker: Chunker<i32> = Chunker::builder()
            .chunk_size(3)
            .chunk_timeout(Duration::from_millis(50))
            .with_consumer(move |batch| {
                seen_tx.send(batch).unwrap();
            })
            .build();

        for i in 0..7 {
            chunker.push(i).await.unwrap();
        }

        assert_eq!(seen_rx.recv().await.unwrap(), vec![0, 1, 2]);
        assert_eq!(seen_rx.recv().await.unwrap(), vec![3, 4, 5]);
        // The remainder arrives via the tick.
        assert_eq!(seen_rx.recv().await.unwrap(), vec![6]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_without_draining() {
        let cancel = CancellationToken::new();
        let mut chunker: Chunker<i32> = Chunker::builder()
            .chunk_size(10)
            .chunk_timeout(Duration::from_millis(50))
            .with_cancel(cancel.clone())
            .build();
        let mut output = chunker.take_output().unwrap();

        for i in 0..3 {
            chunker.push(i).await.unwrap();
        }
        cancel.cancel();

        // The buffered items are dropped, not flushed.
        assert_eq!(output.recv().await, None);
        assert_eq!(chunker.push(99).await, Err(Error::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_senders_flushes_the_tail() {
        let (tx, rx) = mpsc::channel(16);
        let mut chunker: Chunker<i32> = Chunker::builder()
            .chunk_size(10)
            .chunk_timeout(Duration::from_secs(3600))
            .with_input(rx)
            .build();
        let mut output = chunker.take_output().unwrap();

        for i in 0..4 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        assert_eq!(output.recv().await.unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(output.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_provided_input_disables_push() {
        let (_tx, rx) = mpsc::channel::<i32>(4);
        let chunker: Chunker<i32> = Chunker::builder().with_input(rx).build();
        assert_eq!(chunker.push(1).await, Err(Error::Closed));
        assert_eq!(chunker.backlog(), 0);
    }
}
