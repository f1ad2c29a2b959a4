use criterion::{black_box, criterion_group, criterion_main, Criterion};
use manifold_stream::ShardChunkPipeline;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn pipeline_push_path(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let consumed = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&consumed);
    let pipeline: ShardChunkPipeline<u64> = rt.block_on(async {
        ShardChunkPipeline::builder()
            .shard_count(4)
            .chunk_size(256)
            .shard_fn(|item: &u64| *item as i64)
            .shard_worker(move |_, batch| {
                sink.fetch_add(batch.len() as u64, Ordering::Relaxed);
            })
            .build()
            .unwrap()
    });

    let mut rng = StdRng::seed_from_u64(7);
    let items: Vec<u64> = (0..1024).map(|_| rng.gen()).collect();

    c.bench_function("pipeline_push_1024", |b| {
        b.to_async(&rt).iter(|| {
            let pipeline = &pipeline;
            let items = items.clone();
            async move {
                for item in items {
                    pipeline.push(black_box(item)).await.unwrap();
                }
            }
        })
    });
}

criterion_group!(benches, pipeline_push_path);
criterion_main!(benches);
