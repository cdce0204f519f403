use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vmcore::WorkerPool;

fn worker_pool_throughput_bounded(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("worker_pool_64_tasks_concurrency_8", |b| {
        b.to_async(&rt).iter(|| async {
            let pool = WorkerPool::new(8);
            for i in 0..64 {
                pool.process(format!("bench/{i}"), move || async move {
                    black_box(i * 2);
                    Ok(())
                });
            }
            pool.wrap().await.unwrap();
        });
    });
}

fn worker_pool_throughput_unbounded(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("worker_pool_64_tasks_concurrency_64", |b| {
        b.to_async(&rt).iter(|| async {
            let pool = WorkerPool::new(64);
            for i in 0..64 {
                pool.process(format!("bench/{i}"), move || async move {
                    black_box(i * 2);
                    Ok(())
                });
            }
            pool.wrap().await.unwrap();
        });
    });
}

criterion_group!(benches, worker_pool_throughput_bounded, worker_pool_throughput_unbounded);
criterion_main!(benches);
