//! Task queue benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use signal_engine::runtime::{Task, TaskQueue};

fn tasks(count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| Task::new(format!("sig_{i}"), "todo", "prompt").with_priority((i % 7) as i64))
        .collect()
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_fill_drain");
    for count in [100usize, 1_000, 10_000] {
        let batch = tasks(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &batch, |b, batch| {
            b.iter(|| {
                let mut queue = TaskQueue::new();
                for task in batch.iter().cloned() {
                    queue.enqueue(task);
                }
                while let Some(task) = queue.dequeue() {
                    black_box(task);
                }
            });
        });
    }
    group.finish();
}

fn bench_remove(c: &mut Criterion) {
    let batch = tasks(1_000);
    let middle = batch[500].id;

    c.bench_function("queue_remove_middle", |b| {
        b.iter_batched(
            || {
                let mut queue = TaskQueue::new();
                for task in batch.iter().cloned() {
                    queue.enqueue(task);
                }
                queue
            },
            |mut queue| black_box(queue.remove(&middle)),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_enqueue_dequeue, bench_remove);
criterion_main!(benches);
