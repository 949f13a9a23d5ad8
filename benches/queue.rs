use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flock_structures::ScalableCircularQueue;

fn single_threaded_round_trip(capacity: usize, ops: usize) {
    let q = ScalableCircularQueue::with_capacity(capacity);
    for i in 0..ops {
        q.enqueue(black_box(i)).unwrap();
        black_box(q.dequeue());
    }
}

fn mpmc_round_trip(capacity: usize, producers: usize, per_producer: usize) {
    let q = Arc::new(ScalableCircularQueue::with_capacity(capacity));
    let consumers: Vec<_> = (0..producers)
        .map(|_| {
            let q = q.clone();
            thread::spawn(move || {
                let mut taken = 0;
                while taken < per_producer {
                    if q.dequeue().is_some() {
                        taken += 1;
                    }
                }
            })
        })
        .collect();
    let producers: Vec<_> = (0..producers)
        .map(|p| {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..per_producer {
                    while q.enqueue(black_box(p * per_producer + i)).is_err() {}
                }
            })
        })
        .collect();
    for t in producers {
        t.join().unwrap();
    }
    for t in consumers {
        t.join().unwrap();
    }
}

fn single_threaded(c: &mut Criterion) {
    c.bench_function("single_threaded_1k", |b| {
        b.iter(|| single_threaded_round_trip(64, 1000))
    });
}

fn mpmc_4x4(c: &mut Criterion) {
    c.bench_function("mpmc_4_producers_4_consumers", |b| {
        b.iter(|| mpmc_round_trip(1024, 4, 500))
    });
}

criterion_group!(benches, single_threaded, mpmc_4x4);
criterion_main!(benches);
