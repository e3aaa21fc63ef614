use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::mpsc::channel;
use std::thread;

use reflux::SpscQueue;

const MESSAGES: usize = 1_000_000;

fn bench_same_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("same_thread");
    group.throughput(Throughput::Elements(MESSAGES as u64));

    group.bench_function("reflux_warm_cache", |b| {
        let (mut tx, mut rx) = SpscQueue::<usize>::new().split();
        // Warm the node cache so the measured loop never allocates.
        for i in 0..64 {
            tx.push(i).unwrap();
        }
        while rx.pop().is_some() {}

        b.iter(|| {
            for i in 0..MESSAGES {
                tx.push(black_box(i)).unwrap();
                black_box(rx.pop());
            }
        });
    });

    group.finish();
}

fn bench_1p_1c(c: &mut Criterion) {
    let mut group = c.benchmark_group("1p_1c");
    group.throughput(Throughput::Elements(MESSAGES as u64));

    group.bench_function("reflux", |b| {
        b.iter(|| {
            let (mut tx, mut rx) = SpscQueue::<usize>::new().split();

            let producer = thread::spawn(move || {
                for i in 0..MESSAGES {
                    tx.push(black_box(i)).unwrap();
                }
            });

            let mut seen = 0;
            while seen < MESSAGES {
                if rx.pop().is_some() {
                    seen += 1;
                } else {
                    std::hint::spin_loop();
                }
            }

            producer.join().unwrap();
        });
    });

    group.bench_function("std_mpsc", |b| {
        b.iter(|| {
            let (tx, rx) = channel::<usize>();

            let producer = thread::spawn(move || {
                for i in 0..MESSAGES {
                    tx.send(black_box(i)).unwrap();
                }
            });

            for _ in 0..MESSAGES {
                rx.recv().unwrap();
            }

            producer.join().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_same_thread, bench_1p_1c);
criterion_main!(benches);
