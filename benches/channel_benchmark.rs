//! Benchmarks for soft signal relay and heartbeat access.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use nix::sys::signal::Signal;
use prefork::worker::{HeartbeatStore, SignalDispatch, WorkerHandle};

/// Counts dispatched signals without touching process dispositions.
struct Counter(usize);

impl SignalDispatch for Counter {
    fn dispatch(&mut self, _signal: Signal) -> prefork::Result<()> {
        self.0 += 1;
        Ok(())
    }
}

fn bench_send_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_drain");

    for batch in [1usize, 16, 256].iter() {
        let mut store = HeartbeatStore::new();
        let mut handle = WorkerHandle::create(0, &mut store, None).expect("handle");
        let mut counter = Counter(0);

        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            b.iter(|| {
                for _ in 0..batch {
                    black_box(handle.send(Signal::SIGUSR1));
                }
                black_box(handle.drain(&mut counter, Signal::SIGQUIT).expect("drain"))
            });
        });
    }

    group.finish();
}

fn bench_heartbeat(c: &mut Criterion) {
    let mut store = HeartbeatStore::new();
    let handle = WorkerHandle::create(3, &mut store, None).expect("handle");
    let mut tick = 0u64;

    c.bench_function("heartbeat_set_tick", |b| {
        b.iter(|| {
            tick += 1;
            handle.set_tick(black_box(tick));
        });
    });

    c.bench_function("heartbeat_get_tick", |b| b.iter(|| black_box(handle.tick())));

    c.bench_function("heartbeat_slot_for", |b| {
        b.iter(|| black_box(store.slot_for(black_box(1000)).expect("slot")))
    });
}

criterion_group!(benches, bench_send_drain, bench_heartbeat);
criterion_main!(benches);
