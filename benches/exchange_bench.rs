//! Performance benchmarks for netspike.
//!
//! Run with: `cargo bench`
//! Or for specific bench: `cargo bench --bench exchange_bench`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use netspike::cells::{EventRecorder, IntervalFire};
use netspike::comm::local::LocalCluster;
use netspike::config::{ExchangeMethod, SimConfig, SimConfigBuilder};
use netspike::queue::TimedQueue;
use netspike::{Communicator, NullSolver, SimulationContext};

// ============================================================================
// Helpers
// ============================================================================

fn random_times(n: usize) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    (0..n).map(|_| rng.gen_range(0.0..1000.0)).collect()
}

/// Every rank runs `cells` generators and connects every gid in the
/// cluster to a recorder, spread over its threads.
fn all_to_all(config: &SimConfig, comm: netspike::comm::local::LocalComm, cells: usize) -> u64 {
    let nranks = comm.size();
    let rank = comm.rank();
    let nthreads = config.simulation.nthreads;
    let mut ctx = match SimulationContext::new(config.clone(), Arc::new(comm)) {
        Ok(ctx) => ctx,
        Err(_) => return 0,
    };
    let setup = (|| -> netspike::NetResult<()> {
        for c in 0..cells {
            let gid = (rank * cells + c) as i32;
            let thread = c % nthreads;
            let stim = ctx.add_target(thread, Box::new(IntervalFire::new(2.0 + c as f64 * 0.1, 50, 0.5)))?;
            ctx.register_artificial(gid, stim)?;
        }
        let recorders: Vec<_> = (0..nthreads)
            .map(|thread| ctx.add_target(thread, Box::new(EventRecorder::new())))
            .collect::<Result<_, _>>()?;
        for gid in 0..(nranks * cells) as i32 {
            ctx.connect(gid, recorders[gid as usize % nthreads], 1.0, 1.5)?;
        }
        ctx.setup_exchange()?;
        ctx.finitialize(0.0)
    })();
    if setup.is_err() {
        return 0;
    }
    ctx.solve(config.simulation.tstop, &NullSolver).map(|s| s.events_delivered()).unwrap_or(0)
}

// ============================================================================
// Queue Benchmarks
// ============================================================================

fn bench_timed_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("timed_queue");

    for num_events in [1000, 10000, 100000].iter() {
        group.throughput(Throughput::Elements(*num_events as u64));
        let times = random_times(*num_events);

        group.bench_with_input(BenchmarkId::new("insert", num_events), &times, |b, times| {
            b.iter(|| {
                let mut queue = TimedQueue::new();
                for (i, &t) in times.iter().enumerate() {
                    queue.insert(t, i);
                }
                black_box(queue.len());
            });
        });

        group.bench_with_input(BenchmarkId::new("extract", num_events), &times, |b, times| {
            b.iter_batched(
                || {
                    let mut queue = TimedQueue::new();
                    for (i, &t) in times.iter().enumerate() {
                        queue.insert(t, i);
                    }
                    queue
                },
                |mut queue| {
                    while let Some(due) = queue.extract_due(f64::INFINITY) {
                        black_box(due.item);
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("reschedule", num_events), &times, |b, times| {
            b.iter_batched(
                || {
                    let mut queue = TimedQueue::new();
                    let handles: Vec<_> = times.iter().enumerate().map(|(i, &t)| queue.insert(t, i)).collect();
                    (queue, handles)
                },
                |(mut queue, handles)| {
                    for (h, &t) in handles.into_iter().zip(times.iter().rev()) {
                        queue.reschedule(h, t);
                    }
                    black_box(queue.len());
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

// ============================================================================
// Single-Rank Benchmarks
// ============================================================================

fn bench_threads(c: &mut Criterion) {
    let mut group = c.benchmark_group("threads");
    group.sample_size(20);

    for nthreads in [1, 2, 4].iter() {
        let config = SimConfigBuilder::new().tstop(100.0).nthreads(*nthreads).build();
        let Ok(config) = config else { continue };
        group.bench_with_input(BenchmarkId::new("all_to_all", nthreads), &config, |b, config| {
            b.iter(|| {
                let comm = LocalCluster::new(1).pop();
                black_box(comm.map(|comm| all_to_all(config, comm, 40)));
            });
        });
    }

    group.finish();
}

// ============================================================================
// Exchange Benchmarks
// ============================================================================

fn bench_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("exchange");
    group.sample_size(10);

    let variants = [
        ("allgather", ExchangeMethod::Allgather, 1, false),
        ("multisend", ExchangeMethod::Multisend, 2, false),
        ("multisend_two_phase", ExchangeMethod::Multisend, 2, true),
    ];

    for nranks in [2, 4, 8].iter() {
        for (name, method, intervals, two_phase) in variants {
            let config = SimConfigBuilder::new()
                .tstop(50.0)
                .method(method)
                .intervals(intervals)
                .two_phase(two_phase)
                .build();
            let Ok(config) = config else { continue };
            group.bench_with_input(BenchmarkId::new(name, nranks), nranks, |b, &nranks| {
                b.iter(|| {
                    let delivered = LocalCluster::run(nranks, |comm| all_to_all(&config, comm, 10));
                    black_box(delivered.iter().sum::<u64>());
                });
            });
        }
    }

    group.finish();
}

// ============================================================================
// Criterion Groups
// ============================================================================

criterion_group!(benches, bench_timed_queue, bench_threads, bench_exchange);

criterion_main!(benches);
