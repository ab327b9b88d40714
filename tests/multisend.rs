//! Integration tests for spike exchange between ranks.
//!
//! Every test runs a small cluster of ranks as OS threads through
//! `LocalCluster`. These tests verify:
//! - The three-rank delivery scenario, step by step through the buffers
//! - Conservation when spikes are held in flight for many polls
//! - The bounded retry policy on a transport that loses spikes
//! - Two-phase relays delivering exactly what one-phase delivery does
//! - Allgather and multisend producing identical deliveries
//! - Compressed allgather matching the plain form
//! - A spike for a gid without a local sink aborting the run
//! - Exactly-once arrival for random cluster sizes and transport lags

use std::sync::Arc;

use netspike::cells::{EventRecorder, IntervalFire, Received, ReceivedLog};
use netspike::comm::local::{LocalCluster, LocalComm};
use netspike::comm::{Communicator, SpikeMessage};
use netspike::config::{ExchangeMethod, SimConfig, SimConfigBuilder};
use netspike::event::Event;
use netspike::registry::Threshold;
use netspike::stats::RunStats;
use netspike::types::Rank;
use netspike::{NetError, NetResult, NullSolver, SimulationContext};
use parking_lot::Mutex;
use proptest::prelude::*;

// ============================================================================
// Helpers
// ============================================================================

const TSTOP: f64 = 12.0;

/// What one rank saw during a network run.
struct RankOutcome {
    /// `(time, weight)` of every delivery, sorted
    deliveries: Vec<(f64, f64)>,
    spikes: Vec<(f64, i32)>,
    stats: RunStats,
}

/// Every rank owns one spike generator with `gid == rank` and connects
/// every gid, its own included, to a recorder on thread `gid % nthreads`.
/// The edge weight names the sending gid.
fn build_all_to_all(ctx: &mut SimulationContext, nranks: usize) -> NetResult<Vec<ReceivedLog>> {
    let rank = ctx.rank();
    let nthreads = ctx.nthreads();

    let generator = IntervalFire::new(1.3 + rank as f64 * 0.1, 5, 0.5 + rank as f64 * 0.2);
    let stim = ctx.add_target(0, Box::new(generator))?;
    ctx.register_artificial(rank as i32, stim)?;

    let mut logs = Vec::new();
    let mut recorders = Vec::new();
    for thread in 0..nthreads {
        let recorder = EventRecorder::new();
        logs.push(recorder.log());
        recorders.push(ctx.add_target(thread, Box::new(recorder))?);
    }
    for src in 0..nranks {
        let delay = 1.0 + ((src * 7 + rank * 3) % 5) as f64 * 0.25;
        ctx.connect(src as i32, recorders[src % nthreads], src as f64 + 1.0, delay)?;
    }
    Ok(logs)
}

fn collect(logs: &[ReceivedLog]) -> Vec<(f64, f64)> {
    let mut all: Vec<(f64, f64)> = logs
        .iter()
        .flat_map(|log| log.lock().iter().map(|r| (r.t, r.weight)).collect::<Vec<_>>())
        .collect();
    all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    all
}

fn run_all_to_all(nranks: usize, config: SimConfig, lag: u32) -> Vec<RankOutcome> {
    LocalCluster::run_with_lag(nranks, lag, |comm| {
        let mut ctx = SimulationContext::new(config.clone(), Arc::new(comm)).unwrap();
        let logs = build_all_to_all(&mut ctx, nranks).unwrap();
        ctx.setup_exchange().unwrap();
        ctx.finitialize(0.0).unwrap();
        let stats = ctx.solve(TSTOP, &NullSolver).unwrap();
        RankOutcome { deliveries: collect(&logs), spikes: ctx.spikes().sorted(), stats }
    })
}

fn config(method: ExchangeMethod, intervals: usize, nthreads: usize) -> SimConfigBuilder {
    SimConfigBuilder::new()
        .tstop(TSTOP)
        .dt(0.025)
        .nthreads(nthreads)
        .method(method)
        .intervals(intervals)
}

fn edge_events(ctx: &SimulationContext) -> usize {
    ctx.scheduler()
        .thread(0)
        .queue()
        .iter()
        .filter(|(_, e)| matches!(e, Event::Edge(_)))
        .count()
}

/// A transport that accepts spikes and never delivers them.
struct LossyComm(LocalComm);

impl Communicator for LossyComm {
    fn rank(&self) -> Rank {
        self.0.rank()
    }

    fn size(&self) -> usize {
        self.0.size()
    }

    fn send_spike(&self, _dest: Rank, _msg: SpikeMessage) -> NetResult<()> {
        Ok(())
    }

    fn try_recv_spike(&self) -> NetResult<Option<SpikeMessage>> {
        self.0.try_recv_spike()
    }

    fn alltoallv(&self, send: Vec<Vec<i32>>) -> NetResult<Vec<Vec<i32>>> {
        self.0.alltoallv(send)
    }

    fn allreduce_sum(&self, value: i64) -> NetResult<i64> {
        self.0.allreduce_sum(value)
    }

    fn allreduce_min(&self, value: f64) -> NetResult<f64> {
        self.0.allreduce_min(value)
    }

    fn allgather_bytes(&self, bytes: Vec<u8>) -> NetResult<Vec<Vec<u8>>> {
        self.0.allgather_bytes(bytes)
    }
}

/// A transport that hands out one spike of gid 999 before any real one.
struct InjectingComm {
    inner: LocalComm,
    pending: Mutex<Option<SpikeMessage>>,
}

impl InjectingComm {
    fn new(inner: LocalComm) -> Self {
        Self { inner, pending: Mutex::new(Some(SpikeMessage::new(999, 0.5))) }
    }
}

impl Communicator for InjectingComm {
    fn rank(&self) -> Rank {
        self.inner.rank()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn send_spike(&self, dest: Rank, msg: SpikeMessage) -> NetResult<()> {
        self.inner.send_spike(dest, msg)
    }

    fn try_recv_spike(&self) -> NetResult<Option<SpikeMessage>> {
        match self.pending.lock().take() {
            Some(msg) => Ok(Some(msg)),
            None => self.inner.try_recv_spike(),
        }
    }

    fn alltoallv(&self, send: Vec<Vec<i32>>) -> NetResult<Vec<Vec<i32>>> {
        self.inner.alltoallv(send)
    }

    fn allreduce_sum(&self, value: i64) -> NetResult<i64> {
        self.inner.allreduce_sum(value)
    }

    fn allreduce_min(&self, value: f64) -> NetResult<f64> {
        self.inner.allreduce_min(value)
    }

    fn allgather_bytes(&self, bytes: Vec<u8>) -> NetResult<Vec<Vec<u8>>> {
        self.inner.allgather_bytes(bytes)
    }
}

/// Rank 0 owns gid 10 and rank 1 listens to it, over a transport that
/// injects a spike for gid 999.
fn injected_context(comm: LocalComm) -> SimulationContext {
    let config = config(ExchangeMethod::Multisend, 1, 1).build().unwrap();
    let mut ctx = SimulationContext::new(config, Arc::new(InjectingComm::new(comm))).unwrap();
    if ctx.rank() == 0 {
        let v = ctx.add_state_var(0, 0.0).unwrap();
        ctx.register_cell(0, 10, Threshold::new(v, 1.0)).unwrap();
    } else {
        let target = ctx.add_target(0, Box::new(EventRecorder::new())).unwrap();
        ctx.connect(10, target, 1.0, 2.0).unwrap();
    }
    ctx.setup_exchange().unwrap();
    ctx.finitialize(0.0).unwrap();
    ctx
}

/// Compares deliveries with times rounded to a nanosecond, so rounding in
/// packed spike times neither fails the match nor reorders equal times.
fn assert_same_deliveries(a: &[(f64, f64)], b: &[(f64, f64)], rank: usize) {
    let rounded = |d: &[(f64, f64)]| {
        let mut v: Vec<(i64, i64)> = d.iter().map(|&(t, w)| ((t * 1e6).round() as i64, w as i64)).collect();
        v.sort_unstable();
        v
    };
    assert_eq!(rounded(a), rounded(b), "rank {rank}");
}

// ============================================================================
// Three-Rank Scenario
// ============================================================================

struct ScenarioOutcome {
    queued: Vec<(f64, f64)>,
    targets: Option<(usize, Vec<i32>)>,
    edges_after_exchange: [usize; 2],
    received: Vec<Received>,
}

#[test]
fn test_three_rank_scenario() {
    let results = LocalCluster::run(3, |comm| {
        let config = config(ExchangeMethod::Multisend, 2, 1).build().unwrap();
        let mut ctx = SimulationContext::new(config, Arc::new(comm)).unwrap();
        let rank = ctx.rank();
        let recorder = EventRecorder::new();
        let log = recorder.log();
        let target = ctx.add_target(0, Box::new(recorder)).unwrap();

        match rank {
            0 => {
                let v = ctx.add_state_var(0, -65.0).unwrap();
                ctx.register_cell(0, 10, Threshold::new(v, -20.0)).unwrap();
                ctx.connect(10, target, 1.0, 2.0).unwrap();
                ctx.connect(10, target, 2.0, 2.0).unwrap();
            }
            2 => {
                ctx.connect(10, target, 3.0, 2.0).unwrap();
            }
            _ => {}
        }
        ctx.setup_exchange().unwrap();
        ctx.finitialize(0.0).unwrap();

        let mut queued = Vec::new();
        let mut targets = None;
        if rank == 0 {
            ctx.fake_fire(10, 5.0, true).unwrap();
            let thread = ctx.scheduler().thread(0);
            for (t, event) in thread.queue().iter() {
                if let Event::Edge(id) = event {
                    let edge = ctx.registry().edge(*id);
                    queued.push((t, thread.weights()[edge.weight_index]));
                }
            }
            let source = ctx.registry().source(ctx.registry().source_by_gid(10).unwrap());
            let ms = ctx.exchange().and_then(|ex| ex.as_multisend()).unwrap();
            let (total, ranks) = ms.tables().targets(source.multisend_index());
            targets = Some((total, ranks.to_vec()));
        }

        ctx.exchange_spikes().unwrap();
        let first = edge_events(&ctx);
        ctx.exchange_spikes().unwrap();
        let second = edge_events(&ctx);

        ctx.solve(10.0, &NullSolver).unwrap();
        let received = log.lock().clone();
        ScenarioOutcome { queued, targets, edges_after_exchange: [first, second], received }
    });

    // Rank 0: both local edges queued at 7.0 in insertion order, one remote rank
    let r0 = &results[0];
    assert_eq!(r0.queued, vec![(7.0, 1.0), (7.0, 2.0)]);
    assert_eq!(r0.targets, Some((1, vec![2])));
    let weights: Vec<f64> = r0.received.iter().map(|r| r.weight).collect();
    assert_eq!(weights, vec![1.0, 2.0]);
    assert!(r0.received.iter().all(|r| r.t == 7.0));

    // Rank 1 wants nothing
    assert!(results[1].received.is_empty());
    assert_eq!(results[1].edges_after_exchange, [0, 0]);

    // Rank 2: the odd buffer is consumed at the second exchange
    let r2 = &results[2];
    assert_eq!(r2.edges_after_exchange, [0, 1]);
    assert_eq!(r2.received.len(), 1);
    assert_eq!(r2.received[0].t, 7.0);
    assert_eq!(r2.received[0].weight, 3.0);
}

// ============================================================================
// Conservation
// ============================================================================

#[test]
fn test_lagged_transport_forces_retries_but_conserves() {
    let nranks = 4;
    let reference = run_all_to_all(nranks, config(ExchangeMethod::Multisend, 2, 1).build().unwrap(), 0);
    let lagged = run_all_to_all(nranks, config(ExchangeMethod::Multisend, 1, 1).build().unwrap(), 60);

    let retries: u64 = lagged
        .iter()
        .map(|o| o.stats.exchange.as_ref().map_or(0, |ex| ex.conservation_retries))
        .sum();
    assert!(retries > 0);

    for (rank, (a, b)) in reference.iter().zip(&lagged).enumerate() {
        assert_eq!(a.deliveries.len(), nranks * 5, "rank {rank}");
        assert_eq!(a.deliveries, b.deliveries, "rank {rank}");
        assert_eq!(a.spikes, b.spikes, "rank {rank}");
    }
}

#[test]
fn test_sent_and_received_counts_balance() {
    let nranks = 3;
    let outcomes = run_all_to_all(nranks, config(ExchangeMethod::Multisend, 2, 2).build().unwrap(), 2);

    let sent: u64 = outcomes.iter().filter_map(|o| o.stats.exchange.as_ref()).map(|ex| ex.spikes_sent).sum();
    let received: u64 =
        outcomes.iter().filter_map(|o| o.stats.exchange.as_ref()).map(|ex| ex.spikes_received).sum();
    // Every spike goes to every other rank
    assert_eq!(sent, (nranks * 5 * (nranks - 1)) as u64);
    assert_eq!(sent, received);
    for outcome in &outcomes {
        let ex = outcome.stats.exchange.as_ref().unwrap();
        assert_eq!(ex.retry_histogram.iter().sum::<u64>(), ex.exchanges);
        assert_eq!(outcome.deliveries.len(), nranks * 5);
    }
}

#[test]
fn test_bounded_retries_report_divergence() {
    let results = LocalCluster::run(2, |comm| {
        let config = config(ExchangeMethod::Multisend, 2, 1).max_conservation_retries(5).build().unwrap();
        let mut ctx = SimulationContext::new(config, Arc::new(LossyComm(comm))).unwrap();
        if ctx.rank() == 0 {
            let v = ctx.add_state_var(0, 0.0).unwrap();
            ctx.register_cell(0, 10, Threshold::new(v, 1.0)).unwrap();
        } else {
            let target = ctx.add_target(0, Box::new(EventRecorder::new())).unwrap();
            ctx.connect(10, target, 1.0, 2.0).unwrap();
        }
        ctx.setup_exchange().unwrap();
        ctx.finitialize(0.0).unwrap();
        if ctx.rank() == 0 {
            ctx.fake_fire(10, 1.0, true).unwrap();
        }

        let first = ctx.exchange_spikes().map(|r| r.retries);
        let second = match ctx.exchange_spikes() {
            Err(NetError::ConservationDiverged { retries, outstanding, .. }) => Some((retries, outstanding)),
            _ => None,
        };
        (first.ok(), second)
    });

    for (first, second) in results {
        assert_eq!(first, Some(0));
        assert_eq!(second, Some((5, 1)));
    }
}

// ============================================================================
// Method Equivalence
// ============================================================================

#[test]
fn test_two_phase_matches_one_phase() {
    let nranks = 6;
    let one = run_all_to_all(nranks, config(ExchangeMethod::Multisend, 2, 1).build().unwrap(), 0);
    let two = run_all_to_all(
        nranks,
        config(ExchangeMethod::Multisend, 2, 1).two_phase(true).relay_seed(17).build().unwrap(),
        0,
    );

    let relayed: u64 = two.iter().filter_map(|o| o.stats.exchange.as_ref()).map(|ex| ex.relayed).sum();
    assert!(relayed > 0);
    for (rank, (a, b)) in one.iter().zip(&two).enumerate() {
        assert_eq!(a.deliveries.len(), nranks * 5, "rank {rank}");
        assert_eq!(a.deliveries, b.deliveries, "rank {rank}");
    }
}

#[test]
fn test_allgather_matches_multisend() {
    let nranks = 3;
    let multisend = run_all_to_all(nranks, config(ExchangeMethod::Multisend, 2, 2).build().unwrap(), 0);
    let allgather = run_all_to_all(nranks, config(ExchangeMethod::Allgather, 1, 2).build().unwrap(), 0);

    for (rank, (a, b)) in multisend.iter().zip(&allgather).enumerate() {
        assert_eq!(a.deliveries.len(), nranks * 5, "rank {rank}");
        assert_eq!(a.deliveries, b.deliveries, "rank {rank}");
        assert_eq!(a.spikes, b.spikes, "rank {rank}");
        assert_eq!(b.stats.exchange.as_ref().unwrap().method, "allgather");
    }
}

#[test]
fn test_compressed_allgather_matches_plain() {
    let nranks = 3;
    let plain = run_all_to_all(nranks, config(ExchangeMethod::Allgather, 1, 2).build().unwrap(), 0);
    let full_gids = run_all_to_all(
        nranks,
        config(ExchangeMethod::Allgather, 1, 2).compress(16, false).max_histogram(8).build().unwrap(),
        0,
    );
    let local_gids = run_all_to_all(
        nranks,
        config(ExchangeMethod::Allgather, 1, 2).compress(16, true).max_histogram(8).build().unwrap(),
        0,
    );

    for rank in 0..nranks {
        assert_eq!(plain[rank].deliveries.len(), nranks * 5, "rank {rank}");
        assert_same_deliveries(&plain[rank].deliveries, &full_gids[rank].deliveries, rank);
        assert_same_deliveries(&plain[rank].deliveries, &local_gids[rank].deliveries, rank);
        assert_eq!(plain[rank].spikes, local_gids[rank].spikes, "rank {rank}");

        let ex = local_gids[rank].stats.exchange.as_ref().unwrap();
        assert_eq!(ex.max_histogram.len(), 8);
        assert_eq!(ex.max_histogram.iter().sum::<u64>(), ex.exchanges);
        assert_eq!(ex.overflows, 0);
        let span = ex.spanning();
        // Each rank sends its 5 spikes once and hears the others' 10
        assert_eq!(span.nsend, 5);
        assert_eq!(span.nrecv, ((nranks - 1) * 5) as u64);
        assert_eq!(span.nrecv_useful, span.nrecv);
        assert!(span.nsendmax >= 1);
    }
}

// ============================================================================
// Unknown Gids
// ============================================================================

#[test]
#[should_panic(expected = "unknown gid 999")]
fn test_unknown_gid_at_exchange_is_fatal() {
    LocalCluster::run(2, |comm| {
        let mut ctx = injected_context(comm);
        let _ = ctx.exchange_spikes();
    });
}

#[test]
#[should_panic(expected = "unknown gid 999")]
fn test_unknown_gid_between_exchanges_is_fatal() {
    LocalCluster::run(2, |comm| {
        let mut ctx = injected_context(comm);
        let _ = ctx.solve(TSTOP, &NullSolver);
    });
}

// ============================================================================
// Conservation Property
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn prop_every_spike_arrives_once(nranks in 2usize..5, lag in 0u32..20, intervals in 1usize..=2) {
        let outcomes = run_all_to_all(nranks, config(ExchangeMethod::Multisend, intervals, 1).build().unwrap(), lag);
        let sent: u64 = outcomes.iter().filter_map(|o| o.stats.exchange.as_ref()).map(|ex| ex.spikes_sent).sum();
        let received: u64 =
            outcomes.iter().filter_map(|o| o.stats.exchange.as_ref()).map(|ex| ex.spikes_received).sum();
        prop_assert_eq!(sent, received);
        for outcome in &outcomes {
            // One delivery per generator spike, each weight naming its gid
            prop_assert_eq!(outcome.deliveries.len(), nranks * 5);
            for gid in 0..nranks {
                let n = outcome.deliveries.iter().filter(|d| d.1 == gid as f64 + 1.0).count();
                prop_assert_eq!(n, 5);
            }
        }
    }
}
