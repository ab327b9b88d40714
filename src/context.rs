//! The simulation context and fixed-step driver.
//!
//! [`SimulationContext`] owns one rank's share of a network: the source
//! registry, the per-thread scheduler, the spike exchange and the spike
//! record. A model is loaded through the setup methods, then
//! [`setup_exchange`](SimulationContext::setup_exchange) freezes the registry
//! and builds the exchange. [`solve`](SimulationContext::solve) steps every
//! thread in lockstep groups between exchange boundaries.
//!
//! Between two boundaries threads only interact through staging lanes, and
//! every event crossing a thread or rank boundary travels at least one
//! interval. Threads can therefore step a whole group without waiting on
//! each other.

use std::path::Path;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::comm::Communicator;
use crate::config::{ConfigError, SimConfig};
use crate::error::{fatal, NetError, NetResult, OrFatal};
use crate::event::{PlayRecord, WatchCondition};
use crate::exchange::{compute_min_delay, usable_min_delay, ExchangeReport, SpikeExchange};
use crate::registry::{EdgeSpec, SourceRegistry, SourceSpec, Threshold};
use crate::scheduler::{DeliveryEnv, NetView, Scheduler, SpikeOutput};
use crate::spikes::SpikeLog;
use crate::stats::{RunStats, Timer};
use crate::target::PointProcess;
use crate::thread::ThreadState;
use crate::types::{EdgeId, Gid, SimTime, SourceId, TargetRef, ThreadIndex, TIME_EPSILON};

/// Advances the continuous state of one thread by one step.
pub trait CellSolver: Sync {
    /// Integrates `state` from `t` to `t + dt`.
    fn advance(&self, state: &mut [f64], thread: ThreadIndex, t: SimTime, dt: SimTime);
}

/// A solver that leaves the state untouched, for networks of artificial cells.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSolver;

impl CellSolver for NullSolver {
    fn advance(&self, _state: &mut [f64], _thread: ThreadIndex, _t: SimTime, _dt: SimTime) {}
}

impl<F> CellSolver for F
where
    F: Fn(&mut [f64], ThreadIndex, SimTime, SimTime) + Sync,
{
    fn advance(&self, state: &mut [f64], thread: ThreadIndex, t: SimTime, dt: SimTime) {
        self(state, thread, t, dt)
    }
}

/// One rank's simulation.
pub struct SimulationContext {
    config: SimConfig,
    comm: Arc<dyn Communicator>,
    registry: SourceRegistry,
    scheduler: Scheduler,
    exchange: Option<SpikeExchange>,
    spikes: SpikeLog,
    min_delay: SimTime,
    usable_min_delay: SimTime,
    initialized: bool,
    exchanges: u64,
}

impl SimulationContext {
    /// Creates an empty context for the rank `comm` belongs to.
    ///
    /// Installs the global log subscriber at `simulation.log_level` unless
    /// one is already installed.
    pub fn new(config: SimConfig, comm: Arc<dyn Communicator>) -> NetResult<Self> {
        config.validate()?;
        crate::init_logging(&config.simulation.log_level);
        let sim = &config.simulation;
        let registry = SourceRegistry::new(comm.rank(), sim.nthreads);
        let scheduler = Scheduler::new(sim.nthreads, sim.dt, sim.use_bin_queue);
        Ok(Self {
            min_delay: sim.max_delay,
            usable_min_delay: sim.max_delay,
            config,
            comm,
            registry,
            scheduler,
            exchange: None,
            spikes: SpikeLog::new(),
            initialized: false,
            exchanges: 0,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn nthreads(&self) -> usize {
        self.scheduler.nthreads()
    }

    /// Current time; all threads agree on it between `solve` calls.
    pub fn t(&self) -> SimTime {
        self.scheduler.thread(0).t()
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn exchange(&self) -> Option<&SpikeExchange> {
        self.exchange.as_ref()
    }

    pub fn spikes(&self) -> &SpikeLog {
        &self.spikes
    }

    /// Smallest delay over edges from exchanged sources on any rank.
    pub fn min_delay(&self) -> SimTime {
        self.min_delay
    }

    /// Length of one exchange interval, as computed by `setup_exchange`.
    pub fn usable_min_delay(&self) -> SimTime {
        self.usable_min_delay
    }

    /// Read-only view for delivering events outside of `solve`.
    pub fn view(&self) -> NetView<'_> {
        let view = NetView::new(&self.registry, &self.spikes);
        match &self.exchange {
            Some(ex) => view.with_output(ex as &dyn SpikeOutput),
            None => view,
        }
    }

    // ------------------------------------------------------------------
    // Model setup
    // ------------------------------------------------------------------

    fn thread_mut(&mut self, thread: ThreadIndex) -> NetResult<&mut ThreadState> {
        let nthreads = self.scheduler.nthreads();
        if thread >= nthreads {
            return Err(NetError::NoSuchThread { thread, nthreads });
        }
        Ok(self.scheduler.thread_mut(thread))
    }

    fn check_setup(&self, what: &'static str) -> NetResult<()> {
        if self.registry.is_frozen() {
            return Err(NetError::RegistryFrozen(what));
        }
        Ok(())
    }

    /// Places a point process on `thread`.
    pub fn add_target(&mut self, thread: ThreadIndex, target: Box<dyn PointProcess>) -> NetResult<TargetRef> {
        self.check_setup("adding targets")?;
        let index = self.thread_mut(thread)?.add_target(target);
        Ok(TargetRef::new(thread, index))
    }

    /// Appends a state variable on `thread` and returns its index.
    pub fn add_state_var(&mut self, thread: ThreadIndex, value: f64) -> NetResult<usize> {
        Ok(self.thread_mut(thread)?.add_state_var(value))
    }

    fn check_state_var(&mut self, thread: ThreadIndex, index: usize) -> NetResult<()> {
        if index >= self.thread_mut(thread)?.state().len() {
            return Err(NetError::NoSuchStateVar { thread, index });
        }
        Ok(())
    }

    /// Registers a cell whose spikes are detected on `thread` when state
    /// variable `threshold.var_index` rises above `threshold.value`.
    pub fn register_cell(&mut self, thread: ThreadIndex, gid: Gid, threshold: Threshold) -> NetResult<SourceId> {
        self.check_state_var(thread, threshold.var_index)?;
        self.registry.register_source(SourceSpec::cell(thread, gid, threshold))
    }

    /// Registers an artificial cell that fires through `net_event`.
    pub fn register_artificial(&mut self, gid: Gid, target: TargetRef) -> NetResult<SourceId> {
        self.check_target(target)?;
        self.registry.register_source(SourceSpec::artificial(gid, target))
    }

    /// Registers a source from a full description.
    pub fn register_source(&mut self, spec: SourceSpec) -> NetResult<SourceId> {
        if let Some(target) = spec.target {
            self.check_target(target)?;
        }
        if let Some(threshold) = spec.threshold {
            self.check_state_var(spec.thread, threshold.var_index)?;
        }
        self.registry.register_source(spec)
    }

    fn check_target(&mut self, target: TargetRef) -> NetResult<usize> {
        self.thread_mut(target.thread)?
            .target_weight_count(target.index)
            .ok_or(NetError::NoSuchTarget { thread: target.thread, index: target.index })
    }

    /// Connects `gid` to `target` with the given weight and delay.
    ///
    /// Weight slots are allocated on the target's thread, as many as the
    /// target asks for. The first one holds `weight`.
    pub fn connect(&mut self, gid: Gid, target: TargetRef, weight: f64, delay: SimTime) -> NetResult<EdgeId> {
        let count = self.check_target(target)?.max(1);
        let mut weights = vec![0.0; count];
        weights[0] = weight;
        self.check_setup("connect")?;
        let weight_index = self.scheduler.thread_mut(target.thread).alloc_weights(&weights);
        self.registry.connect(gid, target.thread, EdgeSpec::new(target, delay, weight_index, count))
    }

    /// Connects with a caller-built edge description. Negative gids are
    /// resolved on the target's thread.
    pub fn connect_with(&mut self, gid: Gid, spec: EdgeSpec) -> NetResult<EdgeId> {
        self.check_target(spec.target)?;
        self.registry.connect(gid, spec.target.thread, spec)
    }

    /// Adds a watch condition polled on `thread`.
    ///
    /// The watched target must exist on `thread`, and so must the state
    /// variable of a condition built with [`WatchCondition::above`].
    pub fn add_watch(&mut self, thread: ThreadIndex, watch: WatchCondition) -> NetResult<usize> {
        self.check_target(TargetRef::new(thread, watch.target))?;
        if let Some(index) = watch.var_index() {
            self.check_state_var(thread, index)?;
        }
        Ok(self.thread_mut(thread)?.add_watch(watch))
    }

    /// Adds a playback of recorded values into a state variable of `thread`.
    pub fn add_playback(&mut self, thread: ThreadIndex, play: PlayRecord) -> NetResult<usize> {
        self.check_state_var(thread, play.var_index)?;
        Ok(self.thread_mut(thread)?.add_playback(play))
    }

    /// True if a local source owns `gid`.
    pub fn gid_exists(&self, gid: Gid) -> bool {
        self.registry.gid_exists(gid)
    }

    /// Forgets every gid, source, sink and edge and reopens setup.
    ///
    /// Targets and state variables stay, so the network can be wired again.
    /// Edge weight slots, pending events and the exchange are dropped.
    pub fn clear_gids(&mut self) {
        self.registry.clear();
        self.exchange = None;
        self.scheduler.clear_events();
        for thread in 0..self.scheduler.nthreads() {
            self.scheduler.thread_mut(thread).clear_weights();
        }
        let max_delay = self.config.simulation.max_delay;
        self.min_delay = max_delay;
        self.usable_min_delay = max_delay;
        self.initialized = false;
    }

    /// Restricts the spike record to `gid`, in addition to gids selected
    /// earlier. Without any selection every spike is recorded.
    pub fn spike_record(&mut self, gid: Gid) -> NetResult<()> {
        if !self.registry.gid_exists(gid) {
            return Err(NetError::UnknownGid { gid, rank: self.comm.rank(), time: self.t() });
        }
        self.spikes.select(gid);
        Ok(())
    }

    /// Records the spikes of every gid again.
    pub fn spike_record_all(&mut self) {
        self.spikes.select_all();
    }

    /// Freezes the registry, builds the exchange and computes the exchange
    /// interval.
    ///
    /// Collective: every rank must call it. Calling it again rebuilds the
    /// exchange and recomputes the interval.
    pub fn setup_exchange(&mut self) -> NetResult<()> {
        self.registry.finalize();
        let size = self.comm.size();

        self.exchange = if size > 1 {
            let dt = self.config.simulation.dt;
            Some(SpikeExchange::setup(self.comm.clone(), &self.config.exchange, dt, &mut self.registry)?)
        } else {
            None
        };

        let sim = &self.config.simulation;
        self.min_delay = compute_min_delay(&self.registry, self.comm.as_ref(), sim.max_delay)?;
        let fraction = self.exchange.as_ref().map_or(1.0, SpikeExchange::interval_fraction);
        self.usable_min_delay = usable_min_delay(self.min_delay, fraction, sim.nthreads, sim.dt)?;
        if let Some(ex) = &self.exchange {
            ex.check_interval(self.usable_min_delay)?;
        }
        self.initialized = false;

        tracing::debug!(
            rank = self.comm.rank(),
            nranks = size,
            min_delay = self.min_delay,
            usable = self.usable_min_delay,
            method = ?self.config.exchange.method,
            "exchange set up"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Resets every thread to `t0` and clears pending events, staged events,
    /// exchange buffers and the spike record.
    pub fn finitialize(&mut self, t0: SimTime) -> NetResult<()> {
        if !self.registry.is_frozen() {
            self.setup_exchange()?;
        }
        self.scheduler.clear_events();
        self.spikes.clear();
        if let Some(ex) = &self.exchange {
            ex.reset(t0);
        }

        let tstop = Some(self.config.simulation.tstop);
        let view = NetView::new(&self.registry, &self.spikes);
        let (threads, _) = self.scheduler.split(view);
        for thread in threads.iter_mut() {
            thread.initialize(t0, tstop, &self.registry);
        }
        self.initialized = true;
        self.exchanges = 0;
        Ok(())
    }

    /// Runs from the current time to `tstop`.
    ///
    /// Collective: every rank must call it with the same `tstop`. Runs
    /// `finitialize(0.0)` first if the context has not been initialized.
    pub fn solve<S>(&mut self, tstop: SimTime, solver: &S) -> NetResult<RunStats>
    where
        S: CellSolver + ?Sized,
    {
        if !self.initialized {
            self.finitialize(0.0)?;
        }
        let dt = self.config.simulation.dt;
        let t_start = self.t();
        let mut remaining = ((tstop - t_start) / dt + 0.5).max(0.0) as u64;
        let group = ((self.usable_min_delay + TIME_EPSILON) / dt).floor().max(1.0) as u64;

        let mut stats = RunStats::new();
        stats.record_start();
        let timer = Timer::start();
        let exchanges_before = self.exchanges;
        let mut steps = 0;

        tracing::debug!(rank = self.comm.rank(), t_start, tstop, group, "solve");
        while remaining > 0 {
            let n = remaining.min(group);
            self.step_group(n, solver);
            self.exchange_spikes()?;
            remaining -= n;
            steps += n;
        }

        stats.record_end();
        stats.metadata.version = env!("CARGO_PKG_VERSION").to_string();
        stats.metadata.rank = self.comm.rank();
        stats.metadata.nranks = self.comm.size();
        stats.metadata.nthreads = self.nthreads();
        stats.run.final_time = self.t();
        stats.run.steps = steps;
        stats.run.exchanges = self.exchanges - exchanges_before;
        stats.run.min_delay = self.min_delay;
        stats.run.usable_min_delay = self.usable_min_delay;
        stats.run.spikes = self.spikes.len() as u64;
        stats.threads = self.scheduler.threads().iter().map(|t| t.stats().clone()).collect();
        stats.exchange = self.exchange.as_ref().map(SpikeExchange::stats);
        stats.compute_timing(timer.elapsed_ms(), self.t() - t_start);

        if let Some(path) = self.config.simulation.spike_output.clone() {
            let path = if self.comm.size() > 1 { format!("{path}.{}", self.comm.rank()) } else { path };
            self.write_spikes(&path).map_err(ConfigError::Io)?;
        }
        Ok(stats)
    }

    /// Steps every thread `n` times.
    fn step_group<S>(&mut self, n: u64, solver: &S)
    where
        S: CellSolver + ?Sized,
    {
        let Self { registry, scheduler, exchange, spikes, config, .. } = self;
        let dt = config.simulation.dt;
        let mut view = NetView::new(registry, spikes);
        if let Some(ex) = exchange.as_ref() {
            view = view.with_output(ex);
        }
        let exchange = exchange.as_ref();
        let (threads, env) = scheduler.split(view);

        #[cfg(feature = "parallel")]
        {
            if threads.len() > 1 {
                threads
                    .par_iter_mut()
                    .for_each(|thread| step_thread(thread, n, dt, &env, exchange, solver));
                return;
            }
        }

        for thread in threads.iter_mut() {
            step_thread(thread, n, dt, &env, exchange, solver);
        }
    }

    /// Runs the exchange at a boundary. Remote spikes are injected through
    /// thread 0. A no-op on single-rank runs.
    ///
    /// A bounded conservation check that gives up returns
    /// [`NetError::ConservationDiverged`]. Every rank reads the same global
    /// count, so all of them return it from the same boundary. Any other
    /// failure, such as a spike for a gid without a local sink, is fatal
    /// here just as it is between boundaries.
    pub fn exchange_spikes(&mut self) -> NetResult<ExchangeReport> {
        let Some(ex) = self.exchange.as_ref() else {
            return Ok(ExchangeReport::default());
        };
        let view = NetView::new(&self.registry, &self.spikes).with_output(ex);
        let (threads, env) = self.scheduler.split(view);
        let report = match ex.exchange(&env, &mut threads[0]) {
            Ok(report) => report,
            Err(err @ NetError::ConservationDiverged { .. }) => return Err(err),
            Err(err) => fatal(err),
        };
        self.exchanges += 1;
        if report.retries > 0 {
            tracing::debug!(rank = self.comm.rank(), retries = report.retries, "exchange needed retries");
        }
        Ok(report)
    }

    /// Injects a spike of `gid` at time `t`.
    ///
    /// With `fake_out` the spike leaves through the local source, as if the
    /// cell had fired (recorded and exchanged). Otherwise it enters through
    /// the local sink, as if it had arrived from another rank.
    pub fn fake_fire(&mut self, gid: Gid, t: SimTime, fake_out: bool) -> NetResult<()> {
        let rank = self.comm.rank();
        let unknown = NetError::UnknownGid { gid, rank, time: t };
        let Self { registry, scheduler, exchange, spikes, .. } = self;
        let mut view = NetView::new(registry, spikes);
        if let Some(ex) = exchange.as_ref() {
            view = view.with_output(ex);
        }
        let (threads, env) = scheduler.split(view);
        if fake_out {
            let source = registry.source_by_gid(gid).ok_or(unknown)?;
            let thread = registry.source(source).thread;
            env.send_source(source, t, &mut threads[thread]);
        } else {
            let sink = registry.sink_by_gid(gid).ok_or(unknown)?;
            env.send_sink(sink, t, &mut threads[0]);
        }
        Ok(())
    }

    /// Writes the sorted spike record to `path`.
    pub fn write_spikes<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        self.spikes.write_file(path)
    }
}

fn step_thread<S>(
    thread: &mut ThreadState,
    n: u64,
    dt: SimTime,
    env: &DeliveryEnv<'_>,
    exchange: Option<&SpikeExchange>,
    solver: &S,
) where
    S: CellSolver + ?Sized,
{
    for _ in 0..n {
        thread.deliver_net_events(env);
        if thread.id() == 0 {
            if let Some(ex) = exchange {
                ex.advance(env, thread).or_fatal();
            }
        }
        let (id, t) = (thread.id(), thread.t());
        solver.advance(thread.state_mut(), id, t, dt);
        thread.advance_time();
        thread.play_continuous();
        thread.deliver_events(env);
    }
}

impl std::fmt::Debug for SimulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationContext")
            .field("rank", &self.comm.rank())
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .field("exchange", &self.exchange)
            .field("min_delay", &self.min_delay)
            .field("usable_min_delay", &self.usable_min_delay)
            .finish()
    }
}
