//! Per-thread queues plus inter-thread staging.
//!
//! The [`Scheduler`] owns one [`ThreadState`] per simulation thread and one
//! [`StagingLane`] per thread. A thread inserts events for its own targets
//! directly into its queue. Events for another thread's targets go through
//! that thread's lane, which any thread may push to at any time. The owner
//! drains its lane at the start of every delivery window.
//!
//! [`DeliveryEnv`] bundles the shared, read-only view a thread needs while
//! delivering: the frozen registry, the lanes, the spike log and the
//! exchange that takes outbound spikes.

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::error::{fatal, NetError};
use crate::event::Event;
use crate::registry::{Source, SourceRegistry};
use crate::spikes::SpikeLog;
use crate::thread::ThreadState;
use crate::types::{EdgeId, Presyn, SimTime, SinkId, SourceId, ThreadIndex, TIME_EPSILON};

/// An event in transit to another thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StagedEvent {
    pub time: SimTime,
    pub event: Event,
    pub from: ThreadIndex,
}

/// Multi-producer, single-consumer inbox of one thread.
#[derive(Debug)]
pub struct StagingLane {
    tx: Sender<StagedEvent>,
    rx: Receiver<StagedEvent>,
}

impl Default for StagingLane {
    fn default() -> Self {
        Self::new()
    }
}

impl StagingLane {
    /// An empty lane.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Pushes an event. Never blocks.
    pub fn stage(&self, staged: StagedEvent) {
        // The receiver lives as long as the lane, so the send cannot fail
        let _ = self.tx.send(staged);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn drain(&self) -> impl Iterator<Item = StagedEvent> + '_ {
        self.rx.try_iter()
    }
}

/// Stages `event` on the lane of `thread`. A thread without a lane is fatal.
fn stage_on(lanes: &[StagingLane], thread: ThreadIndex, time: SimTime, event: Event, from: ThreadIndex) {
    match lanes.get(thread) {
        Some(lane) => lane.stage(StagedEvent { time, event, from }),
        None => fatal(NetError::NoSuchThread { thread, nthreads: lanes.len() }),
    }
}

/// Receives spikes of exchanged sources for delivery to other ranks.
pub trait SpikeOutput: Sync {
    fn output_spike(&self, source: &Source, t: SimTime);
}

/// Shared state a thread reads while delivering events.
#[derive(Clone, Copy)]
pub struct NetView<'a> {
    pub registry: &'a SourceRegistry,
    pub spikes: &'a SpikeLog,
    pub output: Option<&'a dyn SpikeOutput>,
}

impl<'a> NetView<'a> {
    /// A view with no spike output; spikes stay on this rank.
    pub fn new(registry: &'a SourceRegistry, spikes: &'a SpikeLog) -> Self {
        Self { registry, spikes, output: None }
    }

    /// Hands spikes of exchanged sources to `output`.
    pub fn with_output(mut self, output: &'a dyn SpikeOutput) -> Self {
        self.output = Some(output);
        self
    }
}

/// [`NetView`] plus the staging lanes.
#[derive(Clone, Copy)]
pub struct DeliveryEnv<'a> {
    pub registry: &'a SourceRegistry,
    pub lanes: &'a [StagingLane],
    pub spikes: &'a SpikeLog,
    pub output: Option<&'a dyn SpikeOutput>,
}

impl<'a> DeliveryEnv<'a> {
    /// Pairs a network view with the staging lanes of every thread.
    pub fn new(view: NetView<'a>, lanes: &'a [StagingLane]) -> Self {
        Self { registry: view.registry, lanes, spikes: view.spikes, output: view.output }
    }

    /// Hands an event to another thread.
    pub fn stage_for(&self, thread: ThreadIndex, time: SimTime, event: Event, from: ThreadIndex) {
        stage_on(self.lanes, thread, time, event, from);
    }

    /// Moves everything staged for `thread` into its queue.
    pub fn drain_staged(&self, thread: &mut ThreadState) -> usize {
        let Some(lane) = self.lanes.get(thread.id()) else {
            return 0;
        };
        let mut n = 0;
        for staged in lane.drain() {
            if staged.time < thread.t() - TIME_EPSILON {
                fatal(NetError::EventInPast { thread: thread.id(), time: staged.time, now: thread.t() });
            }
            thread.bin_event(staged.time, staged.event);
            thread.note_staged_in();
            n += 1;
        }
        n
    }

    /// Fires a local source at time `t`.
    ///
    /// Records the spike, schedules every active outgoing edge, and passes
    /// exchanged spikes to the output.
    pub fn send_source(&self, id: SourceId, t: SimTime, origin: &mut ThreadState) {
        let source = self.registry.source(id);
        if source.gid >= 0 {
            self.spikes.record(source.gid, t);
        }
        origin.note_spike();
        self.fan_out(self.registry.edges_of(Presyn::Source(id)), t, origin);
        if source.is_exchanged() {
            if let Some(output) = self.output {
                output.output_spike(source, t);
            }
        }
    }

    /// Delivers a spike that arrived for a remote gid to its local edges.
    pub fn send_sink(&self, id: SinkId, t: SimTime, origin: &mut ThreadState) {
        self.fan_out(self.registry.edges_of(Presyn::Sink(id)), t, origin);
    }

    fn fan_out(&self, edges: &[EdgeId], t: SimTime, origin: &mut ThreadState) {
        for &id in edges {
            let edge = self.registry.edge(id);
            if !edge.active {
                continue;
            }
            let td = t + edge.delay;
            if edge.target.thread == origin.id() {
                origin.bin_event(td, Event::Edge(id));
            } else {
                self.stage_for(edge.target.thread, td, Event::Edge(id), origin.id());
                origin.note_staged_out();
            }
        }
    }
}

/// One timed queue and one staging lane per simulation thread.
pub struct Scheduler {
    threads: Vec<ThreadState>,
    lanes: Vec<StagingLane>,
}

impl Scheduler {
    pub fn new(nthreads: usize, dt: SimTime, use_bin_queue: bool) -> Self {
        Self {
            threads: (0..nthreads).map(|i| ThreadState::new(i, dt, use_bin_queue)).collect(),
            lanes: (0..nthreads).map(|_| StagingLane::new()).collect(),
        }
    }

    pub fn nthreads(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, index: ThreadIndex) -> &ThreadState {
        &self.threads[index]
    }

    pub fn thread_mut(&mut self, index: ThreadIndex) -> &mut ThreadState {
        &mut self.threads[index]
    }

    pub fn threads(&self) -> &[ThreadState] {
        &self.threads
    }

    pub fn lanes(&self) -> &[StagingLane] {
        &self.lanes
    }

    /// Splits into the mutable thread states and a delivery environment.
    pub fn split<'a>(&'a mut self, view: NetView<'a>) -> (&'a mut [ThreadState], DeliveryEnv<'a>) {
        (&mut self.threads, DeliveryEnv::new(view, &self.lanes))
    }

    /// Hands an event to `thread` from any thread.
    pub fn stage_for(&self, thread: ThreadIndex, time: SimTime, event: Event, from: ThreadIndex) {
        stage_on(&self.lanes, thread, time, event, from);
    }

    /// Drains `thread`'s staging lane, then delivers every event due by
    /// `deadline`. Returns the number of events delivered.
    pub fn deliver_through(&mut self, thread: ThreadIndex, deadline: SimTime, view: NetView<'_>) -> usize {
        let nthreads = self.threads.len();
        let (threads, env) = self.split(view);
        let Some(state) = threads.get_mut(thread) else {
            fatal(NetError::NoSuchThread { thread, nthreads });
        };
        env.drain_staged(state);
        state.deliver_through(deadline, &env)
    }

    /// Events waiting in queues and lanes across all threads.
    pub fn pending_events(&self) -> usize {
        self.threads.iter().map(ThreadState::pending_len).sum::<usize>()
            + self.lanes.iter().map(StagingLane::len).sum::<usize>()
    }

    /// Drops every pending event, staged ones included.
    pub fn clear_events(&mut self) -> usize {
        let mut dropped = 0;
        for lane in &self.lanes {
            dropped += lane.drain().count();
        }
        for thread in &mut self.threads {
            dropped += thread.clear_events();
        }
        dropped
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("threads", &self.threads)
            .field("staged", &self.lanes.iter().map(StagingLane::len).collect::<Vec<_>>())
            .finish()
    }
}
