//! Per-thread simulation state and event delivery.
//!
//! A [`ThreadState`] owns everything one simulation thread mutates while
//! stepping: its timed queue (and optional bin queue), its point processes,
//! the weight and state vectors, watch conditions and playbacks. Nothing in
//! here is shared; other threads reach this thread only through its staging
//! lane in the [`Scheduler`](crate::scheduler::Scheduler).

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{fatal, NetError};
use crate::event::{Event, EventKind, PlayRecord, WatchCondition};
use crate::queue::{BinQueue, Due, QueueHandle, TimedQueue};
use crate::registry::SourceRegistry;
use crate::scheduler::DeliveryEnv;
use crate::target::{NetReceiveContext, PointProcess};
use crate::types::{EdgeId, SimTime, TargetRef, ThreadIndex, THRESHOLD_DELIVERY_OFFSET};

/// Delivery counters for one thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStats {
    pub edge_events: u64,
    pub self_events: u64,
    pub watch_events: u64,
    pub playback_events: u64,
    pub tstop_events: u64,
    /// Events received from other threads' staging.
    pub staged_in: u64,
    /// Events this thread staged for other threads.
    pub staged_out: u64,
    /// Spikes fired by sources on this thread.
    pub spikes_fired: u64,
    pub steps: u64,
}

impl ThreadStats {
    pub fn delivered(&self) -> u64 {
        self.edge_events + self.self_events + self.watch_events + self.playback_events + self.tstop_events
    }

    fn count(&mut self, kind: EventKind) {
        match kind {
            EventKind::Edge => self.edge_events += 1,
            EventKind::SelfEvent => self.self_events += 1,
            EventKind::ThresholdWatch => self.watch_events += 1,
            EventKind::RecordPlayback => self.playback_events += 1,
            EventKind::TstopMarker => self.tstop_events += 1,
        }
    }
}

/// State owned by one simulation thread.
pub struct ThreadState {
    id: ThreadIndex,
    t: SimTime,
    dt: SimTime,
    queue: TimedQueue<Event>,
    bins: Option<BinQueue<Event>>,
    targets: Vec<Box<dyn PointProcess>>,
    movable: Vec<Option<QueueHandle>>,
    weights: Vec<f64>,
    state: Vec<f64>,
    armed: Vec<bool>,
    watches: Vec<WatchCondition>,
    playbacks: Vec<PlayRecord>,
    fires: Vec<(usize, SimTime)>,
    unreffed_self_events: u64,
    stats: ThreadStats,
}

impl ThreadState {
    /// A thread at time zero. `use_bin_queue` routes cell spikes through
    /// fixed-step bins instead of the timed queue.
    pub fn new(id: ThreadIndex, dt: SimTime, use_bin_queue: bool) -> Self {
        Self {
            id,
            t: 0.0,
            dt,
            queue: TimedQueue::new().with_owner(id),
            bins: use_bin_queue.then(|| BinQueue::new(dt).with_owner(id)),
            targets: Vec::new(),
            movable: Vec::new(),
            weights: Vec::new(),
            state: Vec::new(),
            armed: Vec::new(),
            watches: Vec::new(),
            playbacks: Vec::new(),
            fires: Vec::new(),
            unreffed_self_events: 0,
            stats: ThreadStats::default(),
        }
    }

    pub fn id(&self) -> ThreadIndex {
        self.id
    }

    /// Current thread time. During delivery it follows the event being delivered.
    pub fn t(&self) -> SimTime {
        self.t
    }

    pub fn dt(&self) -> SimTime {
        self.dt
    }

    pub fn stats(&self) -> &ThreadStats {
        &self.stats
    }

    /// The timed queue, for inspection. Binned edge events are not in it.
    pub fn queue(&self) -> &TimedQueue<Event> {
        &self.queue
    }

    /// Events still waiting in the queue and bins.
    pub fn pending_len(&self) -> usize {
        self.queue.len() + self.bins.as_ref().map_or(0, BinQueue::len)
    }

    /// Self events sent and not yet delivered.
    pub fn unreffed_self_events(&self) -> u64 {
        self.unreffed_self_events
    }

    // ------------------------------------------------------------------
    // Model setup
    // ------------------------------------------------------------------

    /// Adds a target and returns its index on this thread.
    pub fn add_target(&mut self, target: Box<dyn PointProcess>) -> usize {
        self.targets.push(target);
        self.movable.push(None);
        self.targets.len() - 1
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Weight slots target `index` wants per edge, or `None` if there is no
    /// such target.
    pub fn target_weight_count(&self, index: usize) -> Option<usize> {
        self.targets.get(index).map(|t| t.weight_count())
    }

    /// Appends weight slots and returns the index of the first one.
    pub fn alloc_weights(&mut self, weights: &[f64]) -> usize {
        let index = self.weights.len();
        self.weights.extend_from_slice(weights);
        index
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Frees every weight slot. Only valid once no edge refers to them.
    pub fn clear_weights(&mut self) {
        self.weights.clear();
    }

    /// Appends a state variable and returns its index.
    pub fn add_state_var(&mut self, value: f64) -> usize {
        self.state.push(value);
        self.state.len() - 1
    }

    /// State vector the solver integrates and thresholds are read from.
    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut [f64] {
        &mut self.state
    }

    /// Adds a watch condition and returns its index. It is first checked at
    /// the next initialization.
    pub fn add_watch(&mut self, watch: WatchCondition) -> usize {
        self.watches.push(watch);
        self.watches.len() - 1
    }

    /// The watch at `index`, if any.
    pub fn watch_mut(&mut self, index: usize) -> Option<&mut WatchCondition> {
        self.watches.get_mut(index)
    }

    /// Adds a playback and returns its index.
    pub fn add_playback(&mut self, play: PlayRecord) -> usize {
        self.playbacks.push(play);
        self.playbacks.len() - 1
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Resets time, queues, weights and targets, then schedules the initial
    /// watch checks, playback discontinuities and the tstop marker. A `tstop`
    /// before `t0` has already passed and gets no marker.
    pub fn initialize(&mut self, t0: SimTime, tstop: Option<SimTime>, registry: &SourceRegistry) {
        self.queue.clear();
        self.queue.set_now(t0);
        if let Some(bins) = self.bins.as_mut() {
            bins.reset(t0);
        }
        self.t = t0;
        self.fires.clear();
        self.unreffed_self_events = 0;
        self.movable.iter_mut().for_each(|m| *m = None);
        // A source that starts above threshold must fall below it before it can fire
        let state = &self.state;
        self.armed = registry
            .threshold_sources(self.id)
            .iter()
            .map(|&id| {
                registry.source(id).threshold.map_or(false, |th| {
                    state.get(th.var_index).map_or(false, |&v| v > th.value)
                })
            })
            .collect();

        for edge in registry.edges().iter().filter(|e| e.target.thread == self.id) {
            let range = edge.weight_index..edge.weight_index + edge.weight_count;
            match (self.targets.get(edge.target.index), self.weights.get_mut(range)) {
                (Some(target), Some(weights)) => target.init_weights(weights),
                _ => fatal(NetError::NoSuchTarget { thread: self.id, index: edge.target.index }),
            }
        }

        for index in 0..self.targets.len() {
            self.with_context(index, None, |target, ctx| target.initialize(ctx));
        }

        for w in 0..self.watches.len() {
            self.watches[w].reset();
            if self.watches[w].is_active() {
                self.queue.insert(t0, Event::ThresholdWatch(w));
            }
        }
        for p in 0..self.playbacks.len() {
            if let Some(first) = self.playbacks[p].reset() {
                self.queue.insert(first.max(t0), Event::RecordPlayback(p));
            }
        }
        if let Some(tstop) = tstop.filter(|&tstop| tstop >= t0) {
            self.queue.insert(tstop, Event::TstopMarker);
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Inserts an event into this thread's queue.
    pub fn insert_event(&mut self, time: SimTime, event: Event) -> QueueHandle {
        self.queue.insert(time, event)
    }

    /// Removes a queued event.
    pub fn remove_event(&mut self, handle: QueueHandle) -> Event {
        let event = self.queue.remove(handle);
        if let Event::SelfEvent(se) = event {
            self.unreffed_self_events = self.unreffed_self_events.saturating_sub(1);
            if self.movable.get(se.target) == Some(&Some(handle)) {
                self.movable[se.target] = None;
            }
        }
        event
    }

    /// Queues an edge delivery, using the bin queue when enabled.
    pub fn bin_event(&mut self, time: SimTime, event: Event) {
        match (self.bins.as_mut(), event) {
            (Some(bins), Event::Edge(_)) => bins.enqueue(time, event),
            _ => {
                self.queue.insert(time, event);
            }
        }
    }

    pub(crate) fn note_staged_in(&mut self) {
        self.stats.staged_in += 1;
    }

    pub(crate) fn note_staged_out(&mut self) {
        self.stats.staged_out += 1;
    }

    pub(crate) fn note_spike(&mut self) {
        self.stats.spikes_fired += 1;
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Delivers every queued event with time `<= deadline`.
    ///
    /// Thread time follows each event while it is delivered and is restored
    /// afterwards. Returns the number of events delivered.
    pub fn deliver_through(&mut self, deadline: SimTime, env: &DeliveryEnv<'_>) -> usize {
        let tsav = self.t;
        let mut delivered = 0;
        while let Some(due) = self.queue.extract_due(deadline) {
            self.deliver(due, env);
            delivered += 1;
        }
        self.restore_time(tsav);
        delivered
    }

    /// Pre-update window: staged events, the current bin and everything due
    /// by `t + dt/2`.
    pub fn deliver_net_events(&mut self, env: &DeliveryEnv<'_>) -> usize {
        env.drain_staged(self);
        let tm = self.t + 0.5 * self.dt;
        let mut delivered = 0;
        if self.bins.is_some() {
            let tsav = self.t;
            loop {
                let mut progressed = false;
                while let Some(event) = self.bins.as_mut().and_then(BinQueue::dequeue) {
                    self.deliver_at(tsav, None, event, env);
                    delivered += 1;
                    progressed = true;
                }
                let n = self.deliver_through(tm, env);
                delivered += n;
                if !progressed && n == 0 {
                    break;
                }
            }
            self.restore_time(tsav);
            if let Some(bins) = self.bins.as_mut() {
                bins.shift(tsav + self.dt);
            }
        } else {
            delivered += self.deliver_through(tm, env);
        }
        delivered
    }

    /// Post-update window: threshold detection, then everything due by `t`.
    pub fn deliver_events(&mut self, env: &DeliveryEnv<'_>) -> usize {
        self.check_thresholds(env);
        env.drain_staged(self);
        self.deliver_through(self.t, env)
    }

    /// Applies interpolated playback values at the current time.
    pub fn play_continuous(&mut self) {
        let t = self.t;
        for play in &self.playbacks {
            play.play_continuous(&mut self.state, t);
        }
    }

    /// Advances thread time by one step.
    pub fn advance_time(&mut self) {
        self.restore_time(self.t + self.dt);
        self.stats.steps += 1;
    }

    /// Sets thread time directly (used by the driver and by tests).
    pub fn set_time(&mut self, t: SimTime) {
        self.restore_time(t);
    }

    fn restore_time(&mut self, t: SimTime) {
        self.t = t;
        self.queue.set_now(t);
    }

    /// Detects upward threshold crossings and fires the crossing sources.
    pub fn check_thresholds(&mut self, env: &DeliveryEnv<'_>) {
        let sources = env.registry.threshold_sources(self.id);
        if self.armed.len() != sources.len() {
            self.armed.resize(sources.len(), false);
        }
        for (k, &id) in sources.iter().enumerate() {
            let Some(threshold) = env.registry.source(id).threshold else {
                continue;
            };
            let fired = if self.state[threshold.var_index] > threshold.value {
                let rising = !self.armed[k];
                self.armed[k] = true;
                rising
            } else {
                self.armed[k] = false;
                false
            };
            if fired {
                let t = self.t + THRESHOLD_DELIVERY_OFFSET;
                env.send_source(id, t, self);
            }
        }
    }

    /// Delivers one extracted event.
    pub fn deliver(&mut self, due: Due<Event>, env: &DeliveryEnv<'_>) {
        self.deliver_at(due.time, Some(due.handle), due.item, env);
    }

    fn deliver_at(&mut self, tt: SimTime, handle: Option<QueueHandle>, event: Event, env: &DeliveryEnv<'_>) {
        self.restore_time(tt);
        tracing::trace!(thread = self.id, t = tt, kind = %event.kind(), "deliver");

        match event {
            Event::Edge(id) => self.deliver_edge(id, env),
            Event::SelfEvent(se) => {
                self.unreffed_self_events = self.unreffed_self_events.saturating_sub(1);
                if handle.is_some() && self.movable.get(se.target) == Some(&handle) {
                    self.movable[se.target] = None;
                }
                let count = self.target_weight_count(se.target).unwrap_or(0);
                let range = se.weight_index.map(|i| i..i + count);
                self.with_context(se.target, range, |target, ctx| target.net_receive(ctx, se.flag));
            }
            Event::ThresholdWatch(w) => {
                let Some(watch) = self.watches.get_mut(w) else {
                    return;
                };
                if !watch.is_active() {
                    return;
                }
                let fired = watch.check(&self.state);
                let (target, flag, period) = (watch.target, watch.flag, watch.period);
                if fired {
                    self.with_context(target, None, |t, ctx| t.net_receive(ctx, flag));
                }
                if self.watches[w].is_active() {
                    self.queue.insert(tt + period, event);
                }
            }
            Event::RecordPlayback(p) => {
                if let Some(next) = self.playbacks[p].deliver(&mut self.state, tt) {
                    self.queue.insert(next.max(tt), event);
                }
            }
            Event::TstopMarker => {}
        }
        self.stats.count(event.kind());
        self.process_fires(env);
    }

    fn deliver_edge(&mut self, id: EdgeId, env: &DeliveryEnv<'_>) {
        let edge = env.registry.edge(id);
        if edge.target.thread != self.id {
            fatal(NetError::MisroutedEdge { edge: id.0, target: edge.target.thread, thread: self.id });
        }
        let range = edge.weight_index..edge.weight_index + edge.weight_count;
        self.with_context(edge.target.index, Some(range), |target, ctx| target.net_receive(ctx, 0.0));
    }

    fn process_fires(&mut self, env: &DeliveryEnv<'_>) {
        if self.fires.is_empty() {
            return;
        }
        for (target, tt) in std::mem::take(&mut self.fires) {
            if let Some(source) = env.registry.source_for_target(TargetRef::new(self.id, target)) {
                env.send_source(source, tt, self);
            }
        }
    }

    fn with_context<F>(&mut self, index: usize, weights: Option<Range<usize>>, f: F)
    where
        F: FnOnce(&mut dyn PointProcess, &mut NetReceiveContext<'_>),
    {
        let Self {
            id,
            t,
            queue,
            targets,
            movable,
            weights: weight_vec,
            state,
            fires,
            unreffed_self_events,
            ..
        } = self;
        let Some(target) = targets.get_mut(index) else {
            fatal(NetError::NoSuchTarget { thread: *id, index });
        };
        let weight_index = weights.as_ref().map(|r| r.start);
        let weights: &mut [f64] = match weights {
            Some(range) => match weight_vec.get_mut(range) {
                Some(w) => w,
                None => fatal(NetError::NoSuchTarget { thread: *id, index }),
            },
            None => &mut [],
        };
        let mut ctx = NetReceiveContext {
            t: *t,
            thread: *id,
            target: index,
            weight_index,
            weights,
            state: state.as_slice(),
            queue,
            movable: &mut movable[index],
            fires,
            self_events: unreffed_self_events,
        };
        f(target.as_mut(), &mut ctx);
    }

    /// Drops every pending event. Returns how many were dropped.
    pub fn clear_events(&mut self) -> usize {
        let mut dropped = self.queue.clear();
        if let Some(bins) = self.bins.as_mut() {
            dropped += bins.len();
            bins.reset(self.t);
        }
        self.fires.clear();
        self.unreffed_self_events = 0;
        self.movable.iter_mut().for_each(|m| *m = None);
        dropped
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("t", &self.t)
            .field("targets", &self.targets.len())
            .field("pending", &self.pending_len())
            .finish()
    }
}
