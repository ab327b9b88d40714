//! Point processes: the receivers of events.
//!
//! A [`PointProcess`] is the event-facing side of a synapse or artificial
//! cell. The scheduler calls [`PointProcess::net_receive`] for every event
//! addressed to it and hands over a [`NetReceiveContext`] through which the
//! target may schedule self events, move them, or fire its own source.

use crate::error::{fatal, NetError};
use crate::event::{Event, SelfEvent};
use crate::queue::{QueueHandle, TimedQueue};
use crate::types::{SimTime, ThreadIndex};

/// Behaviour of an event receiver living on one simulation thread.
pub trait PointProcess: Send {
    /// Called once per `finitialize`, before any event is delivered.
    fn initialize(&mut self, _ctx: &mut NetReceiveContext<'_>) {}

    /// Handles one delivered event.
    ///
    /// `flag` is zero for spikes arriving over an edge and the chosen value
    /// for self events and watch conditions.
    fn net_receive(&mut self, ctx: &mut NetReceiveContext<'_>, flag: f64);

    /// Number of weight slots each incoming edge carries.
    fn weight_count(&self) -> usize {
        1
    }

    /// Resets the per-edge weight slots at initialization. The first slot is
    /// the synaptic weight and is left untouched by default.
    fn init_weights(&self, weights: &mut [f64]) {
        for w in weights.iter_mut().skip(1) {
            *w = 0.0;
        }
    }
}

/// Everything a target may touch while handling an event.
pub struct NetReceiveContext<'a> {
    pub(crate) t: SimTime,
    pub(crate) thread: ThreadIndex,
    pub(crate) target: usize,
    pub(crate) weight_index: Option<usize>,
    pub(crate) weights: &'a mut [f64],
    pub(crate) state: &'a [f64],
    pub(crate) queue: &'a mut TimedQueue<Event>,
    pub(crate) movable: &'a mut Option<QueueHandle>,
    pub(crate) fires: &'a mut Vec<(usize, SimTime)>,
    pub(crate) self_events: &'a mut u64,
}

impl<'a> NetReceiveContext<'a> {
    /// Current time of the delivering thread (the event time).
    pub fn t(&self) -> SimTime {
        self.t
    }

    pub fn thread(&self) -> ThreadIndex {
        self.thread
    }

    /// Weight slots of the delivering edge. Empty for self events.
    pub fn weights(&self) -> &[f64] {
        self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f64] {
        self.weights
    }

    /// The thread's state vector (membrane potentials and other variables).
    pub fn state(&self) -> &[f64] {
        self.state
    }

    /// Schedules a self event `delay` from now.
    ///
    /// With `flag == 1.0` the event becomes this target's movable event and
    /// can later be shifted with [`net_move`](Self::net_move).
    pub fn net_send(&mut self, delay: SimTime, flag: f64) -> QueueHandle {
        let event = Event::SelfEvent(SelfEvent {
            target: self.target,
            flag,
            weight_index: self.weight_index,
        });
        let handle = self.queue.insert(self.t + delay, event);
        *self.self_events += 1;
        if flag == 1.0 {
            *self.movable = Some(handle);
        }
        handle
    }

    /// Moves this target's movable self event to absolute time `tt`.
    pub fn net_move(&mut self, tt: SimTime) {
        let Some(handle) = *self.movable else {
            fatal(NetError::NoMovableEvent { thread: self.thread, index: self.target });
        };
        if tt < self.t {
            fatal(NetError::EventInPast { thread: self.thread, time: tt, now: self.t });
        }
        self.queue.reschedule(handle, tt);
    }

    /// Fires the source bound to this target at absolute time `tt`.
    pub fn net_event(&mut self, tt: SimTime) {
        if tt < self.t {
            fatal(NetError::EventInPast { thread: self.thread, time: tt, now: self.t });
        }
        self.fires.push((self.target, tt));
    }
}
