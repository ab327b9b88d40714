//! Reference point processes.
//!
//! Small artificial cells that exercise the event interface end to end:
//! a regular spike generator, a leaky integrate-and-fire cell and a
//! recorder. They are used by the integration tests and benches and are
//! handy when wiring up a network by hand.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::target::{NetReceiveContext, PointProcess};
use crate::types::{SimTime, ThreadIndex};

/// Flag of the self event that paces a spike train.
const FLAG_NEXT: f64 = 1.0;

/// Fires `number` spikes every `interval`, starting at `start`.
///
/// An edge event with positive weight restarts the train at the arrival
/// time. A negative weight stops it.
#[derive(Clone, Debug)]
pub struct IntervalFire {
    pub interval: SimTime,
    pub number: u32,
    pub start: SimTime,
    fired: u32,
    on: bool,
}

impl IntervalFire {
    /// Fires `number` spikes `interval` apart, the first at `start`.
    pub fn new(interval: SimTime, number: u32, start: SimTime) -> Self {
        Self { interval, number, start, fired: 0, on: false }
    }

    /// Spikes fired since the last initialization or restart.
    pub fn fired(&self) -> u32 {
        self.fired
    }
}

impl PointProcess for IntervalFire {
    fn initialize(&mut self, ctx: &mut NetReceiveContext<'_>) {
        self.fired = 0;
        self.on = self.number > 0 && self.start >= 0.0;
        if self.on {
            ctx.net_send(self.start, FLAG_NEXT);
        }
    }

    fn net_receive(&mut self, ctx: &mut NetReceiveContext<'_>, flag: f64) {
        if flag == FLAG_NEXT {
            if !self.on {
                return;
            }
            ctx.net_event(ctx.t());
            self.fired += 1;
            if self.fired < self.number {
                ctx.net_send(self.interval, FLAG_NEXT);
            } else {
                self.on = false;
            }
            return;
        }

        let w = ctx.weights().first().copied().unwrap_or(0.0);
        if w > 0.0 {
            self.fired = 0;
            if self.on {
                let now = ctx.t();
                ctx.net_move(now);
            } else {
                self.on = self.number > 0;
                if self.on {
                    ctx.net_send(0.0, FLAG_NEXT);
                }
            }
        } else if w < 0.0 {
            self.on = false;
        }
    }
}

/// Leaky integrate-and-fire cell driven purely by events.
///
/// The membrane value decays with time constant `tau` between events and
/// jumps by the edge weight on arrival. Crossing 1 fires the cell, resets
/// the membrane and ignores input for `refractory`.
#[derive(Clone, Debug)]
pub struct IntegrateFire {
    pub tau: SimTime,
    pub refractory: SimTime,
    m: f64,
    t0: SimTime,
    refractory_until: Option<SimTime>,
}

impl IntegrateFire {
    /// Decays toward zero with time constant `tau` and ignores input for
    /// `refractory` after each spike.
    pub fn new(tau: SimTime, refractory: SimTime) -> Self {
        Self { tau, refractory, m: 0.0, t0: 0.0, refractory_until: None }
    }

    /// Membrane value as of the last event.
    pub fn m(&self) -> f64 {
        self.m
    }
}

impl PointProcess for IntegrateFire {
    fn initialize(&mut self, ctx: &mut NetReceiveContext<'_>) {
        self.m = 0.0;
        self.t0 = ctx.t();
        self.refractory_until = None;
    }

    fn net_receive(&mut self, ctx: &mut NetReceiveContext<'_>, flag: f64) {
        let t = ctx.t();
        if flag == FLAG_NEXT {
            self.refractory_until = None;
            self.t0 = t;
            return;
        }
        if self.refractory_until.is_some() {
            return;
        }
        self.m = self.m * (-(t - self.t0) / self.tau).exp() + ctx.weights().first().copied().unwrap_or(0.0);
        self.t0 = t;
        if self.m >= 1.0 {
            ctx.net_event(t);
            self.m = 0.0;
            if self.refractory > 0.0 {
                self.refractory_until = Some(t + self.refractory);
                ctx.net_send(self.refractory, FLAG_NEXT);
            }
        }
    }
}

/// One delivery seen by an [`EventRecorder`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Received {
    pub t: SimTime,
    pub thread: ThreadIndex,
    pub flag: f64,
    pub weight: f64,
}

/// Shared log of [`Received`] entries.
pub type ReceivedLog = Arc<Mutex<Vec<Received>>>;

/// Records every event it receives.
#[derive(Clone, Debug, Default)]
pub struct EventRecorder {
    log: ReceivedLog,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder appending to an existing log.
    pub fn with_log(log: ReceivedLog) -> Self {
        Self { log }
    }

    /// Shared handle to the received events.
    pub fn log(&self) -> ReceivedLog {
        self.log.clone()
    }
}

impl PointProcess for EventRecorder {
    fn net_receive(&mut self, ctx: &mut NetReceiveContext<'_>, flag: f64) {
        self.log.lock().push(Received {
            t: ctx.t(),
            thread: ctx.thread(),
            flag,
            weight: ctx.weights().first().copied().unwrap_or(0.0),
        });
    }
}
