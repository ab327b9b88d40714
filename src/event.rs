//! Event definitions for the per-thread queues.
//!
//! Events are the only way cells influence each other. Every queued item is
//! one [`Event`] variant. Delivery dispatches on the variant (see
//! [`ThreadState::deliver`](crate::thread::ThreadState::deliver)).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{EdgeId, SimTime};

/// Index of a [`WatchCondition`] within its thread.
pub type WatchId = usize;

/// Index of a [`PlayRecord`] within its thread.
pub type PlayId = usize;

/// A queued, timestamped occurrence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    /// Delivery of a spike along an edge to its target.
    Edge(EdgeId),
    /// A target's own scheduled event (NET_SEND).
    SelfEvent(SelfEvent),
    /// Periodic re-check of a watched condition.
    ThresholdWatch(WatchId),
    /// Next discontinuity of a played-back variable.
    RecordPlayback(PlayId),
    /// Wakes the thread at the simulation end time.
    TstopMarker,
}

/// Payload of a self event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SelfEvent {
    /// Index of the target on the owning thread.
    pub target: usize,
    /// Value handed to the target's receive handler.
    pub flag: f64,
    /// Weight slot of the edge that triggered the send, if any.
    pub weight_index: Option<usize>,
}

impl Event {
    /// A self event for `target` without a weight slot.
    pub fn self_event(target: usize, flag: f64) -> Self {
        Event::SelfEvent(SelfEvent { target, flag, weight_index: None })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Edge(_) => EventKind::Edge,
            Event::SelfEvent(_) => EventKind::SelfEvent,
            Event::ThresholdWatch(_) => EventKind::ThresholdWatch,
            Event::RecordPlayback(_) => EventKind::RecordPlayback,
            Event::TstopMarker => EventKind::TstopMarker,
        }
    }
}

/// Discriminant of an [`Event`], used for statistics and tracing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Edge,
    SelfEvent,
    ThresholdWatch,
    RecordPlayback,
    TstopMarker,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Edge => "edge",
            EventKind::SelfEvent => "self",
            EventKind::ThresholdWatch => "watch",
            EventKind::RecordPlayback => "playback",
            EventKind::TstopMarker => "tstop",
        };
        f.write_str(name)
    }
}

/// Function of the thread's state vector; positive means "condition holds".
pub type ConditionFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// A WATCH statement: fires its target once each time the condition rises.
#[derive(Clone)]
pub struct WatchCondition {
    /// Index of the target on the owning thread.
    pub target: usize,
    /// Flag passed to the target when the condition rises.
    pub flag: f64,
    /// Re-check interval.
    pub period: SimTime,
    pub condition: ConditionFn,
    var_index: Option<usize>,
    pub(crate) armed: bool,
    pub(crate) active: bool,
}

impl WatchCondition {
    /// Watches an arbitrary condition. It must only read state variables
    /// that exist on the owning thread.
    pub fn new(target: usize, flag: f64, period: SimTime, condition: ConditionFn) -> Self {
        Self { target, flag, period, condition, var_index: None, armed: false, active: true }
    }

    /// Watches `state[var] > threshold`.
    pub fn above(target: usize, flag: f64, period: SimTime, var: usize, threshold: f64) -> Self {
        let condition: ConditionFn = Arc::new(move |state: &[f64]| state[var] - threshold);
        Self { var_index: Some(var), ..Self::new(target, flag, period, condition) }
    }

    /// State variable read by a condition built with [`above`](Self::above).
    pub fn var_index(&self) -> Option<usize> {
        self.var_index
    }

    /// Evaluates the condition. Returns true only on a rising edge.
    pub fn check(&mut self, state: &[f64]) -> bool {
        if (self.condition)(state) > 0.0 {
            if !self.armed {
                self.armed = true;
                return true;
            }
        } else {
            self.armed = false;
        }
        false
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn reset(&mut self) {
        self.armed = false;
    }
}

impl fmt::Debug for WatchCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchCondition")
            .field("target", &self.target)
            .field("flag", &self.flag)
            .field("period", &self.period)
            .field("armed", &self.armed)
            .field("active", &self.active)
            .finish()
    }
}

/// Replays a recorded time course into one state variable.
///
/// Between discontinuities (two consecutive samples with the same time) the
/// value is linearly interpolated once per step. A queued
/// [`Event::RecordPlayback`] marks each discontinuity.
#[derive(Clone, Debug)]
pub struct PlayRecord {
    /// Index of the driven variable in the thread's state vector.
    pub var_index: usize,
    times: Vec<SimTime>,
    values: Vec<f64>,
    discontinuities: Vec<usize>,
    next_discontinuity: usize,
    ubound: usize,
}

impl PlayRecord {
    /// Creates a playback from `(time, value)` samples with non-decreasing times.
    pub fn new(var_index: usize, times: Vec<SimTime>, values: Vec<f64>) -> Self {
        let len = times.len().min(values.len());
        let discontinuities = (1..len).filter(|&i| times[i] == times[i - 1]).collect();
        Self {
            var_index,
            times,
            values,
            discontinuities,
            next_discontinuity: 0,
            ubound: 0,
        }
    }

    fn len(&self) -> usize {
        self.times.len().min(self.values.len())
    }

    /// Rewinds and returns the time of the first discontinuity event, if any.
    pub fn reset(&mut self) -> Option<SimTime> {
        self.next_discontinuity = 0;
        self.advance_bound()
    }

    /// Called on delivery; returns the time of the following discontinuity.
    pub fn deliver(&mut self, state: &mut [f64], t: SimTime) -> Option<SimTime> {
        if self.len() > 0 {
            state[self.var_index] = self.interpolate(t);
        }
        self.advance_bound()
    }

    fn advance_bound(&mut self) -> Option<SimTime> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        match self.discontinuities.get(self.next_discontinuity).copied() {
            Some(i) => {
                self.next_discontinuity += 1;
                self.ubound = i;
                Some(self.times[i])
            }
            None => {
                self.ubound = len - 1;
                if self.next_discontinuity <= self.discontinuities.len() {
                    self.next_discontinuity = self.discontinuities.len() + 1;
                    Some(self.times[len - 1])
                } else {
                    None
                }
            }
        }
    }

    /// Value at `t`, clamped to the samples up to the current bound.
    pub fn interpolate(&self, t: SimTime) -> f64 {
        let hi = self.ubound.min(self.len().saturating_sub(1));
        let times = &self.times[..=hi];
        let values = &self.values[..=hi];
        if t >= times[hi] {
            return values[hi];
        }
        // The last sample at or before t
        let i = times.partition_point(|&x| x <= t);
        if i == 0 {
            return values[0];
        }
        let (t0, t1) = (times[i - 1], times[i]);
        if t1 == t0 {
            return values[i];
        }
        values[i - 1] + (values[i] - values[i - 1]) * (t - t0) / (t1 - t0)
    }

    /// Writes the interpolated value at `t` into `state`.
    pub fn play_continuous(&self, state: &mut [f64], t: SimTime) {
        if self.len() > 0 {
            state[self.var_index] = self.interpolate(t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kinds() {
        assert_eq!(Event::Edge(EdgeId(1)).kind(), EventKind::Edge);
        assert_eq!(Event::self_event(0, 1.0).kind(), EventKind::SelfEvent);
        assert_eq!(Event::TstopMarker.kind().to_string(), "tstop");
    }

    #[test]
    fn test_watch_fires_on_rising_edge_only() {
        let mut w = WatchCondition::above(0, 2.0, 0.1, 0, -20.0);
        assert_eq!(w.var_index(), Some(0));
        assert!(!w.check(&[-65.0]));
        assert!(w.check(&[0.0]));
        assert!(!w.check(&[10.0]));
        assert!(!w.check(&[-70.0]));
        assert!(w.check(&[5.0]));
    }

    #[test]
    fn test_playback_interpolates_and_reports_discontinuities() {
        // Ramp 0..1 on [0,1], jump to 5 at t=1, hold until t=2
        let mut play = PlayRecord::new(0, vec![0.0, 1.0, 1.0, 2.0], vec![0.0, 1.0, 5.0, 5.0]);
        assert_eq!(play.reset(), Some(1.0));
        assert!((play.interpolate(0.5) - 0.5).abs() < 1e-12);

        let mut state = vec![0.0];
        assert_eq!(play.deliver(&mut state, 1.0), Some(2.0));
        assert_eq!(state[0], 5.0);
        assert_eq!(play.deliver(&mut state, 2.0), None);
        assert_eq!(state[0], 5.0);
    }
}
