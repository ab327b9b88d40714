//! Core type definitions for the spike exchange subsystem.
//!
//! This module defines the identifiers and time representation shared by the
//! queue, registry, scheduler and exchange layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Simulation time in milliseconds.
///
/// Every event key, threshold crossing and exchange boundary uses the same
/// `SimTime` representation, so all threads and ranks share one timeline.
pub type SimTime = f64;

/// Global cell identifier.
///
/// Non-negative gids are unique across all ranks. Negative gids name
/// artificial sources that are local to one thread and never exchanged.
pub type Gid = i32;

/// Index of a simulation thread within one rank.
pub type ThreadIndex = usize;

/// Index of a process (rank) within the communicator.
pub type Rank = usize;

/// Tolerance used when comparing an event time with the owning thread's time.
pub const TIME_EPSILON: SimTime = 100.0 * f64::EPSILON;

/// Offset added to a threshold crossing before it is delivered to local edges.
pub const THRESHOLD_DELIVERY_OFFSET: SimTime = 1e-10;

/// Location of a point process: the thread that owns it and its index there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetRef {
    pub thread: ThreadIndex,
    pub index: usize,
}

impl TargetRef {
    pub fn new(thread: ThreadIndex, index: usize) -> Self {
        Self { thread, index }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.thread, self.index)
    }
}

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            /// Position of the referenced entry in its arena.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(
    /// Index of a [`Source`](crate::registry::Source) in the registry arena.
    SourceId
);
arena_id!(
    /// Index of a [`Sink`](crate::registry::Sink) in the registry arena.
    SinkId
);
arena_id!(
    /// Index of an [`Edge`](crate::registry::Edge) in the registry arena.
    EdgeId
);

/// The presynaptic side of an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Presyn {
    /// A locally owned spike source.
    Source(SourceId),
    /// A local stand-in for a source that lives on another rank.
    Sink(SinkId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_aliases() {
        let time: SimTime = 1.25;
        let gid: Gid = -3;
        let thread: ThreadIndex = 2;
        let rank: Rank = 7;

        assert_eq!(time, 1.25);
        assert!(gid < 0);
        assert_eq!(thread, 2);
        assert_eq!(rank, 7);
    }

    #[test]
    fn test_arena_ids() {
        assert_eq!(EdgeId(5).index(), 5);
        assert!(SourceId(1) < SourceId(2));
        assert_eq!(TargetRef::new(1, 4).to_string(), "1:4");
    }
}
