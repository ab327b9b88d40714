//! Error taxonomy for setup, scheduling and exchange.
//!
//! Setup operations return [`NetError`] through [`NetResult`]. Violations
//! detected on the delivery hot path cannot be recovered from, so they go
//! through [`fatal`]. It logs the diagnostic and panics.

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::{Gid, Rank, SimTime, ThreadIndex};

/// Errors raised by the event scheduling and spike exchange layers.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("gid {gid} is already registered as a source on rank {rank}")]
    DuplicateSource { gid: Gid, rank: Rank },

    #[error("gid {gid} is registered both as a local source and as an input sink on rank {rank}")]
    DualRegistration { gid: Gid, rank: Rank },

    #[error("unknown gid {gid} on rank {rank} at t={time}")]
    UnknownGid { gid: Gid, rank: Rank, time: SimTime },

    #[error("negative gid {gid} has no source on thread {thread}")]
    UnknownLocalGid { gid: Gid, thread: ThreadIndex },

    #[error("edge delay {delay} from gid {gid} must be non-negative")]
    NegativeDelay { gid: Gid, delay: SimTime },

    #[error("thread index {thread} out of range (nthreads = {nthreads})")]
    NoSuchThread { thread: ThreadIndex, nthreads: usize },

    #[error("target {index} does not exist on thread {thread}")]
    NoSuchTarget { thread: ThreadIndex, index: usize },

    #[error("target {index} on thread {thread} already fires source gid {gid}")]
    TargetHasSource { thread: ThreadIndex, index: usize, gid: Gid },

    #[error("state variable {index} does not exist on thread {thread}")]
    NoSuchStateVar { thread: ThreadIndex, index: usize },

    #[error("source registry is frozen; {0} is only allowed during setup")]
    RegistryFrozen(&'static str),

    #[error("event at t={time} precedes thread {thread} time {now}")]
    EventInPast { thread: ThreadIndex, time: SimTime, now: SimTime },

    #[error("stale queue handle (slot {slot}, generation {generation})")]
    StaleHandle { slot: u32, generation: u32 },

    #[error("target {index} on thread {thread} has no movable self event")]
    NoMovableEvent { thread: ThreadIndex, index: usize },

    #[error("edge {edge} targets thread {target} but was delivered on thread {thread}")]
    MisroutedEdge { edge: u32, target: ThreadIndex, thread: ThreadIndex },

    #[error("usable min delay {usable} is smaller than dt {dt}")]
    MinDelayTooSmall { usable: SimTime, dt: SimTime },

    #[error("exchange interval {usable} spans more than {max_steps} steps of dt {dt}; compressed spike times cannot encode it")]
    IntervalTooLong { usable: SimTime, dt: SimTime, max_steps: u32 },

    #[error("rank {rank} sent {count} spikes in one interval, more than a compressed buffer can count")]
    SendBufferOverflow { rank: Rank, count: usize },

    #[error("conservation check on rank {rank} did not converge after {retries} retries ({outstanding} spikes outstanding)")]
    ConservationDiverged { rank: Rank, retries: u32, outstanding: i64 },

    #[error("communication failure on rank {rank}: {reason}")]
    Comm { rank: Rank, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for scheduling and exchange operations.
pub type NetResult<T> = Result<T, NetError>;

/// Logs an unrecoverable invariant violation and aborts the simulation.
#[cold]
#[track_caller]
pub fn fatal(err: NetError) -> ! {
    tracing::error!(error = %err, "fatal simulation error");
    panic!("{err}");
}

/// Unwraps a result or escalates its error through [`fatal`].
pub trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for NetResult<T> {
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = NetError::UnknownGid { gid: 12, rank: 3, time: 4.5 };
        let msg = err.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("rank 3"));
        assert!(msg.contains("4.5"));
    }

    #[test]
    fn test_or_fatal_passes_values() {
        let ok: NetResult<u32> = Ok(9);
        assert_eq!(ok.or_fatal(), 9);
    }

    #[test]
    #[should_panic(expected = "stale queue handle")]
    fn test_fatal_panics() {
        fatal(NetError::StaleHandle { slot: 1, generation: 2 });
    }
}
