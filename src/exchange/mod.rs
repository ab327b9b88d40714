//! Spike exchange between ranks.
//!
//! [`SpikeExchange`] wraps the configured method. Both methods take spikes
//! of exchanged sources through [`SpikeOutput`] while threads integrate.
//! At every exchange boundary they inject remote spikes through the local
//! sinks on thread 0.
//!
//! The spacing of exchange boundaries follows from the minimum delay of
//! any edge that crosses a rank or thread boundary; see
//! [`compute_min_delay`] and [`usable_min_delay`].

pub mod allgather;
pub mod multisend;

pub use allgather::AllgatherExchange;
pub use multisend::Multisend;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::config::{ExchangeConfig, ExchangeMethod};
use crate::error::{NetError, NetResult};
use crate::registry::{Source, SourceRegistry};
use crate::scheduler::{DeliveryEnv, SpikeOutput};
use crate::target_list::TargetListBuilder;
use crate::thread::ThreadState;
use crate::types::{SimTime, TIME_EPSILON};

/// Number of bins of the conservation retry histogram; the last bin
/// collects everything at or above it.
pub const RETRY_HISTOGRAM_BINS: usize = 11;

/// Outcome of one exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeReport {
    /// Spikes delivered to local sinks.
    pub received: i64,
    /// Extra conservation rounds that were needed.
    pub retries: u32,
}

/// Exchange activity counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeStats {
    pub method: String,
    pub exchanges: u64,
    pub spikes_sent: u64,
    pub spikes_received: u64,
    /// Received spikes that had a local sink.
    #[serde(default)]
    pub spikes_useful: u64,
    /// Most spikes this rank handed to the exchange in one interval.
    #[serde(default)]
    pub max_sent: u64,
    pub relayed: u64,
    pub conservation_retries: u64,
    pub retry_histogram: Vec<u64>,
    /// Intervals counted by the most spikes any one rank sent in them. The
    /// last bin collects everything at or above it. Empty unless enabled.
    #[serde(default)]
    pub max_histogram: Vec<u64>,
    /// Intervals in which this rank sent more spikes than its compressed
    /// send buffer is sized for.
    #[serde(default)]
    pub overflows: u64,
    pub max_buffer: usize,
}

/// Totals over a run, in the shape of the classic spanning report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanningStats {
    pub nsend: u64,
    pub nsendmax: u64,
    pub nrecv: u64,
    pub nrecv_useful: u64,
}

impl ExchangeStats {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            retry_histogram: vec![0; RETRY_HISTOGRAM_BINS],
            ..Self::default()
        }
    }

    /// Enables the max-spikes histogram with `bins` bins.
    pub fn with_max_histogram(mut self, bins: usize) -> Self {
        self.max_histogram = vec![0; bins];
        self
    }

    /// Counts one interval in which at most `max` spikes came from any rank.
    pub fn record_max(&mut self, max: usize) {
        if let Some(last) = self.max_histogram.len().checked_sub(1) {
            self.max_histogram[max.min(last)] += 1;
        }
    }

    /// The counters under the names used by the spanning view.
    pub fn spanning(&self) -> SpanningStats {
        SpanningStats {
            nsend: self.spikes_sent,
            nsendmax: self.max_sent,
            nrecv: self.spikes_received,
            nrecv_useful: self.spikes_useful,
        }
    }
}

/// The configured exchange method.
#[derive(Debug)]
pub enum SpikeExchange {
    Allgather(AllgatherExchange),
    Multisend(Multisend),
}

impl SpikeExchange {
    /// Creates the exchange. For multisend this builds the target lists, a
    /// collective step every rank must enter together.
    pub fn setup(
        comm: Arc<dyn Communicator>,
        config: &ExchangeConfig,
        dt: SimTime,
        registry: &mut SourceRegistry,
    ) -> NetResult<Self> {
        if let Some(n) = config.ignored_intervals() {
            if comm.rank() == 0 {
                tracing::warn!(intervals = n, "exchange.intervals is ignored by the allgather method");
            }
        }
        match config.method {
            ExchangeMethod::Allgather => {
                let ag = match config.compress {
                    Some(compression) => AllgatherExchange::compressed(comm, compression, dt, registry)?,
                    None => AllgatherExchange::new(comm),
                };
                Ok(SpikeExchange::Allgather(ag.with_max_histogram(config.max_histogram_bins)))
            }
            ExchangeMethod::Multisend => {
                let tables = TargetListBuilder::new(comm.as_ref())
                    .with_two_phase(config.two_phase)
                    .with_phase2_min_targets(config.phase2_min_targets)
                    .with_seed(config.relay_seed)
                    .build(registry)?;
                Ok(SpikeExchange::Multisend(Multisend::new(
                    comm,
                    tables,
                    config.intervals(),
                    config.two_phase,
                    config.max_conservation_retries,
                )))
            }
        }
    }

    /// Share of the min delay one exchange interval may span.
    pub fn interval_fraction(&self) -> f64 {
        match self {
            SpikeExchange::Multisend(ms) if ms.intervals() == 2 => 0.5,
            _ => 1.0,
        }
    }

    /// Rejects an exchange interval the method cannot encode.
    pub fn check_interval(&self, usable_min_delay: SimTime) -> NetResult<()> {
        match self {
            SpikeExchange::Allgather(ag) => ag.check_interval(usable_min_delay),
            SpikeExchange::Multisend(_) => Ok(()),
        }
    }

    /// Clears buffered spikes; called at initialization to time `t0`.
    pub fn reset(&self, t0: SimTime) {
        match self {
            SpikeExchange::Allgather(ag) => ag.reset(t0),
            SpikeExchange::Multisend(ms) => ms.reset(),
        }
    }

    /// Polls arrived spikes between boundaries (thread 0 only).
    pub fn advance(&self, env: &DeliveryEnv<'_>, thread0: &mut ThreadState) -> NetResult<usize> {
        match self {
            SpikeExchange::Allgather(_) => Ok(0),
            SpikeExchange::Multisend(ms) => ms.advance(env, thread0),
        }
    }

    /// Runs the exchange at a boundary.
    pub fn exchange(&self, env: &DeliveryEnv<'_>, thread0: &mut ThreadState) -> NetResult<ExchangeReport> {
        match self {
            SpikeExchange::Allgather(ag) => ag.exchange(env, thread0),
            SpikeExchange::Multisend(ms) => ms.exchange(env, thread0),
        }
    }

    pub fn stats(&self) -> ExchangeStats {
        match self {
            SpikeExchange::Allgather(ag) => ag.stats(),
            SpikeExchange::Multisend(ms) => ms.stats(),
        }
    }

    pub fn as_multisend(&self) -> Option<&Multisend> {
        match self {
            SpikeExchange::Multisend(ms) => Some(ms),
            _ => None,
        }
    }
}

impl SpikeOutput for SpikeExchange {
    fn output_spike(&self, source: &Source, t: SimTime) {
        match self {
            SpikeExchange::Allgather(ag) => ag.output_spike(source, t),
            SpikeExchange::Multisend(ms) => ms.output_spike(source, t),
        }
    }
}

/// Global minimum delay of edges crossing a rank or thread boundary,
/// capped at `max_delay`.
pub fn compute_min_delay(
    registry: &SourceRegistry,
    comm: &dyn Communicator,
    max_delay: SimTime,
) -> NetResult<SimTime> {
    let local = registry.min_exchange_delay().map_or(max_delay, |d| d.min(max_delay));
    comm.allreduce_min(local)
}

/// Length of one exchange interval.
///
/// The min delay is scaled by the method's interval fraction, and one `dt`
/// is held back when several threads exchange events through staging.
pub fn usable_min_delay(
    min_delay: SimTime,
    fraction: f64,
    nthreads: usize,
    dt: SimTime,
) -> NetResult<SimTime> {
    let mut usable = min_delay * fraction;
    if nthreads > 1 {
        usable -= dt;
    }
    if usable < dt - TIME_EPSILON {
        return Err(NetError::MinDelayTooSmall { usable, dt });
    }
    Ok(usable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_min_delay() {
        assert_eq!(usable_min_delay(1.0, 0.5, 1, 0.025).unwrap(), 0.5);
        assert!((usable_min_delay(1.0, 0.5, 4, 0.025).unwrap() - 0.475).abs() < 1e-12);
        assert!(matches!(
            usable_min_delay(0.04, 0.5, 1, 0.025),
            Err(NetError::MinDelayTooSmall { .. })
        ));
    }

    #[test]
    fn test_stats_histogram_sized() {
        let stats = ExchangeStats::new("multisend");
        assert_eq!(stats.retry_histogram.len(), RETRY_HISTOGRAM_BINS);
        assert!(stats.max_histogram.is_empty());
    }

    #[test]
    fn test_max_histogram_clamps_to_last_bin() {
        let mut stats = ExchangeStats::new("allgather").with_max_histogram(3);
        stats.record_max(0);
        stats.record_max(2);
        stats.record_max(40);
        assert_eq!(stats.max_histogram, vec![1, 0, 2]);

        let mut off = ExchangeStats::new("allgather");
        off.record_max(5);
        assert!(off.max_histogram.is_empty());
    }

    #[test]
    fn test_spanning_view() {
        let stats = ExchangeStats {
            spikes_sent: 7,
            max_sent: 3,
            spikes_received: 12,
            spikes_useful: 4,
            ..ExchangeStats::new("allgather")
        };
        assert_eq!(stats.spanning(), SpanningStats { nsend: 7, nsendmax: 3, nrecv: 12, nrecv_useful: 4 });
    }
}
