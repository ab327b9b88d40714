//! Statistics collection and export for simulation runs.
//!
//! [`RunStats`] is assembled by
//! [`SimulationContext::solve`](crate::context::SimulationContext::solve)
//! from the per-thread delivery counters and the exchange counters, and can
//! be exported as JSON, CSV or a plain-text summary.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::exchange::ExchangeStats;
use crate::thread::ThreadStats;
use crate::types::{Rank, SimTime};

/// Aggregate statistics for one `solve` call on one rank.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Run metadata
    pub metadata: RunMetadata,

    /// Driver-level counters
    pub run: DriverStats,

    /// Per-thread delivery counters, indexed by thread
    pub threads: Vec<ThreadStats>,

    /// Exchange counters (absent on single-rank runs)
    pub exchange: Option<ExchangeStats>,

    /// Timing statistics
    pub timing: TimingStats,
}

/// Metadata about the run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Crate version
    pub version: String,

    /// Rank this record belongs to
    pub rank: Rank,

    /// Number of ranks
    pub nranks: usize,

    /// Number of simulation threads on this rank
    pub nthreads: usize,

    /// Start time (wall clock)
    pub start_time: Option<String>,

    /// End time (wall clock)
    pub end_time: Option<String>,
}

/// Driver-level counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DriverStats {
    /// Simulation time reached
    pub final_time: SimTime,

    /// Integration steps per thread
    pub steps: u64,

    /// Exchange boundaries crossed
    pub exchanges: u64,

    /// Global minimum delay over boundary-crossing edges
    pub min_delay: SimTime,

    /// Span of one exchange interval
    pub usable_min_delay: SimTime,

    /// Spikes fired on this rank
    pub spikes: u64,
}

/// Timing/performance statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimingStats {
    /// Total wall-clock time in milliseconds
    pub total_wall_time_ms: f64,

    /// Simulation time per wall-clock second
    pub sim_time_per_second: f64,

    /// Events delivered per second
    pub events_per_second: f64,
}

impl RunStats {
    /// Creates a new empty statistics container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start time.
    pub fn record_start(&mut self) {
        self.metadata.start_time = Some(timestamp_now());
    }

    /// Records the end time.
    pub fn record_end(&mut self) {
        self.metadata.end_time = Some(timestamp_now());
    }

    /// Events delivered across all threads.
    pub fn events_delivered(&self) -> u64 {
        self.threads.iter().map(ThreadStats::delivered).sum()
    }

    /// Updates timing statistics from the wall-clock time of the run.
    ///
    /// `sim_span` is the simulated time covered by the run.
    pub fn compute_timing(&mut self, wall_time_ms: f64, sim_span: SimTime) {
        self.timing.total_wall_time_ms = wall_time_ms;

        if wall_time_ms > 0.0 {
            let seconds = wall_time_ms / 1000.0;
            self.timing.sim_time_per_second = sim_span / seconds;
            self.timing.events_per_second = self.events_delivered() as f64 / seconds;
        }
    }

    /// Exports statistics to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Exports statistics to JSON file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Exports summary statistics to CSV.
    pub fn to_csv(&self) -> String {
        let mut csv = String::new();

        csv.push_str("metric,value\n");

        csv.push_str(&format!("rank,{}\n", self.metadata.rank));
        csv.push_str(&format!("final_time,{}\n", self.run.final_time));
        csv.push_str(&format!("steps,{}\n", self.run.steps));
        csv.push_str(&format!("exchanges,{}\n", self.run.exchanges));
        csv.push_str(&format!("min_delay,{}\n", self.run.min_delay));
        csv.push_str(&format!("usable_min_delay,{}\n", self.run.usable_min_delay));
        csv.push_str(&format!("spikes,{}\n", self.run.spikes));
        csv.push_str(&format!("events_delivered,{}\n", self.events_delivered()));

        if let Some(ex) = &self.exchange {
            csv.push_str(&format!("exchange_method,{}\n", ex.method));
            csv.push_str(&format!("spikes_sent,{}\n", ex.spikes_sent));
            csv.push_str(&format!("spikes_received,{}\n", ex.spikes_received));
            csv.push_str(&format!("spikes_useful,{}\n", ex.spikes_useful));
            csv.push_str(&format!("max_sent,{}\n", ex.max_sent));
            csv.push_str(&format!("relayed,{}\n", ex.relayed));
            csv.push_str(&format!("conservation_retries,{}\n", ex.conservation_retries));
        }

        csv.push_str(&format!("wall_time_ms,{:.2}\n", self.timing.total_wall_time_ms));
        csv.push_str(&format!("sim_time_per_second,{:.2}\n", self.timing.sim_time_per_second));
        csv.push_str(&format!("events_per_second,{:.2}\n", self.timing.events_per_second));

        csv
    }

    /// Exports summary statistics to CSV file.
    pub fn to_csv_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, self.to_csv())
    }

    /// Exports per-thread counters to CSV.
    pub fn threads_to_csv(&self) -> String {
        let mut csv = String::new();

        csv.push_str("thread,steps,edge_events,self_events,watch_events,playback_events,staged_in,staged_out,spikes_fired\n");

        for (id, t) in self.threads.iter().enumerate() {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{},{},{}\n",
                id,
                t.steps,
                t.edge_events,
                t.self_events,
                t.watch_events,
                t.playback_events,
                t.staged_in,
                t.staged_out,
                t.spikes_fired,
            ));
        }

        csv
    }

    /// Writes a human-readable summary to a writer.
    pub fn write_summary<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        writeln!(w, "=== Run Statistics (rank {}/{}) ===", self.metadata.rank, self.metadata.nranks)?;
        writeln!(w)?;

        if let Some(ref start) = self.metadata.start_time {
            writeln!(w, "Started: {}", start)?;
        }
        if let Some(ref end) = self.metadata.end_time {
            writeln!(w, "Ended: {}", end)?;
        }
        writeln!(w)?;

        writeln!(w, "--- Driver ---")?;
        writeln!(w, "Final simulation time: {}", self.run.final_time)?;
        writeln!(w, "Steps: {}", self.run.steps)?;
        writeln!(w, "Exchanges: {}", self.run.exchanges)?;
        writeln!(w, "Min delay: {} (usable {})", self.run.min_delay, self.run.usable_min_delay)?;
        writeln!(w, "Spikes: {}", self.run.spikes)?;
        writeln!(w, "Events delivered: {}", self.events_delivered())?;
        writeln!(w)?;

        if let Some(ex) = &self.exchange {
            writeln!(w, "--- Exchange ({}) ---", ex.method)?;
            writeln!(w, "Sent: {}, Received: {}, Relayed: {}", ex.spikes_sent, ex.spikes_received, ex.relayed)?;
            writeln!(w, "Conservation retries: {}", ex.conservation_retries)?;
            writeln!(w, "Useful: {}, Max sent per interval: {}", ex.spikes_useful, ex.max_sent)?;
            writeln!(w, "Retry histogram: {:?}", ex.retry_histogram)?;
            if !ex.max_histogram.is_empty() {
                writeln!(w, "Max histogram: {:?}", ex.max_histogram)?;
            }
            if ex.overflows > 0 {
                writeln!(w, "Compressed buffer overflows: {}", ex.overflows)?;
            }
            writeln!(w, "Max buffer: {}", ex.max_buffer)?;
            writeln!(w)?;
        }

        writeln!(w, "--- Timing ---")?;
        writeln!(w, "Wall time: {:.2} ms", self.timing.total_wall_time_ms)?;
        writeln!(w, "Sim time/sec: {:.2}", self.timing.sim_time_per_second)?;
        writeln!(w, "Events/sec: {:.2}", self.timing.events_per_second)?;
        writeln!(w)?;

        writeln!(w, "--- Threads ---")?;
        for (id, t) in self.threads.iter().enumerate() {
            writeln!(w, "Thread {}: {} events, {} spikes", id, t.delivered(), t.spikes_fired)?;
            writeln!(w, "  Staged in: {}, out: {}", t.staged_in, t.staged_out)?;
        }

        Ok(())
    }

    /// Returns a summary string.
    pub fn summary(&self) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.write_summary(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// A simple timer for measuring wall-clock time.
#[derive(Debug)]
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    /// Starts a new timer.
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Returns elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

fn timestamp_now() -> String {
    let now = std::time::SystemTime::now();
    let duration = now.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    format!("{}s", duration.as_secs())
}
