//! Configuration for simulation runs.
//!
//! Run parameters and the spike exchange setup can be given as YAML or
//! JSON. The network itself is built through the
//! [`SimulationContext`](crate::context::SimulationContext) API, not from
//! the config file.
//!
//! # Configuration File Structure
//!
//! ```yaml
//! simulation:
//!   tstop: 100.0
//!   dt: 0.025
//!   nthreads: 4
//!   max_delay: 10.0
//!   use_bin_queue: false
//!   log_level: info
//!   spike_output: out.dat
//!
//! exchange:
//!   method: multisend
//!   intervals: 2
//!   two_phase: true
//!   phase2_min_targets: 4
//!   max_conservation_retries: 100000
//!   relay_seed: 0
//!   max_histogram_bins: 0
//! ```
//!
//! The allgather method can pack spikes into a compact byte form:
//!
//! ```yaml
//! exchange:
//!   method: allgather
//!   compress:
//!     nspike: 32
//!     gid_compress: true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::target_list::DEFAULT_PHASE2_MIN_TARGETS;
use crate::types::SimTime;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Global simulation parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Simulation end time (ms)
    #[serde(default = "default_tstop")]
    pub tstop: SimTime,

    /// Fixed integration step (ms)
    #[serde(default = "default_dt")]
    pub dt: SimTime,

    /// Number of simulation threads per rank
    #[serde(default = "default_nthreads")]
    pub nthreads: usize,

    /// Upper bound for the exchange interval when no edge crosses a boundary
    #[serde(default = "default_max_delay")]
    pub max_delay: SimTime,

    /// Bucket edge deliveries per time step instead of queueing them
    #[serde(default)]
    pub use_bin_queue: bool,

    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// File the sorted output spikes are written to after a run
    #[serde(default)]
    pub spike_output: Option<String>,
}

fn default_tstop() -> SimTime {
    100.0
}

fn default_dt() -> SimTime {
    0.025
}

fn default_nthreads() -> usize {
    1
}

fn default_max_delay() -> SimTime {
    10.0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            tstop: default_tstop(),
            dt: default_dt(),
            nthreads: default_nthreads(),
            max_delay: default_max_delay(),
            use_bin_queue: false,
            log_level: default_log_level(),
            spike_output: None,
        }
    }
}

/// How spikes move between ranks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeMethod {
    /// Every rank receives every spike.
    Allgather,
    /// Spikes go only to ranks that have targets for them.
    #[default]
    Multisend,
}

/// Spike exchange parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub method: ExchangeMethod,

    /// 2 overlaps communication with the following interval, 1 does not.
    /// Unset means 2; see [`ExchangeConfig::intervals`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervals: Option<usize>,

    /// Relay long target lists through intermediate ranks
    #[serde(default)]
    pub two_phase: bool,

    /// Minimum target list length that is split into relay groups
    #[serde(default = "default_phase2_min_targets")]
    pub phase2_min_targets: usize,

    /// Give up after this many conservation retries (unbounded if absent)
    #[serde(default)]
    pub max_conservation_retries: Option<u32>,

    /// Seed of relay selection
    #[serde(default)]
    pub relay_seed: u64,

    /// Compact allgather encoding (allgather only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<SpikeCompression>,

    /// Bins of the per-interval max-spikes histogram (0 disables it)
    #[serde(default)]
    pub max_histogram_bins: usize,
}

const DEFAULT_INTERVALS: usize = 2;

/// Compact spike encoding for the allgather method.
///
/// Spike times travel as one byte counting steps of `dt` since the previous
/// exchange, so the exchange interval must span at most 255 steps. Gids
/// travel as four bytes, or as a one-byte index into the sender's output
/// gids when `gid_compress` is set and no rank has more than 256 of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpikeCompression {
    /// Spikes per rank and interval the send buffer is sized for
    pub nspike: usize,

    #[serde(default)]
    pub gid_compress: bool,
}

fn default_phase2_min_targets() -> usize {
    DEFAULT_PHASE2_MIN_TARGETS
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            method: ExchangeMethod::default(),
            intervals: None,
            two_phase: false,
            phase2_min_targets: default_phase2_min_targets(),
            max_conservation_retries: None,
            relay_seed: 0,
            compress: None,
            max_histogram_bins: 0,
        }
    }
}

impl ExchangeConfig {
    /// Exchange intervals per min delay, 2 unless set.
    pub fn intervals(&self) -> usize {
        self.intervals.unwrap_or(DEFAULT_INTERVALS)
    }

    /// An explicitly requested interval count the method has no use for.
    pub fn ignored_intervals(&self) -> Option<usize> {
        match (self.method, self.intervals) {
            (ExchangeMethod::Allgather, Some(n)) if n != 1 => Some(n),
            _ => None,
        }
    }

    /// Validates the exchange configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        let intervals = self.intervals();
        if !(1..=2).contains(&intervals) {
            return Err(ConfigError::Validation(format!(
                "exchange.intervals must be 1 or 2, got {intervals}"
            )));
        }
        if self.phase2_min_targets < 4 {
            return Err(ConfigError::Validation(format!(
                "exchange.phase2_min_targets must be at least 4, got {}",
                self.phase2_min_targets
            )));
        }
        if self.method == ExchangeMethod::Allgather {
            if self.two_phase {
                return Err(ConfigError::Validation(
                    "exchange.two_phase requires the multisend method".to_string(),
                ));
            }
        }
        if self.max_histogram_bins > 0 && self.method != ExchangeMethod::Allgather {
            return Err(ConfigError::Validation(
                "exchange.max_histogram_bins requires the allgather method".to_string(),
            ));
        }
        if let Some(compress) = &self.compress {
            if self.method != ExchangeMethod::Allgather {
                return Err(ConfigError::Validation(
                    "exchange.compress requires the allgather method".to_string(),
                ));
            }
            if compress.nspike == 0 {
                return Err(ConfigError::Validation(
                    "exchange.compress.nspike must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Complete simulation configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Global simulation parameters
    #[serde(default)]
    pub simulation: SimulationParams,

    /// Spike exchange parameters
    #[serde(default)]
    pub exchange: ExchangeConfig,
}

impl SimConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: SimConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file, auto-detecting format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "json" => Self::from_json_file(path),
            _ => Err(ConfigError::UnknownFormat(ext.to_string())),
        }
    }

    /// Validates the entire configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        let sim = &self.simulation;
        if !(sim.dt > 0.0) {
            return Err(ConfigError::Validation(format!("simulation.dt must be positive, got {}", sim.dt)));
        }
        if !(sim.tstop >= 0.0) {
            return Err(ConfigError::Validation(format!(
                "simulation.tstop must be non-negative, got {}",
                sim.tstop
            )));
        }
        if sim.nthreads == 0 {
            return Err(ConfigError::Validation("simulation.nthreads must be at least 1".to_string()));
        }
        if !(sim.max_delay >= sim.dt) {
            return Err(ConfigError::Validation(format!(
                "simulation.max_delay ({}) must be at least dt ({})",
                sim.max_delay, sim.dt
            )));
        }
        self.exchange.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Saves configuration to a JSON file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Converts to YAML string.
    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Converts to JSON string.
    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Builder for creating SimConfig programmatically.
#[derive(Default)]
pub struct SimConfigBuilder {
    config: SimConfig,
}

impl SimConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the simulation end time.
    pub fn tstop(mut self, tstop: SimTime) -> Self {
        self.config.simulation.tstop = tstop;
        self
    }

    /// Sets the integration step.
    pub fn dt(mut self, dt: SimTime) -> Self {
        self.config.simulation.dt = dt;
        self
    }

    /// Sets the number of simulation threads.
    pub fn nthreads(mut self, nthreads: usize) -> Self {
        self.config.simulation.nthreads = nthreads;
        self
    }

    /// Sets the exchange interval cap.
    pub fn max_delay(mut self, max_delay: SimTime) -> Self {
        self.config.simulation.max_delay = max_delay;
        self
    }

    /// Enables the fixed-step bin queue.
    pub fn use_bin_queue(mut self, enable: bool) -> Self {
        self.config.simulation.use_bin_queue = enable;
        self
    }

    /// Sets the log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.simulation.log_level = level.into();
        self
    }

    /// Writes sorted spikes to `path` after each run.
    pub fn spike_output(mut self, path: impl Into<String>) -> Self {
        self.config.simulation.spike_output = Some(path.into());
        self
    }

    /// Selects the exchange method.
    pub fn method(mut self, method: ExchangeMethod) -> Self {
        self.config.exchange.method = method;
        self
    }

    /// Sets the number of exchange intervals per min delay.
    pub fn intervals(mut self, intervals: usize) -> Self {
        self.config.exchange.intervals = Some(intervals);
        self
    }

    /// Enables two-phase relays.
    pub fn two_phase(mut self, enable: bool) -> Self {
        self.config.exchange.two_phase = enable;
        self
    }

    /// Sets the list length from which relays are used.
    pub fn phase2_min_targets(mut self, min: usize) -> Self {
        self.config.exchange.phase2_min_targets = min;
        self
    }

    /// Bounds the conservation retry loop.
    pub fn max_conservation_retries(mut self, retries: u32) -> Self {
        self.config.exchange.max_conservation_retries = Some(retries);
        self
    }

    /// Seeds relay selection.
    pub fn relay_seed(mut self, seed: u64) -> Self {
        self.config.exchange.relay_seed = seed;
        self
    }

    /// Packs allgather spikes, sizing the send buffer for `nspike` spikes.
    pub fn compress(mut self, nspike: usize, gid_compress: bool) -> Self {
        self.config.exchange.compress = Some(SpikeCompression { nspike, gid_compress });
        self
    }

    /// Keeps a histogram of the most spikes any rank sent in one interval.
    pub fn max_histogram(mut self, bins: usize) -> Self {
        self.config.exchange.max_histogram_bins = bins;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> ConfigResult<SimConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SimConfig::new();
        assert_eq!(config.simulation.tstop, 100.0);
        assert_eq!(config.simulation.dt, 0.025);
        assert_eq!(config.simulation.nthreads, 1);
        assert_eq!(config.exchange.method, ExchangeMethod::Multisend);
        assert_eq!(config.exchange.intervals, None);
        assert_eq!(config.exchange.intervals(), 2);
        assert!(config.exchange.max_conservation_retries.is_none());
        assert!(config.exchange.compress.is_none());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
simulation:
  tstop: 50.0
  dt: 0.1
  nthreads: 4
  log_level: debug

exchange:
  method: multisend
  two_phase: true
  max_conservation_retries: 500
  relay_seed: 9
"#;

        let config = SimConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.simulation.tstop, 50.0);
        assert_eq!(config.simulation.nthreads, 4);
        assert!(config.exchange.two_phase);
        assert_eq!(config.exchange.max_conservation_retries, Some(500));
        assert_eq!(config.exchange.relay_seed, 9);
        assert_eq!(config.exchange.phase2_min_targets, 4);
    }

    #[test]
    fn test_json_parsing() {
        let json = r#"{
            "simulation": { "tstop": 10.0, "dt": 0.05 },
            "exchange": { "method": "allgather", "intervals": 1 }
        }"#;

        let config = SimConfig::from_json(json).unwrap();
        assert_eq!(config.simulation.tstop, 10.0);
        assert_eq!(config.exchange.method, ExchangeMethod::Allgather);
    }

    #[test]
    fn test_builder() {
        let config = SimConfigBuilder::new()
            .tstop(20.0)
            .dt(0.05)
            .nthreads(2)
            .two_phase(true)
            .max_conservation_retries(10)
            .build()
            .unwrap();

        assert_eq!(config.simulation.tstop, 20.0);
        assert_eq!(config.simulation.nthreads, 2);
        assert_eq!(config.exchange.max_conservation_retries, Some(10));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(SimConfigBuilder::new().dt(0.0).build().is_err());
        assert!(SimConfigBuilder::new().nthreads(0).build().is_err());
        assert!(SimConfigBuilder::new().intervals(3).build().is_err());
        assert!(SimConfigBuilder::new()
            .method(ExchangeMethod::Allgather)
            .two_phase(true)
            .build()
            .is_err());
        assert!(SimConfigBuilder::new().phase2_min_targets(2).build().is_err());
        assert!(SimConfigBuilder::new().compress(8, false).build().is_err());
        assert!(SimConfigBuilder::new()
            .method(ExchangeMethod::Allgather)
            .compress(0, false)
            .build()
            .is_err());
        assert!(SimConfigBuilder::new().max_histogram(5).build().is_err());
    }

    #[test]
    fn test_allgather_intervals_only_flagged_when_set() {
        let unset = SimConfigBuilder::new().method(ExchangeMethod::Allgather).build().unwrap();
        assert_eq!(unset.exchange.ignored_intervals(), None);

        let set = SimConfigBuilder::new().method(ExchangeMethod::Allgather).intervals(2).build().unwrap();
        assert_eq!(set.exchange.ignored_intervals(), Some(2));

        let one = SimConfigBuilder::new().method(ExchangeMethod::Allgather).intervals(1).build().unwrap();
        assert_eq!(one.exchange.ignored_intervals(), None);

        let multisend = SimConfigBuilder::new().intervals(2).build().unwrap();
        assert_eq!(multisend.exchange.ignored_intervals(), None);
    }

    #[test]
    fn test_compression_yaml() {
        let yaml = r#"
exchange:
  method: allgather
  compress:
    nspike: 16
    gid_compress: true
  max_histogram_bins: 10
"#;
        let config = SimConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.exchange.compress, Some(SpikeCompression { nspike: 16, gid_compress: true }));
        assert_eq!(config.exchange.max_histogram_bins, 10);
        assert_eq!(config.exchange.intervals, None);
    }

    #[test]
    fn test_unknown_extension() {
        let result = SimConfig::from_file("config.toml");
        assert!(matches!(result, Err(ConfigError::UnknownFormat(ext)) if ext == "toml"));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = SimConfigBuilder::new().tstop(5.0).relay_seed(3).build().unwrap();
        let yaml = config.to_yaml().unwrap();
        let restored = SimConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config, restored);
    }
}
