//! # netspike
//!
//! Event scheduling and distributed spike exchange for parallel network
//! simulations of spiking cells.
//!
//! ## Design Principles
//!
//! - **Per-thread event queues**: every simulation thread owns a timed queue
//!   of discrete events (edge deliveries, self events, watch checks,
//!   playback updates) and delivers them in time order.
//! - **Staging between threads**: events for another thread's targets go
//!   through that thread's lock-free staging lane and are drained at the
//!   start of each delivery window.
//! - **Targeted exchange between ranks**: each spike is sent only to the
//!   ranks that have a synapse for it. Even/odd buffers overlap
//!   communication with computation, and a global count check guarantees
//!   that no spike is still in flight when a buffer is consumed.
//! - **Min-delay windows**: ranks and threads only synchronize every
//!   usable min delay, the shortest delay of any edge crossing a boundary.
//!
//! ## Features
//!
//! - `parallel` - Step simulation threads in parallel using rayon (default)
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use netspike::cells::{EventRecorder, IntervalFire};
//! use netspike::comm::local::LocalCluster;
//! use netspike::config::SimConfigBuilder;
//! use netspike::{NullSolver, SimulationContext};
//!
//! let config = SimConfigBuilder::new().tstop(20.0).dt(0.025).build().unwrap();
//! let comm = LocalCluster::new(1).pop().unwrap();
//! let mut ctx = SimulationContext::new(config, Arc::new(comm)).unwrap();
//!
//! // A spike generator with gid 1 driving a recorder over a 2 ms edge
//! let stim = ctx.add_target(0, Box::new(IntervalFire::new(5.0, 3, 1.0))).unwrap();
//! ctx.register_artificial(1, stim).unwrap();
//! let recorder = EventRecorder::new();
//! let log = recorder.log();
//! let target = ctx.add_target(0, Box::new(recorder)).unwrap();
//! ctx.connect(1, target, 0.5, 2.0).unwrap();
//!
//! ctx.setup_exchange().unwrap();
//! ctx.finitialize(0.0).unwrap();
//! ctx.solve(20.0, &NullSolver).unwrap();
//!
//! assert_eq!(ctx.spikes().len(), 3);
//! assert_eq!(log.lock().len(), 3);
//! ```
//!
//! ## Several Ranks
//!
//! [`comm::local::LocalCluster`] runs one rank per OS thread inside the
//! process. Every rank builds its share of the network and calls the
//! collective steps together:
//!
//! ```rust,ignore
//! LocalCluster::run(4, |comm| {
//!     let mut ctx = SimulationContext::new(config.clone(), Arc::new(comm))?;
//!     build_my_cells(&mut ctx)?;
//!     ctx.setup_exchange()?;
//!     ctx.finitialize(0.0)?;
//!     ctx.solve(tstop, &NullSolver)
//! });
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod queue;
pub mod event;
pub mod target;
pub mod registry;
pub mod spikes;
pub mod thread;
pub mod scheduler;
pub mod comm;
pub mod target_list;
pub mod exchange;
pub mod context;
pub mod cells;
pub mod stats;

pub use comm::{Communicator, SpikeMessage};
pub use config::{ExchangeConfig, ExchangeMethod, SimConfig, SimConfigBuilder, SpikeCompression};
pub use context::{CellSolver, NullSolver, SimulationContext};
pub use error::{NetError, NetResult};
pub use event::{Event, EventKind, PlayRecord, SelfEvent, WatchCondition};
pub use exchange::{ExchangeReport, ExchangeStats, SpanningStats, SpikeExchange};
pub use queue::{QueueHandle, TimedQueue};
pub use registry::{EdgeSpec, GidStatus, SourceRegistry, SourceSpec, Threshold};
pub use scheduler::Scheduler;
pub use spikes::SpikeLog;
pub use stats::RunStats;
pub use target::{NetReceiveContext, PointProcess};
pub use target_list::{RankLists, TargetListBuilder};
pub use types::{Gid, SimTime, TargetRef};

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` takes precedence over `level`. Calling it again once a
/// subscriber is installed has no effect.
///
/// # Example
///
/// ```rust,ignore
/// netspike::init_logging(&config.simulation.log_level);
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
