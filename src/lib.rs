//! # rankmerge
//!
//! Rank coordination and result merging for distributed simulation runs.
//!
//! A run is executed identically by N ranks, each owning a disjoint set of
//! cells. This crate provides the pieces that keep those ranks in step and
//! turn their partial results into one dataset:
//!
//! - **Topology**: rank id and rank count, established once per run.
//! - **Seeding**: a stable 32-bit seed per (cell, logical seed), identical
//!   on every rank and every rerun.
//! - **Run loop**: drives an external engine to completion or in intervals
//!   with a callback, agreeing on the exchange step across ranks.
//! - **Timing**: named stopwatches recorded on rank 0 only.
//! - **Tag exchange**: every rank learns every cell's tags, so connections
//!   can refer to cells owned elsewhere.
//! - **Gather/merge**: per-rank records of different shapes merged on
//!   rank 0 under an explicit per-key policy.
//!
//! The numerical engine, the network builder, output formats and
//! interchange exporters are external; they plug in through the
//! [`SimEngine`], [`NetworkBuilder`], [`DataWriter`] and [`ModelExporter`]
//! traits.
//!
//! ## Features
//!
//! - `parallel` - Count merged connections with rayon
//!
//! ## Quick Start
//!
//! ```rust
//! use rankmerge::comm::run_ranks;
//! use rankmerge::gather::{merge_packages, RankPackage};
//! use rankmerge::records::{PartialRecord, RecordSchema, SPIKE_TIMES};
//! use rankmerge::{all_to_all, Communicator};
//!
//! // Three ranks each record one spike, then exchange their records
//! let merged = run_ranks(3, |comm| {
//!     let mut record = PartialRecord::new();
//!     record.push_spike(comm.rank() as f64, comm.rank() as u64).unwrap();
//!
//!     let package = RankPackage { cells: Vec::new(), records: record };
//!     let received = all_to_all(&comm, vec![package; comm.size()]).unwrap();
//!     merge_packages(&RecordSchema::new(), received).unwrap().1
//! })
//! .unwrap();
//!
//! let spikes = merged[0].get(SPIKE_TIMES).unwrap().as_flat().unwrap();
//! assert_eq!(spikes, &[0.0, 1.0, 2.0]);
//! ```
//!
//! ## Configuration-Driven Setup
//!
//! ```rust,ignore
//! use rankmerge::{LocalComm, SimConfig, Simulation};
//!
//! let config = SimConfig::from_yaml_file("run.yaml")?;
//! let mut sim = Simulation::initialize(LocalComm::new(), engine, config, std::env::args())?;
//! sim.build_network(&mut builder)?;
//! sim.setup_recording()?;
//! sim.simulate()?;
//! ```

pub mod types;
pub mod seed;
pub mod comm;
pub mod topology;
pub mod config;
pub mod context;
pub mod timing;
pub mod records;
pub mod network;
pub mod tags;
pub mod recording;
pub mod run;
pub mod gather;
pub mod export;
pub mod writer;
pub mod sim;

// Re-export commonly used types
pub use types::{entity_key, Gid, Rank, SimTime, StreamHandle};
pub use seed::{derive_seed, StreamSeed};
pub use comm::{all_to_all, run_ranks, CommError, Communicator, LocalComm, ThreadComm, ThreadWorld};
pub use topology::{init_topology, RankContext, TopologyError};
pub use config::{CellSelector, ConfigError, SimConfig, SimConfigBuilder, TraceSpec};
pub use context::RunContext;
pub use timing::{TimingData, TimingMode, TimingRegistry};
pub use records::{KeyPolicy, PartialRecord, RecordError, RecordSchema, RecordShape, RecordValue};
pub use network::{Cell, Connection, NetworkBuilder, Stim, Tags};
pub use tags::{gather_cell_tags, resolve_populations, CellTags};
pub use recording::{setup_recording, RecordingSetup};
pub use run::{EngineError, RunController, RunError, RunReport, RunState, SimEngine};
pub use gather::{gather_data, merge_packages, AggregatedDataset, GatherError, RankPackage, RunSummary};
pub use export::{ExportError, ExportModel, ModelExporter};
pub use writer::{DataWriter, JsonFileWriter, SaveBundle, WriteError};
pub use sim::{SimError, Simulation};

/// Initialize the tracing subscriber for logging.
///
/// Call this at the start of your program to enable logging. `RUST_LOG`
/// takes precedence over `level`.
///
/// # Example
///
/// ```rust,ignore
/// rankmerge::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
