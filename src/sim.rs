//! The per-rank simulation facade.
//!
//! [`Simulation`] strings the phases of a run together in the order every
//! rank executes them:
//!
//! ```text
//! initialize -> build_network -> [gather_cell_tags] -> setup_recording
//!            -> run | run_with_interval -> gather_data -> save_data -> finish
//! ```
//!
//! Methods that perform collectives (`gather_cell_tags`, the run methods,
//! `gather_data`, `simulate`) must be called by every rank in the same
//! order. `save_data` and `export_model` only do work on rank 0.

use std::error::Error as StdError;
use std::path::PathBuf;
use thiserror::Error;

use crate::comm::{CommError, Communicator};
use crate::config::{ConfigError, SimConfig};
use crate::context::RunContext;
use crate::export::{ExportError, ExportModel, ModelExporter};
use crate::gather::{gather_data, AggregatedDataset, GatherError};
use crate::network::{Cell, NetworkBuilder};
use crate::recording::{setup_recording, RecordingSetup};
use crate::records::PartialRecord;
use crate::run::{EngineError, RunController, RunError, RunReport, RunState, SimEngine};
use crate::tags::{gather_cell_tags, CellTags, TagError};
use crate::timing::{TimingData, TimingError, TimingRegistry, INITIAL_TIME, SAVE_TIME, TOTAL_TIME};
use crate::topology::{init_topology, TopologyError};
use crate::types::SimTime;
use crate::writer::{DataWriter, SaveBundle};

type BoxError = Box<dyn StdError + Send + Sync>;

/// Any failure of a simulation phase.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("communication error: {0}")]
    Comm(#[from] CommError),

    #[error("timing error: {0}")]
    Timing(#[from] TimingError),

    #[error("run error: {0}")]
    Run(#[from] RunError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("tag exchange error: {0}")]
    Tags(#[from] TagError),

    #[error("gather error: {0}")]
    Gather(#[from] GatherError),

    #[error("export error: {0}")]
    Export(#[from] ExportError),

    #[error("network builder error: {0}")]
    Network(#[source] BoxError),

    #[error("data writer error: {0}")]
    Write(#[source] BoxError),

    #[error("model exporter error: {0}")]
    Exporter(#[source] BoxError),
}

/// One rank's view of a distributed simulation run.
pub struct Simulation<C, E> {
    comm: C,
    ctx: RunContext,
    controller: RunController<E>,
    timing: TimingRegistry,
    cells: Vec<Cell>,
    all_tags: Option<CellTags>,
    recording: RecordingSetup,
    records: PartialRecord,
    dataset: Option<AggregatedDataset>,
    last_run: Option<RunReport>,
}

impl<C: Communicator, E: SimEngine> Simulation<C, E> {
    /// Establishes topology, applies `key=value` overrides from `args` and
    /// configures the engine.
    ///
    /// Configuration errors surface here, before any collective.
    pub fn initialize<I, S>(comm: C, engine: E, mut config: SimConfig, args: I) -> Result<Self, SimError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topology = init_topology(&comm)?;
        let applied = config.apply_overrides(args)?;

        let mut timing = TimingRegistry::new(&topology, config.timing);
        timing.start(INITIAL_TIME)?;
        timing.start(TOTAL_TIME)?;

        if topology.is_root() {
            for (key, value) in &applied {
                tracing::info!("Setting {} = {} (from commandline)", key, value);
            }
            tracing::info!(
                ranks = topology.host_count(),
                duration_ms = config.duration,
                dt_ms = config.dt,
                "Simulation initialized"
            );
        }

        let ctx = RunContext::new(topology, config)?;
        let mut controller = RunController::new(engine);
        controller.configure(&ctx)?;

        timing.stop(INITIAL_TIME)?;

        Ok(Self {
            comm,
            ctx,
            controller,
            timing,
            cells: Vec::new(),
            all_tags: None,
            recording: RecordingSetup::default(),
            records: PartialRecord::new(),
            dataset: None,
            last_run: None,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn engine(&self) -> &E {
        self.controller.engine()
    }

    pub fn engine_mut(&mut self) -> &mut E {
        self.controller.engine_mut()
    }

    pub fn run_state(&self) -> RunState {
        self.controller.state()
    }

    pub fn timing(&self) -> &TimingRegistry {
        &self.timing
    }

    /// Locally owned cells.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Tags of every cell in the run, once exchanged.
    pub fn all_tags(&self) -> Option<&CellTags> {
        self.all_tags.as_ref()
    }

    pub fn recording(&self) -> &RecordingSetup {
        &self.recording
    }

    /// This rank's records of the last run.
    pub fn records(&self) -> &PartialRecord {
        &self.records
    }

    /// Mutable access for recording hooks outside the engine.
    pub fn records_mut(&mut self) -> &mut PartialRecord {
        &mut self.records
    }

    /// The merged dataset; present on rank 0 after [`gather_data`](Self::gather_data).
    pub fn dataset(&self) -> Option<&AggregatedDataset> {
        self.dataset.as_ref()
    }

    pub fn last_run(&self) -> Option<&RunReport> {
        self.last_run.as_ref()
    }

    /// Builds this rank's cells.
    pub fn build_network<B: NetworkBuilder>(&mut self, builder: &mut B) -> Result<&[Cell], SimError> {
        self.cells = builder
            .build(&self.ctx)
            .map_err(|e| SimError::Network(Box::new(e)))?;
        tracing::debug!(rank = self.ctx.topology().rank(), cells = self.cells.len(), "network built");
        Ok(&self.cells)
    }

    /// Exchanges cell tags with every rank. Collective.
    pub fn gather_cell_tags(&mut self) -> Result<&CellTags, SimError> {
        let tags = gather_cell_tags(&self.comm, &self.cells)?;
        Ok(&*self.all_tags.insert(tags))
    }

    /// Prepares record keys and traced cells.
    pub fn setup_recording(&mut self) -> Result<&RecordingSetup, SimError> {
        self.recording = setup_recording(&self.ctx, &self.cells, self.all_tags.as_ref(), &mut self.timing)?;
        self.records = self.recording.record.clone();
        Ok(&self.recording)
    }

    /// Runs the full duration. Collective.
    pub fn run(&mut self) -> Result<RunReport, SimError> {
        self.records = self.recording.record.clone();
        let report = self
            .controller
            .run_full(&self.ctx, &self.comm, &mut self.timing, &self.cells)?;
        self.after_run(report)
    }

    /// Runs in steps of at most `interval`, calling `callback` after each. Collective.
    pub fn run_with_interval<F>(&mut self, interval: SimTime, callback: F) -> Result<RunReport, SimError>
    where
        F: FnMut(SimTime),
    {
        self.records = self.recording.record.clone();
        let report = self.controller.run_with_interval(
            &self.ctx,
            &self.comm,
            &mut self.timing,
            &self.cells,
            interval,
            callback,
        )?;
        self.after_run(report)
    }

    fn after_run(&mut self, report: RunReport) -> Result<RunReport, SimError> {
        self.controller
            .engine_mut()
            .flush_records(&self.recording.traced, &mut self.records)?;
        self.last_run = Some(report);
        Ok(report)
    }

    /// Gathers and merges every rank's results onto rank 0. Collective.
    pub fn gather_data(&mut self) -> Result<Option<&AggregatedDataset>, SimError> {
        self.dataset = gather_data(&self.ctx, &self.comm, &mut self.timing, &self.cells, &self.records)?;
        Ok(self.dataset.as_ref())
    }

    /// Runs the full duration, then gathers. Collective.
    pub fn simulate(&mut self) -> Result<Option<&AggregatedDataset>, SimError> {
        self.run()?;
        self.gather_data()
    }

    /// Hands the merged dataset to `writer` on rank 0; a no-op elsewhere or
    /// before gathering. Returns the files written.
    pub fn save_data<W: DataWriter>(&mut self, writer: &mut W) -> Result<Vec<PathBuf>, SimError> {
        let Some(dataset) = self.dataset.as_ref() else {
            return Ok(Vec::new());
        };
        let config = self.ctx.config();

        self.timing.start(SAVE_TIME)?;
        let mut written = writer
            .write_data(&SaveBundle::new(config, dataset))
            .map_err(|e| SimError::Write(Box::new(e)))?;
        self.timing.stop(SAVE_TIME)?;

        if self.timing.is_active() && config.save_timing {
            let timing_files = writer
                .write_timing(config, &self.timing.snapshot())
                .map_err(|e| SimError::Write(Box::new(e)))?;
            written.extend(timing_files);
        }

        Ok(written)
    }

    /// Builds the export view of the merged network on rank 0.
    ///
    /// Gids resolve against the exchanged tags when
    /// [`gather_cell_tags`](Self::gather_cell_tags) ran, otherwise against
    /// the tags of the gathered cells.
    pub fn export_model(&self) -> Result<Option<ExportModel>, SimError> {
        let Some(dataset) = self.dataset.as_ref() else {
            return Ok(None);
        };
        let model = match self.all_tags.as_ref() {
            Some(tags) => ExportModel::build(&dataset.cells, tags)?,
            None => {
                let tags: CellTags = dataset.cells.iter().map(|c| (c.gid, c.tags.clone())).collect();
                ExportModel::build(&dataset.cells, &tags)?
            }
        };
        Ok(Some(model))
    }

    /// Builds the export view and passes it to `exporter`. Returns false
    /// when there was nothing to export on this rank.
    pub fn export_with<X: ModelExporter>(&self, exporter: &mut X) -> Result<bool, SimError> {
        match self.export_model()? {
            Some(model) => {
                exporter.export(&model).map_err(|e| SimError::Exporter(Box::new(e)))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stops the whole-run stopwatch and returns the completed timings.
    pub fn finish(&mut self) -> Result<TimingData, SimError> {
        if let Some(secs) = self.timing.stop(TOTAL_TIME)? {
            tracing::info!("Total time = {:.2} s", secs);
        }
        Ok(self.timing.snapshot())
    }
}
