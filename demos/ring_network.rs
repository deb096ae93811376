//! Ring network demo.
//!
//! Runs a small ring of cells, split round-robin over in-process ranks,
//! through the full pipeline and writes the merged output as JSON.
//!
//! Usage:
//!
//! ```text
//! RANKS=4 cargo run --example ring_network -- duration=2000 seeds.stim=7 log_level=debug
//! ```

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::process::ExitCode;

use rankmerge::network::{CELL_MODEL, POP_LABEL};
use rankmerge::{
    init_logging, run_ranks, Cell, CellSelector, Communicator, ConfigError, Connection, EngineError, Gid,
    JsonFileWriter, NetworkBuilder, PartialRecord, RunContext, SimConfig, SimConfigBuilder, SimEngine, SimError,
    SimTime, Simulation, Stim, StreamHandle, TraceSpec,
};

const NUM_CELLS: u64 = 20;
const RATE_HZ: f64 = 10.0;

/// Builds a ring: cell `g` receives from `g - 1`, and every cell gets one
/// background stim whose stream handle is its gid.
struct RingBuilder;

impl NetworkBuilder for RingBuilder {
    type Error = Infallible;

    fn build(&mut self, ctx: &RunContext) -> Result<Vec<Cell>, Infallible> {
        let topology = ctx.topology();
        let cells = (0..NUM_CELLS)
            .filter(|gid| *gid as usize % topology.host_count() == topology.rank())
            .map(|gid| {
                let mut cell = Cell::new(gid)
                    .with_tag(POP_LABEL, if gid < NUM_CELLS / 2 { "PYR" } else { "BAS" })
                    .with_tag(CELL_MODEL, "HH");
                cell.conns.push(Connection {
                    pre_gid: (gid + NUM_CELLS - 1) % NUM_CELLS,
                    syn_mech: "AMPA".to_string(),
                    weight: 0.005,
                    delay: 5.0,
                    loc: 0.5,
                    sec: "soma".to_string(),
                    threshold: 10.0,
                });
                cell.stims.push(Stim {
                    source: "background".to_string(),
                    rate: RATE_HZ,
                    noise: 1.0,
                    syn_mech: "AMPA".to_string(),
                    weight: 0.01,
                    delay: 1.0,
                    threshold: 10.0,
                    sec: "soma".to_string(),
                    loc: 0.5,
                    seed: None,
                    stream: Some(gid),
                });
                cell
            })
            .collect();
        Ok(cells)
    }
}

/// Stand-in engine: each stim stream is a xorshift generator producing
/// exponentially distributed spike intervals, and every stim spike makes
/// its cell fire one delay later.
#[derive(Default)]
struct ToyEngine {
    t: SimTime,
    dt: SimTime,
    streams: BTreeMap<StreamHandle, (Gid, u64)>,
    spikes: Vec<(SimTime, Gid)>,
}

impl ToyEngine {
    fn next_interval(state: &mut u64) -> SimTime {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        let uniform = (*state >> 11) as f64 / (1u64 << 53) as f64;
        -(1.0 - uniform).ln() * 1000.0 / RATE_HZ
    }
}

impl SimEngine for ToyEngine {
    fn set_dt(&mut self, dt: SimTime) {
        self.dt = dt;
    }

    fn set_global_param(&mut self, _name: &str, _value: f64) -> Result<(), EngineError> {
        Ok(())
    }

    fn set_max_step(&mut self, max_step: SimTime) -> SimTime {
        max_step.min(5.0)
    }

    fn seed_stream(&mut self, stream: StreamHandle, gid: Gid, seed: u32) -> Result<(), EngineError> {
        let state = (gid << 32) ^ u64::from(seed) | 1;
        self.streams.insert(stream, (gid, state));
        Ok(())
    }

    fn init(&mut self) -> Result<(), EngineError> {
        self.t = 0.0;
        self.spikes.clear();
        Ok(())
    }

    fn advance(&mut self, target: SimTime) -> Result<(), EngineError> {
        for (gid, state) in self.streams.values_mut() {
            let mut next = self.t;
            loop {
                let mut lookahead = *state;
                next += Self::next_interval(&mut lookahead);
                if next > target {
                    break;
                }
                *state = lookahead;
                self.spikes.push((next + 1.0, *gid));
            }
        }
        self.t = target;
        Ok(())
    }

    fn time(&self) -> SimTime {
        self.t
    }

    fn flush_records(&mut self, traced: &[Gid], record: &mut PartialRecord) -> Result<(), EngineError> {
        self.spikes.sort_by(|a, b| a.0.total_cmp(&b.0));
        for &(t, gid) in &self.spikes {
            record.push_spike(t, gid).map_err(|e| EngineError::Failed(e.to_string()))?;
        }

        for &gid in traced {
            let mut t = 0.0;
            while t < self.t {
                let near_spike = self.spikes.iter().any(|&(s, g)| g == gid && (s - t).abs() < 2.0);
                let v = if near_spike { 20.0 } else { -65.0 };
                record
                    .push_trace_sample("v_soma", gid, v)
                    .map_err(|e| EngineError::Failed(e.to_string()))?;
                t += self.dt.max(1.0);
            }
        }
        Ok(())
    }
}

fn base_config() -> Result<SimConfig, ConfigError> {
    SimConfigBuilder::new()
        .duration(1000.0)
        .dt(0.025)
        .record_trace("v_soma", TraceSpec::new("v").at("soma", 0.5))
        .record_cells(CellSelector::Pop("PYR".to_string()))
        .record_cells(CellSelector::Gid(NUM_CELLS - 1))
        .filename("ring_network")
        .build()
}

fn run_rank<C: Communicator>(comm: C, config: SimConfig, args: &[String]) -> Result<(), SimError> {
    let mut sim = Simulation::initialize(comm, ToyEngine::default(), config, args)?;
    sim.build_network(&mut RingBuilder)?;
    sim.gather_cell_tags()?;
    sim.setup_recording()?;
    sim.simulate()?;
    sim.save_data(&mut JsonFileWriter::new("."))?;
    sim.finish()?;
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Overrides are applied here only to pick the log level; every rank
    // applies them again, and logs them, during initialization
    let config = match base_config().and_then(|mut config| config.apply_overrides(&args).map(|_| config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log_level);

    let ranks = std::env::var("RANKS")
        .ok()
        .and_then(|r| r.parse().ok())
        .unwrap_or(2);

    match run_ranks(ranks, |comm| run_rank(comm, config.clone(), &args)) {
        Ok(results) => {
            let mut failed = false;
            for (rank, result) in results.into_iter().enumerate() {
                if let Err(e) = result {
                    tracing::error!(rank, "{e}");
                    failed = true;
                }
            }
            if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
