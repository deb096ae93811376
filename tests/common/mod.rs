//! Shared fixtures for the integration tests: a deterministic engine and a
//! round-robin network builder.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::convert::Infallible;

use rankmerge::network::{CELL_MODEL, POP_LABEL};
use rankmerge::{
    Cell, Connection, EngineError, Gid, NetworkBuilder, PartialRecord, RunContext, SimEngine, SimTime, Stim,
    StreamHandle,
};

// ============================================================================
// Engine
// ============================================================================

/// Engine whose output depends only on gids and time.
///
/// Each owned cell spikes at `gid + 1`, then every `period` ms. Each traced
/// cell gets one sample per trace key per 100 ms, valued `gid * 1000 + t`.
pub struct MockEngine {
    pub t: SimTime,
    pub dt: SimTime,
    pub params: BTreeMap<String, f64>,
    pub seeds: Vec<(StreamHandle, Gid, u32)>,
    /// Step this rank supports for spike exchange
    pub supported_step: SimTime,
    pub owned: Vec<Gid>,
    pub period: SimTime,
    pub trace_keys: Vec<String>,
    pub advances: Vec<SimTime>,
    pub fail_advance: bool,
}

impl MockEngine {
    pub fn new(owned: Vec<Gid>) -> Self {
        Self {
            t: 0.0,
            dt: 0.0,
            params: BTreeMap::new(),
            seeds: Vec::new(),
            supported_step: f64::INFINITY,
            owned,
            period: 250.0,
            trace_keys: Vec::new(),
            advances: Vec::new(),
            fail_advance: false,
        }
    }

    pub fn with_traces(mut self, keys: &[&str]) -> Self {
        self.trace_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_supported_step(mut self, step: SimTime) -> Self {
        self.supported_step = step;
        self
    }
}

impl SimEngine for MockEngine {
    fn set_dt(&mut self, dt: SimTime) {
        self.dt = dt;
    }

    fn set_global_param(&mut self, name: &str, value: f64) -> Result<(), EngineError> {
        self.params.insert(name.to_string(), value);
        Ok(())
    }

    fn set_max_step(&mut self, max_step: SimTime) -> SimTime {
        max_step.min(self.supported_step)
    }

    fn seed_stream(&mut self, stream: StreamHandle, gid: Gid, seed: u32) -> Result<(), EngineError> {
        self.seeds.push((stream, gid, seed));
        Ok(())
    }

    fn init(&mut self) -> Result<(), EngineError> {
        self.t = 0.0;
        self.advances.clear();
        Ok(())
    }

    fn advance(&mut self, target: SimTime) -> Result<(), EngineError> {
        if self.fail_advance {
            return Err(EngineError::Failed("solver diverged".to_string()));
        }
        self.t = target;
        self.advances.push(target);
        Ok(())
    }

    fn time(&self) -> SimTime {
        self.t
    }

    fn flush_records(&mut self, traced: &[Gid], record: &mut PartialRecord) -> Result<(), EngineError> {
        for &gid in &self.owned {
            let mut spike = gid as f64 + 1.0;
            while spike <= self.t {
                record
                    .push_spike(spike, gid)
                    .map_err(|e| EngineError::Failed(e.to_string()))?;
                spike += self.period;
            }
        }

        for &gid in traced {
            for key in &self.trace_keys {
                let mut sample = 0.0;
                while sample < self.t {
                    record
                        .push_trace_sample(key, gid, gid as f64 * 1000.0 + sample)
                        .map_err(|e| EngineError::Failed(e.to_string()))?;
                    sample += 100.0;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Network
// ============================================================================

/// Distributes `num_cells` cells round-robin: gid `g` lives on rank
/// `g % host_count`. Even gids are population `E`, odd gids `I`. Every cell
/// receives one connection from the next gid and one background stim.
pub struct RoundRobinBuilder {
    pub num_cells: u64,
}

impl RoundRobinBuilder {
    pub fn new(num_cells: u64) -> Self {
        Self { num_cells }
    }

    /// Gids owned by `rank` in a world of `host_count` ranks.
    pub fn owned(&self, rank: usize, host_count: usize) -> Vec<Gid> {
        (0..self.num_cells)
            .filter(|gid| *gid as usize % host_count == rank)
            .collect()
    }
}

pub fn make_cell(gid: Gid, num_cells: u64) -> Cell {
    let pop = if gid % 2 == 0 { "E" } else { "I" };
    let mut cell = Cell::new(gid)
        .with_tag(POP_LABEL, pop)
        .with_tag(CELL_MODEL, "HH");

    cell.conns.push(Connection {
        pre_gid: (gid + 1) % num_cells,
        syn_mech: if pop == "E" { "AMPA" } else { "GABA" }.to_string(),
        weight: 0.01,
        delay: 5.0,
        loc: 0.5,
        sec: "soma".to_string(),
        threshold: 10.0,
    });
    cell.stims.push(Stim {
        source: "background".to_string(),
        rate: 10.0,
        noise: 0.5,
        syn_mech: "NMDA".to_string(),
        weight: 0.1,
        delay: 1.0,
        threshold: 10.0,
        sec: "soma".to_string(),
        loc: 0.5,
        seed: None,
        stream: Some(gid),
    });
    cell
}

impl NetworkBuilder for RoundRobinBuilder {
    type Error = Infallible;

    fn build(&mut self, ctx: &RunContext) -> Result<Vec<Cell>, Infallible> {
        let topology = ctx.topology();
        Ok(self
            .owned(topology.rank(), topology.host_count())
            .into_iter()
            .map(|gid| make_cell(gid, self.num_cells))
            .collect())
    }
}

/// Sorted (time, gid) pairs from merged spike sequences.
pub fn spike_pairs(records: &PartialRecord) -> Vec<(f64, f64)> {
    let times = records
        .get(rankmerge::records::SPIKE_TIMES)
        .and_then(|v| v.as_flat())
        .unwrap_or(&[]);
    let ids = records
        .get(rankmerge::records::SPIKE_IDS)
        .and_then(|v| v.as_flat())
        .unwrap_or(&[]);

    let mut pairs: Vec<(f64, f64)> = times.iter().copied().zip(ids.iter().copied()).collect();
    pairs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    pairs
}
