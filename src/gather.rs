//! Gather/merge of per-rank results into one dataset on rank 0.
//!
//! Every rank packages its cells and its [`PartialRecord`] and sends the
//! package to rank 0 in one all-to-all round. Rank 0 then merges the
//! packages in ascending rank order:
//!
//! | shape  | [`KeyPolicy::Vector`]             | [`KeyPolicy::Disjoint`]            |
//! |--------|-----------------------------------|------------------------------------|
//! | flat   | concatenate in rank order         | error                              |
//! | keyed  | copy each entity's sequence       | update; an entity seen twice fails |
//! | nested | copy each entity's sub-key map    | update; an entity seen twice fails |
//!
//! The single-rank path runs the same merge over one package, so a run on
//! one rank and the same run split over many produce the same records.

use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::comm::{all_to_all, CollectiveError, CommError, Communicator};
use crate::context::RunContext;
use crate::network::Cell;
use crate::records::{KeyPolicy, PartialRecord, RecordSchema, RecordShape, RecordValue, SPIKE_TIMES};
use crate::timing::{TimingError, TimingRegistry, GATHER_TIME, RUN_TIME};
use crate::types::{Gid, Rank, SimTime};

/// Errors raised while gathering or merging per-rank results.
#[derive(Error, Debug)]
pub enum GatherError {
    #[error(transparent)]
    Collective(#[from] CollectiveError),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Timing(#[from] TimingError),

    /// A record key has no declared merge policy.
    #[error("record key '{key}' from rank {rank} has no declared merge policy")]
    UndeclaredKey { key: String, rank: Rank },

    /// A record key's nesting differs between ranks.
    #[error("record key '{key}' is {expected} data but rank {rank} sent {found} data")]
    ShapeMismatch {
        key: String,
        rank: Rank,
        expected: RecordShape,
        found: RecordShape,
    },

    /// A disjoint key holds a flat sequence, which has no entities to partition.
    #[error("record key '{key}' is declared disjoint but holds flat data")]
    DisjointFlat { key: String },

    /// An entity of a disjoint key was reported by more than one rank.
    #[error("entity '{entity}' of disjoint key '{key}' reported again by rank {rank}")]
    DisjointOverlap { key: String, entity: String, rank: Rank },

    /// Two ranks claim the same cell.
    #[error("gid {gid} from rank {rank} was already gathered")]
    DuplicateGid { gid: Gid, rank: Rank },

    /// Rank 0 received nothing from a rank.
    #[error("rank {rank} sent no package to rank 0")]
    MissingPackage { rank: Rank },
}

/// What one rank contributes to the gather.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RankPackage {
    pub cells: Vec<Cell>,
    pub records: PartialRecord,
}

/// Run-wide statistics computed on rank 0 from the merged data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_spikes: usize,
    pub total_connections: usize,
    pub num_cells: usize,
    pub num_hosts: usize,
    /// Mean firing rate in Hz
    pub firing_rate: f64,
    pub conns_per_cell: f64,
}

impl RunSummary {
    /// Computes the statistics of merged data over `duration` ms.
    pub fn compute(cells: &[Cell], records: &PartialRecord, duration: SimTime, num_hosts: usize) -> Self {
        let total_spikes = records
            .get(SPIKE_TIMES)
            .and_then(RecordValue::as_flat)
            .map_or(0, <[f64]>::len);
        let total_connections = count_connections(cells);
        let num_cells = cells.len();

        let (firing_rate, conns_per_cell) = if num_cells > 0 && duration > 0.0 {
            (
                total_spikes as f64 / num_cells as f64 / duration * 1e3,
                total_connections as f64 / num_cells as f64,
            )
        } else {
            (0.0, 0.0)
        };

        Self {
            total_spikes,
            total_connections,
            num_cells,
            num_hosts,
            firing_rate,
            conns_per_cell,
        }
    }
}

#[cfg(feature = "parallel")]
fn count_connections(cells: &[Cell]) -> usize {
    cells.par_iter().map(|c| c.conns.len()).sum()
}

#[cfg(not(feature = "parallel"))]
fn count_connections(cells: &[Cell]) -> usize {
    cells.iter().map(|c| c.conns.len()).sum()
}

/// The merged result of a run, held by rank 0 only.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedDataset {
    /// Every cell, in rank order then local order
    pub cells: Vec<Cell>,
    /// Merged records of every rank
    pub records: PartialRecord,
    pub summary: RunSummary,
}

/// Merges rank packages, given in ascending rank order.
///
/// Returns the concatenated cells and the merged records.
pub fn merge_packages<I>(schema: &RecordSchema, packages: I) -> Result<(Vec<Cell>, PartialRecord), GatherError>
where
    I: IntoIterator<Item = RankPackage>,
{
    let mut cells = Vec::new();
    let mut seen_gids = HashSet::new();
    let mut merged: BTreeMap<String, RecordValue> = BTreeMap::new();
    // Entities already claimed per disjoint key
    let mut claimed: BTreeMap<String, HashSet<String>> = BTreeMap::new();

    for (rank, package) in packages.into_iter().enumerate() {
        for cell in package.cells {
            if !seen_gids.insert(cell.gid) {
                return Err(GatherError::DuplicateGid { gid: cell.gid, rank });
            }
            cells.push(cell);
        }

        for (key, value) in package.records {
            let policy = schema
                .policy(&key)
                .ok_or_else(|| GatherError::UndeclaredKey { key: key.clone(), rank })?;

            let slot = match merged.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(RecordValue::empty(value.shape())),
            };

            match policy {
                KeyPolicy::Vector => merge_vector(&key, rank, slot, value)?,
                KeyPolicy::Disjoint => {
                    let claimed = claimed.entry(key.clone()).or_default();
                    merge_disjoint(&key, rank, slot, value, claimed)?;
                }
            }
        }
    }

    Ok((cells, merged.into_iter().collect()))
}

fn shape_mismatch(key: &str, rank: Rank, slot: &RecordValue, value: &RecordValue) -> GatherError {
    GatherError::ShapeMismatch {
        key: key.to_string(),
        rank,
        expected: slot.shape(),
        found: value.shape(),
    }
}

fn merge_vector(key: &str, rank: Rank, slot: &mut RecordValue, value: RecordValue) -> Result<(), GatherError> {
    match (slot, value) {
        (RecordValue::Flat(acc), RecordValue::Flat(values)) => acc.extend(values),
        (RecordValue::Keyed(acc), RecordValue::Keyed(map)) => {
            for (entity, seq) in map {
                acc.insert(entity, seq);
            }
        }
        (RecordValue::Nested(acc), RecordValue::Nested(map)) => {
            for (entity, sub) in map {
                let target = acc.entry(entity).or_default();
                target.clear();
                target.extend(sub);
            }
        }
        (slot, value) => return Err(shape_mismatch(key, rank, slot, &value)),
    }
    Ok(())
}

fn merge_disjoint(
    key: &str,
    rank: Rank,
    slot: &mut RecordValue,
    value: RecordValue,
    claimed: &mut HashSet<String>,
) -> Result<(), GatherError> {
    let mut claim = |entity: &String| {
        if claimed.insert(entity.clone()) {
            Ok(())
        } else {
            Err(GatherError::DisjointOverlap {
                key: key.to_string(),
                entity: entity.clone(),
                rank,
            })
        }
    };

    match (slot, value) {
        (RecordValue::Keyed(acc), RecordValue::Keyed(map)) => {
            for (entity, seq) in map {
                claim(&entity)?;
                acc.insert(entity, seq);
            }
        }
        (RecordValue::Nested(acc), RecordValue::Nested(map)) => {
            for (entity, sub) in map {
                claim(&entity)?;
                acc.insert(entity, sub);
            }
        }
        (RecordValue::Flat(_), RecordValue::Flat(_)) => {
            return Err(GatherError::DisjointFlat { key: key.to_string() })
        }
        (slot, value) => return Err(shape_mismatch(key, rank, slot, &value)),
    }
    Ok(())
}

/// Gathers every rank's cells and records onto rank 0 and merges them.
///
/// Collective: every rank must call it. Returns the dataset on rank 0 and
/// `None` on every other rank. Timed as `gatherTime`.
pub fn gather_data<C: Communicator + ?Sized>(
    ctx: &RunContext,
    comm: &C,
    timing: &mut TimingRegistry,
    cells: &[Cell],
    records: &PartialRecord,
) -> Result<Option<AggregatedDataset>, GatherError> {
    timing.start(GATHER_TIME)?;
    if ctx.is_root() {
        tracing::info!("Gathering spikes...");
    }

    let package = RankPackage {
        cells: cells.iter().map(Cell::snapshot).collect(),
        records: records.clone(),
    };

    let packages = if ctx.topology().is_distributed() {
        let mut outgoing: Vec<Option<RankPackage>> = vec![None; comm.size()];
        outgoing[0] = Some(package);

        let received = all_to_all(comm, outgoing)?;
        comm.barrier()?;

        if !ctx.is_root() {
            tracing::debug!(rank = ctx.topology().rank(), "package sent to rank 0");
            return Ok(None);
        }

        received
            .into_iter()
            .enumerate()
            .map(|(rank, package)| package.ok_or(GatherError::MissingPackage { rank }))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        vec![package]
    };

    let (cells, records) = merge_packages(ctx.schema(), packages)?;
    let gather_secs = timing.stop(GATHER_TIME)?;

    let config = ctx.config();
    let summary = RunSummary::compute(&cells, &records, config.duration, ctx.topology().host_count());
    log_summary(&summary, config.duration, gather_secs, timing.elapsed(RUN_TIME));

    Ok(Some(AggregatedDataset {
        cells,
        records,
        summary,
    }))
}

fn log_summary(summary: &RunSummary, duration: SimTime, gather_secs: Option<f64>, run_secs: Option<f64>) {
    if let Some(secs) = gather_secs {
        tracing::info!("  Done; gather time = {:.2} s.", secs);
    }
    tracing::info!("Analyzing...");
    if let Some(secs) = run_secs {
        tracing::info!("  Run time: {:.2} s", secs);
    }
    tracing::info!(
        "  Simulated time: {}-s; {} cells; {} workers",
        duration / 1e3,
        summary.num_cells,
        summary.num_hosts
    );
    tracing::info!("  Spikes: {} ({:.2} Hz)", summary.total_spikes, summary.firing_rate);
    tracing::info!(
        "  Connections: {} ({:.2} per cell)",
        summary.total_connections,
        summary.conns_per_cell
    );
}
