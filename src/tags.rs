//! Cross-rank tag exchange.
//!
//! Connections may name presynaptic cells owned by other ranks. Before they
//! can be resolved (by population, by cell model), every rank needs every
//! cell's tags. One all-to-all round replicates each rank's gid → tags map
//! to all ranks; the received maps are disjoint and are merged by update.
//!
//! Every rank ends up holding the full map, so the payload grows with the
//! number of ranks.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::comm::{all_to_all, CollectiveError, CommError, Communicator};
use crate::network::{is_netstim, pop_label, Cell, Tags};
use crate::types::{Gid, Rank};

/// Tags of every cell in the run, by gid.
pub type CellTags = BTreeMap<Gid, Tags>;

/// A cell's position in the export representation: population label and
/// index within that population.
pub type PopIndex = (String, usize);

/// Errors from the tag exchange round.
#[derive(Error, Debug)]
pub enum TagError {
    #[error(transparent)]
    Collective(#[from] CollectiveError),

    #[error(transparent)]
    Comm(#[from] CommError),

    /// Two ranks reported the same gid.
    #[error("gid {gid} reported by rank {rank} is already owned by another rank")]
    DuplicateGid { gid: Gid, rank: Rank },
}

/// Exchanges the tags of all locally owned cells with every rank.
///
/// Collective: every rank must call it. Returns the tags of all cells in
/// the run on every rank.
pub fn gather_cell_tags<C: Communicator + ?Sized>(comm: &C, cells: &[Cell]) -> Result<CellTags, TagError> {
    let local: CellTags = cells.iter().map(|c| (c.gid, c.tags.clone())).collect();
    let outgoing = vec![local; comm.size()];

    let received: Vec<CellTags> = all_to_all(comm, outgoing)?;
    comm.barrier()?;

    let mut all_tags = CellTags::new();
    for (rank, node_tags) in received.into_iter().enumerate() {
        for (gid, tags) in node_tags {
            if all_tags.insert(gid, tags).is_some() {
                return Err(TagError::DuplicateGid { gid, rank });
            }
        }
    }

    tracing::debug!(rank = comm.rank(), cells = all_tags.len(), "cell tags exchanged");
    Ok(all_tags)
}

/// Maps every non-stim cell to its population and index.
///
/// Indices are assigned per population in ascending gid order. Cells
/// without a population label are left out.
pub fn resolve_populations(tags: &CellTags) -> BTreeMap<Gid, PopIndex> {
    let mut next_index: BTreeMap<&str, usize> = BTreeMap::new();
    let mut resolved = BTreeMap::new();

    for (gid, cell_tags) in tags {
        if is_netstim(cell_tags) {
            continue;
        }
        let Some(pop) = pop_label(cell_tags) else {
            continue;
        };
        let index = next_index.entry(pop).or_insert(0);
        resolved.insert(*gid, (pop.to_string(), *index));
        *index += 1;
    }

    resolved
}

/// Lowest gid in population `pop`, if any cell belongs to it.
pub fn first_gid_of(tags: &CellTags, pop: &str) -> Option<Gid> {
    tags.iter()
        .find(|(_, cell_tags)| pop_label(cell_tags) == Some(pop))
        .map(|(gid, _)| *gid)
}
