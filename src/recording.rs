//! Recording setup: which keys exist, and which local cells are traced.

use std::collections::BTreeSet;

use crate::config::CellSelector;
use crate::context::RunContext;
use crate::network::Cell;
use crate::records::{PartialRecord, RecordShape, SPIKE_IDS, SPIKE_TIMES, STIM_SPIKES};
use crate::tags::{first_gid_of, CellTags};
use crate::timing::{TimingError, TimingRegistry, SETRECORD_TIME};
use crate::types::Gid;

/// Outcome of [`setup_recording`] on one rank.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordingSetup {
    /// Empty record with every key this rank will fill
    pub record: PartialRecord,
    /// Locally owned cells whose traces are recorded, ascending
    pub traced: Vec<Gid>,
}

impl RecordingSetup {
    /// Returns true if traces of `gid` are recorded on this rank.
    pub fn is_traced(&self, gid: Gid) -> bool {
        self.traced.binary_search(&gid).is_ok()
    }
}

/// Prepares this rank's record and resolves the traced cells.
///
/// Spike keys always exist. The stim key exists when stim recording is on,
/// and trace keys exist when any cell is selected for recording.
///
/// A population selector picks the lowest gid of that population. With the
/// run-wide tags from [`gather_cell_tags`](crate::tags::gather_cell_tags)
/// that cell is traced by whichever rank owns it; without them only rank 0
/// resolves the selector, against its own cells.
pub fn setup_recording(
    ctx: &RunContext,
    cells: &[Cell],
    all_tags: Option<&CellTags>,
    timing: &mut TimingRegistry,
) -> Result<RecordingSetup, TimingError> {
    timing.start(SETRECORD_TIME)?;
    let config = ctx.config();

    let mut record = PartialRecord::new();
    record.declare(SPIKE_TIMES, RecordShape::Flat);
    record.declare(SPIKE_IDS, RecordShape::Flat);
    if config.record_stim {
        record.declare(STIM_SPIKES, RecordShape::Nested);
    }

    let mut traced = BTreeSet::new();
    if !config.record_cells.is_empty() {
        for key in config.recorded_keys() {
            record.declare(key, RecordShape::Keyed);
        }

        for selector in &config.record_cells {
            match selector {
                CellSelector::All => {
                    traced.extend(cells.iter().map(|c| c.gid));
                    break;
                }
                CellSelector::Pop(pop) => {
                    let first = match all_tags {
                        Some(tags) => first_gid_of(tags, pop),
                        None if ctx.is_root() => cells
                            .iter()
                            .filter(|c| c.pop_label() == Some(pop.as_str()))
                            .map(|c| c.gid)
                            .min(),
                        None => None,
                    };
                    if let Some(gid) = first.filter(|gid| cells.iter().any(|c| c.gid == *gid)) {
                        traced.insert(gid);
                    }
                }
                CellSelector::Gid(gid) => {
                    if cells.iter().any(|c| c.gid == *gid) {
                        traced.insert(*gid);
                    }
                }
            }
        }
    }

    timing.stop(SETRECORD_TIME)?;
    tracing::debug!(
        rank = ctx.topology().rank(),
        keys = record.len(),
        traced = traced.len(),
        "recording set up"
    );

    Ok(RecordingSetup {
        record,
        traced: traced.into_iter().collect(),
    })
}
