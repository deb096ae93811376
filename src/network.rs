//! Cells, connections and stims as produced by an external network builder.
//!
//! These are the snapshots that travel between ranks during tag exchange
//! and gather. Engine-side handles are never serialized: [`Stim::stream`]
//! is skipped and comes back as `None` on the receiving rank.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::context::RunContext;
use crate::types::{Gid, SimTime, StreamHandle};

/// Descriptive cell attributes (population label, cell model, position, ...).
pub type Tags = BTreeMap<String, serde_json::Value>;

/// Tag holding the population label of a cell.
pub const POP_LABEL: &str = "popLabel";
/// Tag holding the cell model name.
pub const CELL_MODEL: &str = "cellModel";
/// Cell model of artificial spike sources, which are not exported as cells.
pub const NETSTIM_MODEL: &str = "NetStim";

/// A synaptic connection onto the owning cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Presynaptic cell; may be owned by another rank
    pub pre_gid: Gid,
    pub syn_mech: String,
    pub weight: f64,
    pub delay: SimTime,
    /// Location along `sec`, in [0, 1]
    pub loc: f64,
    pub sec: String,
    #[serde(default)]
    pub threshold: f64,
}

/// A stochastic spike source attached to a cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stim {
    /// Label of the stim population (e.g. `background`)
    pub source: String,
    /// Mean rate in Hz
    pub rate: f64,
    /// Fraction of randomness in the spike intervals
    pub noise: f64,
    pub syn_mech: String,
    pub weight: f64,
    pub delay: SimTime,
    #[serde(default)]
    pub threshold: f64,
    pub sec: String,
    pub loc: f64,
    /// Logical seed of this stim; falls back to `seeds.stim` when unset
    #[serde(default)]
    pub seed: Option<i64>,
    /// Engine random stream driving this stim
    #[serde(skip)]
    pub stream: Option<StreamHandle>,
}

/// A simulated cell owned by exactly one rank.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub gid: Gid,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub conns: Vec<Connection>,
    #[serde(default)]
    pub stims: Vec<Stim>,
}

impl Cell {
    /// Creates a cell with no attributes, connections or stims.
    pub fn new(gid: Gid) -> Self {
        Self {
            gid,
            tags: Tags::new(),
            conns: Vec::new(),
            stims: Vec::new(),
        }
    }

    /// Sets a tag, builder style.
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    /// Population label, if tagged.
    pub fn pop_label(&self) -> Option<&str> {
        pop_label(&self.tags)
    }

    /// Copy of the cell without engine-side handles, as it looks after
    /// crossing ranks.
    pub fn snapshot(&self) -> Self {
        let mut cell = self.clone();
        for stim in &mut cell.stims {
            stim.stream = None;
        }
        cell
    }
}

/// Population label in a tag set.
pub fn pop_label(tags: &Tags) -> Option<&str> {
    tags.get(POP_LABEL).and_then(|v| v.as_str())
}

/// Returns true for artificial spike sources.
pub fn is_netstim(tags: &Tags) -> bool {
    tags.get(CELL_MODEL).and_then(|v| v.as_str()) == Some(NETSTIM_MODEL)
}

/// Produces the cells owned by this rank.
///
/// Implementations run on every rank and must return only locally owned
/// cells, with gids unique across the whole run.
pub trait NetworkBuilder {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Builds this rank's cells in local order.
    fn build(&mut self, ctx: &RunContext) -> Result<Vec<Cell>, Self::Error>;
}
