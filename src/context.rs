//! The immutable per-run context threaded through every phase.

use crate::config::{ConfigResult, SimConfig};
use crate::records::RecordSchema;
use crate::topology::RankContext;

/// Everything a phase of the run may read about the run itself.
///
/// Built once after topology and configuration are settled; never mutated
/// afterwards. Phases receive it by reference.
#[derive(Clone, Debug, PartialEq)]
pub struct RunContext {
    topology: RankContext,
    config: SimConfig,
    schema: RecordSchema,
}

impl RunContext {
    /// Validates `config` and derives the record schema from it.
    pub fn new(topology: RankContext, config: SimConfig) -> ConfigResult<Self> {
        config.validate()?;
        let schema = RecordSchema::from_config(&config);
        Ok(Self {
            topology,
            config,
            schema,
        })
    }

    /// This rank's place in the run.
    pub fn topology(&self) -> &RankContext {
        &self.topology
    }

    /// The validated configuration.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// The merge policy of every record key.
    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Returns true on rank 0.
    pub fn is_root(&self) -> bool {
        self.topology.is_root()
    }
}
