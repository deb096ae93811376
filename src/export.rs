//! Population-indexed model representation for interchange exporters.
//!
//! Exporters address cells as `population[index]` rather than by gid, and
//! group connections into projections and stims into named inputs. This
//! module builds that view; writing any particular format is left to a
//! [`ModelExporter`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::network::{is_netstim, Cell};
use crate::tags::{resolve_populations, CellTags, PopIndex};
use crate::types::{Gid, SimTime};

/// Errors building the export representation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// A gid has no population index (unknown cell, stim source, or
    /// missing population label).
    #[error("gid {0} cannot be resolved to a population index")]
    UnresolvedGid(Gid),
}

/// One connection inside a projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectionConn {
    pub index_pre: usize,
    pub index_post: usize,
    pub weight: f64,
    pub delay: SimTime,
}

/// All connections from one population onto another through one synapse
/// mechanism.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub pre_pop: String,
    pub post_pop: String,
    pub syn_mech: String,
    pub conns: Vec<ProjectionConn>,
}

/// One target cell of a stim input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StimTarget {
    pub index: usize,
    pub weight: f64,
    pub delay: SimTime,
    pub threshold: f64,
}

/// Stims sharing source, target population, rate, noise and mechanism.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StimInput {
    /// `NetStim_<source>_<pop>_<rate>_<noise>_<synMech>`
    pub name: String,
    pub pop: String,
    pub rate: f64,
    pub noise: f64,
    pub syn_mech: String,
    pub targets: Vec<StimTarget>,
}

/// The export view of a network.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportModel {
    /// gid → (population, index) of every exported cell
    pub populations: BTreeMap<Gid, PopIndex>,
    pub projections: Vec<Projection>,
    pub stim_inputs: Vec<StimInput>,
}

impl ExportModel {
    /// Builds the export view of `cells`, resolving gids through `tags`.
    ///
    /// Stim-source cells are skipped. Projections are ordered by
    /// (pre population, post population, mechanism), stim inputs by name;
    /// entries within each keep cell order.
    pub fn build(cells: &[Cell], tags: &CellTags) -> Result<Self, ExportError> {
        let populations = resolve_populations(tags);
        let lookup = |gid: Gid| populations.get(&gid).ok_or(ExportError::UnresolvedGid(gid));

        let mut projections: BTreeMap<(String, String, String), Vec<ProjectionConn>> = BTreeMap::new();
        let mut stim_inputs: BTreeMap<String, StimInput> = BTreeMap::new();

        for cell in cells.iter().filter(|c| !is_netstim(&c.tags)) {
            let (post_pop, index_post) = lookup(cell.gid)?;

            for conn in &cell.conns {
                let (pre_pop, index_pre) = lookup(conn.pre_gid)?;
                projections
                    .entry((pre_pop.clone(), post_pop.clone(), conn.syn_mech.clone()))
                    .or_default()
                    .push(ProjectionConn {
                        index_pre: *index_pre,
                        index_post: *index_post,
                        weight: conn.weight,
                        delay: conn.delay,
                    });
            }

            for stim in &cell.stims {
                let name = format!(
                    "NetStim_{}_{}_{}_{}_{}",
                    stim.source, post_pop, stim.rate, stim.noise, stim.syn_mech
                );
                stim_inputs
                    .entry(name.clone())
                    .or_insert_with(|| StimInput {
                        name,
                        pop: post_pop.clone(),
                        rate: stim.rate,
                        noise: stim.noise,
                        syn_mech: stim.syn_mech.clone(),
                        targets: Vec::new(),
                    })
                    .targets
                    .push(StimTarget {
                        index: *index_post,
                        weight: stim.weight,
                        delay: stim.delay,
                        threshold: stim.threshold,
                    });
            }
        }

        tracing::debug!(
            projections = projections.len(),
            stim_inputs = stim_inputs.len(),
            "export model built"
        );

        Ok(Self {
            populations,
            projections: projections
                .into_iter()
                .map(|((pre_pop, post_pop, syn_mech), conns)| Projection {
                    pre_pop,
                    post_pop,
                    syn_mech,
                    conns,
                })
                .collect(),
            stim_inputs: stim_inputs.into_values().collect(),
        })
    }
}

/// Writes an [`ExportModel`] in some interchange format.
pub trait ModelExporter {
    type Error: std::error::Error + Send + Sync + 'static;

    fn export(&mut self, model: &ExportModel) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Connection, Stim, CELL_MODEL, NETSTIM_MODEL, POP_LABEL};

    fn conn(pre_gid: Gid, syn_mech: &str) -> Connection {
        Connection {
            pre_gid,
            syn_mech: syn_mech.to_string(),
            weight: 0.5,
            delay: 2.0,
            loc: 0.5,
            sec: "soma".to_string(),
            threshold: 10.0,
        }
    }

    fn stim(rate: f64) -> Stim {
        Stim {
            source: "bg".to_string(),
            rate,
            noise: 0.5,
            syn_mech: "NMDA".to_string(),
            weight: 0.1,
            delay: 0.0,
            threshold: 10.0,
            sec: "soma".to_string(),
            loc: 0.5,
            seed: None,
            stream: None,
        }
    }

    fn network() -> Vec<Cell> {
        let mut e0 = Cell::new(0).with_tag(POP_LABEL, "E");
        let mut e1 = Cell::new(1).with_tag(POP_LABEL, "E");
        let mut i0 = Cell::new(2).with_tag(POP_LABEL, "I");
        let source = Cell::new(3)
            .with_tag(POP_LABEL, "bg")
            .with_tag(CELL_MODEL, NETSTIM_MODEL);

        e0.conns.push(conn(2, "GABA"));
        e1.conns.push(conn(2, "GABA"));
        i0.conns.push(conn(0, "AMPA"));
        i0.conns.push(conn(1, "AMPA"));
        e0.stims.push(stim(10.0));
        e1.stims.push(stim(10.0));
        i0.stims.push(stim(5.0));

        vec![e0, e1, i0, source]
    }

    fn tags(cells: &[Cell]) -> CellTags {
        cells.iter().map(|c| (c.gid, c.tags.clone())).collect()
    }

    #[test]
    fn test_projections_grouped() {
        let cells = network();
        let model = ExportModel::build(&cells, &tags(&cells)).unwrap();

        assert_eq!(model.projections.len(), 2);
        let e_to_i = &model.projections[0];
        assert_eq!((e_to_i.pre_pop.as_str(), e_to_i.post_pop.as_str()), ("E", "I"));
        assert_eq!(e_to_i.syn_mech, "AMPA");
        let pre: Vec<usize> = e_to_i.conns.iter().map(|c| c.index_pre).collect();
        assert_eq!(pre, vec![0, 1]);

        let i_to_e = &model.projections[1];
        assert_eq!(i_to_e.syn_mech, "GABA");
        let post: Vec<usize> = i_to_e.conns.iter().map(|c| c.index_post).collect();
        assert_eq!(post, vec![0, 1]);
    }

    #[test]
    fn test_stim_inputs_grouped() {
        let cells = network();
        let model = ExportModel::build(&cells, &tags(&cells)).unwrap();

        assert_eq!(model.stim_inputs.len(), 2);
        let names: Vec<&str> = model.stim_inputs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["NetStim_bg_E_10_0.5_NMDA", "NetStim_bg_I_5_0.5_NMDA"]);
        assert_eq!(model.stim_inputs[0].targets.len(), 2);
        assert!(!model.populations.contains_key(&3));
    }

    #[test]
    fn test_unresolved_gid() {
        let mut cells = network();
        cells[0].conns.push(conn(99, "AMPA"));

        let err = ExportModel::build(&cells, &tags(&cells)).unwrap_err();
        assert_eq!(err, ExportError::UnresolvedGid(99));
    }
}
