//! Integration tests for the cross-rank tag exchange.

mod common;

use common::RoundRobinBuilder;
use rankmerge::network::pop_label;
use rankmerge::tags::TagError;
use rankmerge::{
    gather_cell_tags, resolve_populations, run_ranks, Cell, Communicator, NetworkBuilder, RankContext,
    RunContext, SimConfig,
};

fn build_cells(rank: usize, size: usize, num_cells: u64) -> Vec<Cell> {
    let ctx = RunContext::new(RankContext::new(rank, size).unwrap(), SimConfig::new()).unwrap();
    RoundRobinBuilder::new(num_cells).build(&ctx).unwrap()
}

#[test]
fn test_every_rank_sees_every_cell() {
    let results = run_ranks(3, |comm| {
        let cells = build_cells(comm.rank(), comm.size(), 8);
        gather_cell_tags(&comm, &cells).unwrap()
    })
    .unwrap();

    for tags in &results {
        assert_eq!(tags.len(), 8);
        assert_eq!(tags.keys().copied().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
        assert_eq!(pop_label(&tags[&5]), Some("I"));
    }
    assert_eq!(results[0], results[2]);
}

#[test]
fn test_remote_presynaptic_cells_resolvable() {
    let results = run_ranks(2, |comm| {
        let cells = build_cells(comm.rank(), comm.size(), 6);
        let tags = gather_cell_tags(&comm, &cells).unwrap();

        // Every connection's source is known, even when owned by the other rank
        cells
            .iter()
            .flat_map(|c| c.conns.iter())
            .all(|conn| tags.contains_key(&conn.pre_gid))
    })
    .unwrap();

    assert_eq!(results, vec![true, true]);
}

#[test]
fn test_population_indices_agree_across_ranks() {
    let results = run_ranks(4, |comm| {
        let cells = build_cells(comm.rank(), comm.size(), 10);
        let tags = gather_cell_tags(&comm, &cells).unwrap();
        resolve_populations(&tags)
    })
    .unwrap();

    assert!(results.windows(2).all(|w| w[0] == w[1]));
    let populations = &results[0];
    assert_eq!(populations[&0], ("E".to_string(), 0));
    assert_eq!(populations[&8], ("E".to_string(), 4));
    assert_eq!(populations[&9], ("I".to_string(), 4));
}

#[test]
fn test_duplicate_gid_reported() {
    let results = run_ranks(2, |comm| {
        let cells = vec![Cell::new(3)];
        gather_cell_tags(&comm, &cells)
    })
    .unwrap();

    for result in results {
        assert!(matches!(result, Err(TagError::DuplicateGid { gid: 3, rank: 1 })));
    }
}
