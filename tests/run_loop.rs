//! Integration tests for the run-loop controller across ranks.

mod common;

use common::{MockEngine, RoundRobinBuilder};
use rankmerge::timing::RUN_TIME;
use rankmerge::{
    derive_seed, run_ranks, Communicator, LocalComm, RunError, RunState, SimConfigBuilder, SimError, SimTime,
    Simulation,
};

fn no_args() -> Vec<String> {
    Vec::new()
}

#[test]
fn test_interval_scenario() {
    let config = SimConfigBuilder::new().duration(1000.0).dt(0.1).build().unwrap();
    let mut sim = Simulation::initialize(LocalComm::new(), MockEngine::new(vec![]), config, no_args()).unwrap();

    let mut times: Vec<SimTime> = Vec::new();
    let report = sim.run_with_interval(100.0, |t| times.push(t)).unwrap();

    assert_eq!(times.len(), 10);
    assert_eq!(times.first(), Some(&100.0));
    assert_eq!(times.last(), Some(&1000.0));
    assert!(times.windows(2).all(|w| w[1] - w[0] == 100.0));
    assert_eq!(report.callbacks, 10);
    assert_eq!(sim.engine().dt, 0.1);
    assert_eq!(sim.run_state(), RunState::Completed);
}

#[test]
fn test_interval_scenario_on_every_rank() {
    let results = run_ranks(3, |comm| {
        let config = SimConfigBuilder::new().duration(1000.0).dt(0.1).build().unwrap();
        let mut sim = Simulation::initialize(comm, MockEngine::new(vec![]), config, no_args()).unwrap();

        let mut times = Vec::new();
        sim.run_with_interval(100.0, |t| times.push(t)).unwrap();
        times
    })
    .unwrap();

    let expected: Vec<SimTime> = (1..=10).map(|i| i as f64 * 100.0).collect();
    for times in results {
        assert_eq!(times, expected);
    }
}

#[test]
fn test_max_step_agreed_across_ranks() {
    let steps = run_ranks(3, |comm| {
        let supported = [8.0, 2.5, 6.0][comm.rank()];
        let config = SimConfigBuilder::new().duration(50.0).max_step(10.0).build().unwrap();
        let engine = MockEngine::new(vec![]).with_supported_step(supported);
        let mut sim = Simulation::initialize(comm, engine, config, no_args()).unwrap();
        sim.run().unwrap().min_step
    })
    .unwrap();

    assert_eq!(steps, vec![2.5, 2.5, 2.5]);
}

#[test]
fn test_reseeding_independent_of_rank_count() {
    let num_cells = 6;

    let seeds_for = |size: usize| {
        let per_rank = run_ranks(size, |comm| {
            let config = SimConfigBuilder::new().duration(10.0).stim_seed(77).build().unwrap();
            let owned = RoundRobinBuilder::new(num_cells).owned(comm.rank(), comm.size());
            let mut sim = Simulation::initialize(comm, MockEngine::new(owned), config, no_args()).unwrap();
            sim.build_network(&mut RoundRobinBuilder::new(num_cells)).unwrap();
            sim.run().unwrap();
            sim.engine().seeds.clone()
        })
        .unwrap();

        let mut seeds: Vec<_> = per_rank.into_iter().flatten().collect();
        seeds.sort();
        seeds
    };

    let one = seeds_for(1);
    let three = seeds_for(3);
    assert_eq!(one.len(), 6);
    assert_eq!(one, three);
    assert!(one.iter().all(|&(_, _, seed)| seed == derive_seed(77)));
}

#[test]
fn test_run_time_recorded_on_root_only() {
    let timings = run_ranks(2, |comm| {
        let config = SimConfigBuilder::new().duration(20.0).build().unwrap();
        let mut sim = Simulation::initialize(comm, MockEngine::new(vec![]), config, no_args()).unwrap();
        sim.run().unwrap();
        sim.finish().unwrap()
    })
    .unwrap();

    assert!(timings[0].get(RUN_TIME).is_some());
    assert!(timings[0].get("totalTime").is_some());
    assert!(timings[0].get("initialTime").is_some());
    assert!(timings[1].is_empty());
}

#[test]
fn test_engine_failure_propagates() {
    let config = SimConfigBuilder::new().duration(20.0).build().unwrap();
    let mut engine = MockEngine::new(vec![]);
    engine.fail_advance = true;
    let mut sim = Simulation::initialize(LocalComm::new(), engine, config, no_args()).unwrap();

    let err = sim.run().unwrap_err();
    assert!(matches!(err, SimError::Run(RunError::Engine(_))));
    assert_eq!(sim.run_state(), RunState::Running);

    // A failed run cannot be restarted
    let err = sim.run().unwrap_err();
    assert!(matches!(err, SimError::Run(RunError::InvalidState { .. })));
}

#[test]
fn test_peer_failure_surfaces_instead_of_hanging() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let config = SimConfigBuilder::new().duration(20.0).build().unwrap();
        let mut sim = Simulation::initialize(comm, MockEngine::new(vec![]), config, no_args()).unwrap();
        if rank == 1 {
            // Leaves before the run's opening barrier
            return None;
        }
        Some(sim.run().map(|_| ()))
    })
    .unwrap();

    assert!(matches!(
        results[0],
        Some(Err(SimError::Run(RunError::Comm(rankmerge::CommError::PeerLost { rank: 0 }))))
    ));
    assert!(results[1].is_none());
}
