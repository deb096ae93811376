//! Core type definitions shared by every component.
//!
//! This module defines the fundamental identifiers and the time unit used
//! throughout the coordination layer.

/// Simulation time in milliseconds.
///
/// The external engine integrates in floating point, so all run-loop
/// arithmetic (durations, intervals, step sizes) uses this representation.
pub type SimTime = f64;

/// Globally unique identifier of a simulated cell.
///
/// Exactly one rank owns a given gid; gids are unique across the whole run,
/// not just within a rank.
pub type Gid = u64;

/// Identifier of a rank (worker process) in `[0, host_count)`.
pub type Rank = usize;

/// Opaque handle to a stochastic stream living inside the external engine.
pub type StreamHandle = u64;

/// Key under which per-cell data is stored in a record (`cell_<gid>`).
pub fn entity_key(gid: Gid) -> String {
    format!("cell_{gid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_aliases() {
        let time: SimTime = 0.025;
        let gid: Gid = 42;
        let rank: Rank = 3;
        let stream: StreamHandle = 7;

        assert_eq!(time, 0.025);
        assert_eq!(gid, 42);
        assert_eq!(rank, 3);
        assert_eq!(stream, 7);
    }

    #[test]
    fn test_entity_key() {
        assert_eq!(entity_key(0), "cell_0");
        assert_eq!(entity_key(1234), "cell_1234");
    }
}
