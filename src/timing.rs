//! Named stopwatch registry, active on rank 0 only.
//!
//! Phases of a run are bracketed by `start`/`stop` calls under a fixed name
//! (`runTime`, `gatherTime`, ...). On any other rank, or when timing is
//! disabled in configuration, every call is a no-op and no entry is ever
//! created.
//!
//! A stop without a matching start is a programming error and is reported
//! as [`TimingError::NotStarted`] instead of producing a meaningless value.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;

use crate::topology::RankContext;

/// Time from `initialize` until the simulation is configured.
pub const INITIAL_TIME: &str = "initialTime";
/// Whole-run wall time.
pub const TOTAL_TIME: &str = "totalTime";
/// Recording setup.
pub const SETRECORD_TIME: &str = "setrecordTime";
/// Engine run, from the opening to the closing barrier.
pub const RUN_TIME: &str = "runTime";
/// Gather/merge of per-rank results.
pub const GATHER_TIME: &str = "gatherTime";
/// Hand-off to the data writer.
pub const SAVE_TIME: &str = "saveTime";

/// Misuse of the stopwatch registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimingError {
    #[error("timing '{0}' stopped without being started")]
    NotStarted(String),

    #[error("timing '{0}' started while already running")]
    AlreadyRunning(String),

    #[error("timing '{0}' stopped twice")]
    AlreadyStopped(String),
}

/// Stopwatch operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimingMode {
    Start,
    Stop,
}

/// Wall-clock start point of a bracketed phase.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch(Instant);

impl Stopwatch {
    pub fn start() -> Self {
        Stopwatch(Instant::now())
    }

    /// Seconds since [`start`](Self::start).
    pub fn secs(&self) -> f64 {
        self.0.elapsed().as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Running(Stopwatch),
    Elapsed(f64),
}

/// Stopwatch registry: name → elapsed seconds.
#[derive(Debug, Clone, Default)]
pub struct TimingRegistry {
    active: bool,
    entries: BTreeMap<String, Entry>,
}

impl TimingRegistry {
    /// Creates a registry that records only on rank 0 and only when
    /// `enabled` is set.
    pub fn new(topology: &RankContext, enabled: bool) -> Self {
        Self {
            active: enabled && topology.is_root(),
            entries: BTreeMap::new(),
        }
    }

    /// Creates a registry that never records.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Returns true if calls on this registry record anything.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Applies a start or stop under `name`.
    pub fn timing(&mut self, mode: TimingMode, name: &str) -> Result<(), TimingError> {
        match mode {
            TimingMode::Start => self.start(name),
            TimingMode::Stop => self.stop(name).map(|_| ()),
        }
    }

    /// Starts the stopwatch `name`. Restarting a stopped entry is allowed.
    pub fn start(&mut self, name: &str) -> Result<(), TimingError> {
        if !self.active {
            return Ok(());
        }
        if let Some(Entry::Running(_)) = self.entries.get(name) {
            return Err(TimingError::AlreadyRunning(name.to_string()));
        }
        self.entries.insert(name.to_string(), Entry::Running(Stopwatch::start()));
        Ok(())
    }

    /// Stops the stopwatch `name` and returns the elapsed seconds, or
    /// `None` when the registry is inactive.
    pub fn stop(&mut self, name: &str) -> Result<Option<f64>, TimingError> {
        if !self.active {
            return Ok(None);
        }
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| TimingError::NotStarted(name.to_string()))?;

        match *entry {
            Entry::Running(watch) => {
                let secs = watch.secs();
                *entry = Entry::Elapsed(secs);
                Ok(Some(secs))
            }
            Entry::Elapsed(_) => Err(TimingError::AlreadyStopped(name.to_string())),
        }
    }

    /// Returns the elapsed seconds of a stopped entry.
    pub fn elapsed(&self, name: &str) -> Option<f64> {
        match self.entries.get(name) {
            Some(Entry::Elapsed(secs)) => Some(*secs),
            _ => None,
        }
    }

    /// Returns true while `name` is started and not yet stopped.
    pub fn is_running(&self, name: &str) -> bool {
        matches!(self.entries.get(name), Some(Entry::Running(_)))
    }

    /// Number of entries, running or stopped.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entry was ever created.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Completed entries, for reporting and saving.
    pub fn snapshot(&self) -> TimingData {
        TimingData(
            self.entries
                .iter()
                .filter_map(|(name, entry)| match entry {
                    Entry::Elapsed(secs) => Some((name.clone(), *secs)),
                    Entry::Running(_) => None,
                })
                .collect(),
        )
    }
}

/// Completed timings: name → elapsed seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TimingData(pub BTreeMap<String, f64>);

impl TimingData {
    /// Elapsed seconds recorded under `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> RankContext {
        RankContext::new(0, 2).unwrap()
    }

    #[test]
    fn test_stopwatch() {
        let watch = Stopwatch::start();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(watch.secs() >= 0.01);
    }

    #[test]
    fn test_start_stop_bracket() {
        let mut timing = TimingRegistry::new(&root(), true);

        timing.timing(TimingMode::Start, "x").unwrap();
        assert!(timing.is_running("x"));
        timing.timing(TimingMode::Stop, "x").unwrap();

        let secs = timing.elapsed("x").unwrap();
        assert!(secs >= 0.0);
        assert!(!timing.is_running("x"));
    }

    #[test]
    fn test_stop_without_start_is_flagged() {
        let mut timing = TimingRegistry::new(&root(), true);
        assert_eq!(
            timing.timing(TimingMode::Stop, "x"),
            Err(TimingError::NotStarted("x".to_string()))
        );
        assert!(timing.is_empty());
    }

    #[test]
    fn test_double_start_and_double_stop() {
        let mut timing = TimingRegistry::new(&root(), true);
        timing.start("x").unwrap();
        assert_eq!(timing.start("x"), Err(TimingError::AlreadyRunning("x".to_string())));

        timing.stop("x").unwrap();
        assert_eq!(timing.stop("x"), Err(TimingError::AlreadyStopped("x".to_string())));

        // A stopped entry may be started again
        timing.start("x").unwrap();
        assert!(timing.is_running("x"));
    }

    #[test]
    fn test_rank_gating() {
        let other = RankContext::new(1, 2).unwrap();
        let mut timing = TimingRegistry::new(&other, true);

        timing.start("x").unwrap();
        assert_eq!(timing.stop("x").unwrap(), None);
        // Even a stray stop is a no-op away from rank 0
        timing.stop("never_started").unwrap();

        assert!(!timing.is_active());
        assert!(timing.is_empty());
    }

    #[test]
    fn test_disabled_on_root() {
        let mut timing = TimingRegistry::new(&root(), false);
        timing.start("x").unwrap();
        timing.stop("x").unwrap();
        assert!(timing.is_empty());
    }

    #[test]
    fn test_snapshot_skips_running_entries() {
        let mut timing = TimingRegistry::new(&root(), true);
        timing.start(RUN_TIME).unwrap();
        timing.stop(RUN_TIME).unwrap();
        timing.start(TOTAL_TIME).unwrap();

        let data = timing.snapshot();
        assert!(data.get(RUN_TIME).is_some());
        assert!(data.get(TOTAL_TIME).is_none());
        assert_eq!(timing.len(), 2);
    }
}
