//! Run-loop controller.
//!
//! The controller drives an external [`SimEngine`] through one run, either
//! to completion ([`RunController::run_full`]) or in bounded intervals with
//! a callback after each one ([`RunController::run_with_interval`]).
//!
//! # States
//!
//! ```text
//! Uninitialized --configure--> Configured --run--> Running --> Completed
//!                                                   |    ^
//!                                                   v    |
//!                                               IntervalWait
//! ```
//!
//! `Completed` may run again; every run reseeds all stim streams, so runs
//! with the same seeds are equivalent. A failed run leaves the controller
//! in `Running` and it cannot be restarted.
//!
//! Every run is a collective: all ranks must call the same run method with
//! the same arguments.

use thiserror::Error;

use crate::comm::{CommError, Communicator};
use crate::context::RunContext;
use crate::network::Cell;
use crate::records::PartialRecord;
use crate::seed::StreamSeed;
use crate::timing::{Stopwatch, TimingError, TimingRegistry, RUN_TIME};
use crate::types::{Gid, SimTime, StreamHandle};

/// Errors reported by a simulation engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("unknown global parameter '{0}'")]
    UnknownParam(String),

    #[error("no random stream with handle {0}")]
    UnknownStream(StreamHandle),

    #[error("engine failure: {0}")]
    Failed(String),
}

/// The numerical engine this crate coordinates but does not implement.
pub trait SimEngine: Send {
    /// Sets the integration step (ms).
    fn set_dt(&mut self, dt: SimTime);

    /// Sets a global engine parameter such as the temperature.
    fn set_global_param(&mut self, name: &str, value: f64) -> Result<(), EngineError>;

    /// Proposes the largest step between cross-rank spike exchanges and
    /// returns the step this rank can actually support.
    fn set_max_step(&mut self, max_step: SimTime) -> SimTime;

    /// Reseeds the random stream `stream` of cell `gid`.
    fn seed_stream(&mut self, stream: StreamHandle, gid: Gid, seed: u32) -> Result<(), EngineError>;

    /// Initializes state variables and resets time to zero.
    fn init(&mut self) -> Result<(), EngineError>;

    /// Integrates up to `target` (ms).
    fn advance(&mut self, target: SimTime) -> Result<(), EngineError>;

    /// Current simulation time (ms).
    fn time(&self) -> SimTime;

    /// Moves what the engine recorded during the last run into `record`:
    /// spikes of every local cell, and traces of the `traced` cells.
    fn flush_records(&mut self, _traced: &[Gid], _record: &mut PartialRecord) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Errors raised by the run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("simulation is not configured")]
    NotConfigured,

    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: RunState,
    },

    #[error("run interval must be positive, got {0}")]
    InvalidInterval(SimTime),

    #[error("engine made no progress at t = {time} ms")]
    Stalled { time: SimTime },

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Timing(#[from] TimingError),
}

/// Lifecycle of the run controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Uninitialized,
    Configured,
    Running,
    /// Between two interval advances, while the callback runs
    IntervalWait,
    Completed,
}

/// Summary of one finished run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunReport {
    /// Simulation time reached (ms)
    pub sim_time: SimTime,
    /// Step agreed by all ranks for spike exchange (ms)
    pub min_step: SimTime,
    /// Wall-clock duration of the run on this rank (s)
    pub wall_secs: f64,
    /// Number of interval callbacks invoked
    pub callbacks: usize,
}

impl RunReport {
    /// Simulated seconds per wall-clock second.
    pub fn real_time_ratio(&self) -> f64 {
        if self.wall_secs > 0.0 {
            self.sim_time / 1000.0 / self.wall_secs
        } else {
            0.0
        }
    }
}

/// Drives a [`SimEngine`] through configured runs.
pub struct RunController<E> {
    engine: E,
    state: RunState,
}

impl<E: SimEngine> RunController<E> {
    /// Wraps an engine; the controller starts `Uninitialized`.
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            state: RunState::Uninitialized,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Applies the step size and global parameters of `ctx` to the engine.
    pub fn configure(&mut self, ctx: &RunContext) -> Result<(), RunError> {
        if matches!(self.state, RunState::Running | RunState::IntervalWait) {
            return Err(RunError::InvalidState {
                operation: "configure",
                state: self.state,
            });
        }

        let config = ctx.config();
        self.engine.set_dt(config.dt);
        for (name, value) in &config.h_params {
            self.engine.set_global_param(name, *value)?;
        }

        self.state = RunState::Configured;
        Ok(())
    }

    /// Runs the whole configured duration in one advance.
    pub fn run_full<C: Communicator + ?Sized>(
        &mut self,
        ctx: &RunContext,
        comm: &C,
        timing: &mut TimingRegistry,
        cells: &[Cell],
    ) -> Result<RunReport, RunError> {
        let duration = ctx.config().duration;
        let (watch, min_step) = self.begin(ctx, comm, timing, cells)?;

        self.engine.advance(duration)?;

        self.finish(ctx, comm, timing, watch, min_step, 0)
    }

    /// Runs in steps of at most `interval`, calling `callback` with the
    /// current time after each step, until the time or the rounded time
    /// reaches the configured duration.
    pub fn run_with_interval<C, F>(
        &mut self,
        ctx: &RunContext,
        comm: &C,
        timing: &mut TimingRegistry,
        cells: &[Cell],
        interval: SimTime,
        mut callback: F,
    ) -> Result<RunReport, RunError>
    where
        C: Communicator + ?Sized,
        F: FnMut(SimTime),
    {
        if !(interval > 0.0 && interval.is_finite()) {
            return Err(RunError::InvalidInterval(interval));
        }

        let duration = ctx.config().duration;
        let (watch, min_step) = self.begin(ctx, comm, timing, cells)?;

        let mut callbacks = 0;
        // Steps are clamped to the duration, so reaching it always ends the loop
        while self.engine.time() < duration && self.engine.time().round() < duration {
            let before = self.engine.time();
            self.engine.advance(duration.min(before + interval))?;

            let now = self.engine.time();
            if now <= before {
                return Err(RunError::Stalled { time: now });
            }

            self.state = RunState::IntervalWait;
            callback(now);
            callbacks += 1;
            self.state = RunState::Running;
        }

        self.finish(ctx, comm, timing, watch, min_step, callbacks)
    }

    /// Shared setup: opening barrier, max-step agreement, reseeding, init.
    fn begin<C: Communicator + ?Sized>(
        &mut self,
        ctx: &RunContext,
        comm: &C,
        timing: &mut TimingRegistry,
        cells: &[Cell],
    ) -> Result<(Stopwatch, SimTime), RunError> {
        match self.state {
            RunState::Configured | RunState::Completed => {}
            RunState::Uninitialized => return Err(RunError::NotConfigured),
            state => {
                return Err(RunError::InvalidState {
                    operation: "start a run",
                    state,
                })
            }
        }
        self.state = RunState::Running;

        comm.barrier()?;
        timing.start(RUN_TIME)?;
        if ctx.is_root() {
            tracing::info!(duration_ms = ctx.config().duration, "Running...");
        }
        let watch = Stopwatch::start();

        let proposed = self.engine.set_max_step(ctx.config().max_step);
        let min_step = comm.all_reduce_min(proposed)?;
        if ctx.is_root() && ctx.config().verbose {
            tracing::info!("Minimum delay (time-step for queue exchange) is {:.2} ms", min_step);
        }

        let reseeded = self.reseed_streams(ctx, cells)?;
        tracing::debug!(rank = ctx.topology().rank(), streams = reseeded, "stim streams reseeded");

        self.engine.init()?;
        Ok((watch, min_step))
    }

    fn finish<C: Communicator + ?Sized>(
        &mut self,
        ctx: &RunContext,
        comm: &C,
        timing: &mut TimingRegistry,
        watch: Stopwatch,
        min_step: SimTime,
        callbacks: usize,
    ) -> Result<RunReport, RunError> {
        let report = RunReport {
            sim_time: self.engine.time(),
            min_step,
            wall_secs: watch.secs(),
            callbacks,
        };
        if ctx.is_root() {
            tracing::info!(
                "  Done; run time = {:.2} s; real-time ratio: {:.2}.",
                report.wall_secs,
                report.real_time_ratio()
            );
        }

        comm.barrier()?;
        timing.stop(RUN_TIME)?;

        self.state = RunState::Completed;
        Ok(report)
    }

    /// Reseeds every stim stream owned by this rank from (gid, seed).
    fn reseed_streams(&mut self, ctx: &RunContext, cells: &[Cell]) -> Result<usize, EngineError> {
        let default_seed = ctx.config().seeds.stim;
        let mut count = 0;

        for cell in cells {
            for stim in &cell.stims {
                let Some(stream) = stim.stream else {
                    continue;
                };
                let seed = StreamSeed::new(cell.gid, stim.seed.unwrap_or(default_seed));
                self.engine.seed_stream(stream, seed.gid, seed.seed)?;
                count += 1;
            }
        }

        Ok(count)
    }
}
