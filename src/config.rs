//! Run configuration.
//!
//! This module provides YAML/JSON configuration file support and a fixed,
//! typed schema for `key=value` commandline overrides.
//!
//! # Configuration File Structure
//!
//! ```yaml
//! duration: 1000        # ms
//! dt: 0.025             # ms, alias: step_size
//! max_step: 10
//! timing: true
//! seeds:
//!   conn: 1
//!   stim: 1
//!   loc: 1
//! h_params:
//!   celsius: 6.3
//! record_cells: [all]
//! record_traces:
//!   v_soma:
//!     var: v
//!     sec: soma
//!     loc: 0.5
//! record_stim: false
//! record_keys:
//!   cell_meta: disjoint
//! filename: model_output
//! ```
//!
//! # Commandline Overrides
//!
//! Arguments of the form `key=value` (spaces ignored) override the loaded
//! configuration, e.g. `duration=500 seeds.stim=3 h_params.celsius=34`.
//! Arguments without `=` are ignored. An unknown key is an error naming
//! that key; nothing is ever evaluated dynamically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::records::{KeyPolicy, SPIKE_IDS, SPIKE_TIMES, STIM_SPIKES};
use crate::types::{Gid, SimTime};

/// Errors that can occur while loading or overriding configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),

    #[error("Unknown configuration key '{0}'")]
    UnknownKey(String),

    #[error("Invalid value '{value}' for configuration key '{key}'")]
    InvalidValue { key: String, value: String },

    #[error("Malformed override '{0}', expected key=value")]
    MalformedOverride(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Logical seeds for the stochastic parts of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Seeds {
    /// Seed for connectivity randomization
    #[serde(default = "default_seed")]
    pub conn: i64,

    /// Base seed for stim streams without a seed of their own
    #[serde(default = "default_seed")]
    pub stim: i64,

    /// Seed for cell location randomization
    #[serde(default = "default_seed")]
    pub loc: i64,
}

fn default_seed() -> i64 {
    1
}

impl Default for Seeds {
    fn default() -> Self {
        Self {
            conn: default_seed(),
            stim: default_seed(),
            loc: default_seed(),
        }
    }
}

/// Selects cells to record traces from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSelector", into = "RawSelector")]
pub enum CellSelector {
    /// Every cell (`all`)
    All,
    /// The first cell of a population, by label
    Pop(String),
    /// One cell, by gid
    Gid(Gid),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSelector {
    Gid(Gid),
    Label(String),
}

impl From<RawSelector> for CellSelector {
    fn from(raw: RawSelector) -> Self {
        match raw {
            RawSelector::Gid(gid) => CellSelector::Gid(gid),
            RawSelector::Label(label) if label == "all" => CellSelector::All,
            RawSelector::Label(label) => CellSelector::Pop(label),
        }
    }
}

impl From<CellSelector> for RawSelector {
    fn from(selector: CellSelector) -> Self {
        match selector {
            CellSelector::All => RawSelector::Label("all".to_string()),
            CellSelector::Pop(label) => RawSelector::Label(label),
            CellSelector::Gid(gid) => RawSelector::Gid(gid),
        }
    }
}

/// What a recorded trace samples. Interpreted by the engine's recording
/// hooks; this crate only uses the trace key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceSpec {
    /// Variable name (e.g. `v`, `i`)
    pub var: String,

    /// Section to record from
    #[serde(default)]
    pub sec: Option<String>,

    /// Location along the section, in [0, 1]
    #[serde(default)]
    pub loc: Option<f64>,

    /// Mechanism owning the variable
    #[serde(default)]
    pub mech: Option<String>,

    /// Synaptic mechanism owning the variable
    #[serde(default)]
    pub syn_mech: Option<String>,
}

impl TraceSpec {
    /// Creates a trace of `var` with no location information.
    pub fn new(var: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            sec: None,
            loc: None,
            mech: None,
            syn_mech: None,
        }
    }

    /// Sets the section and location.
    pub fn at(mut self, sec: impl Into<String>, loc: f64) -> Self {
        self.sec = Some(sec.into());
        self.loc = Some(loc);
        self
    }
}

/// Complete run configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    /// Simulated duration in ms
    #[serde(default = "default_duration")]
    pub duration: SimTime,

    /// Integration step in ms
    #[serde(default = "default_dt", alias = "step_size")]
    pub dt: SimTime,

    /// Largest step this rank proposes between cross-rank spike exchanges
    #[serde(default = "default_max_step")]
    pub max_step: SimTime,

    /// Global engine parameters (temperature, clamp resistance, ...)
    #[serde(default = "default_h_params")]
    pub h_params: BTreeMap<String, f64>,

    /// Logical seeds
    #[serde(default)]
    pub seeds: Seeds,

    /// Extra progress output
    #[serde(default)]
    pub verbose: bool,

    /// Whether rank 0 records phase timings
    #[serde(default = "default_true", alias = "timing_enabled")]
    pub timing: bool,

    /// Whether saved output includes the timings
    #[serde(default)]
    pub save_timing: bool,

    /// Cells to record traces from
    #[serde(default)]
    pub record_cells: Vec<CellSelector>,

    /// Cells to plot; always recorded as well
    #[serde(default)]
    pub plot_cells: Vec<CellSelector>,

    /// Recorded traces by key
    #[serde(default)]
    pub record_traces: BTreeMap<String, TraceSpec>,

    /// Whether spikes delivered by stims are recorded
    #[serde(default)]
    pub record_stim: bool,

    /// Merge policy of custom record keys
    #[serde(default)]
    pub record_keys: BTreeMap<String, KeyPolicy>,

    /// Output file stem
    #[serde(default = "default_filename")]
    pub filename: String,

    /// Whether the output file stem gets a timestamp suffix
    #[serde(default)]
    pub timestamp_filename: bool,

    /// Whether output is saved as JSON
    #[serde(default = "default_true")]
    pub save_json: bool,

    /// Logging filter handed to [`init_logging`](crate::init_logging):
    /// a level (trace, debug, info, warn, error) or `target=level` directives
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_duration() -> SimTime {
    1000.0
}

fn default_dt() -> SimTime {
    0.025
}

fn default_max_step() -> SimTime {
    10.0
}

fn default_h_params() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("celsius".to_string(), 6.3),
        ("clamp_resist".to_string(), 0.001),
    ])
}

fn default_true() -> bool {
    true
}

fn default_filename() -> String {
    "model_output".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            duration: default_duration(),
            dt: default_dt(),
            max_step: default_max_step(),
            h_params: default_h_params(),
            seeds: Seeds::default(),
            verbose: false,
            timing: true,
            save_timing: false,
            record_cells: Vec::new(),
            plot_cells: Vec::new(),
            record_traces: BTreeMap::new(),
            record_stim: false,
            record_keys: BTreeMap::new(),
            filename: default_filename(),
            timestamp_filename: false,
            save_json: true,
            log_level: default_log_level(),
        }
    }
}

impl SimConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML or JSON file, chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            Some("json") => Self::from_json_file(path),
            other => Err(ConfigError::UnknownFormat(other.unwrap_or("").to_string())),
        }
    }

    /// Loads configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let mut config: SimConfig = serde_yaml::from_str(yaml)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let mut config: SimConfig = serde_json::from_str(json)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Adds every plotted cell to the recorded cells.
    pub fn normalize(&mut self) {
        for selector in &self.plot_cells {
            if !self.record_cells.contains(selector) {
                self.record_cells.push(selector.clone());
            }
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.duration > 0.0 && self.duration.is_finite()) {
            return Err(ConfigError::Validation(format!(
                "duration must be positive, got {}",
                self.duration
            )));
        }
        if !(self.dt > 0.0 && self.dt.is_finite()) {
            return Err(ConfigError::Validation(format!(
                "dt must be positive, got {}",
                self.dt
            )));
        }
        if !(self.max_step > 0.0) {
            return Err(ConfigError::Validation(format!(
                "max_step must be positive, got {}",
                self.max_step
            )));
        }
        if self.filename.is_empty() {
            return Err(ConfigError::Validation("filename must not be empty".to_string()));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.log_level).is_err() {
            return Err(ConfigError::InvalidValue {
                key: "log_level".to_string(),
                value: self.log_level.clone(),
            });
        }

        for key in self.record_keys.keys() {
            let builtin = [SPIKE_TIMES, SPIKE_IDS, STIM_SPIKES].contains(&key.as_str());
            if builtin || self.record_traces.contains_key(key) {
                return Err(ConfigError::Validation(format!(
                    "record key '{}' is already declared as a vector key",
                    key
                )));
            }
        }

        for (key, trace) in &self.record_traces {
            if let Some(loc) = trace.loc {
                if !(0.0..=1.0).contains(&loc) {
                    return Err(ConfigError::Validation(format!(
                        "trace '{}' has location {} outside [0, 1]",
                        key, loc
                    )));
                }
            }
        }

        Ok(())
    }

    /// Applies `key=value` overrides, then re-validates.
    ///
    /// Returns the `(key, value)` pairs that were applied, in order.
    pub fn apply_overrides<I, S>(&mut self, args: I) -> ConfigResult<Vec<(String, String)>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut applied = Vec::new();

        for arg in args {
            let cleaned: String = arg.as_ref().chars().filter(|c| !c.is_whitespace()).collect();
            let Some((key, value)) = cleaned.split_once('=') else {
                // Runtime flags such as -mpi or -python
                continue;
            };
            if key.is_empty() || value.is_empty() {
                return Err(ConfigError::MalformedOverride(cleaned));
            }

            self.set(key, value)?;
            applied.push((key.to_string(), value.to_string()));
        }

        self.normalize();
        self.validate()?;
        Ok(applied)
    }

    /// Sets one field by its override key.
    pub fn set(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        match key {
            "duration" => self.duration = parse_value(key, value)?,
            "dt" | "step_size" => self.dt = parse_value(key, value)?,
            "max_step" => self.max_step = parse_value(key, value)?,
            "verbose" => self.verbose = parse_bool(key, value)?,
            "timing" | "timing_enabled" => self.timing = parse_bool(key, value)?,
            "save_timing" => self.save_timing = parse_bool(key, value)?,
            "record_stim" => self.record_stim = parse_bool(key, value)?,
            "timestamp_filename" => self.timestamp_filename = parse_bool(key, value)?,
            "save_json" => self.save_json = parse_bool(key, value)?,
            "filename" => self.filename = value.trim_matches(|c| c == '"' || c == '\'').to_string(),
            "log_level" => self.log_level = value.to_string(),
            "seeds.conn" => self.seeds.conn = parse_value(key, value)?,
            "seeds.stim" => self.seeds.stim = parse_value(key, value)?,
            "seeds.loc" => self.seeds.loc = parse_value(key, value)?,
            _ => match key.strip_prefix("h_params.") {
                Some(name) if !name.is_empty() => {
                    let parsed = parse_value(key, value)?;
                    self.h_params.insert(name.to_string(), parsed);
                }
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            },
        }
        Ok(())
    }

    /// Keys of the recorded traces.
    pub fn recorded_keys(&self) -> impl Iterator<Item = &str> {
        self.record_traces.keys().map(String::as_str)
    }

    /// Saves configuration to a YAML file.
    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Saves configuration to a JSON file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Converts to YAML string.
    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Converts to JSON string.
    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value {
        "true" | "True" | "1" => Ok(true),
        "false" | "False" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Builder for creating SimConfig programmatically.
#[derive(Default)]
pub struct SimConfigBuilder {
    config: SimConfig,
}

impl SimConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the simulated duration (ms).
    pub fn duration(mut self, duration: SimTime) -> Self {
        self.config.duration = duration;
        self
    }

    /// Sets the integration step (ms).
    pub fn dt(mut self, dt: SimTime) -> Self {
        self.config.dt = dt;
        self
    }

    /// Sets the proposed maximum cross-rank step (ms).
    pub fn max_step(mut self, max_step: SimTime) -> Self {
        self.config.max_step = max_step;
        self
    }

    /// Sets a global engine parameter.
    pub fn h_param(mut self, name: impl Into<String>, value: f64) -> Self {
        self.config.h_params.insert(name.into(), value);
        self
    }

    /// Sets the base stim seed.
    pub fn stim_seed(mut self, seed: i64) -> Self {
        self.config.seeds.stim = seed;
        self
    }

    /// Enables or disables phase timing.
    pub fn timing(mut self, enable: bool) -> Self {
        self.config.timing = enable;
        self
    }

    /// Enables or disables saving timings with the output.
    pub fn save_timing(mut self, enable: bool) -> Self {
        self.config.save_timing = enable;
        self
    }

    /// Enables verbose progress output.
    pub fn verbose(mut self, enable: bool) -> Self {
        self.config.verbose = enable;
        self
    }

    /// Adds a recorded trace.
    pub fn record_trace(mut self, key: impl Into<String>, spec: TraceSpec) -> Self {
        self.config.record_traces.insert(key.into(), spec);
        self
    }

    /// Adds a cell selector to record traces from.
    pub fn record_cells(mut self, selector: CellSelector) -> Self {
        self.config.record_cells.push(selector);
        self
    }

    /// Enables stim spike recording.
    pub fn record_stim(mut self, enable: bool) -> Self {
        self.config.record_stim = enable;
        self
    }

    /// Declares the merge policy of a custom record key.
    pub fn record_key(mut self, key: impl Into<String>, policy: KeyPolicy) -> Self {
        self.config.record_keys.insert(key.into(), policy);
        self
    }

    /// Sets the logging filter.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Sets the output file stem.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.config.filename = filename.into();
        self
    }

    /// Builds and validates the configuration.
    pub fn build(mut self) -> ConfigResult<SimConfig> {
        self.config.normalize();
        self.config.validate()?;
        Ok(self.config)
    }
}
