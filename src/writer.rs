//! Output of the merged dataset on rank 0.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::SimConfig;
use crate::gather::{AggregatedDataset, RunSummary};
use crate::network::Cell;
use crate::records::PartialRecord;
use crate::timing::TimingData;

/// Errors writing output files.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything saved for one run.
#[derive(Debug, Serialize)]
pub struct SaveBundle<'a> {
    #[serde(rename = "simConfig")]
    pub config: &'a SimConfig,
    #[serde(rename = "simData")]
    pub records: &'a PartialRecord,
    #[serde(rename = "netCells")]
    pub cells: &'a [Cell],
    pub summary: &'a RunSummary,
}

impl<'a> SaveBundle<'a> {
    pub fn new(config: &'a SimConfig, dataset: &'a AggregatedDataset) -> Self {
        Self {
            config,
            records: &dataset.records,
            cells: &dataset.cells,
            summary: &dataset.summary,
        }
    }
}

/// Receives the merged dataset on rank 0.
pub trait DataWriter {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Writes the run's data; returns the files written.
    fn write_data(&mut self, bundle: &SaveBundle<'_>) -> Result<Vec<PathBuf>, Self::Error>;

    /// Writes the phase timings. Called only when timings are saved.
    fn write_timing(&mut self, _config: &SimConfig, _timing: &TimingData) -> Result<Vec<PathBuf>, Self::Error> {
        Ok(Vec::new())
    }
}

/// Writes `<filename>[-<timestamp>].json` and `<filename>_timing.json`
/// into a directory.
#[derive(Debug, Clone)]
pub struct JsonFileWriter {
    dir: PathBuf,
}

impl JsonFileWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Output path of the data file for `config`, timestamped when
    /// `timestamp_filename` is set.
    pub fn data_path(&self, config: &SimConfig) -> PathBuf {
        let stem = if config.timestamp_filename {
            format!("{}-{}", config.filename, chrono::Local::now().format("%Y%m%d_%H%M%S"))
        } else {
            config.filename.clone()
        };
        self.dir.join(format!("{stem}.json"))
    }

    /// Output path of the timing file for `config`.
    pub fn timing_path(&self, config: &SimConfig) -> PathBuf {
        self.dir.join(format!("{}_timing.json", config.filename))
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), WriteError> {
    let json = serde_json::to_vec(value)?;
    std::fs::write(path, json).map_err(|source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl DataWriter for JsonFileWriter {
    type Error = WriteError;

    fn write_data(&mut self, bundle: &SaveBundle<'_>) -> Result<Vec<PathBuf>, WriteError> {
        if !bundle.config.save_json {
            return Ok(Vec::new());
        }

        let path = self.data_path(bundle.config);
        tracing::info!("Saving output as {} ...", path.display());
        write_json(&path, bundle)?;
        tracing::info!("Finished saving!");
        Ok(vec![path])
    }

    fn write_timing(&mut self, config: &SimConfig, timing: &TimingData) -> Result<Vec<PathBuf>, WriteError> {
        let path = self.timing_path(config);
        write_json(&path, timing)?;
        Ok(vec![path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{RecordValue, SPIKE_TIMES};
    use std::collections::BTreeMap;

    fn dataset() -> AggregatedDataset {
        let mut records = PartialRecord::new();
        records.insert(SPIKE_TIMES, RecordValue::Flat(vec![0.5, 1.25])).unwrap();
        AggregatedDataset {
            cells: vec![Cell::new(0)],
            records,
            summary: Default::default(),
        }
    }

    #[test]
    fn test_write_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SimConfig::new();
        config.filename = "run".to_string();
        let data = dataset();

        let mut writer = JsonFileWriter::new(dir.path());
        let written = writer.write_data(&SaveBundle::new(&config, &data)).unwrap();

        assert_eq!(written, vec![dir.path().join("run.json")]);
        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&written[0]).unwrap()).unwrap();
        assert_eq!(saved["simData"]["spkt"]["flat"][1], 1.25);
        assert_eq!(saved["netCells"][0]["gid"], 0);
        assert_eq!(saved["simConfig"]["filename"], "run");
    }

    #[test]
    fn test_save_json_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SimConfig::new();
        config.save_json = false;
        let data = dataset();

        let written = JsonFileWriter::new(dir.path())
            .write_data(&SaveBundle::new(&config, &data))
            .unwrap();
        assert!(written.is_empty());
    }

    #[test]
    fn test_timestamped_filename() {
        let mut config = SimConfig::new();
        config.filename = "run".to_string();
        config.timestamp_filename = true;

        let path = JsonFileWriter::new("out").data_path(&config);
        let name = path.file_name().unwrap().to_str().unwrap();
        // run-YYYYMMDD_HHMMSS.json
        assert!(name.starts_with("run-"));
        assert_eq!(name.len(), "run-".len() + 15 + ".json".len());
    }

    #[test]
    fn test_write_timing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SimConfig::new();
        config.filename = "run".to_string();
        let timing = TimingData(BTreeMap::from([("runTime".to_string(), 1.5)]));

        let written = JsonFileWriter::new(dir.path()).write_timing(&config, &timing).unwrap();

        let saved: BTreeMap<String, f64> =
            serde_json::from_slice(&std::fs::read(&written[0]).unwrap()).unwrap();
        assert_eq!(saved["runTime"], 1.5);
    }
}
