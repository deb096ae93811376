//! Per-rank output records and their merge policies.
//!
//! A record maps a key (`spkt`, `v_soma`, ...) to one of three shapes:
//!
//! - [`RecordValue::Flat`]: one sequence per rank (spike times, spike ids)
//! - [`RecordValue::Keyed`]: entity → sequence (a voltage trace per cell)
//! - [`RecordValue::Nested`]: entity → sub-key → sequence (stim spikes per
//!   cell and stim source)
//!
//! How a key merges across ranks is never inferred from its runtime shape:
//! each key carries an explicit [`KeyPolicy`] in the [`RecordSchema`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::config::SimConfig;
use crate::types::{entity_key, Gid, SimTime};

/// Flat spike-time sequence.
pub const SPIKE_TIMES: &str = "spkt";
/// Flat spike-source sequence, parallel to [`SPIKE_TIMES`].
pub const SPIKE_IDS: &str = "spkid";
/// Stim spikes per cell and stim source.
pub const STIM_SPIKES: &str = "stims";

/// Errors touching a record entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record key '{key}' holds {found} data where {expected} was expected")]
    ShapeMismatch {
        key: String,
        expected: RecordShape,
        found: RecordShape,
    },

    /// A NaN or infinite sample.
    #[error("record key '{key}' rejected non-finite value {value}")]
    NonFinite { key: String, value: String },
}

fn check_finite(key: &str, value: f64) -> Result<(), RecordError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RecordError::NonFinite {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// The nesting shape of a [`RecordValue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordShape {
    Flat,
    Keyed,
    Nested,
}

impl fmt::Display for RecordShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordShape::Flat => "flat",
            RecordShape::Keyed => "keyed",
            RecordShape::Nested => "nested",
        };
        f.write_str(name)
    }
}

/// One record entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordValue {
    /// A plain sequence
    Flat(Vec<f64>),
    /// Entity key → sequence
    Keyed(BTreeMap<String, Vec<f64>>),
    /// Entity key → sub-key → sequence
    Nested(BTreeMap<String, BTreeMap<String, Vec<f64>>>),
}

impl RecordValue {
    /// Returns the nesting shape.
    pub fn shape(&self) -> RecordShape {
        match self {
            RecordValue::Flat(_) => RecordShape::Flat,
            RecordValue::Keyed(_) => RecordShape::Keyed,
            RecordValue::Nested(_) => RecordShape::Nested,
        }
    }

    /// Creates an empty value of the given shape.
    pub fn empty(shape: RecordShape) -> Self {
        match shape {
            RecordShape::Flat => RecordValue::Flat(Vec::new()),
            RecordShape::Keyed => RecordValue::Keyed(BTreeMap::new()),
            RecordShape::Nested => RecordValue::Nested(BTreeMap::new()),
        }
    }

    /// Number of top-level items: samples for flat values, entities otherwise.
    pub fn len(&self) -> usize {
        match self {
            RecordValue::Flat(values) => values.len(),
            RecordValue::Keyed(map) => map.len(),
            RecordValue::Nested(map) => map.len(),
        }
    }

    /// Returns true if there are no top-level items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over every sample, at any depth.
    pub fn values(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            RecordValue::Flat(values) => Box::new(values.iter().copied()),
            RecordValue::Keyed(map) => Box::new(map.values().flatten().copied()),
            RecordValue::Nested(map) => Box::new(map.values().flat_map(|sub| sub.values().flatten().copied())),
        }
    }

    /// Returns the flat sequence, if this is a flat value.
    pub fn as_flat(&self) -> Option<&[f64]> {
        match self {
            RecordValue::Flat(values) => Some(values),
            _ => None,
        }
    }

    /// Returns the entity map, if this is a keyed value.
    pub fn as_keyed(&self) -> Option<&BTreeMap<String, Vec<f64>>> {
        match self {
            RecordValue::Keyed(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the entity → sub-key map, if this is a nested value.
    pub fn as_nested(&self) -> Option<&BTreeMap<String, BTreeMap<String, Vec<f64>>>> {
        match self {
            RecordValue::Nested(map) => Some(map),
            _ => None,
        }
    }
}

/// How a key's values from different ranks are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    /// Sequence data: flat values concatenate in rank order, keyed and
    /// nested values are copied per entity (and per sub-key).
    Vector,
    /// Keyed data partitioned disjointly across ranks, merged by update.
    Disjoint,
}

/// Declared merge policy for every record key of a run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordSchema {
    policies: BTreeMap<String, KeyPolicy>,
}

impl RecordSchema {
    /// Creates a schema with only the built-in spike and stim keys.
    pub fn new() -> Self {
        let mut schema = Self::default();
        for key in [SPIKE_TIMES, SPIKE_IDS, STIM_SPIKES] {
            schema.declare(key, KeyPolicy::Vector);
        }
        schema
    }

    /// Builds the schema of a run: built-in keys and every recorded trace
    /// key are vector keys; custom keys come from `record_keys`.
    pub fn from_config(config: &SimConfig) -> Self {
        let mut schema = Self::new();
        for key in config.record_traces.keys() {
            schema.declare(key.clone(), KeyPolicy::Vector);
        }
        for (key, policy) in &config.record_keys {
            schema.declare(key.clone(), *policy);
        }
        schema
    }

    /// Declares (or redeclares) the policy of `key`.
    pub fn declare(&mut self, key: impl Into<String>, policy: KeyPolicy) {
        self.policies.insert(key.into(), policy);
    }

    /// Returns the declared policy of `key`.
    pub fn policy(&self, key: &str) -> Option<KeyPolicy> {
        self.policies.get(key).copied()
    }

    /// Iterates over declared keys and policies in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, KeyPolicy)> {
        self.policies.iter().map(|(k, p)| (k.as_str(), *p))
    }
}

/// One rank's locally recorded output for a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartialRecord {
    entries: BTreeMap<String, RecordValue>,
}

impl PartialRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry under `key`. Every value must be finite.
    pub fn insert(&mut self, key: impl Into<String>, value: RecordValue) -> Result<(), RecordError> {
        let key = key.into();
        value.values().try_for_each(|v| check_finite(&key, v))?;
        self.entries.insert(key, value);
        Ok(())
    }

    /// Declares `key` with an empty value of `shape`, replacing any entry.
    pub fn declare(&mut self, key: impl Into<String>, shape: RecordShape) {
        self.entries.insert(key.into(), RecordValue::empty(shape));
    }

    /// Returns the entry under `key`.
    pub fn get(&self, key: &str) -> Option<&RecordValue> {
        self.entries.get(key)
    }

    /// Returns true if `key` has an entry.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RecordValue)> {
        self.entries.iter()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the record holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a spike of `gid` at `time` into the parallel flat
    /// `spkt`/`spkid` sequences.
    pub fn push_spike(&mut self, time: SimTime, gid: Gid) -> Result<(), RecordError> {
        check_finite(SPIKE_TIMES, time)?;
        self.flat_mut(SPIKE_TIMES)?.push(time);
        self.flat_mut(SPIKE_IDS)?.push(gid as f64);
        Ok(())
    }

    /// Appends one sample to the trace `key` of cell `gid`.
    pub fn push_trace_sample(&mut self, key: &str, gid: Gid, value: f64) -> Result<(), RecordError> {
        check_finite(key, value)?;
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RecordValue::empty(RecordShape::Keyed));

        match entry {
            RecordValue::Keyed(map) => {
                map.entry(entity_key(gid)).or_default().push(value);
                Ok(())
            }
            other => Err(RecordError::ShapeMismatch {
                key: key.to_string(),
                expected: RecordShape::Keyed,
                found: other.shape(),
            }),
        }
    }

    /// Records a spike delivered to cell `gid` by the stim `source` at `time`.
    pub fn push_stim_spike(&mut self, gid: Gid, source: &str, time: SimTime) -> Result<(), RecordError> {
        check_finite(STIM_SPIKES, time)?;
        let entry = self
            .entries
            .entry(STIM_SPIKES.to_string())
            .or_insert_with(|| RecordValue::empty(RecordShape::Nested));

        match entry {
            RecordValue::Nested(map) => {
                map.entry(entity_key(gid))
                    .or_default()
                    .entry(source.to_string())
                    .or_default()
                    .push(time);
                Ok(())
            }
            other => Err(RecordError::ShapeMismatch {
                key: STIM_SPIKES.to_string(),
                expected: RecordShape::Nested,
                found: other.shape(),
            }),
        }
    }

    fn flat_mut(&mut self, key: &str) -> Result<&mut Vec<f64>, RecordError> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RecordValue::empty(RecordShape::Flat));

        match entry {
            RecordValue::Flat(values) => Ok(values),
            other => Err(RecordError::ShapeMismatch {
                key: key.to_string(),
                expected: RecordShape::Flat,
                found: other.shape(),
            }),
        }
    }
}

impl IntoIterator for PartialRecord {
    type Item = (String, RecordValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, RecordValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, RecordValue)> for PartialRecord {
    fn from_iter<I: IntoIterator<Item = (String, RecordValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_spike_keeps_sequences_parallel() {
        let mut record = PartialRecord::new();
        record.push_spike(1.5, 3).unwrap();
        record.push_spike(2.0, 7).unwrap();

        assert_eq!(record.get(SPIKE_TIMES).unwrap().as_flat().unwrap(), &[1.5, 2.0]);
        assert_eq!(record.get(SPIKE_IDS).unwrap().as_flat().unwrap(), &[3.0, 7.0]);
    }

    #[test]
    fn test_push_trace_sample() {
        let mut record = PartialRecord::new();
        record.push_trace_sample("v", 1, -65.0).unwrap();
        record.push_trace_sample("v", 1, -64.5).unwrap();
        record.push_trace_sample("v", 2, -70.0).unwrap();

        let traces = record.get("v").unwrap().as_keyed().unwrap();
        assert_eq!(traces["cell_1"], vec![-65.0, -64.5]);
        assert_eq!(traces["cell_2"], vec![-70.0]);
    }

    #[test]
    fn test_push_stim_spike() {
        let mut record = PartialRecord::new();
        record.push_stim_spike(4, "background", 10.0).unwrap();
        record.push_stim_spike(4, "background", 12.5).unwrap();

        let stims = record.get(STIM_SPIKES).unwrap().as_nested().unwrap();
        assert_eq!(stims["cell_4"]["background"], vec![10.0, 12.5]);
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let mut record = PartialRecord::new();
        record.declare(SPIKE_TIMES, RecordShape::Keyed);

        let err = record.push_spike(1.0, 1).unwrap_err();
        assert_eq!(
            err,
            RecordError::ShapeMismatch {
                key: SPIKE_TIMES.to_string(),
                expected: RecordShape::Flat,
                found: RecordShape::Keyed,
            }
        );
    }

    #[test]
    fn test_non_finite_samples_rejected() {
        let mut record = PartialRecord::new();
        record.push_trace_sample("v", 1, -65.0).unwrap();

        let err = record.push_trace_sample("v", 1, f64::NAN).unwrap_err();
        assert!(matches!(err, RecordError::NonFinite { ref key, .. } if key == "v"));
        assert!(record.push_spike(f64::INFINITY, 1).is_err());
        assert!(record.push_stim_spike(1, "background", f64::NEG_INFINITY).is_err());

        // Rejected samples leave the record untouched
        assert_eq!(record.get("v").unwrap().as_keyed().unwrap()["cell_1"], vec![-65.0]);
        assert!(!record.contains_key(SPIKE_TIMES));
        assert!(!record.contains_key(STIM_SPIKES));
    }

    #[test]
    fn test_insert_rejects_nested_non_finite() {
        let mut record = PartialRecord::new();
        let mut sub = BTreeMap::new();
        sub.insert("background".to_string(), vec![1.0, f64::NAN]);
        let mut map = BTreeMap::new();
        map.insert("cell_0".to_string(), sub);

        let err = record.insert(STIM_SPIKES, RecordValue::Nested(map)).unwrap_err();
        assert_eq!(
            err,
            RecordError::NonFinite {
                key: STIM_SPIKES.to_string(),
                value: "NaN".to_string(),
            }
        );
        assert!(record.is_empty());
    }

    #[test]
    fn test_schema_builtin_keys() {
        let schema = RecordSchema::new();
        assert_eq!(schema.policy(SPIKE_TIMES), Some(KeyPolicy::Vector));
        assert_eq!(schema.policy(STIM_SPIKES), Some(KeyPolicy::Vector));
        assert_eq!(schema.policy("custom"), None);
    }

    #[test]
    fn test_schema_from_config() {
        let yaml = r#"
record_traces:
  v_soma:
    var: v
    sec: soma
record_keys:
  cell_meta: disjoint
"#;
        let config = SimConfig::from_yaml(yaml).unwrap();
        let schema = RecordSchema::from_config(&config);

        assert_eq!(schema.policy("v_soma"), Some(KeyPolicy::Vector));
        assert_eq!(schema.policy("cell_meta"), Some(KeyPolicy::Disjoint));
        assert_eq!(schema.iter().count(), 5);
    }

    #[test]
    fn test_record_value_serialization() {
        let value = RecordValue::Flat(vec![0.1, 0.2]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"flat":[0.1,0.2]}"#);

        let back: RecordValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
