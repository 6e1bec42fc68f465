//! Append-only per-trial audit log.
//!
//! Trials of one parameter key share the scratch log files, so only the last
//! trial's raw bits survive on disk. The ledger keeps one CSV row per trial
//! with its transition counts, capacity, and observed bitrate.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};

use crate::matrix::TransitionMatrix;
use crate::params::ParameterKey;
use crate::CovcapError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub timestamp: String,
    pub key: String,
    pub trial: usize,
    pub n00: u64,
    pub n01: u64,
    pub n10: u64,
    pub n11: u64,
    /// `None` when the trial was aborted before a capacity was computed
    pub capacity: Option<f64>,
    /// `ok` or the signal that affected the trial
    pub outcome: String,
    pub bits: Option<u64>,
    pub elapsed_ns: Option<u64>,
    pub raw_bandwidth: Option<f64>,
}

impl TrialRecord {
    pub fn new(key: &ParameterKey, trial: usize) -> Self {
        Self {
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            key: key.canonical(),
            trial,
            n00: 0,
            n01: 0,
            n10: 0,
            n11: 0,
            capacity: None,
            outcome: "ok".to_string(),
            bits: None,
            elapsed_ns: None,
            raw_bandwidth: None,
        }
    }

    pub fn with_matrix(mut self, matrix: &TransitionMatrix) -> Self {
        let [[n00, n01], [n10, n11]] = matrix.counts;
        self.n00 = n00;
        self.n01 = n01;
        self.n10 = n10;
        self.n11 = n11;
        self
    }

    pub fn matrix(&self) -> TransitionMatrix {
        TransitionMatrix::new([[self.n00, self.n01], [self.n10, self.n11]])
    }
}

#[derive(Debug, Clone)]
pub struct TrialLedger {
    path: PathBuf,
}

impl TrialLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first if the file is new.
    pub fn append(&self, record: &TrialRecord) -> Result<(), CovcapError> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let needs_header = fs::metadata(&self.path).map_or(true, |meta| meta.len() == 0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut writer = WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }

    /// All readable rows; unreadable rows are skipped with a warning.
    pub fn records(&self) -> Result<Vec<TrialRecord>, CovcapError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = ReaderBuilder::new().from_path(&self.path)?;
        let mut records = Vec::new();
        for (idx, row) in reader.deserialize::<TrialRecord>().enumerate() {
            match row {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), row = idx + 1, %err, "skipping unreadable ledger row");
                }
            }
        }
        Ok(records)
    }

    pub fn records_for(&self, key: &ParameterKey) -> Result<Vec<TrialRecord>, CovcapError> {
        let canonical = key.canonical();
        Ok(self
            .records()?
            .into_iter()
            .filter(|record| record.key == canonical)
            .collect())
    }

    /// Raw bandwidth of the most recent trial of `key` that observed one.
    pub fn last_raw_bandwidth(&self, key: &ParameterKey) -> Result<Option<f64>, CovcapError> {
        Ok(self
            .records_for(key)?
            .iter()
            .rev()
            .find_map(|record| record.raw_bandwidth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_append_under_a_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TrialLedger::new(dir.path().join("nested").join("trials.csv"));
        let key = ParameterKey::new(1, 2, 3);

        let mut first = TrialRecord::new(&key, 0).with_matrix(&TransitionMatrix::new([[4, 1], [0, 5]]));
        first.capacity = Some(0.61);
        first.raw_bandwidth = Some(1200.0);
        ledger.append(&first).unwrap();

        let mut second = TrialRecord::new(&key, 1);
        second.outcome = "receiver_timeout".to_string();
        ledger.append(&second).unwrap();

        let raw = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(raw.matches("timestamp").count(), 1);

        let records = ledger.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].matrix().counts, [[4, 1], [0, 5]]);
        assert_eq!(records[0].capacity, Some(0.61));
        assert_eq!(records[1].capacity, None);
        assert_eq!(records[1].outcome, "receiver_timeout");
    }

    #[test]
    fn last_bandwidth_skips_aborted_trials_and_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TrialLedger::new(dir.path().join("trials.csv"));
        let key = ParameterKey::new(1, 2, 3);
        let other = ParameterKey::new(9, 9, 9);

        assert_eq!(ledger.last_raw_bandwidth(&key).unwrap(), None);

        for (k, bandwidth) in [(key, Some(100.0)), (key, Some(150.0)), (other, Some(999.0)), (key, None)] {
            let mut record = TrialRecord::new(&k, 0);
            record.raw_bandwidth = bandwidth;
            ledger.append(&record).unwrap();
        }

        assert_eq!(ledger.last_raw_bandwidth(&key).unwrap(), Some(150.0));
        assert_eq!(ledger.last_raw_bandwidth(&other).unwrap(), Some(999.0));
        assert_eq!(ledger.records_for(&key).unwrap().len(), 3);
    }
}
