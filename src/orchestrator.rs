//! Trial sequencing for one parameter key at a time.
//!
//! Within a key, trials run strictly one after another because they share the
//! scratch log files. The receiver is always spawned before the sender so it
//! is already priming when the sender starts signalling.

use std::fs;
use std::io;

use serde::Serialize;
use tracing::Instrument;

use crate::capacity::CapacityEstimator;
use crate::config::BenchConfig;
use crate::ledger::{TrialLedger, TrialRecord};
use crate::matrix::TransitionMatrix;
use crate::params::ParameterKey;
use crate::process::{ChannelLauncher, ChannelSpawner, ReceiverReport, Role};
use crate::samples::SampleLog;
use crate::store::ResultStore;
use crate::CovcapError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyOutcome {
    /// Trials ran to completion
    Measured,
    /// Enough current samples were cached; no process was started
    Cached,
    /// A failure stopped the key's remaining trials
    Aborted { signal: String, reason: String },
}

impl KeyOutcome {
    pub fn label(&self) -> &str {
        match self {
            Self::Measured => "measured",
            Self::Cached => "cached",
            Self::Aborted { signal, .. } => signal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyReport {
    pub key: ParameterKey,
    pub outcome: KeyOutcome,
    /// Trials started during this call
    pub trials_run: usize,
    /// Samples stored for the key after this call
    pub samples: usize,
    pub max_capacity: Option<f64>,
    pub raw_bandwidth: f64,
    /// `max_capacity * raw_bandwidth`, 0 for aborted keys
    pub effective_bandwidth: f64,
}

#[derive(Debug, Clone)]
struct TrialResult {
    capacity: f64,
    raw_bandwidth: f64,
    record: TrialRecord,
}

pub struct ExperimentOrchestrator<L = ChannelLauncher> {
    config: BenchConfig,
    estimator: CapacityEstimator,
    launcher: L,
    store: ResultStore,
    ledger: TrialLedger,
}

impl ExperimentOrchestrator {
    pub fn new(config: BenchConfig) -> Self {
        let store = ResultStore::from_config(&config);
        Self::with_store(config, store)
    }

    pub fn with_store(config: BenchConfig, store: ResultStore) -> Self {
        let launcher = ChannelLauncher::from_config(&config);
        Self::with_launcher(config, store, launcher)
    }
}

impl<L: ChannelSpawner> ExperimentOrchestrator<L> {
    pub fn with_launcher(config: BenchConfig, store: ResultStore, launcher: L) -> Self {
        Self {
            estimator: config.capacity_estimator(),
            ledger: TrialLedger::new(config.ledger_path()),
            launcher,
            store,
            config,
        }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn store(&mut self) -> &mut ResultStore {
        &mut self.store
    }

    pub fn ledger(&self) -> &TrialLedger {
        &self.ledger
    }

    /// Process keys strictly in order. A failed key never stops the batch.
    pub async fn run_batch(&mut self, keys: &[ParameterKey]) -> Vec<KeyReport> {
        let mut reports = Vec::with_capacity(keys.len());
        for key in keys {
            reports.push(self.run_key(key).await);
        }
        reports
    }

    /// Run (or reuse) the trials for one key and report its effective bandwidth.
    pub async fn run_key(&mut self, key: &ParameterKey) -> KeyReport {
        let span = tracing::info_span!("key", key = %key);
        self.run_key_inner(key).instrument(span).await
    }

    async fn run_key_inner(&mut self, key: &ParameterKey) -> KeyReport {
        if let Some(samples) = self.store.cached_samples(key, self.config.skip_threshold) {
            return self.cached_report(key, samples.len());
        }

        if let Err(err) = self.reset_scratch() {
            tracing::error!(%err, "could not prepare scratch directory");
            return self.aborted_report(key, 0, 0.0, &err);
        }

        let mut trials_run = 0;
        let mut raw_bandwidth = 0.0;
        let mut failure = None;

        for trial in 0..self.config.runs_per_key {
            trials_run += 1;
            match self.run_trial(key, trial).await {
                Ok(result) => {
                    tracing::info!(
                        trial,
                        capacity = result.capacity,
                        raw_bandwidth = result.raw_bandwidth,
                        bandwidth = result.capacity * result.raw_bandwidth,
                        outcome = %result.record.outcome,
                        "trial finished"
                    );
                    self.store.append(key, result.capacity);
                    raw_bandwidth = result.raw_bandwidth;
                    self.record(&result.record);
                }
                Err(err) => {
                    tracing::warn!(trial, %err, "aborting remaining trials");
                    let mut record = TrialRecord::new(key, trial);
                    record.outcome = err.signal().to_string();
                    self.record(&record);
                    failure = Some(err);
                    break;
                }
            }
        }

        // samples from completed trials are kept even when the key aborted
        if let Err(err) = self.store.persist() {
            tracing::error!(%err, path = %self.store.path().display(), "could not persist results");
            if failure.is_none() {
                failure = Some(err);
            }
        }

        if let Some(err) = failure {
            return self.aborted_report(key, trials_run, raw_bandwidth, &err);
        }

        let max_capacity = self.store.max_capacity(key);
        let effective_bandwidth = max_capacity.unwrap_or(0.0) * raw_bandwidth;
        tracing::info!(
            capacity = max_capacity.unwrap_or(0.0),
            bandwidth = effective_bandwidth,
            "key finished"
        );

        KeyReport {
            key: *key,
            outcome: KeyOutcome::Measured,
            trials_run,
            samples: self.store.samples(key).len(),
            max_capacity,
            raw_bandwidth,
            effective_bandwidth,
        }
    }

    async fn run_trial(&self, key: &ParameterKey, trial: usize) -> Result<TrialResult, CovcapError> {
        tracing::debug!(trial, "starting trial");

        // the receiver must be priming before the sender starts signalling
        let receiver = self.launcher.spawn(Role::Receiver, key)?;
        let sender = self.launcher.spawn(Role::Sender, key)?;

        tokio::time::sleep(self.config.cool_down()).await;
        sender.wait(self.config.sender_timeout()).await?;
        tokio::time::sleep(self.config.cool_down()).await;
        let output = receiver.wait(self.config.receiver_timeout()).await?;

        let report = ReceiverReport::parse(&String::from_utf8_lossy(&output.stdout))?;
        let raw_bandwidth = report.raw_bandwidth(key);

        let sent = SampleLog::read_from_path(&self.config.sender_log_path())?;
        let received = SampleLog::read_from_path(&self.config.receiver_log_path())?;
        let (matrix, log_signal) = TransitionMatrix::from_logs_or_zero(&sent, &received);
        let (capacity, capacity_signal) = match log_signal {
            Some(signal) => (0.0, Some(signal)),
            None => self.estimator.capacity_or_zero(&matrix),
        };

        let mut record = TrialRecord::new(key, trial).with_matrix(&matrix);
        record.capacity = Some(capacity);
        record.bits = Some(report.bits);
        record.elapsed_ns = Some(report.elapsed_ns);
        record.raw_bandwidth = Some(raw_bandwidth);
        if let Some(signal) = capacity_signal {
            record.outcome = signal.signal().to_string();
        }

        Ok(TrialResult {
            capacity,
            raw_bandwidth,
            record,
        })
    }

    fn cached_report(&mut self, key: &ParameterKey, current_samples: usize) -> KeyReport {
        // stale samples do not satisfy the skip but still count towards the maximum
        let max_capacity = self.store.max_capacity(key).unwrap_or(0.0);

        let observed = match self.ledger.last_raw_bandwidth(key) {
            Ok(observed) => observed,
            Err(err) => {
                tracing::warn!(%err, "could not read trial ledger");
                None
            }
        };
        let raw_bandwidth = observed.unwrap_or_else(|| {
            let nominal = key.nominal_bitrate(self.config.nominal_clock_hz);
            tracing::warn!(nominal, "no observed bitrate on record, using nominal bitrate");
            nominal
        });

        let effective_bandwidth = max_capacity * raw_bandwidth;
        tracing::info!(
            samples = current_samples,
            capacity = max_capacity,
            bandwidth = effective_bandwidth,
            "enough cached samples, skipping trials"
        );

        KeyReport {
            key: *key,
            outcome: KeyOutcome::Cached,
            trials_run: 0,
            samples: self.store.samples(key).len(),
            max_capacity: Some(max_capacity),
            raw_bandwidth,
            effective_bandwidth,
        }
    }

    fn aborted_report(
        &mut self,
        key: &ParameterKey,
        trials_run: usize,
        raw_bandwidth: f64,
        err: &CovcapError,
    ) -> KeyReport {
        KeyReport {
            key: *key,
            outcome: KeyOutcome::Aborted {
                signal: err.signal().to_string(),
                reason: err.to_string(),
            },
            trials_run,
            samples: self.store.samples(key).len(),
            max_capacity: self.store.max_capacity(key),
            raw_bandwidth,
            effective_bandwidth: 0.0,
        }
    }

    fn reset_scratch(&self) -> Result<(), CovcapError> {
        match fs::remove_dir_all(&self.config.scratch_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&self.config.scratch_dir)?;
        Ok(())
    }

    fn record(&self, record: &TrialRecord) {
        if let Err(err) = self.ledger.append(record) {
            tracing::warn!(%err, path = %self.ledger.path().display(), "could not append to trial ledger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_outcome_is_labelled_by_its_signal() {
        let outcome = KeyOutcome::Aborted {
            signal: CovcapError::SenderTimeout { timeout_ms: 50 }.signal().to_string(),
            reason: "sender did not finish within 50 ms".to_string(),
        };
        assert_eq!(outcome.label(), "sender_timeout");
        assert_eq!(KeyOutcome::Cached.label(), "cached");

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "aborted");
        assert_eq!(json["signal"], "sender_timeout");
    }

    #[tokio::test]
    async fn cached_maximum_includes_stale_samples() {
        let dir = tempfile::tempdir().unwrap();
        let config = BenchConfig {
            results_dir: dir.path().join("results"),
            sender_bin: dir.path().join("pp-llc-send"),
            receiver_bin: dir.path().join("pp-llc-recv"),
            scratch_dir: dir.path().join("data"),
            affinity_program: None,
            ..BenchConfig::default()
        };
        let key = ParameterKey::new(2_300_000, 800_000, 800_000);

        fs::create_dir_all(&config.results_dir).unwrap();
        fs::write(config.result_path(), r#"{"[2300000, 800000, 800000]": [0.9]}"#).unwrap();
        // rebuilt binaries make the document stale
        let rebuilt = fs::metadata(config.result_path()).unwrap().modified().unwrap()
            + std::time::Duration::from_secs(60);
        for binary in [&config.sender_bin, &config.receiver_bin] {
            fs::write(binary, "").unwrap();
            fs::File::options()
                .write(true)
                .open(binary)
                .unwrap()
                .set_modified(rebuilt)
                .unwrap();
        }

        let mut store = ResultStore::from_config(&config);
        for capacity in [0.2, 0.4, 0.3] {
            store.append(&key, capacity);
        }
        assert_eq!(store.cached_samples(&key, 3), Some(vec![0.2, 0.4, 0.3]));

        let mut orchestrator = ExperimentOrchestrator::with_store(config, store);
        let report = orchestrator.run_key(&key).await;

        assert_eq!(report.outcome, KeyOutcome::Cached);
        assert_eq!(report.samples, 4);
        assert_eq!(report.max_capacity, Some(0.9));
        // no ledger yet, so 2.3 GHz / 2.3e6 ns gives 1000 bit/s
        assert!((report.effective_bandwidth - 900.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unwritable_scratch_aborts_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();

        let config = BenchConfig {
            scratch_dir: blocker.join("data"),
            results_dir: dir.path().join("results"),
            sender_bin: dir.path().join("missing-send"),
            receiver_bin: dir.path().join("missing-recv"),
            affinity_program: None,
            ..BenchConfig::default()
        };
        let mut orchestrator = ExperimentOrchestrator::new(config);
        let report = orchestrator.run_key(&ParameterKey::new(1, 2, 3)).await;

        assert_eq!(report.trials_run, 0);
        assert_eq!(report.outcome.label(), "io");
        assert!(orchestrator.ledger().records().unwrap().is_empty());
    }
}
