use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::config::BenchConfig;
use crate::orchestrator::{ExperimentOrchestrator, KeyOutcome, KeyReport};
use crate::output::{write_manifest_json, write_summary_csv, Manifest, OUTPUT_SCHEMA_VERSION};
use crate::CovcapError;

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub output_dir: PathBuf,
    pub reports: Vec<KeyReport>,
}

impl SweepResult {
    /// Keys whose trials were stopped by a failure.
    pub fn aborted(&self) -> impl Iterator<Item = &KeyReport> {
        self.reports
            .iter()
            .filter(|report| matches!(report.outcome, KeyOutcome::Aborted { .. }))
    }

    /// The report with the highest effective bandwidth, if any key produced one.
    pub fn best(&self) -> Option<&KeyReport> {
        self.reports
            .iter()
            .filter(|report| report.effective_bandwidth > 0.0)
            .max_by(|a, b| a.effective_bandwidth.total_cmp(&b.effective_bandwidth))
    }
}

/// Run every key of `config.sweep` and write `summary.csv` plus
/// `manifest.json` into `output_dir`.
///
/// Per-key failures end up in the reports; only configuration and output
/// errors are returned.
pub async fn run_sweep_into_dir(
    config: &BenchConfig,
    output_dir: &Path,
) -> Result<SweepResult, CovcapError> {
    config.validate()?;
    fs::create_dir_all(output_dir)?;

    let started_at = Utc::now().to_rfc3339();
    tracing::info!(keys = config.sweep.len(), runs_per_key = config.runs_per_key, "starting sweep");

    let mut orchestrator = ExperimentOrchestrator::new(config.clone());
    if let Some(err) = orchestrator.store().load_signal() {
        tracing::warn!(%err, "result document will be rebuilt");
    }
    let reports = orchestrator.run_batch(&config.sweep).await;

    write_summary_csv(&output_dir.join("summary.csv"), &reports)?;
    let manifest = Manifest {
        schema_version: OUTPUT_SCHEMA_VERSION.to_string(),
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        config: config.clone(),
        reports: reports.clone(),
    };
    write_manifest_json(output_dir, &manifest)?;

    let result = SweepResult {
        output_dir: output_dir.to_path_buf(),
        reports,
    };
    tracing::info!(
        aborted = result.aborted().count(),
        output_dir = %output_dir.display(),
        "sweep finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterKey;

    fn report(interval: u64, effective_bandwidth: f64, outcome: KeyOutcome) -> KeyReport {
        KeyReport {
            key: ParameterKey::new(interval, 1, 1),
            outcome,
            trials_run: 1,
            samples: 1,
            max_capacity: Some(0.5),
            raw_bandwidth: effective_bandwidth * 2.0,
            effective_bandwidth,
        }
    }

    #[test]
    fn best_ignores_zero_bandwidth_keys() {
        let result = SweepResult {
            output_dir: PathBuf::from("out"),
            reports: vec![
                report(1, 10.0, KeyOutcome::Measured),
                report(2, 40.0, KeyOutcome::Cached),
                report(
                    3,
                    0.0,
                    KeyOutcome::Aborted {
                        signal: "sender_timeout".to_string(),
                        reason: String::new(),
                    },
                ),
            ],
        };

        assert_eq!(result.best().map(|r| r.key.interval), Some(2));
        assert_eq!(result.aborted().count(), 1);
    }

    #[tokio::test]
    async fn invalid_config_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let outdir = dir.path().join("run");
        let config = BenchConfig {
            sweep: Vec::new(),
            ..BenchConfig::default()
        };

        let err = run_sweep_into_dir(&config, &outdir).await.unwrap_err();
        assert!(matches!(err, CovcapError::InvalidConfig(_)));
        assert!(!outdir.exists());
    }
}
