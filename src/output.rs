use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::Writer;
use serde::Serialize;

use crate::config::BenchConfig;
use crate::orchestrator::KeyReport;
use crate::CovcapError;

pub const OUTPUT_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub schema_version: String,
    pub started_at: String,
    pub finished_at: String,
    pub config: BenchConfig,
    pub reports: Vec<KeyReport>,
}

/// `<root>/<UTC timestamp>`, suffixed with a counter if that already exists.
pub fn create_timestamped_output_dir(output_root: &Path) -> Result<PathBuf, CovcapError> {
    fs::create_dir_all(output_root)?;

    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let mut output_dir = output_root.join(&timestamp);
    let mut counter = 1_u32;

    while output_dir.exists() {
        output_dir = output_root.join(format!("{timestamp}-{counter:02}"));
        counter += 1;
    }

    fs::create_dir_all(&output_dir)?;
    Ok(output_dir)
}

fn fmt_f64(value: f64) -> String {
    format!("{value:.10}")
}

fn fmt_option_f64(value: Option<f64>) -> String {
    value.map(fmt_f64).unwrap_or_default()
}

pub fn write_summary_csv(path: &Path, reports: &[KeyReport]) -> Result<(), CovcapError> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record([
        "interval",
        "prime_time",
        "access_time",
        "outcome",
        "trials_run",
        "samples",
        "max_capacity",
        "raw_bandwidth",
        "effective_bandwidth",
    ])?;

    for report in reports {
        writer.write_record([
            report.key.interval.to_string(),
            report.key.prime_time.to_string(),
            report.key.access_time.to_string(),
            report.outcome.label().to_string(),
            report.trials_run.to_string(),
            report.samples.to_string(),
            fmt_option_f64(report.max_capacity),
            fmt_f64(report.raw_bandwidth),
            fmt_f64(report.effective_bandwidth),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_manifest_json(outdir: &Path, manifest: &Manifest) -> Result<PathBuf, CovcapError> {
    let path = outdir.join("manifest.json");
    fs::write(&path, serde_json::to_string_pretty(manifest)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::KeyOutcome;
    use crate::params::ParameterKey;

    #[test]
    fn output_dirs_never_collide() {
        let root = tempfile::tempdir().unwrap();
        let first = create_timestamped_output_dir(root.path()).unwrap();
        let second = create_timestamped_output_dir(root.path()).unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir() && second.is_dir());
    }

    #[test]
    fn summary_has_one_row_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let reports = vec![
            KeyReport {
                key: ParameterKey::new(2_000_000, 800_000, 800_000),
                outcome: KeyOutcome::Measured,
                trials_run: 3,
                samples: 3,
                max_capacity: Some(0.75),
                raw_bandwidth: 400.0,
                effective_bandwidth: 300.0,
            },
            KeyReport {
                key: ParameterKey::new(1_000_000, 400_000, 400_000),
                outcome: KeyOutcome::Aborted {
                    signal: "receiver_timeout".to_string(),
                    reason: "receiver did not finish within 10 ms".to_string(),
                },
                trials_run: 1,
                samples: 0,
                max_capacity: None,
                raw_bandwidth: 0.0,
                effective_bandwidth: 0.0,
            },
        ];

        write_summary_csv(&path, &reports).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[1],
            "2000000,800000,800000,measured,3,3,0.7500000000,400.0000000000,300.0000000000"
        );
        assert!(lines[2].starts_with("1000000,400000,400000,receiver_timeout,1,0,,"));
    }
}
