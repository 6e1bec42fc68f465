use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::capacity::{CapacityEstimator, DEFAULT_MAX_ITERATIONS, DEFAULT_TOLERANCE};
use crate::params::ParameterKey;
use crate::CovcapError;

pub const DEFAULT_CONFIG_FILE: &str = "covcap.toml";

/// Convergence settings for the Blahut–Arimoto estimator
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    #[serde_as(as = "DefaultOnNull")]
    pub max_iterations: usize,
    #[serde_as(as = "DefaultOnNull")]
    pub tolerance: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl From<EstimatorConfig> for CapacityEstimator {
    fn from(config: EstimatorConfig) -> Self {
        CapacityEstimator::new(config.max_iterations, config.tolerance)
    }
}

/// Everything the orchestrator needs to run trials: binaries, directories,
/// timing, affinity, and the sweep itself.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    #[serde_as(as = "DefaultOnNull")]
    pub sender_bin: PathBuf,
    #[serde_as(as = "DefaultOnNull")]
    pub receiver_bin: PathBuf,
    /// Per-trial log directory, wiped once per parameter key
    #[serde_as(as = "DefaultOnNull")]
    pub scratch_dir: PathBuf,
    #[serde_as(as = "DefaultOnNull")]
    pub results_dir: PathBuf,
    #[serde_as(as = "DefaultOnNull")]
    pub result_file: String,
    #[serde_as(as = "DefaultOnNull")]
    pub ledger_file: String,
    #[serde_as(as = "DefaultOnNull")]
    pub sender_log: String,
    #[serde_as(as = "DefaultOnNull")]
    pub receiver_log: String,
    #[serde_as(as = "DefaultOnNull")]
    pub runs_per_key: usize,
    #[serde_as(as = "DefaultOnNull")]
    pub cool_down_ms: u64,
    #[serde_as(as = "DefaultOnNull")]
    pub sender_timeout_ms: u64,
    #[serde_as(as = "DefaultOnNull")]
    pub receiver_timeout_ms: u64,
    #[serde_as(as = "DefaultOnNull")]
    pub sender_core: usize,
    #[serde_as(as = "DefaultOnNull")]
    pub receiver_core: usize,
    /// Launcher used to pin a process to a core; `None` runs binaries directly
    pub affinity_program: Option<String>,
    #[serde_as(as = "DefaultOnNull")]
    pub benchmark_flag: String,
    #[serde_as(as = "DefaultOnNull")]
    pub library_path_var: String,
    /// Cached samples needed before a key's trials are skipped
    #[serde_as(as = "DefaultOnNull")]
    pub skip_threshold: usize,
    /// Clock used for the nominal bitrate when no observed bitrate exists
    #[serde_as(as = "DefaultOnNull")]
    pub nominal_clock_hz: f64,
    #[serde_as(as = "DefaultOnNull")]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub sweep: Vec<ParameterKey>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            sender_bin: PathBuf::from("pp-llc-send"),
            receiver_bin: PathBuf::from("pp-llc-recv"),
            scratch_dir: PathBuf::from("data"),
            results_dir: PathBuf::from("llc-results"),
            result_file: "llc-pp.json".to_string(),
            ledger_file: "trials.csv".to_string(),
            sender_log: "senderSave".to_string(),
            receiver_log: "receiverSave".to_string(),
            runs_per_key: 10,
            cool_down_ms: 1_000,
            sender_timeout_ms: 120_000,
            receiver_timeout_ms: 10_000,
            sender_core: 2,
            receiver_core: 0,
            affinity_program: Some("taskset".to_string()),
            benchmark_flag: "-b".to_string(),
            library_path_var: "LD_LIBRARY_PATH".to_string(),
            skip_threshold: 3,
            nominal_clock_hz: 2.3e9,
            estimator: EstimatorConfig::default(),
            sweep: vec![
                ParameterKey::new(2_000_000, 800_000, 800_000),
                ParameterKey::new(1_000_000, 400_000, 400_000),
            ],
        }
    }
}

impl BenchConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, CovcapError> {
        let raw = fs::read_to_string(path)?;
        let config: BenchConfig = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Explicit path, else `covcap.toml` in the working directory, else the
    /// built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, CovcapError> {
        if let Some(path) = path {
            return Self::from_toml_file(path);
        }

        let cwd_config = PathBuf::from(DEFAULT_CONFIG_FILE);
        if cwd_config.exists() {
            return Self::from_toml_file(&cwd_config);
        }

        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), CovcapError> {
        if self.sweep.is_empty() {
            return Err(CovcapError::InvalidConfig(
                "sweep must contain at least one parameter key".to_string(),
            ));
        }

        if self.runs_per_key == 0 {
            return Err(CovcapError::InvalidConfig(
                "runs_per_key must be greater than zero".to_string(),
            ));
        }

        if self.sender_timeout_ms == 0 || self.receiver_timeout_ms == 0 {
            return Err(CovcapError::InvalidConfig(
                "sender_timeout_ms and receiver_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.skip_threshold == 0 {
            return Err(CovcapError::InvalidConfig(
                "skip_threshold must be greater than zero".to_string(),
            ));
        }

        if self.estimator.max_iterations == 0 {
            return Err(CovcapError::InvalidConfig(
                "estimator.max_iterations must be greater than zero".to_string(),
            ));
        }

        if !self.estimator.tolerance.is_finite() || self.estimator.tolerance <= 0.0 {
            return Err(CovcapError::InvalidConfig(
                "estimator.tolerance must be finite and positive".to_string(),
            ));
        }

        if !self.nominal_clock_hz.is_finite() || self.nominal_clock_hz <= 0.0 {
            return Err(CovcapError::InvalidConfig(
                "nominal_clock_hz must be finite and positive".to_string(),
            ));
        }

        if self.affinity_program.is_some() && self.sender_core == self.receiver_core {
            return Err(CovcapError::InvalidConfig(
                "sender_core and receiver_core must differ when pinning is enabled".to_string(),
            ));
        }

        for (name, value) in [
            ("result_file", &self.result_file),
            ("ledger_file", &self.ledger_file),
            ("sender_log", &self.sender_log),
            ("receiver_log", &self.receiver_log),
        ] {
            if value.is_empty() {
                return Err(CovcapError::InvalidConfig(format!("{name} must not be empty")));
            }
        }

        Ok(())
    }

    /// Resolve every relative path against `base`.
    pub fn rebased(mut self, base: &Path) -> Self {
        for path in [
            &mut self.sender_bin,
            &mut self.receiver_bin,
            &mut self.scratch_dir,
            &mut self.results_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        self
    }

    pub fn result_path(&self) -> PathBuf {
        self.results_dir.join(&self.result_file)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.results_dir.join(&self.ledger_file)
    }

    pub fn sender_log_path(&self) -> PathBuf {
        self.scratch_dir.join(&self.sender_log)
    }

    pub fn receiver_log_path(&self) -> PathBuf {
        self.scratch_dir.join(&self.receiver_log)
    }

    /// Directory holding the binaries, appended to the library search path.
    pub fn library_dir(&self) -> PathBuf {
        self.sender_bin
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    pub fn sender_timeout(&self) -> Duration {
        Duration::from_millis(self.sender_timeout_ms)
    }

    pub fn receiver_timeout(&self) -> Duration {
        Duration::from_millis(self.receiver_timeout_ms)
    }

    pub fn capacity_estimator(&self) -> CapacityEstimator {
        self.estimator.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BenchConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let raw = r#"
            runs_per_key = 4
            cool_down_ms = 5

            [estimator]
            tolerance = 1e-7

            [[sweep]]
            interval = 3000
            prime_time = 1000
            access_time = 900
        "#;
        let config: BenchConfig = toml::from_str(raw).unwrap();

        assert_eq!(config.runs_per_key, 4);
        assert_eq!(config.cool_down(), Duration::from_millis(5));
        assert_eq!(config.estimator.tolerance, 1e-7);
        assert_eq!(config.estimator.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(config.sweep, vec![ParameterKey::new(3000, 1000, 900)]);
        assert_eq!(config.skip_threshold, 3);
        config.validate().unwrap();
    }

    #[test]
    fn config_file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        fs::write(&path, "runs_per_key = 2\nskip_threshold = 5\n").unwrap();

        let config = BenchConfig::load(Some(&path)).unwrap();
        assert_eq!(config.runs_per_key, 2);
        assert_eq!(config.skip_threshold, 5);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let cases: [fn(&mut BenchConfig); 9] = [
            |c| c.sweep.clear(),
            |c| c.runs_per_key = 0,
            |c| c.receiver_timeout_ms = 0,
            |c| c.skip_threshold = 0,
            |c| c.estimator.max_iterations = 0,
            |c| c.estimator.tolerance = f64::NAN,
            |c| c.nominal_clock_hz = 0.0,
            |c| c.receiver_core = c.sender_core,
            |c| c.sender_log.clear(),
        ];

        for mutate in cases {
            let mut config = BenchConfig::default();
            mutate(&mut config);
            assert!(matches!(
                config.validate(),
                Err(CovcapError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn same_core_is_fine_without_pinning() {
        let config = BenchConfig {
            affinity_program: None,
            sender_core: 1,
            receiver_core: 1,
            ..BenchConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn rebased_only_touches_relative_paths() {
        let config = BenchConfig {
            results_dir: PathBuf::from("/var/lib/covcap"),
            ..BenchConfig::default()
        }
        .rebased(Path::new("/opt/bench"));

        assert_eq!(config.sender_bin, PathBuf::from("/opt/bench/pp-llc-send"));
        assert_eq!(config.scratch_dir, PathBuf::from("/opt/bench/data"));
        assert_eq!(config.results_dir, PathBuf::from("/var/lib/covcap"));
        assert_eq!(config.library_dir(), PathBuf::from("/opt/bench"));
        assert_eq!(
            config.result_path(),
            PathBuf::from("/var/lib/covcap/llc-pp.json")
        );
    }

    #[test]
    fn bare_binary_name_uses_current_dir_for_libraries() {
        assert_eq!(BenchConfig::default().library_dir(), PathBuf::from("."));
    }
}
