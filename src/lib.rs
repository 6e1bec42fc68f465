//! covcap - covert channel capacity estimation
//!
//! Drives a cooperating sender/receiver pair over a timing side channel for a
//! sweep of operating points, turns the recorded bit logs into an empirical
//! transition matrix, and estimates channel capacity with the
//! Blahut–Arimoto algorithm. Per-operating-point capacities are cached in a
//! resumable result store so physical trials are never silently repeated.

pub mod capacity;
pub mod config;
pub mod ledger;
pub mod matrix;
pub mod orchestrator;
pub mod output;
pub mod params;
pub mod process;
pub mod samples;
pub mod store;
pub mod sweep;
pub mod synthetic;

use std::path::PathBuf;

use thiserror::Error;

// Re-export main types
pub use capacity::{CapacityEstimate, CapacityEstimator};
pub use config::{BenchConfig, EstimatorConfig};
pub use ledger::{TrialLedger, TrialRecord};
pub use matrix::TransitionMatrix;
pub use orchestrator::{ExperimentOrchestrator, KeyOutcome, KeyReport};
pub use output::create_timestamped_output_dir;
pub use params::ParameterKey;
pub use samples::SampleLog;
pub use store::ResultStore;
pub use sweep::{run_sweep_into_dir, SweepResult};

#[derive(Debug, Error)]
pub enum CovcapError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid parameter key: {0}")]
    InvalidKey(String),

    #[error("sender/receiver log length mismatch: sent {sent}, received {received}")]
    DataMismatch { sent: usize, received: usize },
    #[error("sender or receiver log is empty")]
    NoData,
    #[error("transition matrix has a zero {axis} at index {index}")]
    DegenerateChannel { axis: &'static str, index: usize },
    #[error("result document {path} is unreadable: {reason}")]
    CorruptedCache { path: PathBuf, reason: String },
    #[error("receiver did not finish within {timeout_ms} ms")]
    ReceiverTimeout { timeout_ms: u64 },
    #[error("sender did not finish within {timeout_ms} ms")]
    SenderTimeout { timeout_ms: u64 },
    #[error("receiver output is malformed: {0}")]
    MalformedReceiverOutput(String),
    #[error("{path}:{line}: malformed log line")]
    MalformedLog { path: PathBuf, line: usize },
}

impl CovcapError {
    /// Short tag used in the trial ledger and sweep summary.
    pub fn signal(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Csv(_) => "csv",
            Self::Json(_) => "json",
            Self::Toml(_) => "toml",
            Self::InvalidConfig(_) => "invalid_config",
            Self::InvalidKey(_) => "invalid_key",
            Self::DataMismatch { .. } => "data_mismatch",
            Self::NoData => "no_data",
            Self::DegenerateChannel { .. } => "degenerate_channel",
            Self::CorruptedCache { .. } => "corrupted_cache",
            Self::ReceiverTimeout { .. } => "receiver_timeout",
            Self::SenderTimeout { .. } => "sender_timeout",
            Self::MalformedReceiverOutput(_) => "malformed_receiver_output",
            Self::MalformedLog { .. } => "malformed_log",
        }
    }

    /// Whether the condition only zeroes the current trial's capacity rather
    /// than aborting the remaining trials of the parameter key.
    pub fn is_trial_local(&self) -> bool {
        matches!(
            self,
            Self::DataMismatch { .. } | Self::NoData | Self::DegenerateChannel { .. }
        )
    }
}
