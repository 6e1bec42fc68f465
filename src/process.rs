//! Sender/receiver process plumbing.
//!
//! Both binaries are invoked as
//! `[affinity -c <core>] <binary> <benchmark flag> -i <interval> -p <prime> -a <access>`
//! with the scratch directory as working directory and the binaries' directory
//! appended to the library search path.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::BenchConfig;
use crate::params::ParameterKey;
use crate::CovcapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Builds and spawns the sender/receiver commands for a parameter key.
#[derive(Debug, Clone)]
pub struct ChannelLauncher {
    sender_bin: PathBuf,
    receiver_bin: PathBuf,
    sender_core: usize,
    receiver_core: usize,
    affinity_program: Option<String>,
    benchmark_flag: String,
    library_path_var: String,
    library_dir: PathBuf,
    working_dir: PathBuf,
}

impl ChannelLauncher {
    /// Relative binary and scratch paths are resolved against the current
    /// directory, since the children run inside the scratch directory.
    pub fn from_config(config: &BenchConfig) -> Self {
        let config = match std::env::current_dir() {
            Ok(cwd) => config.clone().rebased(&cwd),
            Err(err) => {
                tracing::warn!(%err, "could not resolve the current directory, using paths as configured");
                config.clone()
            }
        };

        Self {
            sender_bin: config.sender_bin.clone(),
            receiver_bin: config.receiver_bin.clone(),
            sender_core: config.sender_core,
            receiver_core: config.receiver_core,
            affinity_program: config.affinity_program.clone(),
            benchmark_flag: config.benchmark_flag.clone(),
            library_path_var: config.library_path_var.clone(),
            library_dir: config.library_dir(),
            working_dir: config.scratch_dir.clone(),
        }
    }

    pub fn command(&self, role: Role, key: &ParameterKey) -> Command {
        let (binary, core) = match role {
            Role::Sender => (&self.sender_bin, self.sender_core),
            Role::Receiver => (&self.receiver_bin, self.receiver_core),
        };

        let mut cmd = match &self.affinity_program {
            Some(program) => {
                let mut cmd = std::process::Command::new(program);
                cmd.arg("-c").arg(core.to_string()).arg(binary);
                cmd
            }
            None => std::process::Command::new(binary),
        };

        if !self.benchmark_flag.is_empty() {
            cmd.arg(&self.benchmark_flag);
        }
        cmd.args(key.channel_args())
            .current_dir(&self.working_dir)
            .env(
                &self.library_path_var,
                library_search_path(std::env::var_os(&self.library_path_var), &self.library_dir),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd
    }

}

/// Starts one side of the channel for a parameter key.
pub trait ChannelSpawner {
    fn spawn(&self, role: Role, key: &ParameterKey) -> Result<CollectedChild, CovcapError>;
}

impl ChannelSpawner for ChannelLauncher {
    fn spawn(&self, role: Role, key: &ParameterKey) -> Result<CollectedChild, CovcapError> {
        let mut cmd = self.command(role, key);
        tracing::debug!(%role, cmd = ?cmd.as_std(), "spawning");
        Ok(CollectedChild::new(role, cmd.spawn()?))
    }
}

/// Append `dir` to an existing `:`-separated search path.
pub fn library_search_path(existing: Option<OsString>, dir: &Path) -> OsString {
    match existing {
        Some(mut value) if !value.is_empty() => {
            value.push(":");
            value.push(dir.as_os_str());
            value
        }
        _ => dir.as_os_str().to_os_string(),
    }
}

/// A spawned child whose output is collected in the background, so its pipes
/// never fill while the control loop waits on something else.
///
/// Dropping it kills the child.
#[derive(Debug)]
pub struct CollectedChild {
    role: Role,
    handle: JoinHandle<std::io::Result<Output>>,
}

impl CollectedChild {
    pub fn new(role: Role, child: Child) -> Self {
        Self {
            role,
            handle: tokio::spawn(child.wait_with_output()),
        }
    }

    /// Wait for the child to exit, killing it once `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<Output, CovcapError> {
        let role = self.role;
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(output)) => {
                let output = output?;
                if !output.status.success() {
                    tracing::warn!(
                        %role,
                        status = %output.status,
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "exited unsuccessfully"
                    );
                }
                Ok(output)
            }
            Ok(Err(join_err)) => Err(std::io::Error::other(join_err).into()),
            Err(_) => {
                let timeout_ms = duration_ms(timeout);
                tracing::warn!(%role, timeout_ms, "did not exit in time, killing");
                Err(match role {
                    Role::Sender => CovcapError::SenderTimeout { timeout_ms },
                    Role::Receiver => CovcapError::ReceiverTimeout { timeout_ms },
                })
            }
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Drop for CollectedChild {
    fn drop(&mut self) {
        // dropping the collector future drops the child, which kills it
        self.handle.abort();
    }
}

/// Totals printed by the receiver at the end of a benchmark run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReport {
    /// Bits successfully decoded
    pub bits: u64,
    /// Elapsed time in nanoseconds
    pub elapsed_ns: u64,
}

impl ReceiverReport {
    /// The fourth-from-last whitespace token is the bit count and the last is
    /// the elapsed time; anything before them is ignored.
    pub fn parse(output: &str) -> Result<Self, CovcapError> {
        let tokens: Vec<&str> = output.split_whitespace().collect();
        if tokens.len() < 4 {
            return Err(CovcapError::MalformedReceiverOutput(format!(
                "expected at least 4 tokens, got {}",
                tokens.len()
            )));
        }

        let field = |token: &str, name: &str| {
            token.parse::<u64>().map_err(|_| {
                CovcapError::MalformedReceiverOutput(format!("{name} token {token:?} is not an integer"))
            })
        };

        Ok(Self {
            bits: field(tokens[tokens.len() - 4], "bit count")?,
            elapsed_ns: field(tokens[tokens.len() - 1], "elapsed time")?,
        })
    }

    /// Observed bits per second; zero when the interval or elapsed time is zero.
    pub fn raw_bandwidth(&self, key: &ParameterKey) -> f64 {
        if key.interval == 0 || self.elapsed_ns == 0 {
            return 0.0;
        }
        self.bits as f64 * 1e9 / self.elapsed_ns as f64
    }
}
