//! Persisted capacity samples per parameter key.
//!
//! The document is a JSON object mapping the canonical key string to the
//! ordered list of capacities measured for it:
//!
//! ```json
//! { "[2000000, 800000, 800000]": [0.91, 0.88, 0.93] }
//! ```
//!
//! The store is loaded lazily on first use and rewritten as a whole. Loading
//! never fails: an unreadable document is reported as `CorruptedCache`, kept
//! aside under a `.corrupt-<timestamp>` name on the next write, and replaced
//! by an empty store. A document older than any of the binaries under test is
//! still merged, but its samples do not count towards skipping trials.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;

use crate::config::BenchConfig;
use crate::params::ParameterKey;
use crate::CovcapError;

#[derive(Debug, Default)]
struct LoadedResults {
    results: BTreeMap<String, Vec<f64>>,
    /// Samples per key that came from a document older than the binaries
    stale: BTreeMap<String, usize>,
    fresh: bool,
    corrupted: Option<CovcapError>,
}

#[derive(Debug)]
pub struct ResultStore {
    path: PathBuf,
    binaries: Vec<PathBuf>,
    loaded: Option<LoadedResults>,
}

impl ResultStore {
    /// `binaries` are the executables whose modification time decides
    /// whether the stored samples are still current.
    pub fn new(path: impl Into<PathBuf>, binaries: Vec<PathBuf>) -> Self {
        Self {
            path: path.into(),
            binaries,
            loaded: None,
        }
    }

    pub fn from_config(config: &BenchConfig) -> Self {
        Self::new(
            config.result_path(),
            vec![config.sender_bin.clone(), config.receiver_bin.clone()],
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the persisted document was at least as new as every binary.
    pub fn is_fresh(&mut self) -> bool {
        self.state().fresh
    }

    /// The condition hit while loading, if the document was unreadable.
    pub fn load_signal(&mut self) -> Option<&CovcapError> {
        self.state().corrupted.as_ref()
    }

    pub fn samples(&mut self, key: &ParameterKey) -> &[f64] {
        self.state()
            .results
            .get(&key.canonical())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Current samples for `key`, if there are at least `threshold` of them.
    ///
    /// Samples loaded from a stale document are ignored.
    pub fn cached_samples(&mut self, key: &ParameterKey, threshold: usize) -> Option<Vec<f64>> {
        let canonical = key.canonical();
        let state = self.state();
        let samples = state.results.get(&canonical)?;
        let stale = state.stale.get(&canonical).copied().unwrap_or(0);

        let current = &samples[stale.min(samples.len())..];
        (current.len() >= threshold).then(|| current.to_vec())
    }

    pub fn max_capacity(&mut self, key: &ParameterKey) -> Option<f64> {
        self.samples(key).iter().copied().reduce(f64::max)
    }

    /// Append one capacity sample. Existing samples are never touched.
    pub fn append(&mut self, key: &ParameterKey, capacity: f64) {
        self.state()
            .results
            .entry(key.canonical())
            .or_default()
            .push(capacity);
    }

    pub fn len(&mut self) -> usize {
        self.state().results.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.state().results.is_empty()
    }

    pub fn keys(&mut self) -> Vec<String> {
        self.state().results.keys().cloned().collect()
    }

    /// Rewrite the whole document, flushing it to disk before returning.
    pub fn persist(&mut self) -> Result<(), CovcapError> {
        let path = self.path.clone();
        let state = self.state();

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        if state.corrupted.is_some() && path.exists() {
            let backup = corrupt_backup_path(&path);
            fs::rename(&path, &backup)?;
            tracing::warn!(backup = %backup.display(), "kept unreadable result document aside");
            state.corrupted = None;
        }

        let payload = serde_json::to_string_pretty(&state.results)?;
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(payload.as_bytes())?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        tracing::debug!(path = %path.display(), keys = state.results.len(), "persisted result store");
        Ok(())
    }

    fn state(&mut self) -> &mut LoadedResults {
        if self.loaded.is_none() {
            self.loaded = Some(self.load());
        }
        self.loaded.get_or_insert_with(LoadedResults::default)
    }

    fn load(&self) -> LoadedResults {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no result document yet");
                return LoadedResults::default();
            }
            Err(err) => return self.corrupted(err.to_string()),
        };

        let results: BTreeMap<String, Vec<f64>> = match serde_json::from_str(&raw) {
            Ok(results) => results,
            Err(err) => return self.corrupted(err.to_string()),
        };

        let fresh = self.document_is_current();
        let stale = if fresh {
            BTreeMap::new()
        } else {
            tracing::info!(
                path = %self.path.display(),
                "result document predates the binaries, merging without reusing samples"
            );
            results
                .iter()
                .map(|(key, samples)| (key.clone(), samples.len()))
                .collect()
        };

        tracing::debug!(path = %self.path.display(), keys = results.len(), fresh, "loaded result store");
        LoadedResults {
            results,
            stale,
            fresh,
            corrupted: None,
        }
    }

    fn corrupted(&self, reason: String) -> LoadedResults {
        let err = CovcapError::CorruptedCache {
            path: self.path.clone(),
            reason,
        };
        tracing::warn!(%err, "continuing with an empty result store");
        LoadedResults {
            corrupted: Some(err),
            ..LoadedResults::default()
        }
    }

    fn document_is_current(&self) -> bool {
        let Some(document) = modified(&self.path) else {
            return false;
        };
        self.binaries
            .iter()
            .filter_map(|binary| modified(binary))
            .all(|binary| binary <= document)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string());

    let mut backup = path.with_file_name(format!("{name}.corrupt-{stamp}"));
    let mut counter = 1_u32;
    while backup.exists() {
        backup = path.with_file_name(format!("{name}.corrupt-{stamp}-{counter:02}"));
        counter += 1;
    }
    backup
}
