//! Per-trial bit logs written by the sender and receiver.
//!
//! One line per symbol, `"<index> <value>"` with value 0 or 1.

use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::CovcapError;

/// Ordered sequence of observed bits for one side of the channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleLog {
    bits: Vec<bool>,
}

impl SampleLog {
    pub fn new(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    /// Build a log from 0/1 values; any non-zero value counts as a 1.
    pub fn from_bits(bits: &[u8]) -> Self {
        Self {
            bits: bits.iter().map(|&b| b != 0).collect(),
        }
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Read a log file. A missing file yields an empty log.
    pub fn read_from_path(path: &Path) -> Result<Self, CovcapError> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "log file missing, treating as empty");
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };

        let mut bits = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let value = line
                .split_whitespace()
                .nth(1)
                .and_then(parse_bit)
                .ok_or_else(|| CovcapError::MalformedLog {
                    path: path.to_path_buf(),
                    line: idx + 1,
                })?;
            bits.push(value);
        }

        Ok(Self { bits })
    }

    pub fn write_to_path(&self, path: &Path) -> Result<(), CovcapError> {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        for (idx, &bit) in self.bits.iter().enumerate() {
            writeln!(writer, "{idx} {}", u8::from(bit))?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn parse_bit(token: &str) -> Option<bool> {
    match token {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("senderSave");
        let log = SampleLog::from_bits(&[0, 1, 1, 0, 1]);

        log.write_to_path(&path).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "0 0\n1 1\n2 1\n3 0\n4 1\n");

        assert_eq!(SampleLog::read_from_path(&path).unwrap(), log);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = SampleLog::read_from_path(&dir.path().join("absent")).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receiverSave");
        fs::write(&path, "0 1\n\n1 0\n").unwrap();

        let log = SampleLog::read_from_path(&path).unwrap();
        assert_eq!(log.bits(), &[true, false]);
    }

    #[test]
    fn out_of_range_value_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receiverSave");
        fs::write(&path, "0 1\n1 2\n").unwrap();

        match SampleLog::read_from_path(&path) {
            Err(CovcapError::MalformedLog { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected MalformedLog, got {other:?}"),
        }
    }

    #[test]
    fn missing_value_column_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("senderSave");
        fs::write(&path, "0\n").unwrap();

        assert!(matches!(
            SampleLog::read_from_path(&path),
            Err(CovcapError::MalformedLog { line: 1, .. })
        ));
    }
}
