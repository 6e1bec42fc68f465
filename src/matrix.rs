//! Empirical binary channel transition matrix
//!
//! Counts how often each sent bit was observed as each received bit.

use serde::{Deserialize, Serialize};

use crate::samples::SampleLog;
use crate::CovcapError;

/// 2x2 transition counts, indexed `counts[sent][received]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionMatrix {
    pub counts: [[u64; 2]; 2],
}

impl TransitionMatrix {
    pub fn new(counts: [[u64; 2]; 2]) -> Self {
        Self { counts }
    }

    /// All-zero matrix reported for unusable log pairs
    pub fn zero() -> Self {
        Self::default()
    }

    /// Count every paired symbol of the two logs.
    ///
    /// A length mismatch is reported before emptiness, so an empty log paired
    /// with a non-empty one is a `DataMismatch`.
    pub fn from_logs(sent: &SampleLog, received: &SampleLog) -> Result<Self, CovcapError> {
        if sent.len() != received.len() {
            return Err(CovcapError::DataMismatch {
                sent: sent.len(),
                received: received.len(),
            });
        }
        if sent.is_empty() {
            return Err(CovcapError::NoData);
        }

        let mut matrix = Self::zero();
        for (&s, &r) in sent.bits().iter().zip(received.bits()) {
            matrix.counts[usize::from(s)][usize::from(r)] += 1;
        }
        Ok(matrix)
    }

    /// Like [`from_logs`](Self::from_logs), but falls back to the zero matrix
    /// and hands the failure back to the caller alongside it.
    pub fn from_logs_or_zero(
        sent: &SampleLog,
        received: &SampleLog,
    ) -> (Self, Option<CovcapError>) {
        match Self::from_logs(sent, received) {
            Ok(matrix) => (matrix, None),
            Err(err) => {
                tracing::warn!(%err, "unusable log pair, using zero transition matrix");
                (Self::zero(), Some(err))
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn row_sums(&self) -> [u64; 2] {
        [
            self.counts[0][0] + self.counts[0][1],
            self.counts[1][0] + self.counts[1][1],
        ]
    }

    pub fn column_sums(&self) -> [u64; 2] {
        [
            self.counts[0][0] + self.counts[1][0],
            self.counts[0][1] + self.counts[1][1],
        ]
    }

    /// True when some row or column has no observations.
    pub fn is_degenerate(&self) -> bool {
        self.row_sums().contains(&0) || self.column_sums().contains(&0)
    }

    /// Fraction of symbols received as sent.
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.counts[0][0] + self.counts[1][1]) as f64 / total as f64
    }

    /// Counts as floating-point rows, ready for capacity estimation.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.counts
            .iter()
            .map(|row| row.iter().map(|&c| c as f64).collect())
            .collect()
    }
}
