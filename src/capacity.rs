//! Channel capacity via Blahut–Arimoto iteration
//!
//! Alternates between the posterior `q(x|y)` induced by the current input
//! prior `r(x)` and the prior that maximizes mutual information for that
//! posterior, until the prior stops moving.

use serde::{Deserialize, Serialize};

use crate::matrix::TransitionMatrix;
use crate::CovcapError;

pub const DEFAULT_MAX_ITERATIONS: usize = 10_000;
pub const DEFAULT_TOLERANCE: f64 = 1.0e-5;

/// Result of one capacity estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityEstimate {
    /// Capacity in bits per channel symbol
    pub bits_per_symbol: f64,
    /// Rounds run before stopping
    pub iterations: usize,
    /// Whether the prior settled before the iteration ceiling
    pub converged: bool,
    /// Capacity-achieving input distribution
    pub input_distribution: Vec<f64>,
}

/// Blahut–Arimoto capacity estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityEstimator {
    /// Iteration ceiling
    pub max_iterations: usize,
    /// Convergence tolerance; the stopping distance is `tolerance / inputs`
    pub tolerance: f64,
}

impl Default for CapacityEstimator {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl CapacityEstimator {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }

    /// Estimate capacity from an `m x n` matrix of non-negative transition
    /// weights (raw counts or probabilities).
    ///
    /// # Errors
    /// `DegenerateChannel` if the matrix is empty or ragged, holds a negative
    /// or non-finite entry, or has a row or column summing to zero.
    pub fn estimate(&self, weights: &[Vec<f64>]) -> Result<CapacityEstimate, CovcapError> {
        let p = normalized_rows(weights)?;
        let m = p.len();
        let n = p[0].len();

        let epsilon = self.tolerance / m as f64;
        let mut r = vec![1.0 / m as f64; m];
        let mut q = vec![vec![0.0; n]; m];
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iterations {
            iterations += 1;
            update_posterior(&p, &r, &mut q);

            // r'(x) ∝ Π_y q(x|y)^p(y|x)
            let mut next: Vec<f64> = p
                .iter()
                .zip(&q)
                .map(|(p_row, q_row)| {
                    p_row
                        .iter()
                        .zip(q_row)
                        .map(|(&p_xy, &q_xy)| q_xy.powf(p_xy))
                        .product()
                })
                .collect();
            let total: f64 = next.iter().sum();
            if total <= 0.0 || !total.is_finite() {
                tracing::debug!(iterations, "prior update collapsed, keeping current prior");
                break;
            }
            for value in next.iter_mut() {
                *value /= total;
            }

            let distance = next
                .iter()
                .zip(&r)
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            if distance < epsilon {
                converged = true;
                break;
            }
            r = next;
        }

        if !converged {
            // keep q consistent with the prior the capacity is evaluated at
            update_posterior(&p, &r, &mut q);
            tracing::debug!(iterations, "iteration ceiling reached before convergence");
        }

        let mut capacity = 0.0;
        for i in 0..m {
            if r[i] <= 0.0 {
                continue;
            }
            for j in 0..n {
                if q[i][j] > 0.0 {
                    capacity += r[i] * p[i][j] * (q[i][j] / r[i]).log2();
                }
            }
        }

        Ok(CapacityEstimate {
            bits_per_symbol: capacity.max(0.0),
            iterations,
            converged,
            input_distribution: r,
        })
    }

    pub fn estimate_matrix(
        &self,
        matrix: &TransitionMatrix,
    ) -> Result<CapacityEstimate, CovcapError> {
        self.estimate(&matrix.to_rows())
    }

    /// Capacity of a binary transition matrix, clamped to 0 for degenerate
    /// channels. The degenerate signal is returned alongside the clamped value.
    pub fn capacity_or_zero(&self, matrix: &TransitionMatrix) -> (f64, Option<CovcapError>) {
        match self.estimate_matrix(matrix) {
            Ok(estimate) => (estimate.bits_per_symbol, None),
            Err(err) => {
                tracing::warn!(%err, counts = ?matrix.counts, "capacity undefined, reporting 0");
                (0.0, Some(err))
            }
        }
    }
}

fn normalized_rows(weights: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, CovcapError> {
    let n = weights.first().map_or(0, Vec::len);
    if n == 0 {
        return Err(CovcapError::DegenerateChannel {
            axis: "row",
            index: 0,
        });
    }

    for (i, row) in weights.iter().enumerate() {
        if row.len() != n || row.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(CovcapError::DegenerateChannel {
                axis: "row",
                index: i,
            });
        }
    }

    for j in 0..n {
        if weights.iter().map(|row| row[j]).sum::<f64>() == 0.0 {
            return Err(CovcapError::DegenerateChannel {
                axis: "column",
                index: j,
            });
        }
    }

    weights
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let sum: f64 = row.iter().sum();
            if sum == 0.0 {
                return Err(CovcapError::DegenerateChannel {
                    axis: "row",
                    index: i,
                });
            }
            Ok(row.iter().map(|v| v / sum).collect())
        })
        .collect()
}

/// q(x|y) = r(x) p(y|x) / Σ_x' r(x') p(y|x')
fn update_posterior(p: &[Vec<f64>], r: &[f64], q: &mut [Vec<f64>]) {
    let n = p[0].len();
    for j in 0..n {
        let mut column = 0.0;
        for i in 0..p.len() {
            q[i][j] = r[i] * p[i][j];
            column += q[i][j];
        }
        if column > 0.0 {
            for q_row in q.iter_mut() {
                q_row[j] /= column;
            }
        }
    }
}
