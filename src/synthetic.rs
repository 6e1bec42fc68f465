//! Seeded synthetic channels with a known capacity.
//!
//! Used to check the log → matrix → capacity pipeline without the physical
//! sender/receiver pair.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Bernoulli, Distribution};
use serde::Serialize;

use crate::capacity::CapacityEstimator;
use crate::matrix::TransitionMatrix;
use crate::samples::SampleLog;
use crate::CovcapError;

/// `H2(p)` in bits.
pub fn binary_entropy(p: f64) -> f64 {
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    -p * p.log2() - (1.0 - p) * (1.0 - p).log2()
}

/// Uniform random sent bits and their copy after independent flips with
/// probability `crossover`.
pub fn binary_symmetric_logs(
    n: usize,
    crossover: f64,
    seed: u64,
) -> Result<(SampleLog, SampleLog), CovcapError> {
    let flip = Bernoulli::new(crossover).map_err(|err| {
        CovcapError::InvalidConfig(format!("crossover {crossover} is not a probability: {err}"))
    })?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut sent = Vec::with_capacity(n);
    let mut received = Vec::with_capacity(n);
    for _ in 0..n {
        let bit: bool = rng.gen();
        sent.push(bit);
        received.push(bit ^ flip.sample(&mut rng));
    }

    Ok((SampleLog::new(sent), SampleLog::new(received)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelfCheckRow {
    pub crossover: f64,
    pub counts: [[u64; 2]; 2],
    pub estimated: f64,
    /// `1 - H2(empirical crossover)`
    pub expected: f64,
    pub iterations: usize,
}

impl SelfCheckRow {
    pub fn abs_error(&self) -> f64 {
        (self.estimated - self.expected).abs()
    }
}

/// Estimate capacity for a synthetic BSC at each crossover and compare it to
/// the closed form evaluated at the crossover actually realised in the logs.
pub fn self_check(
    estimator: &CapacityEstimator,
    n: usize,
    seed: u64,
    crossovers: &[f64],
) -> Result<Vec<SelfCheckRow>, CovcapError> {
    let mut rows = Vec::with_capacity(crossovers.len());
    for (idx, &crossover) in crossovers.iter().enumerate() {
        let (sent, received) = binary_symmetric_logs(n, crossover, seed.wrapping_add(idx as u64))?;
        let matrix = TransitionMatrix::from_logs(&sent, &received)?;
        let (estimated, iterations) = match estimator.estimate_matrix(&matrix) {
            Ok(estimate) => (estimate.bits_per_symbol, estimate.iterations),
            Err(err) if err.is_trial_local() => (0.0, 0),
            Err(err) => return Err(err),
        };

        let [[_, n01], [n10, _]] = matrix.counts;
        let realised = (n01 + n10) as f64 / matrix.total() as f64;
        rows.push(SelfCheckRow {
            crossover,
            counts: matrix.counts,
            estimated,
            expected: 1.0 - binary_entropy(realised),
            iterations,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn entropy_endpoints_and_peak() {
        assert_eq!(binary_entropy(0.0), 0.0);
        assert_eq!(binary_entropy(1.0), 0.0);
        assert_abs_diff_eq!(binary_entropy(0.5), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(binary_entropy(0.11), binary_entropy(0.89), epsilon = 1e-12);
    }

    #[test]
    fn logs_are_reproducible_from_the_seed() {
        let a = binary_symmetric_logs(256, 0.2, 7).unwrap();
        let b = binary_symmetric_logs(256, 0.2, 7).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 256);
    }

    #[test]
    fn noiseless_channel_copies_the_input() {
        let (sent, received) = binary_symmetric_logs(500, 0.0, 1).unwrap();
        assert_eq!(sent, received);
    }

    #[test]
    fn crossover_outside_unit_interval_is_rejected() {
        assert!(matches!(
            binary_symmetric_logs(10, 1.5, 0),
            Err(CovcapError::InvalidConfig(_))
        ));
    }

    #[test]
    fn estimates_track_the_closed_form() {
        let estimator = CapacityEstimator::new(10_000, 1e-9);
        let rows = self_check(&estimator, 20_000, 42, &[0.0, 0.05, 0.2]).unwrap();

        assert_eq!(rows.len(), 3);
        assert_abs_diff_eq!(rows[0].estimated, 1.0, epsilon = 1e-6);
        for row in &rows {
            assert!(row.abs_error() < 5e-3, "{row:?}");
        }
    }

    #[test]
    fn inverting_channel_is_still_noiseless() {
        let rows = self_check(&CapacityEstimator::default(), 2_000, 3, &[1.0, 0.5]).unwrap();
        assert_eq!(rows[0].counts[0][0], 0);
        assert_eq!(rows[0].counts[1][1], 0);
        assert_abs_diff_eq!(rows[0].estimated, 1.0, epsilon = 1e-4);
        assert!(rows[1].estimated < 0.01);
    }
}
