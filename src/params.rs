//! Channel operating point
//!
//! A parameter key identifies one operating point of the channel under test
//! and doubles as the key of the persisted result document.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CovcapError;

/// Timing parameters for one channel operating point, in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterKey {
    /// Symbol interval
    pub interval: u64,
    /// Time the receiver spends priming the shared set
    pub prime_time: u64,
    /// Time the sender spends accessing the shared set
    pub access_time: u64,
}

impl ParameterKey {
    /// Create a new parameter key
    pub fn new(interval: u64, prime_time: u64, access_time: u64) -> Self {
        Self {
            interval,
            prime_time,
            access_time,
        }
    }

    /// Canonical string form used as the result document key.
    ///
    /// Field order is fixed: `[interval, prime_time, access_time]`.
    pub fn canonical(&self) -> String {
        format!(
            "[{}, {}, {}]",
            self.interval, self.prime_time, self.access_time
        )
    }

    /// Arguments passed to the sender and receiver binaries.
    pub fn channel_args(&self) -> [String; 6] {
        [
            "-i".to_string(),
            self.interval.to_string(),
            "-p".to_string(),
            self.prime_time.to_string(),
            "-a".to_string(),
            self.access_time.to_string(),
        ]
    }

    /// Nominal bitrate derived from a clock frequency, one symbol per interval.
    pub fn nominal_bitrate(&self, clock_hz: f64) -> f64 {
        if self.interval == 0 {
            return 0.0;
        }
        clock_hz / self.interval as f64
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for ParameterKey {
    type Err = CovcapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| CovcapError::InvalidKey(s.to_string()))?;

        let fields = inner
            .split(',')
            .map(|field| field.trim().parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| CovcapError::InvalidKey(s.to_string()))?;

        match fields.as_slice() {
            [interval, prime_time, access_time] => {
                Ok(Self::new(*interval, *prime_time, *access_time))
            }
            _ => Err(CovcapError::InvalidKey(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_has_fixed_field_order() {
        let key = ParameterKey::new(2_000_000, 800_000, 700_000);
        assert_eq!(key.canonical(), "[2000000, 800000, 700000]");
    }

    #[test]
    fn canonical_form_parses_back() {
        let key = ParameterKey::new(1_000_000, 400_000, 300_000);
        let parsed: ParameterKey = key.canonical().parse().unwrap();
        assert_eq!(parsed, key);

        let compact: ParameterKey = "[5,6,7]".parse().unwrap();
        assert_eq!(compact, ParameterKey::new(5, 6, 7));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for raw in ["", "[1, 2]", "1, 2, 3", "[1, 2, x]", "[1, 2, 3, 4]"] {
            assert!(matches!(
                raw.parse::<ParameterKey>(),
                Err(CovcapError::InvalidKey(_))
            ));
        }
    }

    #[test]
    fn nominal_bitrate_handles_zero_interval() {
        assert_eq!(ParameterKey::new(0, 1, 1).nominal_bitrate(2.3e9), 0.0);
        let rate = ParameterKey::new(2_300_000, 1, 1).nominal_bitrate(2.3e9);
        assert!((rate - 1000.0).abs() < 1e-9);
    }
}
