//! Per-bin descriptive statistics with symmetric count-based trimming.

use crate::error::{BiopoolError, Result};
use serde::{Deserialize, Serialize};

/// Mean magnitudes below this make CV undefined rather than explosive.
const NEAR_ZERO_MEAN: f64 = 1e-8;

/// Summary statistics for one bin's retained values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    /// Retained sample count (post-trim).
    pub n: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Sample standard deviation (ddof = 1); `None` below 2 values.
    pub std: Option<f64>,
    /// Median (linear interpolation).
    pub median: f64,
    /// First quartile.
    pub q1: f64,
    /// Third quartile.
    pub q3: f64,
    /// Sample skewness (third standardized moment); `None` below 3 values
    /// or at zero variance.
    pub skewness: Option<f64>,
    /// Coefficient of variation std/mean; `None` when std is undefined or
    /// the mean is (near) zero.
    pub cv: Option<f64>,
}

/// Validate a per-tail trim percentage.
pub fn validate_trim(trim_percent: f64) -> Result<()> {
    if !(0.0..=49.0).contains(&trim_percent) {
        return Err(BiopoolError::InvalidParameter(format!(
            "trim percent must be in [0, 49], got {}",
            trim_percent
        )));
    }
    Ok(())
}

/// Drop `trim_percent` of the distribution from each tail, by count.
///
/// The slice must be sorted ascending. `k = floor(n * trim/100)` values are
/// removed from each end; the retained window is returned.
pub fn symmetric_trim(sorted: &[f64], trim_percent: f64) -> &[f64] {
    let n = sorted.len();
    let k = (n as f64 * trim_percent / 100.0).floor() as usize;
    if 2 * k >= n {
        return &sorted[0..0];
    }
    &sorted[k..n - k]
}

/// Percentile of a sorted slice with linear interpolation between ranks.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Sort, trim, and summarize a bin's values. `None` when nothing survives
/// the trim.
pub fn summarize(values: &[f64], trim_percent: f64) -> Option<SummaryStats> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let retained = symmetric_trim(&sorted, trim_percent);
    if retained.is_empty() {
        return None;
    }

    let n = retained.len();
    let n_f = n as f64;
    let mean = retained.iter().sum::<f64>() / n_f;

    let std = if n >= 2 {
        let ss: f64 = retained.iter().map(|v| (v - mean).powi(2)).sum();
        Some((ss / (n_f - 1.0)).sqrt())
    } else {
        None
    };

    let skewness = if n >= 3 {
        let m2: f64 = retained.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n_f;
        let m3: f64 = retained.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / n_f;
        if m2 > 0.0 {
            Some(m3 / m2.powf(1.5))
        } else {
            None
        }
    } else {
        None
    };

    let cv = match std {
        Some(std) if mean.abs() >= NEAR_ZERO_MEAN => Some(std / mean),
        _ => None,
    };

    Some(SummaryStats {
        n,
        mean,
        std,
        median: percentile(retained, 50.0),
        q1: percentile(retained, 25.0),
        q3: percentile(retained, 75.0),
        skewness,
        cv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_trim_drops_one_per_tail() {
        // 20% of 6 values floors to 1 per tail.
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0, 100.0];
        let retained = symmetric_trim(&sorted, 20.0);
        assert_eq!(retained, &[2.0, 3.0, 4.0, 5.0]);

        let stats = summarize(&sorted, 20.0).unwrap();
        assert_eq!(stats.n, 4);
        assert_relative_eq!(stats.mean, 3.5);
    }

    #[test]
    fn test_zero_trim_keeps_all() {
        let values = [3.0, 1.0, 2.0, 5.0, 4.0];
        let stats = summarize(&values, 0.0).unwrap();
        assert_eq!(stats.n, 5);
        assert_relative_eq!(stats.mean, 3.0);
        assert_relative_eq!(stats.median, 3.0);
    }

    #[test]
    fn test_retained_count_monotone_in_trim() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let mut prev = usize::MAX;
        for trim in [0.0, 5.0, 10.0, 25.0, 40.0, 49.0] {
            let n = summarize(&values, trim).map(|s| s.n).unwrap_or(0);
            assert!(n <= prev, "trim {} retained {} > {}", trim, n, prev);
            prev = n;
        }
    }

    #[test]
    fn test_cv_missing_at_zero_mean() {
        let values = [-1.0, 0.0, 1.0];
        let stats = summarize(&values, 0.0).unwrap();
        assert_relative_eq!(stats.mean, 0.0);
        assert!(stats.std.is_some());
        assert!(stats.cv.is_none());
    }

    #[test]
    fn test_cv_formula() {
        let values = [10.0, 11.0, 9.0, 10.0, 10.0];
        let stats = summarize(&values, 0.0).unwrap();
        // Sample std of [10,11,9,10,10] with ddof 1.
        let expected_std = (2.0_f64 / 4.0).sqrt();
        assert_relative_eq!(stats.std.unwrap(), expected_std, epsilon = 1e-12);
        assert_relative_eq!(stats.cv.unwrap(), expected_std / 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_quartiles_linear_interpolation() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let stats = summarize(&values, 0.0).unwrap();
        assert_relative_eq!(stats.q1, 1.75);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.q3, 3.25);
    }

    #[test]
    fn test_skewness_sign() {
        let right_skewed = [1.0, 1.0, 1.0, 2.0, 10.0];
        let stats = summarize(&right_skewed, 0.0).unwrap();
        assert!(stats.skewness.unwrap() > 0.0);

        let symmetric = [1.0, 2.0, 3.0, 4.0, 5.0];
        let stats = summarize(&symmetric, 0.0).unwrap();
        assert_relative_eq!(stats.skewness.unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_skewness_undefined_small_n() {
        let stats = summarize(&[1.0, 2.0], 0.0).unwrap();
        assert!(stats.skewness.is_none());
        assert!(stats.std.is_some());
    }

    #[test]
    fn test_single_value() {
        let stats = summarize(&[4.2], 0.0).unwrap();
        assert_eq!(stats.n, 1);
        assert!(stats.std.is_none());
        assert!(stats.cv.is_none());
        assert_relative_eq!(stats.median, 4.2);
    }

    #[test]
    fn test_over_trim_returns_none() {
        // 49% per tail of 2 values floors to 0; but of 100 values
        // drops 49 + 49, retaining 2.
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let stats = summarize(&values, 49.0).unwrap();
        assert_eq!(stats.n, 2);
        assert_eq!(
            summarize(&[], 0.0),
            None
        );
    }

    #[test]
    fn test_validate_trim() {
        assert!(validate_trim(0.0).is_ok());
        assert!(validate_trim(49.0).is_ok());
        assert!(validate_trim(50.0).is_err());
        assert!(validate_trim(-1.0).is_err());
    }
}
