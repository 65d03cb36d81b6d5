//! Trend metrics: rank correlation of a per-bin statistic against age.

use crate::metrics::{AgeBinStat, SexCohort, StatisticKind};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Minimum eligible bins for the significance-based trend flag.
pub const MIN_TREND_BINS: usize = 5;

/// Spearman rank correlation result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spearman {
    pub rho: f64,
    /// Two-sided p-value from the t approximation; `None` below 3 points.
    pub p_value: Option<f64>,
}

/// Average ranks with ties sharing their mean rank.
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        // Ranks are 1-based; tied values share the mean rank.
        let mean_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = mean_rank;
        }
        i = j + 1;
    }
    ranks
}

fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some(sxy / (sxx * syy).sqrt())
}

/// Spearman rank correlation with average-rank tie handling.
///
/// `None` below 2 points or when either side is constant. The p-value uses
/// the t approximation `t = rho * sqrt((n-2)/(1-rho^2))` on n-2 degrees of
/// freedom, the same approximation the reference scientific stacks apply.
pub fn spearman(x: &[f64], y: &[f64]) -> Option<Spearman> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let rx = average_ranks(x);
    let ry = average_ranks(y);
    let rho = pearson(&rx, &ry)?;

    let n = x.len();
    let p_value = if n < 3 {
        None
    } else if rho.abs() >= 1.0 - 1e-12 {
        Some(0.0)
    } else {
        let df = (n - 2) as f64;
        let t = rho * (df / (1.0 - rho * rho)).sqrt();
        StudentsT::new(0.0, 1.0, df)
            .ok()
            .map(|dist| 2.0 * (1.0 - dist.cdf(t.abs())))
    };

    Some(Spearman { rho, p_value })
}

/// Ordinary-least-squares slope of y against x.
///
/// Fits `[1, x]` by SVD; `None` below 2 points or at constant x.
pub fn ols_slope(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    if x.iter().all(|v| *v == x[0]) {
        return None;
    }
    let n = x.len();
    let design = DMatrix::from_fn(n, 2, |r, c| if c == 0 { 1.0 } else { x[r] });
    let response = DVector::from_column_slice(y);
    let svd = design.svd(true, true);
    let coefficients = svd.solve(&response, 1e-12).ok()?;
    Some(coefficients[1])
}

/// Slope of ln(y) against x over strictly positive y.
pub fn log_slope(x: &[f64], y: &[f64]) -> Option<f64> {
    let (px, py): (Vec<f64>, Vec<f64>) = x
        .iter()
        .zip(y)
        .filter(|(_, yi)| **yi > 0.0)
        .map(|(xi, yi)| (*xi, yi.ln()))
        .unzip();
    if px.len() < 2 {
        return None;
    }
    ols_slope(&px, &py)
}

/// Trend summary for one biomarker, cohort, and statistic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendMetric {
    pub biomarker_id: String,
    pub biomarker_name: String,
    pub cohort: SexCohort,
    pub statistic: StatisticKind,
    /// Bins meeting the minimum sample count that entered the trend.
    pub n_bins: usize,
    pub spearman_rho: Option<f64>,
    pub spearman_p: Option<f64>,
    pub slope_per_year: Option<f64>,
    pub log_slope_per_year: Option<f64>,
    /// All four conditions hold: enough bins, negative rho, significant p,
    /// and a corroborating negative OLS slope.
    pub negative_trend: bool,
    /// Legacy CV decline flag; identical to `negative_trend` when the
    /// statistic is CV, false otherwise.
    pub decline_flag: bool,
}

/// Compute the trend metric over one biomarker/cohort's bin sequence.
///
/// Only bins meeting the sample threshold contribute. Each flag condition
/// is computed independently; the slope check corroborates rho's sign
/// rather than being derived from it.
pub fn compute_trend(
    biomarker_id: &str,
    biomarker_name: &str,
    cohort: SexCohort,
    statistic: StatisticKind,
    bins: &[&AgeBinStat],
) -> TrendMetric {
    let mut points: Vec<(f64, f64)> = bins
        .iter()
        .filter(|b| b.passes_n_threshold)
        .filter_map(|b| statistic.value_of(b).map(|v| (b.age_mid, v)))
        .collect();
    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let x: Vec<f64> = points.iter().map(|p| p.0).collect();
    let y: Vec<f64> = points.iter().map(|p| p.1).collect();
    let n_bins = points.len();

    let rank = spearman(&x, &y);
    let spearman_rho = rank.map(|s| s.rho);
    let spearman_p = rank.and_then(|s| s.p_value);
    let slope_per_year = ols_slope(&x, &y);
    let log_slope_per_year = log_slope(&x, &y);

    let negative_trend = n_bins >= MIN_TREND_BINS
        && matches!(spearman_rho, Some(rho) if rho < 0.0)
        && matches!(spearman_p, Some(p) if p < 0.05)
        && matches!(slope_per_year, Some(slope) if slope < 0.0);

    TrendMetric {
        biomarker_id: biomarker_id.to_string(),
        biomarker_name: biomarker_name.to_string(),
        cohort,
        statistic,
        n_bins,
        spearman_rho,
        spearman_p,
        slope_per_year,
        log_slope_per_year,
        negative_trend,
        decline_flag: statistic == StatisticKind::Cv && negative_trend,
    }
}

/// Ranking sort mode for trend comparison views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankMode {
    MostNegative,
    MostPositive,
    LargestAbsolute,
}

/// Ranking configuration: sort mode plus clamped top-N.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RankingConfig {
    pub mode: RankMode,
    pub top_n: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            mode: RankMode::MostNegative,
            top_n: 40,
        }
    }
}

/// Rank trend metrics by Spearman rho. Metrics without a rho are dropped;
/// top-N is clamped to [10, 200].
pub fn rank_trends<'a>(metrics: &'a [TrendMetric], config: &RankingConfig) -> Vec<&'a TrendMetric> {
    let top_n = config.top_n.clamp(10, 200);
    let mut ranked: Vec<&TrendMetric> = metrics
        .iter()
        .filter(|m| m.spearman_rho.is_some())
        .collect();

    let key = |m: &TrendMetric| m.spearman_rho.unwrap_or(f64::NAN);
    match config.mode {
        RankMode::MostNegative => ranked.sort_by(|a, b| {
            key(a)
                .partial_cmp(&key(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.biomarker_id.cmp(&b.biomarker_id))
        }),
        RankMode::MostPositive => ranked.sort_by(|a, b| {
            key(b)
                .partial_cmp(&key(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.biomarker_id.cmp(&b.biomarker_id))
        }),
        RankMode::LargestAbsolute => ranked.sort_by(|a, b| {
            key(b)
                .abs()
                .partial_cmp(&key(a).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.biomarker_id.cmp(&b.biomarker_id))
        }),
    }
    ranked.truncate(top_n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bin(age_mid: f64, cv: f64, n: usize, passes: bool) -> AgeBinStat {
        AgeBinStat {
            biomarker_id: "albumin".to_string(),
            biomarker_name: "Albumin".to_string(),
            unit: "g/dL".to_string(),
            cohort: SexCohort::Pooled,
            age_bin: format!("{}", age_mid),
            age_mid,
            n,
            mean: 100.0,
            std: Some(100.0 * cv),
            median: 100.0,
            iqr_low: 90.0,
            iqr_high: 110.0,
            skewness: Some(0.0),
            cv: Some(cv),
            passes_n_threshold: passes,
        }
    }

    fn trend_over(cvs: &[f64]) -> TrendMetric {
        let bins: Vec<AgeBinStat> = cvs
            .iter()
            .enumerate()
            .map(|(i, cv)| bin(22.5 + 5.0 * i as f64, *cv, 50, true))
            .collect();
        let refs: Vec<&AgeBinStat> = bins.iter().collect();
        compute_trend("albumin", "Albumin", SexCohort::Pooled, StatisticKind::Cv, &refs)
    }

    #[test]
    fn test_spearman_perfect_monotone() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [10.0, 20.0, 30.0, 40.0, 50.0];
        let s = spearman(&x, &y).unwrap();
        assert_relative_eq!(s.rho, 1.0);
        assert_relative_eq!(s.p_value.unwrap(), 0.0);

        let y_desc = [50.0, 40.0, 30.0, 20.0, 10.0];
        let s = spearman(&x, &y_desc).unwrap();
        assert_relative_eq!(s.rho, -1.0);
    }

    #[test]
    fn test_spearman_ties() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [10.0, 10.0, 20.0, 30.0];
        let s = spearman(&x, &y).unwrap();
        assert!(s.rho > 0.9);
        assert!(s.rho < 1.0);
    }

    #[test]
    fn test_spearman_constant_is_none() {
        let x = [1.0, 2.0, 3.0];
        let y = [5.0, 5.0, 5.0];
        assert!(spearman(&x, &y).is_none());
    }

    #[test]
    fn test_ols_slope() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [3.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(ols_slope(&x, &y).unwrap(), 2.0, epsilon = 1e-9);
        assert!(ols_slope(&[1.0, 1.0], &[2.0, 3.0]).is_none());
    }

    #[test]
    fn test_log_slope_uses_positive_values_only() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [f64::exp(1.0), 0.0, f64::exp(3.0), f64::exp(4.0)];
        let slope = log_slope(&x, &y).unwrap();
        assert_relative_eq!(slope, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_declining_cv_flags_negative_trend() {
        let t = trend_over(&[0.30, 0.26, 0.22, 0.18, 0.16, 0.14]);
        assert_eq!(t.n_bins, 6);
        assert!(t.spearman_rho.unwrap() < 0.0);
        assert!(t.slope_per_year.unwrap() < 0.0);
        assert!(t.negative_trend);
        assert!(t.decline_flag);
    }

    #[test]
    fn test_increasing_cv_is_not_negative_trend() {
        let t = trend_over(&[0.10, 0.14, 0.18, 0.22, 0.26, 0.30]);
        assert!(t.spearman_rho.unwrap() > 0.0);
        assert!(t.spearman_p.unwrap() < 0.05);
        assert!(!t.negative_trend);
        assert!(!t.decline_flag);
    }

    #[test]
    fn test_flag_false_below_five_bins() {
        let t = trend_over(&[0.30, 0.25, 0.20, 0.15]);
        assert_eq!(t.n_bins, 4);
        assert!(t.spearman_rho.unwrap() < 0.0);
        assert!(!t.negative_trend);
    }

    #[test]
    fn test_flag_evaluated_at_exactly_five_bins() {
        let t = trend_over(&[0.30, 0.26, 0.22, 0.18, 0.14]);
        assert_eq!(t.n_bins, 5);
        assert!(t.negative_trend);
    }

    #[test]
    fn test_low_n_bins_excluded_from_trend() {
        let mut bins: Vec<AgeBinStat> = (0..6)
            .map(|i| bin(22.5 + 5.0 * i as f64, 0.30 - 0.03 * i as f64, 50, true))
            .collect();
        bins.push(bin(60.0, 0.9, 5, false));
        let refs: Vec<&AgeBinStat> = bins.iter().collect();
        let t = compute_trend("albumin", "Albumin", SexCohort::Pooled, StatisticKind::Cv, &refs);
        // The low-n bin neither counts nor disturbs the trend.
        assert_eq!(t.n_bins, 6);
        assert!(t.negative_trend);
    }

    #[test]
    fn test_decline_flag_only_for_cv() {
        let bins: Vec<AgeBinStat> = (0..6)
            .map(|i| {
                let mut b = bin(22.5 + 5.0 * i as f64, 0.2, 50, true);
                b.mean = 100.0 - 10.0 * i as f64;
                b
            })
            .collect();
        let refs: Vec<&AgeBinStat> = bins.iter().collect();
        let t = compute_trend(
            "albumin",
            "Albumin",
            SexCohort::Pooled,
            StatisticKind::Mean,
            &refs,
        );
        assert!(t.negative_trend);
        assert!(!t.decline_flag);
    }

    #[test]
    fn test_ranking_modes() {
        let mk = |id: &str, rho: f64| TrendMetric {
            biomarker_id: id.to_string(),
            biomarker_name: id.to_string(),
            cohort: SexCohort::Pooled,
            statistic: StatisticKind::Cv,
            n_bins: 6,
            spearman_rho: Some(rho),
            spearman_p: Some(0.01),
            slope_per_year: Some(rho),
            log_slope_per_year: None,
            negative_trend: rho < 0.0,
            decline_flag: rho < 0.0,
        };
        let metrics = vec![mk("a", -0.9), mk("b", 0.95), mk("c", 0.1), mk("d", -0.2)];

        let cfg = RankingConfig {
            mode: RankMode::MostNegative,
            top_n: 10,
        };
        let ranked = rank_trends(&metrics, &cfg);
        assert_eq!(ranked[0].biomarker_id, "a");

        let cfg = RankingConfig {
            mode: RankMode::MostPositive,
            top_n: 10,
        };
        assert_eq!(rank_trends(&metrics, &cfg)[0].biomarker_id, "b");

        let cfg = RankingConfig {
            mode: RankMode::LargestAbsolute,
            top_n: 10,
        };
        let ranked = rank_trends(&metrics, &cfg);
        assert_eq!(ranked[0].biomarker_id, "b");
        assert_eq!(ranked[1].biomarker_id, "a");
    }

    #[test]
    fn test_ranking_clamps_top_n() {
        let metrics: Vec<TrendMetric> = (0..30)
            .map(|i| TrendMetric {
                biomarker_id: format!("bm{:02}", i),
                biomarker_name: format!("bm{:02}", i),
                cohort: SexCohort::Pooled,
                statistic: StatisticKind::Cv,
                n_bins: 6,
                spearman_rho: Some(-(i as f64) / 30.0),
                spearman_p: Some(0.01),
                slope_per_year: Some(-1.0),
                log_slope_per_year: None,
                negative_trend: true,
                decline_flag: true,
            })
            .collect();
        let cfg = RankingConfig {
            mode: RankMode::MostNegative,
            top_n: 1,
        };
        // Below the floor of 10, clamped up.
        assert_eq!(rank_trends(&metrics, &cfg).len(), 10);
    }
}
