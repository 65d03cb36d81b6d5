//! Metrics engine: age-binned summary statistics and trend metrics.
//!
//! All derivation is a pure function of the long dataset and an explicit
//! immutable [`MetricsConfig`], so the engine can be rerun for any number
//! of trim/cohort parameterizations against the same frozen dataset.

mod bins;
mod stats;
mod trend;

pub use bins::{AgeBin, AgeBins};
pub use stats::{percentile, summarize, symmetric_trim, validate_trim, SummaryStats};
pub use trend::{
    compute_trend, log_slope, ols_slope, rank_trends, spearman, RankMode, RankingConfig,
    Spearman, TrendMetric, MIN_TREND_BINS,
};

use crate::data::{LongDataset, Sex};
use crate::error::{BiopoolError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// A sex cohort statistics are reported for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SexCohort {
    Pooled,
    Female,
    Male,
}

impl SexCohort {
    /// Whether a record of the given sex belongs to this cohort.
    pub fn contains(&self, sex: Sex) -> bool {
        match self {
            SexCohort::Pooled => true,
            SexCohort::Female => sex == Sex::Female,
            SexCohort::Male => sex == Sex::Male,
        }
    }

    /// Stable name written to output tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            SexCohort::Pooled => "pooled",
            SexCohort::Female => "female",
            SexCohort::Male => "male",
        }
    }
}

/// Cohort selection for a metrics run.
///
/// `Both` computes female and male statistics independently and reports
/// them side by side; trimmed subsets are never merged across sexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortSelection {
    Pooled,
    Female,
    Male,
    Both,
}

impl CohortSelection {
    /// The cohorts this selection computes, in report order.
    pub fn cohorts(&self) -> Vec<SexCohort> {
        match self {
            CohortSelection::Pooled => vec![SexCohort::Pooled],
            CohortSelection::Female => vec![SexCohort::Female],
            CohortSelection::Male => vec![SexCohort::Male],
            CohortSelection::Both => vec![SexCohort::Female, SexCohort::Male],
        }
    }
}

/// Which per-bin statistic the trend is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    Cv,
    Mean,
    Median,
    Skewness,
}

impl StatisticKind {
    /// Extract this statistic from a bin, when defined.
    pub fn value_of(&self, bin: &AgeBinStat) -> Option<f64> {
        match self {
            StatisticKind::Cv => bin.cv,
            StatisticKind::Mean => Some(bin.mean),
            StatisticKind::Median => Some(bin.median),
            StatisticKind::Skewness => bin.skewness,
        }
    }

    /// Stable name written to output tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticKind::Cv => "cv",
            StatisticKind::Mean => "mean",
            StatisticKind::Median => "median",
            StatisticKind::Skewness => "skewness",
        }
    }
}

/// Summary statistics for one biomarker, cohort, and age bin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgeBinStat {
    pub biomarker_id: String,
    pub biomarker_name: String,
    pub unit: String,
    pub cohort: SexCohort,
    pub age_bin: String,
    pub age_mid: f64,
    /// Retained sample count after trimming.
    pub n: usize,
    pub mean: f64,
    pub std: Option<f64>,
    pub median: f64,
    pub iqr_low: f64,
    pub iqr_high: f64,
    pub skewness: Option<f64>,
    pub cv: Option<f64>,
    /// Bins below the minimum count are reported but marked low-confidence
    /// and excluded from trend computation.
    pub passes_n_threshold: bool,
}

/// Immutable settings for one metrics derivation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub bins: AgeBins,
    /// Symmetric trim, percent per tail (0-49).
    pub trim_percent: f64,
    pub cohort: CohortSelection,
    pub statistic: StatisticKind,
    /// Minimum bin sample count for trend eligibility.
    pub min_bin_n: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bins: AgeBins::default(),
            trim_percent: 0.0,
            cohort: CohortSelection::Pooled,
            statistic: StatisticKind::Cv,
            min_bin_n: 30,
        }
    }
}

impl MetricsConfig {
    /// Validate bin layout, trim range, and thresholds.
    pub fn validate(&self) -> Result<()> {
        self.bins.validate()?;
        validate_trim(self.trim_percent)?;
        if self.min_bin_n == 0 {
            return Err(BiopoolError::InvalidParameter(
                "min_bin_n must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Compute age-binned statistics for every biomarker in the dataset.
///
/// Output order is deterministic: biomarkers sorted by id, cohorts in
/// selection order, bins ascending. Biomarkers fan out across threads; each
/// derivation touches only its own records.
pub fn compute_bin_stats(dataset: &LongDataset, config: &MetricsConfig) -> Result<Vec<AgeBinStat>> {
    config.validate()?;
    if dataset.is_empty() {
        return Err(BiopoolError::EmptyData(
            "long dataset has no records".to_string(),
        ));
    }

    let bin_layout = config.bins.bins();
    let cohorts = config.cohort.cohorts();
    let groups: Vec<_> = dataset.by_biomarker().into_iter().collect();

    let stats: Vec<AgeBinStat> = groups
        .par_iter()
        .flat_map(|(id, records)| {
            let name = records[0].biomarker_name.clone();
            let unit = records[0].unit.clone();
            let mut out = Vec::new();

            for cohort in &cohorts {
                let mut per_bin: Vec<Vec<f64>> = vec![Vec::new(); bin_layout.len()];
                for record in records {
                    if !cohort.contains(record.sex) {
                        continue;
                    }
                    if let Some(idx) = config.bins.assign(record.age_years) {
                        per_bin[idx].push(record.value);
                    }
                }
                for (idx, values) in per_bin.iter().enumerate() {
                    if values.is_empty() {
                        continue;
                    }
                    let Some(s) = summarize(values, config.trim_percent) else {
                        continue;
                    };
                    out.push(AgeBinStat {
                        biomarker_id: id.to_string(),
                        biomarker_name: name.clone(),
                        unit: unit.clone(),
                        cohort: *cohort,
                        age_bin: bin_layout[idx].label.clone(),
                        age_mid: bin_layout[idx].midpoint,
                        n: s.n,
                        mean: s.mean,
                        std: s.std,
                        median: s.median,
                        iqr_low: s.q1,
                        iqr_high: s.q3,
                        skewness: s.skewness,
                        cv: s.cv,
                        passes_n_threshold: s.n >= config.min_bin_n,
                    });
                }
            }
            out
        })
        .collect();

    Ok(stats)
}

/// Compute trend metrics over previously derived bin statistics.
///
/// One metric per (biomarker, cohort) pair, for the configured statistic.
pub fn compute_trend_metrics(stats: &[AgeBinStat], config: &MetricsConfig) -> Vec<TrendMetric> {
    let mut order: Vec<(String, SexCohort)> = Vec::new();
    let mut grouped: std::collections::HashMap<(String, SexCohort), Vec<&AgeBinStat>> =
        std::collections::HashMap::new();
    for stat in stats {
        let key = (stat.biomarker_id.clone(), stat.cohort);
        if !grouped.contains_key(&key) {
            order.push(key.clone());
        }
        grouped.entry(key).or_default().push(stat);
    }

    order
        .into_iter()
        .map(|key| {
            let bins = &grouped[&key];
            compute_trend(
                &key.0,
                &bins[0].biomarker_name,
                key.1,
                config.statistic,
                bins,
            )
        })
        .collect()
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(v) if v.is_finite() => format!("{}", v),
        _ => "NA".to_string(),
    }
}

/// Write bin statistics as TSV. Undefined statistics serialize as "NA".
pub fn write_bin_stats_tsv<P: AsRef<Path>>(stats: &[AgeBinStat], path: P) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(
        writer,
        "biomarker_id\tbiomarker_name\tunit\tcohort\tage_bin\tage_mid\tn\tmean\tstd\tmedian\tiqr_low\tiqr_high\tskewness\tcv\tpasses_n_threshold"
    )?;
    for s in stats {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            s.biomarker_id,
            s.biomarker_name,
            s.unit,
            s.cohort.as_str(),
            s.age_bin,
            s.age_mid,
            s.n,
            s.mean,
            fmt_opt(s.std),
            s.median,
            s.iqr_low,
            s.iqr_high,
            fmt_opt(s.skewness),
            fmt_opt(s.cv),
            s.passes_n_threshold,
        )?;
    }
    Ok(())
}

/// Write trend metrics as TSV. Undefined statistics serialize as "NA".
pub fn write_trend_metrics_tsv<P: AsRef<Path>>(metrics: &[TrendMetric], path: P) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(
        writer,
        "biomarker_id\tbiomarker_name\tcohort\tstatistic\tn_bins\tspearman_rho\tspearman_p\tslope_per_year\tlog_slope_per_year\tnegative_trend\tdecline_flag"
    )?;
    for m in metrics {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            m.biomarker_id,
            m.biomarker_name,
            m.cohort.as_str(),
            m.statistic.as_str(),
            m.n_bins,
            fmt_opt(m.spearman_rho),
            fmt_opt(m.spearman_p),
            fmt_opt(m.slope_per_year),
            fmt_opt(m.log_slope_per_year),
            m.negative_trend,
            m.decline_flag,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BiomarkerRecord;
    use approx::assert_relative_eq;

    fn record(seqn: i64, id: &str, age: f64, sex: Sex, value: f64) -> BiomarkerRecord {
        BiomarkerRecord {
            seqn,
            biomarker_id: id.to_string(),
            biomarker_name: id.to_string(),
            variable_code: "LBX".to_string(),
            unit: "g/dL".to_string(),
            age_years: age,
            sex,
            value,
            cycle_label: "2017-2018".to_string(),
            cycle_start_year: 2017,
            source_file: "FILE".to_string(),
        }
    }

    fn dataset_with_bin(values: &[f64]) -> LongDataset {
        let mut dataset = LongDataset::new();
        for (i, v) in values.iter().enumerate() {
            let sex = if i % 2 == 0 { Sex::Male } else { Sex::Female };
            dataset.push(record(i as i64, "albumin", 22.0, sex, *v));
        }
        dataset
    }

    fn small_n_config() -> MetricsConfig {
        MetricsConfig {
            min_bin_n: 3,
            ..MetricsConfig::default()
        }
    }

    #[test]
    fn test_untrimmed_mean_is_plain_mean() {
        let dataset = dataset_with_bin(&[1.0, 2.0, 3.0, 4.0, 5.0, 100.0]);
        let stats = compute_bin_stats(&dataset, &small_n_config()).unwrap();
        assert_eq!(stats.len(), 1);
        assert_relative_eq!(stats[0].mean, 115.0 / 6.0, epsilon = 1e-12);
        assert_eq!(stats[0].n, 6);
    }

    #[test]
    fn test_trimmed_bin_scenario() {
        let dataset = dataset_with_bin(&[1.0, 2.0, 3.0, 4.0, 5.0, 100.0]);
        let config = MetricsConfig {
            trim_percent: 20.0,
            ..small_n_config()
        };
        let stats = compute_bin_stats(&dataset, &config).unwrap();
        assert_eq!(stats[0].n, 4);
        assert_relative_eq!(stats[0].mean, 3.5);
    }

    #[test]
    fn test_both_cohorts_reported_separately() {
        let mut dataset = LongDataset::new();
        for i in 0..10 {
            dataset.push(record(i, "albumin", 22.0, Sex::Male, 10.0));
            dataset.push(record(100 + i, "albumin", 22.0, Sex::Female, 20.0));
        }
        let config = MetricsConfig {
            cohort: CohortSelection::Both,
            ..small_n_config()
        };
        let stats = compute_bin_stats(&dataset, &config).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].cohort, SexCohort::Female);
        assert_relative_eq!(stats[0].mean, 20.0);
        assert_eq!(stats[1].cohort, SexCohort::Male);
        assert_relative_eq!(stats[1].mean, 10.0);
    }

    #[test]
    fn test_low_n_bins_marked() {
        let dataset = dataset_with_bin(&[1.0, 2.0]);
        let stats = compute_bin_stats(&dataset, &small_n_config()).unwrap();
        assert_eq!(stats.len(), 1);
        assert!(!stats[0].passes_n_threshold);
    }

    #[test]
    fn test_deterministic_rederivation() {
        let mut dataset = LongDataset::new();
        for i in 0..50 {
            dataset.push(record(
                i,
                if i % 2 == 0 { "albumin" } else { "glucose" },
                20.0 + (i % 60) as f64,
                Sex::Male,
                4.0 + (i as f64) * 0.01,
            ));
        }
        let config = small_n_config();
        let a = compute_bin_stats(&dataset, &config).unwrap();
        let b = compute_bin_stats(&dataset, &config).unwrap();
        assert_eq!(a.len(), b.len());
        for (sa, sb) in a.iter().zip(&b) {
            assert_eq!(sa.biomarker_id, sb.biomarker_id);
            assert_eq!(sa.age_bin, sb.age_bin);
            assert_eq!(sa.n, sb.n);
            assert_relative_eq!(sa.mean, sb.mean);
        }
    }

    #[test]
    fn test_trend_metrics_per_cohort() {
        let mut dataset = LongDataset::new();
        let mut seqn = 0;
        // Six bins of male data with increasing spread.
        for (bin_idx, spread) in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0].iter().enumerate() {
            let age = 22.0 + 5.0 * bin_idx as f64;
            for i in 0..10 {
                let offset = (i as f64 - 4.5) / 4.5 * spread;
                dataset.push(record(seqn, "albumin", age, Sex::Male, 50.0 + offset));
                seqn += 1;
            }
        }
        let config = MetricsConfig {
            cohort: CohortSelection::Male,
            ..small_n_config()
        };
        let stats = compute_bin_stats(&dataset, &config).unwrap();
        let trends = compute_trend_metrics(&stats, &config);
        assert_eq!(trends.len(), 1);
        let t = &trends[0];
        assert_eq!(t.cohort, SexCohort::Male);
        assert_eq!(t.n_bins, 6);
        // Spread grows with age: positive CV trend, no negative flag.
        assert!(t.spearman_rho.unwrap() > 0.0);
        assert!(!t.negative_trend);
    }

    #[test]
    fn test_config_validation() {
        let dataset = dataset_with_bin(&[1.0, 2.0, 3.0]);
        let config = MetricsConfig {
            trim_percent: 60.0,
            ..MetricsConfig::default()
        };
        assert!(compute_bin_stats(&dataset, &config).is_err());
    }
}
