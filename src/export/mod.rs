//! Presentation exporter: serialize catalog metadata, trend metrics, and
//! per-biomarker series payloads into the static JSON artifacts the
//! dashboard consumes.
//!
//! Series are keyed by pooled biomarker id so a single fetch returns all
//! cycles' pooled points for one biomarker. Undefined statistics serialize
//! as JSON null, never NaN or infinities.

use crate::data::{LongDataset, Sex};
use crate::error::Result;
use crate::metrics::{AgeBinStat, SexCohort, TrendMetric};
use crate::screen::PoolCatalog;
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use xxhash_rust::xxh3::xxh3_64;

/// Exporter settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Maximum raw points sampled per biomarker for scatter display.
    pub raw_sample_n: usize,
    /// RNG seed for the raw-sample subset, fixed so reruns agree.
    pub seed: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            raw_sample_n: 1200,
            seed: 42,
        }
    }
}

/// One catalog entry in `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub biomarker_id: String,
    pub biomarker_name: String,
    pub display_name: String,
    pub unit: String,
    pub source_variable_count: usize,
    pub source_variables: String,
    pub source_file_count: usize,
    pub source_files: String,
}

/// One binned point in a series payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub cohort: SexCohort,
    pub age_bin: String,
    pub age_mid: f64,
    pub n: usize,
    pub mean: f64,
    pub std: Option<f64>,
    pub cv: Option<f64>,
    pub skewness: Option<f64>,
    pub ci95_low: Option<f64>,
    pub ci95_high: Option<f64>,
    pub passes_n_threshold: bool,
}

/// One raw observation in a series payload's scatter sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSamplePoint {
    pub age_years: f64,
    pub value: f64,
    pub sex: Sex,
}

/// Per-biomarker series payload, one JSON file each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesPayload {
    pub biomarker_id: String,
    pub biomarker_name: String,
    pub display_name: String,
    pub unit: String,
    pub points: Vec<SeriesPoint>,
    pub raw_sample: Vec<RawSamplePoint>,
}

/// What the exporter wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSummary {
    pub metadata_count: usize,
    pub metrics_count: usize,
    pub series_count: usize,
    pub raw_sample_n: usize,
}

fn isomer_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:\d+['\u{2019}]?)(?:,\s*\d+['\u{2019}]?)+\s*,?-?\s*").unwrap()
    })
}

fn acronym_paren_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\(([a-z0-9_-]{2,12})\)").unwrap())
}

fn slug_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]+").unwrap())
}

/// Strip leading isomer locants and non-unit acronym parentheses.
pub fn clean_display_base(name: &str) -> String {
    let s = isomer_prefix_regex().replace(name.trim(), "");
    // Short all-lowercase parentheses that are not units (no slash) are
    // acronyms, dropped from display.
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in acronym_paren_regex().captures_iter(&s) {
        let whole = caps.get(0).unwrap();
        let inner = &caps[1];
        if !inner.contains('/') {
            out.push_str(&s[last..whole.start()]);
            last = whole.end();
        }
    }
    out.push_str(&s[last..]);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Display name: cleaned base plus the canonical unit suffix.
pub fn make_display_name(name: &str, unit: &str) -> String {
    let base = clean_display_base(name);
    let unit = unit.trim();
    if unit.is_empty() {
        format!("{} (unit not reported)", base)
    } else if base.to_lowercase().ends_with(&format!("({})", unit.to_lowercase())) {
        base
    } else {
        format!("{} ({})", base, unit)
    }
}

/// Relative path of a biomarker's series file, content-stable in the id.
pub fn series_filename(biomarker_id: &str) -> String {
    let slug = slug_regex().replace_all(biomarker_id, "_");
    let slug: String = slug.chars().take(80).collect();
    let slug = slug.trim_matches('_');
    format!(
        "series/{}__{:016x}.json",
        slug,
        xxh3_64(biomarker_id.as_bytes())
    )
}

fn ci95(mean: f64, std: Option<f64>, n: usize) -> (Option<f64>, Option<f64>) {
    match std {
        Some(std) if n > 0 => {
            let half = 1.96 * std / (n as f64).sqrt();
            (Some(mean - half), Some(mean + half))
        }
        _ => (None, None),
    }
}

fn sanitize(v: Option<f64>) -> Option<f64> {
    v.filter(|v| v.is_finite())
}

fn metadata_entries(catalog: &PoolCatalog) -> Vec<MetadataEntry> {
    catalog
        .groups()
        .iter()
        .map(|group| {
            let codes: Vec<&str> = group.members.iter().map(|m| m.code.as_str()).collect();
            let mut files: Vec<&str> = group
                .members
                .iter()
                .flat_map(|m| m.files.iter().map(String::as_str))
                .collect();
            files.sort_unstable();
            files.dedup();
            MetadataEntry {
                biomarker_id: group.pool_id.clone(),
                biomarker_name: group.canonical_name.clone(),
                display_name: make_display_name(&group.canonical_name, &group.canonical_unit),
                unit: group.canonical_unit.clone(),
                source_variable_count: codes.len(),
                source_variables: codes.join("|"),
                source_file_count: files.len(),
                source_files: files.join("|"),
            }
        })
        .collect()
}

/// Serialize all dashboard artifacts under `out_dir`.
///
/// Writes `metadata.json`, `metrics.json`, `series_index.json`, and one
/// payload per biomarker under `series/`. Stale series files from earlier
/// runs are removed first so the output always matches the current dataset.
pub fn export_dashboard<P: AsRef<Path>>(
    out_dir: P,
    catalog: &PoolCatalog,
    stats: &[AgeBinStat],
    trends: &[TrendMetric],
    dataset: &LongDataset,
    config: &ExportConfig,
) -> Result<ExportSummary> {
    let out_dir = out_dir.as_ref();
    let series_dir = out_dir.join("series");
    fs::create_dir_all(&series_dir)?;
    for entry in fs::read_dir(&series_dir)? {
        let entry = entry?;
        if entry.path().extension().is_some_and(|ext| ext == "json") {
            fs::remove_file(entry.path())?;
        }
    }

    let metadata = metadata_entries(catalog);
    fs::write(
        out_dir.join("metadata.json"),
        serde_json::to_vec(&metadata)?,
    )?;

    let trends_clean: Vec<TrendMetric> = trends
        .iter()
        .map(|t| TrendMetric {
            spearman_rho: sanitize(t.spearman_rho),
            spearman_p: sanitize(t.spearman_p),
            slope_per_year: sanitize(t.slope_per_year),
            log_slope_per_year: sanitize(t.log_slope_per_year),
            ..t.clone()
        })
        .collect();
    fs::write(
        out_dir.join("metrics.json"),
        serde_json::to_vec(&trends_clean)?,
    )?;

    // Bin stats grouped per biomarker, preserving derivation order.
    let mut stats_by_id: BTreeMap<&str, Vec<&AgeBinStat>> = BTreeMap::new();
    for stat in stats {
        stats_by_id
            .entry(stat.biomarker_id.as_str())
            .or_default()
            .push(stat);
    }

    // Deterministic raw samples: one seeded RNG walked over sorted ids.
    let records_by_id = dataset.by_biomarker();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut raw_samples: BTreeMap<&str, Vec<RawSamplePoint>> = BTreeMap::new();
    for (id, records) in &records_by_id {
        let sample: Vec<RawSamplePoint> = if records.len() > config.raw_sample_n {
            let mut indices =
                rand::seq::index::sample(&mut rng, records.len(), config.raw_sample_n).into_vec();
            indices.sort_unstable();
            indices
                .into_iter()
                .map(|i| RawSamplePoint {
                    age_years: records[i].age_years,
                    value: records[i].value,
                    sex: records[i].sex,
                })
                .collect()
        } else {
            records
                .iter()
                .map(|r| RawSamplePoint {
                    age_years: r.age_years,
                    value: r.value,
                    sex: r.sex,
                })
                .collect()
        };
        raw_samples.insert(id, sample);
    }

    let mut series_index: BTreeMap<String, String> = BTreeMap::new();
    let mut series_count = 0usize;
    let name_by_id: BTreeMap<&str, &MetadataEntry> = metadata
        .iter()
        .map(|m| (m.biomarker_id.as_str(), m))
        .collect();

    for (id, bin_stats) in &stats_by_id {
        let rel_path = series_filename(id);
        let (name, display_name, unit) = match name_by_id.get(id) {
            Some(m) => (
                m.biomarker_name.clone(),
                m.display_name.clone(),
                m.unit.clone(),
            ),
            None => (
                bin_stats[0].biomarker_name.clone(),
                make_display_name(&bin_stats[0].biomarker_name, &bin_stats[0].unit),
                bin_stats[0].unit.clone(),
            ),
        };

        let points: Vec<SeriesPoint> = bin_stats
            .iter()
            .map(|s| {
                let (ci_low, ci_high) = ci95(s.mean, s.std, s.n);
                SeriesPoint {
                    cohort: s.cohort,
                    age_bin: s.age_bin.clone(),
                    age_mid: s.age_mid,
                    n: s.n,
                    mean: s.mean,
                    std: sanitize(s.std),
                    cv: sanitize(s.cv),
                    skewness: sanitize(s.skewness),
                    ci95_low: sanitize(ci_low),
                    ci95_high: sanitize(ci_high),
                    passes_n_threshold: s.passes_n_threshold,
                }
            })
            .collect();

        let payload = SeriesPayload {
            biomarker_id: id.to_string(),
            biomarker_name: name,
            display_name,
            unit,
            points,
            raw_sample: raw_samples.get(*id).cloned().unwrap_or_default(),
        };
        fs::write(out_dir.join(&rel_path), serde_json::to_vec(&payload)?)?;
        series_index.insert(id.to_string(), rel_path);
        series_count += 1;
    }

    fs::write(
        out_dir.join("series_index.json"),
        serde_json::to_vec(&series_index)?,
    )?;

    let summary = ExportSummary {
        metadata_count: metadata.len(),
        metrics_count: trends_clean.len(),
        series_count,
        raw_sample_n: config.raw_sample_n,
    };
    fs::write(
        out_dir.join("export_summary.json"),
        serde_json::to_vec_pretty(&summary)?,
    )?;
    log::info!(
        "exported {} series, {} metadata entries to {}",
        series_count,
        summary.metadata_count,
        out_dir.display()
    );
    Ok(summary)
}
