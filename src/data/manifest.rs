//! Variable manifest: the discovered laboratory variables across cycles.
//!
//! The manifest is supplied by the discovery/download collaborators as a CSV
//! with one row per (data file, variable). Loading derives cycle years from
//! the cycle label, splits the trailing unit out of the label text, and
//! applies the blood-candidate rule.

use crate::error::{BiopoolError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// A survey collection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleInfo {
    /// Human-readable cycle label (e.g. "2017-2018").
    pub label: String,
    /// First calendar year of the cycle.
    pub start_year: i32,
    /// Last calendar year of the cycle.
    pub end_year: i32,
}

/// Distribution summary for a variable's observed values.
///
/// Computed from the raw cycle tables during discovery and consumed by the
/// low-information screening rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueProfile {
    /// Number of non-missing numeric values.
    pub n: usize,
    /// Number of distinct values.
    pub n_distinct: usize,
    /// Fraction of values that are integer-valued.
    pub integer_like_frac: f64,
}

impl ValueProfile {
    /// Summarize a slice of parsed numeric values.
    pub fn from_values(values: &[f64]) -> Self {
        let n = values.len();
        let mut seen: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        seen.sort_unstable();
        seen.dedup();
        let n_distinct = seen.len();
        let integer_like = values
            .iter()
            .filter(|v| (**v - v.round()).abs() <= 1e-12)
            .count();
        let integer_like_frac = if n == 0 {
            1.0
        } else {
            integer_like as f64 / n as f64
        };
        Self {
            n,
            n_distinct,
            integer_like_frac,
        }
    }
}

/// One discovered laboratory variable in one data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawVariable {
    /// Variable code name (e.g. "LBXSAL").
    pub code: String,
    /// Full descriptive label, including any trailing unit.
    pub label: String,
    /// Label with the trailing parenthesized unit removed.
    pub base_label: String,
    /// Raw unit text from the label's trailing parentheses ("" when absent).
    pub unit: String,
    /// Data file the variable was published in.
    pub file: String,
    /// Data file description.
    pub file_desc: String,
    /// Collection cycle.
    pub cycle: CycleInfo,
    /// Use-constraint text from the codebook.
    pub use_constraints: String,
    /// Whether the blood-candidate rule admits this variable.
    pub is_blood_candidate: bool,
    /// Observed value distribution, when profiled.
    pub profile: Option<ValueProfile>,
}

/// The full set of discovered variables.
#[derive(Debug, Clone, Default)]
pub struct VariableManifest {
    variables: Vec<RawVariable>,
}

fn year_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(19\d{2}|20\d{2})").unwrap())
}

fn unit_suffix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^()]*)\)\s*$").unwrap())
}

fn lab_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(lbx[a-z0-9]*|lbd[a-z0-9]*|sst[a-z0-9]*|ss[a-z0-9]+)\b").unwrap())
}

/// Parse first and last calendar years out of a cycle label.
pub fn parse_cycle_years(cycle_label: &str) -> Result<(i32, i32)> {
    let years: Vec<i32> = year_regex()
        .find_iter(cycle_label)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    match years.as_slice() {
        [] => Err(BiopoolError::CycleLabel(cycle_label.to_string())),
        [y] => Ok((*y, *y)),
        [first, .., last] => Ok((*first, *last)),
    }
}

/// Split a variable label into base text and trailing parenthesized unit.
pub fn split_label_unit(label: &str) -> (String, String) {
    let trimmed = label.trim();
    if let Some(caps) = unit_suffix_regex().captures(trimmed) {
        let unit = caps[1].trim().to_string();
        let whole = caps.get(0).unwrap();
        let base = trimmed[..whole.start()].trim().trim_end_matches(',').trim();
        (base.to_string(), unit)
    } else {
        (trimmed.to_string(), String::new())
    }
}

/// Blood-candidate rule: does this variable plausibly measure a blood analyte?
///
/// Many blood analytes carry LBX/LBD-style code names without mentioning
/// "blood" or "serum" in every description, so code-name markers count as
/// inclusion evidence. Restricted-access (RDC) variables are never candidates.
pub fn is_blood_candidate(
    file_desc: &str,
    variable_desc: &str,
    variable_name: &str,
    use_constraints: &str,
) -> bool {
    let txt = format!("{} {} {}", file_desc, variable_desc, variable_name).to_lowercase();
    let use_txt = use_constraints.to_lowercase();

    const INCLUDE: &[&str] = &["blood", "serum", "plasma", "whole blood", "rbc", "wbc"];
    const EXCLUDE: &[&str] = &[
        "urine", "urinary", "saliva", "oral", "vaginal", "semen", "hair", "nail", "milk", "csf",
    ];

    let has_include = INCLUDE.iter().any(|tok| txt.contains(tok));
    let has_exclude = EXCLUDE.iter().any(|tok| txt.contains(tok));
    let has_lab_marker = lab_marker_regex().is_match(&txt);
    let is_rdc = use_txt.contains("rdc");

    (has_include || has_lab_marker) && !has_exclude && !is_rdc
}

impl VariableManifest {
    /// Build a manifest from already-constructed variables.
    pub fn new(variables: Vec<RawVariable>) -> Self {
        Self { variables }
    }

    /// Load the manifest from a CSV file.
    ///
    /// Required columns: `variable_name`, `variable_desc`, `data_file_name`,
    /// `data_file_desc`, `cycle_label`, `use_constraints`. A missing column
    /// is a fatal schema error; a malformed cycle label fails the row's load.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;

        let headers = reader.headers()?.clone();
        let col = |name: &str| -> Result<usize> {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| BiopoolError::MissingColumn {
                    table: "variable manifest".to_string(),
                    column: name.to_string(),
                })
        };
        let code_idx = col("variable_name")?;
        let desc_idx = col("variable_desc")?;
        let file_idx = col("data_file_name")?;
        let file_desc_idx = col("data_file_desc")?;
        let cycle_idx = col("cycle_label")?;
        let constraints_idx = col("use_constraints")?;

        let mut variables = Vec::new();
        for record in reader.records() {
            let record = record?;
            let code = record.get(code_idx).unwrap_or("").trim().to_string();
            let label = record.get(desc_idx).unwrap_or("").trim().to_string();
            let file = record.get(file_idx).unwrap_or("").trim().to_string();
            if code.is_empty() || file.is_empty() {
                continue;
            }
            let file_desc = record.get(file_desc_idx).unwrap_or("").trim().to_string();
            let cycle_label = record.get(cycle_idx).unwrap_or("").trim().to_string();
            let use_constraints = record.get(constraints_idx).unwrap_or("").trim().to_string();

            let (start_year, end_year) = parse_cycle_years(&cycle_label)?;
            let (base_label, unit) = split_label_unit(&label);
            let candidate = is_blood_candidate(&file_desc, &label, &code, &use_constraints);

            variables.push(RawVariable {
                code,
                label,
                base_label,
                unit,
                file,
                file_desc,
                cycle: CycleInfo {
                    label: cycle_label,
                    start_year,
                    end_year,
                },
                use_constraints,
                is_blood_candidate: candidate,
                profile: None,
            });
        }

        if variables.is_empty() {
            return Err(BiopoolError::EmptyData(
                "variable manifest has no rows".to_string(),
            ));
        }
        Ok(Self { variables })
    }

    /// All variables.
    pub fn variables(&self) -> &[RawVariable] {
        &self.variables
    }

    /// Variables admitted by the blood-candidate rule.
    pub fn blood_candidates(&self) -> impl Iterator<Item = &RawVariable> {
        self.variables.iter().filter(|v| v.is_blood_candidate)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Attach observed value profiles, keyed by (data file, variable code).
    pub fn attach_profiles(&mut self, profiles: &HashMap<(String, String), ValueProfile>) {
        for var in &mut self.variables {
            if let Some(profile) = profiles.get(&(var.file.clone(), var.code.clone())) {
                var.profile = Some(*profile);
            }
        }
    }
}
