//! Ordered screening rules with tagged exclusion reasons.
//!
//! Screening is an ordered list of predicate/reason pairs evaluated in
//! sequence; the first matching rule decides the exclusion. Every discovered
//! variable receives exactly one decision, so the audit trail is exhaustive
//! and rerunning on identical input reproduces it byte for byte.

use crate::data::RawVariable;
use crate::screen::pooling::normalize_base_name;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Reason a variable was excluded from the pooled catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenReason {
    /// Identifier or sampling-weight column, not a measurement.
    IdOrWeight,
    /// Failed the blood-candidate rule at discovery.
    NotBloodCandidate,
    /// Comment, result-code, or quality-control field.
    CommentOrCode,
    /// Questionnaire-style free-text field.
    Questionnaire,
    /// Duplicate or technical re-assay of an analyte already measured.
    DuplicateAssay,
    /// Variable absent from its data file.
    MissingInFile,
    /// Too few values, too few distinct values, or categorical coding.
    LowInformation,
    /// Unit not present in the compatibility table.
    UnrecognizedUnit,
    /// No values from cohort-admitted subjects.
    NoHealthyData,
}

impl ScreenReason {
    /// Stable snake_case code written to the audit table.
    pub fn code(&self) -> &'static str {
        match self {
            Self::IdOrWeight => "id_or_weight",
            Self::NotBloodCandidate => "not_blood_candidate",
            Self::CommentOrCode => "comment_or_code",
            Self::Questionnaire => "questionnaire",
            Self::DuplicateAssay => "duplicate_assay",
            Self::MissingInFile => "missing_in_file",
            Self::LowInformation => "low_information",
            Self::UnrecognizedUnit => "unrecognized_unit",
            Self::NoHealthyData => "no_healthy_data",
        }
    }
}

/// One screening decision for one (file, variable) row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningDecision {
    pub cycle_start_year: i32,
    pub file: String,
    pub variable_code: String,
    pub variable_label: String,
    /// True when the variable entered a pool group.
    pub included: bool,
    /// Exclusion reason; `None` exactly when included.
    pub reason: Option<ScreenReason>,
    /// Pool id the variable joined; `None` exactly when excluded.
    pub pool_id: Option<String>,
}

/// Analyte names retained against the heuristic rules.
///
/// Inflammation markers are scientifically high-value, so they survive the
/// comment/questionnaire/duplicate/low-information heuristics even when a
/// pattern fires. Structural exclusions (missing variable, unrecognized
/// unit) still apply: without a known unit family there is nothing to pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowList {
    patterns: Vec<String>,
}

impl Default for AllowList {
    fn default() -> Self {
        Self {
            patterns: vec![
                "c reactive protein".to_string(),
                "crp".to_string(),
            ],
        }
    }
}

impl AllowList {
    /// Add a normalized-name pattern.
    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(normalize_base_name(pattern));
        self
    }

    /// Whether the variable's normalized name matches the allow-list.
    pub fn protects(&self, var: &RawVariable) -> bool {
        let name = normalize_base_name(&var.base_label);
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }
}

fn comment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\bcomment\b|\bcomment code\b|\bresult code\b|\bstatus code\b|\bquality control\b|\bdetection limit\b",
        )
        .unwrap()
    })
}

fn questionnaire_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bdo you\b|\bdid you\b|\bhow often\b|\bquestionnaire\b").unwrap()
    })
}

fn duplicate_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bdup\b|\bduplicate\b|\bab con\b|\bantibody con|\bod in dup|od_dup|\bmean ab conc")
            .unwrap()
    })
}

fn searchable_text(var: &RawVariable) -> String {
    format!("{} {}", var.code, var.label).to_lowercase()
}

fn is_id_or_weight(var: &RawVariable) -> bool {
    var.code.eq_ignore_ascii_case("SEQN") || var.code.to_uppercase().starts_with("WT")
}

fn is_comment_or_code(var: &RawVariable) -> bool {
    comment_regex().is_match(&searchable_text(var))
}

fn is_questionnaire(var: &RawVariable) -> bool {
    questionnaire_regex().is_match(&searchable_text(var))
}

fn is_duplicate_assay(var: &RawVariable) -> bool {
    duplicate_regex().is_match(&searchable_text(var))
}

/// Low-information test on the observed value distribution.
///
/// A variable without a profile passes (nothing to judge); a profiled
/// variable must look like a continuous measurement: enough values, enough
/// distinct values, and not an integer-coded categorical.
fn is_low_information(var: &RawVariable) -> bool {
    let Some(profile) = var.profile else {
        return false;
    };
    if profile.n == 0 {
        // Handled separately as MissingInFile.
        return false;
    }
    if profile.n < 30 {
        return true;
    }
    if profile.n_distinct < 8 {
        return true;
    }
    let frac_unique = profile.n_distinct as f64 / profile.n.max(1) as f64;
    if profile.integer_like_frac > 0.995 && profile.n_distinct <= 12 {
        return true;
    }
    if frac_unique < 0.01 && profile.n_distinct < 20 {
        return true;
    }
    false
}

fn is_missing_in_file(var: &RawVariable) -> bool {
    matches!(var.profile, Some(p) if p.n == 0)
}

/// Apply the ordered rules to one variable. `None` means it survives
/// screening and proceeds to unit resolution and pooling.
pub fn screen_variable(var: &RawVariable, allow: &AllowList) -> Option<ScreenReason> {
    // Structural rules run unconditionally.
    type Rule = (ScreenReason, fn(&RawVariable) -> bool);
    const STRUCTURAL: &[Rule] = &[
        (ScreenReason::IdOrWeight, is_id_or_weight),
        (ScreenReason::MissingInFile, is_missing_in_file),
    ];
    const HEURISTIC: &[Rule] = &[
        (ScreenReason::CommentOrCode, is_comment_or_code),
        (ScreenReason::Questionnaire, is_questionnaire),
        (ScreenReason::DuplicateAssay, is_duplicate_assay),
        (ScreenReason::LowInformation, is_low_information),
    ];

    for (reason, predicate) in STRUCTURAL {
        if predicate(var) {
            return Some(*reason);
        }
    }
    if !var.is_blood_candidate {
        return Some(ScreenReason::NotBloodCandidate);
    }
    if allow.protects(var) {
        return None;
    }
    for (reason, predicate) in HEURISTIC {
        if predicate(var) {
            return Some(*reason);
        }
    }
    None
}
