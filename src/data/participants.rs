//! Participant table and the healthy-cohort predicate.
//!
//! Demographics supply age, sex, and pregnancy status; questionnaire tables
//! supply comorbidity flags, folded per subject with "any yes wins". The
//! cohort predicate itself is a configurable value threaded into the dataset
//! builder, not hardcoded there.

use crate::error::{BiopoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Participant sex as coded by the survey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
    Unknown,
}

impl Sex {
    /// Decode the survey's numeric sex code (1 = male, 2 = female).
    pub fn from_code(code: f64) -> Self {
        if code == 1.0 {
            Sex::Male
        } else if code == 2.0 {
            Sex::Female
        } else {
            Sex::Unknown
        }
    }

    /// Display name used in serialized tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            Sex::Male => "Male",
            Sex::Female => "Female",
            Sex::Unknown => "Unknown",
        }
    }

    /// Parse the display name back.
    pub fn parse(s: &str) -> Self {
        match s {
            "Male" => Sex::Male,
            "Female" => Sex::Female,
            _ => Sex::Unknown,
        }
    }
}

/// One survey participant in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Subject sequence number.
    pub seqn: i64,
    /// Age in years at examination.
    pub age_years: f64,
    /// Sex.
    pub sex: Sex,
    /// Pregnancy at examination.
    pub pregnant: bool,
    /// Comorbidity flags, keyed by flag name. Absent means not observed.
    pub flags: BTreeMap<String, bool>,
    /// Cycle start year the row belongs to.
    pub cycle_start_year: i32,
}

/// Maps questionnaire columns onto a named comorbidity flag.
///
/// A subject is flagged when any listed column holds the "yes" code (1).
/// Column matching is case-insensitive to absorb legacy-uppercase variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagRule {
    /// Flag name (e.g. "diabetes").
    pub flag: String,
    /// Candidate questionnaire columns.
    pub columns: Vec<String>,
}

/// Default comorbidity flag rules for the survey's questionnaire files.
pub fn default_flag_rules() -> Vec<FlagRule> {
    vec![
        FlagRule {
            flag: "diabetes".to_string(),
            columns: vec!["DIQ010".to_string()],
        },
        FlagRule {
            flag: "cvd".to_string(),
            columns: vec![
                "MCQ160B".to_string(),
                "MCQ160C".to_string(),
                "MCQ160D".to_string(),
                "MCQ160E".to_string(),
                "MCQ160F".to_string(),
            ],
        },
        FlagRule {
            flag: "cancer".to_string(),
            columns: vec!["MCQ220".to_string()],
        },
        FlagRule {
            flag: "kidney".to_string(),
            columns: vec!["KIQ022".to_string()],
        },
    ]
}

/// Which flag columns a questionnaire file actually carried, per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagAvailability {
    pub cycle_start_year: i32,
    pub file: String,
    pub flag: String,
    pub columns_found: Vec<String>,
}

/// Healthy-cohort inclusion criteria.
///
/// Evaluated per participant by the dataset builder. Exclusion reasons are
/// reported in the order declared here, so reruns produce identical strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthyCriteria {
    /// Minimum age in years (inclusive).
    pub min_age: f64,
    /// Exclude participants pregnant at examination.
    pub exclude_pregnant: bool,
    /// Comorbidity flags that exclude a participant when set.
    pub exclude_flags: Vec<String>,
}

impl Default for HealthyCriteria {
    fn default() -> Self {
        Self {
            min_age: 20.0,
            exclude_pregnant: true,
            exclude_flags: vec![
                "diabetes".to_string(),
                "cvd".to_string(),
                "cancer".to_string(),
                "kidney".to_string(),
            ],
        }
    }
}

impl HealthyCriteria {
    /// Pipe-joined exclusion reasons for a participant ("" when healthy).
    pub fn exclusion_reason(&self, participant: &Participant) -> String {
        let mut reasons = Vec::new();
        if self.exclude_pregnant && participant.pregnant {
            reasons.push("pregnant".to_string());
        }
        for flag in &self.exclude_flags {
            if participant.flags.get(flag).copied().unwrap_or(false) {
                reasons.push(flag.clone());
            }
        }
        reasons.join("|")
    }

    /// Whether the participant is in the age range.
    pub fn passes_age(&self, participant: &Participant) -> bool {
        participant.age_years >= self.min_age
    }

    /// Whether the participant enters the analysis cohort.
    pub fn admits(&self, participant: &Participant) -> bool {
        self.passes_age(participant) && self.exclusion_reason(participant).is_empty()
    }
}

/// All participants across cycles, keyed by (subject, cycle start year).
#[derive(Debug, Clone, Default)]
pub struct ParticipantTable {
    by_key: HashMap<(i64, i32), Participant>,
}

fn header_index(header: &[&str], name: &str, table: &str) -> Result<usize> {
    header
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .ok_or_else(|| BiopoolError::MissingColumn {
            table: table.to_string(),
            column: name.to_string(),
        })
}

fn parse_field(fields: &[&str], idx: usize) -> Option<f64> {
    fields.get(idx).and_then(|s| s.trim().parse::<f64>().ok())
}

impl ParticipantTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of participant rows.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Look up a participant by subject and cycle.
    pub fn get(&self, seqn: i64, cycle_start_year: i32) -> Option<&Participant> {
        self.by_key.get(&(seqn, cycle_start_year))
    }

    /// Iterate participants in deterministic (seqn, cycle) order.
    pub fn iter_sorted(&self) -> Vec<&Participant> {
        let mut keys: Vec<_> = self.by_key.keys().copied().collect();
        keys.sort_unstable();
        keys.iter().map(|k| &self.by_key[k]).collect()
    }

    /// Insert or replace a participant row.
    pub fn insert(&mut self, participant: Participant) {
        self.by_key
            .insert((participant.seqn, participant.cycle_start_year), participant);
    }

    /// Merge a demographics TSV for one cycle.
    ///
    /// Required columns: `seqn`, `age_years`, `sex_code`. Optional:
    /// `pregnant_code` (1 = pregnant). Rows without a parseable subject id
    /// or age are skipped; the last row per subject wins.
    pub fn merge_demographics_tsv<P: AsRef<Path>>(
        &mut self,
        path: P,
        cycle_start_year: i32,
    ) -> Result<usize> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| BiopoolError::EmptyData("empty demographics file".to_string()))??;
        let header: Vec<&str> = header_line.split('\t').collect();
        let seqn_idx = header_index(&header, "seqn", "demographics")?;
        let age_idx = header_index(&header, "age_years", "demographics")?;
        let sex_idx = header_index(&header, "sex_code", "demographics")?;
        let preg_idx = header
            .iter()
            .position(|h| h.eq_ignore_ascii_case("pregnant_code"));

        let mut merged = 0usize;
        for line_result in lines {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let seqn = match parse_field(&fields, seqn_idx) {
                Some(v) => v as i64,
                None => continue,
            };
            let age_years = match parse_field(&fields, age_idx) {
                Some(v) => v,
                None => continue,
            };
            let sex = parse_field(&fields, sex_idx)
                .map(Sex::from_code)
                .unwrap_or(Sex::Unknown);
            let pregnant = preg_idx
                .and_then(|idx| parse_field(&fields, idx))
                .map(|v| v == 1.0)
                .unwrap_or(false);

            // Preserve flags already merged for this subject.
            let flags = self
                .by_key
                .remove(&(seqn, cycle_start_year))
                .map(|p| p.flags)
                .unwrap_or_default();

            self.insert(Participant {
                seqn,
                age_years,
                sex,
                pregnant,
                flags,
                cycle_start_year,
            });
            merged += 1;
        }

        if merged == 0 {
            return Err(BiopoolError::EmptyData(
                "demographics file has no usable rows".to_string(),
            ));
        }
        Ok(merged)
    }

    /// Merge a questionnaire TSV for one cycle, folding flags per subject.
    ///
    /// Returns the per-flag column availability for the audit report. Flags
    /// combine across files with "any yes wins"; subjects absent from the
    /// demographics table are ignored.
    pub fn merge_flags_tsv<P: AsRef<Path>>(
        &mut self,
        path: P,
        cycle_start_year: i32,
        rules: &[FlagRule],
    ) -> Result<Vec<FlagAvailability>> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| BiopoolError::EmptyData("empty questionnaire file".to_string()))??;
        let header: Vec<&str> = header_line.split('\t').collect();
        let seqn_idx = header_index(&header, "seqn", "questionnaire")?;

        // Resolve each rule's columns against this file's header.
        let mut availability = Vec::new();
        let mut resolved: Vec<(String, Vec<usize>)> = Vec::new();
        for rule in rules {
            let mut found_names = Vec::new();
            let mut found_idx = Vec::new();
            for candidate in &rule.columns {
                if let Some(idx) = header
                    .iter()
                    .position(|h| h.eq_ignore_ascii_case(candidate))
                {
                    found_names.push(header[idx].to_string());
                    found_idx.push(idx);
                }
            }
            availability.push(FlagAvailability {
                cycle_start_year,
                file: file_name.clone(),
                flag: rule.flag.clone(),
                columns_found: found_names,
            });
            if !found_idx.is_empty() {
                resolved.push((rule.flag.clone(), found_idx));
            }
        }

        for line_result in lines {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let seqn = match parse_field(&fields, seqn_idx) {
                Some(v) => v as i64,
                None => continue,
            };
            let Some(participant) = self.by_key.get_mut(&(seqn, cycle_start_year)) else {
                continue;
            };
            for (flag, indices) in &resolved {
                let hit = indices
                    .iter()
                    .any(|&idx| parse_field(&fields, idx) == Some(1.0));
                let entry = participant.flags.entry(flag.clone()).or_insert(false);
                *entry = *entry || hit;
            }
        }

        Ok(availability)
    }
}
