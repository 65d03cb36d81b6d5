//! Name normalization and the pooling resolver.
//!
//! Variables that survive screening pool together when their normalized
//! analyte names match and their units share a quantity family. The resolver
//! is deterministic: identical manifests produce identical pool ids,
//! membership, and ordering.

use crate::data::{RawVariable, VariableManifest};
use crate::error::{BiopoolError, Result};
use crate::screen::rules::{screen_variable, AllowList, ScreenReason, ScreeningDecision};
use crate::units::{normalize_unit, UnitTable};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::OnceLock;

fn non_name_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9 %/+-]").unwrap())
}

fn whitespace_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Normalize an analyte label into a pooling key candidate.
///
/// Folds greek letters and unicode dashes, lowercases, and collapses
/// everything outside a small safe alphabet into single spaces.
pub fn normalize_base_name(name: &str) -> String {
    let mut s = name.to_lowercase();
    for (from, to) in [
        ("\u{03b1}", "a"),
        ("\u{03b2}", "b"),
        ("\u{03b3}", "g"),
        ("\u{03b4}", "d"),
        ("\u{00b5}", "u"),
        ("\u{03bc}", "u"),
        ("\u{2013}", "-"),
        ("\u{2014}", "-"),
    ] {
        s = s.replace(from, to);
    }
    let s = non_name_chars().replace_all(&s, " ");
    whitespace_runs().replace_all(s.trim(), " ").to_string()
}

/// Label phrases that encode assay technique or collection vial rather than
/// analyte identity. Stripped before synonym lookup so that the same serum
/// test published under different technique wordings pools together.
const TECHNIQUE_PHRASES: &[&str] = &[
    "refrigerated serum",
    "frozen serum",
    "si units",
];

fn strip_technique_phrases(normalized: &str) -> String {
    let mut s = normalized.to_string();
    for phrase in TECHNIQUE_PHRASES {
        s = s.replace(phrase, " ");
    }
    whitespace_runs().replace_all(s.trim(), " ").to_string()
}

/// Editable synonym table mapping normalized names to one canonical token.
///
/// This is a maintained heuristic list, not an ontology; entries are keyed
/// by the fully normalized name after technique-phrase stripping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynonymTable {
    entries: BTreeMap<String, String>,
}

impl Default for SynonymTable {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        for (alias, canonical) in [
            ("serum albumin", "albumin"),
            ("hs c reactive protein", "c reactive protein"),
            ("high sensitivity c reactive protein", "c reactive protein"),
            ("sgot aspartate aminotransferase", "aspartate aminotransferase ast"),
            ("sgpt alanine aminotransferase", "alanine aminotransferase alt"),
            ("total calcium", "calcium total"),
        ] {
            entries.insert(alias.to_string(), canonical.to_string());
        }
        Self { entries }
    }
}

impl SynonymTable {
    /// An empty table.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Add a mapping; both sides are normalized.
    pub fn with_synonym(mut self, alias: &str, canonical: &str) -> Self {
        self.entries
            .insert(normalize_base_name(alias), normalize_base_name(canonical));
        self
    }

    /// Canonical pooling key for a raw label.
    pub fn canonical_key(&self, base_label: &str) -> String {
        let stripped = strip_technique_phrases(&normalize_base_name(base_label));
        match self.entries.get(&stripped) {
            Some(canonical) => canonical.clone(),
            None => stripped,
        }
    }
}

/// One member variable of a pool group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMember {
    /// Variable code name.
    pub code: String,
    /// Representative label the member was pooled under.
    pub label: String,
    /// Raw unit text of the member.
    pub unit: String,
    /// Linear factor converting member values to the canonical unit.
    pub factor_to_canonical: f64,
    /// Data files the member appears in, sorted.
    pub files: Vec<String>,
}

/// A pooled analyte: members across cycles sharing name and unit family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolGroup {
    /// Stable pool id (name key, unit-disambiguated when necessary).
    pub pool_id: String,
    /// Canonical analyte display name (reference member's base label).
    pub canonical_name: String,
    /// Canonical unit all member values convert into.
    pub canonical_unit: String,
    /// Unit family key shared by all members.
    pub family: String,
    /// Members sorted by code.
    pub members: Vec<PoolMember>,
}

/// The finalized pool catalog for a run.
#[derive(Debug, Clone, Default)]
pub struct PoolCatalog {
    groups: Vec<PoolGroup>,
    by_code: HashMap<String, usize>,
}

impl PoolCatalog {
    /// Rebuild a catalog from its groups (e.g. loaded from disk).
    pub fn from_groups(groups: Vec<PoolGroup>) -> Self {
        Self::new(groups)
    }

    /// Persist the full catalog (members and factors included) as JSON.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), &self.groups)?;
        Ok(())
    }

    /// Load a catalog previously written by [`PoolCatalog::to_json_file`].
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let groups: Vec<PoolGroup> = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(Self::new(groups))
    }

    fn new(groups: Vec<PoolGroup>) -> Self {
        let mut by_code = HashMap::new();
        for (idx, group) in groups.iter().enumerate() {
            for member in &group.members {
                by_code.insert(member.code.clone(), idx);
            }
        }
        Self { groups, by_code }
    }

    /// Groups in stable (canonical name, pool id) order.
    pub fn groups(&self) -> &[PoolGroup] {
        &self.groups
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Look up the group and member entry for a variable code.
    pub fn lookup(&self, code: &str) -> Option<(&PoolGroup, &PoolMember)> {
        let group = &self.groups[*self.by_code.get(code)?];
        let member = group.members.iter().find(|m| m.code == code)?;
        Some((group, member))
    }

    /// Write the catalog table as CSV. Byte-stable across reruns.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "pool_id",
            "canonical_name",
            "canonical_unit",
            "unit_family",
            "source_variable_count",
            "source_variables",
            "source_file_count",
            "source_files",
        ])?;
        for group in &self.groups {
            let codes: Vec<&str> = group.members.iter().map(|m| m.code.as_str()).collect();
            let mut files: Vec<&str> = group
                .members
                .iter()
                .flat_map(|m| m.files.iter().map(String::as_str))
                .collect();
            files.sort_unstable();
            files.dedup();
            writer.write_record(&[
                group.pool_id.clone(),
                group.canonical_name.clone(),
                group.canonical_unit.clone(),
                group.family.clone(),
                codes.len().to_string(),
                codes.join("|"),
                files.len().to_string(),
                files.join("|"),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Resolver output: the catalog plus one decision per manifest row.
#[derive(Debug, Clone)]
pub struct ScreenOutcome {
    pub catalog: PoolCatalog,
    pub decisions: Vec<ScreeningDecision>,
}

impl ScreenOutcome {
    /// Write the screening-decision audit table as CSV.
    pub fn decisions_to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "cycle_start_year",
            "data_file_name",
            "variable_code",
            "variable_label",
            "decision",
            "reason",
            "pool_id",
        ])?;
        for d in &self.decisions {
            let year = d.cycle_start_year.to_string();
            writer.write_record([
                year.as_str(),
                d.file.as_str(),
                d.variable_code.as_str(),
                d.variable_label.as_str(),
                if d.included { "included" } else { "excluded" },
                d.reason.map(|r| r.code()).unwrap_or(""),
                d.pool_id.as_deref().unwrap_or(""),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Per-code representative: the most frequent (label, unit) pair, with ties
/// broken lexicographically so reruns agree.
fn representative<'a>(rows: &[&'a RawVariable]) -> &'a RawVariable {
    let mut counts: HashMap<(&str, &str), usize> = HashMap::new();
    for row in rows {
        *counts
            .entry((row.base_label.as_str(), row.unit.as_str()))
            .or_insert(0) += 1;
    }
    rows.iter()
        .copied()
        .max_by(|a, b| {
            let ca = counts[&(a.base_label.as_str(), a.unit.as_str())];
            let cb = counts[&(b.base_label.as_str(), b.unit.as_str())];
            ca.cmp(&cb)
                .then_with(|| b.base_label.cmp(&a.base_label))
                .then_with(|| b.unit.cmp(&a.unit))
        })
        .unwrap()
}

/// Run screening and pooling over the full manifest.
///
/// Every manifest row receives exactly one [`ScreeningDecision`]; survivors
/// are grouped into [`PoolGroup`]s with per-member conversion factors to the
/// group's canonical unit.
pub fn resolve_pools(
    manifest: &VariableManifest,
    units: &UnitTable,
    synonyms: &SynonymTable,
    allow: &AllowList,
) -> Result<ScreenOutcome> {
    if manifest.is_empty() {
        return Err(BiopoolError::EmptyData(
            "cannot resolve pools over an empty manifest".to_string(),
        ));
    }

    // Row-level screening. `row_reasons[i]` is the rule exclusion for
    // manifest row i, if any.
    let mut row_reasons: Vec<Option<ScreenReason>> = Vec::with_capacity(manifest.len());
    for var in manifest.variables() {
        row_reasons.push(screen_variable(var, allow));
    }

    // Collect surviving rows per code, then resolve each code's identity.
    let mut rows_by_code: BTreeMap<&str, Vec<&RawVariable>> = BTreeMap::new();
    for (var, reason) in manifest.variables().iter().zip(&row_reasons) {
        if reason.is_none() {
            rows_by_code.entry(var.code.as_str()).or_default().push(var);
        }
    }

    // Unit resolution per code; unresolvable codes get a reason applied to
    // all of their surviving rows.
    struct CodeEntry<'a> {
        code: &'a str,
        name_key: String,
        family: String,
        unit: String,
        label: String,
        files: Vec<String>,
        file_count: usize,
    }
    let mut entries: Vec<CodeEntry> = Vec::new();
    let mut unit_rejected: HashMap<&str, ScreenReason> = HashMap::new();

    for (code, rows) in &rows_by_code {
        let rep = representative(rows);
        let Some(family) = units.family(&rep.unit) else {
            unit_rejected.insert(*code, ScreenReason::UnrecognizedUnit);
            continue;
        };
        let mut files: Vec<String> = rows.iter().map(|r| r.file.clone()).collect();
        files.sort();
        files.dedup();
        entries.push(CodeEntry {
            code: *code,
            name_key: synonyms.canonical_key(&rep.base_label),
            family,
            unit: rep.unit.clone(),
            label: rep.base_label.clone(),
            file_count: files.len(),
            files,
        });
    }

    // Group codes by (name key, family). A name spanning several families
    // splits into unit-disambiguated pools.
    let mut families_per_name: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for entry in &entries {
        let fams = families_per_name.entry(entry.name_key.as_str()).or_default();
        if !fams.contains(&entry.family.as_str()) {
            fams.push(entry.family.as_str());
        }
    }

    let mut grouped: BTreeMap<(String, String), Vec<&CodeEntry>> = BTreeMap::new();
    for entry in &entries {
        grouped
            .entry((entry.name_key.clone(), entry.family.clone()))
            .or_default()
            .push(entry);
    }

    let mut groups: Vec<PoolGroup> = Vec::new();
    let mut pool_of_code: HashMap<String, String> = HashMap::new();

    for ((name_key, family), mut members) in grouped {
        // Reference member: observed in the most files, ties to the
        // lexicographically smallest code.
        members.sort_by(|a, b| a.code.cmp(b.code));
        let reference = members
            .iter()
            .max_by(|a, b| a.file_count.cmp(&b.file_count).then_with(|| b.code.cmp(a.code)))
            .copied()
            .expect("group cannot be empty");

        let multi_family = families_per_name[name_key.as_str()].len() > 1;
        let pool_id = if multi_family {
            let suffix = normalize_unit(&reference.unit);
            let suffix = if suffix.is_empty() {
                family.replace(':', "_")
            } else {
                suffix
            };
            format!("{}__{}", name_key, suffix)
        } else {
            name_key.clone()
        };

        let mut pool_members = Vec::with_capacity(members.len());
        for entry in &members {
            let factor = units
                .conversion_factor(&entry.unit, &reference.unit)
                .ok_or_else(|| BiopoolError::Pipeline(format!(
                    "units '{}' and '{}' share family '{}' but have no conversion factor",
                    entry.unit, reference.unit, family
                )))?;
            pool_of_code.insert(entry.code.to_string(), pool_id.clone());
            pool_members.push(PoolMember {
                code: entry.code.to_string(),
                label: entry.label.clone(),
                unit: entry.unit.clone(),
                factor_to_canonical: factor,
                files: entry.files.clone(),
            });
        }

        groups.push(PoolGroup {
            pool_id,
            canonical_name: reference.label.clone(),
            canonical_unit: reference.unit.clone(),
            family,
            members: pool_members,
        });
    }

    // Stable output order: canonical name, then pool id.
    groups.sort_by(|a, b| {
        a.canonical_name
            .cmp(&b.canonical_name)
            .then_with(|| a.pool_id.cmp(&b.pool_id))
    });

    // Emit one decision per manifest row, in manifest order.
    let mut decisions = Vec::with_capacity(manifest.len());
    for (var, rule_reason) in manifest.variables().iter().zip(&row_reasons) {
        let (included, reason, pool_id) = match rule_reason {
            Some(reason) => (false, Some(*reason), None),
            None => match unit_rejected.get(var.code.as_str()) {
                Some(reason) => (false, Some(*reason), None),
                None => match pool_of_code.get(var.code.as_str()) {
                    Some(pool_id) => (true, None, Some(pool_id.clone())),
                    // Survived rules but its code resolved to nothing
                    // (cannot happen today; kept as a hard failure).
                    None => {
                        return Err(BiopoolError::Pipeline(format!(
                            "variable '{}' survived screening but joined no pool",
                            var.code
                        )))
                    }
                },
            },
        };
        decisions.push(ScreeningDecision {
            cycle_start_year: var.cycle.start_year,
            file: var.file.clone(),
            variable_code: var.code.clone(),
            variable_label: var.label.clone(),
            included,
            reason,
            pool_id,
        });
    }

    Ok(ScreenOutcome {
        catalog: PoolCatalog::new(groups),
        decisions,
    })
}
