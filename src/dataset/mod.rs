//! Analysis dataset builder: join raw cycle tables against the pool catalog
//! and the participant table, convert units, and emit long-format records.
//!
//! Individual value-parse failures are counted and dropped, never fatal.
//! Missing files or a missing subject-id column are fatal for the stage.

use crate::data::{
    BiomarkerRecord, CycleInfo, HealthyCriteria, LongDataset, ParticipantTable, ValueProfile,
    VariableManifest,
};
use crate::error::{BiopoolError, Result};
use crate::screen::{PoolCatalog, ScreenReason};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One raw per-cycle wide table: a subject-id column plus variable columns.
#[derive(Debug, Clone)]
pub struct CycleTable {
    /// Data file name (e.g. "BIOPRO_J").
    pub file: String,
    /// Collection cycle.
    pub cycle: CycleInfo,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    seqn_idx: usize,
}

impl CycleTable {
    /// Load a wide TSV table. The `seqn` column is required.
    pub fn from_tsv<P: AsRef<Path>>(path: P, file_name: &str, cycle: CycleInfo) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines.next().ok_or_else(|| {
            BiopoolError::EmptyData(format!("cycle table '{}' is empty", file_name))
        })??;
        let header: Vec<String> = header_line.split('\t').map(String::from).collect();
        let seqn_idx = header
            .iter()
            .position(|h| h.eq_ignore_ascii_case("seqn"))
            .ok_or_else(|| BiopoolError::MissingColumn {
                table: format!("cycle table '{}'", file_name),
                column: "seqn".to_string(),
            })?;

        let mut rows = Vec::new();
        for line_result in lines {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(line.split('\t').map(String::from).collect());
        }

        Ok(Self {
            file: file_name.to_string(),
            cycle,
            header,
            rows,
            seqn_idx,
        })
    }

    /// Column index of a variable code, case-insensitive.
    pub fn column_index(&self, code: &str) -> Option<usize> {
        self.header.iter().position(|h| h.eq_ignore_ascii_case(code))
    }

    /// Variable columns in file order (everything except the id column).
    pub fn variable_columns(&self) -> impl Iterator<Item = (usize, &str)> {
        let seqn_idx = self.seqn_idx;
        self.header
            .iter()
            .enumerate()
            .filter(move |(idx, _)| *idx != seqn_idx)
            .map(|(idx, name)| (idx, name.as_str()))
    }

    /// Number of data rows.
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    fn cell(&self, row: usize, col: usize) -> &str {
        self.rows[row].get(col).map(String::as_str).unwrap_or("")
    }

    fn seqn(&self, row: usize) -> Option<i64> {
        self.cell(row, self.seqn_idx)
            .trim()
            .parse::<f64>()
            .ok()
            .map(|v| v as i64)
    }
}

/// Scan cycle tables and summarize each manifest variable's observed values.
///
/// Variables whose file was loaded but whose column is absent get an empty
/// profile (n = 0), which screening reports as missing-in-file. Variables
/// whose file was not loaded stay unprofiled.
pub fn profile_variables(
    tables: &[CycleTable],
    manifest: &VariableManifest,
) -> HashMap<(String, String), ValueProfile> {
    let table_by_file: HashMap<&str, &CycleTable> =
        tables.iter().map(|t| (t.file.as_str(), t)).collect();

    let mut profiles = HashMap::new();
    for var in manifest.variables() {
        let Some(table) = table_by_file.get(var.file.as_str()) else {
            continue;
        };
        let profile = match table.column_index(&var.code) {
            Some(col) => {
                let values: Vec<f64> = (0..table.n_rows())
                    .filter_map(|row| table.cell(row, col).trim().parse::<f64>().ok())
                    .collect();
                ValueProfile::from_values(&values)
            }
            None => ValueProfile {
                n: 0,
                n_distinct: 0,
                integer_like_frac: 1.0,
            },
        };
        profiles.insert((var.file.clone(), var.code.clone()), profile);
    }
    profiles
}

/// Build outcome for one (file, variable) column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableBuildOutcome {
    pub file: String,
    pub cycle_start_year: i32,
    pub variable_code: String,
    pub pool_id: String,
    /// Values present in the column.
    pub n_values: usize,
    /// Values dropped because they did not parse as numeric.
    pub n_skipped_parse: usize,
    /// Values dropped because the subject is outside the cohort.
    pub n_outside_cohort: usize,
    /// Values dropped because the subject already has a record for this
    /// pool (dual-coded columns of the same analyte).
    pub n_duplicate: usize,
    /// Records written.
    pub n_kept: usize,
    /// Set when the column produced no records at all.
    pub empty_reason: Option<ScreenReason>,
}

/// Audit of one dataset build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetAudit {
    pub outcomes: Vec<VariableBuildOutcome>,
    pub n_rows: usize,
    pub n_files: usize,
}

impl DatasetAudit {
    /// Total values dropped on numeric-parse failure.
    pub fn total_parse_skips(&self) -> usize {
        self.outcomes.iter().map(|o| o.n_skipped_parse).sum()
    }

    /// Write the audit table as CSV.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "data_file_name",
            "cycle_start_year",
            "variable_code",
            "pool_id",
            "n_values",
            "n_skipped_parse",
            "n_outside_cohort",
            "n_duplicate",
            "n_kept",
            "empty_reason",
        ])?;
        for o in &self.outcomes {
            writer.write_record(&[
                o.file.clone(),
                o.cycle_start_year.to_string(),
                o.variable_code.clone(),
                o.pool_id.clone(),
                o.n_values.to_string(),
                o.n_skipped_parse.to_string(),
                o.n_outside_cohort.to_string(),
                o.n_duplicate.to_string(),
                o.n_kept.to_string(),
                o.empty_reason.map(|r| r.code()).unwrap_or("").to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Join cycle tables against the catalog and participants.
///
/// One output row per (subject, pooled biomarker) occurrence; subjects
/// missing a biomarker contribute no row. Values are converted to the
/// pool's canonical unit before being written.
pub fn build_long_dataset(
    tables: &[CycleTable],
    catalog: &PoolCatalog,
    participants: &ParticipantTable,
    criteria: &HealthyCriteria,
) -> Result<(LongDataset, DatasetAudit)> {
    if participants.is_empty() {
        return Err(BiopoolError::EmptyData(
            "participant table is empty".to_string(),
        ));
    }

    let mut dataset = LongDataset::new();
    let mut audit = DatasetAudit::default();
    // One row per (subject, pool): dual-coded columns of the same analyte
    // must not double a subject's contribution.
    let mut seen: std::collections::HashSet<(i64, String)> = std::collections::HashSet::new();

    for table in tables {
        let year = table.cycle.start_year;
        for (col, code) in table.variable_columns() {
            let Some((group, member)) = catalog.lookup(code) else {
                continue;
            };

            let mut n_values = 0usize;
            let mut n_skipped_parse = 0usize;
            let mut n_outside_cohort = 0usize;
            let mut n_duplicate = 0usize;
            let mut n_kept = 0usize;

            for row in 0..table.n_rows() {
                let raw = table.cell(row, col).trim();
                if raw.is_empty() {
                    continue;
                }
                n_values += 1;
                let Ok(value) = raw.parse::<f64>() else {
                    n_skipped_parse += 1;
                    continue;
                };
                if !value.is_finite() {
                    n_skipped_parse += 1;
                    continue;
                }
                let Some(seqn) = table.seqn(row) else {
                    n_skipped_parse += 1;
                    continue;
                };
                let Some(participant) = participants.get(seqn, year) else {
                    n_outside_cohort += 1;
                    continue;
                };
                if !criteria.admits(participant) {
                    n_outside_cohort += 1;
                    continue;
                }
                if !seen.insert((seqn, group.pool_id.clone())) {
                    n_duplicate += 1;
                    continue;
                }

                dataset.push(BiomarkerRecord {
                    seqn,
                    biomarker_id: group.pool_id.clone(),
                    biomarker_name: group.canonical_name.clone(),
                    variable_code: member.code.clone(),
                    unit: group.canonical_unit.clone(),
                    age_years: participant.age_years,
                    sex: participant.sex,
                    value: value * member.factor_to_canonical,
                    cycle_label: table.cycle.label.clone(),
                    cycle_start_year: year,
                    source_file: table.file.clone(),
                });
                n_kept += 1;
            }

            // A column whose every value deduplicated away still carried
            // healthy data; only truly empty columns get the reason.
            let empty_reason = if n_kept == 0 && n_duplicate == 0 {
                Some(ScreenReason::NoHealthyData)
            } else {
                None
            };
            audit.outcomes.push(VariableBuildOutcome {
                file: table.file.clone(),
                cycle_start_year: year,
                variable_code: code.to_string(),
                pool_id: group.pool_id.clone(),
                n_values,
                n_skipped_parse,
                n_outside_cohort,
                n_duplicate,
                n_kept,
                empty_reason,
            });
        }
        audit.n_files += 1;
    }

    audit.n_rows = dataset.len();
    log::info!(
        "built long dataset: {} rows from {} files ({} parse skips)",
        audit.n_rows,
        audit.n_files,
        audit.total_parse_skips()
    );
    Ok((dataset, audit))
}
