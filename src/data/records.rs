//! Long-format biomarker records: the harmonized analysis dataset.

use crate::data::participants::Sex;
use crate::error::{BiopoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// One pooled measurement for one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiomarkerRecord {
    /// Subject sequence number.
    pub seqn: i64,
    /// Pooled biomarker id from the catalog.
    pub biomarker_id: String,
    /// Pooled display name.
    pub biomarker_name: String,
    /// Source variable code the value came from.
    pub variable_code: String,
    /// Canonical unit the value is expressed in.
    pub unit: String,
    /// Subject age in years.
    pub age_years: f64,
    /// Subject sex.
    pub sex: Sex,
    /// Measurement converted to the canonical unit.
    pub value: f64,
    /// Cycle label.
    pub cycle_label: String,
    /// Cycle start year.
    pub cycle_start_year: i32,
    /// Data file the value came from.
    pub source_file: String,
}

/// The harmonized long dataset: sparse, one row per (subject, biomarker).
#[derive(Debug, Clone, Default)]
pub struct LongDataset {
    records: Vec<BiomarkerRecord>,
}

const COLUMNS: [&str; 11] = [
    "seqn",
    "biomarker_id",
    "biomarker_name",
    "variable_code",
    "unit",
    "age_years",
    "sex",
    "value",
    "cycle_label",
    "cycle_start_year",
    "source_file",
];

impl LongDataset {
    /// Create an empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&mut self, record: BiomarkerRecord) {
        self.records.push(record);
    }

    /// Append many records.
    pub fn extend(&mut self, records: impl IntoIterator<Item = BiomarkerRecord>) {
        self.records.extend(records);
    }

    /// All records in insertion order.
    pub fn records(&self) -> &[BiomarkerRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Group records by pooled biomarker id, in sorted id order.
    pub fn by_biomarker(&self) -> BTreeMap<&str, Vec<&BiomarkerRecord>> {
        let mut groups: BTreeMap<&str, Vec<&BiomarkerRecord>> = BTreeMap::new();
        for record in &self.records {
            groups
                .entry(record.biomarker_id.as_str())
                .or_default()
                .push(record);
        }
        groups
    }

    /// Distinct biomarker ids, sorted.
    pub fn biomarker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .iter()
            .map(|r| r.biomarker_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Write the dataset to a TSV file. Reruns overwrite wholesale.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{}", COLUMNS.join("\t"))?;
        for r in &self.records {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                r.seqn,
                r.biomarker_id,
                r.biomarker_name,
                r.variable_code,
                r.unit,
                r.age_years,
                r.sex.as_str(),
                r.value,
                r.cycle_label,
                r.cycle_start_year,
                r.source_file,
            )?;
        }
        Ok(())
    }

    /// Load a dataset previously written by [`LongDataset::to_tsv`].
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| BiopoolError::EmptyData("empty long dataset".to_string()))??;
        let header: Vec<&str> = header_line.split('\t').collect();
        for required in COLUMNS {
            if !header.iter().any(|h| *h == required) {
                return Err(BiopoolError::MissingColumn {
                    table: "long dataset".to_string(),
                    column: required.to_string(),
                });
            }
        }
        let idx = |name: &str| header.iter().position(|h| *h == name).unwrap();
        let (seqn_i, id_i, name_i, code_i, unit_i, age_i, sex_i, value_i, label_i, year_i, file_i) = (
            idx("seqn"),
            idx("biomarker_id"),
            idx("biomarker_name"),
            idx("variable_code"),
            idx("unit"),
            idx("age_years"),
            idx("sex"),
            idx("value"),
            idx("cycle_label"),
            idx("cycle_start_year"),
            idx("source_file"),
        );

        let mut records = Vec::new();
        for (line_no, line_result) in lines.enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let field = |i: usize| fields.get(i).copied().unwrap_or("");
            let parse_f64 = |i: usize, col: &str| -> Result<f64> {
                field(i).parse().map_err(|_| BiopoolError::SchemaMismatch {
                    table: "long dataset".to_string(),
                    reason: format!("unparseable {} at data row {}", col, line_no + 1),
                })
            };

            records.push(BiomarkerRecord {
                seqn: parse_f64(seqn_i, "seqn")? as i64,
                biomarker_id: field(id_i).to_string(),
                biomarker_name: field(name_i).to_string(),
                variable_code: field(code_i).to_string(),
                unit: field(unit_i).to_string(),
                age_years: parse_f64(age_i, "age_years")?,
                sex: Sex::parse(field(sex_i)),
                value: parse_f64(value_i, "value")?,
                cycle_label: field(label_i).to_string(),
                cycle_start_year: parse_f64(year_i, "cycle_start_year")? as i32,
                source_file: field(file_i).to_string(),
            });
        }

        Ok(Self { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_record(seqn: i64, id: &str, value: f64) -> BiomarkerRecord {
        BiomarkerRecord {
            seqn,
            biomarker_id: id.to_string(),
            biomarker_name: "Albumin (g/dL)".to_string(),
            variable_code: "LBXSAL".to_string(),
            unit: "g/dL".to_string(),
            age_years: 42.0,
            sex: Sex::Female,
            value,
            cycle_label: "2017-2018".to_string(),
            cycle_start_year: 2017,
            source_file: "BIOPRO_J".to_string(),
        }
    }

    #[test]
    fn test_tsv_roundtrip() {
        let mut dataset = LongDataset::new();
        dataset.push(sample_record(1001, "albumin", 4.3));
        dataset.push(sample_record(1002, "albumin", 4.1));
        dataset.push(sample_record(1001, "glucose", 95.0));

        let file = NamedTempFile::new().unwrap();
        dataset.to_tsv(file.path()).unwrap();
        let loaded = LongDataset::from_tsv(file.path()).unwrap();

        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.records()[0].seqn, 1001);
        assert_eq!(loaded.records()[0].sex, Sex::Female);
        assert!((loaded.records()[1].value - 4.1).abs() < 1e-12);
    }

    #[test]
    fn test_by_biomarker_sorted() {
        let mut dataset = LongDataset::new();
        dataset.push(sample_record(1, "glucose", 95.0));
        dataset.push(sample_record(2, "albumin", 4.3));
        dataset.push(sample_record(3, "albumin", 4.0));

        let groups = dataset.by_biomarker();
        let ids: Vec<&str> = groups.keys().copied().collect();
        assert_eq!(ids, vec!["albumin", "glucose"]);
        assert_eq!(groups["albumin"].len(), 2);
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let mut file = NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(file, "seqn\tbiomarker_id").unwrap();
        writeln!(file, "1\talbumin").unwrap();
        file.flush().unwrap();

        let err = LongDataset::from_tsv(file.path()).unwrap_err();
        assert!(matches!(err, BiopoolError::MissingColumn { .. }));
    }
}
