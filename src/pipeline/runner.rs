//! Stage runner over an on-disk workspace.
//!
//! Each stage runs to completion, reads the previous stage's persisted
//! artifacts, and overwrites its own outputs wholesale. Downstream stages
//! re-derive from the frozen long dataset, so the metrics and export stages
//! can be rerun with different parameterizations at any time.
//!
//! Workspace layout:
//!
//! ```text
//! <root>/
//!   manifest.csv               variable manifest (input)
//!   tables/<FILE>.tsv          wide cycle tables named by data file (input)
//!   demographics/<year>.tsv    per-cycle demographics (input)
//!   questionnaire/<year>_*.tsv per-cycle flag files (input)
//!   out/                       stage artifacts (output)
//! ```

use crate::data::{
    default_flag_rules, HealthyCriteria, LongDataset, ParticipantTable, VariableManifest,
};
use crate::dataset::{build_long_dataset, profile_variables, CycleTable, DatasetAudit};
use crate::error::{BiopoolError, Result};
use crate::export::{export_dashboard, ExportConfig, ExportSummary};
use crate::metrics::{
    compute_bin_stats, compute_trend_metrics, write_bin_stats_tsv, write_trend_metrics_tsv,
    AgeBinStat, MetricsConfig, RankingConfig, TrendMetric,
};
use crate::screen::{
    resolve_pools, AllowList, PoolCatalog, ScreenOutcome, SynonymTable,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Full analysis configuration, loadable from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Metrics derivation settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Trend ranking settings.
    #[serde(default)]
    pub ranking: RankingConfig,
    /// Exporter settings.
    #[serde(default)]
    pub export: ExportConfig,
    /// Healthy-cohort criteria for the dataset build.
    #[serde(default)]
    pub cohort_criteria: HealthyCriteria,
}

impl AnalysisConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Filesystem layout of one analysis run.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open a workspace rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.csv")
    }

    pub fn tables_dir(&self) -> PathBuf {
        self.root.join("tables")
    }

    pub fn demographics_dir(&self) -> PathBuf {
        self.root.join("demographics")
    }

    pub fn questionnaire_dir(&self) -> PathBuf {
        self.root.join("questionnaire")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join("out")
    }

    pub fn decisions_path(&self) -> PathBuf {
        self.out_dir().join("screening_decisions.csv")
    }

    pub fn catalog_csv_path(&self) -> PathBuf {
        self.out_dir().join("pool_catalog.csv")
    }

    pub fn catalog_json_path(&self) -> PathBuf {
        self.out_dir().join("pool_catalog.json")
    }

    pub fn long_dataset_path(&self) -> PathBuf {
        self.out_dir().join("biomarker_long.tsv")
    }

    pub fn build_audit_path(&self) -> PathBuf {
        self.out_dir().join("build_audit.csv")
    }

    pub fn flag_availability_path(&self) -> PathBuf {
        self.out_dir().join("flag_availability.csv")
    }

    pub fn bin_stats_path(&self) -> PathBuf {
        self.out_dir().join("age_bin_stats.tsv")
    }

    pub fn trend_metrics_path(&self) -> PathBuf {
        self.out_dir().join("trend_metrics.tsv")
    }

    pub fn dashboard_dir(&self) -> PathBuf {
        self.out_dir().join("dashboard")
    }

    fn ensure_out_dir(&self) -> Result<()> {
        fs::create_dir_all(self.out_dir())?;
        Ok(())
    }

    /// Load every cycle table named by the manifest that exists on disk.
    ///
    /// A table absent from `tables/` leaves its variables unprofiled; a
    /// present table that fails to parse is fatal.
    fn load_cycle_tables(&self, manifest: &VariableManifest) -> Result<Vec<CycleTable>> {
        let mut cycles_by_file: Vec<(String, crate::data::CycleInfo)> = Vec::new();
        let mut seen: HashMap<&str, ()> = HashMap::new();
        for var in manifest.variables() {
            if seen.insert(var.file.as_str(), ()).is_none() {
                cycles_by_file.push((var.file.clone(), var.cycle.clone()));
            }
        }

        let mut tables = Vec::new();
        for (file, cycle) in cycles_by_file {
            let path = self.tables_dir().join(format!("{}.tsv", file));
            if !path.exists() {
                log::warn!("cycle table not found, skipping: {}", path.display());
                continue;
            }
            tables.push(CycleTable::from_tsv(&path, &file, cycle)?);
        }
        Ok(tables)
    }

    /// Load participants from the demographics and questionnaire inputs.
    ///
    /// File names must start with the cycle start year ("2017.tsv",
    /// "2017_MCQ.tsv"); unparseable names are skipped with a warning.
    fn load_participants(&self) -> Result<(ParticipantTable, Vec<crate::data::FlagAvailability>)> {
        let mut participants = ParticipantTable::new();

        let demo_dir = self.demographics_dir();
        if !demo_dir.is_dir() {
            return Err(BiopoolError::EmptyData(format!(
                "demographics directory missing: {}",
                demo_dir.display()
            )));
        }
        let mut demo_files: Vec<PathBuf> = fs::read_dir(&demo_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "tsv"))
            .collect();
        demo_files.sort();
        for path in &demo_files {
            match file_year(path) {
                Some(year) => {
                    participants.merge_demographics_tsv(path, year)?;
                }
                None => log::warn!("no cycle year in file name, skipping: {}", path.display()),
            }
        }
        if participants.is_empty() {
            return Err(BiopoolError::EmptyData(
                "no demographics rows loaded".to_string(),
            ));
        }

        let rules = default_flag_rules();
        let mut availability = Vec::new();
        let q_dir = self.questionnaire_dir();
        if q_dir.is_dir() {
            let mut q_files: Vec<PathBuf> = fs::read_dir(&q_dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "tsv"))
                .collect();
            q_files.sort();
            for path in &q_files {
                match file_year(path) {
                    Some(year) => {
                        availability.extend(participants.merge_flags_tsv(path, year, &rules)?);
                    }
                    None => {
                        log::warn!("no cycle year in file name, skipping: {}", path.display())
                    }
                }
            }
        }

        Ok((participants, availability))
    }

    /// Stage 1: screen the manifest and resolve the pool catalog.
    pub fn run_screen(&self) -> Result<ScreenOutcome> {
        self.ensure_out_dir()?;
        let mut manifest = VariableManifest::from_csv(self.manifest_path())?;
        let tables = self.load_cycle_tables(&manifest)?;
        let profiles = profile_variables(&tables, &manifest);
        manifest.attach_profiles(&profiles);

        let outcome = resolve_pools(
            &manifest,
            &crate::units::UnitTable::default(),
            &SynonymTable::default(),
            &AllowList::default(),
        )?;

        outcome.decisions_to_csv(self.decisions_path())?;
        outcome.catalog.to_csv(self.catalog_csv_path())?;
        outcome.catalog.to_json_file(self.catalog_json_path())?;
        log::info!(
            "screening: {} pools from {} manifest rows",
            outcome.catalog.len(),
            outcome.decisions.len()
        );
        Ok(outcome)
    }

    /// Stage 2: build the harmonized long dataset.
    pub fn run_build(&self, config: &AnalysisConfig) -> Result<(LongDataset, DatasetAudit)> {
        self.ensure_out_dir()?;
        let catalog = PoolCatalog::from_json_file(self.catalog_json_path())?;
        let manifest = VariableManifest::from_csv(self.manifest_path())?;
        let tables = self.load_cycle_tables(&manifest)?;
        let (participants, availability) = self.load_participants()?;

        write_flag_availability(&availability, self.flag_availability_path())?;

        let (dataset, audit) =
            build_long_dataset(&tables, &catalog, &participants, &config.cohort_criteria)?;
        dataset.to_tsv(self.long_dataset_path())?;
        audit.to_csv(self.build_audit_path())?;
        Ok((dataset, audit))
    }

    /// Stage 3: derive bin statistics and trend metrics.
    pub fn run_metrics(
        &self,
        config: &AnalysisConfig,
    ) -> Result<(Vec<AgeBinStat>, Vec<TrendMetric>)> {
        self.ensure_out_dir()?;
        let dataset = LongDataset::from_tsv(self.long_dataset_path())?;
        let stats = compute_bin_stats(&dataset, &config.metrics)?;
        let trends = compute_trend_metrics(&stats, &config.metrics);
        write_bin_stats_tsv(&stats, self.bin_stats_path())?;
        write_trend_metrics_tsv(&trends, self.trend_metrics_path())?;
        log::info!(
            "metrics: {} bin stats, {} trends",
            stats.len(),
            trends.len()
        );
        Ok((stats, trends))
    }

    /// Stage 4: export dashboard artifacts.
    ///
    /// Re-derives metrics from the frozen long dataset, so it can run with
    /// any parameterization without touching earlier stages.
    pub fn run_export(&self, config: &AnalysisConfig) -> Result<ExportSummary> {
        let catalog = PoolCatalog::from_json_file(self.catalog_json_path())?;
        let dataset = LongDataset::from_tsv(self.long_dataset_path())?;
        let stats = compute_bin_stats(&dataset, &config.metrics)?;
        let trends = compute_trend_metrics(&stats, &config.metrics);
        export_dashboard(
            self.dashboard_dir(),
            &catalog,
            &stats,
            &trends,
            &dataset,
            &config.export,
        )
    }

    /// Run all stages in order.
    pub fn run_all(&self, config: &AnalysisConfig) -> Result<ExportSummary> {
        self.run_screen()?;
        self.run_build(config)?;
        self.run_metrics(config)?;
        self.run_export(config)
    }
}

fn file_year(path: &Path) -> Option<i32> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() == 4 {
        digits.parse().ok()
    } else {
        None
    }
}

fn write_flag_availability(
    availability: &[crate::data::FlagAvailability],
    path: PathBuf,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["cycle_start_year", "file", "flag", "columns_found"])?;
    for a in availability {
        writer.write_record(&[
            a.cycle_start_year.to_string(),
            a.file.clone(),
            a.flag.clone(),
            a.columns_found.join("|"),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
