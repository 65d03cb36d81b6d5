//! Biopool: harmonization and age-trend analysis of blood-biomarker surveys.
//!
//! This library pools semantically equivalent laboratory variables across
//! survey collection cycles, screens out non-analytic fields with an audited
//! reason per variable, builds a healthy-cohort long dataset in canonical
//! units, and derives age-binned summary statistics and trend metrics.
//!
//! # Overview
//!
//! The library is organized into staged modules:
//!
//! - **data**: Core data structures (manifest, participants, long records)
//! - **units**: Unit recognition and linear conversion between families
//! - **screen**: Ordered screening rules and the pooling resolver
//! - **dataset**: Analysis dataset builder (join, convert, audit)
//! - **metrics**: Age bins, trimmed statistics, Spearman trend metrics
//! - **export**: Dashboard JSON artifacts
//! - **pipeline**: Stage runner over an on-disk workspace
//!
//! # Example
//!
//! ```no_run
//! use biopool::prelude::*;
//!
//! let config = AnalysisConfig::default();
//! let workspace = Workspace::new("data");
//!
//! let outcome = workspace.run_screen().unwrap();
//! println!("{} pools resolved", outcome.catalog.len());
//!
//! let (dataset, _audit) = workspace.run_build(&config).unwrap();
//! let stats = compute_bin_stats(&dataset, &config.metrics).unwrap();
//! let trends = compute_trend_metrics(&stats, &config.metrics);
//! ```

pub mod data;
pub mod dataset;
pub mod error;
pub mod export;
pub mod metrics;
pub mod pipeline;
pub mod screen;
pub mod units;

/// Commonly used types and functions.
pub mod prelude {
    pub use crate::data::{
        BiomarkerRecord, CycleInfo, HealthyCriteria, LongDataset, Participant, ParticipantTable,
        RawVariable, Sex, ValueProfile, VariableManifest,
    };
    pub use crate::dataset::{build_long_dataset, profile_variables, CycleTable, DatasetAudit};
    pub use crate::error::{BiopoolError, Result};
    pub use crate::export::{export_dashboard, ExportConfig, ExportSummary};
    pub use crate::metrics::{
        compute_bin_stats, compute_trend, compute_trend_metrics, rank_trends, spearman,
        AgeBinStat, AgeBins, CohortSelection, MetricsConfig, RankMode, RankingConfig, SexCohort,
        StatisticKind, TrendMetric,
    };
    pub use crate::pipeline::{AnalysisConfig, Workspace};
    pub use crate::screen::{
        resolve_pools, AllowList, PoolCatalog, PoolGroup, ScreenOutcome, ScreenReason,
        ScreeningDecision, SynonymTable,
    };
    pub use crate::units::UnitTable;
}
