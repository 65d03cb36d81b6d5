//! biopool - Blood biomarker pooling and age-trend analysis CLI
//!
//! Thin command-line shell over the library's staged pipeline.

use biopool::error::Result;
use biopool::metrics::{rank_trends, CohortSelection, RankMode, StatisticKind};
use biopool::pipeline::{AnalysisConfig, Workspace};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// CLI-friendly cohort selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliCohort {
    /// All subjects together
    Pooled,
    /// Female subjects only
    Female,
    /// Male subjects only
    Male,
    /// Female and male side by side
    Both,
}

impl From<CliCohort> for CohortSelection {
    fn from(cohort: CliCohort) -> Self {
        match cohort {
            CliCohort::Pooled => CohortSelection::Pooled,
            CliCohort::Female => CohortSelection::Female,
            CliCohort::Male => CohortSelection::Male,
            CliCohort::Both => CohortSelection::Both,
        }
    }
}

/// CLI-friendly statistic selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliStatistic {
    /// Coefficient of variation
    Cv,
    /// Bin mean
    Mean,
    /// Bin median
    Median,
    /// Bin skewness
    Skewness,
}

impl From<CliStatistic> for StatisticKind {
    fn from(statistic: CliStatistic) -> Self {
        match statistic {
            CliStatistic::Cv => StatisticKind::Cv,
            CliStatistic::Mean => StatisticKind::Mean,
            CliStatistic::Median => StatisticKind::Median,
            CliStatistic::Skewness => StatisticKind::Skewness,
        }
    }
}

/// CLI-friendly ranking sort mode.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSort {
    /// Most negative Spearman rho first
    Negative,
    /// Most positive Spearman rho first
    Positive,
    /// Largest absolute Spearman rho first
    Absolute,
}

impl From<CliSort> for RankMode {
    fn from(sort: CliSort) -> Self {
        match sort {
            CliSort::Negative => RankMode::MostNegative,
            CliSort::Positive => RankMode::MostPositive,
            CliSort::Absolute => RankMode::LargestAbsolute,
        }
    }
}

/// Blood biomarker pooling and age-trend analysis
#[derive(Parser)]
#[command(name = "biopool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Workspace directory (manifest, tables, outputs)
    #[arg(short, long, default_value = "data")]
    workspace: PathBuf,

    /// Optional analysis configuration YAML
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Symmetric trim percent per tail (0-49)
    #[arg(long)]
    trim: Option<f64>,

    /// Cohort selection
    #[arg(long, value_enum)]
    cohort: Option<CliCohort>,

    /// Statistic the trend is computed over
    #[arg(long, value_enum)]
    statistic: Option<CliStatistic>,

    /// Minimum bin sample count for trend eligibility
    #[arg(long)]
    min_bin_n: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Screen the variable manifest and resolve the pool catalog
    Screen,

    /// Build the harmonized long dataset from cycle tables
    Build,

    /// Compute age-binned statistics and trend metrics
    Metrics,

    /// Export dashboard JSON artifacts
    Export,

    /// Run all stages in order
    Run,

    /// Print the trend ranking
    Rank {
        /// Sort mode
        #[arg(long, value_enum, default_value = "negative")]
        sort: CliSort,

        /// Number of biomarkers to list (clamped to 10-200)
        #[arg(long, default_value = "40")]
        top_n: usize,
    },
}

fn load_config(cli: &Cli) -> Result<AnalysisConfig> {
    let mut config = match &cli.config {
        Some(path) => AnalysisConfig::from_yaml_file(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(trim) = cli.trim {
        config.metrics.trim_percent = trim;
    }
    if let Some(cohort) = cli.cohort {
        config.metrics.cohort = cohort.into();
    }
    if let Some(statistic) = cli.statistic {
        config.metrics.statistic = statistic.into();
    }
    if let Some(min_bin_n) = cli.min_bin_n {
        config.metrics.min_bin_n = min_bin_n;
    }
    config.metrics.validate()?;
    Ok(config)
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(v) if v.is_finite() => format!("{:.4}", v),
        _ => "NA".to_string(),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let workspace = Workspace::new(&cli.workspace);

    match cli.command {
        Commands::Screen => {
            let outcome = workspace.run_screen()?;
            let included = outcome.decisions.iter().filter(|d| d.included).count();
            println!(
                "Screened {} manifest rows: {} included, {} pools",
                outcome.decisions.len(),
                included,
                outcome.catalog.len()
            );
            println!("Decisions: {}", workspace.decisions_path().display());
            println!("Catalog:   {}", workspace.catalog_csv_path().display());
        }

        Commands::Build => {
            let (dataset, audit) = workspace.run_build(&config)?;
            println!(
                "Long dataset: {} rows from {} files ({} parse skips)",
                dataset.len(),
                audit.n_files,
                audit.total_parse_skips()
            );
            println!("Dataset: {}", workspace.long_dataset_path().display());
        }

        Commands::Metrics => {
            let (stats, trends) = workspace.run_metrics(&config)?;
            println!("Bin stats: {} rows", stats.len());
            println!("Trends:    {} rows", trends.len());
        }

        Commands::Export => {
            let summary = workspace.run_export(&config)?;
            println!(
                "Exported {} series, {} metrics, {} metadata entries",
                summary.series_count, summary.metrics_count, summary.metadata_count
            );
            println!("Dashboard data: {}", workspace.dashboard_dir().display());
        }

        Commands::Run => {
            let summary = workspace.run_all(&config)?;
            println!(
                "Pipeline complete: {} series exported to {}",
                summary.series_count,
                workspace.dashboard_dir().display()
            );
        }

        Commands::Rank { sort, top_n } => {
            let (_, trends) = workspace.run_metrics(&config)?;
            let ranking = biopool::metrics::RankingConfig {
                mode: sort.into(),
                top_n,
            };
            let ranked = rank_trends(&trends, &ranking);
            println!(
                "{:<40} {:>8} {:>10} {:>10} {:>8}",
                "biomarker", "cohort", "rho", "p", "negative"
            );
            for m in ranked {
                println!(
                    "{:<40} {:>8} {:>10} {:>10} {:>8}",
                    m.biomarker_name,
                    m.cohort.as_str(),
                    fmt_opt(m.spearman_rho),
                    fmt_opt(m.spearman_p),
                    m.negative_trend
                );
            }
        }
    }

    Ok(())
}
