//! Integration tests for the staged harmonization pipeline.

use biopool::prelude::*;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

/// Ages covering six bins, twelve subjects per bin per cycle.
const BIN_STARTS: [f64; 6] = [20.0, 25.0, 30.0, 35.0, 40.0, 45.0];
const SUBJECTS_PER_BIN: usize = 12;

fn write_file(path: &Path, contents: &str) {
    let mut file = fs::File::create(path).unwrap();
    write!(file, "{}", contents).unwrap();
}

/// Albumin-like values whose spread shrinks with age, so the CV trend over
/// age is strictly negative. Mean stays exactly 50 in every bin.
fn value_for(bin_idx: usize, subject_idx: usize) -> f64 {
    let spread = 6.0 - bin_idx as f64 * 0.8;
    let centered = (subject_idx as f64 - (SUBJECTS_PER_BIN as f64 - 1.0) / 2.0)
        / ((SUBJECTS_PER_BIN as f64 - 1.0) / 2.0);
    50.0 + centered * spread
}

/// Build a synthetic workspace: two cycles of one biochemistry file with a
/// conventional and an SI-coded albumin column, a comment column, plus
/// demographics and questionnaire inputs with a few excluded subjects.
fn create_workspace(root: &Path) {
    fs::create_dir_all(root.join("tables")).unwrap();
    fs::create_dir_all(root.join("demographics")).unwrap();
    fs::create_dir_all(root.join("questionnaire")).unwrap();

    let manifest = "\
variable_name,variable_desc,data_file_name,data_file_desc,cycle_label,use_constraints
LBXSAL,\"Albumin, refrigerated serum (g/dL)\",BIOPRO_I,Standard Biochemistry Profile,2015-2016,
LBXSAL,\"Albumin, refrigerated serum (g/dL)\",BIOPRO_J,Standard Biochemistry Profile,2017-2018,
LBDSALSI,\"Albumin, refrigerated serum (g/L)\",BIOPRO_J,Standard Biochemistry Profile,2017-2018,
LBDSALLC,Albumin comment code,BIOPRO_J,Standard Biochemistry Profile,2017-2018,
LBXODD,Oddity index (furlongs),BIOPRO_J,Standard Biochemistry Profile,2017-2018,
";
    write_file(&root.join("manifest.csv"), manifest);

    for (file, year, seqn_base) in [("BIOPRO_I", 2015, 10_000), ("BIOPRO_J", 2017, 20_000)] {
        let mut demo = String::from("seqn\tage_years\tsex_code\tpregnant_code\n");
        let mut tbl = if file == "BIOPRO_J" {
            String::from("seqn\tLBXSAL\tLBDSALSI\tLBDSALLC\tLBXODD\n")
        } else {
            String::from("seqn\tLBXSAL\n")
        };

        let mut seqn = seqn_base;
        for (bin_idx, bin_start) in BIN_STARTS.iter().enumerate() {
            for subject_idx in 0..SUBJECTS_PER_BIN {
                let age = bin_start + (subject_idx % 5) as f64;
                let sex_code = if subject_idx % 2 == 0 { 1 } else { 2 };
                let value = value_for(bin_idx, subject_idx);
                demo.push_str(&format!("{}\t{}\t{}\t\n", seqn, age, sex_code));
                if file == "BIOPRO_J" {
                    // Comment column is constant; oddity column varies so
                    // only its unrecognized unit excludes it.
                    tbl.push_str(&format!(
                        "{}\t{}\t{}\t1\t{}\n",
                        seqn,
                        value,
                        value * 10.0,
                        value + 3.3
                    ));
                } else {
                    tbl.push_str(&format!("{}\t{}\n", seqn, value));
                }
                seqn += 1;
            }
        }

        // Excluded subjects: one pregnant, one diabetic, one under-age.
        demo.push_str(&format!("{}\t30\t2\t1\n", seqn_base + 900));
        demo.push_str(&format!("{}\t35\t1\t\n", seqn_base + 901));
        demo.push_str(&format!("{}\t15\t2\t\n", seqn_base + 902));
        if file == "BIOPRO_J" {
            tbl.push_str(&format!("{}\t4.1\t41\t1\t7.1\n", seqn_base + 900));
            tbl.push_str(&format!("{}\t4.2\t42\t1\t7.2\n", seqn_base + 901));
            tbl.push_str(&format!("{}\t4.3\t43\t1\t7.3\n", seqn_base + 902));
        }

        write_file(&root.join("demographics").join(format!("{}.tsv", year)), &demo);
        write_file(&root.join("tables").join(format!("{}.tsv", file)), &tbl);
    }

    // Subject 20901 reports diabetes.
    let questionnaire = "seqn\tDIQ010\tMCQ220\n20901\t1\t2\n20000\t2\t2\n";
    write_file(&root.join("questionnaire").join("2017_DIQ.tsv"), questionnaire);
}

fn test_config() -> AnalysisConfig {
    let mut config = AnalysisConfig::default();
    config.metrics.min_bin_n = 10;
    config
}

#[test]
fn screening_pools_albumin_and_audits_everything() {
    let dir = TempDir::new().unwrap();
    create_workspace(dir.path());
    let workspace = Workspace::new(dir.path());

    let outcome = workspace.run_screen().unwrap();

    // One pool: both albumin codings, units reconciled.
    assert_eq!(outcome.catalog.len(), 1);
    let group = &outcome.catalog.groups()[0];
    assert_eq!(group.pool_id, "albumin");
    assert_eq!(group.canonical_unit, "g/dL");
    assert_eq!(group.members.len(), 2);

    // Every manifest row received exactly one decision.
    assert_eq!(outcome.decisions.len(), 5);
    let reason_of = |code: &str| {
        outcome
            .decisions
            .iter()
            .find(|d| d.variable_code == code)
            .unwrap()
            .reason
    };
    assert_eq!(reason_of("LBDSALLC"), Some(ScreenReason::CommentOrCode));
    assert_eq!(reason_of("LBXODD"), Some(ScreenReason::UnrecognizedUnit));
    assert!(outcome
        .decisions
        .iter()
        .filter(|d| d.variable_code == "LBXSAL")
        .all(|d| d.included));
}

#[test]
fn screening_audit_is_byte_stable() {
    let dir = TempDir::new().unwrap();
    create_workspace(dir.path());
    let workspace = Workspace::new(dir.path());

    workspace.run_screen().unwrap();
    let first = fs::read(workspace.decisions_path()).unwrap();
    let first_catalog = fs::read(workspace.catalog_csv_path()).unwrap();

    workspace.run_screen().unwrap();
    let second = fs::read(workspace.decisions_path()).unwrap();
    let second_catalog = fs::read(workspace.catalog_csv_path()).unwrap();

    assert_eq!(first, second);
    assert_eq!(first_catalog, second_catalog);
}

#[test]
fn build_converts_units_and_filters_cohort() {
    let dir = TempDir::new().unwrap();
    create_workspace(dir.path());
    let workspace = Workspace::new(dir.path());
    let config = test_config();

    workspace.run_screen().unwrap();
    let (dataset, audit) = workspace.run_build(&config).unwrap();

    // 72 healthy subjects per cycle; excluded: pregnant, diabetic,
    // under-age. SI columns deduplicate against the conventional coding.
    assert_eq!(dataset.len(), 144);
    assert!(audit.outcomes.iter().any(|o| o.n_duplicate > 0));

    for record in dataset.records() {
        assert_eq!(record.unit, "g/dL");
        // All synthetic values live near 50 after conversion.
        assert!(record.value > 40.0 && record.value < 60.0);
        assert!(record.age_years >= 20.0);
        assert!(record.seqn % 10_000 < 900);
    }
}

#[test]
fn metrics_flag_declining_cv_and_rank_it() {
    let dir = TempDir::new().unwrap();
    create_workspace(dir.path());
    let workspace = Workspace::new(dir.path());
    let config = test_config();

    workspace.run_screen().unwrap();
    workspace.run_build(&config).unwrap();
    let (stats, trends) = workspace.run_metrics(&config).unwrap();

    // Six bins, all above the threshold (24 subjects pooled per bin).
    assert_eq!(stats.len(), 6);
    assert!(stats.iter().all(|s| s.passes_n_threshold));
    let cvs: Vec<f64> = stats.iter().map(|s| s.cv.unwrap()).collect();
    for pair in cvs.windows(2) {
        assert!(pair[1] < pair[0], "CV must decline with age: {:?}", cvs);
    }

    assert_eq!(trends.len(), 1);
    let trend = &trends[0];
    assert_eq!(trend.n_bins, 6);
    assert!(trend.spearman_rho.unwrap() < 0.0);
    assert!(trend.spearman_p.unwrap() < 0.05);
    assert!(trend.slope_per_year.unwrap() < 0.0);
    assert!(trend.negative_trend);
    assert!(trend.decline_flag);

    let ranked = rank_trends(&trends, &config.ranking);
    assert_eq!(ranked[0].biomarker_id, "albumin");
}

#[test]
fn both_cohorts_are_computed_independently() {
    let dir = TempDir::new().unwrap();
    create_workspace(dir.path());
    let workspace = Workspace::new(dir.path());
    let mut config = test_config();
    config.metrics.cohort = CohortSelection::Both;
    config.metrics.min_bin_n = 5;

    workspace.run_screen().unwrap();
    workspace.run_build(&config).unwrap();
    let (stats, trends) = workspace.run_metrics(&config).unwrap();

    assert!(stats.iter().any(|s| s.cohort == SexCohort::Female));
    assert!(stats.iter().any(|s| s.cohort == SexCohort::Male));
    assert!(stats.iter().all(|s| s.cohort != SexCohort::Pooled));
    // Each sex cohort gets its own trend row.
    assert_eq!(trends.len(), 2);
}

#[test]
fn rederivation_with_trim_is_pure() {
    let dir = TempDir::new().unwrap();
    create_workspace(dir.path());
    let workspace = Workspace::new(dir.path());
    let config = test_config();

    workspace.run_screen().unwrap();
    workspace.run_build(&config).unwrap();
    let dataset = LongDataset::from_tsv(workspace.long_dataset_path()).unwrap();

    let untrimmed = compute_bin_stats(&dataset, &config.metrics).unwrap();

    let mut trimmed_config = config.metrics;
    trimmed_config.trim_percent = 10.0;
    let trimmed = compute_bin_stats(&dataset, &trimmed_config).unwrap();

    for (u, t) in untrimmed.iter().zip(&trimmed) {
        assert!(t.n <= u.n);
    }

    // Same dataset, same config, same result.
    let again = compute_bin_stats(&dataset, &config.metrics).unwrap();
    assert_eq!(untrimmed.len(), again.len());
    for (a, b) in untrimmed.iter().zip(&again) {
        assert_eq!(a.n, b.n);
        assert_eq!(a.mean.to_bits(), b.mean.to_bits());
    }
}

#[test]
fn export_writes_dashboard_artifacts() {
    let dir = TempDir::new().unwrap();
    create_workspace(dir.path());
    let workspace = Workspace::new(dir.path());
    let config = test_config();

    let summary = workspace.run_all(&config).unwrap();
    assert_eq!(summary.series_count, 1);
    assert_eq!(summary.metadata_count, 1);

    let data_dir = workspace.dashboard_dir();
    for name in ["metadata.json", "metrics.json", "series_index.json"] {
        assert!(data_dir.join(name).exists(), "missing {}", name);
    }

    let index: serde_json::Value =
        serde_json::from_slice(&fs::read(data_dir.join("series_index.json")).unwrap()).unwrap();
    let rel = index["albumin"].as_str().unwrap();
    let series: serde_json::Value =
        serde_json::from_slice(&fs::read(data_dir.join(rel)).unwrap()).unwrap();

    assert_eq!(series["biomarker_id"], "albumin");
    assert_eq!(series["points"].as_array().unwrap().len(), 6);
    assert!(!series["raw_sample"].as_array().unwrap().is_empty());

    // A second export is identical: seeded sampling, stable ordering.
    let first = fs::read(data_dir.join(rel)).unwrap();
    workspace.run_export(&config).unwrap();
    let second = fs::read(data_dir.join(rel)).unwrap();
    assert_eq!(first, second);
}
