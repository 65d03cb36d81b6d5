//! Staged pipeline: screen, build, metrics, export.

mod runner;

pub use runner::{AnalysisConfig, Workspace};
