//! Error types for the biopool library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum BiopoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Missing column '{column}' in {table}")]
    MissingColumn { table: String, column: String },

    #[error("Schema mismatch in {table}: {reason}")]
    SchemaMismatch { table: String, reason: String },

    #[error("Could not parse cycle years from label '{0}'")]
    CycleLabel(String),

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, BiopoolError>;
