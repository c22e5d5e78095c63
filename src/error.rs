use polars::prelude::PolarsError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CubeError>;

/// Errors raised by cube operations.
///
/// Validation variants are raised before any store mutation. `Integrity`,
/// `CopyAborted` and `CopyFatal` are raised after writes have happened and
/// the store may hold partial state; the error names what was written.
#[derive(Debug, Error)]
pub enum CubeError {
    #[error("invalid cube specification: {0}")]
    InvalidCube(String),

    #[error("malformed input data: {0}")]
    Shape(String),

    #[error("dataset '{dataset}' is missing dimension columns {columns:?}")]
    MissingDimensions { dataset: String, columns: Vec<String> },

    #[error("invalid partition-on request for dataset '{dataset}': {reason}")]
    InvalidPartitionOn { dataset: String, reason: String },

    #[error("dataset '{dataset}' has rows that are not unique on {columns:?}")]
    NonUniqueRows { dataset: String, columns: Vec<String> },

    #[error("dataset '{dataset}' payload columns {columns:?} are already provided by the cube")]
    PayloadConflict { dataset: String, columns: Vec<String> },

    #[error("seed dataset '{0}' is missing from the input")]
    MissingSeed(String),

    #[error("seed dataset '{seed}' for cube '{uuid_prefix}' not found")]
    SeedNotFound { uuid_prefix: String, seed: String },

    #[error("cannot overwrite a subset of the cube; datasets not rewritten: {missing:?}")]
    PartialOverwrite { missing: Vec<String> },

    #[error("datasets already exist: {0:?}")]
    ExistingDatasetConflict(Vec<String>),

    #[error("unknown datasets: {0:?}")]
    UnknownDataset(Vec<String>),

    #[error("conditions reference non-partition columns {0:?}")]
    InvalidConditionColumns(Vec<String>),

    #[error("cannot write empty datasets: {0:?}")]
    EmptyDatasets(Vec<String>),

    #[error("commit aborted; datasets without data: {datasets:?}")]
    CommitAborted {
        datasets: Vec<String>,
        #[source]
        cause: Box<CubeError>,
    },

    #[error("cube integrity violated: {reason}")]
    Integrity {
        reason: String,
        #[source]
        cause: Box<CubeError>,
    },

    #[error("copy aborted; datasets copied before the failure: {copied:?}")]
    CopyAborted {
        copied: Vec<String>,
        #[source]
        cause: Box<CubeError>,
    },

    #[error("copy failed and the target may be partially overwritten")]
    CopyFatal(#[source] Box<CubeError>),

    #[error("inconsistent cube state: {0}")]
    Inconsistent(String),

    #[error("unsupported partition value: {0}")]
    PartitionValue(String),

    #[error("invalid query: {0}")]
    Query(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error(transparent)]
    Polars(#[from] PolarsError),
}
