// crates/cmorize-core/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CmorError {
    #[error("invalid approx_interval {0:?}: not a number of days")]
    InvalidInterval(String),

    #[error("unknown climatology {frequency} in table {table_id}")]
    UnknownClimatology {
        frequency: String,
        table_id: String,
    },

    #[error("dataset has no 'time' column")]
    MissingTemporalAxis,

    #[error("dataset has a 'time' column with zero samples")]
    EmptyTemporalAxis,

    #[error("checkpoint already exists for step {0}")]
    DuplicateCheckpoint(String),

    #[error("no checkpoint found for step {0}")]
    UnknownCheckpoint(String),

    #[error("cannot resolve step {name:?}: not present in the step registry")]
    StepResolution { name: String },

    #[error("pipeline spec must have exactly one of 'uses' or 'steps'")]
    AmbiguousPipelineSpec,

    #[error("rule {rule} references unknown pipeline {pipeline:?}")]
    UnknownPipelineReference { rule: String, pipeline: String },

    #[error("pipeline {0} is frozen, its steps cannot be modified")]
    FrozenPipeline(String),

    #[error("step {step} of pipeline {pipeline} failed for rule {rule}: {source}")]
    StepFailed {
        pipeline: String,
        step: String,
        rule: String,
        #[source]
        source: Box<CmorError>,
    },

    #[error("no rule matches {0}")]
    NoMatchingRule(String),

    #[error("{failed} of {total} rules failed")]
    RulesFailed { failed: usize, total: usize },

    #[error("invalid input pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid timestamp micros {0}")]
    InvalidTimestamp(i64),

    #[error("invalid anchor offset {0:?}")]
    InvalidAnchorOffset(String),

    #[error("rule {rule} has no data request variable attached")]
    MissingDataRequestVariable { rule: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unit conversion failed: {0}")]
    UnitConversion(String),

    #[error("polars operation failed: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, CmorError>;
