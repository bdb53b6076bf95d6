use crate::lineage::LineageLog;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricEngineError {
    #[error("Metric '{metric}' references '{dependency}', which is not computed before it")]
    UnresolvedDependency { metric: String, dependency: String },

    #[error("Invalid definition for metric '{metric}': {details}")]
    InvalidDefinition { metric: String, details: String },

    #[error("Formula syntax error at position {position}: {message}")]
    FormulaSyntax { position: usize, message: String },

    #[error("Formula references unbound token '{0}'")]
    UnboundToken(String),

    #[error("Missing {statement} statement table for {filing} filing")]
    MissingStatementTable { statement: String, filing: String },

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Lineage for '{metric}' in period '{period}' is already committed")]
    LineageAlreadyCommitted { metric: String, period: String },

    #[error("Mapping not found: {0}")]
    MappingNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MetricEngineError>;

/// A fatal build outcome. Carries every lineage record committed before the fault.
#[derive(Error, Debug)]
#[error("Build failed for {ticker}: {source}")]
pub struct BuildFailure {
    pub ticker: String,
    #[source]
    pub source: MetricEngineError,
    pub lineage: LineageLog,
}
