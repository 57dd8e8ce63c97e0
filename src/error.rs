//! Error types for the gateway

use thiserror::Error;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Ingest error
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Query error
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// General error
    #[error("{0}")]
    General(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    /// Environment variable could not be parsed
    #[error("Invalid value for {variable}: {message}")]
    InvalidValue {
        /// The offending variable name
        variable: String,
        /// Description of the parse failure
        message: String,
    },
}

/// Ingest errors
#[derive(Error, Debug)]
pub enum IngestError {
    /// A data point failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database operation failed; the whole batch is aborted
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Query errors
#[derive(Error, Debug)]
pub enum QueryError {
    /// Time specification could not be parsed
    #[error("Invalid time specification: {0}")]
    InvalidTimeSpec(String),

    /// Downsample specification could not be parsed
    #[error("Invalid downsample specification: {0}")]
    InvalidDownsample(String),

    /// Unknown aggregator name
    #[error("Invalid aggregator: {0}")]
    InvalidAggregator(String),

    /// Tag filter expression could not be parsed
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Request shape failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// The client went away mid-stream
    #[error("Query canceled")]
    Canceled,

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueryError {
    /// Whether this error is the client's fault (HTTP 400) rather than ours
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QueryError::InvalidTimeSpec(_)
                | QueryError::InvalidDownsample(_)
                | QueryError::InvalidAggregator(_)
                | QueryError::InvalidFilter(_)
                | QueryError::Validation(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
