//! Error types for sccross-rs.
//!
//! Every stage of the staged fit propagates its failures unchanged through
//! [`SccrossError`]; nothing in the orchestrator retries or swallows errors.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use sccross_rs::{RunConfig, SccrossError};
//!
//! # fn main() {
//! match RunConfig::from_file("/nonexistent/sccross.yaml") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(SccrossError::Io(e)) => eprintln!("Cannot read run file: {e}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for sccross-rs operations.
pub type Result<T> = std::result::Result<T, SccrossError>;

/// Errors that can occur in sccross-rs.
///
/// # Example
///
/// ```rust
/// use sccross_rs::{Result, SccrossError};
///
/// fn check_latent_dim(dim: usize) -> Result<()> {
///     if dim == 0 {
///         return Err(SccrossError::Config("latent_dim must be > 0".to_string()));
///     }
///     Ok(())
/// }
///
/// assert!(check_latent_dim(0).is_err());
/// assert!(check_latent_dim(16).is_ok());
/// ```
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SccrossError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid YAML run file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Invalid JSON dataset or checkpoint.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Dataset error (empty collection, missing or malformed annotations).
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Model construction or encoding error.
    #[error("model error: {0}")]
    Model(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Balancing weight estimation error.
    #[error("balancing error: {0}")]
    Balance(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for SccrossError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        SccrossError::Template(err.to_string())
    }
}
