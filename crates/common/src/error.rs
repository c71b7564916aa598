//! Error types for snapreport

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the snapreport core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
///
/// Image and diff failures are caught at the pipeline boundary and only logged.
/// Persistence failures are fatal for the ingestion that hit them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Diff computation failed: {0}")]
    DiffComputation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Store used before it was initialized or after it was closed")]
    NotInitialized,

    #[error("Malformed test result: {0}")]
    MalformedResult(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error belongs to the persistence layer and must abort the run
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Persistence(_) | Error::NotInitialized
        )
    }

    pub(crate) fn image_save(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::ImageSave {
            path: path.into(),
            source,
        }
    }
}
