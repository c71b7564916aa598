//! Daemon error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReporterError>;

#[derive(Error, Debug)]
pub enum ReporterError {
    #[error(transparent)]
    Core(#[from] snapreport_common::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid runner event on line {line}: {source}")]
    EventParse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Result task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown result {0}")]
    UnknownResult(String),
}

impl ReporterError {
    /// Whether the underlying failure came from the result store
    pub fn is_persistence(&self) -> bool {
        matches!(self, ReporterError::Core(e) if e.is_persistence())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapreport_common::Error;

    #[test]
    fn test_only_store_failures_are_persistence() {
        assert!(ReporterError::from(Error::NotInitialized).is_persistence());
        assert!(ReporterError::from(Error::Persistence("disk full".into())).is_persistence());
        assert!(!ReporterError::from(Error::MalformedResult("no browser".into())).is_persistence());
        assert!(!ReporterError::from(Error::DiffComputation("worker gone".into())).is_persistence());
        assert!(!ReporterError::UnknownResult("a b chrome 0".into()).is_persistence());
    }
}
