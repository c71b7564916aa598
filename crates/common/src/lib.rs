//! snapreport common library
//!
//! Result tree aggregation, screenshot artifact handling, attempt tracking and
//! the SQLite result store shared by the snapreport daemon and tools.

pub mod attempts;
pub mod cache;
pub mod error;
pub mod images;
pub mod manifest;
pub mod store;
pub mod tree;
pub mod types;

// Re-export commonly used types
pub use attempts::AttemptTracker;
pub use cache::{Cache, DiffCache, ExpectedPathCache};
pub use error::{Error, Result};
pub use images::{
    DiffRequest, DiffWorker, ImageArtifactPipeline, ImageFileSaver, LocalImageFileSaver,
    ScreenshotsSaved,
};
pub use manifest::DbUrlsManifest;
pub use store::{DeleteParams, PersistenceStore, QueryParams, QueryRow};
pub use tree::{ResultTreeBuilder, TestBranch, Tree, UndoAcceptImageResult};
pub use types::*;

/// snapreport version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default report directory, relative to the working directory
pub const DEFAULT_REPORT_PATH: &str = "snapreport";
