//! snapreport daemon library
//!
//! Turns runner events into a report: the orchestrator drives the core
//! pipeline, the diff worker pool compares screenshots and the live stream
//! pushes tree updates to clients.

pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod merge;
pub mod orchestrator;
pub mod stream;

pub use config::ReporterConfig;
pub use diff::PixelDiffWorker;
pub use error::{ReporterError, Result};
pub use events::{EventReader, RunnerEvent};
pub use orchestrator::{FinishedReport, ReportOrchestrator, SkipItem, UndoAcceptImagesResult};
pub use stream::{ClientEvent, LiveStream, StreamFrame};
