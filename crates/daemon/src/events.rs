//! Runner lifecycle events
//!
//! Runners hand events over as JSON lines:
//! `{"event": "test-fail", "data": {"suitePath": [...], "browserId": "chrome", ...}}`

use serde::{Deserialize, Serialize};
use snapreport_common::{ResultStatus, TestResult};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{ReporterError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteBegin {
    pub suite_path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RunnerEvent {
    RunnerStart,
    SuiteBegin(SuiteBegin),
    TestBegin(TestResult),
    TestPass(TestResult),
    TestFail(TestResult),
    Retry(TestResult),
    TestPending(TestResult),
    RunnerEnd,
}

impl RunnerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunnerEvent::RunnerStart => "runner-start",
            RunnerEvent::SuiteBegin(_) => "suite-begin",
            RunnerEvent::TestBegin(_) => "test-begin",
            RunnerEvent::TestPass(_) => "test-pass",
            RunnerEvent::TestFail(_) => "test-fail",
            RunnerEvent::Retry(_) => "retry",
            RunnerEvent::TestPending(_) => "test-pending",
            RunnerEvent::RunnerEnd => "runner-end",
        }
    }
}

/// Final status of a result carried by a test event.
///
/// Failures with a screenshot diff or a missing reference are FAIL, other
/// failures are ERROR.
pub fn normalize_status(event: &RunnerEvent, result: &TestResult) -> ResultStatus {
    match event {
        RunnerEvent::TestBegin(_) => ResultStatus::Running,
        RunnerEvent::TestPass(_) => ResultStatus::Success,
        RunnerEvent::TestPending(_) => ResultStatus::Skipped,
        RunnerEvent::TestFail(_) | RunnerEvent::Retry(_) => {
            if result.has_diff() || result.has_no_ref_errors() {
                ResultStatus::Fail
            } else {
                ResultStatus::Error
            }
        }
        _ => result.status,
    }
}

/// Parse one JSON line, `None` for blank lines
pub fn parse_line(line_no: usize, line: &str) -> Result<Option<RunnerEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|source| ReporterError::EventParse { line: line_no, source })
}

/// Line-by-line reader over a JSON lines source
pub struct EventReader<R> {
    lines: tokio::io::Lines<R>,
    line_no: usize,
}

impl<R: AsyncBufRead + Unpin> EventReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }

    /// Next event, `None` at end of input
    pub async fn next_event(&mut self) -> Result<Option<RunnerEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            if let Some(event) = parse_line(self.line_no, &line)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}
