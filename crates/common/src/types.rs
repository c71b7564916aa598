//! Core types for snapreport

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Separator used when joining title parts into ids
pub const TITLE_DELIMITER: &str = " ";

/// Error name the runner uses for a missing reference screenshot
pub const NO_REF_IMAGE_ERROR: &str = "NoRefImageError";

/// Error name the runner uses for a screenshot that differs from its reference
pub const IMAGE_DIFF_ERROR: &str = "ImageDiffError";

/// Short content hash used for image directories and cache keys
pub fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)[..7].to_string()
}

// ============================================================================
// Status
// ============================================================================

/// Status of a test result or an image comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Idle,
    Running,
    Success,
    Fail,
    Error,
    Skipped,
    Updated,
}

impl Default for ResultStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl ResultStatus {
    /// Terminal statuses that close an attempt
    pub fn advances_attempt(self) -> bool {
        matches!(
            self,
            ResultStatus::Success | ResultStatus::Fail | ResultStatus::Error | ResultStatus::Updated
        )
    }

    /// Statuses that only live in memory and never reach the store
    pub fn is_ephemeral(self) -> bool {
        matches!(self, ResultStatus::Idle | ResultStatus::Running)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, ResultStatus::Fail | ResultStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Idle => "idle",
            ResultStatus::Running => "running",
            ResultStatus::Success => "success",
            ResultStatus::Fail => "fail",
            ResultStatus::Error => "error",
            ResultStatus::Skipped => "skipped",
            ResultStatus::Updated => "updated",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(ResultStatus::Idle),
            "running" => Ok(ResultStatus::Running),
            "success" => Ok(ResultStatus::Success),
            "fail" => Ok(ResultStatus::Fail),
            "error" => Ok(ResultStatus::Error),
            "skipped" => Ok(ResultStatus::Skipped),
            "updated" => Ok(ResultStatus::Updated),
            other => Err(Error::MalformedResult(format!("unknown status '{}'", other))),
        }
    }
}

/// Aggregate child statuses into the status of their parent suite.
///
/// Order of precedence:
/// 1. any RUNNING child -> RUNNING
/// 2. every child SKIPPED -> SKIPPED
/// 3. any FAIL or ERROR child -> FAIL
/// 4. only IDLE and SKIPPED children -> IDLE
/// 5. otherwise SUCCESS
///
/// Returns `None` when there are no children at all.
pub fn aggregate_statuses<I>(statuses: I) -> Option<ResultStatus>
where
    I: IntoIterator<Item = ResultStatus>,
{
    let mut any = false;
    let mut running = false;
    let mut failed = false;
    let mut finished = false;
    let mut idle = false;
    let mut all_skipped = true;

    for status in statuses {
        any = true;
        match status {
            ResultStatus::Running => running = true,
            ResultStatus::Fail | ResultStatus::Error => {
                failed = true;
                finished = true;
            }
            ResultStatus::Success | ResultStatus::Updated => finished = true,
            ResultStatus::Idle => idle = true,
            ResultStatus::Skipped => {}
        }
        if status != ResultStatus::Skipped {
            all_skipped = false;
        }
    }

    if !any {
        return None;
    }

    let status = if running {
        ResultStatus::Running
    } else if all_skipped {
        ResultStatus::Skipped
    } else if failed {
        ResultStatus::Fail
    } else if idle && !finished {
        ResultStatus::Idle
    } else {
        ResultStatus::Success
    };

    Some(status)
}

// ============================================================================
// Identity
// ============================================================================

/// Identifies one retryable test across attempts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestIdentity {
    pub suite_path: Vec<String>,
    pub browser_id: String,
}

impl TestIdentity {
    pub fn new<S: Into<String>>(suite_path: impl IntoIterator<Item = S>, browser_id: impl Into<String>) -> Self {
        Self {
            suite_path: suite_path.into_iter().map(Into::into).collect(),
            browser_id: browser_id.into(),
        }
    }

    pub fn full_name(&self) -> String {
        self.suite_path.join(TITLE_DELIMITER)
    }

    /// Last segment of the suite path (the test title)
    pub fn suite_name(&self) -> &str {
        self.suite_path.last().map(String::as_str).unwrap_or_default()
    }

    pub fn test_id(&self) -> String {
        format!("{}.{}", self.full_name(), self.browser_id)
    }

    /// Directory under `images/` holding every screenshot of this test
    pub fn image_dir(&self) -> String {
        short_hash(&self.test_id())
    }

    pub fn suite_node_id(&self) -> String {
        self.full_name()
    }

    pub fn browser_node_id(&self) -> String {
        join_id(&self.suite_node_id(), &self.browser_id)
    }

    pub fn result_node_id(&self, attempt: u32) -> String {
        join_id(&self.browser_node_id(), &attempt.to_string())
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.full_name(), self.browser_id)
    }
}

pub(crate) fn join_id(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", parent, TITLE_DELIMITER, name)
    }
}

// ============================================================================
// Images
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Screenshot payload.
///
/// Runners hand over files, raw buffers or base64 strings. Once persisted every
/// image is a `File` with a report-relative path and a known size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageData {
    File {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<ImageSize>,
    },
    Base64 {
        base64: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<ImageSize>,
    },
    Buffer {
        buffer: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<ImageSize>,
    },
}

impl ImageData {
    pub fn file(path: impl Into<String>, size: ImageSize) -> Self {
        ImageData::File {
            path: path.into(),
            size: Some(size),
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            ImageData::File { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn size(&self) -> Option<ImageSize> {
        match self {
            ImageData::File { size, .. }
            | ImageData::Base64 { size, .. }
            | ImageData::Buffer { size, .. } => *size,
        }
    }

    /// Persisted form: a path with a known size
    pub fn is_resolved(&self) -> bool {
        matches!(self, ImageData::File { size: Some(_), .. })
    }
}

/// Role an image plays inside one comparison record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Expected,
    Actual,
    Diff,
    Reference,
}

impl ImageKind {
    /// File name component used by the report layout
    pub fn file_tag(self) -> &'static str {
        match self {
            ImageKind::Expected | ImageKind::Reference => "ref",
            ImageKind::Actual => "current",
            ImageKind::Diff => "diff",
        }
    }
}

/// Bounding box of one cluster of differing pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordBounds {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Per-screenshot comparison options forwarded to the diff worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub antialiasing_tolerance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl TestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            stack: None,
        }
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: message.into(),
            stack: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessImageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_img: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_img: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_img: Option<ImageData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailImageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_img: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_img: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_img: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_img: Option<ImageData>,
    #[serde(default)]
    pub diff_clusters: Vec<CoordBounds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_options: Option<DiffOptions>,
}

/// Comparison that errored: a missing reference or a page screenshot of an uncaught error
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorImageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_img: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_img: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_img: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedImageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_img: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_img: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_img: Option<ImageData>,
}

/// Per-screenshot comparison record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ImageInfo {
    Success(SuccessImageInfo),
    Fail(FailImageInfo),
    Error(ErrorImageInfo),
    Updated(UpdatedImageInfo),
}

impl ImageInfo {
    pub fn status(&self) -> ResultStatus {
        match self {
            ImageInfo::Success(_) => ResultStatus::Success,
            ImageInfo::Fail(_) => ResultStatus::Fail,
            ImageInfo::Error(_) => ResultStatus::Error,
            ImageInfo::Updated(_) => ResultStatus::Updated,
        }
    }

    pub fn state_name(&self) -> Option<&str> {
        match self {
            ImageInfo::Success(i) => i.state_name.as_deref(),
            ImageInfo::Fail(i) => i.state_name.as_deref(),
            ImageInfo::Error(i) => i.state_name.as_deref(),
            ImageInfo::Updated(i) => i.state_name.as_deref(),
        }
    }

    pub fn image(&self, kind: ImageKind) -> Option<&ImageData> {
        match (self, kind) {
            (ImageInfo::Success(i), ImageKind::Expected) => i.expected_img.as_ref(),
            (ImageInfo::Success(i), ImageKind::Actual) => i.actual_img.as_ref(),
            (ImageInfo::Success(i), ImageKind::Reference) => i.ref_img.as_ref(),
            (ImageInfo::Fail(i), ImageKind::Expected) => i.expected_img.as_ref(),
            (ImageInfo::Fail(i), ImageKind::Actual) => i.actual_img.as_ref(),
            (ImageInfo::Fail(i), ImageKind::Diff) => i.diff_img.as_ref(),
            (ImageInfo::Fail(i), ImageKind::Reference) => i.ref_img.as_ref(),
            (ImageInfo::Error(i), ImageKind::Expected) => i.expected_img.as_ref(),
            (ImageInfo::Error(i), ImageKind::Actual) => i.actual_img.as_ref(),
            (ImageInfo::Error(i), ImageKind::Reference) => i.ref_img.as_ref(),
            (ImageInfo::Updated(i), ImageKind::Expected) => i.expected_img.as_ref(),
            (ImageInfo::Updated(i), ImageKind::Actual) => i.actual_img.as_ref(),
            (ImageInfo::Updated(i), ImageKind::Reference) => i.ref_img.as_ref(),
            _ => None,
        }
    }

    /// Mutable slot for an image role, `None` when the variant has no such role
    pub fn slot_mut(&mut self, kind: ImageKind) -> Option<&mut Option<ImageData>> {
        match (self, kind) {
            (ImageInfo::Success(i), ImageKind::Expected) => Some(&mut i.expected_img),
            (ImageInfo::Success(i), ImageKind::Actual) => Some(&mut i.actual_img),
            (ImageInfo::Success(i), ImageKind::Reference) => Some(&mut i.ref_img),
            (ImageInfo::Fail(i), ImageKind::Expected) => Some(&mut i.expected_img),
            (ImageInfo::Fail(i), ImageKind::Actual) => Some(&mut i.actual_img),
            (ImageInfo::Fail(i), ImageKind::Diff) => Some(&mut i.diff_img),
            (ImageInfo::Fail(i), ImageKind::Reference) => Some(&mut i.ref_img),
            (ImageInfo::Error(i), ImageKind::Expected) => Some(&mut i.expected_img),
            (ImageInfo::Error(i), ImageKind::Actual) => Some(&mut i.actual_img),
            (ImageInfo::Error(i), ImageKind::Reference) => Some(&mut i.ref_img),
            (ImageInfo::Updated(i), ImageKind::Expected) => Some(&mut i.expected_img),
            (ImageInfo::Updated(i), ImageKind::Actual) => Some(&mut i.actual_img),
            (ImageInfo::Updated(i), ImageKind::Reference) => Some(&mut i.ref_img),
            _ => None,
        }
    }

    pub fn set_image(&mut self, kind: ImageKind, image: Option<ImageData>) {
        if let Some(slot) = self.slot_mut(kind) {
            *slot = image;
        }
    }

    pub fn diff_options(&self) -> Option<&DiffOptions> {
        match self {
            ImageInfo::Fail(i) => i.diff_options.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TestError> {
        match self {
            ImageInfo::Error(i) => i.error.as_ref(),
            _ => None,
        }
    }

    pub fn is_no_ref(&self) -> bool {
        self.error()
            .and_then(|e| e.name.as_deref())
            .map(|name| name == NO_REF_IMAGE_ERROR)
            .unwrap_or(false)
    }

    /// Every image this record carries is in its persisted form
    pub fn is_resolved(&self) -> bool {
        [ImageKind::Expected, ImageKind::Actual, ImageKind::Diff]
            .into_iter()
            .filter_map(|kind| self.image(kind))
            .all(ImageData::is_resolved)
    }
}

// ============================================================================
// Test result
// ============================================================================

/// One attempt of one test, as normalized by the runner adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    #[serde(flatten)]
    pub identity: TestIdentity,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub status: ResultStatus,
    /// Unix time in ms
    #[serde(default)]
    pub timestamp: i64,
    /// Duration in ms
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub images_info: Vec<ImageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestError>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub history: Vec<String>,
    /// Page screenshot taken on an uncaught error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_url: Option<String>,
    #[serde(default)]
    pub multiple_tabs: bool,
}

impl TestResult {
    pub fn new(identity: TestIdentity, status: ResultStatus) -> Self {
        Self {
            identity,
            attempt: 0,
            status,
            timestamp: chrono::Utc::now().timestamp_millis(),
            duration: 0,
            images_info: Vec::new(),
            error: None,
            meta: Map::new(),
            history: Vec::new(),
            screenshot: None,
            description: None,
            skip_reason: None,
            suite_url: None,
            multiple_tabs: false,
        }
    }

    pub fn with_images(mut self, images_info: Vec<ImageInfo>) -> Self {
        self.images_info = images_info;
        self
    }

    pub fn with_error(mut self, error: TestError) -> Self {
        self.error = Some(error);
        self
    }

    /// Derived id: suite path, browser and attempt joined deterministically
    pub fn id(&self) -> String {
        self.identity.result_node_id(self.attempt)
    }

    pub fn test_id(&self) -> String {
        self.identity.test_id()
    }

    /// Reject results the adapter layer should never have produced
    pub fn validate(&self) -> Result<()> {
        if self.identity.suite_path.is_empty() || self.identity.suite_path.iter().any(String::is_empty) {
            return Err(Error::MalformedResult(format!(
                "empty suite path segment in {:?}",
                self.identity.suite_path
            )));
        }
        if self.identity.browser_id.is_empty() {
            return Err(Error::MalformedResult(format!(
                "missing browser id for '{}'",
                self.identity.full_name()
            )));
        }
        Ok(())
    }

    /// Whether any screenshot comparison found a difference
    pub fn has_diff(&self) -> bool {
        self.images_info.iter().any(|i| matches!(i, ImageInfo::Fail(_)))
    }

    pub fn has_no_ref_errors(&self) -> bool {
        self.images_info.iter().any(ImageInfo::is_no_ref)
    }

    pub fn find_image(&self, state_name: &str) -> Option<&ImageInfo> {
        self.images_info
            .iter()
            .find(|i| i.state_name() == Some(state_name))
    }

    /// Turn the page screenshot of an uncaught error into a state-less image record
    pub fn attach_page_screenshot(&mut self) {
        let Some(screenshot) = self.screenshot.clone() else {
            return;
        };
        if self.error.is_none() || self.images_info.iter().any(|i| i.state_name().is_none()) {
            return;
        }
        self.images_info.push(ImageInfo::Error(ErrorImageInfo {
            actual_img: Some(screenshot),
            error: self.error.clone(),
            ..Default::default()
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advancing_statuses() {
        assert!(ResultStatus::Success.advances_attempt());
        assert!(ResultStatus::Updated.advances_attempt());
        assert!(!ResultStatus::Skipped.advances_attempt());
        assert!(!ResultStatus::Running.advances_attempt());
        assert!(ResultStatus::Idle.is_ephemeral());
    }

    #[test]
    fn test_aggregate_statuses() {
        use ResultStatus::*;

        assert_eq!(aggregate_statuses([Success, Fail]), Some(Fail));
        assert_eq!(aggregate_statuses([Success, Error]), Some(Fail));
        assert_eq!(aggregate_statuses([Skipped, Skipped]), Some(Skipped));
        assert_eq!(aggregate_statuses([Skipped, Success]), Some(Success));
        assert_eq!(aggregate_statuses([Fail, Running]), Some(Running));
        assert_eq!(aggregate_statuses([Idle, Skipped]), Some(Idle));
        assert_eq!(aggregate_statuses([Updated, Idle]), Some(Success));
        assert_eq!(aggregate_statuses(Vec::new()), None);
    }

    #[test]
    fn test_identity_ids() {
        let identity = TestIdentity::new(["a", "b"], "chrome");
        assert_eq!(identity.full_name(), "a b");
        assert_eq!(identity.browser_node_id(), "a b chrome");
        assert_eq!(identity.result_node_id(2), "a b chrome 2");
        assert_eq!(identity.test_id(), "a b.chrome");
        assert_eq!(identity.image_dir().len(), 7);
    }

    #[test]
    fn test_image_info_wire_shape() {
        let info = ImageInfo::Fail(FailImageInfo {
            state_name: Some("plain".into()),
            expected_img: Some(ImageData::file("images/x/ref.png", ImageSize { width: 2, height: 3 })),
            ..Default::default()
        });

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["status"], "fail");
        assert_eq!(json["stateName"], "plain");
        assert_eq!(json["expectedImg"]["path"], "images/x/ref.png");

        let back: ImageInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_validate_rejects_missing_identity() {
        let result = TestResult::new(TestIdentity::new(Vec::<String>::new(), "chrome"), ResultStatus::Success);
        assert!(matches!(result.validate(), Err(Error::MalformedResult(_))));

        let result = TestResult::new(TestIdentity::new(["a"], ""), ResultStatus::Success);
        assert!(result.validate().is_err());
    }

    #[test]
    fn test_attach_page_screenshot_once() {
        let mut result = TestResult::new(TestIdentity::new(["a"], "chrome"), ResultStatus::Error)
            .with_error(TestError::new("boom"));
        result.screenshot = Some(ImageData::Base64 {
            base64: "AAAA".into(),
            size: None,
        });

        result.attach_page_screenshot();
        result.attach_page_screenshot();

        assert_eq!(result.images_info.len(), 1);
        assert_eq!(result.images_info[0].status(), ResultStatus::Error);
        assert!(result.images_info[0].state_name().is_none());
    }
}
