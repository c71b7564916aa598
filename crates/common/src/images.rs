//! Image artifact pipeline
//!
//! Moves screenshot payloads (files, raw buffers, base64 strings) into the report
//! directory at their canonical paths and produces missing diff images through a
//! [`DiffWorker`]. Failures of individual images are logged and leave that image
//! unset; they never fail the result.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::cache::{DiffCache, ExpectedPathCache};
use crate::store::PersistenceStore;
use crate::types::{
    DiffOptions, ImageData, ImageInfo, ImageKind, ImageSize, ResultStatus, TestIdentity,
    TestResult,
};
use crate::{Error, Result};

/// Directory under the report root holding every screenshot
pub const IMAGES_DIR: &str = "images";

const SCREENSHOTS_SAVED_CAPACITY: usize = 256;

/// Scratch directory holding one diff file per content hash pair
const DIFF_CACHE_DIR: &str = "diffs";

/// Report-relative path of one image:
/// `images/<hash(testId)>/<stateName>/<browserId>~<kind>_<attempt>.png`
pub fn image_path(
    identity: &TestIdentity,
    state_name: Option<&str>,
    kind: ImageKind,
    attempt: u32,
) -> String {
    let mut components = vec![IMAGES_DIR.to_string(), identity.image_dir()];
    if let Some(state) = state_name.filter(|s| !s.is_empty()) {
        components.push(state.to_string());
    }
    components.push(format!(
        "{}~{}_{}.png",
        identity.browser_id,
        kind.file_tag(),
        attempt
    ));
    components.join("/")
}

/// Width and height read from an image file header
pub fn read_image_size(path: impl AsRef<Path>) -> Option<ImageSize> {
    match image::image_dimensions(path.as_ref()) {
        Ok((width, height)) => Some(ImageSize { width, height }),
        Err(e) => {
            debug!("Could not read size of {:?}: {}", path.as_ref(), e);
            None
        }
    }
}

/// Compute SHA-256 hash of data
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ============================================================================
// Seams
// ============================================================================

/// One pixel comparison job
#[derive(Debug, Clone)]
pub struct DiffRequest {
    pub reference: PathBuf,
    pub current: PathBuf,
    pub options: DiffOptions,
}

/// Worker pool capable of writing a diff image for two screenshots
#[async_trait]
pub trait DiffWorker: Send + Sync {
    async fn save_diff_to(&self, request: DiffRequest, dest: &Path) -> Result<()>;
}

/// Places a materialized image at its destination.
///
/// Returns the path to record, `None` meaning `dest` itself.
#[async_trait]
pub trait ImageFileSaver: Send + Sync {
    async fn save_img(&self, src: &Path, dest: &str, report_dir: &Path) -> Result<Option<String>>;
}

/// Copies images into the report directory
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalImageFileSaver;

#[async_trait]
impl ImageFileSaver for LocalImageFileSaver {
    async fn save_img(&self, src: &Path, dest: &str, report_dir: &Path) -> Result<Option<String>> {
        let dest_path = report_dir.join(dest);
        copy_file(src, &dest_path).await?;
        Ok(None)
    }
}

/// Copy via a temp file next to the destination, creating parent directories.
/// Copying a file onto itself is a no-op.
pub async fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::image_save(dest, e))?;
    }

    if let (Ok(a), Ok(b)) = (fs::canonicalize(src).await, fs::canonicalize(dest).await) {
        if a == b {
            return Ok(());
        }
    }

    let tmp_path = dest.with_extension("png.tmp");
    fs::copy(src, &tmp_path)
        .await
        .map_err(|e| Error::image_save(dest, e))?;
    fs::rename(&tmp_path, dest)
        .await
        .map_err(|e| Error::image_save(dest, e))?;

    Ok(())
}

/// Notification sent once every image of a result is on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotsSaved {
    pub test_id: String,
    pub attempt: u32,
    pub images_info: Vec<ImageInfo>,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Persists the images of test results under the report directory
pub struct ImageArtifactPipeline {
    report_dir: PathBuf,
    tmp_dir: Arc<TempDir>,
    expected_paths: Arc<ExpectedPathCache>,
    diff_cache: Arc<DiffCache>,
    /// One lock per content hash pair while its diff is being produced
    diffs_in_flight: DashMap<String, Arc<Mutex<()>>>,
    store: Option<PersistenceStore>,
    saver: Arc<dyn ImageFileSaver>,
    events: broadcast::Sender<ScreenshotsSaved>,
}

impl ImageArtifactPipeline {
    pub fn new(
        report_dir: impl AsRef<Path>,
        expected_paths: Arc<ExpectedPathCache>,
        diff_cache: Arc<DiffCache>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(SCREENSHOTS_SAVED_CAPACITY);

        Ok(Self {
            report_dir: report_dir.as_ref().to_path_buf(),
            tmp_dir: Arc::new(TempDir::new()?),
            expected_paths,
            diff_cache,
            diffs_in_flight: DashMap::new(),
            store: None,
            saver: Arc::new(LocalImageFileSaver),
            events,
        })
    }

    /// Consult the store for expected images of previous runs
    pub fn with_store(mut self, store: PersistenceStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Hand materialized images to `saver` instead of copying them locally
    pub fn with_image_file_saver(mut self, saver: Arc<dyn ImageFileSaver>) -> Self {
        self.saver = saver;
        self
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    pub fn expected_paths(&self) -> &Arc<ExpectedPathCache> {
        &self.expected_paths
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScreenshotsSaved> {
        self.events.subscribe()
    }

    /// Persist every image of `result` and return it with resolved paths.
    ///
    /// Only store lookups can fail; image errors leave the image unset.
    pub async fn save(
        &self,
        result: &TestResult,
        workers: Option<&dyn DiffWorker>,
    ) -> Result<TestResult> {
        debug!("Saving images of {}", result.id());

        let saved_infos = futures::future::try_join_all(
            result
                .images_info
                .iter()
                .map(|info| self.save_image_info(result, info, workers)),
        )
        .await?;

        let mut saved = result.clone();
        saved.images_info = saved_infos;

        // nobody listening is fine
        let _ = self.events.send(ScreenshotsSaved {
            test_id: result.test_id(),
            attempt: result.attempt,
            images_info: saved.images_info.clone(),
        });

        Ok(saved)
    }

    async fn save_image_info(
        &self,
        result: &TestResult,
        info: &ImageInfo,
        workers: Option<&dyn DiffWorker>,
    ) -> Result<ImageInfo> {
        let mut saved = info.clone();

        let (actual, expected) = tokio::join!(
            self.save_actual(result, info),
            self.save_expected(result, info)
        );
        if info.image(ImageKind::Actual).is_some() {
            saved.set_image(ImageKind::Actual, actual);
        }
        if info.image(ImageKind::Expected).is_some() {
            saved.set_image(ImageKind::Expected, expected?);
        }

        if let ImageInfo::Fail(_) = info {
            let diff = self.save_diff(result, &saved, info.image(ImageKind::Diff), workers).await;
            saved.set_image(ImageKind::Diff, diff);
        }

        Ok(saved)
    }

    async fn save_actual(&self, result: &TestResult, info: &ImageInfo) -> Option<ImageData> {
        let actual = info.image(ImageKind::Actual)?;
        let dest = image_path(&result.identity, info.state_name(), ImageKind::Actual, result.attempt);

        match self.save_image(actual, &dest).await {
            Ok((path, size)) => {
                debug!("Saved actual image to {}", path);
                Some(ImageData::File { path, size })
            }
            Err(e) => {
                warn!("Failed to save actual image of {}: {}", result.id(), e);
                None
            }
        }
    }

    async fn save_expected(&self, result: &TestResult, info: &ImageInfo) -> Result<Option<ImageData>> {
        let Some(expected) = info.image(ImageKind::Expected) else {
            return Ok(None);
        };

        if let Some(path) = self.reused_expected_path(&result.identity, info)? {
            debug!("Reused expected image from {}", path);
            let size = expected.size().or_else(|| read_image_size(self.report_dir.join(&path)));
            return Ok(Some(ImageData::File { path, size }));
        }

        let state_name = info.state_name();
        let dest = image_path(&result.identity, state_name, ImageKind::Expected, result.attempt);

        match self.save_image(expected, &dest).await {
            Ok((path, size)) => {
                debug!("Saved expected image to {}", path);
                self.expected_paths.set(
                    (result.identity.clone(), state_name.map(String::from)),
                    path.clone(),
                );
                Ok(Some(ImageData::File { path, size }))
            }
            Err(e) => {
                warn!("Failed to save expected image of {}: {}", result.id(), e);
                Ok(None)
            }
        }
    }

    /// Destination of an earlier copy of the same expected image, if any
    fn reused_expected_path(&self, identity: &TestIdentity, info: &ImageInfo) -> Result<Option<String>> {
        if info.status() == ResultStatus::Updated {
            return Ok(None);
        }

        let state_name = info.state_name().map(String::from);
        let key = (identity.clone(), state_name.clone());
        if let Some(path) = self.expected_paths.get(&key) {
            return Ok(Some(path));
        }

        let Some(store) = &self.store else {
            return Ok(None);
        };

        let last = store
            .last_images_info(identity)?
            .into_iter()
            .find(|i| i.state_name().map(String::from) == state_name)
            .and_then(|i| i.image(ImageKind::Expected).and_then(ImageData::path).map(String::from));

        if let Some(path) = &last {
            self.expected_paths.set(key, path.clone());
        }
        Ok(last)
    }

    async fn save_diff(
        &self,
        result: &TestResult,
        saved: &ImageInfo,
        supplied: Option<&ImageData>,
        workers: Option<&dyn DiffWorker>,
    ) -> Option<ImageData> {
        let dest = image_path(&result.identity, saved.state_name(), ImageKind::Diff, result.attempt);

        let outcome = match supplied {
            Some(diff) => self.save_image(diff, &dest).await,
            None => self.create_diff(saved, &dest, workers).await,
        };

        match outcome {
            Ok((path, size)) => {
                debug!("Saved diff image to {}", path);
                Some(ImageData::File { path, size })
            }
            Err(e) => {
                warn!("Failed to save diff image of {}: {}", result.id(), e);
                None
            }
        }
    }

    /// Generate a diff from the already saved actual and expected images
    async fn create_diff(
        &self,
        saved: &ImageInfo,
        dest: &str,
        workers: Option<&dyn DiffWorker>,
    ) -> Result<(String, Option<ImageSize>)> {
        let (Some(actual), Some(expected)) = (
            saved.image(ImageKind::Actual).and_then(ImageData::path),
            saved.image(ImageKind::Expected).and_then(ImageData::path),
        ) else {
            return Err(Error::DiffComputation(
                "actual or expected image is missing".to_string(),
            ));
        };
        let workers = workers.ok_or_else(|| {
            Error::DiffComputation("no diff workers were provided".to_string())
        })?;

        let current = self.report_dir.join(actual);
        let reference = self.report_dir.join(expected);
        let (current_bytes, reference_bytes) = tokio::try_join!(fs::read(&current), fs::read(&reference))?;
        let hash = content_hash(&current_bytes) + &content_hash(&reference_bytes);

        let lock = self.diffs_in_flight.entry(hash.clone()).or_default().clone();
        let cached = {
            let _guard = lock.lock().await;
            self.cached_diff(&hash, saved, reference, current, workers).await
        };
        self.diffs_in_flight.remove(&hash);
        let cached = cached?;

        let tmp_path = self.tmp_dir.path().join(dest);
        if let Some(parent) = tmp_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&cached, &tmp_path).await?;

        self.save_image(&ImageData::File { path: tmp_path.to_string_lossy().into_owned(), size: None }, dest)
            .await
    }

    /// Diff file for `hash`, produced by `workers` unless another result
    /// already did
    async fn cached_diff(
        &self,
        hash: &str,
        saved: &ImageInfo,
        reference: PathBuf,
        current: PathBuf,
        workers: &dyn DiffWorker,
    ) -> Result<PathBuf> {
        let key = hash.to_string();
        if let Some(cached) = self.diff_cache.get(&key) {
            debug!("Diff served from cache {:?}", cached);
            return Ok(cached);
        }

        let path = self.tmp_dir.path().join(DIFF_CACHE_DIR).join(format!("{}.png", hash));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let request = DiffRequest {
            reference,
            current,
            options: saved.diff_options().cloned().unwrap_or_default(),
        };
        workers.save_diff_to(request, &path).await?;
        self.diff_cache.set(key, path.clone());
        Ok(path)
    }

    /// Materialize `data` as a file and hand it to the file saver.
    ///
    /// Returns the recorded path and the size, read from the local file when
    /// the runner did not send one. The saver may move or upload the file.
    async fn save_image(&self, data: &ImageData, dest: &str) -> Result<(String, Option<ImageSize>)> {
        let source = match data {
            ImageData::File { path, .. } => PathBuf::from(path),
            ImageData::Buffer { buffer, .. } => self.write_temp(dest, buffer).await?,
            ImageData::Base64 { base64, .. } => {
                let bytes = STANDARD.decode(base64).map_err(|e| {
                    Error::image_save(dest, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?;
                self.write_temp(dest, &bytes).await?
            }
        };

        let size = data.size().or_else(|| read_image_size(&source));
        let saved = self.saver.save_img(&source, dest, &self.report_dir).await?;
        Ok((saved.unwrap_or_else(|| dest.to_string()), size))
    }

    async fn write_temp(&self, dest: &str, bytes: &[u8]) -> Result<PathBuf> {
        let tmp_path = self.tmp_dir.path().join(dest);
        if let Some(parent) = tmp_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::image_save(&tmp_path, e))?;
        }
        fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| Error::image_save(&tmp_path, e))?;
        Ok(tmp_path)
    }
}
