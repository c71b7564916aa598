//! Report orchestration
//!
//! Runner events flow through the attempt tracker, the image pipeline, the tree
//! builder and the store, in that order. Attempts are assigned as events arrive;
//! the rest runs on a bounded queue. Results of one test are chained so they
//! reach the tree in event order, results of different tests fan out freely.

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snapreport_common::images::copy_file;
use snapreport_common::tree::TreeImage;
use snapreport_common::{
    AttemptTracker, DbUrlsManifest, DiffCache, DiffWorker, Error, ExpectedPathCache, ImageArtifactPipeline,
    ImageData, ImageInfo, ImageKind, PersistenceStore, ResultStatus, ResultTreeBuilder, TestBranch,
    TestIdentity, TestResult, Tree, UpdatedImageInfo, TITLE_DELIMITER,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ReporterConfig;
use crate::diff::PixelDiffWorker;
use crate::error::{ReporterError, Result};
use crate::events::{normalize_status, RunnerEvent};
use crate::stream::{ClientEvent, LiveStream, StreamFrame};

/// Resolves once the previous result of the same test has been processed
type Done = Shared<oneshot::Receiver<()>>;

/// Skipped test as listed in the static report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipItem {
    pub suite: String,
    pub browser: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// What a finished run hands to report writers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedReport {
    pub tree: Tree,
    pub skips: Vec<SkipItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoAcceptImagesResult {
    pub updated_images: Vec<TreeImage>,
    pub removed_results: Vec<String>,
}

/// State shared by every queued result task
#[derive(Clone)]
struct Ingest {
    store: PersistenceStore,
    tree: Arc<Mutex<ResultTreeBuilder>>,
    pipeline: Arc<ImageArtifactPipeline>,
    workers: Arc<dyn DiffWorker>,
    stream: LiveStream,
    skips: Arc<Mutex<Vec<SkipItem>>>,
}

impl Ingest {
    async fn process(&self, result: TestResult) -> Result<()> {
        let saved = if result.status.is_ephemeral() {
            result
        } else {
            self.pipeline.save(&result, Some(self.workers.as_ref())).await?
        };

        let (added, branch) = {
            let mut tree = self.tree.lock();
            let added = tree.add_test_result(saved)?;
            let branch = tree.get_test_branch(&added.id());
            (added, branch)
        };

        if added.status == ResultStatus::Skipped {
            self.skips.lock().push(SkipItem {
                suite: added.identity.full_name(),
                browser: added.identity.browser_id.clone(),
                comment: added.skip_reason.clone(),
            });
        }

        self.store.write(&added)?;

        let event = if added.status == ResultStatus::Running {
            ClientEvent::BeginState
        } else {
            ClientEvent::TestResult
        };
        if let Some(branch) = branch {
            self.stream.emit(event, &branch);
        }

        debug!("Processed {} result {}", added.status, added.id());
        Ok(())
    }
}

/// Wires runner events into the report
pub struct ReportOrchestrator {
    config: ReporterConfig,
    ingest: Ingest,
    attempts: Arc<AttemptTracker>,
    expected_paths: Arc<ExpectedPathCache>,
    queue: Arc<Semaphore>,
    tasks: JoinSet<Result<()>>,
    chains: HashMap<TestIdentity, Done>,
    failure: Option<ReporterError>,
}

impl ReportOrchestrator {
    /// Open the report store and build the pipeline with the pixel diff worker pool
    pub fn new(config: ReporterConfig) -> Result<Self> {
        let workers: Arc<dyn DiffWorker> = Arc::new(PixelDiffWorker::new(config.diff.clone()));
        Self::with_diff_worker(config, workers)
    }

    pub fn with_diff_worker(config: ReporterConfig, workers: Arc<dyn DiffWorker>) -> Result<Self> {
        let store = PersistenceStore::open(&config.report_path, config.reuse)?;
        let attempts = Arc::new(AttemptTracker::new());
        let expected_paths = Arc::new(ExpectedPathCache::new());

        let pipeline = ImageArtifactPipeline::new(
            &config.report_path,
            expected_paths.clone(),
            Arc::new(DiffCache::new()),
        )?
        .with_store(store.clone());

        let ingest = Ingest {
            store,
            tree: Arc::new(Mutex::new(ResultTreeBuilder::new(attempts.clone()))),
            pipeline: Arc::new(pipeline),
            workers,
            stream: LiveStream::new(config.stream.capacity),
            skips: Arc::new(Mutex::new(Vec::new())),
        };

        info!(
            "Report at {:?} ({} concurrent results)",
            config.report_path, config.queue_concurrency
        );

        Ok(Self {
            queue: Arc::new(Semaphore::new(config.queue_concurrency.max(1))),
            config,
            ingest,
            attempts,
            expected_paths,
            tasks: JoinSet::new(),
            chains: HashMap::new(),
            failure: None,
        })
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    pub fn store(&self) -> &PersistenceStore {
        &self.ingest.store
    }

    pub fn attempts(&self) -> &Arc<AttemptTracker> {
        &self.attempts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamFrame> {
        self.ingest.stream.subscribe()
    }

    /// Snapshot of the current tree
    pub fn tree(&self) -> Tree {
        self.ingest.tree.lock().tree().clone()
    }

    pub fn get_test_branch(&self, result_id: &str) -> Option<TestBranch> {
        self.ingest.tree.lock().get_test_branch(result_id)
    }

    pub fn skips(&self) -> Vec<SkipItem> {
        self.ingest.skips.lock().clone()
    }

    /// Replay rows of a reused report into the tracker and the tree.
    /// Must run before the first live event.
    pub fn hydrate(&mut self) -> Result<usize> {
        let rows = self.ingest.store.read_all()?;
        let count = rows.len();

        let mut tree = self.ingest.tree.lock();
        for mut row in rows {
            row.attempt = self.attempts.register_result(&row.identity, row.status);
            if row.status == ResultStatus::Skipped {
                self.ingest.skips.lock().push(SkipItem {
                    suite: row.identity.full_name(),
                    browser: row.identity.browser_id.clone(),
                    comment: row.skip_reason.clone(),
                });
            }
            tree.add_test_result(row)?;
        }

        info!("Hydrated {} stored result(s)", count);
        Ok(count)
    }

    /// Take over a tree built by an earlier session
    pub fn reuse_tests_tree(&self, tree: &Tree) {
        self.ingest.tree.lock().reuse_tests_tree(tree);
    }

    /// Accept one runner event. Test results are queued; call [`Self::finish`]
    /// (or wait for `runner-end`) to have them fully processed.
    pub async fn handle_event(&mut self, event: RunnerEvent) -> Result<()> {
        debug!("Runner event {}", event.name());

        let mut result = match &event {
            RunnerEvent::RunnerStart => {
                info!("Runner started");
                return Ok(());
            }
            RunnerEvent::SuiteBegin(suite) => {
                self.ingest.stream.emit(
                    ClientEvent::BeginSuite,
                    &json!({
                        "suiteId": suite.suite_path.join(TITLE_DELIMITER),
                        "status": ResultStatus::Running,
                    }),
                );
                return Ok(());
            }
            RunnerEvent::RunnerEnd => {
                self.drain().await;
                info!("Runner finished");
                return Ok(());
            }
            RunnerEvent::TestBegin(result)
            | RunnerEvent::TestPass(result)
            | RunnerEvent::TestFail(result)
            | RunnerEvent::Retry(result)
            | RunnerEvent::TestPending(result) => {
                let mut result = result.clone();
                result.status = normalize_status(&event, &result);
                result
            }
        };

        result.validate()?;
        if result.timestamp == 0 {
            result.timestamp = chrono::Utc::now().timestamp_millis();
        }
        if let Some(base_host) = &self.config.base_host {
            result.suite_url = result.suite_url.as_deref().map(|url| with_base_host(url, base_host));
        }
        result.attach_page_screenshot();
        result.attempt = self.attempts.register_result(&result.identity, result.status);

        self.enqueue(result);
        Ok(())
    }

    fn enqueue(&mut self, result: TestResult) {
        let (done_tx, done_rx) = oneshot::channel();
        let previous = self.chains.insert(result.identity.clone(), done_rx.shared());
        let ingest = self.ingest.clone();
        let queue = self.queue.clone();

        self.tasks.spawn(async move {
            if let Some(previous) = previous {
                // a dropped sender still means the previous task is over
                let _ = previous.await;
            }

            let id = result.id();
            let outcome = match queue.acquire_owned().await {
                Ok(_permit) => ingest.process(result).await,
                Err(e) => Err(Error::Internal(e.to_string()).into()),
            };
            let _ = done_tx.send(());

            if let Err(e) = &outcome {
                error!("Failed to process result {}: {}", id, e);
            }
            outcome
        });
    }

    /// Wait for every queued result, remembering the first failure
    async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined.map_err(ReporterError::from).and_then(|r| r);
            if let Err(e) = outcome {
                if self.failure.is_none() {
                    self.failure = Some(e);
                }
            }
        }
        self.chains.clear();
    }

    /// First failure recorded while processing results
    pub fn failure(&self) -> Option<&ReporterError> {
        self.failure.as_ref()
    }

    /// Record a new UPDATED attempt in which the given states take their actual
    /// screenshot as the new reference
    pub async fn accept_images(&mut self, result_id: &str, state_names: &[&str]) -> Result<TestBranch> {
        self.drain().await;

        let (identity, source, images) = {
            let tree = self.ingest.tree.lock();
            let identity = tree
                .identity_of(result_id)
                .ok_or_else(|| ReporterError::UnknownResult(result_id.to_string()))?;
            let source = tree
                .get_result(result_id)
                .cloned()
                .ok_or_else(|| ReporterError::UnknownResult(result_id.to_string()))?;
            (identity, source, tree.get_images_info(result_id))
        };

        let report_dir = self.config.report_path.clone();
        let mut accepted = Vec::new();
        for (index, info) in images.iter().enumerate() {
            let Some(state_name) = info.state_name() else {
                continue;
            };
            if !state_names.contains(&state_name) {
                continue;
            }
            let Some(actual) = info.image(ImageKind::Actual).and_then(ImageData::path) else {
                warn!("No actual image to accept for {} in {}", state_name, result_id);
                continue;
            };

            let actual = ImageData::File {
                path: report_dir.join(actual).to_string_lossy().into_owned(),
                size: info.image(ImageKind::Actual).and_then(ImageData::size),
            };
            accepted.push((
                index,
                ImageInfo::Updated(UpdatedImageInfo {
                    state_name: Some(state_name.to_string()),
                    ref_img: info.image(ImageKind::Reference).cloned(),
                    expected_img: Some(actual.clone()),
                    actual_img: Some(actual),
                }),
            ));
        }

        if accepted.is_empty() {
            return Err(Error::NotFound {
                kind: "image".to_string(),
                id: format!("{} {:?}", result_id, state_names),
            }
            .into());
        }

        let mut result = TestResult::new(identity.clone(), ResultStatus::Updated);
        result.duration = source.duration;
        result.meta = source.meta_info.clone();
        result.history = source.history.clone();
        result.description = source.description.clone();
        result.suite_url = source.suite_url.clone();
        result.multiple_tabs = source.multiple_tabs;
        result.images_info = accepted.iter().map(|(_, info)| info.clone()).collect();
        result.attempt = self.attempts.register_result(&identity, ResultStatus::Updated);

        let saved = self.ingest.pipeline.save(&result, None).await?;

        let mut images_info = images;
        for ((index, _), info) in accepted.iter().zip(saved.images_info) {
            images_info[*index] = info;
        }
        result.images_info = images_info;

        for (index, _) in &accepted {
            let info = &result.images_info[*index];
            let (Some(reference), Some(actual)) = (
                info.image(ImageKind::Reference).and_then(ImageData::path),
                info.image(ImageKind::Actual).and_then(ImageData::path),
            ) else {
                continue;
            };
            match copy_file(&report_dir.join(actual), Path::new(reference)).await {
                Ok(()) => info!("Updated reference {}", reference),
                Err(e) => warn!("Failed to update reference {}: {}", reference, e),
            }
        }

        let (added, branch) = {
            let mut tree = self.ingest.tree.lock();
            let added = tree.add_test_result(result)?;
            let branch = tree.get_test_branch(&added.id());
            (added, branch)
        };
        self.ingest.store.write(&added)?;

        let branch = branch.ok_or_else(|| ReporterError::UnknownResult(added.id()))?;
        self.ingest.stream.emit(ClientEvent::UpdateResult, &branch);
        Ok(branch)
    }

    /// Revert acceptances made on `result_id`, restoring runner-side references
    pub async fn undo_accept_images(
        &mut self,
        result_id: &str,
        state_names: &[&str],
    ) -> Result<UndoAcceptImagesResult> {
        self.drain().await;

        let report_dir = self.config.report_path.clone();
        let mut outcome = UndoAcceptImagesResult::default();

        for state_name in state_names {
            let undo = {
                let mut tree = self.ingest.tree.lock();
                let (Some(identity), Some(node)) = (tree.identity_of(result_id), tree.get_result(result_id)) else {
                    debug!("Result {} is gone, nothing left to undo", result_id);
                    break;
                };

                let mut result = TestResult::new(identity.clone(), node.status);
                result.attempt = node.attempt;
                result.timestamp = node.timestamp;

                tree.undo_accept_image(&result, state_name, &self.ingest.store)?
                    .map(|undo| (identity, undo))
            };
            let Some((identity, undo)) = undo else {
                continue;
            };

            if let Some(reference) = undo
                .undone_image
                .image(ImageKind::Reference)
                .and_then(ImageData::path)
                .map(PathBuf::from)
            {
                if undo.should_remove_reference {
                    remove_reference(&reference).await;
                } else if let Some(previous) = &undo.previous_expected_path {
                    if let Err(e) = copy_file(&report_dir.join(previous), &reference).await {
                        warn!("Failed to revert reference {:?}: {}", reference, e);
                    }
                }
            }

            if let Some(previous) = &undo.previous_expected_path {
                self.expected_paths
                    .set((identity, Some(state_name.to_string())), previous.clone());
            }
            outcome.updated_images.extend(undo.updated_image);
            outcome.removed_results.extend(undo.removed_result.map(|r| r.id));
        }

        self.ingest.stream.emit(ClientEvent::UndoAccept, &outcome);
        Ok(outcome)
    }

    /// Wait for queued results, write the manifest and close the store.
    ///
    /// Returns the first processing failure, if any, after cleaning up.
    pub async fn finish(mut self) -> Result<FinishedReport> {
        self.drain().await;

        let tree = {
            let mut builder = self.ingest.tree.lock();
            builder.sort_tree();
            builder.tree().clone()
        };
        let skips = self.skips();

        if let Some(failure) = self.failure.take() {
            error!("Report generation failed: {}", failure);
            if let Err(e) = self.ingest.store.close() {
                warn!("Failed to close store: {}", e);
            }
            return Err(failure);
        }

        let mut manifest = DbUrlsManifest::read(&self.config.report_path)
            .await?
            .unwrap_or_default();
        manifest.extend(&DbUrlsManifest::local());
        manifest.write(&self.config.report_path).await?;

        self.ingest.store.close()?;
        self.ingest.stream.emit(ClientEvent::End, &Value::Null);

        info!(
            "Report written to {:?}: {} result(s), {} skipped",
            self.config.report_path,
            tree.results.all_ids.len(),
            skips.len()
        );
        Ok(FinishedReport { tree, skips })
    }
}

async fn remove_reference(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Removed reference {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove reference {:?}: {}", path, e),
    }
}

/// Replace scheme, host and port of `url` with those of `base_host`, keeping
/// path, query and fragment. Relative urls are resolved against `base_host`.
fn with_base_host(url: &str, base_host: &str) -> String {
    let base = match Url::parse(base_host) {
        Ok(base) => base,
        Err(e) => {
            warn!("Invalid base host {:?}: {}", base_host, e);
            return url.to_string();
        }
    };

    let mut rewritten = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(url::ParseError::RelativeUrlWithoutBase) => match base.join(url) {
            Ok(joined) => return joined.to_string(),
            Err(e) => {
                warn!("Cannot resolve {:?} against {:?}: {}", url, base_host, e);
                return url.to_string();
            }
        },
        Err(e) => {
            warn!("Invalid suite url {:?}: {}", url, e);
            return url.to_string();
        }
    };

    let applied = rewritten.set_scheme(base.scheme()).is_ok()
        && rewritten.set_host(base.host_str()).is_ok()
        && rewritten.set_port(base.port()).is_ok();
    if !applied {
        warn!("Cannot move {:?} onto {:?}", url, base_host);
        return url.to_string();
    }
    rewritten.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_base_host() {
        assert_eq!(
            with_base_host("http://localhost:8080/page?x=1", "https://example.com/"),
            "https://example.com/page?x=1"
        );
        assert_eq!(with_base_host("/page", "https://example.com"), "https://example.com/page");
        assert_eq!(with_base_host("http://localhost", "https://example.com"), "https://example.com/");
    }

    #[test]
    fn test_with_base_host_keeps_query_and_fragment() {
        assert_eq!(
            with_base_host("http://localhost:8080?grep=login", "https://ci.example.com"),
            "https://ci.example.com/?grep=login"
        );
        assert_eq!(
            with_base_host("http://localhost:8080#anchor", "https://ci.example.com"),
            "https://ci.example.com/#anchor"
        );
        assert_eq!(
            with_base_host("http://localhost/a/b?x=1#top", "http://ci.example.com:9000"),
            "http://ci.example.com:9000/a/b?x=1#top"
        );
    }

    #[test]
    fn test_with_base_host_invalid_base_keeps_url() {
        assert_eq!(with_base_host("http://localhost/page", "not a url"), "http://localhost/page");
    }
}
