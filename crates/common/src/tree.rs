//! In-memory report tree
//!
//! Suites, browsers, results and images live in flat id-keyed tables. Parents
//! keep ordered child id lists; children point back at their parent id only for
//! lookup.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::attempts::AttemptTracker;
use crate::images::image_path;
use crate::store::{columns, DeleteParams, PersistenceStore};
use crate::types::{
    aggregate_statuses, join_id, ImageData, ImageInfo, ImageKind, ResultStatus, TestError,
    TestIdentity, TestResult,
};
use crate::{Error, Result};

pub const UNKNOWN_BROWSER_VERSION: &str = "unknown";

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nodes<T> {
    pub by_id: BTreeMap<String, T>,
    pub all_ids: Vec<String>,
}

impl<T> Default for Nodes<T> {
    fn default() -> Self {
        Self {
            by_id: BTreeMap::new(),
            all_ids: Vec::new(),
        }
    }
}

impl<T> Nodes<T> {
    pub fn get(&self, id: &str) -> Option<&T> {
        self.by_id.get(id)
    }

    fn upsert(&mut self, id: &str, node: T) {
        if self.by_id.insert(id.to_string(), node).is_none() {
            self.all_ids.push(id.to_string());
        }
    }

    fn remove(&mut self, id: &str) -> Option<T> {
        let node = self.by_id.remove(id)?;
        self.all_ids.retain(|existing| existing != id);
        Some(node)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteNodes {
    pub by_id: BTreeMap<String, TreeSuite>,
    pub all_ids: Vec<String>,
    pub all_root_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tree {
    pub suites: SuiteNodes,
    pub browsers: Nodes<TreeBrowser>,
    pub results: Nodes<TreeResult>,
    pub images: Nodes<TreeImage>,
}

/// Pure grouping node, status derived from descendants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSuite {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub suite_path: Vec<String>,
    pub root: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResultStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suite_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub browser_ids: Vec<String>,
}

/// Groups the results of one test in one browser, indexed by attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeBrowser {
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub version: String,
    pub result_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeResult {
    pub id: String,
    pub parent_id: String,
    pub attempt: u32,
    pub status: ResultStatus,
    pub timestamp: i64,
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestError>,
    #[serde(default)]
    pub meta_info: Map<String, Value>,
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_url: Option<String>,
    #[serde(default)]
    pub multiple_tabs: bool,
    pub image_ids: Vec<String>,
}

impl TreeResult {
    fn new(id: String, parent_id: String, result: &TestResult, image_ids: Vec<String>) -> Self {
        Self {
            id,
            parent_id,
            attempt: result.attempt,
            status: result.status,
            timestamp: result.timestamp,
            duration: result.duration,
            error: result.error.clone(),
            meta_info: result.meta.clone(),
            history: result.history.clone(),
            description: result.description.clone(),
            skip_reason: result.skip_reason.clone(),
            suite_url: result.suite_url.clone(),
            multiple_tabs: result.multiple_tabs,
            image_ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeImage {
    pub id: String,
    pub parent_id: String,
    #[serde(flatten)]
    pub info: ImageInfo,
}

/// Suite id with its status, as sent in a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteStatus {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResultStatus>,
}

/// Minimal subtree for one result: ancestor suites, its browser, the result and its images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBranch {
    pub suites: Vec<SuiteStatus>,
    pub browser: TreeBrowser,
    pub result: TreeResult,
    pub images: Vec<TreeImage>,
}

/// Outcome of reverting one accepted screenshot
#[derive(Debug, Clone, PartialEq)]
pub struct UndoAcceptImageResult {
    /// The accepted image that was undone
    pub undone_image: ImageInfo,
    pub updated_image: Option<TreeImage>,
    pub removed_result: Option<TreeResult>,
    pub previous_expected_path: Option<String>,
    pub should_remove_reference: bool,
    pub should_revert_reference: bool,
}

// ============================================================================
// Builder
// ============================================================================

/// Owns the report tree and keeps derived statuses consistent
pub struct ResultTreeBuilder {
    tree: Tree,
    attempts: Arc<AttemptTracker>,
}

impl ResultTreeBuilder {
    pub fn new(attempts: Arc<AttemptTracker>) -> Self {
        Self {
            tree: Tree::default(),
            attempts,
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn attempts(&self) -> &Arc<AttemptTracker> {
        &self.attempts
    }

    /// Insert or replace a result at its attempt slot.
    ///
    /// Returns the result with canonical paths filled in for images that had none.
    pub fn add_test_result(&mut self, mut result: TestResult) -> Result<TestResult> {
        result.validate()?;
        derive_image_paths(&mut result);

        let identity = result.identity.clone();
        let suite_id = identity.suite_node_id();
        let browser_id = identity.browser_node_id();
        let result_id = result.id();

        let existing = self
            .tree
            .browsers
            .get(&browser_id)
            .map(|b| b.result_ids.len())
            .unwrap_or(0);
        if result.attempt as usize > existing {
            return Err(Error::MalformedResult(format!(
                "attempt {} of {} skips attempt {}",
                result.attempt, identity, existing
            )));
        }

        let image_ids: Vec<String> = result
            .images_info
            .iter()
            .enumerate()
            .map(|(index, image)| {
                let name = image
                    .state_name()
                    .map(String::from)
                    .unwrap_or_else(|| format!("{}_{}", image.status(), index));
                join_id(&result_id, &name)
            })
            .collect();

        self.add_suites(&identity.suite_path, &browser_id);
        self.add_browser(&browser_id, &suite_id, &result, &result_id);
        self.add_result(&result_id, &browser_id, &result, &image_ids);
        self.add_images(&result_id, &image_ids, &result.images_info);

        self.set_status_for_branch(&identity.suite_path);

        debug!("Added {} result {}", result.status, result_id);
        Ok(result)
    }

    fn add_suites(&mut self, suite_path: &[String], browser_id: &str) {
        for (index, name) in suite_path.iter().enumerate() {
            let path = &suite_path[..=index];
            let id = path.join(crate::types::TITLE_DELIMITER);
            let root = index == 0;

            if !self.tree.suites.by_id.contains_key(&id) {
                let parent_id = (!root).then(|| suite_path[..index].join(crate::types::TITLE_DELIMITER));
                self.tree.suites.by_id.insert(
                    id.clone(),
                    TreeSuite {
                        id: id.clone(),
                        parent_id,
                        name: name.clone(),
                        suite_path: path.to_vec(),
                        root,
                        status: None,
                        suite_ids: Vec::new(),
                        browser_ids: Vec::new(),
                    },
                );
                self.tree.suites.all_ids.push(id.clone());
                if root {
                    self.tree.suites.all_root_ids.push(id.clone());
                }
            }

            let Some(suite) = self.tree.suites.by_id.get_mut(&id) else {
                continue;
            };
            match suite_path.get(index + 1) {
                Some(child) => push_unique(&mut suite.suite_ids, join_id(&id, child)),
                None => push_unique(&mut suite.browser_ids, browser_id.to_string()),
            }
        }
    }

    fn add_browser(&mut self, browser_id: &str, suite_id: &str, result: &TestResult, result_id: &str) {
        if !self.tree.browsers.by_id.contains_key(browser_id) {
            let version = result
                .meta
                .get("browserVersion")
                .and_then(Value::as_str)
                .unwrap_or(UNKNOWN_BROWSER_VERSION)
                .to_string();

            self.tree.browsers.upsert(
                browser_id,
                TreeBrowser {
                    id: browser_id.to_string(),
                    parent_id: suite_id.to_string(),
                    name: result.identity.browser_id.clone(),
                    version,
                    result_ids: Vec::new(),
                },
            );
        }

        if let Some(browser) = self.tree.browsers.by_id.get_mut(browser_id) {
            let attempt = result.attempt as usize;
            if attempt < browser.result_ids.len() {
                browser.result_ids[attempt] = result_id.to_string();
            } else {
                browser.result_ids.push(result_id.to_string());
            }
        }
    }

    fn add_result(&mut self, result_id: &str, browser_id: &str, result: &TestResult, image_ids: &[String]) {
        if let Some(previous) = self.tree.results.get(result_id) {
            let stale: Vec<String> = previous
                .image_ids
                .iter()
                .filter(|id| !image_ids.contains(id))
                .cloned()
                .collect();
            self.remove_images(&stale);
        }

        self.tree.results.upsert(
            result_id,
            TreeResult::new(result_id.to_string(), browser_id.to_string(), result, image_ids.to_vec()),
        );
    }

    fn add_images(&mut self, result_id: &str, image_ids: &[String], images_info: &[ImageInfo]) {
        for (id, info) in image_ids.iter().zip(images_info) {
            self.tree.images.upsert(
                id,
                TreeImage {
                    id: id.clone(),
                    parent_id: result_id.to_string(),
                    info: info.clone(),
                },
            );
        }
    }

    fn remove_images(&mut self, image_ids: &[String]) {
        for id in image_ids {
            self.tree.images.remove(id);
        }
    }

    /// Browser status: status of its highest-attempt result
    pub fn browser_status(&self, browser_id: &str) -> Option<ResultStatus> {
        let browser = self.tree.browsers.get(browser_id)?;
        let last = browser.result_ids.last()?;
        self.tree.results.get(last).map(|r| r.status)
    }

    /// Recompute suite statuses from the deepest suite of `suite_path` upwards,
    /// stopping at the first ancestor whose status did not change
    fn set_status_for_branch(&mut self, suite_path: &[String]) {
        let mut path = suite_path;

        while !path.is_empty() {
            let suite_id = path.join(crate::types::TITLE_DELIMITER);
            let Some(suite) = self.tree.suites.by_id.get(&suite_id) else {
                return;
            };

            let browser_statuses = suite
                .browser_ids
                .iter()
                .filter_map(|id| self.browser_status(id));
            let child_statuses = suite
                .suite_ids
                .iter()
                .filter_map(|id| self.tree.suites.by_id.get(id).and_then(|s| s.status));
            let status = aggregate_statuses(browser_statuses.chain(child_statuses));

            let Some(suite) = self.tree.suites.by_id.get_mut(&suite_id) else {
                return;
            };
            if suite.status == status {
                return;
            }
            suite.status = status;

            path = &path[..path.len() - 1];
        }
    }

    /// Deterministic alphabetic ordering of suite children
    pub fn sort_tree(&mut self) {
        self.tree.suites.all_root_ids.sort();
        for suite in self.tree.suites.by_id.values_mut() {
            suite.suite_ids.sort();
            suite.browser_ids.sort();
        }
    }

    pub fn get_result(&self, result_id: &str) -> Option<&TreeResult> {
        self.tree.results.get(result_id)
    }

    /// Identity of the test a result node belongs to
    pub fn identity_of(&self, result_id: &str) -> Option<TestIdentity> {
        let result = self.tree.results.get(result_id)?;
        let browser = self.tree.browsers.get(&result.parent_id)?;
        let suite = self.tree.suites.by_id.get(&browser.parent_id)?;
        Some(TestIdentity::new(suite.suite_path.clone(), browser.name.clone()))
    }

    /// Result at the highest attempt of an identity
    pub fn get_last_result(&self, identity: &TestIdentity) -> Option<&TreeResult> {
        let browser = self.tree.browsers.get(&identity.browser_node_id())?;
        browser
            .result_ids
            .last()
            .and_then(|id| self.tree.results.get(id))
    }

    pub fn get_images_info(&self, result_id: &str) -> Vec<ImageInfo> {
        self.tree
            .results
            .get(result_id)
            .map(|result| {
                result
                    .image_ids
                    .iter()
                    .filter_map(|id| self.tree.images.get(id))
                    .map(|image| image.info.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Suite chain, browser, result and images of one result; sibling attempts are not included
    pub fn get_test_branch(&self, result_id: &str) -> Option<TestBranch> {
        let result = self.tree.results.get(result_id)?;
        let browser = self.tree.browsers.get(&result.parent_id)?;

        let mut suites = Vec::new();
        let mut next = Some(browser.parent_id.clone());
        while let Some(suite_id) = next {
            let suite = self.tree.suites.by_id.get(&suite_id)?;
            suites.push(SuiteStatus {
                id: suite.id.clone(),
                status: suite.status,
            });
            next = suite.parent_id.clone();
        }
        suites.reverse();

        let images = result
            .image_ids
            .iter()
            .filter_map(|id| self.tree.images.get(id).cloned())
            .collect();

        Some(TestBranch {
            suites,
            browser: browser.clone(),
            result: result.clone(),
            images,
        })
    }

    /// Replace an image's payload, keeping its id and parent
    pub fn update_image_info(&mut self, image_id: &str, info: ImageInfo) -> Option<TreeImage> {
        let image = self.tree.images.by_id.get_mut(image_id)?;
        image.info = info;
        let updated = image.clone();

        let parent_id = updated.parent_id.clone();
        self.refresh_result_status(&parent_id);
        Some(updated)
    }

    /// Drop a result and its images, returns the removed node
    pub fn remove_test_result(&mut self, result_id: &str) -> Option<TreeResult> {
        let result = self.tree.results.remove(result_id)?;
        self.remove_images(&result.image_ids);

        let suite_path = match self.tree.browsers.by_id.get_mut(&result.parent_id) {
            Some(browser) => {
                browser.result_ids.retain(|id| id != result_id);
                self.tree
                    .suites
                    .by_id
                    .get(&browser.parent_id)
                    .map(|suite| suite.suite_path.clone())
            }
            None => None,
        };
        if let Some(suite_path) = suite_path {
            self.set_status_for_branch(&suite_path);
        }

        Some(result)
    }

    fn refresh_result_status(&mut self, result_id: &str) {
        let suite_path = self
            .tree
            .results
            .get(result_id)
            .and_then(|r| self.tree.browsers.get(&r.parent_id))
            .and_then(|b| self.tree.suites.by_id.get(&b.parent_id))
            .map(|s| s.suite_path.clone());
        if let Some(suite_path) = suite_path {
            self.set_status_for_branch(&suite_path);
        }
    }

    /// Revert one accepted screenshot of `result`.
    ///
    /// A result that only exists to record this acceptance is removed and the
    /// attempt counter steps back; otherwise the image is restored to its value
    /// in the previous attempt. The matching store row is deleted either way.
    pub fn undo_accept_image(
        &mut self,
        result: &TestResult,
        state_name: &str,
        store: &PersistenceStore,
    ) -> Result<Option<UndoAcceptImageResult>> {
        let result_id = result.id();
        let Some(tree_result) = self.tree.results.get(&result_id) else {
            warn!("No result {} to undo acceptance for", result_id);
            return Ok(None);
        };

        let images: Vec<&TreeImage> = tree_result
            .image_ids
            .iter()
            .filter_map(|id| self.tree.images.get(id))
            .collect();
        let Some(image) = images.iter().find(|i| i.info.state_name() == Some(state_name)) else {
            return Ok(None);
        };
        if image.info.status() != ResultStatus::Updated {
            return Ok(None);
        }

        let image_id = image.id.clone();
        let undone_image = image.info.clone();
        let timestamp = tree_result.timestamp;
        let count_updated = images
            .iter()
            .filter(|i| i.info.status() == ResultStatus::Updated)
            .count();
        let should_remove_result = count_updated == 1;

        let previous_image = self.previous_image(&tree_result.parent_id, &result_id, state_name);
        let previous_expected_path = previous_image
            .as_ref()
            .and_then(|i| i.image(ImageKind::Expected))
            .and_then(ImageData::path)
            .map(String::from);
        let should_remove_reference = previous_image
            .as_ref()
            .and_then(|i| i.image(ImageKind::Reference))
            .and_then(ImageData::size)
            .is_none();

        let mut updated_image = None;
        let mut removed_result = None;
        if should_remove_result {
            removed_result = self.remove_test_result(&result_id);
            self.attempts.remove_attempt(&result.identity);
        } else if let Some(previous) = previous_image {
            updated_image = self.update_image_info(&image_id, previous);
        }

        let where_clause = [
            format!("{} = ?", columns::SUITE_PATH),
            format!("{} = ?", columns::NAME),
            format!("{} = ?", columns::STATUS),
            format!("{} = ?", columns::TIMESTAMP),
            format!(
                "EXISTS (SELECT 1 FROM json_each({}) WHERE json_extract(value, '$.stateName') = ?)",
                columns::IMAGES_INFO
            ),
        ]
        .join(" AND ");
        let suite_path = serde_json::to_string(&result.identity.suite_path)?;
        let timestamp = timestamp.to_string();
        store.delete(
            &DeleteParams {
                where_clause: Some(where_clause),
            },
            &[
                &suite_path,
                &result.identity.browser_id,
                ResultStatus::Updated.as_str(),
                &timestamp,
                state_name,
            ],
        )?;

        debug!("Undid acceptance of {} in {}", state_name, result_id);
        Ok(Some(UndoAcceptImageResult {
            undone_image,
            updated_image,
            removed_result,
            previous_expected_path,
            should_remove_reference,
            should_revert_reference: !should_remove_reference,
        }))
    }

    /// Image with the same state in the attempt right before `result_id`
    fn previous_image(&self, browser_id: &str, result_id: &str, state_name: &str) -> Option<ImageInfo> {
        let browser = self.tree.browsers.get(browser_id)?;
        let index = browser.result_ids.iter().position(|id| id == result_id)?;
        let previous_id = browser.result_ids.get(index.checked_sub(1)?)?;
        let previous = self.tree.results.get(previous_id)?;

        previous
            .image_ids
            .iter()
            .filter_map(|id| self.tree.images.get(id))
            .find(|image| image.info.state_name() == Some(state_name))
            .map(|image| image.info.clone())
    }

    /// Take over browsers, results and images of a previously built tree and
    /// seed the attempt tracker from them
    pub fn reuse_tests_tree(&mut self, reused: &Tree) {
        for browser_id in &reused.browsers.all_ids {
            let Some(browser) = reused.browsers.get(browser_id) else {
                continue;
            };
            let Some(suite) = reused.suites.by_id.get(&browser.parent_id) else {
                warn!("Reused browser {} has no parent suite", browser_id);
                continue;
            };
            let identity = TestIdentity::new(suite.suite_path.clone(), browser.name.clone());

            self.add_suites(&suite.suite_path, browser_id);

            if let Some(current) = self.tree.browsers.get(browser_id) {
                let stale: Vec<String> = current.result_ids.clone();
                for result_id in stale {
                    if let Some(result) = self.tree.results.remove(&result_id) {
                        self.remove_images(&result.image_ids);
                    }
                }
            }
            self.tree.browsers.upsert(browser_id, browser.clone());

            for result_id in &browser.result_ids {
                let Some(result) = reused.results.get(result_id) else {
                    continue;
                };
                self.tree.results.upsert(result_id, result.clone());
                for image_id in &result.image_ids {
                    if let Some(image) = reused.images.get(image_id) {
                        self.tree.images.upsert(image_id, image.clone());
                    }
                }
                self.attempts
                    .register_attempt(&identity, result.status, result.attempt);
            }

            self.set_status_for_branch(&suite.suite_path);
        }

        debug!("Reused {} browser(s)", reused.browsers.all_ids.len());
    }
}

fn push_unique(ids: &mut Vec<String>, id: String) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// Point in-memory payloads (buffers, base64) at their canonical report paths
fn derive_image_paths(result: &mut TestResult) {
    let identity = result.identity.clone();
    let attempt = result.attempt;

    for info in &mut result.images_info {
        let state_name = info.state_name().map(String::from);
        for kind in [ImageKind::Expected, ImageKind::Actual, ImageKind::Diff] {
            let Some(slot) = info.slot_mut(kind) else {
                continue;
            };
            if let Some(image) = slot {
                if image.path().is_none() {
                    *image = ImageData::File {
                        path: image_path(&identity, state_name.as_deref(), kind, attempt),
                        size: image.size(),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailImageInfo, ImageSize, SuccessImageInfo, UpdatedImageInfo};

    fn builder() -> ResultTreeBuilder {
        ResultTreeBuilder::new(Arc::new(AttemptTracker::new()))
    }

    fn result(path: &[&str], browser: &str, status: ResultStatus, attempt: u32) -> TestResult {
        let mut result = TestResult::new(TestIdentity::new(path.iter().copied(), browser), status);
        result.attempt = attempt;
        result
    }

    fn file(path: &str) -> Option<ImageData> {
        Some(ImageData::file(path, ImageSize { width: 2, height: 2 }))
    }

    #[test]
    fn test_add_creates_suite_chain() {
        let mut builder = builder();
        builder
            .add_test_result(result(&["a", "b"], "chrome", ResultStatus::Success, 0))
            .unwrap();

        let tree = builder.tree();
        assert_eq!(tree.suites.all_root_ids, vec!["a"]);
        assert_eq!(tree.suites.by_id["a"].suite_ids, vec!["a b"]);
        assert_eq!(tree.suites.by_id["a b"].browser_ids, vec!["a b chrome"]);
        assert_eq!(tree.browsers.by_id["a b chrome"].result_ids, vec!["a b chrome 0"]);
        assert_eq!(tree.suites.by_id["a"].status, Some(ResultStatus::Success));
    }

    #[test]
    fn test_replace_in_place_then_advance() {
        let mut builder = builder();
        builder.add_test_result(result(&["a"], "chrome", ResultStatus::Running, 0)).unwrap();
        assert_eq!(builder.tree().suites.by_id["a"].status, Some(ResultStatus::Running));

        builder.add_test_result(result(&["a"], "chrome", ResultStatus::Fail, 0)).unwrap();
        builder.add_test_result(result(&["a"], "chrome", ResultStatus::Success, 1)).unwrap();

        let tree = builder.tree();
        assert_eq!(tree.results.all_ids.len(), 2);
        assert_eq!(builder.browser_status("a chrome"), Some(ResultStatus::Success));
        assert_eq!(tree.suites.by_id["a"].status, Some(ResultStatus::Success));
    }

    #[test]
    fn test_attempt_gap_rejected() {
        let mut builder = builder();
        let err = builder
            .add_test_result(result(&["a"], "chrome", ResultStatus::Fail, 2))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResult(_)));
    }

    #[test]
    fn test_suite_status_propagation() {
        let mut builder = builder();
        builder.add_test_result(result(&["s", "t"], "chrome", ResultStatus::Success, 0)).unwrap();
        builder.add_test_result(result(&["s", "t"], "firefox", ResultStatus::Fail, 0)).unwrap();
        builder.add_test_result(result(&["x", "y"], "chrome", ResultStatus::Skipped, 0)).unwrap();
        builder.add_test_result(result(&["x", "z"], "chrome", ResultStatus::Skipped, 0)).unwrap();

        let suites = &builder.tree().suites.by_id;
        assert_eq!(suites["s t"].status, Some(ResultStatus::Fail));
        assert_eq!(suites["s"].status, Some(ResultStatus::Fail));
        assert_eq!(suites["x"].status, Some(ResultStatus::Skipped));
    }

    #[test]
    fn test_branch_excludes_sibling_attempts() {
        let mut builder = builder();
        builder.add_test_result(result(&["a", "b"], "chrome", ResultStatus::Fail, 0)).unwrap();
        builder.add_test_result(result(&["a", "b"], "chrome", ResultStatus::Success, 1)).unwrap();

        let branch = builder.get_test_branch("a b chrome 1").unwrap();
        let ids: Vec<&str> = branch.suites.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "a b"]);
        assert_eq!(branch.result.attempt, 1);
        assert_eq!(branch.result.id, "a b chrome 1");
        assert!(builder.get_test_branch("missing").is_none());
    }

    #[test]
    fn test_buffer_images_get_canonical_paths() {
        let mut builder = builder();
        let with_buffer = result(&["a"], "chrome", ResultStatus::Success, 0).with_images(vec![
            ImageInfo::Success(SuccessImageInfo {
                state_name: Some("plain".into()),
                expected_img: Some(ImageData::Buffer { buffer: vec![1, 2, 3], size: None }),
                ..Default::default()
            }),
        ]);

        let added = builder.add_test_result(with_buffer).unwrap();
        let path = added.images_info[0].image(ImageKind::Expected).unwrap().path().unwrap();
        assert!(path.ends_with("plain/chrome~ref_0.png"));
        assert!(builder.tree().images.by_id.contains_key("a chrome 0 plain"));
    }

    #[test]
    fn test_sort_tree() {
        let mut builder = builder();
        builder.add_test_result(result(&["b"], "firefox", ResultStatus::Success, 0)).unwrap();
        builder.add_test_result(result(&["b"], "chrome", ResultStatus::Success, 0)).unwrap();
        builder.add_test_result(result(&["a"], "chrome", ResultStatus::Success, 0)).unwrap();

        builder.sort_tree();
        assert_eq!(builder.tree().suites.all_root_ids, vec!["a", "b"]);
        assert_eq!(builder.tree().suites.by_id["b"].browser_ids, vec!["b chrome", "b firefox"]);
    }

    fn fail_then_updated(builder: &mut ResultTreeBuilder, store: &PersistenceStore) -> TestResult {
        let fail = result(&["a"], "chrome", ResultStatus::Fail, 0).with_images(vec![ImageInfo::Fail(FailImageInfo {
            state_name: Some("plain".into()),
            expected_img: file("images/h/plain/chrome~ref_0.png"),
            actual_img: file("images/h/plain/chrome~current_0.png"),
            diff_img: file("images/h/plain/chrome~diff_0.png"),
            ..Default::default()
        })]);
        builder.add_test_result(fail.clone()).unwrap();
        store.write(&fail).unwrap();

        let updated = result(&["a"], "chrome", ResultStatus::Updated, 1).with_images(vec![ImageInfo::Updated(
            UpdatedImageInfo {
                state_name: Some("plain".into()),
                ref_img: Some(ImageData::File { path: "/refs/plain.png".into(), size: None }),
                expected_img: file("images/h/plain/chrome~ref_1.png"),
                actual_img: file("images/h/plain/chrome~current_1.png"),
            },
        )]);
        builder.attempts().register_result(&fail.identity, ResultStatus::Fail);
        builder.attempts().register_result(&fail.identity, ResultStatus::Updated);
        builder.add_test_result(updated.clone()).unwrap();
        store.write(&updated).unwrap();
        updated
    }

    #[test]
    fn test_undo_removes_synthetic_attempt() {
        let mut builder = builder();
        let store = PersistenceStore::open_memory().unwrap();
        let updated = fail_then_updated(&mut builder, &store);

        let undo = builder.undo_accept_image(&updated, "plain", &store).unwrap().unwrap();

        assert_eq!(undo.removed_result.as_ref().map(|r| r.id.as_str()), Some("a chrome 1"));
        assert!(undo.updated_image.is_none());
        assert!(undo.should_remove_reference);
        assert_eq!(undo.previous_expected_path.as_deref(), Some("images/h/plain/chrome~ref_0.png"));
        assert_eq!(builder.attempts().get_current_attempt(&updated.identity), 0);
        assert_eq!(builder.browser_status("a chrome"), Some(ResultStatus::Fail));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_undo_restores_previous_image_snapshot() {
        let mut builder = builder();
        let store = PersistenceStore::open_memory().unwrap();
        fail_then_updated(&mut builder, &store);

        // attempt 1 carries two accepted states, undoing one keeps the attempt
        let second = ImageInfo::Updated(UpdatedImageInfo {
            state_name: Some("header".into()),
            expected_img: file("images/h/header/chrome~ref_1.png"),
            ..Default::default()
        });
        let mut images = builder.get_images_info("a chrome 1");
        images.push(second);
        let updated = result(&["a"], "chrome", ResultStatus::Updated, 1).with_images(images);
        builder.add_test_result(updated.clone()).unwrap();

        let previous = builder.get_images_info("a chrome 0")[0].clone();
        let undo = builder.undo_accept_image(&updated, "plain", &store).unwrap().unwrap();

        assert!(undo.removed_result.is_none());
        assert_eq!(undo.updated_image.unwrap().info, previous);
        assert_eq!(builder.get_images_info("a chrome 1")[0], previous);
        assert_eq!(builder.attempts().get_current_attempt(&updated.identity), 1);
    }

    #[test]
    fn test_undo_ignores_non_updated_image() {
        let mut builder = builder();
        let store = PersistenceStore::open_memory().unwrap();
        let success = result(&["a"], "chrome", ResultStatus::Success, 0).with_images(vec![ImageInfo::Success(
            SuccessImageInfo {
                state_name: Some("plain".into()),
                expected_img: file("images/h/plain/chrome~ref_0.png"),
                ..Default::default()
            },
        )]);
        builder.add_test_result(success.clone()).unwrap();

        assert!(builder.undo_accept_image(&success, "plain", &store).unwrap().is_none());
    }

    #[test]
    fn test_reuse_tests_tree_seeds_attempts() {
        let mut previous = builder();
        previous.add_test_result(result(&["a", "b"], "chrome", ResultStatus::Fail, 0)).unwrap();
        previous.add_test_result(result(&["a", "b"], "chrome", ResultStatus::Success, 1)).unwrap();

        let mut builder = builder();
        builder.reuse_tests_tree(previous.tree());

        let identity = TestIdentity::new(["a", "b"], "chrome");
        assert_eq!(builder.attempts().get_current_attempt(&identity), 1);
        assert_eq!(builder.get_last_result(&identity).map(|r| r.attempt), Some(1));
        assert_eq!(builder.tree().suites.by_id["a"].status, Some(ResultStatus::Success));
    }

    #[test]
    fn test_tree_serializes_camel_case() {
        let mut builder = builder();
        builder.add_test_result(result(&["a"], "chrome", ResultStatus::Success, 0)).unwrap();

        let json = serde_json::to_value(builder.tree()).unwrap();
        assert!(json["suites"]["allRootIds"].is_array());
        assert_eq!(json["browsers"]["byId"]["a chrome"]["resultIds"][0], "a chrome 0");
    }
}
