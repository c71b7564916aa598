//! End-to-end report scenarios
//!
//! Drives the orchestrator with runner events and real PNG fixtures.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use snapreport_common::images::image_path;
use snapreport_common::manifest::DATABASE_URLS_JSON_NAME;
use snapreport_common::store::LOCAL_DATABASE_NAME;
use snapreport_common::{
    DiffRequest, DiffWorker, Error, FailImageInfo, ImageData, ImageInfo, ImageKind, ImageSize, ResultStatus,
    TestError, TestIdentity, TestResult,
};
use snapreport_daemon::config::DiffConfig;
use snapreport_daemon::{ClientEvent, ReportOrchestrator, ReporterConfig, ReporterError, RunnerEvent};
use tempfile::TempDir;

fn config(dir: &Path) -> ReporterConfig {
    ReporterConfig {
        report_path: dir.join("report"),
        queue_concurrency: 4,
        diff: DiffConfig {
            workers: 2,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn write_png(path: &Path, color: [u8; 4]) -> ImageData {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbaImage::from_pixel(4, 4, Rgba(color)).save(path).unwrap();
    ImageData::file(path.to_string_lossy(), ImageSize { width: 4, height: 4 })
}

fn identity(browser: &str) -> TestIdentity {
    TestIdentity::new(["a", "b"], browser)
}

fn result(browser: &str) -> TestResult {
    TestResult::new(identity(browser), ResultStatus::Idle)
}

/// Failed comparison of `state` with a reference file and a different actual screenshot
fn failed_state(dir: &Path, state: &str) -> ImageInfo {
    let reference = write_png(&dir.join(format!("refs/{}.png", state)), [0, 0, 0, 255]);
    let actual = write_png(&dir.join(format!("shots/{}.png", state)), [255, 255, 255, 255]);

    ImageInfo::Fail(FailImageInfo {
        state_name: Some(state.to_string()),
        ref_img: Some(reference.clone()),
        expected_img: Some(reference),
        actual_img: Some(actual),
        ..Default::default()
    })
}

/// Diff worker that copies the current image and counts calls
#[derive(Default)]
struct CountingWorker {
    calls: AtomicUsize,
}

#[async_trait]
impl DiffWorker for CountingWorker {
    async fn save_diff_to(&self, request: DiffRequest, dest: &Path) -> snapreport_common::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(&request.current, dest).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_single_passing_test() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let report_path = config.report_path.clone();

    let mut orchestrator = ReportOrchestrator::new(config).unwrap();
    let mut frames = orchestrator.subscribe();

    orchestrator.handle_event(RunnerEvent::RunnerStart).await.unwrap();
    orchestrator.handle_event(RunnerEvent::TestBegin(result("chrome"))).await.unwrap();
    orchestrator.handle_event(RunnerEvent::TestPass(result("chrome"))).await.unwrap();
    orchestrator.handle_event(RunnerEvent::RunnerEnd).await.unwrap();

    let report = orchestrator.finish().await.unwrap();
    let tree = &report.tree;

    assert_eq!(tree.suites.all_root_ids, vec!["a"]);
    assert_eq!(tree.suites.by_id["a"].suite_ids, vec!["a b"]);
    assert_eq!(tree.suites.by_id["a b"].browser_ids, vec!["a b chrome"]);
    assert_eq!(tree.browsers.get("a b chrome").unwrap().result_ids, vec!["a b chrome 0"]);

    let result = tree.results.get("a b chrome 0").unwrap();
    assert_eq!(result.attempt, 0);
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(tree.suites.by_id["a"].status, Some(ResultStatus::Success));

    assert!(report_path.join(LOCAL_DATABASE_NAME).exists());
    let manifest = fs::read_to_string(report_path.join(DATABASE_URLS_JSON_NAME)).unwrap();
    assert!(manifest.contains("sqlite.db"));

    let mut events = Vec::new();
    while let Ok(frame) = frames.try_recv() {
        events.push(frame.event);
    }
    assert_eq!(
        events,
        vec![ClientEvent::BeginState, ClientEvent::TestResult, ClientEvent::End]
    );
}

#[tokio::test]
async fn test_failed_screenshot_gets_diff() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let report_path = config.report_path.clone();
    let mut orchestrator = ReportOrchestrator::new(config).unwrap();

    let failed = result("chrome").with_images(vec![failed_state(tmp.path(), "plain")]);
    orchestrator.handle_event(RunnerEvent::TestFail(failed)).await.unwrap();

    let report = orchestrator.finish().await.unwrap();
    let result = report.tree.results.get("a b chrome 0").unwrap();
    assert_eq!(result.status, ResultStatus::Fail);

    let image = report.tree.images.get("a b chrome 0 plain").unwrap();
    let diff_path = image_path(&identity("chrome"), Some("plain"), ImageKind::Diff, 0);
    assert_eq!(image.info.image(ImageKind::Diff).and_then(ImageData::path), Some(diff_path.as_str()));
    assert!(image.info.image(ImageKind::Diff).unwrap().is_resolved());

    let diff = image::open(report_path.join(&diff_path)).unwrap().to_rgba8();
    assert_eq!(*diff.get_pixel(0, 0), Rgba([255, 0, 255, 255]));

    let actual = image.info.image(ImageKind::Actual).and_then(ImageData::path).unwrap();
    assert!(report_path.join(actual).exists());
}

#[tokio::test]
async fn test_retry_after_error() {
    let tmp = TempDir::new().unwrap();
    let mut orchestrator = ReportOrchestrator::new(config(tmp.path())).unwrap();

    let errored = result("chrome").with_error(TestError::new("boom"));
    orchestrator.handle_event(RunnerEvent::TestBegin(result("chrome"))).await.unwrap();
    orchestrator.handle_event(RunnerEvent::Retry(errored)).await.unwrap();
    orchestrator.handle_event(RunnerEvent::TestBegin(result("chrome"))).await.unwrap();
    orchestrator.handle_event(RunnerEvent::TestPass(result("chrome"))).await.unwrap();
    orchestrator.handle_event(RunnerEvent::RunnerEnd).await.unwrap();

    let rows = orchestrator.store().read_all().unwrap();
    let statuses: Vec<ResultStatus> = rows.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![ResultStatus::Error, ResultStatus::Success]);

    let report = orchestrator.finish().await.unwrap();
    let tree = &report.tree;
    assert_eq!(
        tree.browsers.get("a b chrome").unwrap().result_ids,
        vec!["a b chrome 0", "a b chrome 1"]
    );
    assert_eq!(tree.results.get("a b chrome 0").unwrap().status, ResultStatus::Error);
    assert_eq!(tree.results.get("a b chrome 1").unwrap().status, ResultStatus::Success);
    assert_eq!(tree.suites.by_id["a b"].status, Some(ResultStatus::Success));
}

#[tokio::test]
async fn test_identical_comparisons_diffed_once() {
    let tmp = TempDir::new().unwrap();
    let worker = Arc::new(CountingWorker::default());
    let mut orchestrator = ReportOrchestrator::with_diff_worker(config(tmp.path()), worker.clone()).unwrap();

    let image = failed_state(tmp.path(), "plain");
    for browser in ["chrome", "firefox"] {
        let failed = result(browser).with_images(vec![image.clone()]);
        orchestrator.handle_event(RunnerEvent::TestFail(failed)).await.unwrap();
    }

    let report = orchestrator.finish().await.unwrap();
    for browser in ["chrome", "firefox"] {
        let image = report.tree.images.get(&format!("a b {} 0 plain", browser)).unwrap();
        assert!(image.info.image(ImageKind::Diff).is_some(), "{} has no diff", browser);
    }
    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_skipped_test_listed() {
    let tmp = TempDir::new().unwrap();
    let mut orchestrator = ReportOrchestrator::new(config(tmp.path())).unwrap();

    let mut skipped = result("chrome");
    skipped.skip_reason = Some("flaky on ci".to_string());
    orchestrator.handle_event(RunnerEvent::TestPending(skipped)).await.unwrap();
    orchestrator.handle_event(RunnerEvent::TestPass(result("firefox"))).await.unwrap();

    let report = orchestrator.finish().await.unwrap();
    assert_eq!(report.skips.len(), 1);
    assert_eq!(report.skips[0].suite, "a b");
    assert_eq!(report.skips[0].browser, "chrome");
    assert_eq!(report.skips[0].comment.as_deref(), Some("flaky on ci"));
    assert_eq!(report.tree.suites.by_id["a b"].status, Some(ResultStatus::Success));
}

#[tokio::test]
async fn test_malformed_result_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut orchestrator = ReportOrchestrator::new(config(tmp.path())).unwrap();

    let broken = TestResult::new(TestIdentity::new(["a", ""], "chrome"), ResultStatus::Idle);
    assert!(orchestrator.handle_event(RunnerEvent::TestPass(broken)).await.is_err());

    let report = orchestrator.finish().await.unwrap();
    assert!(report.tree.results.all_ids.is_empty());
}

#[tokio::test]
async fn test_base_host_rewrites_suite_url() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path());
    config.base_host = Some("https://ci.example.com".to_string());
    let mut orchestrator = ReportOrchestrator::new(config).unwrap();

    let mut passed = result("chrome");
    passed.suite_url = Some("http://localhost:8080/suite?grep=login#top".to_string());
    orchestrator.handle_event(RunnerEvent::TestPass(passed)).await.unwrap();

    let report = orchestrator.finish().await.unwrap();
    let result = report.tree.results.get("a b chrome 0").unwrap();
    assert_eq!(result.suite_url.as_deref(), Some("https://ci.example.com/suite?grep=login#top"));
    assert!(result.meta_info.get("baseHost").is_none());
}

#[tokio::test]
async fn test_store_failure_aborts_report() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let report_path = config.report_path.clone();
    let mut orchestrator = ReportOrchestrator::new(config).unwrap();

    orchestrator.store().close().unwrap();
    orchestrator.handle_event(RunnerEvent::TestPass(result("chrome"))).await.unwrap();

    let err = orchestrator.finish().await.unwrap_err();
    assert!(matches!(err, ReporterError::Core(Error::NotInitialized)));
    assert!(err.is_persistence());
    assert!(!report_path.join(DATABASE_URLS_JSON_NAME).exists());
}

#[tokio::test]
async fn test_accept_then_undo_restores_reference() {
    let tmp = TempDir::new().unwrap();
    let reference: PathBuf = tmp.path().join("refs/plain.png");
    let mut orchestrator = ReportOrchestrator::new(config(tmp.path())).unwrap();

    let failed = result("chrome").with_images(vec![failed_state(tmp.path(), "plain")]);
    let original = fs::read(&reference).unwrap();
    orchestrator.handle_event(RunnerEvent::TestFail(failed)).await.unwrap();

    let branch = orchestrator.accept_images("a b chrome 0", &["plain"]).await.unwrap();
    assert_eq!(branch.result.id, "a b chrome 1");
    assert_eq!(branch.result.status, ResultStatus::Updated);
    assert_eq!(orchestrator.attempts().get_current_attempt(&identity("chrome")), 1);
    assert_eq!(fs::read(&reference).unwrap(), fs::read(tmp.path().join("shots/plain.png")).unwrap());
    assert_eq!(orchestrator.store().count().unwrap(), 2);

    let undone = orchestrator.undo_accept_images("a b chrome 1", &["plain"]).await.unwrap();
    assert_eq!(undone.removed_results, vec!["a b chrome 1"]);
    assert!(undone.updated_images.is_empty());
    assert!(orchestrator.get_test_branch("a b chrome 1").is_none());
    assert_eq!(orchestrator.attempts().get_current_attempt(&identity("chrome")), 0);
    assert_eq!(orchestrator.store().count().unwrap(), 1);
    assert_eq!(fs::read(&reference).unwrap(), original);

    let report = orchestrator.finish().await.unwrap();
    assert_eq!(report.tree.suites.by_id["a b"].status, Some(ResultStatus::Fail));
}

#[tokio::test]
async fn test_undo_one_of_two_accepted_states_keeps_result() {
    let tmp = TempDir::new().unwrap();
    let mut orchestrator = ReportOrchestrator::new(config(tmp.path())).unwrap();

    let failed = result("chrome").with_images(vec![
        failed_state(tmp.path(), "header"),
        failed_state(tmp.path(), "footer"),
    ]);
    orchestrator.handle_event(RunnerEvent::TestFail(failed)).await.unwrap();
    orchestrator
        .accept_images("a b chrome 0", &["header", "footer"])
        .await
        .unwrap();

    let undone = orchestrator.undo_accept_images("a b chrome 1", &["header"]).await.unwrap();
    assert!(undone.removed_results.is_empty());
    assert_eq!(undone.updated_images.len(), 1);
    assert_eq!(undone.updated_images[0].info.status(), ResultStatus::Fail);

    let branch = orchestrator.get_test_branch("a b chrome 1").unwrap();
    let statuses: Vec<ResultStatus> = branch.images.iter().map(|i| i.info.status()).collect();
    assert_eq!(statuses, vec![ResultStatus::Fail, ResultStatus::Updated]);
    assert_eq!(orchestrator.attempts().get_current_attempt(&identity("chrome")), 1);
}

#[tokio::test]
async fn test_reuse_hydrates_previous_run() {
    let tmp = TempDir::new().unwrap();

    let mut first = ReportOrchestrator::new(config(tmp.path())).unwrap();
    let errored = result("chrome").with_error(TestError::new("boom"));
    first.handle_event(RunnerEvent::TestFail(errored)).await.unwrap();
    first.finish().await.unwrap();

    let mut reused = config(tmp.path());
    reused.reuse = true;
    let mut second = ReportOrchestrator::new(reused).unwrap();
    assert_eq!(second.hydrate().unwrap(), 1);

    second.handle_event(RunnerEvent::TestPass(result("chrome"))).await.unwrap();
    let report = second.finish().await.unwrap();

    assert_eq!(
        report.tree.browsers.get("a b chrome").unwrap().result_ids,
        vec!["a b chrome 0", "a b chrome 1"]
    );
    assert_eq!(report.tree.results.get("a b chrome 1").unwrap().status, ResultStatus::Success);
}
