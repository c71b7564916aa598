//! Report merging
//!
//! Combines several generated reports into one directory. Only files move:
//! database files are copied side by side and listed in a combined
//! `databaseUrls.json`, which report viewers merge row by row.

use snapreport_common::images::IMAGES_DIR;
use snapreport_common::store::LOCAL_DATABASE_NAME;
use snapreport_common::{DbUrlsManifest, Error};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{ReporterError, Result};

/// Artifact directories carried over from every source report
pub const ARTIFACT_DIRS: &[&str] = &[IMAGES_DIR, "snapshots", "error-details"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub databases: usize,
    pub remote_urls: usize,
    pub files: usize,
}

fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// First `<stem>_<n>.<ext>` not yet present in `dir`
fn unique_name(dir: &Path, stem: &str, ext: &str) -> String {
    let mut n = 1;
    loop {
        let name = format!("{}_{}.{}", stem, n, ext);
        if !dir.join(&name).exists() {
            return name;
        }
        n += 1;
    }
}

async fn source_manifest(source: &Path) -> Result<DbUrlsManifest> {
    if let Some(manifest) = DbUrlsManifest::read(source).await? {
        return Ok(manifest);
    }
    if source.join(LOCAL_DATABASE_NAME).exists() {
        warn!("No manifest in {:?}, using its {}", source, LOCAL_DATABASE_NAME);
        return Ok(DbUrlsManifest::local());
    }
    Err(Error::NotFound {
        kind: "report".to_string(),
        id: source.display().to_string(),
    }
    .into())
}

/// Copy one database or JSON url of `source` into `destination`, returning the
/// url to list in the combined manifest
async fn carry_url(url: &str, source: &Path, destination: &Path, stats: &mut MergeStats) -> Result<Option<String>> {
    if is_remote(url) {
        stats.remote_urls += 1;
        return Ok(Some(url.to_string()));
    }

    let src = source.join(url);
    if !src.exists() {
        warn!("Skipping missing database {:?}", src);
        return Ok(None);
    }

    let stem = src.file_stem().and_then(|s| s.to_str()).unwrap_or("sqlite");
    let ext = src.extension().and_then(|s| s.to_str()).unwrap_or("db");
    let name = unique_name(destination, stem, ext);
    fs::copy(&src, destination.join(&name)).await?;

    debug!("Copied {:?} as {}", src, name);
    stats.databases += 1;
    Ok(Some(name))
}

async fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    if !from.is_dir() {
        return Ok(0);
    }

    let mut copied = 0;
    for entry in walkdir::WalkDir::new(from)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };

        let dest = to.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(entry.path(), &dest).await?;
        copied += 1;
    }
    Ok(copied)
}

/// Merge `sources` into `destination` and write the combined manifest
pub async fn merge_reports(destination: &Path, sources: &[PathBuf]) -> Result<MergeStats> {
    if sources.is_empty() {
        return Err(ReporterError::Config("nothing to merge".to_string()));
    }
    if sources.iter().any(|s| s == destination) {
        return Err(ReporterError::Config(format!(
            "destination {:?} is also a source",
            destination
        )));
    }

    fs::create_dir_all(destination).await?;

    let mut stats = MergeStats::default();
    let mut combined = DbUrlsManifest::default();

    for source in sources {
        let manifest = source_manifest(source).await?;
        let mut carried = DbUrlsManifest::default();

        for url in &manifest.db_urls {
            carried.db_urls.extend(carry_url(url, source, destination, &mut stats).await?);
        }
        for url in &manifest.json_urls {
            carried.json_urls.extend(carry_url(url, source, destination, &mut stats).await?);
        }
        combined.extend(&carried);

        for dir in ARTIFACT_DIRS {
            stats.files += copy_tree(&source.join(dir), &destination.join(dir)).await?;
        }
        info!("Merged report {:?}", source);
    }

    combined.write(destination).await?;

    info!(
        "Merged {} report(s) into {:?}: {} database(s), {} remote url(s), {} file(s)",
        sources.len(),
        destination,
        stats.databases,
        stats.remote_urls,
        stats.files
    );
    Ok(stats)
}
