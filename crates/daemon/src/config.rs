//! Reporter configuration

use serde::{Deserialize, Serialize};
use snapreport_common::manifest::DATABASE_URLS_JSON_NAME;
use snapreport_common::store::LOCAL_DATABASE_NAME;
use snapreport_common::images::IMAGES_DIR;
use std::path::{Path, PathBuf};

/// Reporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Report output directory
    pub report_path: PathBuf,

    /// Continue an existing report instead of starting from scratch
    pub reuse: bool,

    /// Results processed concurrently
    pub queue_concurrency: usize,

    /// Pixel comparison configuration
    pub diff: DiffConfig,

    /// Live stream configuration
    pub stream: StreamConfig,

    /// Host substituted into result urls
    pub base_host: Option<String>,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            report_path: PathBuf::from(snapreport_common::DEFAULT_REPORT_PATH),
            reuse: false,
            queue_concurrency: host_parallelism(),
            diff: DiffConfig::default(),
            stream: StreamConfig::default(),
            base_host: None,
        }
    }
}

/// Pixel comparison configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Per-channel difference still counted as equal
    pub tolerance: f64,

    /// Extra tolerance for pixels next to a high-contrast edge
    pub antialiasing_tolerance: f64,

    /// Diff computations allowed at once
    pub workers: usize,

    /// Color of differing pixels in diff images
    pub diff_color: String,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            tolerance: 2.3,
            antialiasing_tolerance: 4.0,
            workers: host_parallelism(),
            diff_color: "#ff00ff".to_string(),
        }
    }
}

/// Live stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Frames buffered per subscriber before it starts lagging
    pub capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl ReporterConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.report_path.join(LOCAL_DATABASE_NAME)
    }

    /// Get the database manifest path
    pub fn manifest_path(&self) -> PathBuf {
        self.report_path.join(DATABASE_URLS_JSON_NAME)
    }

    /// Get the images directory
    pub fn images_dir(&self) -> PathBuf {
        self.report_path.join(IMAGES_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = ReporterConfig::load(&tmp.path().join("absent.toml")).unwrap();

        assert_eq!(config.report_path, PathBuf::from("snapreport"));
        assert!(!config.reuse);
        assert!(config.queue_concurrency >= 1);
        assert_eq!(config.db_path(), PathBuf::from("snapreport/sqlite.db"));
        assert_eq!(config.manifest_path(), PathBuf::from("snapreport/databaseUrls.json"));
    }

    #[test]
    fn test_save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("conf/snapreport.toml");

        let config = ReporterConfig {
            report_path: PathBuf::from("out/report"),
            reuse: true,
            queue_concurrency: 3,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = ReporterConfig::load(&path).unwrap();
        assert_eq!(loaded.report_path, PathBuf::from("out/report"));
        assert!(loaded.reuse);
        assert_eq!(loaded.queue_concurrency, 3);
        assert_eq!(loaded.images_dir(), PathBuf::from("out/report/images"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ReporterConfig = toml::from_str("reuse = true\n[diff]\ntolerance = 5.0\n").unwrap();
        assert!(config.reuse);
        assert_eq!(config.diff.tolerance, 5.0);
        assert_eq!(config.stream.capacity, 1024);
    }
}
