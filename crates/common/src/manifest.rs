//! Report database manifest
//!
//! `databaseUrls.json` lists the databases a report viewer should merge.
//! A freshly generated report points at its own `sqlite.db`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::store::LOCAL_DATABASE_NAME;
use crate::Result;

pub const DATABASE_URLS_JSON_NAME: &str = "databaseUrls.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbUrlsManifest {
    #[serde(default)]
    pub db_urls: Vec<String>,
    #[serde(default)]
    pub json_urls: Vec<String>,
}

impl DbUrlsManifest {
    /// Manifest of a single locally generated report
    pub fn local() -> Self {
        Self {
            db_urls: vec![LOCAL_DATABASE_NAME.to_string()],
            json_urls: Vec::new(),
        }
    }

    /// Read `databaseUrls.json` from a report directory, `None` when absent
    pub async fn read(report_dir: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = report_dir.as_ref().join(DATABASE_URLS_JSON_NAME);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `databaseUrls.json` into a report directory, replacing any previous one
    pub async fn write(&self, report_dir: impl AsRef<Path>) -> Result<()> {
        let report_dir = report_dir.as_ref();
        fs::create_dir_all(report_dir).await?;

        let path = report_dir.join(DATABASE_URLS_JSON_NAME);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(self)?).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!("Wrote {} with {} database(s)", path.display(), self.db_urls.len());
        Ok(())
    }

    /// Append urls not already listed, keeping order
    pub fn extend(&mut self, other: &DbUrlsManifest) {
        for url in &other.db_urls {
            if !self.db_urls.contains(url) {
                self.db_urls.push(url.clone());
            }
        }
        for url in &other.json_urls {
            if !self.json_urls.contains(url) {
                self.json_urls.push(url.clone());
            }
        }
    }
}
