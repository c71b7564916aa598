//! Append-only SQLite store for test results
//!
//! One flat table, one row per terminal test outcome. Rows are never updated:
//! the current value for an identity is the newest row matching a filter.

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::manifest::DATABASE_URLS_JSON_NAME;
use crate::types::{ImageInfo, ResultStatus, TestIdentity, TestResult};
use crate::{Error, Result};

pub const LOCAL_DATABASE_NAME: &str = "sqlite.db";
pub const DB_SUITES_TABLE_NAME: &str = "suites";
pub const DB_VERSION_TABLE_NAME: &str = "version";
pub const DB_SCHEMA_VERSION: i64 = 1;

/// Column names of the suites table
pub mod columns {
    pub const SUITE_PATH: &str = "suitePath";
    pub const SUITE_NAME: &str = "suiteName";
    pub const NAME: &str = "name";
    pub const SUITE_URL: &str = "suiteUrl";
    pub const META_INFO: &str = "metaInfo";
    pub const HISTORY: &str = "history";
    pub const DESCRIPTION: &str = "description";
    pub const ERROR: &str = "error";
    pub const SKIP_REASON: &str = "skipReason";
    pub const IMAGES_INFO: &str = "imagesInfo";
    pub const SCREENSHOT: &str = "screenshot";
    pub const MULTIPLE_TABS: &str = "multipleTabs";
    pub const STATUS: &str = "status";
    pub const TIMESTAMP: &str = "timestamp";
    pub const DURATION: &str = "duration";
}

/// Suites table layout, in insertion order
pub const SUITES_TABLE_COLUMNS: &[(&str, &str)] = &[
    (columns::SUITE_PATH, "TEXT"),
    (columns::SUITE_NAME, "TEXT"),
    (columns::NAME, "TEXT"),
    (columns::SUITE_URL, "TEXT"),
    (columns::META_INFO, "TEXT"),
    (columns::HISTORY, "TEXT"),
    (columns::DESCRIPTION, "TEXT"),
    (columns::ERROR, "TEXT"),
    (columns::SKIP_REASON, "TEXT"),
    (columns::IMAGES_INFO, "TEXT"),
    (columns::SCREENSHOT, "INT"),
    (columns::MULTIPLE_TABS, "INT"),
    (columns::STATUS, "TEXT"),
    (columns::TIMESTAMP, "INT"),
    (columns::DURATION, "INT"),
];

/// Parameters of a SELECT against the suites table
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub select: Option<String>,
    pub where_clause: Option<String>,
    pub order_by: Option<String>,
    pub order_descending: bool,
    pub limit: Option<usize>,
    pub no_cache: bool,
}

/// Parameters of a DELETE against the suites table
#[derive(Debug, Clone, Default)]
pub struct DeleteParams {
    pub where_clause: Option<String>,
}

/// One row returned by [`PersistenceStore::query`], keyed by column name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRow {
    values: HashMap<String, SqlValue>,
}

impl QueryRow {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        match self.values.get(column) {
            Some(SqlValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        match self.values.get(column) {
            Some(SqlValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }
}

/// Embedded store wrapper.
///
/// Access is serialized through one connection; the query cache is cleared on
/// every write and delete so a cached filter never outlives the rows it saw.
#[derive(Clone)]
pub struct PersistenceStore {
    conn: Arc<Mutex<Option<Connection>>>,
    query_cache: Arc<Mutex<HashMap<String, Option<QueryRow>>>>,
    path: Option<PathBuf>,
}

impl PersistenceStore {
    /// Open the report database, starting from scratch unless `reuse` is set
    pub fn open(report_dir: impl AsRef<Path>, reuse: bool) -> Result<Self> {
        let report_dir = report_dir.as_ref();
        let db_path = report_dir.join(LOCAL_DATABASE_NAME);

        if !reuse {
            for stale in [db_path.clone(), report_dir.join(DATABASE_URLS_JSON_NAME)] {
                match std::fs::remove_file(&stale) {
                    Ok(()) => debug!("Removed stale {:?}", stale),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        std::fs::create_dir_all(report_dir)?;

        let conn = Connection::open(&db_path).map_err(|e| {
            Error::Persistence(format!("error creating database at {:?}: {}", db_path, e))
        })?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        let store = Self::from_connection(conn, Some(db_path.clone()));
        store.init_schema()?;

        info!("Opened report database at {:?}", db_path);
        Ok(store)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let store = Self::from_connection(Connection::open_in_memory()?, None);
        store.init_schema()?;
        Ok(store)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            query_cache: Arc::new(Mutex::new(HashMap::new())),
            path,
        }
    }

    /// Database file location, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::NotInitialized)?;
        f(conn)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(&create_table_query(DB_SUITES_TABLE_NAME, SUITES_TABLE_COLUMNS))?;
            conn.execute_batch(&create_table_query(
                DB_VERSION_TABLE_NAME,
                &[("version_number", "INT")],
            ))?;

            let versions: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", DB_VERSION_TABLE_NAME),
                [],
                |row| row.get(0),
            )?;
            if versions == 0 {
                conn.execute(
                    &format!("INSERT INTO {} VALUES (?1)", DB_VERSION_TABLE_NAME),
                    [DB_SCHEMA_VERSION],
                )?;
            }

            debug!("Database schema initialized");
            Ok(())
        })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Append one row for a terminal result. Ephemeral results are skipped.
    pub fn write(&self, result: &TestResult) -> Result<()> {
        if result.status.is_ephemeral() {
            debug!("Skipping write of ephemeral {} result {}", result.status, result.id());
            return Ok(());
        }

        let values = row_values(result)?;
        let placeholders = vec!["?"; values.len()].join(", ");

        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO {} VALUES ({})", DB_SUITES_TABLE_NAME, placeholders),
                params_from_iter(values.iter()),
            )?;
            Ok(())
        })?;
        self.query_cache.lock().clear();

        debug!("Wrote {} result {}", result.status, result.id());
        Ok(())
    }

    /// Delete rows matching `params`, returns how many went away
    pub fn delete(&self, params: &DeleteParams, args: &[&str]) -> Result<usize> {
        let mut sentence = format!("DELETE FROM {}", DB_SUITES_TABLE_NAME);
        if let Some(where_clause) = &params.where_clause {
            sentence.push_str(&format!(" WHERE {}", where_clause));
        }

        let deleted = self.with_conn(|conn| Ok(conn.execute(&sentence, params_from_iter(args.iter()))?))?;
        self.query_cache.lock().clear();

        if deleted > 0 {
            debug!("Deleted {} row(s) from {}", deleted, DB_SUITES_TABLE_NAME);
        }
        Ok(deleted)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// First row of a parameterized SELECT, cached by query shape and arguments
    pub fn query(&self, params: &QueryParams, args: &[&str]) -> Result<Option<QueryRow>> {
        let cache_key = (!params.no_cache).then(|| query_cache_key(params, args));

        if let Some(key) = &cache_key {
            if let Some(cached) = self.query_cache.lock().get(key) {
                return Ok(cached.clone());
            }
        }

        let sentence = format!(
            "SELECT {} FROM {}{}",
            params.select.as_deref().unwrap_or("*"),
            DB_SUITES_TABLE_NAME,
            create_sentence(params)
        );

        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sentence)?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let row = stmt
                .query_row(params_from_iter(args.iter()), |row| {
                    let mut values = HashMap::with_capacity(names.len());
                    for (index, name) in names.iter().enumerate() {
                        values.insert(name.clone(), row.get::<_, SqlValue>(index)?);
                    }
                    Ok(QueryRow { values })
                })
                .optional()?;
            Ok(row)
        })?;

        if let Some(key) = cache_key {
            self.query_cache.lock().insert(key, row.clone());
        }

        Ok(row)
    }

    /// Images of the newest row stored for an identity
    pub fn last_images_info(&self, identity: &TestIdentity) -> Result<Vec<ImageInfo>> {
        let suite_path = serde_json::to_string(&identity.suite_path)?;
        let row = self.query(
            &QueryParams {
                select: Some(columns::IMAGES_INFO.to_string()),
                where_clause: Some(format!("{} = ? AND {} = ?", columns::SUITE_PATH, columns::NAME)),
                order_by: Some(columns::TIMESTAMP.to_string()),
                order_descending: true,
                limit: Some(1),
                no_cache: false,
            },
            &[&suite_path, &identity.browser_id],
        )?;

        match row.as_ref().and_then(|r| r.text(columns::IMAGES_INFO)) {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Every stored row in write order, attempts left at 0
    pub fn read_all(&self) -> Result<Vec<TestResult>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM {} ORDER BY {} ASC, rowid ASC",
                SUITES_TABLE_COLUMNS
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", "),
                DB_SUITES_TABLE_NAME,
                columns::TIMESTAMP
            ))?;

            let rows = stmt.query_map([], |row| {
                Ok(RawRow {
                    suite_path: row.get(0)?,
                    name: row.get(2)?,
                    suite_url: row.get(3)?,
                    meta_info: row.get(4)?,
                    history: row.get(5)?,
                    description: row.get(6)?,
                    error: row.get(7)?,
                    skip_reason: row.get(8)?,
                    images_info: row.get(9)?,
                    multiple_tabs: row.get(11)?,
                    status: row.get(12)?,
                    timestamp: row.get(13)?,
                    duration: row.get(14)?,
                })
            })?;

            let mut results = Vec::new();
            for row in rows {
                results.push(row?.parse()?);
            }
            Ok(results)
        })
    }

    pub fn count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", DB_SUITES_TABLE_NAME),
                [],
                |row| row.get(0),
            )?)
        })
    }

    /// Compact the database and release the handle. Later calls fail with `NotInitialized`.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock();
        let conn = guard.take().ok_or(Error::NotInitialized)?;

        conn.execute_batch("VACUUM")?;
        conn.close().map_err(|(_, e)| Error::Database(e))?;
        self.query_cache.lock().clear();

        debug!("Database connection closed");
        Ok(())
    }
}

fn create_table_query(table: &str, columns: &[(&str, &str)]) -> String {
    let formatted = columns
        .iter()
        .map(|(name, sql_type)| format!("{} {}", name, sql_type))
        .collect::<Vec<_>>()
        .join(", ");

    format!("CREATE TABLE IF NOT EXISTS {} ({})", table, formatted)
}

fn create_sentence(params: &QueryParams) -> String {
    let mut sentence = String::new();

    if let Some(where_clause) = &params.where_clause {
        sentence.push_str(&format!(" WHERE {}", where_clause));
    }
    if let Some(order_by) = &params.order_by {
        let direction = if params.order_descending { "DESC" } else { "ASC" };
        sentence.push_str(&format!(" ORDER BY {} {}", order_by, direction));
    }
    if let Some(limit) = params.limit {
        sentence.push_str(&format!(" LIMIT {}", limit));
    }

    sentence
}

/// Full query shape and arguments. Debug formatting quotes every part so
/// distinct queries never share a key.
fn query_cache_key(params: &QueryParams, args: &[&str]) -> String {
    format!(
        "{:?}",
        (
            params.select.as_deref(),
            params.where_clause.as_deref(),
            params.order_by.as_deref(),
            params.order_descending,
            params.limit,
            args,
        )
    )
}

fn json_or_null<T: serde::Serialize>(value: Option<&T>) -> Result<SqlValue> {
    match value {
        Some(value) => Ok(SqlValue::Text(serde_json::to_string(value)?)),
        None => Ok(SqlValue::Null),
    }
}

fn text_or_null(value: Option<&String>) -> SqlValue {
    value.map_or(SqlValue::Null, |v| SqlValue::Text(v.clone()))
}

/// Objects and arrays become JSON text, booleans become 0/1
fn row_values(result: &TestResult) -> Result<Vec<SqlValue>> {
    Ok(vec![
        SqlValue::Text(serde_json::to_string(&result.identity.suite_path)?),
        SqlValue::Text(result.identity.suite_name().to_string()),
        SqlValue::Text(result.identity.browser_id.clone()),
        text_or_null(result.suite_url.as_ref()),
        SqlValue::Text(serde_json::to_string(&result.meta)?),
        SqlValue::Text(serde_json::to_string(&result.history)?),
        text_or_null(result.description.as_ref()),
        json_or_null(result.error.as_ref())?,
        text_or_null(result.skip_reason.as_ref()),
        SqlValue::Text(serde_json::to_string(&result.images_info)?),
        SqlValue::Integer(result.screenshot.is_some() as i64),
        SqlValue::Integer(result.multiple_tabs as i64),
        SqlValue::Text(result.status.to_string()),
        SqlValue::Integer(result.timestamp),
        SqlValue::Integer(result.duration as i64),
    ])
}

/// Raw database row before parsing
struct RawRow {
    suite_path: String,
    name: String,
    suite_url: Option<String>,
    meta_info: Option<String>,
    history: Option<String>,
    description: Option<String>,
    error: Option<String>,
    skip_reason: Option<String>,
    images_info: Option<String>,
    multiple_tabs: Option<i64>,
    status: String,
    timestamp: i64,
    duration: Option<i64>,
}

impl RawRow {
    fn parse(self) -> Result<TestResult> {
        let suite_path: Vec<String> = serde_json::from_str(&self.suite_path)?;
        let mut result = TestResult::new(
            TestIdentity::new(suite_path, self.name),
            self.status.parse::<ResultStatus>()?,
        );

        result.timestamp = self.timestamp;
        result.duration = self.duration.unwrap_or_default().max(0) as u64;
        result.suite_url = self.suite_url;
        result.description = self.description;
        result.skip_reason = self.skip_reason;
        result.multiple_tabs = self.multiple_tabs.unwrap_or_default() != 0;
        if let Some(meta) = self.meta_info {
            result.meta = serde_json::from_str(&meta)?;
        }
        if let Some(history) = self.history {
            result.history = serde_json::from_str(&history)?;
        }
        if let Some(error) = self.error {
            result.error = serde_json::from_str(&error)?;
        }
        if let Some(images_info) = self.images_info {
            result.images_info = serde_json::from_str(&images_info)?;
        }

        Ok(result)
    }
}
