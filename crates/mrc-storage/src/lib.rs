//! HTTP fetch, change detection, side-car run state and the release store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mrc_core::{sha256_hex, ReleaseRecord};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mrc-storage";

/// Write bytes through a sibling temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot GET client. Failures are reported, never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(url).await?.text())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDecision {
    pub reparse: bool,
    pub fingerprint: String,
}

/// Content-addressed gate that skips pages identical to the previous run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn fingerprint(raw: &[u8]) -> String {
        sha256_hex(raw)
    }

    pub fn should_reparse(year_key: &str, raw: &str, prior: Option<&str>) -> ChangeDecision {
        let fingerprint = Self::fingerprint(raw.as_bytes());
        let reparse = prior != Some(fingerprint.as_str());
        debug!(year_key, reparse, %fingerprint, "change detection");
        ChangeDecision {
            reparse,
            fingerprint,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("reading state file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing state file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-year fingerprints and record counts carried between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    pub fingerprints: BTreeMap<String, String>,
    pub counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct StateFiles {
    dir: PathBuf,
}

impl StateFiles {
    pub const FINGERPRINTS_FILE: &'static str = "page_hashes.json";
    pub const COUNTS_FILE: &'static str = "scrape_stats.json";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn fingerprints_path(&self) -> PathBuf {
        self.dir.join(Self::FINGERPRINTS_FILE)
    }

    pub fn counts_path(&self) -> PathBuf {
        self.dir.join(Self::COUNTS_FILE)
    }

    /// Missing files load as empty maps; unreadable or malformed ones are errors.
    pub async fn load(&self) -> Result<RunState, StateFileError> {
        Ok(RunState {
            fingerprints: load_json_or_default(&self.fingerprints_path()).await?,
            counts: load_json_or_default(&self.counts_path()).await?,
        })
    }

    pub async fn save(&self, state: &RunState) -> Result<(), StateFileError> {
        save_json(&self.fingerprints_path(), &state.fingerprints).await?;
        save_json(&self.counts_path(), &state.counts).await
    }
}

async fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StateFileError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StateFileError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(StateFileError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateFileError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StateFileError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
        .await
        .map_err(|source| StateFileError::Write {
            path: path.to_path_buf(),
            source,
        })
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store file {} is corrupt: {message}", .path.display())]
    Corrupt { path: PathBuf, message: String },
}

/// Narrow repository over persisted release records.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn get(&self, identity_key: &str) -> Result<Option<ReleaseRecord>, StoreError>;

    /// Insert or fully replace the row for `record.identity_key`.
    async fn upsert(&self, record: &ReleaseRecord) -> Result<(), StoreError>;

    async fn delete_keys(&self, keys: &BTreeSet<String>) -> Result<usize, StoreError>;

    /// All rows, ordered by release date then identity key.
    async fn list_all(&self) -> Result<Vec<ReleaseRecord>, StoreError>;
}

fn ordered(rows: &BTreeMap<String, ReleaseRecord>) -> Vec<ReleaseRecord> {
    let mut out = rows.values().cloned().collect::<Vec<_>>();
    out.sort_by(|a, b| {
        a.release_date
            .cmp(&b.release_date)
            .then_with(|| a.identity_key.cmp(&b.identity_key))
    });
    out
}

#[derive(Debug, Default)]
pub struct MemoryReleaseStore {
    rows: Mutex<BTreeMap<String, ReleaseRecord>>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ReleaseRecord>) -> Self {
        let rows = records
            .into_iter()
            .map(|r| (r.identity_key.clone(), r))
            .collect();
        Self {
            rows: Mutex::new(rows),
        }
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn get(&self, identity_key: &str) -> Result<Option<ReleaseRecord>, StoreError> {
        Ok(self.rows.lock().await.get(identity_key).cloned())
    }

    async fn upsert(&self, record: &ReleaseRecord) -> Result<(), StoreError> {
        self.rows
            .lock()
            .await
            .insert(record.identity_key.clone(), record.clone());
        Ok(())
    }

    async fn delete_keys(&self, keys: &BTreeSet<String>) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().await;
        Ok(keys.iter().filter(|k| rows.remove(*k).is_some()).count())
    }

    async fn list_all(&self) -> Result<Vec<ReleaseRecord>, StoreError> {
        Ok(ordered(&*self.rows.lock().await))
    }
}

/// Whole-table JSON snapshot, rewritten atomically on every mutation.
#[derive(Debug)]
pub struct JsonFileReleaseStore {
    path: PathBuf,
    rows: Mutex<BTreeMap<String, ReleaseRecord>>,
}

impl JsonFileReleaseStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let rows = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                message: e.to_string(),
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(StoreError::Io(err)),
        };
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, rows: &BTreeMap<String, ReleaseRecord>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(rows)?;
        write_atomic(&self.path, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ReleaseStore for JsonFileReleaseStore {
    async fn get(&self, identity_key: &str) -> Result<Option<ReleaseRecord>, StoreError> {
        Ok(self.rows.lock().await.get(identity_key).cloned())
    }

    async fn upsert(&self, record: &ReleaseRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let mut next = rows.clone();
        next.insert(record.identity_key.clone(), record.clone());
        self.persist(&next).await?;
        *rows = next;
        Ok(())
    }

    async fn delete_keys(&self, keys: &BTreeSet<String>) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut next = rows.clone();
        let removed = keys.iter().filter(|k| next.remove(*k).is_some()).count();
        if removed > 0 {
            self.persist(&next).await?;
            *rows = next;
        }
        Ok(removed)
    }

    async fn list_all(&self) -> Result<Vec<ReleaseRecord>, StoreError> {
        Ok(ordered(&*self.rows.lock().await))
    }
}

#[derive(Debug, Clone)]
pub struct PgReleaseStore {
    pool: PgPool,
}

impl PgReleaseStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS releases (
                identity_key TEXT PRIMARY KEY,
                release_date DATE NOT NULL,
                description  TEXT NULL,
                source_url   TEXT NULL,
                created_at   TIMESTAMPTZ NOT NULL,
                updated_at   TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<ReleaseRecord, StoreError> {
        Ok(ReleaseRecord {
            identity_key: row.try_get("identity_key")?,
            release_date: row.try_get::<NaiveDate, _>("release_date")?,
            description: row.try_get("description")?,
            source_url: row.try_get("source_url")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

#[async_trait]
impl ReleaseStore for PgReleaseStore {
    async fn get(&self, identity_key: &str) -> Result<Option<ReleaseRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT identity_key, release_date, description, source_url, created_at, updated_at
              FROM releases
             WHERE identity_key = $1
            "#,
        )
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn upsert(&self, record: &ReleaseRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO releases (identity_key, release_date, description, source_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (identity_key) DO UPDATE
               SET release_date = EXCLUDED.release_date,
                   description  = EXCLUDED.description,
                   source_url   = EXCLUDED.source_url,
                   updated_at   = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.identity_key)
        .bind(record.release_date)
        .bind(&record.description)
        .bind(&record.source_url)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_keys(&self, keys: &BTreeSet<String>) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys = keys.iter().cloned().collect::<Vec<_>>();
        let result = sqlx::query("DELETE FROM releases WHERE identity_key = ANY($1)")
            .bind(keys)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_all(&self) -> Result<Vec<ReleaseRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT identity_key, release_date, description, source_url, created_at, updated_at
              FROM releases
             ORDER BY release_date, identity_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::record_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(key: &str, month: u32, day: u32) -> ReleaseRecord {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        ReleaseRecord {
            identity_key: key.to_string(),
            release_date: NaiveDate::from_ymd_opt(2025, month, day).unwrap(),
            description: Some(format!("{key} synopsis")),
            source_url: Some(format!("https://www.firstshowing.net/{key}")),
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn fingerprint_hashing_is_stable() {
        assert_eq!(
            ChangeDetector::fingerprint(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn change_detector_skips_only_identical_content() {
        let first = ChangeDetector::should_reparse("2025", "<html>a</html>", None);
        assert!(first.reparse);

        let same = ChangeDetector::should_reparse("2025", "<html>a</html>", Some(&first.fingerprint));
        assert!(!same.reparse);
        assert_eq!(same.fingerprint, first.fingerprint);

        let changed = ChangeDetector::should_reparse("2025", "<html>b</html>", Some(&first.fingerprint));
        assert!(changed.reparse);
        assert_ne!(changed.fingerprint, first.fingerprint);
    }

    #[tokio::test]
    async fn missing_state_files_load_as_empty() {
        let dir = tempdir().expect("tempdir");
        let state = StateFiles::new(dir.path().join("never-created")).load().await.unwrap();
        assert_eq!(state, RunState::default());
    }

    #[tokio::test]
    async fn state_files_persist_between_loads() {
        let dir = tempdir().expect("tempdir");
        let files = StateFiles::new(dir.path());
        let mut state = RunState::default();
        state.fingerprints.insert("2025".into(), "abc".into());
        state.counts.insert("2025".into(), 42);
        files.save(&state).await.unwrap();

        assert_eq!(files.load().await.unwrap(), state);
        let raw = std::fs::read_to_string(files.counts_path()).unwrap();
        assert!(raw.contains("\"2025\": 42"));
    }

    #[tokio::test]
    async fn corrupt_state_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let files = StateFiles::new(dir.path());
        std::fs::write(files.fingerprints_path(), "{not json").unwrap();
        let err = files.load().await.unwrap_err();
        assert!(matches!(err, StateFileError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn atomic_write_replaces_without_leaving_temp_files() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("calendar.ics");
        write_atomic(&target, b"first").await.unwrap();
        write_atomic(&target, b"second").await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        let leftovers = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn memory_store_lists_in_date_order_and_deletes_by_key() {
        let store = MemoryReleaseStore::with_records([
            record("Zeta", 1, 10),
            record("Alpha", 3, 1),
            record("Beta", 1, 10),
        ]);
        let keys = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.identity_key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["Beta", "Zeta", "Alpha"]);

        let doomed = BTreeSet::from(["Zeta".to_string(), "Missing".to_string()]);
        assert_eq!(store.delete_keys(&doomed).await.unwrap(), 1);
        assert!(store.get("Zeta").await.unwrap().is_none());
        assert!(store.get("Alpha").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn json_file_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("releases.json");

        let store = JsonFileReleaseStore::open(&path).await.unwrap();
        assert_eq!(store.path(), path.as_path());
        store.upsert(&record("Sinners", 4, 18)).await.unwrap();
        store.upsert(&record("Wicked", 11, 21)).await.unwrap();
        store
            .delete_keys(&BTreeSet::from(["Wicked".to_string()]))
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileReleaseStore::open(&path).await.unwrap();
        let rows = reopened.list_all().await.unwrap();
        assert_eq!(rows, vec![record("Sinners", 4, 18)]);
    }

    #[tokio::test]
    async fn corrupt_json_file_store_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("releases.json");
        std::fs::write(&path, "[1, 2").unwrap();
        let err = JsonFileReleaseStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn fetcher_returns_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/schedule2025"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>schedule</html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let url = format!("{}/schedule2025", server.uri());
        let resp = fetcher.fetch_bytes(&url).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.final_url, url);
        assert_eq!(resp.text(), "<html>schedule</html>");

        let body = fetcher.fetch_text(&url).await.unwrap();
        assert_eq!(body, "<html>schedule</html>");
    }

    #[tokio::test]
    async fn fetcher_reports_non_success_status_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/schedule2025"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher
            .fetch_text(&format!("{}/schedule2025", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }
}
