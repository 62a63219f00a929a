//! Read-only HTTP surface over the exported calendar and the release store.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use mrc_core::ReleaseRecord;
use mrc_storage::ReleaseStore;
use mrc_sync::{SyncConfig, CALENDAR_NAME};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "mrc-web";

#[derive(Clone)]
pub struct AppState {
    pub calendar_path: PathBuf,
    pub store: Arc<dyn ReleaseStore>,
}

impl AppState {
    pub fn new(calendar_path: impl Into<PathBuf>, store: Arc<dyn ReleaseStore>) -> Self {
        Self {
            calendar_path: calendar_path.into(),
            store,
        }
    }
}

/// One entry of `/calendar.json`, shaped for client-side calendar widgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarEntry {
    pub title: String,
    pub start: String,
    #[serde(rename = "allDay")]
    pub all_day: bool,
    pub url: Option<String>,
    pub description: Option<String>,
    pub uid: String,
}

impl From<&ReleaseRecord> for CalendarEntry {
    fn from(record: &ReleaseRecord) -> Self {
        Self {
            title: record.event_name(),
            start: record.release_date.format("%Y-%m-%d").to_string(),
            all_day: true,
            url: record.source_url.clone(),
            description: record.description.clone(),
            uid: record.calendar_uid(),
        }
    }
}

#[derive(Debug, Clone)]
struct ReleaseRow {
    date: String,
    title: String,
    url: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    calendar_name: &'static str,
    total: usize,
    upcoming: Vec<ReleaseRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/calendar.ics", get(calendar_ics_handler))
        .route("/calendar.json", get(calendar_json_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig, store: Arc<dyn ReleaseStore>) -> anyhow::Result<()> {
    let state = AppState::new(config.calendar_path.clone(), store);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving calendar");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_all().await {
        Ok(records) => {
            let today = Utc::now().date_naive();
            render_html(IndexTemplate {
                calendar_name: CALENDAR_NAME,
                total: records.len(),
                upcoming: upcoming_rows(&records, today),
            })
        }
        Err(err) => server_error(err.into()),
    }
}

fn upcoming_rows(records: &[ReleaseRecord], today: NaiveDate) -> Vec<ReleaseRow> {
    records
        .iter()
        .filter(|r| r.release_date >= today)
        .map(|r| ReleaseRow {
            date: r.release_date.format("%a %b %-d, %Y").to_string(),
            title: r.identity_key.clone(),
            url: r.source_url.clone().unwrap_or_default(),
        })
        .collect()
}

async fn calendar_ics_handler(State(state): State<Arc<AppState>>) -> Response {
    match tokio::fs::read(&state.calendar_path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "text/calendar; charset=utf-8")],
            bytes,
        )
            .into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "calendar not exported yet").into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn calendar_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_all().await {
        Ok(records) => Json(records.iter().map(CalendarEntry::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err}")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{Duration, TimeZone};
    use http_body_util::BodyExt;
    use mrc_storage::MemoryReleaseStore;
    use tower::ServiceExt;

    fn record(title: &str, release_date: NaiveDate) -> ReleaseRecord {
        let stamp = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        ReleaseRecord {
            identity_key: title.into(),
            release_date,
            description: Some(format!("Trailer: https://t/{title}")),
            source_url: Some(format!("https://t/{title}")),
            created_at: stamp,
            updated_at: stamp,
        }
    }

    fn state(dir: &tempfile::TempDir, records: Vec<ReleaseRecord>) -> AppState {
        AppState::new(
            dir.path().join("calendar.ics"),
            Arc::new(MemoryReleaseStore::with_records(records)),
        )
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn calendar_ics_is_404_until_exported() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(&dir, vec![]));
        let (status, _, _) = get(app.clone(), "/calendar.ics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        std::fs::write(dir.path().join("calendar.ics"), "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n").unwrap();
        let (status, content_type, body) = get(app, "/calendar.ics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/calendar; charset=utf-8"));
        assert!(body.starts_with("BEGIN:VCALENDAR"));
    }

    #[tokio::test]
    async fn calendar_json_lists_store_entries() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 4, 18).unwrap();
        let app = app(state(&dir, vec![record("Sinners", date)]));

        let (status, content_type, body) = get(app, "/calendar.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        let entries: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(
            entries,
            serde_json::json!([{
                "title": "🍿 Sinners",
                "start": "2025-04-18",
                "allDay": true,
                "url": "https://t/Sinners",
                "description": "Trailer: https://t/Sinners",
                "uid": mrc_core::calendar_uid("Sinners"),
            }])
        );
    }

    #[tokio::test]
    async fn index_lists_upcoming_releases_only() {
        let dir = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive();
        let app = app(state(
            &dir,
            vec![
                record("Long Gone", today - Duration::days(30)),
                record("Coming <Soon>", today + Duration::days(3)),
            ],
        ));

        let (status, _, body) = get(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(CALENDAR_NAME));
        assert!(body.contains("Coming &lt;Soon&gt;"));
        assert!(!body.contains("Long Gone"));
        assert!(body.contains("1 upcoming of 2 tracked releases"));
    }

    #[test]
    fn upcoming_rows_keep_store_order() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let rows = upcoming_rows(
            &[
                record("Earlier", NaiveDate::from_ymd_opt(2025, 5, 31).unwrap()),
                record("Opening Day", today),
                record("Later", NaiveDate::from_ymd_opt(2025, 7, 4).unwrap()),
            ],
            today,
        );
        let titles = rows.iter().map(|r| r.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Opening Day", "Later"]);
        assert_eq!(rows[0].date, "Sun Jun 1, 2025");
    }
}
