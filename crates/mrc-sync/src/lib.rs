//! Sync pipeline: fetch, change gate, parse, reconcile, anomaly check and calendar export.

mod alert;
mod anomaly;
mod calendar;
mod config;
mod reconcile;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mrc_adapters::{
    listing_description, parse_listing_html, DescriptionEnricher, HttpListingFetcher,
    ListingFetcher, ListingMarkup, ListingSelectors, NoopEnricher, TmdbEnricher,
};
use mrc_core::{year_key, AlertSignal, UpsertOutcome};
use mrc_storage::{
    ChangeDetector, HttpClientConfig, HttpFetcher, JsonFileReleaseStore, PgReleaseStore,
    ReleaseStore, RunState, StateFiles,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use alert::{
    alert_transport_for, AlertError, AlertMessage, AlertTransport, NoopAlertTransport,
    PushoverTransport,
};
pub use anomaly::check_anomaly;
pub use calendar::{render_calendar, CalendarExporter, CALENDAR_NAME};
pub use config::{
    ConfigFile, DeletionScope, PushoverConfig, StoreConfig, SyncConfig, DEFAULT_ALERT_TITLE,
    DEFAULT_CONFIG_PATH, DEFAULT_PUSHOVER_ENDPOINT, DEFAULT_SYNC_CRON,
};
pub use reconcile::{Reconciler, SweepScope};

pub const CRATE_NAME: &str = "mrc-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum YearStatus {
    Reparsed,
    Unchanged,
    FetchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearReport {
    pub year: i32,
    pub status: YearStatus,
    pub parsed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed_upserts: usize,
}

impl YearReport {
    fn new(year: i32, status: YearStatus) -> Self {
        Self {
            year,
            status,
            parsed: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            failed_upserts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub years: Vec<YearReport>,
    pub deleted: Vec<String>,
    pub alerts: Vec<AlertSignal>,
    pub calendar_path: String,
    pub exported_events: usize,
}

impl SyncRunSummary {
    pub fn year(&self, year: i32) -> Option<&YearReport> {
        self.years.iter().find(|r| r.year == year)
    }
}

pub async fn open_release_store(config: &StoreConfig) -> Result<Arc<dyn ReleaseStore>> {
    match config {
        StoreConfig::File(path) => {
            let store = JsonFileReleaseStore::open(path.clone())
                .await
                .with_context(|| format!("opening release store {}", path.display()))?;
            info!(path = %store.path().display(), "using file release store");
            Ok(Arc::new(store))
        }
        StoreConfig::Postgres { database_url } => {
            let store = PgReleaseStore::connect(database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("migrating releases table")?;
            Ok(Arc::new(store))
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn ReleaseStore>,
    state_files: StateFiles,
    fetcher: Arc<dyn ListingFetcher>,
    enricher: Arc<dyn DescriptionEnricher>,
    alerts: Arc<dyn AlertTransport>,
    selectors: ListingSelectors,
    exporter: CalendarExporter,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn ReleaseStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let client = http.client().clone();

        let enricher: Arc<dyn DescriptionEnricher> = match &config.tmdb {
            Some(tmdb) => Arc::new(TmdbEnricher::new(client.clone(), tmdb.clone())),
            None => Arc::new(NoopEnricher),
        };
        let selectors = ListingMarkup::default()
            .compile()
            .context("compiling listing selectors")?;

        Ok(Self {
            state_files: StateFiles::new(config.state_dir.clone()),
            fetcher: Arc::new(HttpListingFetcher::new(http, config.listing_url_template.clone())),
            enricher,
            alerts: alert_transport_for(&config.pushover, client),
            selectors,
            exporter: CalendarExporter::new(config.calendar_path.clone()),
            run_lock: Mutex::new(()),
            store,
            config,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ListingFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn DescriptionEnricher>) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertTransport>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ReleaseStore> {
        Arc::clone(&self.store)
    }

    /// Waits for any in-flight run, then performs one full run.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        self.run_exclusive().await
    }

    /// Runs only if no other run holds the pipeline; `None` means the run was skipped.
    pub async fn try_run_once(&self) -> Option<Result<SyncRunSummary>> {
        let _guard = self.run_lock.try_lock().ok()?;
        Some(self.run_exclusive().await)
    }

    async fn run_exclusive(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let prior = self
            .state_files
            .load()
            .await
            .context("loading run state")?;
        let mut next = prior.clone();
        let reconciler = Reconciler::new(Arc::clone(&self.store));

        let mut seen = BTreeSet::new();
        let mut reparsed = BTreeSet::new();
        let mut failed = BTreeSet::new();
        let mut years = Vec::with_capacity(self.config.years.len());
        for &year in &self.config.years {
            let report = self
                .sync_year(year, &prior, &mut next, &mut seen, &reconciler, started_at)
                .await;
            match report.status {
                YearStatus::Reparsed => {
                    reparsed.insert(year);
                }
                YearStatus::FetchFailed => {
                    failed.insert(year);
                }
                YearStatus::Unchanged => {}
            }
            years.push(report);
        }

        let deleted = if reparsed.is_empty() {
            info!("no listing changed; skipping deletion sweep");
            BTreeSet::new()
        } else {
            let scope = match self.config.deletion_scope {
                DeletionScope::RunWide => SweepScope::RunWide { skip: &failed },
                DeletionScope::ReparsedYears => SweepScope::Years(&reparsed),
            };
            match reconciler.reconcile_deletions(&seen, scope).await {
                Ok(deleted) => {
                    for title in &deleted {
                        info!(%title, "release removed");
                    }
                    deleted
                }
                Err(err) => {
                    error!(error = %err, "deletion sweep failed");
                    BTreeSet::new()
                }
            }
        };

        let mut alerts = Vec::new();
        for report in years.iter().filter(|r| r.status == YearStatus::Reparsed) {
            let key = year_key(report.year);
            let previous = prior.counts.get(&key).copied().unwrap_or(0);
            if let Some(signal) = check_anomaly(&key, previous, report.parsed) {
                warn!(year = report.year, previous, current = report.parsed, "{}", signal.message);
                self.deliver_alert(&signal).await;
                alerts.push(signal);
            }
        }

        // export even when the state write fails; the error surfaces after
        let saved = self.state_files.save(&next).await.context("writing run state");
        let exported_events = self.exporter.export(self.store.as_ref()).await?;
        saved?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            years,
            deleted: deleted.into_iter().collect(),
            alerts,
            calendar_path: self.exporter.path().display().to_string(),
            exported_events,
        };
        info!(
            reparsed = reparsed.len(),
            deleted = summary.deleted.len(),
            alerts = summary.alerts.len(),
            events = exported_events,
            "sync run complete"
        );
        Ok(summary)
    }

    async fn sync_year(
        &self,
        year: i32,
        prior: &RunState,
        next: &mut RunState,
        seen: &mut BTreeSet<String>,
        reconciler: &Reconciler,
        now: DateTime<Utc>,
    ) -> YearReport {
        let key = year_key(year);
        let raw = match self.fetcher.fetch_listing(year).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(year, url = %self.fetcher.listing_url(year), error = %err, "listing fetch failed");
                return YearReport::new(year, YearStatus::FetchFailed);
            }
        };

        let decision = ChangeDetector::should_reparse(
            &key,
            &raw,
            prior.fingerprints.get(&key).map(String::as_str),
        );
        next.fingerprints.insert(key.clone(), decision.fingerprint);
        if !decision.reparse {
            info!(year, "listing unchanged; skipping parse");
            return YearReport::new(year, YearStatus::Unchanged);
        }

        let candidates = parse_listing_html(&raw, year, &self.selectors);
        info!(year, candidates = candidates.len(), "listing parsed");
        next.counts.insert(key, candidates.len());

        let mut report = YearReport::new(year, YearStatus::Reparsed);
        report.parsed = candidates.len();
        for mut candidate in candidates {
            let enrichment = self.enricher.describe(&candidate.title, year).await;
            candidate.description = listing_description(&enrichment, &candidate.source_url);
            seen.insert(candidate.title.clone());

            match reconciler.upsert(&candidate, now).await {
                Ok(UpsertOutcome::Inserted) => {
                    info!(title = %candidate.title, date = %candidate.release_date, "release added");
                    report.inserted += 1;
                }
                Ok(UpsertOutcome::Updated) => {
                    info!(title = %candidate.title, date = %candidate.release_date, "release updated");
                    report.updated += 1;
                }
                Ok(UpsertOutcome::Unchanged) => report.unchanged += 1,
                Err(err) => {
                    error!(title = %candidate.title, error = %err, "upsert failed");
                    report.failed_upserts += 1;
                }
            }
        }
        report
    }

    async fn deliver_alert(&self, signal: &AlertSignal) {
        let message = AlertMessage::for_signal(signal, &self.config.pushover);
        if let Err(err) = self.alerts.deliver(&message).await {
            warn!(year_key = %signal.year_key, error = %err, "alert delivery failed");
        }
    }
}

/// Cron job that triggers a run per tick, skipping ticks that overlap a run in progress.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.try_run_once().await {
                None => warn!("previous sync still running; skipping tick"),
                Some(Ok(summary)) => {
                    info!(run_id = %summary.run_id, events = summary.exported_events, "scheduled sync finished")
                }
                Some(Err(err)) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
