use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use icalendar::{Calendar, Component, Event, EventLike};
use mrc_core::ReleaseRecord;
use mrc_storage::{write_atomic, ReleaseStore};
use tracing::info;

pub const CALENDAR_NAME: &str = "Movie Releases";

/// Renders one all-day event per record, in the given order.
///
/// DTSTAMP comes from `updated_at`, so an unchanged store renders byte-identical output.
pub fn render_calendar(records: &[ReleaseRecord]) -> String {
    let mut calendar = Calendar::new();
    calendar.name(CALENDAR_NAME);
    for record in records {
        calendar.push(release_event(record));
    }
    calendar.to_string()
}

fn release_event(record: &ReleaseRecord) -> Event {
    let start = record.release_date;
    let mut event = Event::new();
    event
        .uid(&record.calendar_uid())
        .summary(&record.event_name())
        .starts(start)
        .ends(start.succ_opt().unwrap_or(start))
        .timestamp(record.updated_at)
        .add_property("TRANSP", "TRANSPARENT");
    if let Some(description) = record.description.as_deref().filter(|d| !d.is_empty()) {
        event.description(description);
    }
    if let Some(url) = record.source_url.as_deref().filter(|u| !u.is_empty()) {
        event.add_property("URL", url);
    }
    event.done()
}

#[derive(Debug, Clone)]
pub struct CalendarExporter {
    path: PathBuf,
}

impl CalendarExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lists the whole store and replaces the artifact atomically. Returns the event count.
    pub async fn export(&self, store: &dyn ReleaseStore) -> Result<usize> {
        let records = store.list_all().await.context("listing releases for export")?;
        let document = render_calendar(&records);
        write_atomic(&self.path, document.as_bytes())
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        info!(path = %self.path.display(), events = records.len(), "calendar exported");
        Ok(records.len())
    }
}

/// Joins folded content lines back into logical lines.
#[cfg(test)]
pub(crate) fn unfold(ics: &str) -> String {
    ics.replace("\r\n ", "").replace("\r\n\t", "")
}
