use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use mrc_core::{CandidateRecord, ReleaseRecord, UpsertOutcome};
use mrc_storage::{ReleaseStore, StoreError};
use tracing::debug;

/// Records eligible for the deletion sweep.
#[derive(Debug, Clone, Copy)]
pub enum SweepScope<'a> {
    /// Every record except those released in `skip`, the years whose fetch failed this run.
    RunWide { skip: &'a BTreeSet<i32> },
    Years(&'a BTreeSet<i32>),
}

impl SweepScope<'_> {
    fn covers(&self, record: &ReleaseRecord) -> bool {
        let year = record.release_date.year();
        match self {
            Self::RunWide { skip } => !skip.contains(&year),
            Self::Years(years) => years.contains(&year),
        }
    }
}

/// Applies candidates to the store and removes titles that vanished.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ReleaseStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ReleaseStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(
        &self,
        candidate: &CandidateRecord,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let Some(existing) = self.store.get(&candidate.title).await? else {
            self.store
                .upsert(&ReleaseRecord::from_candidate(candidate, now))
                .await?;
            return Ok(UpsertOutcome::Inserted);
        };

        if !existing.differs_from(candidate) {
            return Ok(UpsertOutcome::Unchanged);
        }

        debug!(title = %candidate.title, "release changed");
        let updated = ReleaseRecord {
            release_date: candidate.release_date,
            description: Some(candidate.description.clone()),
            source_url: Some(candidate.source_url.clone()),
            updated_at: now.max(existing.created_at),
            ..existing
        };
        self.store.upsert(&updated).await?;
        Ok(UpsertOutcome::Updated)
    }

    /// Deletes in-scope stored keys absent from `seen`; returns the deleted keys.
    pub async fn reconcile_deletions(
        &self,
        seen: &BTreeSet<String>,
        scope: SweepScope<'_>,
    ) -> Result<BTreeSet<String>, StoreError> {
        let stale = self
            .store
            .list_all()
            .await?
            .into_iter()
            .filter(|record| scope.covers(record) && !seen.contains(&record.identity_key))
            .map(|record| record.identity_key)
            .collect::<BTreeSet<_>>();
        if stale.is_empty() {
            return Ok(stale);
        }
        self.store.delete_keys(&stale).await?;
        Ok(stale)
    }
}
