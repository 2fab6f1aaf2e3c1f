//! Applies decoded plugins to the store and keeps the run summary.

use crate::error::{DecodeError, ReconcileError};
use crate::plugin::Plugin;
use crate::store::{PluginStore, UpsertOutcome};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Running counters for one sync run. Safe to update from concurrent workers.
#[derive(Debug, Default)]
pub struct SyncSummary {
    inserted: AtomicU64,
    updated: AtomicU64,
    stale: AtomicU64,
    rejected: AtomicU64,
    out_of_window: AtomicU64,
    skipped: AtomicU64,
    duplicates: AtomicU64,
    pages: AtomicU64,
}

impl SyncSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_page(&self) {
        self.pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SummarySnapshot {
        SummarySnapshot {
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            out_of_window: self.out_of_window.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a `SyncSummary`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummarySnapshot {
    pub inserted: u64,
    pub updated: u64,
    /// Incoming entity was older than the stored one and was not written.
    pub stale: u64,
    /// Undecodable entries plus per-entity store failures.
    pub rejected: u64,
    /// Incremental runs: entities outside the requested window.
    pub out_of_window: u64,
    /// Entities outside the configured plugin id ranges.
    pub skipped: u64,
    /// Repeated `script_id`s collapsed within a page.
    pub duplicates: u64,
    pub pages: u64,
}

impl SummarySnapshot {
    pub fn applied(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl fmt::Display for SummarySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pages={} inserted={} updated={} stale={} rejected={} out_of_window={} skipped={} duplicates={}",
            self.pages,
            self.inserted,
            self.updated,
            self.stale,
            self.rejected,
            self.out_of_window,
            self.skipped,
            self.duplicates
        )
    }
}

/// Upserts plugins by `script_id` and counts what happened to each.
pub struct Reconciler {
    store: Arc<dyn PluginStore>,
    summary: SyncSummary,
    log_each: bool,
}

impl Reconciler {
    pub fn new(store: Arc<dyn PluginStore>, log_each: bool) -> Self {
        Self {
            store,
            summary: SyncSummary::new(),
            log_each,
        }
    }

    pub fn summary(&self) -> &SyncSummary {
        &self.summary
    }

    /// Apply one entity. A non-fatal error has already been counted as
    /// rejected when it is returned; a fatal one is not counted.
    pub async fn apply(&self, plugin: &Plugin) -> Result<UpsertOutcome, ReconcileError> {
        match self.store.upsert(plugin).await {
            Ok(outcome) => {
                match outcome {
                    UpsertOutcome::Inserted => {
                        self.summary.inserted.fetch_add(1, Ordering::Relaxed);
                    }
                    UpsertOutcome::Updated => {
                        self.summary.updated.fetch_add(1, Ordering::Relaxed);
                    }
                    UpsertOutcome::Stale => {
                        self.summary.stale.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            script_id = %plugin.script_id,
                            modified = ?plugin.modified_date,
                            "feed delivered an older version than the stored one, keeping stored"
                        );
                        return Ok(outcome);
                    }
                }
                if self.log_each {
                    info!(script_id = %plugin.script_id, name = %plugin.name, outcome = ?outcome, "plugin synced");
                } else {
                    debug!(script_id = %plugin.script_id, outcome = ?outcome, "plugin synced");
                }
                Ok(outcome)
            }
            Err(e) => {
                let err = ReconcileError::from_store(&plugin.script_id, e);
                if !err.is_fatal() {
                    self.summary.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(script_id = %plugin.script_id, error = %err, "plugin rejected by store");
                }
                Err(err)
            }
        }
    }

    pub fn record_rejected(&self, page: u64, error: &DecodeError) {
        self.summary.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(page, reason = error.reason(), field = ?error.field(), error = %error, "skipping undecodable entry");
    }

    pub fn record_out_of_window(&self, plugin: &Plugin) {
        self.summary.out_of_window.fetch_add(1, Ordering::Relaxed);
        warn!(
            script_id = %plugin.script_id,
            modified = ?plugin.modified_date,
            "feed returned a plugin outside the requested window, dropping"
        );
    }

    pub fn record_skipped(&self, plugin: &Plugin) {
        self.summary.skipped.fetch_add(1, Ordering::Relaxed);
        debug!(script_id = %plugin.script_id, "plugin id outside configured ranges, skipping");
    }

    pub fn record_duplicate(&self, script_id: &str) {
        self.summary.duplicates.fetch_add(1, Ordering::Relaxed);
        debug!(script_id, "duplicate plugin within page");
    }
}
