//! Sync engine: drives the paginator, decodes and filters each page, and
//! reconciles it into the store.
//!
//! One producer task walks the feed and hands pages over a bounded channel,
//! so the next page is in flight while the current one is being applied.
//! Within a page, upserts run on a bounded pool; pages are applied strictly
//! one after another.

use crate::config::Config;
use crate::decode::decode;
use crate::error::{FetchError, SyncError, UsageError};
use crate::feed::paginator::{CancelFlag, Paginator};
use crate::feed::retry::RetryPolicy;
use crate::feed::types::{IdRanges, Page, SyncCursor, SyncMode};
use crate::feed::FeedSource;
use crate::plugin::Plugin;
use crate::reconcile::{Reconciler, SummarySnapshot};
use crate::store::PluginStore;
use chrono::{NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Process exit status for a run that completed without rejections.
pub const EXIT_OK: u8 = 0;
/// The run failed before completion.
pub const EXIT_FAILED: u8 = 1;
/// The invocation was invalid; nothing was fetched or written.
pub const EXIT_USAGE: u8 = 2;
/// The run completed but some entities were rejected.
pub const EXIT_REJECTIONS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub page_size: u32,
    pub workers: usize,
    pub prefetch_pages: usize,
    pub retry: RetryPolicy,
    pub id_ranges: IdRanges,
    pub max_rejections: Option<u64>,
    pub log_each_plugin: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            workers: 4,
            prefetch_pages: 2,
            retry: RetryPolicy::default(),
            id_ranges: IdRanges::default(),
            max_rejections: None,
            log_each_plugin: false,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.feed.page_size,
            workers: config.sync.workers,
            prefetch_pages: config.sync.prefetch_pages,
            retry: config.retry.policy(),
            id_ranges: config.feed.id_ranges(),
            max_rejections: config.sync.max_rejections,
            log_each_plugin: config.sync.log_each_plugin,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub state: SyncState,
    pub summary: SummarySnapshot,
    /// Position just past the last page consumed.
    pub cursor: SyncCursor,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn exit_code(&self) -> u8 {
        if self.summary.rejected > 0 {
            EXIT_REJECTIONS
        } else {
            EXIT_OK
        }
    }
}

/// A failed run: the terminal error, what had been done before it, and where
/// a later run can pick up.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SyncFailure {
    pub error: SyncError,
    pub summary: SummarySnapshot,
    /// `None` when the run never started.
    pub resume_from: Option<SyncCursor>,
}

impl SyncFailure {
    fn before_start(error: SyncError) -> Self {
        Self {
            error,
            summary: SummarySnapshot::default(),
            resume_from: None,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.error {
            SyncError::Usage(_) => EXIT_USAGE,
            _ => EXIT_FAILED,
        }
    }
}

/// An incremental lower bound may be today but not later.
pub fn check_since(since: NaiveDate) -> Result<(), UsageError> {
    let today = Utc::now().date_naive();
    if since > today {
        return Err(UsageError::FutureSinceDate { since, today });
    }
    Ok(())
}

/// Where a pipeline stopped early, and why.
type Abort = (SyncError, SyncCursor);

pub struct SyncEngine {
    source: Arc<dyn FeedSource>,
    store: Arc<dyn PluginStore>,
    settings: EngineSettings,
    state: Mutex<SyncState>,
    cancel: CancelFlag,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn FeedSource>,
        store: Arc<dyn PluginStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            state: Mutex::new(SyncState::Idle),
            cancel: CancelFlag::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flag that stops the current run at the next page or batch boundary.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn full_sync(&self) -> Result<SyncReport, SyncFailure> {
        self.sync_from(SyncCursor::full(self.settings.page_size)).await
    }

    /// Sync plugins modified on or after `since`.
    pub async fn incremental_sync(&self, since: NaiveDate) -> Result<SyncReport, SyncFailure> {
        check_since(since).map_err(|e| SyncFailure::before_start(e.into()))?;
        self.sync_from(SyncCursor::incremental(self.settings.page_size, since))
            .await
    }

    /// Incremental sync from the latest modification date already stored.
    pub async fn incremental_since_watermark(&self) -> Result<SyncReport, SyncFailure> {
        let watermark = self.store.watermark().await.map_err(|e| {
            SyncFailure::before_start(SyncError::Internal(format!("reading store watermark: {}", e)))
        })?;
        match watermark {
            Some(since) => {
                info!(%since, "resuming from store watermark");
                self.incremental_sync(since).await
            }
            None => Err(SyncFailure::before_start(UsageError::NoWatermark.into())),
        }
    }

    /// Run (or resume) a sync starting at `cursor`.
    pub async fn sync_from(&self, cursor: SyncCursor) -> Result<SyncReport, SyncFailure> {
        self.begin()?;
        let started = Instant::now();
        let mode = cursor.mode();
        info!(mode = %mode, offset = cursor.offset, since = ?cursor.since, "sync started");

        let reconciler = Reconciler::new(self.store.clone(), self.settings.log_each_plugin);
        let outcome = self.pipeline(cursor, &reconciler).await;
        let summary = reconciler.summary().snapshot();
        self.cancel.reset();

        match outcome {
            Ok(end) => {
                self.set_state(SyncState::Completed);
                let elapsed = started.elapsed();
                info!(
                    mode = %mode,
                    pages = summary.pages,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    stale = summary.stale,
                    rejected = summary.rejected,
                    out_of_window = summary.out_of_window,
                    skipped = summary.skipped,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "sync completed"
                );
                Ok(SyncReport {
                    mode,
                    state: SyncState::Completed,
                    summary,
                    cursor: end,
                    elapsed,
                })
            }
            Err((err, resume_from)) => {
                self.set_state(SyncState::Failed);
                error!(
                    mode = %mode,
                    error = %err,
                    resume_offset = resume_from.offset,
                    resume_page = resume_from.page_index,
                    applied = summary.applied(),
                    rejected = summary.rejected,
                    "sync failed"
                );
                Err(SyncFailure {
                    error: err,
                    summary,
                    resume_from: Some(resume_from),
                })
            }
        }
    }

    fn begin(&self) -> Result<(), SyncFailure> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == SyncState::Running {
            return Err(SyncFailure::before_start(SyncError::AlreadyRunning));
        }
        *state = SyncState::Running;
        Ok(())
    }

    fn set_state(&self, next: SyncState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    async fn pipeline(&self, cursor: SyncCursor, reconciler: &Reconciler) -> Result<SyncCursor, Abort> {
        let (tx, mut rx) = mpsc::channel::<Result<Page, (FetchError, SyncCursor)>>(
            self.settings.prefetch_pages.max(1),
        );
        let mut paginator = Paginator::new(
            self.source.clone(),
            cursor.clone(),
            self.settings.retry.clone(),
            self.cancel.clone(),
        );
        let producer = tokio::spawn(async move {
            loop {
                match paginator.next_page().await {
                    Ok(Some(page)) => {
                        if tx.send(Ok(page)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let at = paginator.cursor().clone();
                        let _ = tx.send(Err((e, at))).await;
                        break;
                    }
                }
            }
        });

        let mut end = cursor.clone();
        let abort = loop {
            let Some(message) = rx.recv().await else {
                break None;
            };
            let page = match message {
                Ok(page) => page,
                Err((FetchError::Cancelled, at)) => break Some((SyncError::Cancelled, at)),
                Err((e, at)) => break Some((SyncError::Fetch(e), at)),
            };

            let page_cursor = cursor.at(page.offset, page.index);
            let received = page.entries.len();
            if let Err(e) = self.reconcile_page(page, &cursor, reconciler).await {
                break Some((e, page_cursor));
            }
            if let Some(limit) = self.settings.max_rejections {
                let rejected = reconciler.summary().rejected();
                if rejected > limit {
                    break Some((SyncError::TooManyRejections { rejected, limit }, page_cursor));
                }
            }
            end = page_cursor;
            end.advance(received);
        };

        // Unblock a producer waiting on a full channel before joining it.
        drop(rx);
        match abort {
            Some((err, at)) => {
                if matches!(err, SyncError::Cancelled) {
                    let _ = producer.await;
                } else {
                    producer.abort();
                }
                Err((err, at))
            }
            None => match producer.await {
                Ok(()) => Ok(end),
                Err(e) => Err((SyncError::Internal(format!("page producer failed: {}", e)), end)),
            },
        }
    }

    async fn reconcile_page(
        &self,
        page: Page,
        cursor: &SyncCursor,
        reconciler: &Reconciler,
    ) -> Result<(), SyncError> {
        reconciler.summary().record_page();
        let batch = self.prepare_batch(&page, cursor, reconciler);

        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // After a fatal store error no new upsert starts, but the ones already
        // running finish so the summary matches what the store holds.
        let halted = AtomicBool::new(false);
        let mut results = stream::iter(batch.iter())
            .map(|plugin| {
                let halted = &halted;
                async move {
                    if halted.load(Ordering::Acquire) {
                        return None;
                    }
                    Some(reconciler.apply(plugin).await)
                }
            })
            .buffer_unordered(self.settings.workers.max(1));
        let mut fatal = None;
        while let Some(result) = results.next().await {
            if let Some(Err(e)) = result {
                if e.is_fatal() && fatal.is_none() {
                    halted.store(true, Ordering::Release);
                    fatal = Some(e);
                }
            }
        }
        match fatal {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Decode, window-check, range-filter and dedupe one page. Keys in the
    /// returned batch are unique; on repeats the newest `modified_date` wins
    /// and first-seen order is kept.
    fn prepare_batch(&self, page: &Page, cursor: &SyncCursor, reconciler: &Reconciler) -> Vec<Plugin> {
        let mut batch: Vec<Plugin> = Vec::with_capacity(page.entries.len());
        let mut seen: HashMap<String, usize> = HashMap::new();

        for raw in &page.entries {
            let plugin = match decode(raw) {
                Ok(p) => p,
                Err(e) => {
                    reconciler.record_rejected(page.index, &e);
                    continue;
                }
            };
            if !cursor.admits(plugin.modified_date) {
                reconciler.record_out_of_window(&plugin);
                continue;
            }
            if !self.settings.id_ranges.admits(&plugin.script_id) {
                reconciler.record_skipped(&plugin);
                continue;
            }
            match seen.get(&plugin.script_id) {
                Some(&idx) => {
                    reconciler.record_duplicate(&plugin.script_id);
                    if plugin.supersedes(batch[idx].modified_date) {
                        batch[idx] = plugin;
                    }
                }
                None => {
                    seen.insert(plugin.script_id.clone(), batch.len());
                    batch.push(plugin);
                }
            }
        }

        if batch.is_empty() && !page.entries.is_empty() {
            warn!(page = page.index, entries = page.entries.len(), "no applicable plugins in page");
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::feed::types::{FeedPage, PageRequest, RawEntry};
    use crate::store::{MemoryStore, UpsertOutcome};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct Pages(Mutex<VecDeque<Vec<RawEntry>>>);

    impl Pages {
        fn new(pages: Vec<Vec<RawEntry>>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(pages.into())))
        }
    }

    #[async_trait]
    impl FeedSource for Pages {
        async fn fetch_page(&self, _request: &PageRequest) -> Result<FeedPage, FetchError> {
            let entries = self.0.lock().unwrap().pop_front().unwrap_or_default();
            Ok(FeedPage { entries, end_of_feed: false })
        }
    }

    fn entry(id: &str, modified: &str) -> RawEntry {
        RawEntry::json(format!(
            r#"{{"script_id":"{}","script_name":"plugin {}","plugin_modification_date":"{}"}}"#,
            id, id, modified
        ))
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            page_size: 2,
            retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)).without_jitter(),
            ..EngineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_duplicates_in_page_keep_newest() {
        let source = Pages::new(vec![vec![
            entry("1", "2024-01-01"),
            entry("2", "2024-01-01"),
            entry("1", "2024-03-01"),
            entry("1", "2024-02-01"),
        ]]);
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(source, store.clone(), settings());

        let report = engine.full_sync().await.unwrap();
        assert_eq!(report.summary.inserted, 2);
        assert_eq!(report.summary.duplicates, 2);
        let stored = store.get("1").await.unwrap().unwrap();
        assert_eq!(stored.modified_date, NaiveDate::from_ymd_opt(2024, 3, 1));
    }

    #[tokio::test]
    async fn test_id_ranges_skip_outside_plugins() {
        let source = Pages::new(vec![vec![entry("10001", "2024-01-01"), entry("500001", "2024-01-01")]]);
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(
            source,
            store.clone(),
            EngineSettings {
                id_ranges: IdRanges::new(vec![(10001, 98000)]),
                ..settings()
            },
        );

        let report = engine.full_sync().await.unwrap();
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(store.ids(), vec!["10001"]);
    }

    #[tokio::test]
    async fn test_future_since_is_usage_error_without_io() {
        let source = Pages::new(vec![vec![entry("1", "2024-01-01")]]);
        let engine = SyncEngine::new(source.clone(), Arc::new(MemoryStore::new()), settings());
        let tomorrow = Utc::now().date_naive() + chrono::Duration::days(1);

        let failure = engine.incremental_sync(tomorrow).await.unwrap_err();
        assert!(matches!(failure.error, SyncError::Usage(UsageError::FutureSinceDate { .. })));
        assert_eq!(failure.exit_code(), EXIT_USAGE);
        assert!(failure.resume_from.is_none());
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(source.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watermark_needs_stored_plugins() {
        let engine = SyncEngine::new(Pages::new(vec![]), Arc::new(MemoryStore::new()), settings());
        let failure = engine.incremental_since_watermark().await.unwrap_err();
        assert!(matches!(failure.error, SyncError::Usage(UsageError::NoWatermark)));
    }

    struct RejectAll;

    #[async_trait]
    impl PluginStore for RejectAll {
        async fn upsert(&self, plugin: &Plugin) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Conflict {
                script_id: plugin.script_id.clone(),
                message: "constraint failed".into(),
            })
        }
        async fn get(&self, _script_id: &str) -> Result<Option<Plugin>, StoreError> {
            Ok(None)
        }
        async fn watermark(&self) -> Result<Option<NaiveDate>, StoreError> {
            Ok(None)
        }
        async fn count(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_rejection_threshold_fails_run() {
        let source = Pages::new(vec![
            vec![entry("1", "2024-01-01"), entry("2", "2024-01-01")],
            vec![entry("3", "2024-01-01"), entry("4", "2024-01-01")],
        ]);
        let engine = SyncEngine::new(
            source,
            Arc::new(RejectAll),
            EngineSettings {
                max_rejections: Some(1),
                ..settings()
            },
        );

        let failure = engine.full_sync().await.unwrap_err();
        assert!(matches!(failure.error, SyncError::TooManyRejections { rejected: 2, limit: 1 }));
        assert_eq!(failure.resume_from.unwrap().offset, 0);
        assert_eq!(engine.state(), SyncState::Failed);
    }

    #[tokio::test]
    async fn test_rejections_without_threshold_complete_with_exit_3() {
        let source = Pages::new(vec![vec![entry("1", "2024-01-01"), RawEntry::json("{}")]]);
        let engine = SyncEngine::new(source, Arc::new(MemoryStore::new()), settings());
        let report = engine.full_sync().await.unwrap();
        assert_eq!(report.summary.rejected, 1);
        assert_eq!(report.exit_code(), EXIT_REJECTIONS);
        assert_eq!(engine.state(), SyncState::Completed);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.feed.page_size = 7;
        config.sync.max_rejections = Some(3);
        config.feed.id_ranges = vec![[1, 5]];
        let settings = EngineSettings::from_config(&config);
        assert_eq!(settings.page_size, 7);
        assert_eq!(settings.max_rejections, Some(3));
        assert!(settings.id_ranges.admits("4"));
        assert!(!settings.id_ranges.admits("5"));
    }
}
