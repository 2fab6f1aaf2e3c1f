use super::retry::RetryPolicy;
use super::types::{Page, SyncCursor};
use super::FeedSource;
use crate::error::FetchError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation shared by the engine, the paginator and the
/// process signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Walks the feed page by page from a cursor, retrying transient failures.
pub struct Paginator {
    source: Arc<dyn FeedSource>,
    cursor: SyncCursor,
    retry: RetryPolicy,
    cancel: CancelFlag,
    finished: bool,
}

impl Paginator {
    pub fn new(
        source: Arc<dyn FeedSource>,
        cursor: SyncCursor,
        retry: RetryPolicy,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            source,
            cursor,
            retry,
            cancel,
            finished: false,
        }
    }

    /// Position of the next page to fetch; a new paginator built from it resumes here.
    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    /// Fetch the next non-empty page. `Ok(None)` means the feed is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Page>, FetchError> {
        if self.finished {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let request = self.cursor.request();
        let mut backoff = self.retry.start();
        let fetched = loop {
            match self.source.fetch_page(&request).await {
                Ok(page) => break page,
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            page = self.cursor.page_index,
                            offset = request.offset,
                            attempt = backoff.attempts() - 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "page fetch failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(FetchError::Exhausted {
                            attempts: backoff.attempts(),
                            last: Box::new(e),
                        });
                    }
                },
                Err(e) => return Err(e),
            }
        };

        if fetched.entries.is_empty() {
            tracing::debug!(page = self.cursor.page_index, offset = request.offset, "empty page, feed complete");
            self.finished = true;
            return Ok(None);
        }
        if fetched.end_of_feed {
            self.finished = true;
        }

        let page = Page {
            index: self.cursor.page_index,
            offset: self.cursor.offset,
            entries: fetched.entries,
        };
        self.cursor.advance(page.entries.len());
        tracing::debug!(page = page.index, offset = page.offset, entries = page.entries.len(), "fetched page");
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::types::{FeedPage, PageRequest, RawEntry};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted responses and records every request.
    struct Scripted {
        responses: Mutex<VecDeque<Result<FeedPage, FetchError>>>,
        requests: Mutex<Vec<PageRequest>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<FeedPage, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl FeedSource for Scripted {
        async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(FeedPage::default()))
        }
    }

    fn page(ids: &[&str]) -> Result<FeedPage, FetchError> {
        Ok(FeedPage {
            entries: ids
                .iter()
                .map(|id| RawEntry::json(format!(r#"{{"script_id":"{}"}}"#, id)))
                .collect(),
            end_of_feed: false,
        })
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(2)).without_jitter()
    }

    fn paginator(source: Arc<Scripted>, cursor: SyncCursor) -> Paginator {
        Paginator::new(source, cursor, fast_retry(3), CancelFlag::new())
    }

    #[tokio::test]
    async fn test_walks_until_empty_page() {
        let source = Scripted::new(vec![page(&["A", "B"]), page(&["C", "D"]), page(&[])]);
        let mut p = paginator(source.clone(), SyncCursor::full(2));

        let first = p.next_page().await.unwrap().unwrap();
        assert_eq!((first.index, first.offset, first.entries.len()), (0, 0, 2));
        let second = p.next_page().await.unwrap().unwrap();
        assert_eq!((second.index, second.offset), (1, 2));
        assert!(p.next_page().await.unwrap().is_none());
        assert!(p.next_page().await.unwrap().is_none());
        assert_eq!(source.request_count(), 3);
        assert_eq!(p.cursor().offset, 4);
    }

    #[tokio::test]
    async fn test_end_marker_stops_without_extra_request() {
        let mut last = page(&["C"]).unwrap();
        last.end_of_feed = true;
        let source = Scripted::new(vec![page(&["A", "B"]), Ok(last)]);
        let mut p = paginator(source.clone(), SyncCursor::full(2));

        assert!(p.next_page().await.unwrap().is_some());
        assert!(p.next_page().await.unwrap().is_some());
        assert!(p.next_page().await.unwrap().is_none());
        assert_eq!(source.request_count(), 2);
    }

    #[tokio::test]
    async fn test_incremental_request_carries_since() {
        let since = chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let source = Scripted::new(vec![page(&[])]);
        let mut p = paginator(source.clone(), SyncCursor::incremental(25, since));
        assert!(p.next_page().await.unwrap().is_none());
        let requests = source.requests.lock().unwrap();
        assert_eq!(requests[0], PageRequest { offset: 0, page_size: 25, since: Some(since) });
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let source = Scripted::new(vec![
            Err(FetchError::Timeout),
            Err(FetchError::Status { status: 502, body: "bad gateway".into() }),
            page(&["A"]),
        ]);
        let mut p = paginator(source.clone(), SyncCursor::full(10));
        let got = p.next_page().await.unwrap().unwrap();
        assert_eq!(got.entries.len(), 1);
        assert_eq!(source.request_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_ceiling_surfaces_exhausted() {
        let source = Scripted::new(vec![
            Err(FetchError::Timeout),
            Err(FetchError::Timeout),
            Err(FetchError::Timeout),
            page(&["never reached"]),
        ]);
        let mut p = paginator(source.clone(), SyncCursor::full(10));
        match p.next_page().await {
            Err(FetchError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, FetchError::Timeout));
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
        assert_eq!(source.request_count(), 3);
        assert_eq!(p.cursor().offset, 0);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let source = Scripted::new(vec![Err(FetchError::Status { status: 403, body: "denied".into() })]);
        let mut p = paginator(source.clone(), SyncCursor::full(10));
        assert!(matches!(p.next_page().await, Err(FetchError::Status { status: 403, .. })));
        assert_eq!(source.request_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_checked_at_page_boundary() {
        let source = Scripted::new(vec![page(&["A"]), page(&["B"])]);
        let cancel = CancelFlag::new();
        let mut p = Paginator::new(source.clone(), SyncCursor::full(1), fast_retry(3), cancel.clone());

        assert!(p.next_page().await.unwrap().is_some());
        cancel.cancel();
        assert!(matches!(p.next_page().await, Err(FetchError::Cancelled)));
        assert_eq!(source.request_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_from_cursor() {
        let source = Scripted::new(vec![page(&["C", "D"]), page(&[])]);
        let mut p = paginator(source.clone(), SyncCursor::full(2).at(2, 1));
        let got = p.next_page().await.unwrap().unwrap();
        assert_eq!((got.index, got.offset), (1, 2));
        assert_eq!(source.requests.lock().unwrap()[0].offset, 2);
    }
}
