pub mod http;
pub mod paginator;
pub mod retry;
pub mod types;

use crate::error::FetchError;
use async_trait::async_trait;
use types::{FeedPage, PageRequest};

/// A remote, paginated source of raw plugin entries.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// One network round trip for one page.
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError>;
}
