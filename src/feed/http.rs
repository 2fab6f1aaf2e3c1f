//! Plugin feed over the vendor's public plugin API.
//!
//! Neither endpoint pages by offset, so the source first lists the plugin ids
//! of the run and then serves offset pages out of that list, one detail
//! request per plugin:
//! - full: the `<nasl><script_id>` values of the gzipped plugin catalog
//!   (`catalog_url`);
//! - incremental: one search query per modification day from `since` through
//!   today, `{search_url}?q=plugin_modification_date:(YYYY-MM-DD)`, with
//!   `&page=N` for `N` in `2..=total / 50 + 1`;
//! - detail: `GET {detail_url}/{script_id}`, record under `data._source`.
//!
//! The listing is kept until a walk reaches its end, so a resumed run pages
//! through the same ids.

use super::types::{Encoding, FeedPage, IdRanges, PageRequest, RawEntry};
use super::FeedSource;
use crate::config::{Credentials, FeedConfig};
use crate::error::FetchError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use flate2::bufread::GzDecoder;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const API_KEYS_HEADER: &str = "x-apikeys";
/// Hits per search-API page; fixed by the server.
const SEARCH_PAGE_SIZE: u64 = 50;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub struct HttpFeedSource {
    client: Client,
    search_url: String,
    detail_url: String,
    catalog_url: String,
    catalog_timeout: Duration,
    detail_concurrency: usize,
    id_ranges: IdRanges,
    listing: Mutex<Option<Listing>>,
}

/// Plugin ids of one walk, in feed order.
struct Listing {
    since: Option<NaiveDate>,
    ids: Arc<Vec<String>>,
    finished: bool,
}

impl HttpFeedSource {
    pub fn new(config: &FeedConfig, credentials: Option<&Credentials>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, application/xml;q=0.9, */*;q=0.1"),
        );
        if let Some(creds) = credentials {
            let mut value = HeaderValue::from_str(&format!(
                "accessKey={};secretKey={}",
                creds.access_key, creds.secret_key
            ))
            .context("feed credentials contain characters not allowed in a header")?;
            value.set_sensitive(true);
            headers.insert(API_KEYS_HEADER, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .pool_max_idle_per_host(config.detail_concurrency.max(4))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            search_url: config.search_url.trim_end_matches('/').to_string(),
            detail_url: config.detail_url.trim_end_matches('/').to_string(),
            catalog_url: config.catalog_url.clone(),
            catalog_timeout: Duration::from_millis(config.catalog_timeout_ms),
            detail_concurrency: config.detail_concurrency.max(1),
            id_ranges: config.id_ranges(),
            listing: Mutex::new(None),
        })
    }

    /// Ids for a walk with this `since`. Rebuilt when `since` changes or the
    /// previous walk over the same listing has finished.
    async fn listing_for(&self, since: Option<NaiveDate>) -> Result<Arc<Vec<String>>, FetchError> {
        let mut listing = self.listing.lock().await;
        if let Some(current) = listing.as_ref() {
            if current.since == since && !current.finished {
                return Ok(current.ids.clone());
            }
        }

        let ids = match since {
            None => self.list_catalog().await?,
            Some(since) => self.list_modified(since).await?,
        };
        info!(plugins = ids.len(), since = ?since, "plugin listing built");

        let ids = Arc::new(ids);
        *listing = Some(Listing { since, ids: ids.clone(), finished: false });
        Ok(ids)
    }

    async fn finish_listing(&self) {
        if let Some(current) = self.listing.lock().await.as_mut() {
            current.finished = true;
        }
    }

    async fn list_catalog(&self) -> Result<Vec<String>, FetchError> {
        debug!(url = %self.catalog_url, "downloading plugin catalog");
        let resp = self
            .client
            .get(&self.catalog_url)
            .timeout(self.catalog_timeout)
            .send()
            .await?;
        let body = ensure_success(resp).await?.bytes().await?;
        debug!(bytes = body.len(), "plugin catalog downloaded");

        let ranges = self.id_ranges.clone();
        tokio::task::spawn_blocking(move || parse_catalog(&body, &ranges))
            .await
            .map_err(|e| FetchError::transport_fatal(format!("catalog reader failed: {}", e)))?
    }

    async fn list_modified(&self, since: NaiveDate) -> Result<Vec<String>, FetchError> {
        let today = Utc::now().date_naive();
        let mut seen = HashSet::new();
        let mut ids = Vec::new();

        for day in since.iter_days().take_while(|d| *d <= today) {
            let first = self.search(day, 1).await?;
            let pages = search_pages(first.total);
            let mut hits = first.ids;
            for page in 2..=pages {
                hits.extend(self.search(day, page).await?.ids);
            }
            debug!(day = %day, hits = hits.len(), pages, "modified plugins listed");
            ids.extend(
                hits.into_iter()
                    .filter(|id| self.id_ranges.admits(id) && seen.insert(id.clone())),
            );
        }
        Ok(ids)
    }

    async fn search(&self, day: NaiveDate, page: u64) -> Result<SearchPage, FetchError> {
        let mut query = vec![(
            "q",
            format!("plugin_modification_date:({})", day.format("%Y-%m-%d")),
        )];
        if page > 1 {
            query.push(("page", page.to_string()));
        }
        let resp = self.client.get(&self.search_url).query(&query).send().await?;
        let body = ensure_success(resp).await?.text().await?;
        parse_search_page(&body)
    }

    async fn fetch_detail(&self, script_id: &str) -> Result<RawEntry, FetchError> {
        let url = format!("{}/{}", self.detail_url, script_id);
        let resp = self.client.get(&url).send().await?;

        // Listed but not served. The entry still takes its slot in the page
        // and is rejected by the decoder.
        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            warn!(script_id, status = status.as_u16(), "plugin detail not served");
            let body = resp.text().await.unwrap_or_default();
            return Ok(RawEntry::json(body));
        }

        let resp = ensure_success(resp).await?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;
        detail_entry(content_type.as_deref(), &body)
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError> {
        let ids = self.listing_for(request.since).await?;
        let start = (request.offset as usize).min(ids.len());
        let end = (start + request.page_size as usize).min(ids.len());

        let entries: Vec<RawEntry> = stream::iter(ids[start..end].iter().cloned())
            .map(|id| async move { self.fetch_detail(&id).await })
            .buffered(self.detail_concurrency)
            .try_collect()
            .await?;

        let end_of_feed = end >= ids.len();
        if end_of_feed {
            self.finish_listing().await;
        }
        Ok(FeedPage { entries, end_of_feed })
    }
}

async fn ensure_success(resp: Response) -> Result<Response, FetchError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(FetchError::Status {
        status: status.as_u16(),
        body: truncate(&body, 512),
    })
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

// ── Search API ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: SearchData,
}

#[derive(Debug, Default, Deserialize)]
struct SearchData {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_source", default)]
    source: Value,
}

/// One page of search results: the reported total and the hit ids.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub total: Option<u64>,
    pub ids: Vec<String>,
}

/// Public for unit testing with fixtures.
pub fn parse_search_page(body: &str) -> Result<SearchPage, FetchError> {
    let parsed: SearchResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::Malformed(format!("search page: {}", e)))?;

    let ids = parsed
        .data
        .hits
        .iter()
        .filter_map(|hit| match hit.source.get("script_id")? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|id| !id.is_empty())
        .collect();

    Ok(SearchPage { total: parsed.data.total, ids })
}

/// Number of search pages for a reported total. The server pages by 50 and
/// the count rounds up by one page even on exact multiples.
pub fn search_pages(total: Option<u64>) -> u64 {
    total.map_or(1, |t| t / SEARCH_PAGE_SIZE + 1)
}

// ── Detail records ────────────────────────────────────────────────────

/// Raw entry for one detail response. JSON records are unwrapped from
/// `data`, which leaves the `_source` wrapper the decoder expects; XML
/// bodies are single `<nasl>` blocks. A JSON body without `data` is passed
/// through untouched and rejected at decode time.
pub fn detail_entry(content_type: Option<&str>, body: &str) -> Result<RawEntry, FetchError> {
    let encoding = match content_type {
        None => Encoding::Json,
        Some(ct) => Encoding::from_content_type(ct).ok_or_else(|| {
            FetchError::Malformed(format!("unsupported content type {:?}", ct))
        })?,
    };
    Ok(match encoding {
        Encoding::Json => match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(mut top)) => match top.remove("data") {
                Some(data @ Value::Object(_)) => RawEntry::json(data.to_string()),
                _ => RawEntry::json(body),
            },
            _ => RawEntry::json(body),
        },
        Encoding::Xml => RawEntry::xml(body.trim()),
    })
}

// ── Plugin catalog ────────────────────────────────────────────────────

/// Plugin ids of the catalog in catalog order, filtered by `ranges`. Takes
/// the gzipped download or plain XML; only `<script_id>` children of
/// second-level elements count.
pub fn parse_catalog(body: &[u8], ranges: &IdRanges) -> Result<Vec<String>, FetchError> {
    if body.starts_with(&GZIP_MAGIC) {
        read_catalog(BufReader::new(GzDecoder::new(body)), ranges)
    } else {
        read_catalog(body, ranges)
    }
}

fn read_catalog<R: BufRead>(input: R, ranges: &IdRanges) -> Result<Vec<String>, FetchError> {
    let malformed = |e: &dyn std::fmt::Display| FetchError::Malformed(format!("plugin catalog: {}", e));

    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut in_script_id = false;
    let mut ids = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(|e| malformed(&e))? {
            Event::Start(start) => {
                depth += 1;
                in_script_id = depth == 3 && start.local_name().as_ref() == b"script_id";
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                in_script_id = false;
            }
            Event::Text(text) if in_script_id => {
                let id = text.unescape().map_err(|e| malformed(&e))?;
                let id = id.trim();
                if !id.is_empty() && ranges.admits(id) {
                    ids.push(id.to_string());
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if depth != 0 {
        return Err(malformed(&"catalog ends inside an element"));
    }
    Ok(ids)
}
