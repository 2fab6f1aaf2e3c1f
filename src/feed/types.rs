use chrono::NaiveDate;
use std::fmt;

/// Wire encoding of a single raw feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Key/value structured text.
    Json,
    /// Attribute/tag structured text (`<nasl>` blocks).
    Xml,
}

impl Encoding {
    /// Map a `Content-Type` header value to an encoding.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime == "application/json" || mime.ends_with("+json") {
            Some(Encoding::Json)
        } else if mime == "application/xml" || mime == "text/xml" || mime.ends_with("+xml") {
            Some(Encoding::Xml)
        } else {
            None
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Json => f.write_str("json"),
            Encoding::Xml => f.write_str("xml"),
        }
    }
}

/// One undecoded plugin record as delivered by the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub encoding: Encoding,
    pub body: String,
}

impl RawEntry {
    pub fn json(body: impl Into<String>) -> Self {
        Self { encoding: Encoding::Json, body: body.into() }
    }

    pub fn xml(body: impl Into<String>) -> Self {
        Self { encoding: Encoding::Xml, body: body.into() }
    }
}

/// Parameters of one page fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub offset: u64,
    pub page_size: u32,
    pub since: Option<NaiveDate>,
}

/// A page as returned by a `FeedSource`.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub entries: Vec<RawEntry>,
    /// Source says no further pages exist.
    pub end_of_feed: bool,
}

/// A page handed from the paginator to the reconciliation side.
#[derive(Debug, Clone)]
pub struct Page {
    pub index: u64,
    pub offset: u64,
    pub entries: Vec<RawEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// Position within the feed for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCursor {
    pub offset: u64,
    pub page_index: u64,
    pub page_size: u32,
    pub since: Option<NaiveDate>,
}

impl SyncCursor {
    pub fn full(page_size: u32) -> Self {
        Self { offset: 0, page_index: 0, page_size, since: None }
    }

    pub fn incremental(page_size: u32, since: NaiveDate) -> Self {
        Self { offset: 0, page_index: 0, page_size, since: Some(since) }
    }

    pub fn mode(&self) -> SyncMode {
        if self.since.is_some() {
            SyncMode::Incremental
        } else {
            SyncMode::Full
        }
    }

    pub fn request(&self) -> PageRequest {
        PageRequest {
            offset: self.offset,
            page_size: self.page_size,
            since: self.since,
        }
    }

    /// Same run parameters, positioned at `offset`.
    pub fn at(&self, offset: u64, page_index: u64) -> Self {
        Self { offset, page_index, ..self.clone() }
    }

    pub(crate) fn advance(&mut self, received: usize) {
        self.offset += received as u64;
        self.page_index += 1;
    }

    /// Client-side re-check of the incremental bound. Entities without a
    /// modification date cannot be shown to be in the window.
    pub fn admits(&self, modified: Option<NaiveDate>) -> bool {
        match self.since {
            None => true,
            Some(since) => modified.is_some_and(|m| m >= since),
        }
    }
}

/// Half-open `[lo, hi)` ranges of numeric plugin ids to keep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdRanges(Vec<(u64, u64)>);

impl IdRanges {
    pub fn new(ranges: Vec<(u64, u64)>) -> Self {
        Self(ranges)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Empty ranges admit everything; otherwise the id must be numeric and inside a range.
    pub fn admits(&self, script_id: &str) -> bool {
        if self.0.is_empty() {
            return true;
        }
        match script_id.parse::<u64>() {
            Ok(id) => self.0.iter().any(|&(lo, hi)| lo <= id && id < hi),
            Err(_) => false,
        }
    }
}
