use crate::feed::retry::RetryPolicy;
use crate::feed::types::IdRanges;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const ENV_FILE: &str = ".env";
const ACCESS_KEY_VAR: &str = "FEED_ACCESS_KEY";
const SECRET_KEY_VAR: &str = "FEED_SECRET_KEY";
const STORE_PATH_VAR: &str = "PLUGIN_SYNC_STORE_PATH";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    /// Search API queried per modification day in incremental runs.
    #[serde(default = "default_search_url")]
    pub search_url: String,
    /// Per-plugin detail endpoint; the script id is appended as a path segment.
    #[serde(default = "default_detail_url")]
    pub detail_url: String,
    /// Gzipped XML catalog listing every plugin, used by full runs.
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    /// Plugins per page handed to reconciliation.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_catalog_timeout")]
    pub catalog_timeout_ms: u64,
    /// Detail requests in flight per page.
    #[serde(default = "default_detail_concurrency")]
    pub detail_concurrency: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Half-open `[lo, hi)` plugin id ranges to keep; empty keeps everything.
    #[serde(default)]
    pub id_ranges: Vec<[u64; 2]>,
}

fn default_search_url() -> String {
    "https://www.tenable.com/plugins/api/v1/search".to_string()
}
fn default_detail_url() -> String {
    "https://www.tenable.com/plugins/api/v1/nessus".to_string()
}
fn default_catalog_url() -> String {
    "https://plugins.nessus.org/plugins_rba.xml.gz".to_string()
}
fn default_page_size() -> u32 { 50 }
fn default_request_timeout() -> u64 { 30_000 }
fn default_catalog_timeout() -> u64 { 300_000 }
fn default_detail_concurrency() -> usize { 8 }
fn default_user_agent() -> String {
    concat!("plugin-sync/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            search_url: default_search_url(),
            detail_url: default_detail_url(),
            catalog_url: default_catalog_url(),
            page_size: default_page_size(),
            request_timeout_ms: default_request_timeout(),
            catalog_timeout_ms: default_catalog_timeout(),
            detail_concurrency: default_detail_concurrency(),
            user_agent: default_user_agent(),
            id_ranges: Vec::new(),
        }
    }
}

impl FeedConfig {
    pub fn id_ranges(&self) -> IdRanges {
        IdRanges::new(self.id_ranges.iter().map(|[lo, hi]| (*lo, *hi)).collect())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Total attempts per page, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base() -> u64 { 500 }
fn default_backoff_max() -> u64 { 10_000 }
fn default_jitter() -> bool { true }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        );
        if self.jitter {
            policy
        } else {
            policy.without_jitter()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database file, or `:memory:`.
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Table holding the plugin documents.
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_store_path() -> String { "plugins.db".to_string() }
fn default_collection() -> String { "plugins".to_string() }
fn default_busy_timeout() -> u64 { 5000 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            collection: default_collection(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Concurrent upserts per page.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pages fetched ahead of reconciliation.
    #[serde(default = "default_prefetch")]
    pub prefetch_pages: usize,
    /// Abort the run once more entities than this have been rejected.
    #[serde(default)]
    pub max_rejections: Option<u64>,
    /// Log every upserted plugin at info level instead of debug.
    #[serde(default)]
    pub log_each_plugin: bool,
}

fn default_workers() -> usize { 4 }
fn default_prefetch() -> usize { 2 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            prefetch_pages: default_prefetch(),
            max_rejections: None,
            log_each_plugin: false,
        }
    }
}

/// Static feed credentials attached to every request.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| "Failed to parse config TOML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(STORE_PATH_VAR) {
            let path = clean_value(&path);
            if !path.is_empty() {
                self.store.path = path;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.feed.page_size == 0 {
            anyhow::bail!("feed.page_size must be > 0");
        }
        if self.feed.detail_concurrency == 0 {
            anyhow::bail!("feed.detail_concurrency must be >= 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be >= 1");
        }
        if self.sync.workers == 0 {
            anyhow::bail!("sync.workers must be >= 1");
        }
        if self.sync.prefetch_pages == 0 {
            anyhow::bail!("sync.prefetch_pages must be >= 1");
        }
        let collection = &self.store.collection;
        if collection.is_empty()
            || !collection.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            || collection.starts_with(|c: char| c.is_ascii_digit())
        {
            anyhow::bail!("store.collection {:?} is not a valid identifier", collection);
        }
        if let Some([lo, hi]) = self.feed.id_ranges.iter().find(|[lo, hi]| lo >= hi) {
            anyhow::bail!("feed.id_ranges entry [{}, {}] is empty", lo, hi);
        }
        Ok(())
    }

    /// Export the `KEY=value` pairs of `./.env` into the process environment.
    /// Variables that are already set keep their value. No file, no-op.
    pub fn import_dotenv() {
        let Ok(content) = std::fs::read_to_string(ENV_FILE) else {
            return;
        };
        for (key, value) in content.lines().filter_map(parse_env_line) {
            if std::env::var_os(key).is_none() {
                std::env::set_var(key, value);
            }
        }
    }

    /// Feed credentials from the environment. Both keys must be set.
    pub fn feed_credentials() -> Option<Credentials> {
        credentials_from(
            std::env::var(ACCESS_KEY_VAR).ok(),
            std::env::var(SECRET_KEY_VAR).ok(),
        )
    }
}

fn credentials_from(access: Option<String>, secret: Option<String>) -> Option<Credentials> {
    let access_key = clean_value(&access?);
    let secret_key = clean_value(&secret?);
    if access_key.is_empty() || secret_key.is_empty() {
        return None;
    }
    Some(Credentials { access_key, secret_key })
}

/// One `.env` line as a key/value pair. Comments and blank lines give
/// `None`; an `export ` prefix and matching quotes are accepted.
fn parse_env_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start_matches('\u{feff}').trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, unquote(value.trim())))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q))
        .unwrap_or(value)
}

/// Drop control and zero-width characters that ride along with a pasted value.
fn clean_value(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '\r' | '\u{feff}' | '\u{200b}'))
        .collect::<String>()
        .trim()
        .to_string()
}
