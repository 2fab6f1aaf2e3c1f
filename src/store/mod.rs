pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::plugin::Plugin;
use async_trait::async_trait;
use chrono::NaiveDate;

/// What an upsert did to the stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored document has a later `modified_date`; nothing was written.
    Stale,
}

/// Persistent plugin collection keyed by `script_id`.
///
/// `upsert` must be atomic per key: the read of the stored modification date
/// and the write happen as one unit.
#[async_trait]
pub trait PluginStore: Send + Sync {
    async fn upsert(&self, plugin: &Plugin) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, script_id: &str) -> Result<Option<Plugin>, StoreError>;

    /// Latest `modified_date` held by the store.
    async fn watermark(&self) -> Result<Option<NaiveDate>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}
