use super::{PluginStore, UpsertOutcome};
use crate::error::StoreError;
use crate::plugin::Plugin;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-process store. Documents are kept in their stored (flat) form so reads
/// go through the same decode path as the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, (Option<NaiveDate>, Map<String, Value>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored document for `script_id`, exactly as written.
    pub fn document(&self, script_id: &str) -> Option<Map<String, Value>> {
        self.docs
            .lock()
            .ok()?
            .get(script_id)
            .map(|(_, doc)| doc.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .docs
            .lock()
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".into())
}

#[async_trait]
impl PluginStore for MemoryStore {
    async fn upsert(&self, plugin: &Plugin) -> Result<UpsertOutcome, StoreError> {
        let mut docs = self.docs.lock().map_err(|_| poisoned())?;
        let outcome = match docs.get(&plugin.script_id) {
            None => UpsertOutcome::Inserted,
            Some((stored, _)) if !plugin.supersedes(*stored) => return Ok(UpsertOutcome::Stale),
            Some(_) => UpsertOutcome::Updated,
        };
        docs.insert(
            plugin.script_id.clone(),
            (plugin.modified_date, plugin.to_document()),
        );
        Ok(outcome)
    }

    async fn get(&self, script_id: &str) -> Result<Option<Plugin>, StoreError> {
        let doc = {
            let docs = self.docs.lock().map_err(|_| poisoned())?;
            docs.get(script_id).map(|(_, doc)| doc.clone())
        };
        doc.map(Plugin::from_document)
            .transpose()
            .map_err(|e| StoreError::Document(e.to_string()))
    }

    async fn watermark(&self) -> Result<Option<NaiveDate>, StoreError> {
        let docs = self.docs.lock().map_err(|_| poisoned())?;
        Ok(docs.values().filter_map(|(modified, _)| *modified).max())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.docs.lock().map_err(|_| poisoned())?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Severity;

    fn plugin(id: &str, modified: Option<(i32, u32, u32)>, name: &str) -> Plugin {
        Plugin {
            script_id: id.into(),
            name: name.into(),
            family: "General".into(),
            severity: Severity::Low,
            published_date: None,
            modified_date: modified.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            raw_fields: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_then_update() {
        let store = MemoryStore::new();
        let v1 = plugin("1", Some((2024, 1, 1)), "v1");
        let v2 = plugin("1", Some((2024, 2, 1)), "v2");
        assert_eq!(store.upsert(&v1).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&v2).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.get("1").await.unwrap().unwrap().name, "v2");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_older_version_is_stale() {
        let store = MemoryStore::new();
        store.upsert(&plugin("X", Some((2024, 1, 1)), "new")).await.unwrap();
        let outcome = store.upsert(&plugin("X", Some((2023, 1, 1)), "old")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);
        assert_eq!(store.get("X").await.unwrap().unwrap().name, "new");
    }

    #[tokio::test]
    async fn test_watermark_is_latest_modified() {
        let store = MemoryStore::new();
        assert_eq!(store.watermark().await.unwrap(), None);
        store.upsert(&plugin("1", Some((2024, 3, 1)), "a")).await.unwrap();
        store.upsert(&plugin("2", Some((2024, 5, 9)), "b")).await.unwrap();
        store.upsert(&plugin("3", None, "c")).await.unwrap();
        assert_eq!(store.watermark().await.unwrap(), NaiveDate::from_ymd_opt(2024, 5, 9));
        assert_eq!(store.ids(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = MemoryStore::new();
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(store.document("nope").is_none());
    }
}
