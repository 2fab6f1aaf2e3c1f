// Sync runs against an on-disk SQLite store

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use plugin_sync::config::StoreConfig;
    use plugin_sync::engine::{EngineSettings, SyncEngine};
    use plugin_sync::feed::http::detail_entry;
    use plugin_sync::feed::types::{FeedPage, PageRequest};
    use plugin_sync::feed::FeedSource;
    use plugin_sync::store::{PluginStore, SqliteStore};
    use plugin_sync::{FetchError, Severity};
    use std::sync::Mutex;
    use std::sync::Arc;

    type Recording = Vec<(&'static str, &'static str)>;

    /// Replays recorded detail responses, one page of `(content type, body)`
    /// pairs per request.
    struct Recorded {
        pages: Mutex<Vec<Recording>>,
        since_seen: Mutex<Vec<Option<NaiveDate>>>,
    }

    impl Recorded {
        fn new(mut pages: Vec<Recording>) -> Arc<Self> {
            pages.reverse();
            Arc::new(Self {
                pages: Mutex::new(pages),
                since_seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl FeedSource for Recorded {
        async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError> {
            self.since_seen.lock().unwrap().push(request.since);
            let Some(page) = self.pages.lock().unwrap().pop() else {
                return Ok(FeedPage::default());
            };
            let entries = page
                .into_iter()
                .map(|(content_type, body)| detail_entry(Some(content_type), body))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FeedPage { entries, end_of_feed: false })
        }
    }

    const JSON: &str = "application/json; charset=utf-8";
    const XML: &str = "application/xml";

    const WEB_SERVER: &str = r#"{
        "data": {
            "_id": "10001",
            "_source": {
                "script_id": 10001,
                "script_name": "Web Server Detection",
                "script_family": "Web Servers",
                "risk_factor": "None",
                "plugin_publication_date": "2003/05/10",
                "plugin_modification_date": "2024/03/01",
                "cpe": ["cpe:/a:apache:http_server"]
            }
        }
    }"#;

    const DEFAULT_CREDS: &str = r#"{
        "data": {
            "_source": {
                "script_id": "10002",
                "script_name": "Database Default Credentials",
                "severity": "critical",
                "plugin_modification_date": "2024-04-15T10:00:00Z"
            }
        }
    }"#;

    const CERT_EXPIRY: &str = r#"<nasl>
    <script_id>10003</script_id>
    <script_name>SSL Certificate Expiry</script_name>
    <script_family>General</script_family>
    <attributes>
      <attribute><name>risk_factor</name><value>Medium</value></attribute>
      <attribute><name>plugin_modification_date</name><value>2024/05/02</value></attribute>
      <attribute><name>solution</name><value><![CDATA[Renew the <certificate>.]]></value></attribute>
    </attributes>
  </nasl>"#;

    fn settings() -> EngineSettings {
        EngineSettings {
            page_size: 2,
            ..EngineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_mixed_encodings_land_in_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: dir.path().join("plugins.db").to_string_lossy().into_owned(),
            ..StoreConfig::default()
        };
        let store = Arc::new(SqliteStore::open(&config).unwrap());
        let source = Recorded::new(vec![
            vec![(JSON, WEB_SERVER), (JSON, DEFAULT_CREDS)],
            vec![(XML, CERT_EXPIRY)],
        ]);
        let engine = SyncEngine::new(source, store.clone(), settings());

        let report = engine.full_sync().await.unwrap();
        assert_eq!(report.summary.inserted, 3);
        assert_eq!(report.summary.rejected, 0);
        assert_eq!(store.count().await.unwrap(), 3);

        let web = store.get("10001").await.unwrap().unwrap();
        assert_eq!(web.family, "Web Servers");
        assert_eq!(web.severity, Severity::Info);
        assert_eq!(web.published_date, NaiveDate::from_ymd_opt(2003, 5, 10));
        assert_eq!(web.raw_fields["cpe"][0], "cpe:/a:apache:http_server");

        let creds = store.get("10002").await.unwrap().unwrap();
        assert_eq!(creds.severity, Severity::Critical);
        assert_eq!(creds.family, "unknown");

        let cert = store.get("10003").await.unwrap().unwrap();
        assert_eq!(cert.severity, Severity::Medium);
        assert_eq!(cert.raw_fields["solution"], "Renew the <certificate>.");

        assert_eq!(store.watermark().await.unwrap(), NaiveDate::from_ymd_opt(2024, 5, 2));
    }

    #[tokio::test]
    async fn test_incremental_from_watermark_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: dir.path().join("plugins.db").to_string_lossy().into_owned(),
            ..StoreConfig::default()
        };
        {
            let store = Arc::new(SqliteStore::open(&config).unwrap());
            let source = Recorded::new(vec![vec![(JSON, WEB_SERVER), (JSON, DEFAULT_CREDS)]]);
            let engine = SyncEngine::new(source, store, settings());
            engine.full_sync().await.unwrap();
        }

        let store = Arc::new(SqliteStore::open(&config).unwrap());
        let source = Recorded::new(vec![vec![(XML, CERT_EXPIRY)]]);
        let engine = SyncEngine::new(source.clone(), store.clone(), settings());

        let report = engine.incremental_since_watermark().await.unwrap();
        assert_eq!(report.summary.inserted, 1);
        assert_eq!(store.count().await.unwrap(), 3);
        let watermark = NaiveDate::from_ymd_opt(2024, 4, 15);
        assert!(source.since_seen.lock().unwrap().iter().all(|s| *s == watermark));
    }
}
