use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::fmt;

/// Family assigned when the feed omits one.
pub const DEFAULT_FAMILY: &str = "unknown";

/// Canonical, encoding-agnostic representation of one catalog plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct Plugin {
    pub script_id: String,
    pub name: String,
    pub family: String,
    pub severity: Severity,
    pub published_date: Option<NaiveDate>,
    pub modified_date: Option<NaiveDate>,
    /// Source fields with no canonical slot, kept verbatim.
    pub raw_fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    #[default]
    Unknown,
}

impl Severity {
    /// Accepts the numeric 0-4 scale or the textual risk factor.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "0" | "none" | "info" | "informational" => Some(Severity::Info),
            "1" | "low" => Some(Severity::Low),
            "2" | "medium" => Some(Severity::Medium),
            "3" | "high" => Some(Severity::High),
            "4" | "critical" => Some(Severity::Critical),
            "" | "unknown" => Some(Severity::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
            Severity::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Keys written by `to_document`; the decoder reads them back as the primary aliases.
pub(crate) const KEY_SCRIPT_ID: &str = "script_id";
pub(crate) const KEY_NAME: &str = "script_name";
pub(crate) const KEY_FAMILY: &str = "script_family";
pub(crate) const KEY_SEVERITY: &str = "severity";
pub(crate) const KEY_PUBLISHED: &str = "plugin_publication_date";
pub(crate) const KEY_MODIFIED: &str = "plugin_modification_date";

impl Plugin {
    /// Flat, feed-shaped document stored for this plugin.
    pub fn to_document(&self) -> Map<String, Value> {
        let mut doc = self.raw_fields.clone();
        doc.insert(KEY_SCRIPT_ID.into(), Value::String(self.script_id.clone()));
        doc.insert(KEY_NAME.into(), Value::String(self.name.clone()));
        doc.insert(KEY_FAMILY.into(), Value::String(self.family.clone()));
        doc.insert(KEY_SEVERITY.into(), Value::String(self.severity.as_str().into()));
        if let Some(d) = self.published_date {
            doc.insert(KEY_PUBLISHED.into(), Value::String(d.format("%Y-%m-%d").to_string()));
        }
        if let Some(d) = self.modified_date {
            doc.insert(KEY_MODIFIED.into(), Value::String(d.format("%Y-%m-%d").to_string()));
        }
        doc
    }

    /// Rebuild a plugin from a stored document.
    pub fn from_document(doc: Map<String, Value>) -> Result<Self, crate::error::DecodeError> {
        crate::decode::from_fields(doc)
    }

    /// True when `self` may replace a stored version last modified at `stored`.
    pub fn supersedes(&self, stored: Option<NaiveDate>) -> bool {
        self.modified_date >= stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Plugin {
        let mut raw = Map::new();
        raw.insert("cvss3_base_score".into(), Value::from(9.8));
        Plugin {
            script_id: "10001".into(),
            name: "Example Check".into(),
            family: "Web Servers".into(),
            severity: Severity::Critical,
            published_date: NaiveDate::from_ymd_opt(2020, 5, 1),
            modified_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            raw_fields: raw,
        }
    }

    #[test]
    fn test_severity_parse_numeric_and_text() {
        assert_eq!(Severity::parse("4"), Some(Severity::Critical));
        assert_eq!(Severity::parse("None"), Some(Severity::Info));
        assert_eq!(Severity::parse(" medium "), Some(Severity::Medium));
        assert_eq!(Severity::parse(""), Some(Severity::Unknown));
        assert_eq!(Severity::parse("catastrophic"), None);
    }

    #[test]
    fn test_document_is_flat_and_feed_shaped() {
        let doc = sample().to_document();
        assert_eq!(doc["script_id"], "10001");
        assert_eq!(doc["script_name"], "Example Check");
        assert_eq!(doc["severity"], "Critical");
        assert_eq!(doc["plugin_modification_date"], "2024-01-01");
        assert_eq!(doc["cvss3_base_score"], 9.8);
    }

    #[test]
    fn test_document_roundtrip() {
        let plugin = sample();
        let back = Plugin::from_document(plugin.to_document()).unwrap();
        assert_eq!(back, plugin);
    }

    #[test]
    fn test_supersedes_uses_modified_date() {
        let plugin = sample();
        assert!(plugin.supersedes(None));
        assert!(plugin.supersedes(NaiveDate::from_ymd_opt(2024, 1, 1)));
        assert!(!plugin.supersedes(NaiveDate::from_ymd_opt(2024, 6, 1)));
    }
}
