//! Raw feed entry → `Plugin`.
//!
//! One decoder per wire encoding, dispatched on the entry's declared
//! `Encoding`. Both reduce the entry to a flat field map and hand it to
//! `from_fields`, which owns the alias table and the defaults.

pub mod json;
pub mod xml;

use crate::error::DecodeError;
use crate::feed::types::{Encoding, RawEntry};
use crate::plugin::{self, Plugin, Severity, DEFAULT_FAMILY};
use chrono::NaiveDate;
use serde_json::{Map, Value};

const SCRIPT_ID: &[&str] = &[plugin::KEY_SCRIPT_ID];
const NAME: &[&str] = &[plugin::KEY_NAME, "name", "plugin_name"];
const FAMILY: &[&str] = &[plugin::KEY_FAMILY, "family"];
const SEVERITY: &[&str] = &[plugin::KEY_SEVERITY, "risk_factor"];
const PUBLISHED: &[&str] = &[plugin::KEY_PUBLISHED, "published_date"];
const MODIFIED: &[&str] = &[plugin::KEY_MODIFIED, "modified_date"];

pub fn decode(raw: &RawEntry) -> Result<Plugin, DecodeError> {
    let fields = match raw.encoding {
        Encoding::Json => json::fields(&raw.body)?,
        Encoding::Xml => xml::fields(&raw.body)?,
    };
    from_fields(fields)
}

/// Build a `Plugin` from a flat field map. Consumed aliases are removed;
/// whatever is left becomes `raw_fields`.
pub fn from_fields(mut fields: Map<String, Value>) -> Result<Plugin, DecodeError> {
    let script_id = take(&mut fields, SCRIPT_ID)
        .and_then(|(_, v)| scalar_string(&v))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(DecodeError::MissingRequiredField { field: plugin::KEY_SCRIPT_ID })?;

    let name = take(&mut fields, NAME)
        .and_then(|(_, v)| scalar_string(&v))
        .unwrap_or_default();

    let family = take(&mut fields, FAMILY)
        .and_then(|(_, v)| scalar_string(&v))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FAMILY.to_string());

    let severity = match take(&mut fields, SEVERITY) {
        None => Severity::Unknown,
        Some((key, value)) => {
            let text = scalar_string(&value).unwrap_or_default();
            Severity::parse(&text).ok_or_else(|| DecodeError::InvalidField {
                field: key,
                detail: format!("unrecognized severity {:?}", text),
            })?
        }
    };

    let published_date = take_date(&mut fields, PUBLISHED)?;
    let modified_date = take_date(&mut fields, MODIFIED)?;

    Ok(Plugin {
        script_id,
        name,
        family,
        severity,
        published_date,
        modified_date,
        raw_fields: fields,
    })
}

/// Remove the first non-null alias and return it with its key. Null aliases
/// are dropped so they never reach `raw_fields`.
fn take(fields: &mut Map<String, Value>, aliases: &[&str]) -> Option<(String, Value)> {
    let mut found = None;
    for key in aliases {
        match fields.get(*key) {
            Some(Value::Null) => {
                fields.remove(*key);
            }
            Some(_) if found.is_none() => {
                found = fields.remove(*key).map(|v| (key.to_string(), v));
            }
            _ => {}
        }
    }
    found
}

fn take_date(
    fields: &mut Map<String, Value>,
    aliases: &[&str],
) -> Result<Option<NaiveDate>, DecodeError> {
    let Some((key, value)) = take(fields, aliases) else {
        return Ok(None);
    };
    let text = scalar_string(&value).unwrap_or_default();
    if text.trim().is_empty() {
        return Ok(None);
    }
    parse_date(&text).map(Some).ok_or_else(|| DecodeError::InvalidField {
        field: key,
        detail: format!("unparsable date {:?}", text),
    })
}

/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD`, or a timestamp starting with either.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let head: String = text.trim().chars().take(10).collect();
    NaiveDate::parse_from_str(&head.replace('/', "-"), "%Y-%m-%d").ok()
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
