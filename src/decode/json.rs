use crate::error::DecodeError;
use crate::feed::types::Encoding;
use serde_json::{Map, Value};

/// Flat field map of a JSON entry. Search-API hits wrap the record in `_source`.
pub fn fields(body: &str) -> Result<Map<String, Value>, DecodeError> {
    let value: Value = serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(malformed("entry is not a JSON object".into()));
    };
    if let Some(Value::Object(_)) = obj.get("_source") {
        if let Some(Value::Object(inner)) = obj.remove("_source") {
            obj = inner;
        }
    }
    Ok(obj)
}

fn malformed(detail: String) -> DecodeError {
    DecodeError::MalformedEntry {
        encoding: Encoding::Json,
        detail,
    }
}
