//! Tag/attribute encoded entries (`<nasl>` blocks of the plugin feed).
//!
//! The element is folded into a JSON-like tree:
//! - root attributes and child elements become fields
//! - text-only children become strings, nested children become objects
//! - repeated tags become arrays
//! - `<attributes><attribute><name/><value/></attribute></attributes>` is
//!   flattened into `name → value` fields

use crate::error::DecodeError;
use crate::feed::types::Encoding;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

const ATTRIBUTES_BLOCK: &str = "attributes";

struct Frame {
    attrs: Map<String, Value>,
    children: Map<String, Value>,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<(String, Self), DecodeError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attrs = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| malformed(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| malformed(e.to_string()))?;
            attrs.insert(key, Value::String(value.into_owned()));
        }
        Ok((name, Self { attrs, children: Map::new(), text: String::new() }))
    }

    /// Value of a non-root element.
    fn into_value(self) -> Value {
        if self.attrs.is_empty() && self.children.is_empty() {
            return Value::String(self.text.trim().to_string());
        }
        let mut obj = Map::new();
        for (k, v) in self.attrs {
            obj.insert(format!("@{}", k), v);
        }
        obj.extend(self.children);
        let text = self.text.trim();
        if !text.is_empty() {
            obj.insert("#text".into(), Value::String(text.to_string()));
        }
        Value::Object(obj)
    }
}

fn insert_child(children: &mut Map<String, Value>, name: String, value: Value) {
    match children.get_mut(&name) {
        None => {
            children.insert(name, value);
        }
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

/// Flat field map of one XML entry.
pub fn fields(body: &str) -> Result<Map<String, Value>, DecodeError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<(String, Frame)> = Vec::new();
    let mut root: Option<Frame> = None;

    loop {
        let event = reader.read_event().map_err(|e| malformed(e.to_string()))?;
        match event {
            Event::Start(start) => {
                if root.is_some() {
                    return Err(malformed("content after the root element".into()));
                }
                stack.push(Frame::open(&start)?);
            }
            Event::Empty(start) => {
                if root.is_some() {
                    return Err(malformed("content after the root element".into()));
                }
                let (name, frame) = Frame::open(&start)?;
                match stack.last_mut() {
                    Some((_, parent)) => insert_child(&mut parent.children, name, frame.into_value()),
                    None => root = Some(frame),
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| malformed(e.to_string()))?;
                if let Some((_, frame)) = stack.last_mut() {
                    frame.text.push_str(&text);
                } else if !text.trim().is_empty() {
                    return Err(malformed("text outside of an element".into()));
                }
            }
            Event::CData(data) => {
                if let Some((_, frame)) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let Some((name, frame)) = stack.pop() else {
                    return Err(malformed("unbalanced closing tag".into()));
                };
                match stack.last_mut() {
                    Some((_, parent)) => insert_child(&mut parent.children, name, frame.into_value()),
                    None => root = Some(frame),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(malformed("unexpected end of entry".into()));
    }
    let root = root.ok_or_else(|| malformed("entry has no element".into()))?;
    Ok(flatten_root(root))
}

fn flatten_root(root: Frame) -> Map<String, Value> {
    let mut fields = root.attrs;
    for (name, value) in root.children {
        if name == ATTRIBUTES_BLOCK {
            if let Some(pairs) = attribute_pairs(&value) {
                for (k, v) in pairs {
                    insert_child(&mut fields, k, v);
                }
                continue;
            }
        }
        insert_child(&mut fields, name, value);
    }
    fields
}

/// `{"attribute": [{"name": .., "value": ..}, ..]}` → name/value pairs.
fn attribute_pairs(block: &Value) -> Option<Vec<(String, Value)>> {
    let items = match block.get("attribute")? {
        Value::Array(items) => items.clone(),
        single => vec![single.clone()],
    };
    items
        .into_iter()
        .map(|item| {
            let name = item.get("name")?.as_str()?.to_string();
            let value = item.get("value").cloned().unwrap_or(Value::String(String::new()));
            Some((name, value))
        })
        .collect()
}

fn malformed(detail: String) -> DecodeError {
    DecodeError::MalformedEntry {
        encoding: Encoding::Xml,
        detail,
    }
}
