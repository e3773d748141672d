// Documents - JSON object payloads exchanged with the storage driver

use crate::error::{ModelGateError, Result};
use serde::Serialize;
use serde_json::{Map, Value};

/// A stored document, filter, update or option bag.
pub type Document = Map<String, Value>;

/// Convert any serializable value into a document. Fails unless the value
/// serializes to a JSON object.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(ModelGateError::Other(format!(
            "Expected a document (JSON object), got {}",
            type_name(&other)
        ))),
    }
}

/// Shallow merge: every field of `document` wins over the same field in `defaults`.
pub fn merge_defaults(defaults: &Document, document: Document) -> Document {
    let mut merged = defaults.clone();
    merged.extend(document);
    merged
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
