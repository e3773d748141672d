// Document identity - ObjectId normalization and extended-JSON helpers

use crate::error::{ModelGateError, Result};
use serde_json::Value;

pub use bson::oid::ObjectId;

/// Reserved identity field carried by every validated document.
pub const ID_FIELD: &str = "_id";

/// Parse a 24-character hex string, failing with `InvalidIdentifier`.
pub fn parse_object_id(s: &str) -> Result<ObjectId> {
    ObjectId::parse_str(s).map_err(|e| ModelGateError::InvalidIdentifier(format!("'{s}': {e}")))
}

/// Anything a caller may hand to `find_by_id`.
#[derive(Debug, Clone)]
pub enum IdInput {
    Id(ObjectId),
    Text(String),
    Json(Value),
}

impl From<ObjectId> for IdInput {
    fn from(id: ObjectId) -> Self {
        IdInput::Id(id)
    }
}

impl From<&str> for IdInput {
    fn from(s: &str) -> Self {
        IdInput::Text(s.to_string())
    }
}

impl From<String> for IdInput {
    fn from(s: String) -> Self {
        IdInput::Text(s)
    }
}

impl From<Value> for IdInput {
    fn from(v: Value) -> Self {
        IdInput::Json(v)
    }
}

impl From<&Value> for IdInput {
    fn from(v: &Value) -> Self {
        IdInput::Json(v.clone())
    }
}

impl IdInput {
    /// Convert to the identity type, failing with `InvalidIdentifier`.
    pub fn normalize(&self) -> Result<ObjectId> {
        match self {
            IdInput::Id(id) => Ok(*id),
            IdInput::Text(s) => parse_object_id(s),
            IdInput::Json(v) => normalize_id(v),
        }
    }
}

/// Normalize a JSON value (`{"$oid": ..}` or a hex string) to an `ObjectId`.
pub fn normalize_id(value: &Value) -> Result<ObjectId> {
    match value {
        Value::String(s) => parse_object_id(s),
        Value::Object(map) => match map.get("$oid") {
            Some(Value::String(s)) if map.len() == 1 => parse_object_id(s),
            _ => Err(ModelGateError::InvalidIdentifier(value.to_string())),
        },
        other => Err(ModelGateError::InvalidIdentifier(other.to_string())),
    }
}

/// Extended-JSON helpers for values that plain JSON cannot tag.
pub mod ext_json {
    use super::ObjectId;
    use bson::Bson;
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde_json::{json, Value};

    /// `{ "$date": "<rfc3339>" }`
    pub fn date(at: DateTime<Utc>) -> Value {
        json!({ "$date": at.to_rfc3339_opts(SecondsFormat::Millis, true) })
    }

    /// `{ "$oid": "<hex>" }`
    pub fn oid(id: ObjectId) -> Value {
        Bson::ObjectId(id).into_relaxed_extjson()
    }

    /// Parse a `$date` document back into a timestamp.
    pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        let raw = map.get("$date")?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    }

    /// Read an identifier back from `{ "$oid": "<hex>" }`.
    pub fn as_oid(value: &Value) -> Option<ObjectId> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        ObjectId::parse_str(map.get("$oid")?.as_str()?).ok()
    }

    pub fn is_oid(value: &Value) -> bool {
        as_oid(value).is_some()
    }

    pub fn is_date(value: &Value) -> bool {
        as_date(value).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_renders_extended_json() {
        let id = parse_object_id("65a1f0c2e4b0a1b2c3d4e5f6").unwrap();
        assert_eq!(id.to_hex(), "65a1f0c2e4b0a1b2c3d4e5f6");
        assert_eq!(ext_json::oid(id), json!({ "$oid": "65a1f0c2e4b0a1b2c3d4e5f6" }));
        assert_eq!(ext_json::as_oid(&ext_json::oid(id)), Some(id));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            parse_object_id("not-a-valid-id"),
            Err(ModelGateError::InvalidIdentifier(_))
        ));
        assert!(parse_object_id("zzzzzzzzzzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn test_normalize_inputs() {
        let id = ObjectId::new();
        assert_eq!(IdInput::from(id).normalize().unwrap(), id);
        assert_eq!(IdInput::from(id.to_hex()).normalize().unwrap(), id);
        assert_eq!(IdInput::from(ext_json::oid(id)).normalize().unwrap(), id);
        assert!(IdInput::from(json!(42)).normalize().is_err());
        assert!(IdInput::from(json!({ "$oid": "abc" })).normalize().is_err());
        assert!(IdInput::from(json!({ "$oid": id.to_hex(), "x": 1 })).normalize().is_err());
    }

    #[test]
    fn test_serde_uses_extended_json() {
        let id = parse_object_id("65a1f0c2e4b0a1b2c3d4e5f6").unwrap();
        let value = serde_json::to_value(id).unwrap();
        assert_eq!(value, json!({ "$oid": "65a1f0c2e4b0a1b2c3d4e5f6" }));
    }

    #[test]
    fn test_ext_json_date() {
        let at = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let value = ext_json::date(at);
        assert_eq!(value, json!({ "$date": "2024-01-02T03:04:05.000Z" }));
        assert_eq!(ext_json::as_date(&value), Some(at));
        assert!(!ext_json::is_date(&json!("2024-01-02")));
        assert!(!ext_json::is_oid(&json!("65a1f0c2e4b0a1b2c3d4e5f6")));
    }
}
