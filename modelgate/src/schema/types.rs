use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A single field descriptor in a collection schema. Object descriptors nest
/// further descriptors under `properties`, arrays describe their elements in `items`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bson_type: Option<BsonTypes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, FieldSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    /// Any other JSON-schema keyword (bounds, title, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `bsonType` may be a single type name or a list of alternatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BsonTypes {
    One(BsonType),
    Many(Vec<BsonType>),
}

impl BsonTypes {
    pub fn contains(&self, ty: &BsonType) -> bool {
        match self {
            BsonTypes::One(t) => t == ty,
            BsonTypes::Many(ts) => ts.contains(ty),
        }
    }

    pub fn as_slice(&self) -> &[BsonType] {
        match self {
            BsonTypes::One(t) => std::slice::from_ref(t),
            BsonTypes::Many(ts) => ts,
        }
    }
}

impl From<BsonType> for BsonTypes {
    fn from(ty: BsonType) -> Self {
        BsonTypes::One(ty)
    }
}

/// Value-kind tags understood by the document validator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BsonType {
    Object,
    Array,
    String,
    Int,
    Long,
    Double,
    Decimal,
    Number,
    Bool,
    Date,
    ObjectId,
    Null,
    #[serde(untagged)]
    Other(std::string::String),
}

impl FieldSchema {
    /// Descriptor with only a kind tag set.
    pub fn of(ty: BsonType) -> Self {
        FieldSchema {
            bson_type: Some(ty.into()),
            ..Default::default()
        }
    }

    pub fn with_required(mut self, fields: &[&str]) -> Self {
        self.required = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn is_object(&self) -> bool {
        self.bson_type
            .as_ref()
            .map(|t| t.contains(&BsonType::Object))
            .unwrap_or(false)
    }

    /// Numeric keyword from the free-form metadata (`minimum`, `maxLength`, ...).
    pub fn keyword_f64(&self, name: &str) -> Option<f64> {
        self.extra.get(name).and_then(Value::as_f64)
    }
}
