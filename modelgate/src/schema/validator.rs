use super::transform::close_schema;
use super::types::{BsonType, FieldSchema};
use crate::id::ID_FIELD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const ID_DESCRIPTION: &str = "Unique identifier of the document";

/// What the store does with a document that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationAction {
    Error,
    Warn,
}

/// Which writes validation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    Strict,
    Moderate,
    Off,
}

/// The `validator` object: the closed `$jsonSchema` plus any extra query
/// expressions merged verbatim at the same level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    #[serde(rename = "$jsonSchema")]
    pub json_schema: FieldSchema,
    #[serde(flatten)]
    pub expressions: Map<String, Value>,
}

/// Everything pushed to the store for collection-level validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDescriptor {
    pub validator: Validator,
    pub validation_action: ValidationAction,
    pub validation_level: ValidationLevel,
}

impl ValidationDescriptor {
    /// Build the descriptor for a collection schema. The top level is always a
    /// closed object carrying the identity field; the action and level are fixed.
    pub fn build(schema: FieldSchema, expressions: Option<Map<String, Value>>) -> Self {
        let closed = close_schema(schema);

        let mut properties = closed.properties.unwrap_or_default();
        properties.insert(
            ID_FIELD.to_string(),
            FieldSchema::of(BsonType::ObjectId).with_description(ID_DESCRIPTION),
        );

        let mut required = closed.required.unwrap_or_default();
        if !required.iter().any(|f| f == ID_FIELD) {
            required.push(ID_FIELD.to_string());
        }

        let json_schema = FieldSchema {
            bson_type: Some(BsonType::Object.into()),
            properties: Some(properties),
            items: None,
            required: Some(required),
            additional_properties: Some(false),
            description: closed.description,
            pattern: closed.pattern,
            enum_values: closed.enum_values,
            extra: closed.extra,
        };

        ValidationDescriptor {
            validator: Validator {
                json_schema,
                expressions: expressions.unwrap_or_default(),
            },
            validation_action: ValidationAction::Error,
            validation_level: ValidationLevel::Strict,
        }
    }

    pub fn json_schema(&self) -> &FieldSchema {
        &self.validator.json_schema
    }

    pub fn required(&self) -> &[String] {
        self.validator
            .json_schema
            .required
            .as_deref()
            .unwrap_or_default()
    }

    /// The descriptor as the JSON document handed to the store.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
