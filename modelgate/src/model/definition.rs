use super::operation::OperationKind;
use crate::document::Document;
use crate::driver::IndexSpec;
use crate::error::{ModelGateError, Result};
use crate::schema::FieldSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Everything needed to register a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefinition {
    pub collection_name: String,
    pub schema: FieldSchema,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_operations: Vec<OperationKind>,
    #[serde(default, skip_serializing_if = "Document::is_empty")]
    pub document_defaults: Document,
    /// Grant the standard CRUD preset instead of `allowed_operations`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub validity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_query_expressions: Option<Document>,
}

impl ModelDefinition {
    pub fn new(collection_name: &str, schema: FieldSchema) -> Self {
        ModelDefinition {
            collection_name: collection_name.to_string(),
            schema,
            indexes: Vec::new(),
            allowed_operations: Vec::new(),
            document_defaults: Document::new(),
            validity: false,
            validation_query_expressions: None,
        }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn allow(mut self, operations: &[OperationKind]) -> Self {
        self.allowed_operations.extend_from_slice(operations);
        self
    }

    pub fn with_defaults(mut self, defaults: Document) -> Self {
        self.document_defaults = defaults;
        self
    }

    pub fn with_validity(mut self, validity: bool) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_query_expressions(mut self, expressions: Document) -> Self {
        self.validation_query_expressions = Some(expressions);
        self
    }

    /// The allow-list the model is gated with.
    pub fn effective_operations(&self) -> BTreeSet<OperationKind> {
        if self.validity {
            OperationKind::validity_preset()
        } else {
            self.allowed_operations.iter().copied().collect()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelFile {
    models: Vec<ModelDefinition>,
}

/// Parse a model file (`models: [ ... ]`, YAML or JSON).
pub fn parse_model_file(path: &Path) -> Result<Vec<ModelDefinition>> {
    let content = std::fs::read_to_string(path)?;
    parse_model_file_str(&content)
}

pub fn parse_model_file_str(content: &str) -> Result<Vec<ModelDefinition>> {
    let file: ModelFile = serde_yaml::from_str(content)?;

    let mut seen = HashSet::new();
    for model in &file.models {
        if model.collection_name.trim().is_empty() {
            return Err(ModelGateError::Schema(
                "Model definition has an empty collectionName".into(),
            ));
        }
        if !seen.insert(model.collection_name.as_str()) {
            return Err(ModelGateError::Schema(format!(
                "Collection '{}' is defined more than once",
                model.collection_name
            )));
        }
    }

    Ok(file.models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BsonType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const MODELS: &str = r#"
models:
  - collectionName: users
    validity: true
    schema:
      bsonType: object
      properties:
        username: { bsonType: string }
        password: { bsonType: string }
      required: [username]
    indexes:
      - key: { username: 1 }
        unique: true
    documentDefaults:
      role: member

  - collectionName: audit
    allowedOperations: [insert, aggregate]
    schema:
      bsonType: object
      properties:
        action: { bsonType: string }
    validationQueryExpressions:
      action: { $in: [login, logout] }
"#;

    #[test]
    fn test_parse_model_file() {
        let models = parse_model_file_str(MODELS).unwrap();
        assert_eq!(models.len(), 2);

        let users = &models[0];
        assert_eq!(users.collection_name, "users");
        assert!(users.validity);
        assert_eq!(users.indexes.len(), 1);
        assert!(users.indexes[0].unique);
        assert_eq!(users.document_defaults["role"], "member");
        assert_eq!(users.schema.bson_type, Some(BsonType::Object.into()));

        let audit = &models[1];
        assert_eq!(
            audit.allowed_operations,
            vec![OperationKind::Insert, OperationKind::Aggregate]
        );
        assert_eq!(
            audit.validation_query_expressions.as_ref().unwrap()["action"],
            json!({ "$in": ["login", "logout"] })
        );
    }

    #[test]
    fn test_effective_operations() {
        let models = parse_model_file_str(MODELS).unwrap();
        assert_eq!(models[0].effective_operations(), OperationKind::validity_preset());
        assert_eq!(
            models[1].effective_operations().into_iter().collect::<Vec<_>>(),
            vec![OperationKind::Aggregate, OperationKind::Insert]
        );

        let closed = ModelDefinition::new("empty", FieldSchema::of(BsonType::Object));
        assert!(closed.effective_operations().is_empty());
    }

    #[test]
    fn test_validity_overrides_allowed_list() {
        let def = ModelDefinition::new("x", FieldSchema::of(BsonType::Object))
            .allow(&[OperationKind::Aggregate])
            .with_validity(true);
        assert!(!def.effective_operations().contains(&OperationKind::Aggregate));
    }

    #[test]
    fn test_duplicate_collection_rejected() {
        let yaml = r#"
models:
  - collectionName: a
    schema: { bsonType: object }
  - collectionName: a
    schema: { bsonType: object }
"#;
        let err = parse_model_file_str(yaml).unwrap_err();
        assert!(err.to_string().contains("defined more than once"));
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let yaml = r#"
models:
  - collectionName: a
    allowedOperations: [upsert]
    schema: { bsonType: object }
"#;
        assert!(parse_model_file_str(yaml).is_err());
    }
}
