use crate::document::{type_name, Document};
use crate::error::{ModelGateError, Result};
use crate::id::ext_json;
use crate::query;
use crate::schema::{BsonType, FieldSchema, ValidationAction, ValidationDescriptor, ValidationLevel};
use regex::Regex;
use serde_json::Value;

/// Result of validating a document
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Validate a document against a collection's validation descriptor.
/// With `validationAction: error` every violation is an error; with `warn`
/// violations are reported as warnings only.
pub fn validate_document(descriptor: &ValidationDescriptor, doc: &Document) -> Result<ValidationResult> {
    let mut result = ValidationResult::default();
    if descriptor.validation_level == ValidationLevel::Off {
        return Ok(result);
    }

    let strict = descriptor.validation_action == ValidationAction::Error;
    let mut issues = Vec::new();
    check_object(&descriptor.validator.json_schema, doc, "", &mut issues);

    if !descriptor.validator.expressions.is_empty()
        && !query::matches(doc, &descriptor.validator.expressions)?
    {
        issues.push("Document does not satisfy the validator query expressions".to_string());
    }

    for issue in issues {
        if strict {
            result.errors.push(issue);
        } else {
            result.warnings.push(issue);
        }
    }
    Ok(result)
}

/// Validate and fail with `ModelGateError::Validation` if the document is rejected.
/// Returns the warnings collected under a `warn` action.
pub fn enforce(descriptor: &ValidationDescriptor, doc: &Document) -> Result<Vec<String>> {
    let result = validate_document(descriptor, doc)?;

    if !result.is_ok() {
        return Err(ModelGateError::Validation(format!(
            "Document failed validation:\n  - {}",
            result.errors.join("\n  - ")
        )));
    }

    Ok(result.warnings)
}

fn field_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

fn label(path: &str) -> String {
    if path.is_empty() {
        "Document".to_string()
    } else {
        format!("Field '{path}'")
    }
}

fn check_object(schema: &FieldSchema, obj: &Document, path: &str, issues: &mut Vec<String>) {
    for required in schema.required.iter().flatten() {
        if !obj.contains_key(required) {
            issues.push(format!(
                "Required field '{}' is missing",
                field_path(path, required)
            ));
        }
    }

    let properties = schema.properties.as_ref();
    if let Some(properties) = properties {
        for (name, field) in properties {
            if let Some(value) = obj.get(name) {
                check_value(field, value, &field_path(path, name), issues);
            }
        }
    }

    if schema.additional_properties == Some(false) {
        for key in obj.keys() {
            let declared = properties.map(|p| p.contains_key(key)).unwrap_or(false);
            if !declared {
                issues.push(format!(
                    "Unexpected field '{}' (additionalProperties is false)",
                    field_path(path, key)
                ));
            }
        }
    }
}

fn check_value(schema: &FieldSchema, value: &Value, path: &str, issues: &mut Vec<String>) {
    if let Some(types) = &schema.bson_type {
        if !types.as_slice().iter().any(|t| is_kind(t, value)) {
            let expected: Vec<String> = types.as_slice().iter().map(kind_name).collect();
            issues.push(format!(
                "{} expected {}, got {}",
                label(path),
                expected.join(" or "),
                value_kind(value)
            ));
            return;
        }
    }

    if let Some(allowed) = &schema.enum_values {
        if !allowed.iter().any(|a| query::values_equal(a, value)) {
            issues.push(format!("{} value {value} is not in enum", label(path)));
        }
    }

    match value {
        Value::String(s) => check_string(schema, s, path, issues),
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or_default();
            if let Some(min) = schema.keyword_f64("minimum") {
                if n < min {
                    issues.push(format!("{} must be >= {min}", label(path)));
                }
            }
            if let Some(max) = schema.keyword_f64("maximum") {
                if n > max {
                    issues.push(format!("{} must be <= {max}", label(path)));
                }
            }
        }
        Value::Array(items) => {
            if let Some(min) = schema.keyword_f64("minItems") {
                if (items.len() as f64) < min {
                    issues.push(format!("{} needs at least {min} items", label(path)));
                }
            }
            if let Some(max) = schema.keyword_f64("maxItems") {
                if (items.len() as f64) > max {
                    issues.push(format!("{} allows at most {max} items", label(path)));
                }
            }
            if let Some(item_schema) = &schema.items {
                for (i, item) in items.iter().enumerate() {
                    check_value(item_schema, item, &format!("{path}.{i}"), issues);
                }
            }
        }
        Value::Object(map) if !ext_json::is_oid(value) && !ext_json::is_date(value) => {
            check_object(schema, map, path, issues);
        }
        _ => {}
    }
}

fn check_string(schema: &FieldSchema, s: &str, path: &str, issues: &mut Vec<String>) {
    let len = s.chars().count() as f64;
    if let Some(min) = schema.keyword_f64("minLength") {
        if len < min {
            issues.push(format!("{} must be at least {min} characters", label(path)));
        }
    }
    if let Some(max) = schema.keyword_f64("maxLength") {
        if len > max {
            issues.push(format!("{} must be at most {max} characters", label(path)));
        }
    }

    if let Some(pattern) = &schema.pattern {
        match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(s) {
                    issues.push(format!(
                        "{} value '{s}' does not match pattern '{pattern}'",
                        label(path)
                    ));
                }
            }
            Err(e) => issues.push(format!("{} has an invalid pattern: {e}", label(path))),
        }
    }
}

fn is_kind(ty: &BsonType, value: &Value) -> bool {
    match ty {
        BsonType::Object => {
            value.is_object() && !ext_json::is_oid(value) && !ext_json::is_date(value)
        }
        BsonType::Array => value.is_array(),
        BsonType::String => value.is_string(),
        BsonType::Int | BsonType::Long => value.is_i64() || value.is_u64(),
        BsonType::Double | BsonType::Decimal | BsonType::Number => value.is_number(),
        BsonType::Bool => value.is_boolean(),
        BsonType::Date => ext_json::is_date(value),
        BsonType::ObjectId => ext_json::is_oid(value),
        BsonType::Null => value.is_null(),
        // Unknown type names cannot be checked locally.
        BsonType::Other(_) => true,
    }
}

fn kind_name(ty: &BsonType) -> String {
    match serde_json::to_value(ty) {
        Ok(Value::String(s)) => s,
        _ => format!("{ty:?}"),
    }
}

fn value_kind(value: &Value) -> &'static str {
    if ext_json::is_oid(value) {
        "objectId"
    } else if ext_json::is_date(value) {
        "date"
    } else {
        type_name(value)
    }
}
