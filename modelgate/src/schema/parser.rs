use crate::error::Result;
use super::types::FieldSchema;
use std::path::Path;

/// Parse a collection schema from a YAML (or JSON) file
pub fn parse_field_schema(path: &Path) -> Result<FieldSchema> {
    let content = std::fs::read_to_string(path)?;
    parse_field_schema_str(&content)
}

/// Parse a collection schema from a YAML (or JSON) string
pub fn parse_field_schema_str(content: &str) -> Result<FieldSchema> {
    let schema: FieldSchema = serde_yaml::from_str(content)?;
    Ok(schema)
}
