use super::types::FieldSchema;

/// Close every object descriptor in the tree: `additionalProperties` becomes
/// `false` unless it was explicitly set to `true`. Array item descriptors are
/// visited before nested properties.
pub fn close_schema(mut schema: FieldSchema) -> FieldSchema {
    close_in_place(&mut schema);
    schema
}

/// In-place variant of [`close_schema`].
pub fn close_in_place(schema: &mut FieldSchema) {
    if schema.is_object() && schema.additional_properties != Some(true) {
        schema.additional_properties = Some(false);
    }

    if let Some(items) = schema.items.as_deref_mut() {
        close_in_place(items);
    }

    if let Some(properties) = schema.properties.as_mut() {
        for field in properties.values_mut() {
            close_in_place(field);
        }
    }
}
