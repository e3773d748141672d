use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelGateError {
    #[error("The operation \"{operation}\" is not allowed in \"{collection}\"")]
    PermissionDenied { operation: String, collection: String },

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Not connected to a database")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate key on index '{index}' in '{collection}'")]
    DuplicateKey { collection: String, index: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ModelGateError>;

/// Serialized form of a driver failure, attached to `ModelGateError::Storage`.
#[derive(Debug, Serialize)]
struct StorageCause<'a> {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection: Option<&'a str>,
}

impl ModelGateError {
    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelGateError::PermissionDenied { .. } => "permission_denied",
            ModelGateError::Storage(_) => "storage",
            ModelGateError::InvalidIdentifier(_) => "invalid_identifier",
            ModelGateError::Hook(_) => "hook",
            ModelGateError::NotConnected => "not_connected",
            ModelGateError::Config(_) => "config",
            ModelGateError::Schema(_) => "schema",
            ModelGateError::Query(_) => "query",
            ModelGateError::Validation(_) => "validation",
            ModelGateError::DuplicateKey { .. } => "duplicate_key",
            ModelGateError::Io(_) => "io",
            ModelGateError::Yaml(_) => "yaml",
            ModelGateError::Json(_) => "json",
            ModelGateError::Sqlite(_) => "sqlite",
            #[cfg(feature = "mongodb")]
            ModelGateError::Mongo(_) => "mongodb",
            ModelGateError::Other(_) => "other",
        }
    }

    /// Wrap a driver-level failure into a single `Storage` error carrying the
    /// JSON-serialized cause. Errors that are already `Storage` are kept as is.
    pub fn into_storage(self, collection: &str) -> ModelGateError {
        if let ModelGateError::Storage(_) = self {
            return self;
        }
        let cause = StorageCause {
            kind: self.kind(),
            message: self.to_string(),
            collection: Some(collection),
        };
        let serialized = serde_json::to_string_pretty(&cause).unwrap_or_else(|_| cause.message.clone());
        ModelGateError::Storage(serialized)
    }
}
