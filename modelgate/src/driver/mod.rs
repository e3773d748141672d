// Storage driver interface - the collection-level operations the model layer
// dispatches to. `EmbeddedDriver` is always available; `MongoDriver` comes
// with the `mongodb` feature.

mod embedded;
mod handle;
#[cfg(feature = "mongodb")]
mod mongo;

pub use embedded::EmbeddedDriver;
pub use handle::DriverHandle;
#[cfg(feature = "mongodb")]
pub use mongo::MongoDriver;

use crate::document::Document;
use crate::error::Result;
use crate::id::ObjectId;
use crate::schema::ValidationDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const MONGO_SCHEMES: [&str; 2] = ["mongodb://", "mongodb+srv://"];

pub fn is_mongo_uri(uri: &str) -> bool {
    MONGO_SCHEMES.iter().any(|scheme| uri.starts_with(scheme))
}

/// Open the driver a connection string addresses: `mongodb://` and
/// `mongodb+srv://` go to MongoDB, `embedded://` to the SQLite driver.
pub async fn open(uri: &str, db_name: &str) -> Result<Arc<dyn StorageDriver>> {
    if is_mongo_uri(uri) {
        return open_mongo(uri, db_name).await;
    }
    Ok(Arc::new(EmbeddedDriver::from_uri(uri, db_name)?))
}

#[cfg(feature = "mongodb")]
async fn open_mongo(uri: &str, db_name: &str) -> Result<Arc<dyn StorageDriver>> {
    Ok(Arc::new(MongoDriver::connect(uri, db_name).await?))
}

#[cfg(not(feature = "mongodb"))]
async fn open_mongo(_uri: &str, _db_name: &str) -> Result<Arc<dyn StorageDriver>> {
    Err(crate::error::ModelGateError::Config(
        "MongoDB connection strings need modelgate built with the `mongodb` feature".into(),
    ))
}

// ── Options ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOneOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bypass_document_validation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertManyOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bypass_document_validation: bool,
    /// Stop at the first failing document (the default) or keep going.
    #[serde(default = "default_true")]
    pub ordered: bool,
}

impl Default for InsertManyOptions {
    fn default() -> Self {
        InsertManyOptions {
            bypass_document_validation: false,
            ordered: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Document>,
}

impl FindOptions {
    pub fn sorted(sort: Document) -> Self {
        FindOptions {
            sort: Some(sort),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnDocument {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOneAndUpdateOptions {
    #[serde(default)]
    pub return_document: ReturnDocument,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub upsert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub upsert: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOneAndDeleteOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteOptions {
    #[serde(default = "default_true")]
    pub ordered: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bypass_document_validation: bool,
}

impl Default for BulkWriteOptions {
    fn default() -> Self {
        BulkWriteOptions {
            ordered: true,
            bypass_document_validation: false,
        }
    }
}

fn default_true() -> bool {
    true
}

// ── Bulk write models ──────────────────────────────────────────────

/// One entry of a bulk write, serialized as `{ insertOne: { document } }` etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteModel {
    InsertOne {
        document: Document,
    },
    UpdateOne {
        filter: Document,
        update: Document,
        #[serde(default)]
        upsert: bool,
    },
    UpdateMany {
        filter: Document,
        update: Document,
        #[serde(default)]
        upsert: bool,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        #[serde(default)]
        upsert: bool,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

// ── Results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOneResult {
    pub inserted_id: ObjectId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertManyResult {
    pub inserted_ids: Vec<ObjectId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upserted_id: Option<ObjectId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub deleted_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteResult {
    pub inserted_count: u64,
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub upserted_count: u64,
    pub inserted_ids: Vec<ObjectId>,
}

// ── Indexes ────────────────────────────────────────────────────────

/// An index declaration: `{ key: { field: 1 }, name, unique }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub key: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sparse: bool,
}

impl IndexSpec {
    pub fn new(key: Document) -> Self {
        IndexSpec {
            key,
            name: None,
            unique: false,
            sparse: false,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// The explicit name, or the conventional `field_1_other_-1` form.
    pub fn resolved_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.key
            .iter()
            .map(|(field, dir)| match dir {
                Value::Number(n) => format!("{field}_{n}"),
                Value::String(s) => format!("{field}_{s}"),
                other => format!("{field}_{other}"),
            })
            .collect::<Vec<_>>()
            .join("_")
    }
}

// ── Driver ─────────────────────────────────────────────────────────

/// Collection-level operations of a document store.
///
/// Implementations own their connection state; callers borrow a driver for
/// the duration of a single call. Errors are reported with the crate error
/// type and are wrapped by the model layer before reaching callers.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        options: &InsertOneOptions,
    ) -> Result<InsertOneResult>;

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        options: &InsertManyOptions,
    ) -> Result<InsertManyResult>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Option<Document>>;

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>>;

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>>;

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> Result<UpdateResult>;

    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOneAndDeleteOptions,
    ) -> Result<Option<Document>>;

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Document,
        options: &DeleteOptions,
    ) -> Result<DeleteResult>;

    async fn count_documents(
        &self,
        collection: &str,
        filter: &Document,
        options: &CountOptions,
    ) -> Result<u64>;

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
        options: &AggregateOptions,
    ) -> Result<Vec<Document>>;

    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteModel>,
        options: &BulkWriteOptions,
    ) -> Result<BulkWriteResult>;

    async fn create_collection(&self, collection: &str) -> Result<()>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn drop_indexes(&self, collection: &str) -> Result<()>;

    /// Create an index and return its name.
    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String>;

    /// Attach (or replace) the collection's validator, like `collMod`.
    async fn set_validator(&self, collection: &str, descriptor: &ValidationDescriptor) -> Result<()>;

    async fn begin_transaction(&self) -> Result<()>;

    async fn commit_transaction(&self) -> Result<()>;

    async fn abort_transaction(&self) -> Result<()>;

    /// Database-level statistics.
    async fn stats(&self) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_write_model_wire_shape() {
        let op = WriteModel::InsertOne {
            document: json!({ "name": "a" }).as_object().unwrap().clone(),
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({ "insertOne": { "document": { "name": "a" } } })
        );

        let parsed: WriteModel = serde_json::from_value(json!({
            "updateOne": { "filter": { "name": "a" }, "update": { "$set": { "x": 1 } } }
        }))
        .unwrap();
        assert!(matches!(parsed, WriteModel::UpdateOne { upsert: false, .. }));
    }

    #[test]
    fn test_index_names() {
        let key = json!({ "username": 1, "mail": -1 }).as_object().unwrap().clone();
        assert_eq!(IndexSpec::new(key.clone()).resolved_name(), "username_1_mail_-1");
        assert_eq!(
            IndexSpec::new(key).named("unique_username_mail").resolved_name(),
            "unique_username_mail"
        );
    }

    #[test]
    fn test_scheme_detection() {
        assert!(is_mongo_uri("mongodb://localhost:27017"));
        assert!(is_mongo_uri("mongodb+srv://cluster0.example.net"));
        assert!(!is_mongo_uri("embedded://:memory:"));
    }

    #[tokio::test]
    async fn test_open_embedded_and_unknown_schemes() {
        let driver = open("embedded://:memory:", "opened").await.unwrap();
        assert!(driver.list_collections().await.unwrap().is_empty());

        let err = open("postgres://localhost", "x").await.err().unwrap();
        assert!(matches!(err, crate::error::ModelGateError::Config(_)));
    }

    #[cfg(not(feature = "mongodb"))]
    #[tokio::test]
    async fn test_mongo_uri_needs_feature() {
        let err = open("mongodb://localhost:27017", "x").await.err().unwrap();
        assert!(err.to_string().contains("mongodb"));
    }

    #[test]
    fn test_options_serialize_compactly() {
        assert_eq!(serde_json::to_value(UpdateOptions::default()).unwrap(), json!({}));
        assert_eq!(
            serde_json::to_value(FindOneAndUpdateOptions::default()).unwrap(),
            json!({ "returnDocument": "after" })
        );
        assert_eq!(
            serde_json::to_value(InsertManyOptions::default()).unwrap(),
            json!({ "ordered": true })
        );
    }
}
