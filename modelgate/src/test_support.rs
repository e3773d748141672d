// Test double: an in-memory embedded driver that records every call it receives.

use crate::document::Document;
use crate::driver::{
    AggregateOptions, BulkWriteOptions, BulkWriteResult, CountOptions, DeleteOptions,
    DeleteResult, EmbeddedDriver, FindOneAndDeleteOptions, FindOneAndUpdateOptions, FindOptions,
    IndexSpec, InsertManyOptions, InsertManyResult, InsertOneOptions, InsertOneResult,
    StorageDriver, UpdateOptions, UpdateResult, WriteModel,
};
use crate::error::Result;
use crate::schema::ValidationDescriptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

/// One recorded driver call. `payload` is the main argument: the document for
/// inserts, the update for updates, the filter for reads and deletes, the
/// pipeline, the operations, the index or the validator.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub method: &'static str,
    pub collection: Option<String>,
    pub payload: Value,
}

pub(crate) struct RecordingDriver {
    inner: EmbeddedDriver,
    calls: Mutex<Vec<Call>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        RecordingDriver {
            inner: EmbeddedDriver::open_in_memory("recording").expect("in-memory database"),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|c| c.method).collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, method: &'static str, collection: Option<&str>, payload: Value) {
        self.calls.lock().push(Call {
            method,
            collection: collection.map(str::to_string),
            payload,
        });
    }
}

fn value<T: serde::Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

#[async_trait]
impl StorageDriver for RecordingDriver {
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        options: &InsertOneOptions,
    ) -> Result<InsertOneResult> {
        self.record("insert_one", Some(collection), Value::Object(document.clone()));
        self.inner.insert_one(collection, document, options).await
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        options: &InsertManyOptions,
    ) -> Result<InsertManyResult> {
        self.record("insert_many", Some(collection), value(&documents));
        self.inner.insert_many(collection, documents, options).await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Option<Document>> {
        self.record("find_one", Some(collection), value(filter));
        self.inner.find_one(collection, filter, options).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        self.record("find", Some(collection), value(filter));
        self.inner.find(collection, filter, options).await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>> {
        self.record("find_one_and_update", Some(collection), value(update));
        self.inner
            .find_one_and_update(collection, filter, update, options)
            .await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        self.record("update_many", Some(collection), value(update));
        self.inner.update_many(collection, filter, update, options).await
    }

    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOneAndDeleteOptions,
    ) -> Result<Option<Document>> {
        self.record("find_one_and_delete", Some(collection), value(filter));
        self.inner.find_one_and_delete(collection, filter, options).await
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Document,
        options: &DeleteOptions,
    ) -> Result<DeleteResult> {
        self.record("delete_many", Some(collection), value(filter));
        self.inner.delete_many(collection, filter, options).await
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: &Document,
        options: &CountOptions,
    ) -> Result<u64> {
        self.record("count_documents", Some(collection), value(filter));
        self.inner.count_documents(collection, filter, options).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
        options: &AggregateOptions,
    ) -> Result<Vec<Document>> {
        self.record("aggregate", Some(collection), value(&pipeline));
        self.inner.aggregate(collection, pipeline, options).await
    }

    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteModel>,
        options: &BulkWriteOptions,
    ) -> Result<BulkWriteResult> {
        self.record("bulk_write", Some(collection), value(&operations));
        self.inner.bulk_write(collection, operations, options).await
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        self.record("create_collection", Some(collection), Value::Null);
        self.inner.create_collection(collection).await
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.record("list_collections", None, Value::Null);
        self.inner.list_collections().await
    }

    async fn drop_indexes(&self, collection: &str) -> Result<()> {
        self.record("drop_indexes", Some(collection), Value::Null);
        self.inner.drop_indexes(collection).await
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String> {
        self.record("create_index", Some(collection), value(index));
        self.inner.create_index(collection, index).await
    }

    async fn set_validator(&self, collection: &str, descriptor: &ValidationDescriptor) -> Result<()> {
        self.record("set_validator", Some(collection), descriptor.to_value());
        self.inner.set_validator(collection, descriptor).await
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.record("begin_transaction", None, Value::Null);
        self.inner.begin_transaction().await
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.record("commit_transaction", None, Value::Null);
        self.inner.commit_transaction().await
    }

    async fn abort_transaction(&self) -> Result<()> {
        self.record("abort_transaction", None, Value::Null);
        self.inner.abort_transaction().await
    }

    async fn stats(&self) -> Result<Value> {
        self.record("stats", None, Value::Null);
        let mut stats = self.inner.stats().await?;
        stats["recordedCalls"] = json!(self.calls.lock().len());
        Ok(stats)
    }
}
