// Models - the CRUD façade over one collection. Each call runs the hook
// registered for its operation kind, applies document defaults on inserts and
// dispatches to the storage driver.

mod definition;
mod hooks;
mod operation;

pub use definition::{parse_model_file, parse_model_file_str, ModelDefinition};
pub use hooks::{Hook, HookSet};
pub use operation::OperationKind;

use crate::document::{merge_defaults, to_document, Document};
use crate::driver::{
    AggregateOptions, BulkWriteOptions, BulkWriteResult, CountOptions, DeleteOptions,
    DeleteResult, DriverHandle, FindOneAndDeleteOptions, FindOneAndUpdateOptions, FindOptions,
    IndexSpec, InsertManyOptions, InsertManyResult, InsertOneOptions, UpdateOptions,
    UpdateResult, WriteModel,
};
use crate::error::{ModelGateError, Result};
use crate::id::{ext_json, IdInput, ID_FIELD};
use crate::schema::ValidationDescriptor;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;

/// The operations a model exposes. Implemented by [`Model`] and by the
/// capability-checking [`crate::gate::GatedModel`] wrapper.
#[async_trait]
pub trait Operations: Send + Sync {
    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> Result<Vec<Document>>;

    /// Insert one document and return it as stored, including `_id`.
    async fn insert(&self, document: Document, options: InsertOneOptions) -> Result<Document>;

    async fn insert_many(
        &self,
        documents: Vec<Document>,
        options: InsertManyOptions,
    ) -> Result<InsertManyResult>;

    /// Update the first match and return it (after the update unless the
    /// options ask for the original).
    async fn update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Document>>;

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Result<UpdateResult>;

    async fn find_many(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>>;

    async fn find(&self, filter: Document, options: FindOptions) -> Result<Option<Document>>;

    async fn find_by_id(&self, id: IdInput, options: FindOptions) -> Result<Option<Document>>;

    /// Delete the first match and return it.
    async fn delete(
        &self,
        filter: Document,
        options: FindOneAndDeleteOptions,
    ) -> Result<Option<Document>>;

    async fn delete_many(&self, filter: Document, options: DeleteOptions) -> Result<DeleteResult>;

    async fn total(&self, filter: Document, options: CountOptions) -> Result<u64>;

    async fn bulk_write(
        &self,
        operations: Vec<WriteModel>,
        options: BulkWriteOptions,
    ) -> Result<BulkWriteResult>;
}

/// A collection-bound model. Immutable after creation apart from its hooks.
#[derive(Debug)]
pub struct Model {
    definition: ModelDefinition,
    descriptor: ValidationDescriptor,
    allowed: BTreeSet<OperationKind>,
    hooks: HookSet,
    handle: DriverHandle,
}

impl Model {
    pub(crate) fn new(definition: ModelDefinition, handle: DriverHandle) -> Self {
        let descriptor = ValidationDescriptor::build(
            definition.schema.clone(),
            definition.validation_query_expressions.clone(),
        );
        let allowed = definition.effective_operations();

        Model {
            definition,
            descriptor,
            allowed,
            hooks: HookSet::default(),
            handle,
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.definition.collection_name
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn descriptor(&self) -> &ValidationDescriptor {
        &self.descriptor
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.definition.indexes
    }

    pub fn allowed_operations(&self) -> &BTreeSet<OperationKind> {
        &self.allowed
    }

    pub fn is_allowed(&self, kind: OperationKind) -> bool {
        self.allowed.contains(&kind)
    }

    pub fn document_defaults(&self) -> &Document {
        &self.definition.document_defaults
    }

    /// Register the pre-operation hook for `kind`, replacing any earlier one.
    pub fn pre<F>(&self, kind: OperationKind, hook: F)
    where
        F: Fn(&mut Document, &Document) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.set(kind, hook);
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    /// Defaults under the caller's fields.
    fn with_defaults(&self, document: Document) -> Document {
        merge_defaults(self.document_defaults(), document)
    }

    fn storage_error(&self, error: ModelGateError) -> ModelGateError {
        error.into_storage(self.collection_name())
    }

    fn dispatching(&self, kind: OperationKind) {
        log::debug!("{}: dispatching {kind}", self.collection_name());
    }
}

/// Pull a list back out of a hook payload after the hook had a chance to edit it.
fn take_list(kind: OperationKind, payload: &mut Document, key: &str) -> Result<Vec<Value>> {
    match payload.remove(key) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(ModelGateError::Hook(format!(
            "{kind} hook must leave '{key}' as an array"
        ))),
    }
}

#[async_trait]
impl Operations for Model {
    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> Result<Vec<Document>> {
        let kind = OperationKind::Aggregate;
        let mut payload = Document::new();
        payload.insert(
            "pipeline".into(),
            Value::Array(pipeline.into_iter().map(Value::Object).collect()),
        );
        self.hooks.run(kind, &mut payload, &to_document(&options)?)?;

        let pipeline = take_list(kind, &mut payload, "pipeline")?
            .into_iter()
            .map(|stage| match stage {
                Value::Object(stage) => Ok(stage),
                _ => Err(ModelGateError::Hook(
                    "aggregate hook must leave pipeline stages as documents".into(),
                )),
            })
            .collect::<Result<Vec<_>>>()?;

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .aggregate(self.collection_name(), &pipeline, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }

    async fn insert(&self, document: Document, options: InsertOneOptions) -> Result<Document> {
        let kind = OperationKind::Insert;
        let mut payload = document;
        self.hooks.run(kind, &mut payload, &to_document(&options)?)?;
        let document = self.with_defaults(payload);

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        let result = driver
            .insert_one(self.collection_name(), document.clone(), &options)
            .await
            .map_err(|e| self.storage_error(e))?;

        let mut stored = Document::new();
        stored.insert(ID_FIELD.to_string(), ext_json::oid(result.inserted_id));
        stored.extend(document.into_iter().filter(|(k, _)| k != ID_FIELD));
        Ok(stored)
    }

    async fn insert_many(
        &self,
        documents: Vec<Document>,
        options: InsertManyOptions,
    ) -> Result<InsertManyResult> {
        let kind = OperationKind::InsertMany;
        let context = to_document(&options)?;
        let mut prepared = Vec::with_capacity(documents.len());
        for mut payload in documents {
            self.hooks.run(kind, &mut payload, &context)?;
            prepared.push(self.with_defaults(payload));
        }

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .insert_many(self.collection_name(), prepared, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }

    async fn update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Document>> {
        let kind = OperationKind::Update;
        let mut payload = update;
        let mut context = filter.clone();
        context.extend(to_document(&options)?);
        self.hooks.run(kind, &mut payload, &context)?;

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .find_one_and_update(self.collection_name(), &filter, &payload, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        let kind = OperationKind::UpdateMany;
        let mut payload = update;
        let mut context = filter.clone();
        context.extend(to_document(&options)?);
        self.hooks.run(kind, &mut payload, &context)?;

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .update_many(self.collection_name(), &filter, &payload, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }

    async fn find_many(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>> {
        let kind = OperationKind::FindMany;
        let mut filter = filter;
        self.hooks.run(kind, &mut filter, &to_document(&options)?)?;

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .find(self.collection_name(), &filter, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<Option<Document>> {
        let kind = OperationKind::Find;
        let mut filter = filter;
        self.hooks.run(kind, &mut filter, &to_document(&options)?)?;

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .find_one(self.collection_name(), &filter, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }

    async fn find_by_id(&self, id: IdInput, options: FindOptions) -> Result<Option<Document>> {
        let kind = OperationKind::FindById;
        let id = id.normalize()?;
        let mut filter = Document::new();
        filter.insert(ID_FIELD.to_string(), ext_json::oid(id));
        self.hooks.run(kind, &mut filter, &to_document(&options)?)?;

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .find_one(self.collection_name(), &filter, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }

    async fn delete(
        &self,
        filter: Document,
        options: FindOneAndDeleteOptions,
    ) -> Result<Option<Document>> {
        let kind = OperationKind::Delete;
        let mut filter = filter;
        self.hooks.run(kind, &mut filter, &to_document(&options)?)?;

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .find_one_and_delete(self.collection_name(), &filter, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }

    async fn delete_many(&self, filter: Document, options: DeleteOptions) -> Result<DeleteResult> {
        let kind = OperationKind::DeleteMany;
        let mut filter = filter;
        self.hooks.run(kind, &mut filter, &to_document(&options)?)?;

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .delete_many(self.collection_name(), &filter, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }

    async fn total(&self, filter: Document, options: CountOptions) -> Result<u64> {
        let kind = OperationKind::Total;
        let mut filter = filter;
        self.hooks.run(kind, &mut filter, &to_document(&options)?)?;

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .count_documents(self.collection_name(), &filter, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }

    async fn bulk_write(
        &self,
        operations: Vec<WriteModel>,
        options: BulkWriteOptions,
    ) -> Result<BulkWriteResult> {
        let kind = OperationKind::BulkWrite;
        let mut payload = Document::new();
        payload.insert("operations".into(), serde_json::to_value(&operations)?);
        self.hooks.run(kind, &mut payload, &to_document(&options)?)?;

        let operations: Vec<WriteModel> =
            serde_json::from_value(Value::Array(take_list(kind, &mut payload, "operations")?))
                .map_err(|e| ModelGateError::Hook(format!("bulkWrite hook left an invalid operation: {e}")))?;

        let operations = operations
            .into_iter()
            .map(|op| match op {
                WriteModel::InsertOne { document } => WriteModel::InsertOne {
                    document: self.with_defaults(document),
                },
                other => other,
            })
            .collect();

        let driver = self.handle.driver()?;
        self.dispatching(kind);
        driver
            .bulk_write(self.collection_name(), operations, &options)
            .await
            .map_err(|e| self.storage_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ReturnDocument, StorageDriver};
    use crate::schema::parse_field_schema_str;
    use crate::test_support::RecordingDriver;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn user_definition() -> ModelDefinition {
        let schema = parse_field_schema_str(
            r#"
bsonType: object
properties:
  username: { bsonType: string }
  password: { bsonType: string }
  role: { bsonType: [string, "null"] }
  insertedAt: { bsonType: date }
  nick: { bsonType: [string, "null"] }
required: [username]
"#,
        )
        .unwrap();
        ModelDefinition::new("users", schema)
            .with_validity(true)
            .with_defaults(doc(json!({
                "role": "member",
                "insertedAt": { "$date": "2024-01-01T00:00:00.000Z" },
            })))
    }

    /// A model wired to a recording driver with the collection's validator installed.
    async fn connected_model() -> (Model, Arc<RecordingDriver>) {
        let driver = Arc::new(RecordingDriver::new());
        let handle = DriverHandle::new();
        handle.attach(driver.clone());
        let model = Model::new(user_definition(), handle);
        driver.set_validator("users", model.descriptor()).await.unwrap();
        driver.clear();
        (model, driver)
    }

    #[tokio::test]
    async fn test_insert_merges_defaults_with_caller_precedence() {
        let (model, _) = connected_model().await;
        let stored = model
            .insert(
                doc(json!({ "username": "alice", "insertedAt": { "$date": "2025-05-05T00:00:00.000Z" } })),
                Default::default(),
            )
            .await
            .unwrap();

        assert_eq!(stored["role"], "member");
        assert_eq!(stored["insertedAt"], json!({ "$date": "2025-05-05T00:00:00.000Z" }));
        assert!(ext_json::as_oid(&stored["_id"]).is_some());
        assert_eq!(stored.keys().next().map(String::as_str), Some("_id"));
    }

    #[tokio::test]
    async fn test_insert_hook_overwrite_wins() {
        let (model, driver) = connected_model().await;
        model.pre(OperationKind::Insert, |doc, _| {
            doc.insert("password".into(), json!("hashed"));
            Ok(())
        });

        let stored = model
            .insert(doc(json!({ "username": "bob", "password": "plain" })), Default::default())
            .await
            .unwrap();
        assert_eq!(stored["password"], "hashed");

        let calls = driver.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].collection.as_deref(), Some("users"));
        assert_eq!(calls[0].payload["password"], "hashed");
    }

    #[tokio::test]
    async fn test_insert_explicit_null_wins_over_default() {
        let (model, driver) = connected_model().await;
        let stored = model
            .insert(doc(json!({ "username": "carl", "nick": null, "role": null })), Default::default())
            .await
            .unwrap();
        assert_eq!(stored["nick"], Value::Null);
        assert_eq!(stored["role"], Value::Null);
        assert_eq!(driver.calls()[0].payload["role"], Value::Null);
    }

    #[tokio::test]
    async fn test_insert_hook_sees_document_before_defaults() {
        let (model, _) = connected_model().await;
        model.pre(OperationKind::Insert, |doc, _| {
            assert!(!doc.contains_key("role"));
            assert!(!doc.contains_key("insertedAt"));
            assert_eq!(doc["username"], "cleo");
            Ok(())
        });

        let stored = model
            .insert(doc(json!({ "username": "cleo" })), Default::default())
            .await
            .unwrap();
        assert_eq!(stored["role"], "member");
    }

    #[tokio::test]
    async fn test_insert_many_applies_defaults_to_every_document() {
        let (model, driver) = connected_model().await;
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        model.pre(OperationKind::InsertMany, move |doc, _| {
            log.lock().push(doc["username"].clone());
            doc.insert("nick".into(), json!("batch"));
            Ok(())
        });

        let result = model
            .insert_many(
                vec![
                    doc(json!({ "username": "olga" })),
                    doc(json!({ "username": "pia", "role": "admin" })),
                ],
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.inserted_ids.len(), 2);
        assert_eq!(*seen.lock(), vec![json!("olga"), json!("pia")]);

        let sent = &driver.calls()[0].payload;
        assert_eq!(sent[0]["role"], "member");
        assert_eq!(sent[0]["nick"], "batch");
        assert_eq!(sent[1]["role"], "admin");
        assert_eq!(sent[1]["insertedAt"], json!({ "$date": "2024-01-01T00:00:00.000Z" }));
    }

    #[tokio::test]
    async fn test_insert_many_hook_failure_leaves_storage_untouched() {
        let (model, driver) = connected_model().await;
        model.pre(OperationKind::InsertMany, |doc, _| {
            if doc["username"] == "bad" {
                return Err(ModelGateError::Hook("rejected".into()));
            }
            Ok(())
        });

        let err = model
            .insert_many(
                vec![doc(json!({ "username": "good" })), doc(json!({ "username": "bad" }))],
                Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModelGateError::Hook(_)));
        assert!(driver.calls().is_empty());
        assert_eq!(model.total(Document::new(), Default::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hook_error_stops_before_storage() {
        let (model, driver) = connected_model().await;
        model.pre(OperationKind::Insert, |_, _| {
            Err(ModelGateError::Hook("username is reserved".into()))
        });

        let err = model
            .insert(doc(json!({ "username": "root" })), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelGateError::Hook(_)));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failures_are_wrapped() {
        let (model, _) = connected_model().await;
        let err = model
            .insert(doc(json!({ "username": 42 })), Default::default())
            .await
            .unwrap_err();

        let cause = match err {
            ModelGateError::Storage(cause) => cause,
            other => panic!("expected a storage error, got {other:?}"),
        };
        let cause: Value = serde_json::from_str(&cause).unwrap();
        assert_eq!(cause["kind"], "validation");
        assert_eq!(cause["collection"], "users");
    }

    #[tokio::test]
    async fn test_update_returns_document_after_update() {
        let (model, _) = connected_model().await;
        model
            .insert(doc(json!({ "username": "dora" })), Default::default())
            .await
            .unwrap();

        let after = model
            .update(
                doc(json!({ "username": "dora" })),
                doc(json!({ "$set": { "role": "admin", "nick": null } })),
                Default::default(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after["role"], "admin");
        assert_eq!(after["nick"], Value::Null);

        let before = model
            .update(
                doc(json!({ "username": "dora" })),
                doc(json!({ "$set": { "role": "member" } })),
                FindOneAndUpdateOptions {
                    return_document: ReturnDocument::Before,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before["role"], "admin");
    }

    #[tokio::test]
    async fn test_update_hook_sees_filter_and_edits_copy() {
        let (model, driver) = connected_model().await;
        model
            .insert(doc(json!({ "username": "eve" })), Default::default())
            .await
            .unwrap();
        model.pre(OperationKind::Update, |update, context| {
            assert_eq!(context["username"], "eve");
            update.insert("$set".into(), json!({ "nick": "stamped" }));
            Ok(())
        });
        driver.clear();

        let original = doc(json!({ "$set": { "role": "admin" } }));
        let after = model
            .update(doc(json!({ "username": "eve" })), original.clone(), Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after["nick"], "stamped");
        assert_eq!(after["role"], "member");
        assert_eq!(original["$set"], json!({ "role": "admin" }));
    }

    #[tokio::test]
    async fn test_update_many_hook_sees_filter_and_edits_copy() {
        let (model, driver) = connected_model().await;
        for name in ["quinn", "rosa"] {
            model
                .insert(doc(json!({ "username": name })), Default::default())
                .await
                .unwrap();
        }
        model.pre(OperationKind::UpdateMany, |update, context| {
            assert_eq!(context["role"], "member");
            update.insert("$set".into(), json!({ "nick": "bulk" }));
            Ok(())
        });
        driver.clear();

        let original = doc(json!({ "$set": { "role": "admin" } }));
        let result = model
            .update_many(doc(json!({ "role": "member" })), original.clone(), Default::default())
            .await
            .unwrap();
        assert_eq!(result.matched_count, 2);
        assert_eq!(result.modified_count, 2);
        assert_eq!(original["$set"], json!({ "role": "admin" }));
        assert_eq!(driver.calls()[0].payload, json!({ "$set": { "nick": "bulk" } }));

        let renamed = model
            .total(doc(json!({ "nick": "bulk", "role": "member" })), Default::default())
            .await
            .unwrap();
        assert_eq!(renamed, 2);
    }

    #[tokio::test]
    async fn test_update_can_set_field_to_null() {
        let (model, driver) = connected_model().await;
        model
            .insert(doc(json!({ "username": "sam", "nick": "s" })), Default::default())
            .await
            .unwrap();
        driver.clear();

        model
            .update_many(
                doc(json!({ "username": "sam" })),
                doc(json!({ "$set": { "nick": null } })),
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(driver.calls()[0].payload, json!({ "$set": { "nick": null } }));
        let found = model
            .find(doc(json!({ "username": "sam" })), Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["nick"], Value::Null);
    }

    #[tokio::test]
    async fn test_find_by_id_invalid_never_reaches_storage() {
        let (model, driver) = connected_model().await;
        let err = model
            .find_by_id("not-a-valid-id".into(), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelGateError::InvalidIdentifier(_)));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_find_by_id_accepts_hex() {
        let (model, driver) = connected_model().await;
        let stored = model
            .insert(doc(json!({ "username": "fay" })), Default::default())
            .await
            .unwrap();
        let hex = ext_json::as_oid(&stored["_id"]).unwrap().to_hex();
        driver.clear();

        let found = model.find_by_id(hex.into(), Default::default()).await.unwrap().unwrap();
        assert_eq!(found["username"], "fay");
        assert_eq!(driver.calls()[0].method, "find_one");
        assert_eq!(driver.calls()[0].payload["_id"], stored["_id"]);
    }

    #[tokio::test]
    async fn test_read_hooks_rewrite_filter() {
        let (model, _) = connected_model().await;
        for name in ["gus", "hal"] {
            model
                .insert(doc(json!({ "username": name })), Default::default())
                .await
                .unwrap();
        }
        model.pre(OperationKind::FindMany, |filter, _| {
            filter.insert("username".into(), json!("hal"));
            Ok(())
        });

        let found = model.find_many(Document::new(), Default::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["username"], "hal");
        assert_eq!(model.total(Document::new(), Default::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_and_delete_many() {
        let (model, _) = connected_model().await;
        for name in ["ian", "jan", "kim"] {
            model
                .insert(doc(json!({ "username": name })), Default::default())
                .await
                .unwrap();
        }

        let removed = model
            .delete(doc(json!({ "username": "ian" })), Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removed["username"], "ian");

        let result = model
            .delete_many(doc(json!({ "role": "member" })), Default::default())
            .await
            .unwrap();
        assert_eq!(result.deleted_count, 2);
    }

    #[tokio::test]
    async fn test_aggregate_hook_edits_pipeline() {
        let (model, _) = connected_model().await;
        for name in ["lea", "max"] {
            model
                .insert(doc(json!({ "username": name })), Default::default())
                .await
                .unwrap();
        }
        model.pre(OperationKind::Aggregate, |payload, _| {
            if let Some(Value::Array(stages)) = payload.get_mut("pipeline") {
                stages.insert(0, json!({ "$match": { "username": "max" } }));
            }
            Ok(())
        });

        let out = model
            .aggregate(vec![doc(json!({ "$count": "n" }))], Default::default())
            .await
            .unwrap();
        assert_eq!(Value::Object(out[0].clone()), json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn test_bulk_write_applies_defaults_to_inserts() {
        let (model, driver) = connected_model().await;
        let result = model
            .bulk_write(
                vec![
                    WriteModel::InsertOne { document: doc(json!({ "username": "ned" })) },
                    WriteModel::UpdateOne {
                        filter: doc(json!({ "username": "ned" })),
                        update: doc(json!({ "$set": { "nick": "n", "role": null } })),
                        upsert: false,
                    },
                ],
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.inserted_count, 1);
        assert_eq!(result.modified_count, 1);

        let sent = &driver.calls()[0].payload;
        assert_eq!(sent[0]["insertOne"]["document"]["role"], "member");
        assert_eq!(
            sent[1]["updateOne"]["update"],
            json!({ "$set": { "nick": "n", "role": null } })
        );
    }

    #[tokio::test]
    async fn test_bulk_write_hook_with_invalid_operations() {
        let (model, driver) = connected_model().await;
        model.pre(OperationKind::BulkWrite, |payload, _| {
            payload.insert("operations".into(), json!([{ "explode": {} }]));
            Ok(())
        });
        let err = model.bulk_write(Vec::new(), Default::default()).await.unwrap_err();
        assert!(matches!(err, ModelGateError::Hook(_)));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_model_reports_not_connected() {
        let model = Model::new(user_definition(), DriverHandle::new());
        let err = model.total(Document::new(), Default::default()).await.unwrap_err();
        assert!(matches!(err, ModelGateError::NotConnected));
    }
}
