// Capability gate - the handle callers get from the registry. Operations not
// on the model's allow-list fail before anything else runs.

use crate::document::Document;
use crate::driver::{
    AggregateOptions, BulkWriteOptions, BulkWriteResult, CountOptions, DeleteOptions,
    DeleteResult, FindOneAndDeleteOptions, FindOneAndUpdateOptions, FindOptions, IndexSpec,
    InsertManyOptions, InsertManyResult, InsertOneOptions, UpdateOptions, UpdateResult,
    WriteModel,
};
use crate::error::{ModelGateError, Result};
use crate::id::IdInput;
use crate::model::{Model, ModelDefinition, OperationKind, Operations};
use crate::schema::ValidationDescriptor;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A model behind its allow-list.
#[derive(Debug, Clone)]
pub struct GatedModel {
    model: Arc<Model>,
}

impl GatedModel {
    pub(crate) fn new(model: Arc<Model>) -> Self {
        GatedModel { model }
    }

    /// Fail with `PermissionDenied` unless `kind` is allowed.
    pub fn check(&self, kind: OperationKind) -> Result<()> {
        if self.model.is_allowed(kind) {
            return Ok(());
        }
        log::debug!("{}: denied {kind}", self.model.collection_name());
        Err(ModelGateError::PermissionDenied {
            operation: kind.to_string(),
            collection: self.model.collection_name().to_string(),
        })
    }

    pub fn collection_name(&self) -> &str {
        self.model.collection_name()
    }

    pub fn definition(&self) -> &ModelDefinition {
        self.model.definition()
    }

    pub fn descriptor(&self) -> &ValidationDescriptor {
        self.model.descriptor()
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        self.model.indexes()
    }

    pub fn allowed_operations(&self) -> &BTreeSet<OperationKind> {
        self.model.allowed_operations()
    }

    pub fn is_allowed(&self, kind: OperationKind) -> bool {
        self.model.is_allowed(kind)
    }

    pub fn document_defaults(&self) -> &Document {
        self.model.document_defaults()
    }

    /// Hooks can be registered for any kind, allowed or not.
    pub fn pre<F>(&self, kind: OperationKind, hook: F)
    where
        F: Fn(&mut Document, &Document) -> Result<()> + Send + Sync + 'static,
    {
        self.model.pre(kind, hook);
    }
}

#[async_trait]
impl Operations for GatedModel {
    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> Result<Vec<Document>> {
        self.check(OperationKind::Aggregate)?;
        self.model.aggregate(pipeline, options).await
    }

    async fn insert(&self, document: Document, options: InsertOneOptions) -> Result<Document> {
        self.check(OperationKind::Insert)?;
        self.model.insert(document, options).await
    }

    async fn insert_many(
        &self,
        documents: Vec<Document>,
        options: InsertManyOptions,
    ) -> Result<InsertManyResult> {
        self.check(OperationKind::InsertMany)?;
        self.model.insert_many(documents, options).await
    }

    async fn update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Document>> {
        self.check(OperationKind::Update)?;
        self.model.update(filter, update, options).await
    }

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        self.check(OperationKind::UpdateMany)?;
        self.model.update_many(filter, update, options).await
    }

    async fn find_many(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>> {
        self.check(OperationKind::FindMany)?;
        self.model.find_many(filter, options).await
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<Option<Document>> {
        self.check(OperationKind::Find)?;
        self.model.find(filter, options).await
    }

    async fn find_by_id(&self, id: IdInput, options: FindOptions) -> Result<Option<Document>> {
        self.check(OperationKind::FindById)?;
        self.model.find_by_id(id, options).await
    }

    async fn delete(
        &self,
        filter: Document,
        options: FindOneAndDeleteOptions,
    ) -> Result<Option<Document>> {
        self.check(OperationKind::Delete)?;
        self.model.delete(filter, options).await
    }

    async fn delete_many(&self, filter: Document, options: DeleteOptions) -> Result<DeleteResult> {
        self.check(OperationKind::DeleteMany)?;
        self.model.delete_many(filter, options).await
    }

    async fn total(&self, filter: Document, options: CountOptions) -> Result<u64> {
        self.check(OperationKind::Total)?;
        self.model.total(filter, options).await
    }

    async fn bulk_write(
        &self,
        operations: Vec<WriteModel>,
        options: BulkWriteOptions,
    ) -> Result<BulkWriteResult> {
        self.check(OperationKind::BulkWrite)?;
        self.model.bulk_write(operations, options).await
    }
}
