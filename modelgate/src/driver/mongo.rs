// MongoDB storage driver (feature `mongodb`). Documents cross the boundary as
// relaxed extended JSON; collection setup goes through database commands.

use super::{
    AggregateOptions, BulkWriteOptions, BulkWriteResult, CountOptions, DeleteOptions,
    DeleteResult, FindOneAndDeleteOptions, FindOneAndUpdateOptions, FindOptions, IndexSpec,
    InsertManyOptions, InsertManyResult, InsertOneOptions, InsertOneResult, ReturnDocument,
    StorageDriver, UpdateOptions, UpdateResult, WriteModel,
};
use crate::document::{to_document, Document};
use crate::error::{ModelGateError, Result};
use crate::id::{normalize_id, ObjectId, ID_FIELD};
use crate::schema::ValidationDescriptor;
use async_trait::async_trait;
use bson::{doc, Bson, Document as BsonDocument};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::{options, Client, ClientSession, Collection, Cursor, Database, SessionCursor};
use serde_json::Value;
use tokio::sync::Mutex;

const DUPLICATE_KEY: i32 = 11000;
const DOCUMENT_VALIDATION_FAILURE: i32 = 121;

/// A storage driver talking to a MongoDB deployment. While a transaction is
/// open every call runs inside its session.
pub struct MongoDriver {
    client: Client,
    db: Database,
    session: Mutex<Option<ClientSession>>,
}

impl MongoDriver {
    /// Connect and ping the server so a bad uri fails here rather than on first use.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(db_name);
        db.run_command(doc! { "ping": 1 }, None).await?;

        Ok(MongoDriver {
            client,
            db,
            session: Mutex::new(None),
        })
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.db.collection(name)
    }

    async fn command(&self, command: BsonDocument) -> Result<BsonDocument> {
        let mut slot = self.session.lock().await;
        let reply = match slot.as_mut() {
            Some(session) => self.db.run_command_with_session(command, None, session).await?,
            None => self.db.run_command(command, None).await?,
        };
        Ok(reply)
    }
}

// ── Conversions ────────────────────────────────────────────────────

fn to_bson(document: &Document) -> Result<BsonDocument> {
    match Bson::try_from(Value::Object(document.clone())) {
        Ok(Bson::Document(converted)) => Ok(converted),
        Ok(other) => Err(ModelGateError::Other(format!(
            "Expected a document, got {other}"
        ))),
        Err(e) => Err(ModelGateError::Other(format!("Invalid extended JSON: {e}"))),
    }
}

fn to_bson_opt(document: Option<&Document>) -> Result<Option<BsonDocument>> {
    document.map(to_bson).transpose()
}

fn from_bson(document: BsonDocument) -> Document {
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Canonical `_id` for an insert: normalized when given, left to the server when absent.
fn insert_document(mut document: Document) -> Result<BsonDocument> {
    match document.get(ID_FIELD) {
        Some(Value::Null) => {
            document.remove(ID_FIELD);
        }
        Some(value) => {
            let id = normalize_id(value)?;
            document.insert(ID_FIELD.to_string(), crate::id::ext_json::oid(id));
        }
        None => {}
    }
    to_bson(&document)
}

fn object_id(value: Bson) -> Result<ObjectId> {
    match value {
        Bson::ObjectId(id) => Ok(id),
        other => Err(ModelGateError::InvalidIdentifier(other.to_string())),
    }
}

fn return_document(value: ReturnDocument) -> options::ReturnDocument {
    match value {
        ReturnDocument::Before => options::ReturnDocument::Before,
        ReturnDocument::After => options::ReturnDocument::After,
    }
}

fn find_options(o: &FindOptions) -> Result<options::FindOptions> {
    let mut out = options::FindOptions::default();
    out.sort = to_bson_opt(o.sort.as_ref())?;
    out.projection = to_bson_opt(o.projection.as_ref())?;
    out.skip = o.skip;
    // a limit of 0 means "no limit", same as the server
    out.limit = o.limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
    Ok(out)
}

fn find_one_options(o: &FindOptions) -> Result<options::FindOneOptions> {
    let mut out = options::FindOneOptions::default();
    out.sort = to_bson_opt(o.sort.as_ref())?;
    out.projection = to_bson_opt(o.projection.as_ref())?;
    out.skip = o.skip;
    Ok(out)
}

fn find_one_and_update_options(
    o: &FindOneAndUpdateOptions,
) -> Result<options::FindOneAndUpdateOptions> {
    let mut out = options::FindOneAndUpdateOptions::default();
    out.return_document = Some(return_document(o.return_document));
    out.upsert = Some(o.upsert);
    out.sort = to_bson_opt(o.sort.as_ref())?;
    out.projection = to_bson_opt(o.projection.as_ref())?;
    Ok(out)
}

fn update_options(upsert: bool) -> options::UpdateOptions {
    let mut out = options::UpdateOptions::default();
    out.upsert = Some(upsert);
    out
}

fn replace_options(upsert: bool) -> options::ReplaceOptions {
    let mut out = options::ReplaceOptions::default();
    out.upsert = Some(upsert);
    out
}

fn insert_one_options(bypass: bool) -> options::InsertOneOptions {
    let mut out = options::InsertOneOptions::default();
    if bypass {
        out.bypass_document_validation = Some(true);
    }
    out
}

/// Map server rejections onto the crate's duplicate-key and validation errors.
fn write_error(error: MongoError, collection: &str) -> ModelGateError {
    let rejection = match &*error.kind {
        ErrorKind::Write(WriteFailure::WriteError(failure)) => {
            Some((failure.code, failure.message.clone()))
        }
        ErrorKind::Command(failure) => Some((failure.code, failure.message.clone())),
        _ => None,
    };
    match rejection {
        Some((DUPLICATE_KEY, message)) => ModelGateError::DuplicateKey {
            collection: collection.to_string(),
            index: duplicate_index(&message),
        },
        Some((DOCUMENT_VALIDATION_FAILURE, message)) => ModelGateError::Validation(message),
        _ => ModelGateError::Mongo(error),
    }
}

/// Index name out of an `E11000 duplicate key error ... index: <name> dup key: ...` message.
fn duplicate_index(message: &str) -> String {
    message
        .split("index: ")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or("unknown")
        .to_string()
}

async fn drain(mut cursor: Cursor<BsonDocument>) -> Result<Vec<Document>> {
    let mut out = Vec::new();
    while cursor.advance().await? {
        out.push(from_bson(cursor.deserialize_current()?));
    }
    Ok(out)
}

async fn drain_in_session(
    mut cursor: SessionCursor<BsonDocument>,
    session: &mut ClientSession,
) -> Result<Vec<Document>> {
    let mut out = Vec::new();
    while cursor.advance(session).await? {
        out.push(from_bson(cursor.deserialize_current()?));
    }
    Ok(out)
}

/// Apply one bulk write model, tallying its effect into `result`.
async fn apply_write(
    coll: &Collection<BsonDocument>,
    op: WriteModel,
    bypass: bool,
    session: Option<&mut ClientSession>,
    result: &mut BulkWriteResult,
) -> Result<()> {
    let name = coll.name().to_string();
    match op {
        WriteModel::InsertOne { document } => {
            let document = insert_document(document)?;
            let options = insert_one_options(bypass);
            let inserted = match session {
                Some(s) => coll.insert_one_with_session(document, options, s).await,
                None => coll.insert_one(document, options).await,
            }
            .map_err(|e| write_error(e, &name))?;
            result.inserted_count += 1;
            result.inserted_ids.push(object_id(inserted.inserted_id)?);
        }
        WriteModel::UpdateOne { filter, update, upsert } => {
            let (filter, update) = (to_bson(&filter)?, to_bson(&update)?);
            let options = update_options(upsert);
            let updated = match session {
                Some(s) => coll.update_one_with_session(filter, update, options, s).await,
                None => coll.update_one(filter, update, options).await,
            }
            .map_err(|e| write_error(e, &name))?;
            tally_update(result, updated.matched_count, updated.modified_count, updated.upserted_id.is_some());
        }
        WriteModel::UpdateMany { filter, update, upsert } => {
            let (filter, update) = (to_bson(&filter)?, to_bson(&update)?);
            let options = update_options(upsert);
            let updated = match session {
                Some(s) => coll.update_many_with_session(filter, update, options, s).await,
                None => coll.update_many(filter, update, options).await,
            }
            .map_err(|e| write_error(e, &name))?;
            tally_update(result, updated.matched_count, updated.modified_count, updated.upserted_id.is_some());
        }
        WriteModel::ReplaceOne { filter, replacement, upsert } => {
            if replacement.keys().any(|k| k.starts_with('$')) {
                return Err(ModelGateError::Query(
                    "Replacement documents cannot contain update operators".into(),
                ));
            }
            let (filter, replacement) = (to_bson(&filter)?, to_bson(&replacement)?);
            let options = replace_options(upsert);
            let replaced = match session {
                Some(s) => coll.replace_one_with_session(filter, replacement, options, s).await,
                None => coll.replace_one(filter, replacement, options).await,
            }
            .map_err(|e| write_error(e, &name))?;
            tally_update(result, replaced.matched_count, replaced.modified_count, replaced.upserted_id.is_some());
        }
        WriteModel::DeleteOne { filter } => {
            let filter = to_bson(&filter)?;
            let deleted = match session {
                Some(s) => coll.delete_one_with_session(filter, None, s).await,
                None => coll.delete_one(filter, None).await,
            }
            .map_err(|e| write_error(e, &name))?;
            result.deleted_count += deleted.deleted_count;
        }
        WriteModel::DeleteMany { filter } => {
            let filter = to_bson(&filter)?;
            let deleted = match session {
                Some(s) => coll.delete_many_with_session(filter, None, s).await,
                None => coll.delete_many(filter, None).await,
            }
            .map_err(|e| write_error(e, &name))?;
            result.deleted_count += deleted.deleted_count;
        }
    }
    Ok(())
}

fn tally_update(result: &mut BulkWriteResult, matched: u64, modified: u64, upserted: bool) {
    result.matched_count += matched;
    result.modified_count += modified;
    if upserted {
        result.upserted_count += 1;
    }
}

#[async_trait]
impl StorageDriver for MongoDriver {
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        options: &InsertOneOptions,
    ) -> Result<InsertOneResult> {
        let coll = self.collection(collection);
        let document = insert_document(document)?;
        let opts = insert_one_options(options.bypass_document_validation);

        let mut slot = self.session.lock().await;
        let inserted = match slot.as_mut() {
            Some(s) => coll.insert_one_with_session(document, opts, s).await,
            None => coll.insert_one(document, opts).await,
        }
        .map_err(|e| write_error(e, collection))?;

        Ok(InsertOneResult {
            inserted_id: object_id(inserted.inserted_id)?,
        })
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        options: &InsertManyOptions,
    ) -> Result<InsertManyResult> {
        let coll = self.collection(collection);
        let documents = documents
            .into_iter()
            .map(insert_document)
            .collect::<Result<Vec<_>>>()?;
        let mut opts = options::InsertManyOptions::default();
        opts.ordered = Some(options.ordered);
        if options.bypass_document_validation {
            opts.bypass_document_validation = Some(true);
        }

        let mut slot = self.session.lock().await;
        let inserted = match slot.as_mut() {
            Some(s) => coll.insert_many_with_session(documents, opts, s).await,
            None => coll.insert_many(documents, opts).await,
        }
        .map_err(|e| write_error(e, collection))?;

        let mut ids: Vec<(usize, Bson)> = inserted.inserted_ids.into_iter().collect();
        ids.sort_by_key(|(i, _)| *i);
        Ok(InsertManyResult {
            inserted_ids: ids
                .into_iter()
                .map(|(_, id)| object_id(id))
                .collect::<Result<_>>()?,
        })
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Option<Document>> {
        let coll = self.collection(collection);
        let filter = to_bson(filter)?;
        let opts = find_one_options(options)?;

        let mut slot = self.session.lock().await;
        let found = match slot.as_mut() {
            Some(s) => coll.find_one_with_session(filter, opts, s).await?,
            None => coll.find_one(filter, opts).await?,
        };
        Ok(found.map(from_bson))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let coll = self.collection(collection);
        let filter = to_bson(filter)?;
        let opts = find_options(options)?;

        let mut slot = self.session.lock().await;
        match slot.as_mut() {
            Some(s) => {
                let cursor = coll.find_with_session(filter, opts, s).await?;
                drain_in_session(cursor, s).await
            }
            None => drain(coll.find(filter, opts).await?).await,
        }
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>> {
        let coll = self.collection(collection);
        let (filter, update) = (to_bson(filter)?, to_bson(update)?);
        let opts = find_one_and_update_options(options)?;

        let mut slot = self.session.lock().await;
        let found = match slot.as_mut() {
            Some(s) => coll.find_one_and_update_with_session(filter, update, opts, s).await,
            None => coll.find_one_and_update(filter, update, opts).await,
        }
        .map_err(|e| write_error(e, collection))?;
        Ok(found.map(from_bson))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        let coll = self.collection(collection);
        let (filter, update) = (to_bson(filter)?, to_bson(update)?);
        let opts = update_options(options.upsert);

        let mut slot = self.session.lock().await;
        let updated = match slot.as_mut() {
            Some(s) => coll.update_many_with_session(filter, update, opts, s).await,
            None => coll.update_many(filter, update, opts).await,
        }
        .map_err(|e| write_error(e, collection))?;

        Ok(UpdateResult {
            matched_count: updated.matched_count,
            modified_count: updated.modified_count,
            upserted_id: updated.upserted_id.map(object_id).transpose()?,
        })
    }

    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOneAndDeleteOptions,
    ) -> Result<Option<Document>> {
        let coll = self.collection(collection);
        let filter = to_bson(filter)?;
        let mut opts = options::FindOneAndDeleteOptions::default();
        opts.sort = to_bson_opt(options.sort.as_ref())?;
        opts.projection = to_bson_opt(options.projection.as_ref())?;

        let mut slot = self.session.lock().await;
        let found = match slot.as_mut() {
            Some(s) => coll.find_one_and_delete_with_session(filter, opts, s).await?,
            None => coll.find_one_and_delete(filter, opts).await?,
        };
        Ok(found.map(from_bson))
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Document,
        _options: &DeleteOptions,
    ) -> Result<DeleteResult> {
        let coll = self.collection(collection);
        let filter = to_bson(filter)?;

        let mut slot = self.session.lock().await;
        let deleted = match slot.as_mut() {
            Some(s) => coll.delete_many_with_session(filter, None, s).await?,
            None => coll.delete_many(filter, None).await?,
        };
        Ok(DeleteResult {
            deleted_count: deleted.deleted_count,
        })
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: &Document,
        options: &CountOptions,
    ) -> Result<u64> {
        let coll = self.collection(collection);
        let filter = to_bson(filter)?;
        let mut opts = options::CountOptions::default();
        opts.skip = options.skip;
        opts.limit = options.limit;

        let mut slot = self.session.lock().await;
        let count = match slot.as_mut() {
            Some(s) => coll.count_documents_with_session(filter, opts, s).await?,
            None => coll.count_documents(filter, opts).await?,
        };
        Ok(count)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
        options: &AggregateOptions,
    ) -> Result<Vec<Document>> {
        let coll = self.collection(collection);
        let pipeline = pipeline.iter().map(to_bson).collect::<Result<Vec<_>>>()?;
        let mut opts = options::AggregateOptions::default();
        opts.comment = options.comment.clone().map(Into::into);

        let mut slot = self.session.lock().await;
        match slot.as_mut() {
            Some(s) => {
                let cursor = coll.aggregate_with_session(pipeline, opts, s).await?;
                drain_in_session(cursor, s).await
            }
            None => drain(coll.aggregate(pipeline, opts).await?).await,
        }
    }

    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteModel>,
        options: &BulkWriteOptions,
    ) -> Result<BulkWriteResult> {
        let coll = self.collection(collection);
        let mut result = BulkWriteResult::default();
        let mut failures = Vec::new();

        let mut slot = self.session.lock().await;
        for (i, op) in operations.into_iter().enumerate() {
            let applied = apply_write(
                &coll,
                op,
                options.bypass_document_validation,
                slot.as_mut(),
                &mut result,
            )
            .await;
            if let Err(e) = applied {
                if options.ordered {
                    return Err(e);
                }
                failures.push(format!("#{i}: {e}"));
            }
        }

        if !failures.is_empty() {
            return Err(ModelGateError::Other(format!(
                "bulk_write had {} failed operations:\n  - {}",
                failures.len(),
                failures.join("\n  - ")
            )));
        }
        Ok(result)
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        self.command(doc! { "create": collection }).await?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = self.db.list_collection_names(None).await?;
        names.sort();
        Ok(names)
    }

    async fn drop_indexes(&self, collection: &str) -> Result<()> {
        self.command(doc! { "dropIndexes": collection, "index": "*" })
            .await?;
        Ok(())
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String> {
        let name = index.resolved_name();
        let mut model = doc! { "key": to_bson(&index.key)?, "name": name.as_str() };
        if index.unique {
            model.insert("unique", true);
        }
        if index.sparse {
            model.insert("sparse", true);
        }

        self.command(doc! { "createIndexes": collection, "indexes": [model] })
            .await
            .map_err(|e| match e {
                ModelGateError::Mongo(inner) => write_error(inner, collection),
                other => other,
            })?;
        Ok(name)
    }

    async fn set_validator(&self, collection: &str, descriptor: &ValidationDescriptor) -> Result<()> {
        let mut command = doc! { "collMod": collection };
        for (key, value) in to_bson(&to_document(descriptor)?)? {
            command.insert(key, value);
        }
        self.command(command).await?;
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(ModelGateError::Other(
                "A transaction is already in progress".into(),
            ));
        }
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        *slot = Some(session);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let mut session = self
            .session
            .lock()
            .await
            .take()
            .ok_or_else(|| ModelGateError::Other("No transaction in progress".into()))?;
        session.commit_transaction().await?;
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<()> {
        let mut session = self
            .session
            .lock()
            .await
            .take()
            .ok_or_else(|| ModelGateError::Other("No transaction in progress".into()))?;
        session.abort_transaction().await?;
        Ok(())
    }

    async fn stats(&self) -> Result<Value> {
        let reply = self.command(doc! { "dbStats": 1 }).await?;
        Ok(Value::Object(from_bson(reply)))
    }
}
