use super::{
    AggregateOptions, BulkWriteOptions, BulkWriteResult, CountOptions, DeleteOptions,
    DeleteResult, FindOneAndDeleteOptions, FindOneAndUpdateOptions, FindOptions, IndexSpec,
    InsertManyOptions, InsertManyResult, InsertOneOptions, InsertOneResult, ReturnDocument,
    StorageDriver, UpdateOptions, UpdateResult, WriteModel,
};
use crate::document::Document;
use crate::error::{ModelGateError, Result};
use crate::id::{ext_json, normalize_id, ObjectId, ID_FIELD};
use crate::query;
use crate::schema::ValidationDescriptor;
use crate::validation;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::Path;

const URI_SCHEME: &str = "embedded://";
const IN_MEMORY: &str = ":memory:";

/// A storage driver backed by a single SQLite database. Documents are kept as
/// JSON; filters, updates and pipelines are evaluated in process. Validators
/// attached with `set_validator` and unique indexes are enforced on writes.
pub struct EmbeddedDriver {
    conn: Mutex<Connection>,
    name: String,
}

/// A document row together with its insertion sequence number.
struct StoredDocument {
    seq: i64,
    doc: Document,
}

impl EmbeddedDriver {
    /// Open or create a database file.
    pub fn open(path: &Path, name: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, name)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(name: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, name)
    }

    /// Open the database addressed by a connection string:
    /// `embedded://:memory:` or `embedded://<directory>` (the file is
    /// `<directory>/<db_name>.db`).
    pub fn from_uri(uri: &str, db_name: &str) -> Result<Self> {
        let location = uri.strip_prefix(URI_SCHEME).ok_or_else(|| {
            ModelGateError::Config(format!(
                "Unsupported connection string '{uri}': expected {URI_SCHEME}<dir>, {URI_SCHEME}{IN_MEMORY} or mongodb://"
            ))
        })?;

        if location == IN_MEMORY || location.is_empty() {
            return Self::open_in_memory(db_name);
        }

        let dir = Path::new(location);
        std::fs::create_dir_all(dir)?;
        Self::open(&dir.join(format!("{db_name}.db")), db_name)
    }

    fn with_connection(conn: Connection, name: &str) -> Result<Self> {
        initialize_tables(&conn)?;
        Ok(EmbeddedDriver {
            conn: Mutex::new(conn),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn initialize_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            validator_json TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data_json TEXT NOT NULL,
            UNIQUE (collection, id)
        );

        CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

        CREATE TABLE IF NOT EXISTS indexes (
            collection TEXT NOT NULL,
            name TEXT NOT NULL,
            spec_json TEXT NOT NULL,
            PRIMARY KEY (collection, name)
        );
        ",
    )?;
    Ok(())
}

// ── Row access ─────────────────────────────────────────────────────

fn ensure_collection(conn: &Connection, collection: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
        params![collection],
    )?;
    Ok(())
}

fn load_documents(conn: &Connection, collection: &str) -> Result<Vec<StoredDocument>> {
    let mut stmt =
        conn.prepare("SELECT seq, data_json FROM documents WHERE collection = ?1 ORDER BY seq")?;
    let rows = stmt.query_map(params![collection], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut docs = Vec::new();
    for row in rows {
        let (seq, data_json) = row?;
        let doc: Document = serde_json::from_str(&data_json)?;
        docs.push(StoredDocument { seq, doc });
    }
    Ok(docs)
}

fn load_validator(conn: &Connection, collection: &str) -> Result<Option<ValidationDescriptor>> {
    let raw: Option<Option<String>> = conn
        .query_row(
            "SELECT validator_json FROM collections WHERE name = ?1",
            params![collection],
            |row| row.get(0),
        )
        .optional()?;

    match raw.flatten() {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn load_indexes(conn: &Connection, collection: &str) -> Result<Vec<IndexSpec>> {
    let mut stmt =
        conn.prepare("SELECT spec_json FROM indexes WHERE collection = ?1 ORDER BY name")?;
    let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;

    let mut specs = Vec::new();
    for row in rows {
        specs.push(serde_json::from_str(&row?)?);
    }
    Ok(specs)
}

/// Storage key of an identity value.
fn id_key(id: &Value) -> String {
    match ext_json::as_oid(id) {
        Some(oid) => oid.to_hex(),
        None => id.to_string(),
    }
}

/// Give the document a canonical `_id`, generating one when absent.
fn assign_id(doc: &mut Document) -> Result<ObjectId> {
    let id = match doc.get(ID_FIELD) {
        None | Some(Value::Null) => ObjectId::new(),
        Some(value) => normalize_id(value)?,
    };
    doc.insert(ID_FIELD.to_string(), ext_json::oid(id));
    Ok(id)
}

fn index_key(spec: &IndexSpec, doc: &Document) -> Vec<Option<Value>> {
    spec.key
        .keys()
        .map(|field| query::get_path(doc, field).cloned())
        .collect()
}

fn same_key(a: &[Option<Value>], b: &[Option<Value>]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (x, y) {
            (Some(x), Some(y)) => query::values_equal(x, y),
            (None, None) => true,
            (None, Some(Value::Null)) | (Some(Value::Null), None) => true,
            _ => false,
        })
}

// ── Writes ─────────────────────────────────────────────────────────

/// Validator and unique-index checks for a document about to be written.
/// `replacing` is the sequence number of the row being overwritten, if any.
fn check_write(
    conn: &Connection,
    collection: &str,
    doc: &Document,
    replacing: Option<i64>,
    bypass_validation: bool,
) -> Result<()> {
    if !bypass_validation {
        if let Some(descriptor) = load_validator(conn, collection)? {
            for warning in validation::enforce(&descriptor, doc)? {
                log::warn!("{collection}: {warning}");
            }
        }
    }

    let unique: Vec<IndexSpec> = load_indexes(conn, collection)?
        .into_iter()
        .filter(|spec| spec.unique)
        .collect();
    if unique.is_empty() {
        return Ok(());
    }

    let existing = load_documents(conn, collection)?;
    for spec in &unique {
        let key = index_key(spec, doc);
        if spec.sparse && key.iter().all(Option::is_none) {
            continue;
        }
        let clash = existing
            .iter()
            .filter(|row| Some(row.seq) != replacing)
            .any(|row| same_key(&key, &index_key(spec, &row.doc)));
        if clash {
            return Err(ModelGateError::DuplicateKey {
                collection: collection.to_string(),
                index: spec.resolved_name(),
            });
        }
    }
    Ok(())
}

fn insert_document(
    conn: &Connection,
    collection: &str,
    mut doc: Document,
    bypass_validation: bool,
) -> Result<ObjectId> {
    ensure_collection(conn, collection)?;
    let id = assign_id(&mut doc)?;
    let key = id.to_hex();

    let taken: Option<i64> = conn
        .query_row(
            "SELECT seq FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, key],
            |row| row.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(ModelGateError::DuplicateKey {
            collection: collection.to_string(),
            index: "_id_".to_string(),
        });
    }

    check_write(conn, collection, &doc, None, bypass_validation)?;

    conn.execute(
        "INSERT INTO documents (collection, id, data_json) VALUES (?1, ?2, ?3)",
        params![collection, key, serde_json::to_string(&doc)?],
    )?;
    Ok(id)
}

fn replace_document(
    conn: &Connection,
    collection: &str,
    seq: i64,
    doc: &Document,
    bypass_validation: bool,
) -> Result<()> {
    check_write(conn, collection, doc, Some(seq), bypass_validation)?;
    conn.execute(
        "UPDATE documents SET data_json = ?1 WHERE seq = ?2",
        params![serde_json::to_string(doc)?, seq],
    )?;
    Ok(())
}

fn delete_document(conn: &Connection, seq: i64) -> Result<()> {
    conn.execute("DELETE FROM documents WHERE seq = ?1", params![seq])?;
    Ok(())
}

// ── Reads ──────────────────────────────────────────────────────────

fn matching(
    conn: &Connection,
    collection: &str,
    filter: &Document,
    sort: Option<&Document>,
) -> Result<Vec<StoredDocument>> {
    let mut hits = Vec::new();
    for row in load_documents(conn, collection)? {
        if query::matches(&row.doc, filter)? {
            hits.push(row);
        }
    }

    if let Some(sort) = sort {
        query::sort_by_spec(&mut hits, sort, |row| &row.doc)?;
    }
    Ok(hits)
}

fn finish(doc: Document, projection: Option<&Document>) -> Result<Document> {
    match projection {
        Some(p) => query::project(&doc, p),
        None => Ok(doc),
    }
}

/// Update the first match of `filter` (or upsert). Returns `(before, after, upserted)`.
fn update_one(
    conn: &Connection,
    collection: &str,
    filter: &Document,
    update: &Document,
    upsert: bool,
    sort: Option<&Document>,
    bypass_validation: bool,
) -> Result<(Option<Document>, Option<Document>, Option<ObjectId>)> {
    let target = matching(conn, collection, filter, sort)?.into_iter().next();

    match target {
        Some(row) => {
            let before = row.doc.clone();
            let mut after = row.doc;
            if query::apply_update(&mut after, update, false)? {
                replace_document(conn, collection, row.seq, &after, bypass_validation)?;
            }
            Ok((Some(before), Some(after), None))
        }
        None if upsert => {
            let mut doc = query::upsert_seed(filter);
            query::apply_update(&mut doc, update, true)?;
            let id = insert_document(conn, collection, doc.clone(), bypass_validation)?;
            doc.insert(ID_FIELD.to_string(), ext_json::oid(id));
            Ok((None, Some(doc), Some(id)))
        }
        None => Ok((None, None, None)),
    }
}

fn update_all(
    conn: &Connection,
    collection: &str,
    filter: &Document,
    update: &Document,
    upsert: bool,
    bypass_validation: bool,
) -> Result<UpdateResult> {
    let rows = matching(conn, collection, filter, None)?;
    let mut result = UpdateResult {
        matched_count: rows.len() as u64,
        ..Default::default()
    };

    if rows.is_empty() {
        if upsert {
            let mut doc = query::upsert_seed(filter);
            query::apply_update(&mut doc, update, true)?;
            result.upserted_id = Some(insert_document(conn, collection, doc, bypass_validation)?);
        }
        return Ok(result);
    }

    for row in rows {
        let mut doc = row.doc;
        if query::apply_update(&mut doc, update, false)? {
            replace_document(conn, collection, row.seq, &doc, bypass_validation)?;
            result.modified_count += 1;
        }
    }
    Ok(result)
}

fn replace_one(
    conn: &Connection,
    collection: &str,
    filter: &Document,
    replacement: &Document,
    upsert: bool,
    bypass_validation: bool,
) -> Result<UpdateResult> {
    if replacement.keys().any(|k| k.starts_with('$')) {
        return Err(ModelGateError::Query(
            "Replacement document must not contain update operators".into(),
        ));
    }

    match matching(conn, collection, filter, None)?.into_iter().next() {
        Some(row) => {
            let mut doc = replacement.clone();
            if let Some(id) = row.doc.get(ID_FIELD) {
                doc.insert(ID_FIELD.to_string(), id.clone());
            }
            let modified = doc != row.doc;
            if modified {
                replace_document(conn, collection, row.seq, &doc, bypass_validation)?;
            }
            Ok(UpdateResult {
                matched_count: 1,
                modified_count: modified as u64,
                upserted_id: None,
            })
        }
        None if upsert => {
            let id = insert_document(conn, collection, replacement.clone(), bypass_validation)?;
            Ok(UpdateResult {
                upserted_id: Some(id),
                ..Default::default()
            })
        }
        None => Ok(UpdateResult::default()),
    }
}

fn delete_matching(conn: &Connection, collection: &str, filter: &Document, limit_one: bool) -> Result<u64> {
    let mut deleted = 0;
    for row in matching(conn, collection, filter, None)? {
        delete_document(conn, row.seq)?;
        deleted += 1;
        if limit_one {
            break;
        }
    }
    Ok(deleted)
}

fn apply_write(
    conn: &Connection,
    collection: &str,
    op: WriteModel,
    bypass_validation: bool,
    result: &mut BulkWriteResult,
) -> Result<()> {
    match op {
        WriteModel::InsertOne { document } => {
            let id = insert_document(conn, collection, document, bypass_validation)?;
            result.inserted_count += 1;
            result.inserted_ids.push(id);
        }
        WriteModel::UpdateOne { filter, update, upsert } => {
            let (before, after, upserted) =
                update_one(conn, collection, &filter, &update, upsert, None, bypass_validation)?;
            if upserted.is_some() {
                result.upserted_count += 1;
            } else if before.is_some() {
                result.matched_count += 1;
                if before != after {
                    result.modified_count += 1;
                }
            }
        }
        WriteModel::UpdateMany { filter, update, upsert } => {
            let r = update_all(conn, collection, &filter, &update, upsert, bypass_validation)?;
            result.matched_count += r.matched_count;
            result.modified_count += r.modified_count;
            result.upserted_count += r.upserted_id.is_some() as u64;
        }
        WriteModel::ReplaceOne { filter, replacement, upsert } => {
            let r = replace_one(conn, collection, &filter, &replacement, upsert, bypass_validation)?;
            result.matched_count += r.matched_count;
            result.modified_count += r.modified_count;
            result.upserted_count += r.upserted_id.is_some() as u64;
        }
        WriteModel::DeleteOne { filter } => {
            result.deleted_count += delete_matching(conn, collection, &filter, true)?;
        }
        WriteModel::DeleteMany { filter } => {
            result.deleted_count += delete_matching(conn, collection, &filter, false)?;
        }
    }
    Ok(())
}

#[async_trait]
impl StorageDriver for EmbeddedDriver {
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        options: &InsertOneOptions,
    ) -> Result<InsertOneResult> {
        let conn = self.conn.lock();
        let inserted_id =
            insert_document(&conn, collection, document, options.bypass_document_validation)?;
        Ok(InsertOneResult { inserted_id })
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        options: &InsertManyOptions,
    ) -> Result<InsertManyResult> {
        let conn = self.conn.lock();
        let mut result = InsertManyResult::default();
        let mut failures = Vec::new();

        for (i, doc) in documents.into_iter().enumerate() {
            match insert_document(&conn, collection, doc, options.bypass_document_validation) {
                Ok(id) => result.inserted_ids.push(id),
                Err(e) if options.ordered => return Err(e),
                Err(e) => failures.push(format!("#{i}: {e}")),
            }
        }

        if !failures.is_empty() {
            return Err(ModelGateError::Other(format!(
                "insert_many wrote {} of {} documents:\n  - {}",
                result.inserted_ids.len(),
                result.inserted_ids.len() + failures.len(),
                failures.join("\n  - ")
            )));
        }
        Ok(result)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Option<Document>> {
        let single = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.find(collection, filter, &single).await?.into_iter().next())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let conn = self.conn.lock();
        let rows = matching(&conn, collection, filter, options.sort.as_ref())?;

        let skip = options.skip.unwrap_or(0) as usize;
        let limit = match options.limit {
            Some(0) | None => usize::MAX,
            Some(n) => n as usize,
        };

        rows.into_iter()
            .skip(skip)
            .take(limit)
            .map(|row| finish(row.doc, options.projection.as_ref()))
            .collect()
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        let (before, after, _) = update_one(
            &conn,
            collection,
            filter,
            update,
            options.upsert,
            options.sort.as_ref(),
            false,
        )?;

        let chosen = match options.return_document {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        };
        chosen
            .map(|doc| finish(doc, options.projection.as_ref()))
            .transpose()
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        let conn = self.conn.lock();
        update_all(&conn, collection, filter, update, options.upsert, false)
    }

    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOneAndDeleteOptions,
    ) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        let target = matching(&conn, collection, filter, options.sort.as_ref())?
            .into_iter()
            .next();

        match target {
            Some(row) => {
                delete_document(&conn, row.seq)?;
                finish(row.doc, options.projection.as_ref()).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Document,
        _options: &DeleteOptions,
    ) -> Result<DeleteResult> {
        let conn = self.conn.lock();
        let deleted_count = delete_matching(&conn, collection, filter, false)?;
        Ok(DeleteResult { deleted_count })
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: &Document,
        options: &CountOptions,
    ) -> Result<u64> {
        let conn = self.conn.lock();
        let total = matching(&conn, collection, filter, None)?.len() as u64;
        let after_skip = total.saturating_sub(options.skip.unwrap_or(0));
        Ok(match options.limit {
            Some(limit) if limit > 0 => after_skip.min(limit),
            _ => after_skip,
        })
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
        _options: &AggregateOptions,
    ) -> Result<Vec<Document>> {
        let conn = self.conn.lock();
        let docs = load_documents(&conn, collection)?
            .into_iter()
            .map(|row| row.doc)
            .collect();
        query::run_pipeline(docs, pipeline)
    }

    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteModel>,
        options: &BulkWriteOptions,
    ) -> Result<BulkWriteResult> {
        let conn = self.conn.lock();
        let mut result = BulkWriteResult::default();
        let mut failures = Vec::new();

        for (i, op) in operations.into_iter().enumerate() {
            if let Err(e) = apply_write(
                &conn,
                collection,
                op,
                options.bypass_document_validation,
                &mut result,
            ) {
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
        let conn = self.conn.lock();
        ensure_collection(&conn, collection)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    async fn drop_indexes(&self, collection: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM indexes WHERE collection = ?1",
            params![collection],
        )?;
        Ok(())
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String> {
        if index.key.is_empty() {
            return Err(ModelGateError::Other("Index key must name at least one field".into()));
        }

        let conn = self.conn.lock();
        ensure_collection(&conn, collection)?;
        let name = index.resolved_name();

        if index.unique {
            let docs = load_documents(&conn, collection)?;
            let keys: Vec<Vec<Option<Value>>> = docs
                .iter()
                .map(|row| index_key(index, &row.doc))
                .filter(|key| !(index.sparse && key.iter().all(Option::is_none)))
                .collect();
            for (i, key) in keys.iter().enumerate() {
                if keys[i + 1..].iter().any(|other| same_key(key, other)) {
                    return Err(ModelGateError::DuplicateKey {
                        collection: collection.to_string(),
                        index: name,
                    });
                }
            }
        }

        conn.execute(
            "INSERT OR REPLACE INTO indexes (collection, name, spec_json) VALUES (?1, ?2, ?3)",
            params![collection, name, serde_json::to_string(index)?],
        )?;
        Ok(name)
    }

    async fn set_validator(&self, collection: &str, descriptor: &ValidationDescriptor) -> Result<()> {
        let conn = self.conn.lock();
        ensure_collection(&conn, collection)?;
        conn.execute(
            "UPDATE collections SET validator_json = ?1 WHERE name = ?2",
            params![serde_json::to_string(descriptor)?, collection],
        )?;
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.conn.lock().execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.conn.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<()> {
        self.conn.lock().execute_batch("ROLLBACK")?;
        Ok(())
    }

    async fn stats(&self) -> Result<Value> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

        Ok(json!({
            "db": self.name,
            "collections": count("SELECT COUNT(*) FROM collections")?,
            "objects": count("SELECT COUNT(*) FROM documents")?,
            "indexes": count("SELECT COUNT(*) FROM indexes")?,
        }))
    }
}
