// Query evaluation over JSON documents: filters, updates, projection, sort
// and aggregation pipelines. Used by the embedded driver and by validators
// that carry query expressions.

use crate::document::{type_name, Document};
use crate::error::{ModelGateError, Result};
use crate::id::{ext_json, ObjectId, ID_FIELD};
use regex::RegexBuilder;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

// ── Paths ──────────────────────────────────────────────────────────

/// Resolve a dotted path (`address.city`, `tags.0`) inside a document.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;

    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects. Returns the previous value.
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<Option<Value>> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };

    let target = match parent {
        None => doc,
        Some(parent) => {
            let mut current = doc;
            for part in parent.split('.') {
                let entry = current
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                current = match entry {
                    Value::Object(map) => map,
                    other => {
                        return Err(ModelGateError::Query(format!(
                            "Cannot create field '{path}': '{part}' is a {}",
                            type_name(other)
                        )))
                    }
                };
            }
            current
        }
    };

    Ok(target.insert(last.to_string(), value))
}

/// Remove a dotted path. Returns the removed value.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.remove(path),
        Some((parent, last)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = current.get_mut(part)?.as_object_mut()?;
            }
            current.remove(last)
        }
    }
}

// ── Comparison ─────────────────────────────────────────────────────

/// Canonical ordering of value kinds used when sorting mixed types.
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(v @ Value::Object(_)) if ext_json::is_oid(v) => 5,
        Some(v @ Value::Object(_)) if ext_json::is_date(v) => 7,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 6,
    }
}

/// Compare two values of the same kind. `None` when the kinds differ or do
/// not have an order.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Object(_), Value::Object(_)) => {
            if let (Some(x), Some(y)) = (ext_json::as_date(a), ext_json::as_date(b)) {
                return Some(x.cmp(&y));
            }
            if let (Some(x), Some(y)) = (ext_json::as_oid(a), ext_json::as_oid(b)) {
                return Some(x.bytes().cmp(&y.bytes()));
            }
            None
        }
        _ => None,
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
        }
        _ => a == b,
    }
}

fn total_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

// ── Filters ────────────────────────────────────────────────────────

fn is_operator_doc(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            !map.is_empty()
                && map.keys().all(|k| k.starts_with('$'))
                && !ext_json::is_oid(value)
                && !ext_json::is_date(value)
        }
        _ => false,
    }
}

fn sub_filters<'a>(op: &str, operand: &'a Value) -> Result<Vec<&'a Document>> {
    let items = operand
        .as_array()
        .ok_or_else(|| ModelGateError::Query(format!("{op} expects an array of filters")))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| ModelGateError::Query(format!("{op} entries must be documents")))
        })
        .collect()
}

/// Whether `doc` satisfies `filter`. An empty filter matches everything.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in sub_filters(key, condition)? {
                    if !matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in sub_filters(key, condition)? {
                    if matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for sub in sub_filters(key, condition)? {
                    if matches(doc, sub)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(ModelGateError::Query(format!(
                    "Unknown top level operator: {op}"
                )))
            }
            path => matches_condition(get_path(doc, path), condition)?,
        };

        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn equals_condition(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(v @ Value::Array(items)) => {
            items.iter().any(|item| values_equal(item, expected)) || values_equal(v, expected)
        }
        Some(v) => values_equal(v, expected),
    }
}

fn compare_condition(value: Option<&Value>, operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    match value {
        None => false,
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare_values(item, operand).map(accept).unwrap_or(false)),
        Some(v) => compare_values(v, operand).map(accept).unwrap_or(false),
    }
}

fn matches_condition(value: Option<&Value>, condition: &Value) -> Result<bool> {
    let ops = match condition.as_object() {
        Some(ops) if is_operator_doc(condition) => ops,
        _ => return Ok(equals_condition(value, condition)),
    };

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_condition(value, operand),
            "$ne" => !equals_condition(value, operand),
            "$gt" => compare_condition(value, operand, |o| o == Ordering::Greater),
            "$gte" => compare_condition(value, operand, |o| o != Ordering::Less),
            "$lt" => compare_condition(value, operand, |o| o == Ordering::Less),
            "$lte" => compare_condition(value, operand, |o| o != Ordering::Greater),
            "$in" => in_list(value, operand)?,
            "$nin" => !in_list(value, operand)?,
            "$exists" => value.is_some() == operand.as_bool().unwrap_or(true),
            "$regex" => {
                let options = ops
                    .get("$options")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                regex_matches(value, operand, options)?
            }
            "$options" => true,
            "$not" => !matches_condition(value, operand)?,
            other => {
                return Err(ModelGateError::Query(format!("Unknown operator: {other}")));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(value: Option<&Value>, operand: &Value) -> Result<bool> {
    let candidates = operand
        .as_array()
        .ok_or_else(|| ModelGateError::Query("$in/$nin needs an array".into()))?;
    Ok(candidates.iter().any(|c| equals_condition(value, c)))
}

fn regex_matches(value: Option<&Value>, pattern: &Value, options: &str) -> Result<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| ModelGateError::Query("$regex needs a string pattern".into()))?;
    let re = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .build()
        .map_err(|e| ModelGateError::Query(format!("Invalid $regex: {e}")))?;

    Ok(match value {
        Some(Value::String(s)) => re.is_match(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .any(|s| re.is_match(s)),
        _ => false,
    })
}

/// Equality fields of a filter, used to seed a document created by an upsert.
pub fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        let literal = match value {
            v if is_operator_doc(v) => match v.get("$eq") {
                Some(eq) => eq.clone(),
                None => continue,
            },
            v => v.clone(),
        };
        // Dotted paths that collide with scalars are dropped from the seed.
        let _ = set_path(&mut seed, key, literal);
    }
    seed
}

// ── Updates ────────────────────────────────────────────────────────

/// Apply an operator update (`$set`, `$unset`, `$inc`, `$push`,
/// `$setOnInsert`). Returns whether the document changed.
pub fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> Result<bool> {
    if update.is_empty() || update.keys().any(|k| !k.starts_with('$')) {
        return Err(ModelGateError::Query(
            "Update document requires atomic operators".into(),
        ));
    }

    let mut modified = false;
    for (op, fields) in update {
        let fields = fields.as_object().ok_or_else(|| {
            ModelGateError::Query(format!("Modifier {op} expects a document"))
        })?;

        for (path, value) in fields {
            if path == ID_FIELD && op != "$setOnInsert" {
                let unchanged = op == "$set" && doc.get(ID_FIELD) == Some(value);
                if !unchanged {
                    return Err(ModelGateError::Query(format!(
                        "Performing an update on the path '{ID_FIELD}' would modify the immutable field '{ID_FIELD}'"
                    )));
                }
                continue;
            }

            match op.as_str() {
                "$set" => {
                    let previous = set_path(doc, path, value.clone())?;
                    modified |= previous.as_ref() != Some(value);
                }
                "$setOnInsert" => {
                    if inserting {
                        set_path(doc, path, value.clone())?;
                        modified = true;
                    }
                }
                "$unset" => {
                    modified |= remove_path(doc, path).is_some();
                }
                "$inc" => {
                    let next = increment(get_path(doc, path), value, path)?;
                    set_path(doc, path, next)?;
                    modified = true;
                }
                "$push" => {
                    let mut items = match get_path(doc, path) {
                        None => Vec::new(),
                        Some(Value::Array(items)) => items.clone(),
                        Some(other) => {
                            return Err(ModelGateError::Query(format!(
                                "The field '{path}' must be an array but is of type {}",
                                type_name(other)
                            )))
                        }
                    };
                    match value.get("$each") {
                        Some(Value::Array(each)) => items.extend(each.iter().cloned()),
                        _ => items.push(value.clone()),
                    }
                    set_path(doc, path, Value::Array(items))?;
                    modified = true;
                }
                other => {
                    return Err(ModelGateError::Query(format!(
                        "Unknown modifier: {other}"
                    )))
                }
            }
        }
    }
    Ok(modified)
}

fn increment(current: Option<&Value>, by: &Value, path: &str) -> Result<Value> {
    let by_num = match by {
        Value::Number(n) => n,
        _ => {
            return Err(ModelGateError::Query(format!(
                "Cannot increment '{path}' by a non-number"
            )))
        }
    };

    let current = match current {
        None | Some(Value::Null) => return Ok(Value::Number(by_num.clone())),
        Some(Value::Number(n)) => n,
        Some(other) => {
            return Err(ModelGateError::Query(format!(
                "Cannot apply $inc to '{path}' of type {}",
                type_name(other)
            )))
        }
    };

    if let (Some(a), Some(b)) = (current.as_i64(), by_num.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Value::Number(sum.into()));
        }
    }
    let sum = current.as_f64().unwrap_or(0.0) + by_num.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| ModelGateError::Query(format!("$inc on '{path}' produced a non-finite number")))
}

// ── Projection / sort ──────────────────────────────────────────────

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        _ => true,
    }
}

/// Apply an inclusion or exclusion projection on top-level fields.
pub fn project(doc: &Document, projection: &Document) -> Result<Document> {
    if projection.is_empty() {
        return Ok(doc.clone());
    }

    let include_id = projection.get(ID_FIELD).map(truthy).unwrap_or(true);
    let fields: Vec<(&String, bool)> = projection
        .iter()
        .filter(|(k, _)| k.as_str() != ID_FIELD)
        .map(|(k, v)| (k, truthy(v)))
        .collect();

    let inclusive = fields.iter().any(|(_, on)| *on);
    if inclusive && fields.iter().any(|(_, on)| !*on) {
        return Err(ModelGateError::Query(
            "Projection cannot mix inclusion and exclusion".into(),
        ));
    }

    let mut out = Document::new();
    if inclusive {
        if include_id {
            if let Some(id) = doc.get(ID_FIELD) {
                out.insert(ID_FIELD.to_string(), id.clone());
            }
        }
        for (field, _) in &fields {
            if let Some(v) = get_path(doc, field) {
                set_path(&mut out, field, v.clone())?;
            }
        }
    } else {
        out = doc.clone();
        if !include_id {
            out.remove(ID_FIELD);
        }
        for (field, _) in &fields {
            remove_path(&mut out, field);
        }
    }
    Ok(out)
}

/// Sort documents by a `{ field: 1 | -1, ... }` specification.
pub fn sort_documents(docs: &mut [Document], sort: &Document) -> Result<()> {
    sort_by_spec(docs, sort, |doc| doc)
}

/// Sort any items carrying a document. The sort is stable.
pub fn sort_by_spec<T>(
    items: &mut [T],
    sort: &Document,
    doc_of: impl Fn(&T) -> &Document,
) -> Result<()> {
    let mut keys = Vec::with_capacity(sort.len());
    for (field, direction) in sort {
        let dir = match direction.as_i64() {
            Some(1) => Ordering::Less,
            Some(-1) => Ordering::Greater,
            _ => {
                return Err(ModelGateError::Query(format!(
                    "Sort direction for '{field}' must be 1 or -1"
                )))
            }
        };
        keys.push((field.as_str(), dir));
    }

    items.sort_by(|a, b| {
        let (a, b) = (doc_of(a), doc_of(b));
        for (field, dir) in &keys {
            let ord = total_order(get_path(a, field), get_path(b, field));
            let ord = if *dir == Ordering::Greater { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

// ── Aggregation ────────────────────────────────────────────────────

fn as_count(stage: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| ModelGateError::Query(format!("{stage} expects a non-negative integer")))
}

/// Run an aggregation pipeline over a set of documents. Supported stages:
/// `$match`, `$sort`, `$skip`, `$limit`, `$project`, `$unset`, `$count`.
pub fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>> {
    for stage in pipeline {
        let (name, spec) = match (stage.len(), stage.iter().next()) {
            (1, Some(entry)) => entry,
            _ => {
                return Err(ModelGateError::Query(
                    "A pipeline stage specification must contain exactly one field".into(),
                ))
            }
        };

        docs = match name.as_str() {
            "$match" => {
                let filter = spec
                    .as_object()
                    .ok_or_else(|| ModelGateError::Query("$match expects a document".into()))?;
                let mut kept = Vec::new();
                for doc in docs {
                    if matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$sort" => {
                let sort = spec
                    .as_object()
                    .ok_or_else(|| ModelGateError::Query("$sort expects a document".into()))?;
                sort_documents(&mut docs, sort)?;
                docs
            }
            "$skip" => {
                let n = as_count(name, spec)?;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = as_count(name, spec)?;
                docs.truncate(n);
                docs
            }
            "$project" => {
                let projection = spec
                    .as_object()
                    .ok_or_else(|| ModelGateError::Query("$project expects a document".into()))?;
                docs.iter()
                    .map(|d| project(d, projection))
                    .collect::<Result<Vec<_>>>()?
            }
            "$unset" => {
                let fields: Vec<&str> = match spec {
                    Value::String(s) => vec![s.as_str()],
                    Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                    _ => {
                        return Err(ModelGateError::Query(
                            "$unset expects a field name or a list of field names".into(),
                        ))
                    }
                };
                for doc in docs.iter_mut() {
                    for field in &fields {
                        remove_path(doc, field);
                    }
                }
                docs
            }
            "$count" => {
                let field = spec
                    .as_str()
                    .filter(|s| !s.is_empty() && !s.starts_with('$'))
                    .ok_or_else(|| ModelGateError::Query("$count expects a field name".into()))?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Document::new();
                    out.insert(field.to_string(), Value::Number(docs.len().into()));
                    vec![out]
                }
            }
            other => {
                return Err(ModelGateError::Query(format!(
                    "Unsupported pipeline stage: {other}"
                )))
            }
        };
    }
    Ok(docs)
}
