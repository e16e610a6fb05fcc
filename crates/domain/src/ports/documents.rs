//! Contract of the external document database.
//!
//! Services only ever talk to [`DocumentStore`]; the query, update and
//! filter types here are evaluated identically by every store so that a
//! constraint can move between the server query and a client-side residual
//! without changing results.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::BoxFuture;

/// Backend cap on the value list of `in` / `array-contains-any`.
pub const MAX_DISJUNCTION_VALUES: usize = 10;

pub type DocumentData = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath(String);

fn split_segments(path: &str) -> DomainResult<Vec<&str>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if segments.iter().any(|segment| segment.trim().is_empty()) {
        return Err(DomainError::Validation(format!(
            "path '{path}' contains an empty segment"
        )));
    }
    Ok(segments)
}

impl CollectionPath {
    pub fn new(path: impl AsRef<str>) -> DomainResult<Self> {
        let path = path.as_ref();
        let segments = split_segments(path)?;
        if segments.len() % 2 == 0 {
            return Err(DomainError::Validation(format!(
                "'{path}' is not a collection path"
            )));
        }
        Ok(Self(segments.join("/")))
    }

    /// Top-level collection from a literal name without separators.
    pub fn named(name: &'static str) -> Self {
        Self(name.to_string())
    }

    pub fn doc(&self, id: &str) -> DomainResult<DocumentPath> {
        DocumentPath::new(format!("{}/{id}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl DocumentPath {
    pub fn new(path: impl AsRef<str>) -> DomainResult<Self> {
        let path = path.as_ref();
        let segments = split_segments(path)?;
        if segments.len() % 2 != 0 {
            return Err(DomainError::Validation(format!(
                "'{path}' is not a document path"
            )));
        }
        Ok(Self(segments.join("/")))
    }

    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn collection(&self) -> CollectionPath {
        let parent = self
            .0
            .rsplit_once('/')
            .map(|(parent, _)| parent)
            .unwrap_or_default();
        CollectionPath(parent.to_string())
    }

    pub fn child(&self, collection: &str) -> DomainResult<CollectionPath> {
        CollectionPath::new(format!("{}/{collection}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub path: DocumentPath,
    pub data: DocumentData,
}

impl Document {
    pub fn new(path: DocumentPath, data: DocumentData) -> Self {
        Self { path, data }
    }

    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn field(&self, field: &str) -> Option<&Value> {
        lookup_field(&self.data, field)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> DomainResult<T> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|err| {
            DomainError::Unknown(format!("invalid document {}: {err}", self.path))
        })
    }
}

/// Serializes a record into stored document data.
pub fn to_document_data<T: Serialize>(value: &T) -> DomainResult<DocumentData> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(DomainError::Unknown(format!(
            "record serialized to non-object value: {other}"
        ))),
    }
}

/// Resolves a dotted field path (`completion.requestedBy`).
pub fn lookup_field<'a>(data: &'a DocumentData, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => {
            if let (Some(left), Some(right)) = (left.as_i64(), right.as_i64()) {
                return Some(left.cmp(&right));
            }
            left.as_f64()?.partial_cmp(&right.as_f64()?)
        }
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    ArrayContains,
    ArrayContainsAny,
    In,
}

impl FilterOp {
    pub fn is_range(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Le, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Ge, value)
    }

    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::ArrayContains, value)
    }

    pub fn array_contains_any(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOp::ArrayContainsAny, Value::Array(values))
    }

    pub fn in_values(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOp::In, Value::Array(values))
    }

    pub fn matches(&self, data: &DocumentData) -> bool {
        let Some(actual) = lookup_field(data, &self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::ArrayContains => actual
                .as_array()
                .is_some_and(|items| items.contains(&self.value)),
            FilterOp::ArrayContainsAny => {
                let (Some(items), Some(wanted)) = (actual.as_array(), self.value.as_array()) else {
                    return false;
                };
                wanted.iter().any(|value| items.contains(value))
            }
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.contains(actual)),
        }
    }
}

/// True when every filter accepts the document.
pub fn matches_all(filters: &[Filter], data: &DocumentData) -> bool {
    filters.iter().all(|filter| filter.matches(data))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub collection: CollectionPath,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    /// Position after which results resume.
    pub start_after: Option<Cursor>,
}

impl Query {
    pub fn new(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: None,
            limit: None,
            start_after: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        let mut disjunctions = 0;
        for filter in &self.filters {
            if !matches!(filter.op, FilterOp::ArrayContainsAny | FilterOp::In) {
                continue;
            }
            disjunctions += 1;
            let count = filter.value.as_array().map(Vec::len).ok_or_else(|| {
                DomainError::Validation(format!("filter on '{}' expects a list", filter.field))
            })?;
            if count == 0 || count > MAX_DISJUNCTION_VALUES {
                return Err(DomainError::Validation(format!(
                    "filter on '{}' must carry 1..={MAX_DISJUNCTION_VALUES} values",
                    filter.field
                )));
            }
        }
        if disjunctions > 1 {
            return Err(DomainError::Validation(
                "only one disjunctive filter is allowed per query".into(),
            ));
        }
        if self.limit == Some(0) {
            return Err(DomainError::Validation("query limit must be positive".into()));
        }
        Ok(())
    }

    /// Distinct fields constrained by this query's filters.
    pub fn filtered_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = Vec::new();
        for filter in &self.filters {
            if !fields.contains(&filter.field.as_str()) {
                fields.push(filter.field.as_str());
            }
        }
        fields
    }
}

fn compare_keys(
    left: (Option<&Value>, &str),
    right: (Option<&Value>, &str),
    order_by: Option<&OrderBy>,
) -> Ordering {
    let primary = order_by
        .map(|order| {
            let ordering = match (left.0, right.0) {
                (Some(l), Some(r)) => compare_values(l, r).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            }
        })
        .unwrap_or(Ordering::Equal);
    primary.then_with(|| left.1.cmp(right.1))
}

fn sort_key<'a>(document: &'a Document, order_by: Option<&OrderBy>) -> Option<&'a Value> {
    order_by.and_then(|order| document.field(&order.field))
}

/// Position of two documents under `order_by`; ties and unordered queries
/// fall back to the document id.
pub fn compare_documents(left: &Document, right: &Document, order_by: Option<&OrderBy>) -> Ordering {
    compare_keys(
        (sort_key(left, order_by), left.id()),
        (sort_key(right, order_by), right.id()),
        order_by,
    )
}

/// Resume position of a paged query: the sort value and id of the last
/// document read. It stays valid after that document is deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct Cursor {
    pub sort_value: Option<Value>,
    pub id: String,
}

impl Cursor {
    pub fn after(document: &Document, order_by: Option<&OrderBy>) -> Self {
        Self {
            sort_value: sort_key(document, order_by).cloned(),
            id: document.id().to_string(),
        }
    }

    /// Opaque token handed to callers as `nextCursor`.
    pub fn encode(&self) -> String {
        Value::Array(vec![
            self.sort_value.clone().unwrap_or(Value::Null),
            Value::String(self.id.clone()),
        ])
        .to_string()
    }

    pub fn decode(token: &str) -> DomainResult<Self> {
        let invalid = || DomainError::Validation(format!("invalid cursor '{token}'"));
        let parsed: Value = serde_json::from_str(token).map_err(|_| invalid())?;
        match parsed {
            Value::Array(mut parts) if parts.len() == 2 => {
                let id = match parts.pop() {
                    Some(Value::String(id)) if !id.is_empty() => id,
                    _ => return Err(invalid()),
                };
                let sort_value = parts.pop().filter(|value| !value.is_null());
                Ok(Self { sort_value, id })
            }
            _ => Err(invalid()),
        }
    }

    /// True when `document` sorts strictly after this position.
    pub fn precedes(&self, document: &Document, order_by: Option<&OrderBy>) -> bool {
        compare_keys(
            (sort_key(document, order_by), document.id()),
            (self.sort_value.as_ref(), &self.id),
            order_by,
        ) == Ordering::Greater
    }
}

pub fn sort_documents(documents: &mut [Document], order_by: Option<&OrderBy>) {
    documents.sort_by(|left, right| compare_documents(left, right, order_by));
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldUpdate {
    Set(Value),
    Increment(i64),
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
    Delete,
    ServerTimestamp,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Updates(Vec<(String, FieldUpdate)>);

impl Updates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((field.into(), FieldUpdate::Set(value.into())));
        self
    }

    pub fn increment(mut self, field: impl Into<String>, delta: i64) -> Self {
        self.0.push((field.into(), FieldUpdate::Increment(delta)));
        self
    }

    pub fn array_union(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.0.push((field.into(), FieldUpdate::ArrayUnion(values)));
        self
    }

    pub fn array_remove(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.0.push((field.into(), FieldUpdate::ArrayRemove(values)));
        self
    }

    pub fn delete(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), FieldUpdate::Delete));
        self
    }

    pub fn server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), FieldUpdate::ServerTimestamp));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, FieldUpdate)> {
        self.0.iter()
    }

    /// Applies every update in order; `now_ms` resolves server timestamps.
    pub fn apply(&self, data: &mut DocumentData, now_ms: i64) -> DomainResult<()> {
        for (field, update) in &self.0 {
            apply_field_update(data, field, update, now_ms)?;
        }
        Ok(())
    }
}

fn apply_field_update(
    data: &mut DocumentData,
    field: &str,
    update: &FieldUpdate,
    now_ms: i64,
) -> DomainResult<()> {
    let (parents, leaf) = match field.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, field),
    };
    let mut target = data;
    if let Some(parents) = parents {
        for part in parents.split('.') {
            let entry = target
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            target = entry.as_object_mut().ok_or_else(|| {
                DomainError::Unknown(format!("field '{field}' is not addressable"))
            })?;
        }
    }

    match update {
        FieldUpdate::Set(value) => {
            target.insert(leaf.to_string(), value.clone());
        }
        FieldUpdate::Delete => {
            target.remove(leaf);
        }
        FieldUpdate::ServerTimestamp => {
            target.insert(leaf.to_string(), Value::from(now_ms));
        }
        FieldUpdate::Increment(delta) => {
            let current = match target.get(leaf) {
                None | Some(Value::Null) => 0,
                Some(value) => value.as_i64().ok_or_else(|| {
                    DomainError::Validation(format!("cannot increment non-integer field '{field}'"))
                })?,
            };
            let next = current.checked_add(*delta).ok_or_else(|| {
                DomainError::Validation(format!("increment of '{field}' overflows"))
            })?;
            target.insert(leaf.to_string(), Value::from(next));
        }
        FieldUpdate::ArrayUnion(values) => {
            let mut items = match target.remove(leaf) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            for value in values {
                if !items.contains(value) {
                    items.push(value.clone());
                }
            }
            target.insert(leaf.to_string(), Value::Array(items));
        }
        FieldUpdate::ArrayRemove(values) => {
            let mut items = match target.remove(leaf) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            items.retain(|item| !values.contains(item));
            target.insert(leaf.to_string(), Value::Array(items));
        }
    }
    Ok(())
}

/// Recursively merges `patch` into `base`, keeping untouched keys.
pub fn merge_data(base: &mut DocumentData, patch: &DocumentData) {
    for (key, value) in patch {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_data(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    Set {
        path: DocumentPath,
        data: DocumentData,
    },
    Merge {
        path: DocumentPath,
        data: DocumentData,
    },
    Update {
        path: DocumentPath,
        updates: Updates,
    },
    /// Like `Update`, but starts from an empty document when missing.
    Upsert {
        path: DocumentPath,
        updates: Updates,
    },
    Delete {
        path: DocumentPath,
    },
}

impl WriteOp {
    pub fn path(&self) -> &DocumentPath {
        match self {
            WriteOp::Set { path, .. }
            | WriteOp::Merge { path, .. }
            | WriteOp::Update { path, .. }
            | WriteOp::Upsert { path, .. }
            | WriteOp::Delete { path } => path,
        }
    }
}

/// Ordered writes committed all-or-nothing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: DocumentPath, data: DocumentData) -> &mut Self {
        self.ops.push(WriteOp::Set { path, data });
        self
    }

    pub fn merge(&mut self, path: DocumentPath, data: DocumentData) -> &mut Self {
        self.ops.push(WriteOp::Merge { path, data });
        self
    }

    pub fn update(&mut self, path: DocumentPath, updates: Updates) -> &mut Self {
        self.ops.push(WriteOp::Update { path, updates });
        self
    }

    pub fn upsert(&mut self, path: DocumentPath, updates: Updates) -> &mut Self {
        self.ops.push(WriteOp::Upsert { path, updates });
        self
    }

    pub fn delete(&mut self, path: DocumentPath) -> &mut Self {
        self.ops.push(WriteOp::Delete { path });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Everything a transaction reads before planning its writes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionReads {
    pub documents: Vec<DocumentPath>,
    pub queries: Vec<Query>,
}

impl TransactionReads {
    pub fn new(documents: Vec<DocumentPath>) -> Self {
        Self {
            documents,
            queries: Vec::new(),
        }
    }

    pub fn query(mut self, query: Query) -> Self {
        self.queries.push(query);
        self
    }

    /// Collection label used for logs and metrics.
    pub fn primary_collection(&self) -> Option<CollectionPath> {
        self.documents
            .first()
            .map(DocumentPath::collection)
            .or_else(|| self.queries.first().map(|query| query.collection.clone()))
    }
}

impl From<Vec<DocumentPath>> for TransactionReads {
    fn from(documents: Vec<DocumentPath>) -> Self {
        Self::new(documents)
    }
}

/// Documents and query results read at the start of a transaction. Only
/// reads declared up front are available, so every read precedes every
/// write.
#[derive(Clone, Debug, Default)]
pub struct TransactionSnapshot {
    documents: HashMap<DocumentPath, Option<Document>>,
    queries: Vec<(Query, Vec<Document>)>,
}

impl TransactionSnapshot {
    pub fn new(documents: HashMap<DocumentPath, Option<Document>>) -> Self {
        Self {
            documents,
            queries: Vec::new(),
        }
    }

    pub fn with_query(mut self, query: Query, results: Vec<Document>) -> Self {
        self.queries.push((query, results));
        self
    }

    pub fn get(&self, path: &DocumentPath) -> DomainResult<Option<&Document>> {
        self.documents
            .get(path)
            .map(Option::as_ref)
            .ok_or_else(|| {
                DomainError::Unknown(format!("{path} was not declared as a transaction read"))
            })
    }

    pub fn require(&self, path: &DocumentPath, what: &str) -> DomainResult<&Document> {
        self.get(path)?
            .ok_or_else(|| DomainError::not_found(format!("{what} {}", path.id())))
    }

    pub fn query(&self, query: &Query) -> DomainResult<&[Document]> {
        self.queries
            .iter()
            .find(|(declared, _)| declared == query)
            .map(|(_, results)| results.as_slice())
            .ok_or_else(|| {
                DomainError::Unknown(format!(
                    "query on {} was not declared as a transaction read",
                    query.collection
                ))
            })
    }
}

pub type TransactionPlan =
    Box<dyn FnOnce(&TransactionSnapshot) -> DomainResult<WriteBatch> + Send + 'static>;

#[allow(clippy::needless_pass_by_value)]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn get(&self, path: &DocumentPath) -> BoxFuture<'_, DomainResult<Option<Document>>>;

    fn set(&self, path: &DocumentPath, data: DocumentData) -> BoxFuture<'_, DomainResult<()>>;

    fn update(&self, path: &DocumentPath, updates: Updates) -> BoxFuture<'_, DomainResult<()>>;

    fn delete(&self, path: &DocumentPath) -> BoxFuture<'_, DomainResult<()>>;

    fn query(&self, query: &Query) -> BoxFuture<'_, DomainResult<Vec<Document>>>;

    fn commit(&self, batch: WriteBatch) -> BoxFuture<'_, DomainResult<()>>;

    /// Reads `reads`, hands them to `plan` and atomically commits the writes
    /// it returns. An error from `plan` aborts without writing.
    fn run_transaction(
        &self,
        reads: TransactionReads,
        plan: TransactionPlan,
    ) -> BoxFuture<'_, DomainResult<()>>;
}

/// Runs a transaction whose plan also yields a typed result.
pub async fn transaction<T, F>(
    store: &dyn DocumentStore,
    reads: impl Into<TransactionReads>,
    plan: F,
) -> DomainResult<T>
where
    T: Send + 'static,
    F: FnOnce(&TransactionSnapshot) -> DomainResult<(WriteBatch, T)> + Send + 'static,
{
    let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let plan_slot = slot.clone();
    store
        .run_transaction(
            reads.into(),
            Box::new(move |snapshot| {
                let (batch, output) = plan(snapshot)?;
                *plan_slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(output);
                Ok(batch)
            }),
        )
        .await?;
    let output = slot
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    output.ok_or_else(|| DomainError::Unknown("transaction produced no result".into()))
}
