use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::changes::{
    ChangeFeed, ChangeKind, ChangeSink, DocumentChange, WatchHandle, WatchTarget,
};
use crate::ports::documents::{
    Document, DocumentData, DocumentPath, DocumentStore, Query, TransactionPlan, TransactionReads,
    TransactionSnapshot, Updates, WriteBatch, WriteOp, matches_all, merge_data, sort_documents,
};
use crate::util::now_ms;

type Collections = BTreeMap<String, BTreeMap<String, DocumentData>>;

struct Watcher {
    target: WatchTarget,
    sink: ChangeSink,
}

#[derive(Debug)]
struct CommittedChange {
    path: DocumentPath,
    before: Option<DocumentData>,
    after: Option<DocumentData>,
}

/// Document store held in process memory.
///
/// Batches and transactions are applied all-or-nothing under one write
/// lock. Change watchers are notified after the lock is released. Field
/// pairs registered with [`InMemoryDocumentStore::with_missing_index`] make
/// queries combining them fail with [`DomainError::IndexRequired`].
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<Collections>,
    watchers: Arc<Mutex<HashMap<u64, Watcher>>>,
    next_watch_id: AtomicU64,
    missing_indexes: Vec<(String, String, String)>,
    query_log: Option<Mutex<Vec<Query>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulates a backend without a composite index on `first`+`second` for
    /// the collection group `collection`.
    pub fn with_missing_index(
        mut self,
        collection: impl Into<String>,
        first: impl Into<String>,
        second: impl Into<String>,
    ) -> Self {
        self.missing_indexes
            .push((collection.into(), first.into(), second.into()));
        self
    }

    pub fn with_missing_indexes<'a>(
        self,
        gaps: impl IntoIterator<Item = &'a (&'a str, &'a str, &'a str)>,
    ) -> Self {
        gaps.into_iter()
            .fold(self, |store, (collection, first, second)| {
                store.with_missing_index(*collection, *first, *second)
            })
    }

    /// Keeps every executed query for [`Self::executed_queries`].
    pub fn recording_queries(mut self) -> Self {
        self.query_log = Some(Mutex::new(Vec::new()));
        self
    }

    /// Queries executed so far, in order; empty unless recording.
    pub fn executed_queries(&self) -> Vec<Query> {
        self.query_log
            .as_ref()
            .map(|log| {
                log.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone()
            })
            .unwrap_or_default()
    }

    fn record(&self, query: &Query) {
        if let Some(log) = &self.query_log {
            log.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(query.clone());
        }
    }

    pub async fn document_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn check_indexes(&self, query: &Query) -> DomainResult<()> {
        let group = query
            .collection
            .as_str()
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let fields = query.filtered_fields();
        for (collection, first, second) in &self.missing_indexes {
            if collection == group
                && fields.contains(&first.as_str())
                && fields.contains(&second.as_str())
            {
                return Err(DomainError::IndexRequired(format!(
                    "{group}: {first} + {second}"
                )));
            }
        }
        Ok(())
    }

    fn read_document(collections: &Collections, path: &DocumentPath) -> Option<Document> {
        collections
            .get(path.collection().as_str())
            .and_then(|documents| documents.get(path.id()))
            .map(|data| Document::new(path.clone(), data.clone()))
    }

    fn run_query(&self, collections: &Collections, query: &Query) -> DomainResult<Vec<Document>> {
        query.validate()?;
        self.check_indexes(query)?;
        self.record(query);

        let Some(documents) = collections.get(query.collection.as_str()) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<Document> = documents
            .iter()
            .filter(|(_, data)| matches_all(&query.filters, data))
            .map(|(id, data)| {
                query
                    .collection
                    .doc(id)
                    .map(|path| Document::new(path, data.clone()))
            })
            .collect::<DomainResult<_>>()?;
        sort_documents(&mut matched, query.order_by.as_ref());

        if let Some(cursor) = &query.start_after {
            matched.retain(|doc| cursor.precedes(doc, query.order_by.as_ref()));
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    fn apply_ops(
        collections: &mut Collections,
        ops: Vec<WriteOp>,
    ) -> DomainResult<Vec<CommittedChange>> {
        let now = now_ms();
        let mut staged: HashMap<DocumentPath, Option<DocumentData>> = HashMap::new();
        let mut before: HashMap<DocumentPath, Option<DocumentData>> = HashMap::new();
        let mut touched: Vec<DocumentPath> = Vec::new();

        for op in ops {
            let path = op.path().clone();
            if !staged.contains_key(&path) {
                let original = Self::read_document(collections, &path).map(|doc| doc.data);
                before.insert(path.clone(), original.clone());
                staged.insert(path.clone(), original);
                touched.push(path.clone());
            }
            let current = staged.get(&path).cloned().flatten();
            let next = match op {
                WriteOp::Set { data, .. } => Some(data),
                WriteOp::Merge { data, .. } => {
                    let mut merged = current.unwrap_or_default();
                    merge_data(&mut merged, &data);
                    Some(merged)
                }
                WriteOp::Update { updates, .. } => {
                    let mut existing =
                        current.ok_or_else(|| DomainError::not_found(path.to_string()))?;
                    updates.apply(&mut existing, now)?;
                    Some(existing)
                }
                WriteOp::Upsert { updates, .. } => {
                    let mut existing = current.unwrap_or_default();
                    updates.apply(&mut existing, now)?;
                    Some(existing)
                }
                WriteOp::Delete { .. } => None,
            };
            staged.insert(path, next);
        }

        let mut changes = Vec::with_capacity(touched.len());
        for path in touched {
            let after = staged.remove(&path).flatten();
            let previous = before.remove(&path).flatten();
            let collection = path.collection().as_str().to_string();
            match &after {
                Some(data) => {
                    collections
                        .entry(collection)
                        .or_default()
                        .insert(path.id().to_string(), data.clone());
                }
                None => {
                    if let Some(documents) = collections.get_mut(&collection) {
                        documents.remove(path.id());
                    }
                }
            }
            if previous != after {
                changes.push(CommittedChange {
                    path,
                    before: previous,
                    after,
                });
            }
        }
        Ok(changes)
    }

    fn notify(&self, changes: Vec<CommittedChange>) {
        if changes.is_empty() {
            return;
        }
        let deliveries: Vec<(ChangeSink, DocumentChange)> = {
            let watchers = self
                .watchers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut deliveries = Vec::new();
            for change in &changes {
                for watcher in watchers.values() {
                    if let Some(event) = Self::event_for(&watcher.target, change) {
                        deliveries.push((watcher.sink.clone(), event));
                    }
                }
            }
            deliveries
        };
        for (sink, event) in deliveries {
            sink(&event);
        }
    }

    fn event_for(target: &WatchTarget, change: &CommittedChange) -> Option<DocumentChange> {
        let (was_visible, is_visible) = match target {
            WatchTarget::Document(path) => {
                if path != &change.path {
                    return None;
                }
                (change.before.is_some(), change.after.is_some())
            }
            WatchTarget::Collection(query) => {
                if query.collection != change.path.collection() {
                    return None;
                }
                (
                    change
                        .before
                        .as_ref()
                        .is_some_and(|data| matches_all(&query.filters, data)),
                    change
                        .after
                        .as_ref()
                        .is_some_and(|data| matches_all(&query.filters, data)),
                )
            }
        };
        let kind = match (was_visible, is_visible) {
            (false, true) => ChangeKind::Added,
            (true, true) => ChangeKind::Modified,
            (true, false) => ChangeKind::Removed,
            (false, false) => return None,
        };
        let document = if is_visible {
            change
                .after
                .clone()
                .map(|data| Document::new(change.path.clone(), data))
        } else {
            None
        };
        Some(DocumentChange {
            kind,
            path: change.path.clone(),
            document,
        })
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, path: &DocumentPath) -> BoxFuture<'_, DomainResult<Option<Document>>> {
        let path = path.clone();
        Box::pin(async move {
            let collections = self.collections.read().await;
            Ok(Self::read_document(&collections, &path))
        })
    }

    fn set(&self, path: &DocumentPath, data: DocumentData) -> BoxFuture<'_, DomainResult<()>> {
        let mut batch = WriteBatch::new();
        batch.set(path.clone(), data);
        self.commit(batch)
    }

    fn update(&self, path: &DocumentPath, updates: Updates) -> BoxFuture<'_, DomainResult<()>> {
        let mut batch = WriteBatch::new();
        batch.update(path.clone(), updates);
        self.commit(batch)
    }

    fn delete(&self, path: &DocumentPath) -> BoxFuture<'_, DomainResult<()>> {
        let mut batch = WriteBatch::new();
        batch.delete(path.clone());
        self.commit(batch)
    }

    fn query(&self, query: &Query) -> BoxFuture<'_, DomainResult<Vec<Document>>> {
        let query = query.clone();
        Box::pin(async move {
            let collections = self.collections.read().await;
            self.run_query(&collections, &query)
        })
    }

    fn commit(&self, batch: WriteBatch) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            let changes = {
                let mut collections = self.collections.write().await;
                Self::apply_ops(&mut collections, batch.into_ops())?
            };
            self.notify(changes);
            Ok(())
        })
    }

    fn run_transaction(
        &self,
        reads: TransactionReads,
        plan: TransactionPlan,
    ) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            let changes = {
                let mut collections = self.collections.write().await;
                let mut snapshot = TransactionSnapshot::new(
                    reads
                        .documents
                        .into_iter()
                        .map(|path| {
                            let document = Self::read_document(&collections, &path);
                            (path, document)
                        })
                        .collect(),
                );
                for query in reads.queries {
                    let results = self.run_query(&collections, &query)?;
                    snapshot = snapshot.with_query(query, results);
                }
                let batch = plan(&snapshot)?;
                Self::apply_ops(&mut collections, batch.into_ops())?
            };
            self.notify(changes);
            Ok(())
        })
    }
}

impl ChangeFeed for InMemoryDocumentStore {
    fn watch(&self, target: WatchTarget, sink: ChangeSink) -> DomainResult<WatchHandle> {
        if let WatchTarget::Collection(query) = &target {
            query.validate()?;
        }
        let id = self.next_watch_id.fetch_add(1, AtomicOrdering::Relaxed);
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Watcher { target, sink });
        let watchers = self.watchers.clone();
        Ok(WatchHandle::new(move || {
            watchers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);
        }))
    }
}
