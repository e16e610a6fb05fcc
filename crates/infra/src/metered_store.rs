use std::sync::Arc;
use std::time::Instant;

use swapboard_domain::DomainResult;
use swapboard_domain::ports::BoxFuture;
use swapboard_domain::ports::documents::{
    Document, DocumentData, DocumentPath, DocumentStore, Query, TransactionPlan, TransactionReads,
    Updates, WriteBatch,
};

use crate::observability::register_document_op;

/// Records a counter and latency histogram for every call into the wrapped
/// store, labelled by collection group.
#[derive(Clone)]
pub struct MeteredDocumentStore {
    inner: Arc<dyn DocumentStore>,
}

impl MeteredDocumentStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self { inner }
    }
}

fn group(collection: &str) -> &str {
    collection.rsplit('/').next().unwrap_or(collection)
}

fn observe<T>(collection: &str, op: &'static str, started: Instant, result: &DomainResult<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => err.code(),
    };
    if let Err(err) = result {
        tracing::debug!(collection = %collection, op, error = %err, "document operation failed");
    }
    register_document_op(
        group(collection),
        op,
        outcome,
        started.elapsed().as_secs_f64() * 1000.0,
    );
}

fn batch_collection(batch: &WriteBatch) -> String {
    batch
        .ops()
        .first()
        .map(|op| op.path().collection().as_str().to_string())
        .unwrap_or_else(|| "batch".to_string())
}

impl DocumentStore for MeteredDocumentStore {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn get(&self, path: &DocumentPath) -> BoxFuture<'_, DomainResult<Option<Document>>> {
        let path = path.clone();
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.get(&path).await;
            observe(path.collection().as_str(), "get", started, &result);
            result
        })
    }

    fn set(&self, path: &DocumentPath, data: DocumentData) -> BoxFuture<'_, DomainResult<()>> {
        let path = path.clone();
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.set(&path, data).await;
            observe(path.collection().as_str(), "set", started, &result);
            result
        })
    }

    fn update(&self, path: &DocumentPath, updates: Updates) -> BoxFuture<'_, DomainResult<()>> {
        let path = path.clone();
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.update(&path, updates).await;
            observe(path.collection().as_str(), "update", started, &result);
            result
        })
    }

    fn delete(&self, path: &DocumentPath) -> BoxFuture<'_, DomainResult<()>> {
        let path = path.clone();
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.delete(&path).await;
            observe(path.collection().as_str(), "delete", started, &result);
            result
        })
    }

    fn query(&self, query: &Query) -> BoxFuture<'_, DomainResult<Vec<Document>>> {
        let query = query.clone();
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.query(&query).await;
            observe(query.collection.as_str(), "query", started, &result);
            result
        })
    }

    fn commit(&self, batch: WriteBatch) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            let collection = batch_collection(&batch);
            let started = Instant::now();
            let result = self.inner.commit(batch).await;
            observe(&collection, "commit", started, &result);
            result
        })
    }

    fn run_transaction(
        &self,
        reads: TransactionReads,
        plan: TransactionPlan,
    ) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            let collection = reads
                .primary_collection()
                .map(|collection| collection.as_str().to_string())
                .unwrap_or_else(|| "transaction".to_string());
            let started = Instant::now();
            let result = self.inner.run_transaction(reads, plan).await;
            observe(&collection, "transaction", started, &result);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swapboard_domain::memory_store::InMemoryDocumentStore;
    use serde_json::json;

    #[test]
    fn groups_subcollections_by_last_segment() {
        assert_eq!(group("collaborations/c1/roles"), "roles");
        assert_eq!(group("trades"), "trades");
    }

    #[tokio::test]
    async fn delegates_to_the_inner_store() {
        let store = MeteredDocumentStore::new(Arc::new(InMemoryDocumentStore::new()));
        let path = DocumentPath::new("trades/t1").unwrap();
        store
            .set(&path, json!({ "status": "open" }).as_object().cloned().unwrap())
            .await
            .unwrap();

        let document = store.get(&path).await.unwrap().unwrap();
        assert_eq!(document.data["status"], "open");
        assert_eq!(store.name(), "memory");
    }
}
