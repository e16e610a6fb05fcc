use serde::Serialize;

use crate::DomainResult;
use crate::ports::documents::{Cursor, Document, DocumentStore, Query};

pub const DEFAULT_MAX_BATCHES: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub cursor: Option<String>,
    pub max_batches: usize,
}

impl PageRequest {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            cursor: None,
            max_batches: DEFAULT_MAX_BATCHES,
        }
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = max_batches.max(1);
        self
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilteredPage<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    /// Position of the last raw document consumed; pass it back as cursor.
    pub next_cursor: Option<String>,
    pub batches_fetched: usize,
}

impl<T> FilteredPage<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> FilteredPage<U> {
        FilteredPage {
            items: self.items.into_iter().map(f).collect(),
            has_more: self.has_more,
            next_cursor: self.next_cursor,
            batches_fetched: self.batches_fetched,
        }
    }
}

/// Clamps a caller-supplied page size into `1..=max`.
pub fn normalize_limit(limit: Option<usize>, default: usize, max: usize) -> usize {
    limit.unwrap_or(default).clamp(1, max.max(1))
}

/// Fills one page of records matching `predicate`, fetching raw batches of
/// `request.limit` documents until the page is full, the data runs out or
/// `request.max_batches` batches were read.
///
/// Documents that fail to decode are logged and skipped.
pub async fn fetch_filtered_page<T, D, P>(
    store: &dyn DocumentStore,
    query: &Query,
    request: &PageRequest,
    decode: D,
    predicate: P,
) -> DomainResult<FilteredPage<T>>
where
    D: Fn(&Document) -> DomainResult<T>,
    P: Fn(&Document, &T) -> bool,
{
    let limit = request.limit.max(1);
    let mut cursor = request.cursor.as_deref().map(Cursor::decode).transpose()?;
    let mut items = Vec::with_capacity(limit);
    let mut batches_fetched = 0;

    let has_more = loop {
        if batches_fetched >= request.max_batches.max(1) {
            break true;
        }
        let batch = query
            .clone()
            .limit(limit)
            .start_after(cursor.clone());
        let raw = store.query(&batch).await?;
        batches_fetched += 1;
        let exhausted = raw.len() < limit;

        let mut consumed = 0;
        for document in &raw {
            consumed += 1;
            cursor = Some(Cursor::after(document, query.order_by.as_ref()));
            match decode(document) {
                Ok(record) => {
                    if predicate(document, &record) {
                        items.push(record);
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %document.path, error = %err, "skipping undecodable document");
                }
            }
            if items.len() == limit {
                break;
            }
        }

        if items.len() == limit {
            break consumed < raw.len() || !exhausted;
        }
        if exhausted {
            break false;
        }
    };

    Ok(FilteredPage {
        items,
        has_more,
        next_cursor: if has_more {
            cursor.map(|cursor| cursor.encode())
        } else {
            None
        },
        batches_fetched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryDocumentStore;
    use crate::ports::documents::{CollectionPath, Direction, DocumentData};
    use serde_json::{Value, json};

    async fn seeded(count: i64) -> InMemoryDocumentStore {
        let store = InMemoryDocumentStore::new();
        let collection = CollectionPath::named("items");
        for n in 0..count {
            let data: DocumentData = json!({ "n": n, "even": n % 2 == 0 })
                .as_object()
                .cloned()
                .expect("object");
            store
                .set(&collection.doc(&format!("i{n:03}")).expect("path"), data)
                .await
                .expect("seed");
        }
        store
    }

    fn query() -> Query {
        Query::new(CollectionPath::named("items")).order_by("n", Direction::Ascending)
    }

    fn decode(document: &Document) -> DomainResult<i64> {
        Ok(document.field("n").and_then(Value::as_i64).unwrap_or_default())
    }

    #[tokio::test]
    async fn fills_page_across_batches_and_resumes_from_cursor() {
        let store = seeded(20).await;
        let even = |_: &Document, n: &i64| n % 2 == 0;

        let first = fetch_filtered_page(&store, &query(), &PageRequest::new(4), decode, even)
            .await
            .expect("first page");
        assert_eq!(first.items, vec![0, 2, 4, 6]);
        assert!(first.has_more);
        assert_eq!(first.batches_fetched, 2);
        let cursor = Cursor::decode(first.next_cursor.as_deref().expect("cursor")).expect("decode");
        assert_eq!(cursor.id, "i006");

        let second = fetch_filtered_page(
            &store,
            &query(),
            &PageRequest::new(4).after(first.next_cursor),
            decode,
            even,
        )
        .await
        .expect("second page");
        assert_eq!(second.items, vec![8, 10, 12, 14]);
    }

    #[tokio::test]
    async fn short_batch_ends_the_listing() {
        let store = seeded(5).await;
        let page = fetch_filtered_page(&store, &query(), &PageRequest::new(10), decode, |_, _| true)
            .await
            .expect("page");
        assert_eq!(page.items.len(), 5);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn batch_cap_reports_more_without_full_page() {
        let store = seeded(30).await;
        let page = fetch_filtered_page(
            &store,
            &query(),
            &PageRequest::new(2).max_batches(3),
            decode,
            |_, n: &i64| *n >= 25,
        )
        .await
        .expect("page");
        assert!(page.items.is_empty());
        assert!(page.has_more);
        assert_eq!(page.batches_fetched, 3);
        let cursor = Cursor::decode(page.next_cursor.as_deref().expect("cursor")).expect("decode");
        assert_eq!(cursor.id, "i005");
    }

    #[tokio::test]
    async fn resumes_after_the_cursor_document_is_deleted() {
        let store = seeded(8).await;
        let first = fetch_filtered_page(&store, &query(), &PageRequest::new(3), decode, |_, _| true)
            .await
            .expect("first page");
        assert_eq!(first.items, vec![0, 1, 2]);
        store
            .delete(&CollectionPath::named("items").doc("i002").expect("path"))
            .await
            .expect("delete");

        let second = fetch_filtered_page(
            &store,
            &query(),
            &PageRequest::new(3).after(first.next_cursor),
            decode,
            |_, _| true,
        )
        .await
        .expect("second page");
        assert_eq!(second.items, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn malformed_cursor_is_rejected() {
        let store = seeded(2).await;
        let result = fetch_filtered_page(
            &store,
            &query(),
            &PageRequest::new(2).after(Some("not-a-cursor".into())),
            decode,
            |_, _| true,
        )
        .await;
        assert!(matches!(result, Err(crate::error::DomainError::Validation(_))));
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(normalize_limit(None, 20, 100), 20);
        assert_eq!(normalize_limit(Some(0), 20, 100), 1);
        assert_eq!(normalize_limit(Some(500), 20, 100), 100);
    }
}
