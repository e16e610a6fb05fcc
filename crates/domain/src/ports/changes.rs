use std::sync::Arc;

use crate::DomainResult;
use crate::ports::documents::{Document, DocumentPath, Query};

#[derive(Clone, Debug, PartialEq)]
pub enum WatchTarget {
    Document(DocumentPath),
    /// Filters of the query select the watched documents; ordering and
    /// limits are ignored.
    Collection(Query),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub path: DocumentPath,
    /// Current contents; `None` once removed.
    pub document: Option<Document>,
}

pub type ChangeSink = Arc<dyn Fn(&DocumentChange) + Send + Sync>;

/// Live change subscription. Dropping the handle unsubscribes.
pub struct WatchHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

pub trait ChangeFeed: Send + Sync {
    fn watch(&self, target: WatchTarget, sink: ChangeSink) -> DomainResult<WatchHandle>;
}
