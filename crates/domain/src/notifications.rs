use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DomainResult;
use crate::config::ServiceConfig;
use crate::error::DomainError;
use crate::pagination::{FilteredPage, PageRequest, fetch_filtered_page, normalize_limit};
use crate::ports::documents::{
    CollectionPath, Direction, Document, DocumentPath, DocumentStore, Filter, Query, Updates,
    WriteBatch, to_document_data,
};
use crate::query_builder::QueryBuilder;
use crate::util::{now_ms, uuid_v7_without_dashes};

pub const NOTIFICATION_SCHEMA_VERSION: u32 = 2;

const MAX_TITLE_LEN: usize = 200;
const MAX_MESSAGE_LEN: usize = 1000;

/// `userId` + `read` has no composite index.
const NOTIFICATION_INDEX_GAPS: &[(&str, &str)] = &[("userId", "read")];

pub fn notifications_collection() -> CollectionPath {
    CollectionPath::named("notifications")
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    TradeAccepted,
    TradeCompletionRequested,
    TradeCompleted,
    TradeChangesRequested,
    TradeCancelled,
    CollaborationApplication,
    ApplicationAccepted,
    ApplicationRejected,
    RoleCompleted,
    NewMessage,
    ConnectionRequest,
    ConnectionAccepted,
    System,
}

impl NotificationType {
    fn from_legacy(kind: &str) -> Self {
        match kind {
            "message" | "new_message" => Self::NewMessage,
            "connection" | "connection_request" => Self::ConnectionRequest,
            "connection_accepted" => Self::ConnectionAccepted,
            "trade" | "trade_completion" => Self::TradeCompletionRequested,
            "trade_confirmed" | "trade_completed" => Self::TradeCompleted,
            "collaboration" | "application" => Self::CollaborationApplication,
            "application_accepted" => Self::ApplicationAccepted,
            "application_rejected" => Self::ApplicationRejected,
            _ => Self::System,
        }
    }

    fn default_title(self) -> &'static str {
        match self {
            Self::TradeAccepted => "Trade accepted",
            Self::TradeCompletionRequested => "Trade completion requested",
            Self::TradeCompleted => "Trade completed",
            Self::TradeChangesRequested => "Trade changes requested",
            Self::TradeCancelled => "Trade cancelled",
            Self::CollaborationApplication => "New application",
            Self::ApplicationAccepted => "Application accepted",
            Self::ApplicationRejected => "Application rejected",
            Self::RoleCompleted => "Role completed",
            Self::NewMessage => "New message",
            Self::ConnectionRequest => "Connection request",
            Self::ConnectionAccepted => "Connection accepted",
            Self::System => "Notification",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_id: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub priority: NotificationPriority,
    pub created_at_ms: i64,
    pub schema_version: u32,
}

/// Stored shape before `schemaVersion` existed. Upgraded records keep
/// version 1 until they are rewritten.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationV1 {
    recipient_id: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    related_id: Option<String>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    timestamp: i64,
}

impl NotificationV1 {
    fn upgrade(self, id: &str) -> Notification {
        let notification_type = NotificationType::from_legacy(&self.kind);
        Notification {
            id: id.to_string(),
            user_id: self.recipient_id,
            notification_type,
            title: self
                .title
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| notification_type.default_title().to_string()),
            message: self.content,
            related_id: self.related_id,
            read: self.is_read,
            priority: NotificationPriority::Medium,
            created_at_ms: self.timestamp,
            schema_version: 1,
        }
    }
}

pub fn decode_notification(document: &Document) -> DomainResult<Notification> {
    let version = document
        .field("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    let mut notification = if version < 2 {
        document.decode::<NotificationV1>()?.upgrade(document.id())
    } else {
        document.decode::<Notification>()?
    };
    notification.id = document.id().to_string();
    Ok(notification)
}

#[derive(Clone, Debug, PartialEq)]
pub struct NotificationCreate {
    pub user_id: String,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub related_id: Option<String>,
    pub priority: NotificationPriority,
}

impl NotificationCreate {
    pub fn new(
        user_id: impl Into<String>,
        notification_type: NotificationType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            notification_type,
            title: notification_type.default_title().to_string(),
            message: message.into(),
            related_id: None,
            priority: NotificationPriority::Medium,
        }
    }

    pub fn related(mut self, related_id: impl Into<String>) -> Self {
        self.related_id = Some(related_id.into());
        self
    }

    pub fn priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    fn validate(&self) -> DomainResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(DomainError::Validation("notification recipient is required".into()));
        }
        if self.title.trim().is_empty() || self.title.chars().count() > MAX_TITLE_LEN {
            return Err(DomainError::Validation(format!(
                "notification title must be 1..={MAX_TITLE_LEN} characters"
            )));
        }
        if self.message.chars().count() > MAX_MESSAGE_LEN {
            return Err(DomainError::Validation(format!(
                "notification message exceeds {MAX_MESSAGE_LEN} characters"
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotificationListQuery {
    pub unread_only: bool,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Clone)]
pub struct NotificationService {
    store: Arc<dyn DocumentStore>,
    config: ServiceConfig,
}

impl NotificationService {
    pub fn new(store: Arc<dyn DocumentStore>, config: ServiceConfig) -> Self {
        Self { store, config }
    }

    fn path(id: &str) -> DomainResult<DocumentPath> {
        notifications_collection().doc(id)
    }

    async fn load(&self, id: &str) -> DomainResult<Notification> {
        let document = self
            .store
            .get(&Self::path(id)?)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("notification {id}")))?;
        decode_notification(&document)
    }

    pub async fn create_notification(&self, input: NotificationCreate) -> DomainResult<Notification> {
        input.validate()?;
        let notification = Notification {
            id: uuid_v7_without_dashes(),
            user_id: input.user_id,
            notification_type: input.notification_type,
            title: input.title.trim().to_string(),
            message: input.message.trim().to_string(),
            related_id: input.related_id,
            read: false,
            priority: input.priority,
            created_at_ms: now_ms(),
            schema_version: NOTIFICATION_SCHEMA_VERSION,
        };
        self.store
            .set(&Self::path(&notification.id)?, to_document_data(&notification)?)
            .await?;
        Ok(notification)
    }

    /// Creates a notification as a side effect; failures are logged only.
    pub async fn notify_best_effort(&self, input: NotificationCreate) {
        let user_id = input.user_id.clone();
        let notification_type = input.notification_type;
        if let Err(err) = self.create_notification(input).await {
            tracing::warn!(
                user_id = %user_id,
                notification_type = ?notification_type,
                error = %err,
                "notification side effect failed"
            );
        }
    }

    /// Newest first. `unread_only` adds a `read == false` constraint that is
    /// re-applied in memory because `userId` + `read` is not indexed.
    pub async fn list_notifications(
        &self,
        user_id: &str,
        request: NotificationListQuery,
    ) -> DomainResult<FilteredPage<Notification>> {
        let limit = normalize_limit(
            request.limit,
            self.config.default_page_size,
            self.config.max_page_size,
        );
        let mut builder = QueryBuilder::new(notifications_collection(), NOTIFICATION_INDEX_GAPS)
            .exact("userId", user_id)
            .order_by("createdAtMs", Direction::Descending);
        if request.unread_only {
            builder = builder.exact("read", false);
        }
        let plan = builder.build();
        let page = PageRequest::new(limit)
            .after(request.cursor)
            .max_batches(self.config.search_max_batches);
        fetch_filtered_page(
            self.store.as_ref(),
            &plan.query,
            &page,
            decode_notification,
            |document, _| plan.accepts_document(document),
        )
        .await
    }

    pub async fn mark_notification_read(&self, actor_id: &str, id: &str) -> DomainResult<()> {
        let notification = self.load(id).await?;
        if notification.user_id != actor_id {
            return Err(DomainError::PermissionDenied(
                "notifications can only be updated by their recipient".into(),
            ));
        }
        if notification.read {
            return Ok(());
        }
        let path = Self::path(id)?;
        if notification.schema_version < NOTIFICATION_SCHEMA_VERSION {
            // rewrite legacy documents in the current shape
            let upgraded = Notification {
                read: true,
                schema_version: NOTIFICATION_SCHEMA_VERSION,
                ..notification
            };
            return self.store.set(&path, to_document_data(&upgraded)?).await;
        }
        self.store.update(&path, Updates::new().set("read", true)).await
    }

    /// Current and legacy notifications addressed to `user_id`.
    async fn user_notifications(&self, user_id: &str) -> DomainResult<Vec<Notification>> {
        let mut documents = Vec::new();
        for field in ["userId", "recipientId"] {
            let query = Query::new(notifications_collection()).filter(Filter::eq(field, user_id));
            documents.extend(self.store.query(&query).await?);
        }
        let mut seen = HashSet::new();
        let mut notifications = Vec::with_capacity(documents.len());
        for document in &documents {
            if !seen.insert(document.id().to_string()) {
                continue;
            }
            match decode_notification(document) {
                Ok(notification) => notifications.push(notification),
                Err(err) => {
                    tracing::warn!(path = %document.path, error = %err, "skipping undecodable notification");
                }
            }
        }
        Ok(notifications)
    }

    /// Marks every unread notification of `user_id` read in one batch and
    /// returns how many changed.
    pub async fn mark_all_notifications_read(&self, user_id: &str) -> DomainResult<usize> {
        let unread: Vec<Notification> = self
            .user_notifications(user_id)
            .await?
            .into_iter()
            .filter(|notification| !notification.read)
            .collect();
        if unread.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        for notification in &unread {
            let path = Self::path(&notification.id)?;
            if notification.schema_version < NOTIFICATION_SCHEMA_VERSION {
                let upgraded = Notification {
                    read: true,
                    schema_version: NOTIFICATION_SCHEMA_VERSION,
                    ..notification.clone()
                };
                batch.set(path, to_document_data(&upgraded)?);
            } else {
                batch.update(path, Updates::new().set("read", true));
            }
        }
        self.store.commit(batch).await?;
        Ok(unread.len())
    }

    pub async fn unread_count(&self, user_id: &str) -> DomainResult<usize> {
        Ok(self
            .user_notifications(user_id)
            .await?
            .iter()
            .filter(|notification| !notification.read)
            .count())
    }

    pub async fn delete_notification(&self, actor_id: &str, id: &str) -> DomainResult<()> {
        let notification = self.load(id).await?;
        if notification.user_id != actor_id {
            return Err(DomainError::PermissionDenied(
                "notifications can only be deleted by their recipient".into(),
            ));
        }
        self.store.delete(&Self::path(id)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryDocumentStore;
    use serde_json::json;

    fn service() -> (Arc<InMemoryDocumentStore>, NotificationService) {
        let store = Arc::new(
            InMemoryDocumentStore::new().with_missing_index("notifications", "userId", "read"),
        );
        let service = NotificationService::new(store.clone(), ServiceConfig::default());
        (store, service)
    }

    #[tokio::test]
    async fn unread_listing_works_without_composite_index() {
        let (_store, service) = service();
        for message in ["one", "two", "three"] {
            service
                .create_notification(NotificationCreate::new("u1", NotificationType::System, message))
                .await
                .expect("create");
        }
        let first = service
            .list_notifications("u1", NotificationListQuery::default())
            .await
            .expect("list");
        service
            .mark_notification_read("u1", &first.items[0].id)
            .await
            .expect("mark read");

        let unread = service
            .list_notifications(
                "u1",
                NotificationListQuery {
                    unread_only: true,
                    ..NotificationListQuery::default()
                },
            )
            .await
            .expect("unread");
        assert_eq!(unread.items.len(), 2);
        assert_eq!(service.unread_count("u1").await.expect("count"), 2);
    }

    #[tokio::test]
    async fn only_recipient_may_mark_or_delete() {
        let (_store, service) = service();
        let created = service
            .create_notification(NotificationCreate::new("u1", NotificationType::NewMessage, "hi"))
            .await
            .expect("create");
        let err = service
            .mark_notification_read("u2", &created.id)
            .await
            .expect_err("denied");
        assert_eq!(err.code(), "permission-denied");
        let err = service
            .delete_notification("u2", &created.id)
            .await
            .expect_err("denied");
        assert_eq!(err.code(), "permission-denied");
    }

    #[tokio::test]
    async fn legacy_notifications_are_upgraded_on_read() {
        let (store, service) = service();
        let legacy = json!({
            "recipientId": "u1",
            "type": "message",
            "content": "legacy hello",
            "isRead": false,
            "timestamp": 1_000
        });
        store
            .set(
                &notifications_collection().doc("old").expect("path"),
                legacy.as_object().cloned().expect("object"),
            )
            .await
            .expect("seed");

        let notification = service.load("old").await.expect("load");
        assert_eq!(notification.user_id, "u1");
        assert_eq!(notification.notification_type, NotificationType::NewMessage);
        assert_eq!(notification.message, "legacy hello");
        assert_eq!(notification.title, "New message");
        assert_eq!(notification.created_at_ms, 1_000);
    }

    #[tokio::test]
    async fn documents_matching_both_owner_fields_count_once() {
        let (store, service) = service();
        let both = json!({
            "userId": "u1",
            "recipientId": "u1",
            "type": "system",
            "title": "Hi",
            "message": "both fields",
            "createdAtMs": 5,
            "schemaVersion": 2
        });
        store
            .set(
                &notifications_collection().doc("both").expect("path"),
                both.as_object().cloned().expect("object"),
            )
            .await
            .expect("seed");
        assert_eq!(service.unread_count("u1").await.expect("count"), 1);
        assert_eq!(service.mark_all_notifications_read("u1").await.expect("mark"), 1);
    }

    #[tokio::test]
    async fn marking_legacy_notifications_rewrites_them() {
        let (store, service) = service();
        let legacy = json!({ "recipientId": "u1", "content": "old", "isRead": false, "timestamp": 3 });
        store
            .set(
                &notifications_collection().doc("old").expect("path"),
                legacy.as_object().cloned().expect("object"),
            )
            .await
            .expect("seed");

        service.mark_notification_read("u1", "old").await.expect("mark");
        let stored = service.load("old").await.expect("load");
        assert!(stored.read);
        assert_eq!(stored.schema_version, NOTIFICATION_SCHEMA_VERSION);
        assert_eq!(service.unread_count("u1").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn mark_all_updates_in_one_batch() {
        let (_store, service) = service();
        for _ in 0..3 {
            service
                .create_notification(NotificationCreate::new("u1", NotificationType::System, "x"))
                .await
                .expect("create");
        }
        assert_eq!(service.mark_all_notifications_read("u1").await.expect("mark"), 3);
        assert_eq!(service.unread_count("u1").await.expect("count"), 0);
        assert_eq!(service.mark_all_notifications_read("u1").await.expect("noop"), 0);
    }

    #[tokio::test]
    async fn empty_title_is_rejected() {
        let (_store, service) = service();
        let mut input = NotificationCreate::new("u1", NotificationType::System, "x");
        input.title = "  ".into();
        let err = service.create_notification(input).await.expect_err("invalid");
        assert_eq!(err.code(), "invalid-argument");
    }
}
