//! Fan-out of document changes to in-process subscribers.
//!
//! Each watched (topic, key) pair owns exactly one change-feed
//! subscription; every change it reports is translated into
//! [`RealtimeUpdate`]s and handed to each subscriber whose filter accepts
//! it. A failing or panicking subscriber is counted and skipped.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::DomainResult;
use crate::chat::{ChatConversation, messages_collection};
use crate::collaborations::collaboration_path;
use crate::notifications::notifications_collection;
use crate::ports::changes::{ChangeFeed, DocumentChange, WatchHandle, WatchTarget};
use crate::ports::documents::{Filter, Query};
use crate::trades::trades_collection;
use crate::users::social_stats_path;
use crate::util::now_ms;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    SocialStats,
    Notification,
    Trade,
    Collaboration,
    Message,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeUpdate {
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    /// User the update concerns; `None` when the document was removed and
    /// its owners are no longer known.
    pub user_id: Option<String>,
    pub entity_id: String,
    /// Current document contents, `Null` once removed.
    pub payload: Value,
    pub timestamp_ms: i64,
}

/// Empty sets accept everything.
#[derive(Clone, Debug, Default)]
pub struct SubscriberFilter {
    pub user_ids: HashSet<String>,
    pub update_types: HashSet<UpdateType>,
}

impl SubscriberFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_users<I, S>(user_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_ids: user_ids.into_iter().map(Into::into).collect(),
            update_types: HashSet::new(),
        }
    }

    pub fn with_types(mut self, update_types: impl IntoIterator<Item = UpdateType>) -> Self {
        self.update_types.extend(update_types);
        self
    }

    pub fn accepts(&self, update: &RealtimeUpdate) -> bool {
        let user_ok = self.user_ids.is_empty()
            || update
                .user_id
                .as_ref()
                .is_some_and(|user_id| self.user_ids.contains(user_id));
        let type_ok =
            self.update_types.is_empty() || self.update_types.contains(&update.update_type);
        user_ok && type_ok
    }
}

#[derive(Debug, Error)]
#[error("subscriber failed: {0}")]
pub struct SubscriberError(pub String);

pub type SubscriberCallback =
    Arc<dyn Fn(&RealtimeUpdate) -> Result<(), SubscriberError> + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    pub updates_received: u64,
    pub deliveries: u64,
    pub errors: u64,
    pub active_listeners: usize,
    pub subscribers: usize,
}

#[derive(Clone)]
struct Subscriber {
    filter: SubscriberFilter,
    callback: SubscriberCallback,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<String, Subscriber>,
    listeners: HashMap<String, WatchHandle>,
}

#[derive(Default)]
struct Shared {
    registry: Mutex<Registry>,
    updates_received: AtomicU64,
    deliveries: AtomicU64,
    errors: AtomicU64,
}

impl Shared {
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, updates: Vec<RealtimeUpdate>) {
        if updates.is_empty() {
            return;
        }
        self.updates_received
            .fetch_add(updates.len() as u64, Ordering::Relaxed);
        let subscribers: Vec<(String, Subscriber)> = self
            .registry()
            .subscribers
            .iter()
            .map(|(id, subscriber)| (id.clone(), subscriber.clone()))
            .collect();

        for update in &updates {
            for (id, subscriber) in &subscribers {
                if !subscriber.filter.accepts(update) {
                    continue;
                }
                match catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(update))) {
                    Ok(Ok(())) => {
                        self.deliveries.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(err)) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(subscriber = %id, entity = %update.entity_id, error = %err, "realtime subscriber failed");
                    }
                    Err(_) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(subscriber = %id, entity = %update.entity_id, "realtime subscriber panicked");
                    }
                }
            }
        }
    }
}

/// Explicitly constructed fan-out service; call [`RealtimeService::cleanup`]
/// when the owning application shuts down.
#[derive(Clone)]
pub struct RealtimeService {
    feed: Arc<dyn ChangeFeed>,
    shared: Arc<Shared>,
}

impl RealtimeService {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            feed,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Registers or replaces the subscriber `id`.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        callback: SubscriberCallback,
        filter: SubscriberFilter,
    ) {
        let id = id.into();
        tracing::debug!(subscriber = %id, "realtime subscriber registered");
        self.shared
            .registry()
            .subscribers
            .insert(id, Subscriber { filter, callback });
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.shared.registry().subscribers.remove(id).is_some()
    }

    pub fn watch_social_stats(&self, user_id: &str) -> DomainResult<String> {
        let target = WatchTarget::Document(social_stats_path(user_id)?);
        let owner = user_id.to_string();
        self.ensure_listener("social_stats", user_id, target, move |change| {
            vec![update(UpdateType::SocialStats, Some(owner.clone()), change)]
        })
    }

    pub fn watch_notifications(&self, user_id: &str) -> DomainResult<String> {
        let query =
            Query::new(notifications_collection()).filter(Filter::eq("userId", user_id));
        let target = WatchTarget::Collection(query);
        let owner = user_id.to_string();
        self.ensure_listener("notifications", user_id, target, move |change| {
            vec![update(UpdateType::Notification, Some(owner.clone()), change)]
        })
    }

    pub fn watch_trade(&self, trade_id: &str) -> DomainResult<String> {
        let target = WatchTarget::Document(trades_collection().doc(trade_id)?);
        self.ensure_listener("trade", trade_id, target, trade_updates)
    }

    pub fn watch_collaboration(&self, collaboration_id: &str) -> DomainResult<String> {
        let target = WatchTarget::Document(collaboration_path(collaboration_id)?);
        self.ensure_listener("collaboration", collaboration_id, target, collaboration_updates)
    }

    /// Message updates are addressed to every participant of `conversation`.
    pub fn watch_conversation(&self, conversation: &ChatConversation) -> DomainResult<String> {
        let target = WatchTarget::Collection(Query::new(messages_collection(&conversation.id)?));
        let participants = conversation.participant_ids.clone();
        self.ensure_listener("conversation", &conversation.id, target, move |change| {
            message_updates(&participants, change)
        })
    }

    fn ensure_listener<F>(
        &self,
        topic: &str,
        key: &str,
        target: WatchTarget,
        translate: F,
    ) -> DomainResult<String>
    where
        F: Fn(&DocumentChange) -> Vec<RealtimeUpdate> + Send + Sync + 'static,
    {
        let listener_id = format!("{topic}:{key}");
        if self.shared.registry().listeners.contains_key(&listener_id) {
            return Ok(listener_id);
        }

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let handle = self.feed.watch(
            target,
            Arc::new(move |change: &DocumentChange| {
                if let Some(shared) = shared.upgrade() {
                    shared.dispatch(translate(change));
                }
            }),
        )?;

        let duplicate = {
            let mut registry = self.shared.registry();
            if registry.listeners.contains_key(&listener_id) {
                Some(handle)
            } else {
                registry.listeners.insert(listener_id.clone(), handle);
                None
            }
        };
        match duplicate {
            Some(handle) => handle.unsubscribe(),
            None => tracing::debug!(listener = %listener_id, "realtime listener started"),
        }
        Ok(listener_id)
    }

    pub fn stop_listener(&self, listener_id: &str) -> bool {
        let handle = self.shared.registry().listeners.remove(listener_id);
        match handle {
            Some(handle) => {
                handle.unsubscribe();
                tracing::debug!(listener = %listener_id, "realtime listener stopped");
                true
            }
            None => false,
        }
    }

    /// Stops every listener and forgets every subscriber.
    pub fn cleanup(&self) {
        let (listeners, subscribers) = {
            let mut registry = self.shared.registry();
            let subscribers = registry.subscribers.len();
            registry.subscribers.clear();
            (std::mem::take(&mut registry.listeners), subscribers)
        };
        let stopped = listeners.len();
        for (_, handle) in listeners {
            handle.unsubscribe();
        }
        tracing::info!(listeners = stopped, subscribers, "realtime service cleaned up");
    }

    pub fn stats(&self) -> RealtimeStats {
        let (active_listeners, subscribers) = {
            let registry = self.shared.registry();
            (registry.listeners.len(), registry.subscribers.len())
        };
        RealtimeStats {
            updates_received: self.shared.updates_received.load(Ordering::Relaxed),
            deliveries: self.shared.deliveries.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
            active_listeners,
            subscribers,
        }
    }

    pub fn active_listener_count(&self) -> usize {
        self.shared.registry().listeners.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry().subscribers.len()
    }
}

fn payload(change: &DocumentChange) -> Value {
    change
        .document
        .as_ref()
        .map(|document| Value::Object(document.data.clone()))
        .unwrap_or(Value::Null)
}

fn update(
    update_type: UpdateType,
    user_id: Option<String>,
    change: &DocumentChange,
) -> RealtimeUpdate {
    RealtimeUpdate {
        update_type,
        user_id,
        entity_id: change.path.id().to_string(),
        payload: payload(change),
        timestamp_ms: now_ms(),
    }
}

fn string_field(change: &DocumentChange, field: &str) -> Option<String> {
    change
        .document
        .as_ref()
        .and_then(|document| document.field(field))
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// One update per involved user, or a single ownerless one on removal.
fn per_user(update_type: UpdateType, users: Vec<String>, change: &DocumentChange) -> Vec<RealtimeUpdate> {
    if change.document.is_none() || users.is_empty() {
        return vec![update(update_type, None, change)];
    }
    let mut seen = HashSet::new();
    users
        .into_iter()
        .filter(|user_id| seen.insert(user_id.clone()))
        .map(|user_id| update(update_type, Some(user_id), change))
        .collect()
}

fn trade_updates(change: &DocumentChange) -> Vec<RealtimeUpdate> {
    let users = ["creatorId", "participantId"]
        .into_iter()
        .filter_map(|field| string_field(change, field))
        .collect();
    per_user(UpdateType::Trade, users, change)
}

fn collaboration_updates(change: &DocumentChange) -> Vec<RealtimeUpdate> {
    let mut users: Vec<String> = string_field(change, "creatorId").into_iter().collect();
    if let Some(ids) = change
        .document
        .as_ref()
        .and_then(|document| document.field("collaboratorIds"))
        .and_then(Value::as_array)
    {
        users.extend(ids.iter().filter_map(Value::as_str).map(str::to_string));
    }
    per_user(UpdateType::Collaboration, users, change)
}

/// Participants are known up front, so removals are addressed as well.
fn message_updates(participants: &[String], change: &DocumentChange) -> Vec<RealtimeUpdate> {
    let mut users: Vec<String> = participants.to_vec();
    if users.is_empty() {
        users.extend(string_field(change, "senderId"));
    }
    let mut seen = HashSet::new();
    users
        .into_iter()
        .filter(|user_id| seen.insert(user_id.clone()))
        .map(|user_id| update(UpdateType::Message, Some(user_id), change))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryDocumentStore;
    use crate::ports::documents::{DocumentStore, Updates, WriteBatch};
    use crate::users::{SocialCounter, social_stats_delta};
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<RealtimeUpdate>>>, SubscriberCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: SubscriberCallback = Arc::new(move |update: &RealtimeUpdate| -> Result<(), SubscriberError> {
            sink.lock().expect("recorder").push(update.clone());
            Ok(())
        });
        (seen, callback)
    }

    async fn bump(store: &InMemoryDocumentStore, user_id: &str) {
        let mut batch = WriteBatch::new();
        batch.upsert(
            social_stats_path(user_id).expect("path"),
            social_stats_delta(SocialCounter::Trades, 1),
        );
        store.commit(batch).await.expect("commit");
    }

    #[tokio::test]
    async fn listeners_are_shared_per_key() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let realtime = RealtimeService::new(store.clone());

        let first = realtime.watch_social_stats("u1").expect("watch");
        let second = realtime.watch_social_stats("u1").expect("watch again");
        assert_eq!(first, "social_stats:u1");
        assert_eq!(first, second);
        assert_eq!(realtime.active_listener_count(), 1);
        assert_eq!(store.watcher_count(), 1);

        assert!(realtime.stop_listener(&first));
        assert!(!realtime.stop_listener(&first));
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn failing_subscribers_do_not_block_others() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let realtime = RealtimeService::new(store.clone());
        let (seen, callback) = recorder();
        realtime.subscribe(
            "broken",
            Arc::new(|_: &RealtimeUpdate| -> Result<(), SubscriberError> {
                Err(SubscriberError("boom".into()))
            }),
            SubscriberFilter::all(),
        );
        realtime.subscribe(
            "panics",
            Arc::new(|_: &RealtimeUpdate| -> Result<(), SubscriberError> { panic!("listener bug") }),
            SubscriberFilter::all(),
        );
        realtime.subscribe("healthy", callback, SubscriberFilter::all());
        realtime.watch_social_stats("u1").expect("watch");

        bump(&store, "u1").await;

        assert_eq!(seen.lock().expect("seen").len(), 1);
        let stats = realtime.stats();
        assert_eq!(stats.updates_received, 1);
        assert_eq!(stats.deliveries, 1);
        assert_eq!(stats.errors, 2);
    }

    #[tokio::test]
    async fn trade_changes_reach_both_parties() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let realtime = RealtimeService::new(store.clone());
        let (seen, callback) = recorder();
        realtime.subscribe(
            "u2-trades",
            callback,
            SubscriberFilter::for_users(["u2"]).with_types([UpdateType::Trade]),
        );
        let path = trades_collection().doc("t1").expect("path");
        store
            .set(
                &path,
                json!({ "creatorId": "u1", "status": "open" })
                    .as_object()
                    .cloned()
                    .expect("object"),
            )
            .await
            .expect("seed");
        realtime.watch_trade("t1").expect("watch");

        store
            .update(&path, Updates::new().set("participantId", "u2"))
            .await
            .expect("accept");
        store
            .update(&path, Updates::new().set("status", "in-progress"))
            .await
            .expect("progress");

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|update| update.user_id.as_deref() == Some("u2")));
        assert_eq!(seen[1].payload["status"], "in-progress");
    }

    #[tokio::test]
    async fn messages_reach_the_recipient() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let realtime = RealtimeService::new(store.clone());
        let chat = crate::chat::ChatService::new(
            store.clone(),
            crate::notifications::NotificationService::new(
                store.clone(),
                crate::config::ServiceConfig::default(),
            ),
        );
        let (seen, callback) = recorder();
        realtime.subscribe(
            "u2-messages",
            callback,
            SubscriberFilter::for_users(["u2"]).with_types([UpdateType::Message]),
        );
        let conversation = chat.get_or_create_conversation("u1", "u2").await.expect("conversation");
        realtime.watch_conversation(&conversation).expect("watch");

        chat.send_message("u1", &conversation.id, "hello").await.expect("send");

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].user_id.as_deref(), Some("u2"));
        assert_eq!(seen[0].payload["content"], "hello");
    }

    #[tokio::test]
    async fn cleanup_stops_everything() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let realtime = RealtimeService::new(store.clone());
        let (seen, callback) = recorder();
        realtime.subscribe("all", callback, SubscriberFilter::all());
        realtime.watch_social_stats("u1").expect("watch");
        realtime.watch_notifications("u1").expect("watch");
        assert_eq!(store.watcher_count(), 2);

        realtime.cleanup();
        bump(&store, "u1").await;

        assert_eq!(store.watcher_count(), 0);
        assert_eq!(realtime.subscriber_count(), 0);
        assert!(seen.lock().expect("seen").is_empty());
    }
}
