use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DomainResult;
use crate::error::DomainError;
use crate::notifications::{NotificationCreate, NotificationService, NotificationType};
use crate::ports::documents::{
    CollectionPath, Direction, Document, DocumentPath, DocumentStore, Filter, Query, Updates,
    WriteBatch, to_document_data, transaction,
};
use crate::util::{now_ms, uuid_v7_without_dashes};

pub const CHAT_SCHEMA_VERSION: u32 = 2;

const MAX_MESSAGE_LEN: usize = 5000;
const PREVIEW_LEN: usize = 120;

pub fn conversations_collection() -> CollectionPath {
    CollectionPath::named("conversations")
}

pub fn conversation_path(id: &str) -> DomainResult<DocumentPath> {
    conversations_collection().doc(id)
}

pub fn messages_collection(conversation_id: &str) -> DomainResult<CollectionPath> {
    conversation_path(conversation_id)?.child("messages")
}

/// Deterministic id of the direct conversation between two users.
pub fn direct_conversation_id(first: &str, second: &str) -> String {
    if first <= second {
        format!("{first}__{second}")
    } else {
        format!("{second}__{first}")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    #[serde(default)]
    pub sender_id: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatConversation {
    #[serde(default)]
    pub id: String,
    pub participant_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schema_version: u32,
}

impl ChatConversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|id| id == user_id)
    }
}

#[derive(Clone, Debug, Deserialize)]
struct LegacyParticipant {
    id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatConversationV1 {
    #[serde(default)]
    participants: Vec<LegacyParticipant>,
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    last_message_time: Option<i64>,
    #[serde(default)]
    last_message_sender_id: Option<String>,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    updated_at: Option<i64>,
}

impl ChatConversationV1 {
    fn upgrade(self, id: &str) -> ChatConversation {
        let last_message = self.last_message.map(|content| LastMessage {
            content,
            sender_id: self.last_message_sender_id.unwrap_or_default(),
            created_at_ms: self.last_message_time.unwrap_or(self.created_at),
        });
        ChatConversation {
            id: id.to_string(),
            participant_ids: self
                .participants
                .into_iter()
                .map(|participant| participant.id)
                .collect(),
            last_message,
            created_at_ms: self.created_at,
            updated_at_ms: self
                .updated_at
                .or(self.last_message_time)
                .unwrap_or(self.created_at),
            schema_version: CHAT_SCHEMA_VERSION,
        }
    }
}

pub fn decode_conversation(document: &Document) -> DomainResult<ChatConversation> {
    let version = document
        .field("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    let mut conversation = if version < 2 {
        document.decode::<ChatConversationV1>()?.upgrade(document.id())
    } else {
        document.decode::<ChatConversation>()?
    };
    conversation.id = document.id().to_string();
    Ok(conversation)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub read_by: Vec<String>,
    pub created_at_ms: i64,
    pub schema_version: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessageV1 {
    sender_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    read: bool,
}

impl ChatMessageV1 {
    /// A read legacy message counts as read by every participant.
    fn upgrade(self, id: &str, conversation: &ChatConversation) -> ChatMessage {
        let read_by = if self.read {
            conversation.participant_ids.clone()
        } else {
            vec![self.sender_id.clone()]
        };
        ChatMessage {
            id: id.to_string(),
            conversation_id: conversation.id.clone(),
            sender_id: self.sender_id,
            content: self.text,
            read_by,
            created_at_ms: self.timestamp,
            schema_version: CHAT_SCHEMA_VERSION,
        }
    }
}

pub fn decode_message(document: &Document, conversation: &ChatConversation) -> DomainResult<ChatMessage> {
    let version = document
        .field("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    let mut message = if version < 2 {
        document
            .decode::<ChatMessageV1>()?
            .upgrade(document.id(), conversation)
    } else {
        document.decode::<ChatMessage>()?
    };
    message.id = document.id().to_string();
    message.conversation_id = conversation.id.clone();
    Ok(message)
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_LEN {
        return content.to_string();
    }
    let mut cut: String = content.chars().take(PREVIEW_LEN).collect();
    cut.push('…');
    cut
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn DocumentStore>,
    notifications: NotificationService,
}

impl ChatService {
    pub fn new(store: Arc<dyn DocumentStore>, notifications: NotificationService) -> Self {
        Self {
            store,
            notifications,
        }
    }

    async fn participant_conversation(
        &self,
        actor_id: &str,
        conversation_id: &str,
    ) -> DomainResult<ChatConversation> {
        let document = self
            .store
            .get(&conversation_path(conversation_id)?)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("conversation {conversation_id}")))?;
        let conversation = decode_conversation(&document)?;
        if !conversation.has_participant(actor_id) {
            return Err(DomainError::PermissionDenied(
                "only participants can access a conversation".into(),
            ));
        }
        Ok(conversation)
    }

    /// Finds the direct conversation between the two users, creating it
    /// under a deterministic id when none exists.
    pub async fn get_or_create_conversation(
        &self,
        actor_id: &str,
        other_user_id: &str,
    ) -> DomainResult<ChatConversation> {
        if other_user_id.trim().is_empty() || actor_id == other_user_id {
            return Err(DomainError::Validation(
                "a conversation needs two different users".into(),
            ));
        }
        let existing = self
            .list_conversations(actor_id)
            .await?
            .into_iter()
            .find(|conversation| {
                conversation.participant_ids.len() == 2 && conversation.has_participant(other_user_id)
            });
        if let Some(conversation) = existing {
            return Ok(conversation);
        }

        let path = conversation_path(&direct_conversation_id(actor_id, other_user_id))?;
        let read_path = path.clone();
        let mut participants = vec![actor_id.to_string(), other_user_id.to_string()];
        participants.sort();
        transaction(self.store.as_ref(), vec![path], move |snapshot| {
            if let Some(document) = snapshot.get(&read_path)? {
                return Ok((WriteBatch::new(), decode_conversation(document)?));
            }
            let now = now_ms();
            let conversation = ChatConversation {
                id: read_path.id().to_string(),
                participant_ids: participants,
                last_message: None,
                created_at_ms: now,
                updated_at_ms: now,
                schema_version: CHAT_SCHEMA_VERSION,
            };
            let mut batch = WriteBatch::new();
            batch.set(read_path.clone(), to_document_data(&conversation)?);
            Ok((batch, conversation))
        })
        .await
    }

    /// Stores a message and the conversation preview in one transaction.
    pub async fn send_message(
        &self,
        actor_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> DomainResult<ChatMessage> {
        let content = content.trim().to_string();
        if content.is_empty() || content.chars().count() > MAX_MESSAGE_LEN {
            return Err(DomainError::Validation(format!(
                "message must be 1..={MAX_MESSAGE_LEN} characters"
            )));
        }
        let path = conversation_path(conversation_id)?;
        let message_path = messages_collection(conversation_id)?.doc(&uuid_v7_without_dashes())?;
        let read_path = path.clone();
        let actor = actor_id.to_string();

        let (message, conversation) = transaction(self.store.as_ref(), vec![path], move |snapshot| {
            let mut conversation = decode_conversation(snapshot.require(&read_path, "conversation")?)?;
            if !conversation.has_participant(&actor) {
                return Err(DomainError::PermissionDenied(
                    "only participants can send messages".into(),
                ));
            }
            let now = now_ms();
            let message = ChatMessage {
                id: message_path.id().to_string(),
                conversation_id: conversation.id.clone(),
                sender_id: actor.clone(),
                content,
                read_by: vec![actor],
                created_at_ms: now,
                schema_version: CHAT_SCHEMA_VERSION,
            };
            conversation.last_message = Some(LastMessage {
                content: preview(&message.content),
                sender_id: message.sender_id.clone(),
                created_at_ms: now,
            });
            conversation.updated_at_ms = now;
            conversation.schema_version = CHAT_SCHEMA_VERSION;

            let mut batch = WriteBatch::new();
            batch.set(message_path.clone(), to_document_data(&message)?);
            batch.set(read_path.clone(), to_document_data(&conversation)?);
            Ok((batch, (message, conversation)))
        })
        .await?;

        for recipient in conversation
            .participant_ids
            .iter()
            .filter(|id| id.as_str() != actor_id)
        {
            self.notifications
                .notify_best_effort(
                    NotificationCreate::new(
                        recipient,
                        NotificationType::NewMessage,
                        preview(&message.content),
                    )
                    .related(conversation_id),
                )
                .await;
        }
        Ok(message)
    }

    /// The latest `limit` messages, oldest first.
    pub async fn list_messages(
        &self,
        actor_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> DomainResult<Vec<ChatMessage>> {
        let conversation = self.participant_conversation(actor_id, conversation_id).await?;
        let mut documents = Vec::new();
        for field in ["createdAtMs", "timestamp"] {
            let query = Query::new(messages_collection(conversation_id)?)
                .filter(Filter::ge(field, 0))
                .order_by(field, Direction::Descending)
                .limit(limit.max(1));
            documents.extend(self.store.query(&query).await?);
        }
        let mut seen = HashSet::new();
        let mut messages: Vec<ChatMessage> = documents
            .iter()
            .filter(|document| seen.insert(document.id().to_string()))
            .filter_map(|document| match decode_message(document, &conversation) {
                Ok(message) => Some(message),
                Err(err) => {
                    tracing::warn!(path = %document.path, error = %err, "skipping undecodable message");
                    None
                }
            })
            .collect();
        messages.sort_by(|left, right| {
            right
                .created_at_ms
                .cmp(&left.created_at_ms)
                .then_with(|| right.id.cmp(&left.id))
        });
        messages.truncate(limit.max(1));
        messages.reverse();
        Ok(messages)
    }

    /// Marks every message not yet read by `actor_id`; returns the count.
    pub async fn mark_messages_read(&self, actor_id: &str, conversation_id: &str) -> DomainResult<usize> {
        let conversation = self.participant_conversation(actor_id, conversation_id).await?;
        let query = Query::new(messages_collection(conversation_id)?);
        let mut batch = WriteBatch::new();
        for document in self.store.query(&query).await? {
            let message = match decode_message(&document, &conversation) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(path = %document.path, error = %err, "skipping undecodable message");
                    continue;
                }
            };
            if message.read_by.iter().any(|id| id == actor_id) {
                continue;
            }
            if document.field("schemaVersion").is_none() {
                let mut upgraded = message;
                upgraded.read_by.push(actor_id.to_string());
                batch.set(document.path.clone(), to_document_data(&upgraded)?);
            } else {
                batch.update(
                    document.path.clone(),
                    Updates::new().array_union("readBy", vec![Value::from(actor_id)]),
                );
            }
        }
        let marked = batch.len();
        if marked > 0 {
            self.store.commit(batch).await?;
        }
        Ok(marked)
    }

    /// Conversations of `user_id`, most recently active first.
    pub async fn list_conversations(&self, user_id: &str) -> DomainResult<Vec<ChatConversation>> {
        let query = Query::new(conversations_collection())
            .filter(Filter::array_contains("participantIds", user_id))
            .order_by("updatedAtMs", Direction::Descending);
        self.store
            .query(&query)
            .await?
            .iter()
            .map(decode_conversation)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::memory_store::InMemoryDocumentStore;
    use serde_json::json;

    fn service() -> (Arc<InMemoryDocumentStore>, ChatService) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let notifications = NotificationService::new(store.clone(), ServiceConfig::default());
        (store.clone(), ChatService::new(store, notifications))
    }

    #[tokio::test]
    async fn conversation_is_reused_between_the_same_pair() {
        let (_store, chat) = service();
        let first = chat.get_or_create_conversation("u1", "u2").await.expect("create");
        let second = chat.get_or_create_conversation("u2", "u1").await.expect("reuse");
        assert_eq!(first.id, second.id);
        assert_eq!(first.id, "u1__u2");
    }

    #[tokio::test]
    async fn messages_update_preview_and_read_state() {
        let (store, chat) = service();
        let conversation = chat.get_or_create_conversation("u1", "u2").await.expect("create");
        chat.send_message("u1", &conversation.id, "hello").await.expect("send");
        chat.send_message("u1", &conversation.id, "are you there?").await.expect("send");

        let err = chat
            .send_message("u3", &conversation.id, "intruder")
            .await
            .expect_err("outsider");
        assert_eq!(err.code(), "permission-denied");

        let listed = chat.list_conversations("u2").await.expect("list");
        assert_eq!(
            listed[0].last_message.as_ref().map(|last| last.content.as_str()),
            Some("are you there?")
        );

        assert_eq!(chat.mark_messages_read("u2", &conversation.id).await.expect("mark"), 2);
        assert_eq!(chat.mark_messages_read("u2", &conversation.id).await.expect("again"), 0);
        assert_eq!(store.document_count("notifications").await, 2);
    }

    #[tokio::test]
    async fn legacy_messages_are_upgraded_in_listing() {
        let (store, chat) = service();
        let conversation = json!({
            "participants": [{ "id": "u1", "name": "Ana" }, { "id": "u2", "name": "Bo" }],
            "lastMessage": "old",
            "lastMessageTime": 20,
            "createdAt": 10
        });
        store
            .set(
                &conversation_path("legacy").expect("path"),
                conversation.as_object().cloned().expect("object"),
            )
            .await
            .expect("seed conversation");
        let message = json!({ "senderId": "u1", "text": "old", "timestamp": 20, "read": true });
        store
            .set(
                &messages_collection("legacy").expect("messages").doc("m1").expect("path"),
                message.as_object().cloned().expect("object"),
            )
            .await
            .expect("seed message");

        let messages = chat.list_messages("u2", "legacy", 10).await.expect("list");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "old");
        assert_eq!(messages[0].read_by, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn undecodable_messages_are_skipped() {
        let (store, chat) = service();
        let conversation = chat.get_or_create_conversation("u1", "u2").await.expect("create");
        chat.send_message("u2", &conversation.id, "still here").await.expect("send");
        store
            .set(
                &messages_collection(&conversation.id)
                    .expect("messages")
                    .doc("broken")
                    .expect("path"),
                json!({ "schemaVersion": 2, "createdAtMs": 1 })
                    .as_object()
                    .cloned()
                    .expect("object"),
            )
            .await
            .expect("seed broken message");

        let messages = chat.list_messages("u1", &conversation.id, 10).await.expect("list");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "still here");
        assert_eq!(chat.mark_messages_read("u1", &conversation.id).await.expect("mark"), 1);
    }
}
