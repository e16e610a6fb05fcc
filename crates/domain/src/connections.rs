use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DomainResult;
use crate::error::DomainError;
use crate::notifications::{NotificationCreate, NotificationService, NotificationType};
use crate::ports::documents::{
    CollectionPath, Document, DocumentPath, DocumentStore, Filter, Query, WriteBatch,
    to_document_data, transaction,
};
use crate::users::{SocialCounter, social_stats_delta, social_stats_path};
use crate::util::now_ms;

pub const CONNECTION_SCHEMA_VERSION: u32 = 2;

const MAX_MESSAGE_LEN: usize = 500;

pub fn connections_collection() -> CollectionPath {
    CollectionPath::named("connections")
}

const KEY_SEPARATOR: char = '_';

/// Connections are keyed `{requester}_{recipient}`. User ids containing
/// the separator are rejected so that every key names exactly one pair.
pub fn connection_path(from_user_id: &str, to_user_id: &str) -> DomainResult<DocumentPath> {
    for user_id in [from_user_id, to_user_id] {
        if user_id.is_empty() || user_id.contains(KEY_SEPARATOR) {
            return Err(DomainError::Validation(format!(
                "user id '{user_id}' cannot be used in a connection key"
            )));
        }
    }
    connections_collection().doc(&format!("{from_user_id}{KEY_SEPARATOR}{to_user_id}"))
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default)]
    pub id: String,
    /// Requester.
    pub user_id: String,
    /// Recipient.
    pub connected_user_id: String,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schema_version: u32,
}

impl Connection {
    pub fn involves(&self, user_id: &str) -> bool {
        self.user_id == user_id || self.connected_user_id == user_id
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionV1 {
    from_user_id: String,
    to_user_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    updated_at: Option<i64>,
}

impl ConnectionV1 {
    fn upgrade(self, id: &str) -> Connection {
        let status = match self.status.as_str() {
            "connected" | "accepted" => ConnectionStatus::Accepted,
            "rejected" | "declined" => ConnectionStatus::Rejected,
            _ => ConnectionStatus::Pending,
        };
        Connection {
            id: id.to_string(),
            user_id: self.from_user_id,
            connected_user_id: self.to_user_id,
            status,
            message: None,
            created_at_ms: self.created_at,
            updated_at_ms: self.updated_at.unwrap_or(self.created_at),
            schema_version: CONNECTION_SCHEMA_VERSION,
        }
    }
}

pub fn decode_connection(document: &Document) -> DomainResult<Connection> {
    let version = document
        .field("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    let mut connection = if version < 2 {
        document.decode::<ConnectionV1>()?.upgrade(document.id())
    } else {
        document.decode::<Connection>()?
    };
    connection.id = document.id().to_string();
    Ok(connection)
}

fn counter_updates(batch: &mut WriteBatch, connection: &Connection, delta: i64) -> DomainResult<()> {
    for user_id in [&connection.user_id, &connection.connected_user_id] {
        batch.upsert(
            social_stats_path(user_id)?,
            social_stats_delta(SocialCounter::Connections, delta),
        );
    }
    Ok(())
}

#[derive(Clone)]
pub struct ConnectionService {
    store: Arc<dyn DocumentStore>,
    notifications: NotificationService,
}

impl ConnectionService {
    pub fn new(store: Arc<dyn DocumentStore>, notifications: NotificationService) -> Self {
        Self {
            store,
            notifications,
        }
    }

    /// A rejected connection in either direction may be requested again;
    /// any other existing one is a conflict.
    pub async fn send_connection_request(
        &self,
        actor_id: &str,
        target_user_id: &str,
        message: Option<String>,
    ) -> DomainResult<Connection> {
        if target_user_id.trim().is_empty() || actor_id == target_user_id {
            return Err(DomainError::Validation(
                "a connection needs two different users".into(),
            ));
        }
        let message = message
            .map(|message| message.trim().to_string())
            .filter(|message| !message.is_empty());
        if message
            .as_ref()
            .is_some_and(|message| message.chars().count() > MAX_MESSAGE_LEN)
        {
            return Err(DomainError::Validation(format!(
                "connection message exceeds {MAX_MESSAGE_LEN} characters"
            )));
        }

        let outgoing = connection_path(actor_id, target_user_id)?;
        let incoming = connection_path(target_user_id, actor_id)?;
        let reads = vec![outgoing.clone(), incoming.clone()];
        let actor = actor_id.to_string();
        let target = target_user_id.to_string();

        let connection = transaction(self.store.as_ref(), reads, move |snapshot| {
            for path in [&outgoing, &incoming] {
                if let Some(document) = snapshot.get(path)? {
                    if decode_connection(document)?.status != ConnectionStatus::Rejected {
                        return Err(DomainError::Conflict(
                            "a connection between these users already exists".into(),
                        ));
                    }
                }
            }
            let now = now_ms();
            let connection = Connection {
                id: outgoing.id().to_string(),
                user_id: actor,
                connected_user_id: target,
                status: ConnectionStatus::Pending,
                message,
                created_at_ms: now,
                updated_at_ms: now,
                schema_version: CONNECTION_SCHEMA_VERSION,
            };
            let mut batch = WriteBatch::new();
            batch.set(outgoing.clone(), to_document_data(&connection)?);
            if snapshot.get(&incoming)?.is_some() {
                batch.delete(incoming.clone());
            }
            Ok((batch, connection))
        })
        .await?;

        self.notifications
            .notify_best_effort(
                NotificationCreate::new(
                    target_user_id,
                    NotificationType::ConnectionRequest,
                    "You have a new connection request",
                )
                .related(&connection.id),
            )
            .await;
        Ok(connection)
    }

    /// The recipient accepts or rejects a pending request. Acceptance bumps
    /// both users' connection counters in the same commit.
    pub async fn respond_to_connection(
        &self,
        actor_id: &str,
        connection_id: &str,
        accept: bool,
    ) -> DomainResult<Connection> {
        let path = connections_collection().doc(connection_id)?;
        let actor = actor_id.to_string();
        let read_path = path.clone();

        let connection = transaction(self.store.as_ref(), vec![path], move |snapshot| {
            let mut connection = decode_connection(snapshot.require(&read_path, "connection")?)?;
            if connection.connected_user_id != actor {
                return Err(DomainError::PermissionDenied(
                    "only the recipient can respond to a connection request".into(),
                ));
            }
            if connection.status != ConnectionStatus::Pending {
                return Err(DomainError::InvalidStatus(
                    "connection request was already answered".into(),
                ));
            }
            connection.status = if accept {
                ConnectionStatus::Accepted
            } else {
                ConnectionStatus::Rejected
            };
            connection.updated_at_ms = now_ms();
            connection.schema_version = CONNECTION_SCHEMA_VERSION;

            let mut batch = WriteBatch::new();
            batch.set(read_path.clone(), to_document_data(&connection)?);
            if accept {
                counter_updates(&mut batch, &connection, 1)?;
            }
            Ok((batch, connection))
        })
        .await?;

        if accept {
            self.notifications
                .notify_best_effort(
                    NotificationCreate::new(
                        &connection.user_id,
                        NotificationType::ConnectionAccepted,
                        "Your connection request was accepted",
                    )
                    .related(&connection.id),
                )
                .await;
        }
        Ok(connection)
    }

    pub async fn remove_connection(&self, actor_id: &str, connection_id: &str) -> DomainResult<()> {
        let path = connections_collection().doc(connection_id)?;
        let actor = actor_id.to_string();
        let read_path = path.clone();

        transaction(self.store.as_ref(), vec![path], move |snapshot| {
            let connection = decode_connection(snapshot.require(&read_path, "connection")?)?;
            if !connection.involves(&actor) {
                return Err(DomainError::PermissionDenied(
                    "only members of a connection can remove it".into(),
                ));
            }
            let mut batch = WriteBatch::new();
            batch.delete(read_path.clone());
            if connection.status == ConnectionStatus::Accepted {
                counter_updates(&mut batch, &connection, -1)?;
            }
            Ok((batch, ()))
        })
        .await
    }

    /// Connections in either direction, most recently updated first.
    pub async fn list_connections(
        &self,
        user_id: &str,
        status: Option<ConnectionStatus>,
    ) -> DomainResult<Vec<Connection>> {
        let mut seen = HashSet::new();
        let mut connections = Vec::new();
        for field in ["userId", "connectedUserId", "fromUserId", "toUserId"] {
            let query = Query::new(connections_collection()).filter(Filter::eq(field, user_id));
            for document in self.store.query(&query).await? {
                if !seen.insert(document.id().to_string()) {
                    continue;
                }
                match decode_connection(&document) {
                    Ok(connection) => {
                        if status.is_none_or(|status| connection.status == status) {
                            connections.push(connection);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(path = %document.path, error = %err, "skipping undecodable connection");
                    }
                }
            }
        }
        connections.sort_by(|left, right| {
            right
                .updated_at_ms
                .cmp(&left.updated_at_ms)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(connections)
    }
}
