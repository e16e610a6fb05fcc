//! Skill trades and their completion workflow.
//!
//! ```text
//! open --accept--> in-progress --request--> pending_confirmation --confirm--> completed
//! in-progress --request without required evidence--> pending_evidence
//! pending_evidence --request with evidence--> pending_confirmation
//! in-progress | pending_* --request changes--> disputed --resume--> in-progress
//! pending_confirmation --window elapsed--> completed (auto)
//! ```
//!
//! Every transition runs as a transaction over the trade document; two
//! parties racing to request completion never both become requester.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DomainResult;
use crate::config::ServiceConfig;
use crate::error::DomainError;
use crate::notifications::{NotificationCreate, NotificationService, NotificationType};
use crate::pagination::{FilteredPage, PageRequest, fetch_filtered_page, normalize_limit};
use crate::ports::documents::{
    CollectionPath, Direction, Document, DocumentPath, DocumentStore, Filter, Query, WriteBatch,
    to_document_data, transaction,
};
use crate::ports::telemetry::{Telemetry, TelemetryEvent};
use crate::query_builder::QueryBuilder;
use crate::users::{SocialCounter, social_stats_delta, social_stats_path};
use crate::util::{
    dedupe_and_trim, format_ms_rfc3339, lowercase_index, now_ms, uuid_v7_without_dashes,
};

pub const TRADE_SCHEMA_VERSION: u32 = 2;

const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 2000;
const MAX_SKILLS_PER_LIST: usize = 10;
const MAX_REASON_LEN: usize = 1000;
const MAX_EVIDENCE_ITEMS: usize = 10;

const TRADE_INDEX_GAPS: &[(&str, &str)] = &[("status", "category"), ("category", "skillsIndex")];

pub fn trades_collection() -> CollectionPath {
    CollectionPath::named("trades")
}

fn trade_path(id: &str) -> DomainResult<DocumentPath> {
    trades_collection().doc(id)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "pending_confirmation")]
    PendingConfirmation,
    #[serde(rename = "pending_evidence")]
    PendingEvidence,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "disputed")]
    Disputed,
}

impl TradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in-progress",
            Self::PendingConfirmation => "pending_confirmation",
            Self::PendingEvidence => "pending_evidence",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Disputed => "disputed",
        }
    }

    fn from_legacy(raw: &str) -> Option<Self> {
        match raw {
            "open" | "active" => Some(Self::Open),
            "in-progress" | "in_progress" | "inProgress" => Some(Self::InProgress),
            "pending_confirmation" | "pending-confirmation" => Some(Self::PendingConfirmation),
            "pending_evidence" => Some(Self::PendingEvidence),
            "completed" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "disputed" => Some(Self::Disputed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TradeVisibility {
    #[default]
    Public,
    Private,
    Unlisted,
}

impl TradeVisibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Unlisted => "unlisted",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TradeSkill {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl TradeSkill {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            level: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvidence {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub requested_by: String,
    pub requested_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub evidence: Vec<CompletionEvidence>,
    pub auto_complete_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub requested_by: String,
    pub reason: String,
    pub requested_at_ms: i64,
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub creator_id: String,
    #[serde(default)]
    pub creator_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub offered_skills: Vec<TradeSkill>,
    #[serde(default)]
    pub wanted_skills: Vec<TradeSkill>,
    #[serde(default)]
    pub skills_index: Vec<String>,
    pub status: TradeStatus,
    #[serde(default)]
    pub visibility: TradeVisibility,
    #[serde(default)]
    pub requires_evidence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_confirmed_by: Option<String>,
    #[serde(default)]
    pub auto_completed: bool,
    #[serde(default)]
    pub change_requests: Vec<ChangeRequest>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schema_version: u32,
}

impl Trade {
    pub fn is_party(&self, user_id: &str) -> bool {
        self.creator_id == user_id || self.participant_id.as_deref() == Some(user_id)
    }

    /// The party on the other side of `user_id`, when there is one.
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        if self.creator_id == user_id {
            self.participant_id.as_deref()
        } else if self.participant_id.as_deref() == Some(user_id) {
            Some(self.creator_id.as_str())
        } else {
            None
        }
    }

    pub fn visible_to(&self, viewer_id: Option<&str>) -> bool {
        match self.visibility {
            TradeVisibility::Public => true,
            TradeVisibility::Private | TradeVisibility::Unlisted => {
                viewer_id.is_some_and(|viewer| self.is_party(viewer))
            }
        }
    }

    fn refresh_skills_index(&mut self) {
        self.skills_index = lowercase_index(
            self.offered_skills
                .iter()
                .chain(self.wanted_skills.iter())
                .map(|skill| skill.name.as_str()),
        );
    }

    fn matches_term(&self, term: &str) -> bool {
        let needle = term.to_lowercase();
        self.title.to_lowercase().contains(&needle)
            || self.description.to_lowercase().contains(&needle)
            || self.skills_index.iter().any(|skill| skill.contains(&needle))
    }
}

/// Stored shape before skills carried levels and completion was nested.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeDocumentV1 {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: String,
    creator_id: String,
    #[serde(default)]
    creator_name: String,
    #[serde(default)]
    participant_id: Option<String>,
    #[serde(default)]
    skills_offered: Vec<String>,
    #[serde(default)]
    skills_wanted: Vec<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    visibility: Option<TradeVisibility>,
    #[serde(default)]
    completion_requested_by: Option<String>,
    #[serde(default)]
    completion_requested_at: Option<i64>,
    #[serde(default)]
    completion_notes: Option<String>,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    updated_at: Option<i64>,
}

impl TradeDocumentV1 {
    fn upgrade(self, id: &str, auto_complete_after_ms: i64) -> DomainResult<Trade> {
        let status = TradeStatus::from_legacy(&self.status).ok_or_else(|| {
            DomainError::Unknown(format!("trade {id} has unknown status '{}'", self.status))
        })?;
        let completion = self.completion_requested_by.map(|requested_by| {
            let requested_at_ms = self.completion_requested_at.unwrap_or(self.created_at);
            CompletionRequest {
                requested_by,
                requested_at_ms,
                notes: self.completion_notes,
                evidence: Vec::new(),
                auto_complete_at_ms: requested_at_ms + auto_complete_after_ms,
            }
        });
        let to_skills = |names: Vec<String>| -> Vec<TradeSkill> {
            dedupe_and_trim(&names).into_iter().map(TradeSkill::new).collect()
        };
        let mut trade = Trade {
            id: id.to_string(),
            title: self.title,
            description: self.description,
            category: self.category,
            creator_id: self.creator_id,
            creator_name: self.creator_name,
            participant_id: self.participant_id,
            offered_skills: to_skills(self.skills_offered),
            wanted_skills: to_skills(self.skills_wanted),
            skills_index: Vec::new(),
            status,
            visibility: self.visibility.unwrap_or_default(),
            requires_evidence: false,
            completion,
            completed_at_ms: None,
            completion_confirmed_by: None,
            auto_completed: false,
            change_requests: Vec::new(),
            created_at_ms: self.created_at,
            updated_at_ms: self.updated_at.unwrap_or(self.created_at),
            schema_version: TRADE_SCHEMA_VERSION,
        };
        trade.refresh_skills_index();
        Ok(trade)
    }
}

/// Decodes either stored trade shape. `auto_complete_after_ms` dates the
/// auto-completion of legacy pending requests.
pub fn decode_trade(document: &Document, auto_complete_after_ms: i64) -> DomainResult<Trade> {
    let version = document
        .field("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    let mut trade = if version < 2 {
        document
            .decode::<TradeDocumentV1>()?
            .upgrade(document.id(), auto_complete_after_ms)?
    } else {
        document.decode::<Trade>()?
    };
    trade.id = document.id().to_string();
    if trade.skills_index.is_empty() {
        trade.refresh_skills_index();
    }
    Ok(trade)
}

fn validate_skills(skills: &[TradeSkill], what: &str) -> DomainResult<Vec<TradeSkill>> {
    if skills.len() > MAX_SKILLS_PER_LIST {
        return Err(DomainError::Validation(format!(
            "at most {MAX_SKILLS_PER_LIST} {what} skills are allowed"
        )));
    }
    let mut seen = HashSet::new();
    let mut cleaned = Vec::with_capacity(skills.len());
    for skill in skills {
        let name = skill.name.trim();
        if name.is_empty() {
            return Err(DomainError::Validation(format!("{what} skill names must not be empty")));
        }
        if seen.insert(name.to_lowercase()) {
            cleaned.push(TradeSkill {
                name: name.to_string(),
                level: skill.level.clone(),
            });
        }
    }
    Ok(cleaned)
}

fn validate_text(value: &str, field: &str, max: usize, required: bool) -> DomainResult<String> {
    let trimmed = value.trim();
    if required && trimmed.is_empty() {
        return Err(DomainError::Validation(format!("{field} is required")));
    }
    if trimmed.chars().count() > max {
        return Err(DomainError::Validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TradeCreate {
    pub title: String,
    pub description: String,
    pub category: String,
    pub creator_name: String,
    pub offered_skills: Vec<TradeSkill>,
    pub wanted_skills: Vec<TradeSkill>,
    pub visibility: TradeVisibility,
    pub requires_evidence: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TradeUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub offered_skills: Option<Vec<TradeSkill>>,
    pub wanted_skills: Option<Vec<TradeSkill>>,
    pub visibility: Option<TradeVisibility>,
    pub requires_evidence: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionRequestInput {
    pub notes: Option<String>,
    pub evidence: Vec<CompletionEvidence>,
}

/// What a completion request turned into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionOutcome {
    AwaitingEvidence,
    AwaitingConfirmation,
    Completed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TradeFilters {
    pub status: Option<TradeStatus>,
    pub category: Option<String>,
    pub creator_id: Option<String>,
    pub skills: Vec<String>,
    pub visibility: Option<TradeVisibility>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TradeOrder {
    #[default]
    NewestFirst,
    OldestFirst,
    RecentlyUpdated,
}

impl TradeOrder {
    fn field_and_direction(self) -> (&'static str, Direction) {
        match self {
            Self::NewestFirst => ("createdAtMs", Direction::Descending),
            Self::OldestFirst => ("createdAtMs", Direction::Ascending),
            Self::RecentlyUpdated => ("updatedAtMs", Direction::Descending),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TradeSearch {
    pub filters: TradeFilters,
    pub search_term: Option<String>,
    pub order: TradeOrder,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

fn ensure_party(trade: &Trade, actor_id: &str, action: &str) -> DomainResult<()> {
    if trade.is_party(actor_id) {
        Ok(())
    } else {
        Err(DomainError::PermissionDenied(format!(
            "only trade participants can {action}"
        )))
    }
}

fn ensure_creator(trade: &Trade, actor_id: &str, action: &str) -> DomainResult<()> {
    if trade.creator_id == actor_id {
        Ok(())
    } else {
        Err(DomainError::PermissionDenied(format!(
            "only the trade creator can {action}"
        )))
    }
}

fn invalid_status(trade: &Trade, action: &str) -> DomainError {
    DomainError::InvalidStatus(format!(
        "cannot {action} a trade in status {}",
        trade.status.as_str()
    ))
}

fn complete(trade: &mut Trade, confirmed_by: Option<&str>, now: i64) {
    trade.status = TradeStatus::Completed;
    trade.completed_at_ms = Some(now);
    trade.completion_confirmed_by = confirmed_by.map(str::to_string);
    trade.auto_completed = confirmed_by.is_none();
    trade.updated_at_ms = now;
}

/// Completion writes: the trade plus both parties' trade counters.
fn completion_batch(trade: &Trade) -> DomainResult<WriteBatch> {
    let mut batch = WriteBatch::new();
    batch.set(trade_path(&trade.id)?, to_document_data(trade)?);
    let parties = std::iter::once(trade.creator_id.as_str()).chain(trade.participant_id.as_deref());
    for party in parties {
        batch.upsert(
            social_stats_path(party)?,
            social_stats_delta(SocialCounter::Trades, 1),
        );
    }
    Ok(batch)
}

/// Applies a completion request by `actor_id` to `trade`.
fn apply_completion_request(
    trade: &mut Trade,
    actor_id: &str,
    input: &CompletionRequestInput,
    now: i64,
    auto_complete_after_ms: i64,
) -> DomainResult<CompletionOutcome> {
    ensure_party(trade, actor_id, "request completion")?;
    match trade.status {
        TradeStatus::InProgress | TradeStatus::PendingEvidence => {
            let completion = CompletionRequest {
                requested_by: actor_id.to_string(),
                requested_at_ms: now,
                notes: input
                    .notes
                    .as_deref()
                    .map(str::trim)
                    .filter(|notes| !notes.is_empty())
                    .map(str::to_string),
                evidence: input.evidence.clone(),
                auto_complete_at_ms: now + auto_complete_after_ms,
            };
            let outcome = if trade.requires_evidence && input.evidence.is_empty() {
                trade.status = TradeStatus::PendingEvidence;
                CompletionOutcome::AwaitingEvidence
            } else {
                trade.status = TradeStatus::PendingConfirmation;
                CompletionOutcome::AwaitingConfirmation
            };
            trade.completion = Some(completion);
            trade.updated_at_ms = now;
            Ok(outcome)
        }
        TradeStatus::PendingConfirmation => {
            let requester = trade
                .completion
                .as_ref()
                .map(|completion| completion.requested_by.as_str());
            if requester == Some(actor_id) {
                return Err(DomainError::InvalidStatus(
                    "completion was already requested by this participant".into(),
                ));
            }
            complete(trade, Some(actor_id), now);
            Ok(CompletionOutcome::Completed)
        }
        _ => Err(invalid_status(trade, "request completion of")),
    }
}

/// Checks run in order: status, membership, then requester.
fn apply_confirmation(trade: &mut Trade, actor_id: &str, now: i64) -> DomainResult<()> {
    if trade.status != TradeStatus::PendingConfirmation {
        return Err(invalid_status(trade, "confirm"));
    }
    ensure_party(trade, actor_id, "confirm completion")?;
    let requester = trade
        .completion
        .as_ref()
        .map(|completion| completion.requested_by.as_str());
    if requester == Some(actor_id) {
        return Err(DomainError::PermissionDenied(
            "the requesting participant cannot confirm their own request".into(),
        ));
    }
    complete(trade, Some(actor_id), now);
    Ok(())
}

#[derive(Clone)]
pub struct TradeService {
    store: Arc<dyn DocumentStore>,
    notifications: NotificationService,
    telemetry: Telemetry,
    config: ServiceConfig,
}

impl TradeService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifications: NotificationService,
        telemetry: Telemetry,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            notifications,
            telemetry,
            config,
        }
    }

    fn decode(&self, document: &Document) -> DomainResult<Trade> {
        decode_trade(document, self.config.auto_complete_after_ms)
    }

    pub async fn create_trade(&self, actor_id: &str, input: TradeCreate) -> DomainResult<Trade> {
        let title = validate_text(&input.title, "title", MAX_TITLE_LEN, true)?;
        let description = validate_text(&input.description, "description", MAX_DESCRIPTION_LEN, false)?;
        let offered_skills = validate_skills(&input.offered_skills, "offered")?;
        let wanted_skills = validate_skills(&input.wanted_skills, "wanted")?;
        if offered_skills.is_empty() {
            return Err(DomainError::Validation(
                "a trade must offer at least one skill".into(),
            ));
        }

        let now = now_ms();
        let mut trade = Trade {
            id: uuid_v7_without_dashes(),
            title,
            description,
            category: input.category.trim().to_string(),
            creator_id: actor_id.to_string(),
            creator_name: input.creator_name.trim().to_string(),
            participant_id: None,
            offered_skills,
            wanted_skills,
            skills_index: Vec::new(),
            status: TradeStatus::Open,
            visibility: input.visibility,
            requires_evidence: input.requires_evidence,
            completion: None,
            completed_at_ms: None,
            completion_confirmed_by: None,
            auto_completed: false,
            change_requests: Vec::new(),
            created_at_ms: now,
            updated_at_ms: now,
            schema_version: TRADE_SCHEMA_VERSION,
        };
        trade.refresh_skills_index();
        self.store
            .set(&trade_path(&trade.id)?, to_document_data(&trade)?)
            .await?;

        self.telemetry
            .track(
                TelemetryEvent::new("trade_created")
                    .actor(actor_id)
                    .entity(&trade.id)
                    .property("category", &trade.category),
            )
            .await;
        Ok(trade)
    }

    pub async fn get_trade(&self, id: &str) -> DomainResult<Trade> {
        let document = self
            .store
            .get(&trade_path(id)?)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("trade {id}")))?;
        self.decode(&document)
    }

    /// Loads the trade inside a transaction, lets `change` mutate it and
    /// writes it back. Returns the stored trade and `change`'s output.
    async fn mutate<T, F>(&self, id: &str, change: F) -> DomainResult<(Trade, T)>
    where
        T: Send + 'static,
        F: FnOnce(&mut Trade, i64) -> DomainResult<(T, bool)> + Send + 'static,
    {
        let path = trade_path(id)?;
        let auto_complete_after_ms = self.config.auto_complete_after_ms;
        let read_path = path.clone();
        transaction(self.store.as_ref(), vec![path], move |snapshot| {
            let document = snapshot.require(&read_path, "trade")?;
            let mut trade = decode_trade(document, auto_complete_after_ms)?;
            let (output, completed) = change(&mut trade, now_ms())?;
            trade.schema_version = TRADE_SCHEMA_VERSION;
            let batch = if completed {
                completion_batch(&trade)?
            } else {
                let mut batch = WriteBatch::new();
                batch.set(read_path.clone(), to_document_data(&trade)?);
                batch
            };
            Ok((batch, (trade, output)))
        })
        .await
    }

    async fn notify_counterpart(
        &self,
        trade: &Trade,
        actor_id: &str,
        notification_type: NotificationType,
        message: String,
    ) {
        let Some(recipient) = trade.counterpart(actor_id) else {
            return;
        };
        self.notifications
            .notify_best_effort(
                NotificationCreate::new(recipient, notification_type, message).related(&trade.id),
            )
            .await;
    }

    pub async fn update_trade(
        &self,
        actor_id: &str,
        id: &str,
        update: TradeUpdate,
    ) -> DomainResult<Trade> {
        let title = update
            .title
            .as_deref()
            .map(|title| validate_text(title, "title", MAX_TITLE_LEN, true))
            .transpose()?;
        let description = update
            .description
            .as_deref()
            .map(|text| validate_text(text, "description", MAX_DESCRIPTION_LEN, false))
            .transpose()?;
        let offered = update
            .offered_skills
            .as_deref()
            .map(|skills| validate_skills(skills, "offered"))
            .transpose()?;
        if offered.as_ref().is_some_and(Vec::is_empty) {
            return Err(DomainError::Validation(
                "a trade must offer at least one skill".into(),
            ));
        }
        let wanted = update
            .wanted_skills
            .as_deref()
            .map(|skills| validate_skills(skills, "wanted"))
            .transpose()?;
        let actor = actor_id.to_string();

        let (trade, ()) = self
            .mutate(id, move |trade, now| {
                ensure_creator(trade, &actor, "edit it")?;
                if trade.status != TradeStatus::Open {
                    return Err(invalid_status(trade, "edit"));
                }
                if let Some(title) = title {
                    trade.title = title;
                }
                if let Some(description) = description {
                    trade.description = description;
                }
                if let Some(category) = update.category {
                    trade.category = category.trim().to_string();
                }
                if let Some(offered) = offered {
                    trade.offered_skills = offered;
                }
                if let Some(wanted) = wanted {
                    trade.wanted_skills = wanted;
                }
                if let Some(visibility) = update.visibility {
                    trade.visibility = visibility;
                }
                if let Some(requires_evidence) = update.requires_evidence {
                    trade.requires_evidence = requires_evidence;
                }
                trade.refresh_skills_index();
                trade.updated_at_ms = now;
                Ok(((), false))
            })
            .await?;
        Ok(trade)
    }

    pub async fn delete_trade(&self, actor_id: &str, id: &str) -> DomainResult<()> {
        let path = trade_path(id)?;
        let actor = actor_id.to_string();
        let auto_complete_after_ms = self.config.auto_complete_after_ms;
        let read_path = path.clone();
        transaction(self.store.as_ref(), vec![path], move |snapshot| {
            let trade = decode_trade(snapshot.require(&read_path, "trade")?, auto_complete_after_ms)?;
            ensure_creator(&trade, &actor, "delete it")?;
            if trade.status == TradeStatus::Completed {
                return Err(invalid_status(&trade, "delete"));
            }
            let mut batch = WriteBatch::new();
            batch.delete(read_path.clone());
            Ok((batch, ()))
        })
        .await
    }

    /// The creator accepts `participant_id` as the other party.
    pub async fn accept_trade(
        &self,
        actor_id: &str,
        id: &str,
        participant_id: &str,
    ) -> DomainResult<Trade> {
        if participant_id.trim().is_empty() {
            return Err(DomainError::Validation("participant is required".into()));
        }
        let actor = actor_id.to_string();
        let participant = participant_id.to_string();
        let (trade, ()) = self
            .mutate(id, move |trade, now| {
                ensure_creator(trade, &actor, "accept a participant")?;
                if trade.status != TradeStatus::Open {
                    return Err(invalid_status(trade, "accept"));
                }
                if participant == trade.creator_id {
                    return Err(DomainError::Validation(
                        "the creator cannot trade with themselves".into(),
                    ));
                }
                trade.participant_id = Some(participant);
                trade.status = TradeStatus::InProgress;
                trade.updated_at_ms = now;
                Ok(((), false))
            })
            .await?;

        self.notify_counterpart(
            &trade,
            actor_id,
            NotificationType::TradeAccepted,
            format!("You were accepted for \"{}\"", trade.title),
        )
        .await;
        self.telemetry
            .track(TelemetryEvent::new("trade_accepted").actor(actor_id).entity(id))
            .await;
        Ok(trade)
    }

    /// Requests completion. A request by the other party while one is
    /// pending confirms it instead.
    pub async fn request_trade_completion(
        &self,
        actor_id: &str,
        id: &str,
        input: CompletionRequestInput,
    ) -> DomainResult<(Trade, CompletionOutcome)> {
        if input.evidence.len() > MAX_EVIDENCE_ITEMS {
            return Err(DomainError::Validation(format!(
                "at most {MAX_EVIDENCE_ITEMS} evidence items are allowed"
            )));
        }
        if input.evidence.iter().any(|item| item.url.trim().is_empty()) {
            return Err(DomainError::Validation("evidence url is required".into()));
        }
        let actor = actor_id.to_string();
        let auto_complete_after_ms = self.config.auto_complete_after_ms;
        let (trade, outcome) = self
            .mutate(id, move |trade, now| {
                let outcome =
                    apply_completion_request(trade, &actor, &input, now, auto_complete_after_ms)?;
                Ok((outcome, outcome == CompletionOutcome::Completed))
            })
            .await?;

        match outcome {
            CompletionOutcome::AwaitingConfirmation => {
                self.notify_counterpart(
                    &trade,
                    actor_id,
                    NotificationType::TradeCompletionRequested,
                    format!("Please confirm completion of \"{}\"", trade.title),
                )
                .await;
            }
            CompletionOutcome::Completed => {
                self.notify_counterpart(
                    &trade,
                    actor_id,
                    NotificationType::TradeCompleted,
                    format!("\"{}\" is complete", trade.title),
                )
                .await;
            }
            CompletionOutcome::AwaitingEvidence => {}
        }
        self.telemetry
            .track(
                TelemetryEvent::new("trade_completion_requested")
                    .actor(actor_id)
                    .entity(id)
                    .property("outcome", format!("{outcome:?}")),
            )
            .await;
        Ok((trade, outcome))
    }

    pub async fn confirm_trade_completion(&self, actor_id: &str, id: &str) -> DomainResult<Trade> {
        let actor = actor_id.to_string();
        let (trade, ()) = self
            .mutate(id, move |trade, now| {
                apply_confirmation(trade, &actor, now)?;
                Ok(((), true))
            })
            .await?;

        self.notify_counterpart(
            &trade,
            actor_id,
            NotificationType::TradeCompleted,
            format!("\"{}\" is complete", trade.title),
        )
        .await;
        self.telemetry
            .track(TelemetryEvent::new("trade_completed").actor(actor_id).entity(id))
            .await;
        Ok(trade)
    }

    /// Disputes the trade, dropping any pending completion request.
    pub async fn request_trade_changes(
        &self,
        actor_id: &str,
        id: &str,
        reason: &str,
    ) -> DomainResult<Trade> {
        let reason = validate_text(reason, "reason", MAX_REASON_LEN, true)?;
        let actor = actor_id.to_string();
        let (trade, ()) = self
            .mutate(id, move |trade, now| {
                ensure_party(trade, &actor, "request changes")?;
                if !matches!(
                    trade.status,
                    TradeStatus::InProgress
                        | TradeStatus::PendingConfirmation
                        | TradeStatus::PendingEvidence
                ) {
                    return Err(invalid_status(trade, "request changes on"));
                }
                trade.change_requests.push(ChangeRequest {
                    requested_by: actor,
                    reason,
                    requested_at_ms: now,
                    resolved: false,
                });
                trade.completion = None;
                trade.status = TradeStatus::Disputed;
                trade.updated_at_ms = now;
                Ok(((), false))
            })
            .await?;

        self.notify_counterpart(
            &trade,
            actor_id,
            NotificationType::TradeChangesRequested,
            format!("Changes were requested on \"{}\"", trade.title),
        )
        .await;
        Ok(trade)
    }

    pub async fn resume_trade(&self, actor_id: &str, id: &str) -> DomainResult<Trade> {
        let actor = actor_id.to_string();
        let (trade, ()) = self
            .mutate(id, move |trade, now| {
                ensure_party(trade, &actor, "resume it")?;
                if trade.status != TradeStatus::Disputed {
                    return Err(invalid_status(trade, "resume"));
                }
                for request in &mut trade.change_requests {
                    request.resolved = true;
                }
                trade.status = TradeStatus::InProgress;
                trade.updated_at_ms = now;
                Ok(((), false))
            })
            .await?;
        Ok(trade)
    }

    pub async fn cancel_trade(&self, actor_id: &str, id: &str) -> DomainResult<Trade> {
        let actor = actor_id.to_string();
        let (trade, ()) = self
            .mutate(id, move |trade, now| {
                ensure_party(trade, &actor, "cancel it")?;
                if trade.status.is_terminal() {
                    return Err(invalid_status(trade, "cancel"));
                }
                trade.status = TradeStatus::Cancelled;
                trade.completion = None;
                trade.updated_at_ms = now;
                Ok(((), false))
            })
            .await?;

        self.notify_counterpart(
            &trade,
            actor_id,
            NotificationType::TradeCancelled,
            format!("\"{}\" was cancelled", trade.title),
        )
        .await;
        Ok(trade)
    }

    /// Completes every pending trade whose confirmation window ended at or
    /// before `now`. Returns the ids of the trades completed.
    pub async fn auto_complete_overdue(&self, now: i64) -> DomainResult<Vec<String>> {
        let query = Query::new(trades_collection())
            .filter(Filter::eq("status", TradeStatus::PendingConfirmation.as_str()));
        let overdue_filter = Filter::le("completion.autoCompleteAtMs", now);
        let candidates: Vec<String> = self
            .store
            .query(&query)
            .await?
            .into_iter()
            .filter(|document| overdue_filter.matches(&document.data))
            .map(|document| document.id().to_string())
            .collect();

        let mut completed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let outcome = self
                .mutate(&id, move |trade, stamp| {
                    let due = trade.status == TradeStatus::PendingConfirmation
                        && trade
                            .completion
                            .as_ref()
                            .is_some_and(|completion| completion.auto_complete_at_ms <= now);
                    if !due {
                        return Err(invalid_status(trade, "auto-complete"));
                    }
                    complete(trade, None, stamp);
                    Ok(((), true))
                })
                .await;
            match outcome {
                Ok((trade, ())) => {
                    for party in std::iter::once(trade.creator_id.as_str())
                        .chain(trade.participant_id.as_deref())
                    {
                        self.notifications
                            .notify_best_effort(
                                NotificationCreate::new(
                                    party,
                                    NotificationType::TradeCompleted,
                                    format!("\"{}\" was completed automatically", trade.title),
                                )
                                .related(&trade.id),
                            )
                            .await;
                    }
                    completed.push(trade.id);
                }
                Err(DomainError::InvalidStatus(_)) | Err(DomainError::NotFound(_)) => {
                    tracing::debug!(trade_id = %id, "trade changed before auto-completion");
                }
                Err(err) => return Err(err),
            }
        }
        if !completed.is_empty() {
            tracing::info!(
                count = completed.len(),
                cutoff = %format_ms_rfc3339(now),
                "auto-completed overdue trades"
            );
        }
        Ok(completed)
    }

    /// Searches trades visible to `viewer_id`. Status, category, creator,
    /// skills and visibility are server constraints when the index allows;
    /// visibility rules and the free-text term are applied in memory.
    pub async fn search_trades(
        &self,
        viewer_id: Option<&str>,
        search: TradeSearch,
    ) -> DomainResult<FilteredPage<Trade>> {
        let limit = normalize_limit(
            search.limit,
            self.config.default_page_size,
            self.config.max_page_size,
        );
        let (order_field, direction) = search.order.field_and_direction();
        let filters = search.filters;
        let mut builder =
            QueryBuilder::new(trades_collection(), TRADE_INDEX_GAPS).order_by(order_field, direction);
        if let Some(status) = filters.status {
            builder = builder.exact("status", status.as_str());
        }
        if let Some(category) = filters.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            builder = builder.exact("category", category);
        }
        if let Some(creator_id) = filters.creator_id {
            builder = builder.exact("creatorId", creator_id);
        }
        if let Some(visibility) = filters.visibility {
            builder = builder.exact("visibility", visibility.as_str());
        }
        let skills = lowercase_index(filters.skills.iter().map(String::as_str))
            .into_iter()
            .map(Value::from)
            .collect();
        builder = builder.contains_any("skillsIndex", skills);
        let plan = builder.build();

        let term = search
            .search_term
            .map(|term| term.trim().to_string())
            .filter(|term| !term.is_empty());
        let request = PageRequest::new(limit)
            .after(search.cursor)
            .max_batches(self.config.search_max_batches);
        fetch_filtered_page(
            self.store.as_ref(),
            &plan.query,
            &request,
            |document| self.decode(document),
            |document, trade| {
                plan.accepts_document(document)
                    && trade.visible_to(viewer_id)
                    && term.as_deref().is_none_or(|term| trade.matches_term(term))
            },
        )
        .await
    }

    /// Trades created by or involving `user_id`, newest first.
    pub async fn list_user_trades(&self, user_id: &str) -> DomainResult<Vec<Trade>> {
        let mut seen = HashSet::new();
        let mut trades = Vec::new();
        for field in ["creatorId", "participantId"] {
            let query = Query::new(trades_collection()).filter(Filter::eq(field, user_id));
            for document in self.store.query(&query).await? {
                if !seen.insert(document.id().to_string()) {
                    continue;
                }
                match self.decode(&document) {
                    Ok(trade) => trades.push(trade),
                    Err(err) => {
                        tracing::warn!(path = %document.path, error = %err, "skipping undecodable trade");
                    }
                }
            }
        }
        trades.sort_by(|left, right| {
            right
                .created_at_ms
                .cmp(&left.created_at_ms)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryDocumentStore;
    use serde_json::json;

    fn trade_fixture(status: TradeStatus) -> Trade {
        let mut trade = Trade {
            id: "t1".into(),
            title: "Guitar for Rust".into(),
            description: String::new(),
            category: "music".into(),
            creator_id: "u1".into(),
            creator_name: "Ana".into(),
            participant_id: Some("u2".into()),
            offered_skills: vec![TradeSkill::new("Guitar")],
            wanted_skills: vec![TradeSkill::new("Rust")],
            skills_index: Vec::new(),
            status,
            visibility: TradeVisibility::Public,
            requires_evidence: false,
            completion: None,
            completed_at_ms: None,
            completion_confirmed_by: None,
            auto_completed: false,
            change_requests: Vec::new(),
            created_at_ms: 1,
            updated_at_ms: 1,
            schema_version: TRADE_SCHEMA_VERSION,
        };
        trade.refresh_skills_index();
        trade
    }

    #[test]
    fn second_party_request_confirms() {
        let mut trade = trade_fixture(TradeStatus::InProgress);
        let input = CompletionRequestInput::default();
        let first = apply_completion_request(&mut trade, "u1", &input, 10, 100).expect("request");
        assert_eq!(first, CompletionOutcome::AwaitingConfirmation);
        assert_eq!(
            trade.completion.as_ref().map(|c| c.auto_complete_at_ms),
            Some(110)
        );

        let repeat = apply_completion_request(&mut trade, "u1", &input, 11, 100);
        assert!(matches!(repeat, Err(DomainError::InvalidStatus(_))));

        let second = apply_completion_request(&mut trade, "u2", &input, 12, 100).expect("confirm");
        assert_eq!(second, CompletionOutcome::Completed);
        assert_eq!(trade.status, TradeStatus::Completed);
        assert_eq!(trade.completion_confirmed_by.as_deref(), Some("u2"));
    }

    #[test]
    fn missing_evidence_parks_the_trade() {
        let mut trade = trade_fixture(TradeStatus::InProgress);
        trade.requires_evidence = true;
        let outcome = apply_completion_request(
            &mut trade,
            "u2",
            &CompletionRequestInput::default(),
            10,
            100,
        )
        .expect("request");
        assert_eq!(outcome, CompletionOutcome::AwaitingEvidence);
        assert_eq!(trade.status, TradeStatus::PendingEvidence);

        let with_evidence = CompletionRequestInput {
            notes: None,
            evidence: vec![CompletionEvidence {
                url: "https://example.org/proof".into(),
                description: None,
            }],
        };
        let outcome = apply_completion_request(&mut trade, "u2", &with_evidence, 11, 100)
            .expect("request with evidence");
        assert_eq!(outcome, CompletionOutcome::AwaitingConfirmation);
    }

    #[test]
    fn confirmation_checks_status_before_membership() {
        let mut trade = trade_fixture(TradeStatus::InProgress);
        let err = apply_confirmation(&mut trade, "stranger", 5).expect_err("status first");
        assert!(matches!(err, DomainError::InvalidStatus(_)));
    }

    #[test]
    fn requester_cannot_confirm() {
        let mut trade = trade_fixture(TradeStatus::InProgress);
        apply_completion_request(&mut trade, "u1", &CompletionRequestInput::default(), 1, 10)
            .expect("request");
        let err = apply_confirmation(&mut trade, "u1", 2).expect_err("requester");
        assert!(matches!(err, DomainError::PermissionDenied(_)));
        assert_eq!(trade.status, TradeStatus::PendingConfirmation);
        let err = apply_confirmation(&mut trade, "u3", 2).expect_err("outsider");
        assert!(matches!(err, DomainError::PermissionDenied(_)));
    }

    #[test]
    fn outsiders_cannot_request_completion() {
        let mut trade = trade_fixture(TradeStatus::InProgress);
        let err = apply_completion_request(&mut trade, "u3", &CompletionRequestInput::default(), 1, 1)
            .expect_err("outsider");
        assert_eq!(err.code(), "permission-denied");
    }

    #[test]
    fn legacy_trades_are_upgraded() {
        let legacy = json!({
            "title": "Old trade",
            "creatorId": "u1",
            "participantId": "u2",
            "skillsOffered": ["Guitar", " guitar "],
            "skillsWanted": ["Rust"],
            "status": "pending_confirmation",
            "completionRequestedBy": "u2",
            "completionRequestedAt": 1_000,
            "createdAt": 500
        });
        let document = Document::new(
            trade_path("old").expect("path"),
            legacy.as_object().cloned().expect("object"),
        );
        let trade = decode_trade(&document, 50).expect("decode");
        assert_eq!(trade.id, "old");
        assert_eq!(trade.status, TradeStatus::PendingConfirmation);
        assert_eq!(trade.skills_index, vec!["guitar".to_string(), "rust".to_string()]);
        let completion = trade.completion.expect("completion");
        assert_eq!(completion.requested_by, "u2");
        assert_eq!(completion.auto_complete_at_ms, 1_050);
        assert_eq!(trade.updated_at_ms, 500);
    }

    #[test]
    fn unknown_legacy_status_is_rejected() {
        let legacy = json!({ "creatorId": "u1", "status": "weird" });
        let document = Document::new(
            trade_path("odd").expect("path"),
            legacy.as_object().cloned().expect("object"),
        );
        assert!(decode_trade(&document, 0).is_err());
    }

    #[test]
    fn private_trades_are_visible_to_parties_only() {
        let mut trade = trade_fixture(TradeStatus::Open);
        trade.visibility = TradeVisibility::Private;
        assert!(trade.visible_to(Some("u2")));
        assert!(!trade.visible_to(Some("u3")));
        assert!(!trade.visible_to(None));
    }

    #[tokio::test]
    async fn create_validates_input() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let service = TradeService::new(
            store.clone(),
            NotificationService::new(store, ServiceConfig::default()),
            Telemetry::disabled(),
            ServiceConfig::default(),
        );
        let err = service
            .create_trade(
                "u1",
                TradeCreate {
                    title: "x".repeat(201),
                    offered_skills: vec![TradeSkill::new("Rust")],
                    ..TradeCreate::default()
                },
            )
            .await
            .expect_err("title too long");
        assert_eq!(err.code(), "invalid-argument");

        let err = service
            .create_trade(
                "u1",
                TradeCreate {
                    title: "No skills".into(),
                    ..TradeCreate::default()
                },
            )
            .await
            .expect_err("no skills");
        assert_eq!(err.code(), "invalid-argument");
    }
}
