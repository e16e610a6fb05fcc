//! Collaborations, their roles and role applications.
//!
//! `roleCount`, `filledRoleCount` and `completedRoleCount` on the
//! collaboration always equal the number of roles, filled roles and
//! completed roles. Every write that changes a role's status adjusts them
//! in the same transaction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DomainResult;
use crate::config::ServiceConfig;
use crate::error::DomainError;
use crate::notifications::{NotificationCreate, NotificationService, NotificationType};
use crate::pagination::{FilteredPage, PageRequest, fetch_filtered_page, normalize_limit};
use crate::ports::documents::{
    CollectionPath, Direction, Document, DocumentPath, DocumentStore, Query, TransactionReads,
    TransactionSnapshot, WriteBatch, to_document_data, transaction,
};
use crate::ports::telemetry::{Telemetry, TelemetryEvent};
use crate::query_builder::{CollaborationFilters, CollaborationQueryBuilder};
use crate::users::{SocialCounter, social_stats_delta, social_stats_path};
use crate::util::{dedupe_and_trim, lowercase_index, now_ms, uuid_v7_without_dashes};

pub const COLLABORATION_SCHEMA_VERSION: u32 = 2;

const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 5000;
const MAX_ROLES: usize = 20;
const MAX_MESSAGE_LEN: usize = 1000;

pub fn collaborations_collection() -> CollectionPath {
    CollectionPath::named("collaborations")
}

pub fn collaboration_path(id: &str) -> DomainResult<DocumentPath> {
    collaborations_collection().doc(id)
}

pub fn roles_collection(collaboration_id: &str) -> DomainResult<CollectionPath> {
    collaboration_path(collaboration_id)?.child("roles")
}

pub fn role_path(collaboration_id: &str, role_id: &str) -> DomainResult<DocumentPath> {
    roles_collection(collaboration_id)?.doc(role_id)
}

pub fn applications_collection(collaboration_id: &str, role_id: &str) -> DomainResult<CollectionPath> {
    role_path(collaboration_id, role_id)?.child("applications")
}

/// Applications are keyed by applicant, one per role and applicant.
pub fn application_path(
    collaboration_id: &str,
    role_id: &str,
    applicant_id: &str,
) -> DomainResult<DocumentPath> {
    applications_collection(collaboration_id, role_id)?.doc(applicant_id)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CollaborationStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl CollaborationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    fn from_legacy(raw: &str) -> Self {
        match raw {
            "in-progress" | "in_progress" | "active" => Self::InProgress,
            "completed" => Self::Completed,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Open,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RoleStatus {
    Open,
    Filled,
    Completed,
    Abandoned,
}

impl RoleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Filled => "filled",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Changes of (`filledRoleCount`, `completedRoleCount`) when a role moves
/// from `from` to `to`.
pub fn counter_deltas(from: RoleStatus, to: RoleStatus) -> (i64, i64) {
    let count = |status: RoleStatus, target: RoleStatus| i64::from(status == target);
    (
        count(to, RoleStatus::Filled) - count(from, RoleStatus::Filled),
        count(to, RoleStatus::Completed) - count(from, RoleStatus::Completed),
    )
}

fn role_transition_allowed(from: RoleStatus, to: RoleStatus) -> bool {
    matches!(
        (from, to),
        (RoleStatus::Open, RoleStatus::Abandoned)
            | (RoleStatus::Filled, RoleStatus::Completed)
            | (RoleStatus::Filled, RoleStatus::Abandoned)
            | (RoleStatus::Abandoned, RoleStatus::Open)
    )
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleSkill {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Collaboration {
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
    pub status: CollaborationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_commitment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_type: Option<String>,
    #[serde(default)]
    pub skills_required: Vec<String>,
    #[serde(default)]
    pub skills_index: Vec<String>,
    #[serde(default)]
    pub collaborator_ids: Vec<String>,
    #[serde(default)]
    pub role_count: i64,
    #[serde(default)]
    pub filled_role_count: i64,
    #[serde(default)]
    pub completed_role_count: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schema_version: u32,
}

impl Collaboration {
    fn refresh_skills_index(&mut self) {
        self.skills_index = lowercase_index(self.skills_required.iter().map(String::as_str));
    }

    fn add_collaborator(&mut self, user_id: &str) -> bool {
        if self.collaborator_ids.iter().any(|id| id == user_id) {
            return false;
        }
        self.collaborator_ids.push(user_id.to_string());
        true
    }

    /// Sets the role counters from the roles themselves.
    pub fn recount_roles(&mut self, roles: &[CollaborationRole]) {
        let count = |status: RoleStatus| roles.iter().filter(|role| role.status == status).count() as i64;
        self.role_count = roles.len() as i64;
        self.filled_role_count = count(RoleStatus::Filled);
        self.completed_role_count = count(RoleStatus::Completed);
    }

    /// Drops `user_id` from the collaborators unless another role in
    /// `roles` is still filled or completed by them. The creator stays.
    fn release_participant(&mut self, user_id: &str, roles: &[CollaborationRole], released_role: &str) {
        if user_id == self.creator_id {
            return;
        }
        let still_holds_role = roles.iter().any(|role| {
            role.id != released_role
                && matches!(role.status, RoleStatus::Filled | RoleStatus::Completed)
                && role.participant_id.as_deref() == Some(user_id)
        });
        if !still_holds_role {
            self.collaborator_ids.retain(|id| id != user_id);
        }
    }

    fn apply_counter_deltas(&mut self, from: RoleStatus, to: RoleStatus) {
        let (filled, completed) = counter_deltas(from, to);
        self.filled_role_count += filled;
        self.completed_role_count += completed;
        if self.role_count > 0 && self.completed_role_count == self.role_count {
            self.status = CollaborationStatus::Completed;
        } else if self.status == CollaborationStatus::Open
            && self.role_count > 0
            && self.filled_role_count + self.completed_role_count == self.role_count
        {
            self.status = CollaborationStatus::InProgress;
        }
    }
}

/// Stored shape with `skillsNeeded`/`participants` and no role counters;
/// the counters are recounted from the roles once they are read.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollaborationV1 {
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
    status: String,
    #[serde(default)]
    time_commitment: Option<String>,
    #[serde(default)]
    location_type: Option<String>,
    #[serde(default)]
    skills_needed: Vec<String>,
    #[serde(default)]
    participants: Vec<String>,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    updated_at: Option<i64>,
}

impl CollaborationV1 {
    fn upgrade(self, id: &str) -> Collaboration {
        let mut collaboration = Collaboration {
            id: id.to_string(),
            title: self.title,
            description: self.description,
            category: self.category,
            creator_id: self.creator_id,
            creator_name: self.creator_name,
            status: CollaborationStatus::from_legacy(&self.status),
            time_commitment: self.time_commitment,
            location_type: self.location_type,
            skills_required: dedupe_and_trim(&self.skills_needed),
            skills_index: Vec::new(),
            collaborator_ids: dedupe_and_trim(&self.participants),
            role_count: 0,
            filled_role_count: 0,
            completed_role_count: 0,
            created_at_ms: self.created_at,
            updated_at_ms: self.updated_at.unwrap_or(self.created_at),
            schema_version: COLLABORATION_SCHEMA_VERSION,
        };
        collaboration.refresh_skills_index();
        collaboration
    }
}

fn is_legacy(document: &Document) -> bool {
    document
        .field("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(1)
        < 2
}

pub fn decode_collaboration(document: &Document) -> DomainResult<Collaboration> {
    let mut collaboration = if is_legacy(document) {
        document.decode::<CollaborationV1>()?.upgrade(document.id())
    } else {
        document.decode::<Collaboration>()?
    };
    collaboration.id = document.id().to_string();
    if collaboration.skills_index.is_empty() {
        collaboration.refresh_skills_index();
    }
    Ok(collaboration)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationRole {
    #[serde(default)]
    pub id: String,
    pub collaboration_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_skills: Vec<RoleSkill>,
    #[serde(default)]
    pub preferred_skills: Vec<RoleSkill>,
    pub status: RoleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

pub fn decode_role(document: &Document) -> DomainResult<CollaborationRole> {
    let mut role: CollaborationRole = document.decode()?;
    role.id = document.id().to_string();
    Ok(role)
}

fn decode_roles(documents: &[Document]) -> Vec<CollaborationRole> {
    documents
        .iter()
        .filter_map(|document| match decode_role(document) {
            Ok(role) => Some(role),
            Err(err) => {
                tracing::warn!(path = %document.path, error = %err, "skipping undecodable role");
                None
            }
        })
        .collect()
}

/// Decodes a collaboration together with its roles. Legacy documents get
/// their counters from `roles`.
pub fn decode_collaboration_with_roles(
    document: &Document,
    roles: &[CollaborationRole],
) -> DomainResult<Collaboration> {
    let mut collaboration = decode_collaboration(document)?;
    if is_legacy(document) {
        collaboration.recount_roles(roles);
    }
    Ok(collaboration)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationApplication {
    #[serde(default)]
    pub id: String,
    pub collaboration_id: String,
    pub role_id: String,
    pub applicant_id: String,
    #[serde(default)]
    pub applicant_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: ApplicationStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

pub fn decode_application(document: &Document) -> DomainResult<CollaborationApplication> {
    let mut application: CollaborationApplication = document.decode()?;
    application.id = document.id().to_string();
    Ok(application)
}

impl CollaborationFilters {
    /// Typed equivalent of the filters a [`CollaborationQueryBuilder`] plan
    /// evaluates.
    pub fn accepts(&self, collaboration: &Collaboration) -> bool {
        let wanted = lowercase_index(self.skills.iter().map(String::as_str));
        self.status.is_none_or(|status| collaboration.status == status)
            && self
                .category
                .as_deref()
                .is_none_or(|category| collaboration.category == category)
            && self
                .creator_id
                .as_deref()
                .is_none_or(|creator| collaboration.creator_id == creator)
            && self
                .created_after_ms
                .is_none_or(|after| collaboration.created_at_ms >= after)
            && (wanted.is_empty()
                || wanted
                    .iter()
                    .any(|skill| collaboration.skills_index.contains(skill)))
            && self
                .time_commitment
                .as_deref()
                .is_none_or(|value| collaboration.time_commitment.as_deref() == Some(value))
            && self
                .location_type
                .as_deref()
                .is_none_or(|value| collaboration.location_type.as_deref() == Some(value))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoleCreate {
    pub title: String,
    pub description: String,
    pub required_skills: Vec<RoleSkill>,
    pub preferred_skills: Vec<RoleSkill>,
}

impl RoleCreate {
    fn into_role(self, collaboration_id: &str, now: i64) -> DomainResult<CollaborationRole> {
        let title = self.title.trim();
        if title.is_empty() || title.chars().count() > MAX_TITLE_LEN {
            return Err(DomainError::Validation(format!(
                "role title must be 1..={MAX_TITLE_LEN} characters"
            )));
        }
        Ok(CollaborationRole {
            id: uuid_v7_without_dashes(),
            collaboration_id: collaboration_id.to_string(),
            title: title.to_string(),
            description: self.description.trim().to_string(),
            required_skills: self.required_skills,
            preferred_skills: self.preferred_skills,
            status: RoleStatus::Open,
            participant_id: None,
            filled_at_ms: None,
            completed_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollaborationCreate {
    pub title: String,
    pub description: String,
    pub category: String,
    pub creator_name: String,
    pub time_commitment: Option<String>,
    pub location_type: Option<String>,
    pub skills_required: Vec<String>,
    pub roles: Vec<RoleCreate>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollaborationUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub status: Option<CollaborationStatus>,
    pub time_commitment: Option<String>,
    pub location_type: Option<String>,
    pub skills_required: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationPage {
    pub page: FilteredPage<Collaboration>,
    /// True when part of the filters ran in memory.
    pub simplified: bool,
}

fn validate_title(title: &str) -> DomainResult<String> {
    let title = title.trim();
    if title.is_empty() || title.chars().count() > MAX_TITLE_LEN {
        return Err(DomainError::Validation(format!(
            "title must be 1..={MAX_TITLE_LEN} characters"
        )));
    }
    Ok(title.to_string())
}

fn validate_description(description: &str) -> DomainResult<String> {
    let description = description.trim();
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(DomainError::Validation(format!(
            "description exceeds {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok(description.to_string())
}

fn ensure_creator(collaboration: &Collaboration, actor_id: &str, action: &str) -> DomainResult<()> {
    if collaboration.creator_id == actor_id {
        Ok(())
    } else {
        Err(DomainError::PermissionDenied(format!(
            "only the collaboration creator can {action}"
        )))
    }
}

fn roles_query(collaboration_id: &str) -> DomainResult<Query> {
    Ok(Query::new(roles_collection(collaboration_id)?))
}

/// Reads of a transaction that rewrites the collaboration document: the
/// document itself, `extra` and every role of the collaboration.
fn collaboration_reads(
    collaboration_id: &str,
    extra: Vec<DocumentPath>,
) -> DomainResult<(DocumentPath, Query, TransactionReads)> {
    let path = collaboration_path(collaboration_id)?;
    let roles = roles_query(collaboration_id)?;
    let mut documents = vec![path.clone()];
    documents.extend(extra);
    let reads = TransactionReads::new(documents).query(roles.clone());
    Ok((path, roles, reads))
}

/// The collaboration with its roles as of the snapshot.
fn read_collaboration(
    snapshot: &TransactionSnapshot,
    path: &DocumentPath,
    roles: &Query,
) -> DomainResult<(Collaboration, Vec<CollaborationRole>)> {
    let roles = decode_roles(snapshot.query(roles)?);
    let collaboration = decode_collaboration_with_roles(snapshot.require(path, "collaboration")?, &roles)?;
    Ok((collaboration, roles))
}

fn read_role(snapshot: &TransactionSnapshot, path: &DocumentPath) -> DomainResult<CollaborationRole> {
    decode_role(snapshot.require(path, "role")?)
}

#[derive(Clone)]
pub struct CollaborationService {
    store: Arc<dyn DocumentStore>,
    notifications: NotificationService,
    telemetry: Telemetry,
    config: ServiceConfig,
}

impl CollaborationService {
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

    pub async fn create_collaboration(
        &self,
        actor_id: &str,
        input: CollaborationCreate,
    ) -> DomainResult<Collaboration> {
        let title = validate_title(&input.title)?;
        let description = validate_description(&input.description)?;
        if input.roles.len() > MAX_ROLES {
            return Err(DomainError::Validation(format!(
                "at most {MAX_ROLES} roles are allowed"
            )));
        }

        let now = now_ms();
        let id = uuid_v7_without_dashes();
        let roles = input
            .roles
            .into_iter()
            .map(|role| role.into_role(&id, now))
            .collect::<DomainResult<Vec<_>>>()?;
        let mut collaboration = Collaboration {
            id: id.clone(),
            title,
            description,
            category: input.category.trim().to_string(),
            creator_id: actor_id.to_string(),
            creator_name: input.creator_name.trim().to_string(),
            status: CollaborationStatus::Open,
            time_commitment: input.time_commitment,
            location_type: input.location_type,
            skills_required: dedupe_and_trim(&input.skills_required),
            skills_index: Vec::new(),
            collaborator_ids: vec![actor_id.to_string()],
            role_count: roles.len() as i64,
            filled_role_count: 0,
            completed_role_count: 0,
            created_at_ms: now,
            updated_at_ms: now,
            schema_version: COLLABORATION_SCHEMA_VERSION,
        };
        collaboration.refresh_skills_index();

        let mut batch = WriteBatch::new();
        batch.set(collaboration_path(&id)?, to_document_data(&collaboration)?);
        for role in &roles {
            batch.set(role_path(&id, &role.id)?, to_document_data(role)?);
        }
        self.store.commit(batch).await?;

        self.telemetry
            .track(
                TelemetryEvent::new("collaboration_created")
                    .actor(actor_id)
                    .entity(&id)
                    .property("roles", roles.len().to_string()),
            )
            .await;
        Ok(collaboration)
    }

    pub async fn get_collaboration(&self, id: &str) -> DomainResult<Collaboration> {
        let document = self
            .store
            .get(&collaboration_path(id)?)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("collaboration {id}")))?;
        if is_legacy(&document) {
            let roles = self.list_roles(id).await?;
            return decode_collaboration_with_roles(&document, &roles);
        }
        decode_collaboration(&document)
    }

    pub async fn list_roles(&self, collaboration_id: &str) -> DomainResult<Vec<CollaborationRole>> {
        let query = Query::new(roles_collection(collaboration_id)?)
            .order_by("createdAtMs", Direction::Ascending);
        Ok(decode_roles(&self.store.query(&query).await?))
    }

    pub async fn update_collaboration(
        &self,
        actor_id: &str,
        id: &str,
        update: CollaborationUpdate,
    ) -> DomainResult<Collaboration> {
        let title = update.title.as_deref().map(validate_title).transpose()?;
        let description = update
            .description
            .as_deref()
            .map(validate_description)
            .transpose()?;
        let (read_path, roles, reads) = collaboration_reads(id, Vec::new())?;
        let actor = actor_id.to_string();

        transaction(self.store.as_ref(), reads, move |snapshot| {
            let (mut collaboration, _) = read_collaboration(snapshot, &read_path, &roles)?;
            ensure_creator(&collaboration, &actor, "edit it")?;
            if collaboration.status.is_terminal() {
                return Err(DomainError::InvalidStatus(format!(
                    "collaboration is {}",
                    collaboration.status.as_str()
                )));
            }
            if let Some(title) = title {
                collaboration.title = title;
            }
            if let Some(description) = description {
                collaboration.description = description;
            }
            if let Some(category) = update.category {
                collaboration.category = category.trim().to_string();
            }
            if let Some(status) = update.status {
                collaboration.status = status;
            }
            if let Some(time_commitment) = update.time_commitment {
                collaboration.time_commitment = Some(time_commitment);
            }
            if let Some(location_type) = update.location_type {
                collaboration.location_type = Some(location_type);
            }
            if let Some(skills) = update.skills_required {
                collaboration.skills_required = dedupe_and_trim(&skills);
                collaboration.refresh_skills_index();
            }
            collaboration.schema_version = COLLABORATION_SCHEMA_VERSION;
            collaboration.updated_at_ms = now_ms();

            let mut batch = WriteBatch::new();
            batch.set(read_path.clone(), to_document_data(&collaboration)?);
            Ok((batch, collaboration))
        })
        .await
    }

    /// Deletes the collaboration with all roles and applications in one batch.
    pub async fn delete_collaboration(&self, actor_id: &str, id: &str) -> DomainResult<()> {
        let collaboration = self.get_collaboration(id).await?;
        ensure_creator(&collaboration, actor_id, "delete it")?;

        let mut batch = WriteBatch::new();
        for role in self.store.query(&roles_query(id)?).await? {
            let applications = Query::new(applications_collection(id, role.id())?);
            for application in self.store.query(&applications).await? {
                batch.delete(application.path);
            }
            batch.delete(role.path);
        }
        batch.delete(collaboration_path(id)?);
        let writes = batch.len();
        self.store.commit(batch).await?;
        tracing::info!(collaboration_id = %id, writes, "collaboration deleted");
        Ok(())
    }

    pub async fn list_collaborations(
        &self,
        filters: CollaborationFilters,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> DomainResult<CollaborationPage> {
        let limit = normalize_limit(limit, self.config.default_page_size, self.config.max_page_size);
        let plan = CollaborationQueryBuilder::new(filters).build();
        let request = PageRequest::new(limit)
            .after(cursor)
            .max_batches(self.config.search_max_batches);
        let page = fetch_filtered_page(
            self.store.as_ref(),
            &plan.query,
            &request,
            decode_collaboration,
            |document, _| plan.accepts_document(document),
        )
        .await?;
        Ok(CollaborationPage {
            page,
            simplified: plan.simplified,
        })
    }

    pub async fn add_role(
        &self,
        actor_id: &str,
        collaboration_id: &str,
        input: RoleCreate,
    ) -> DomainResult<CollaborationRole> {
        let role = input.into_role(collaboration_id, now_ms())?;
        let new_role_doc = role_path(collaboration_id, &role.id)?;
        let (collaboration_doc, roles, reads) = collaboration_reads(collaboration_id, Vec::new())?;
        let actor = actor_id.to_string();

        transaction(self.store.as_ref(), reads, move |snapshot| {
            let (mut collaboration, _) = read_collaboration(snapshot, &collaboration_doc, &roles)?;
            ensure_creator(&collaboration, &actor, "add roles")?;
            if collaboration.status.is_terminal() {
                return Err(DomainError::InvalidStatus(format!(
                    "collaboration is {}",
                    collaboration.status.as_str()
                )));
            }
            if collaboration.role_count >= MAX_ROLES as i64 {
                return Err(DomainError::Validation(format!(
                    "at most {MAX_ROLES} roles are allowed"
                )));
            }

            collaboration.role_count += 1;
            collaboration.schema_version = COLLABORATION_SCHEMA_VERSION;
            collaboration.updated_at_ms = role.created_at_ms;
            let mut batch = WriteBatch::new();
            batch.set(new_role_doc.clone(), to_document_data(&role)?);
            batch.set(collaboration_doc.clone(), to_document_data(&collaboration)?);
            Ok((batch, role))
        })
        .await
    }

    pub async fn delete_role(
        &self,
        actor_id: &str,
        collaboration_id: &str,
        role_id: &str,
    ) -> DomainResult<()> {
        let role_doc = role_path(collaboration_id, role_id)?;
        let applications = Query::new(applications_collection(collaboration_id, role_id)?);
        let (collaboration_doc, roles, reads) =
            collaboration_reads(collaboration_id, vec![role_doc.clone()])?;
        let reads = reads.query(applications.clone());
        let actor = actor_id.to_string();

        transaction(self.store.as_ref(), reads, move |snapshot| {
            let (mut collaboration, roles) = read_collaboration(snapshot, &collaboration_doc, &roles)?;
            let role = read_role(snapshot, &role_doc)?;
            ensure_creator(&collaboration, &actor, "delete roles")?;

            collaboration.role_count -= 1;
            collaboration.apply_counter_deltas(role.status, RoleStatus::Open);
            if let Some(participant) = role.participant_id.as_deref() {
                collaboration.release_participant(participant, &roles, &role.id);
            }
            collaboration.schema_version = COLLABORATION_SCHEMA_VERSION;
            collaboration.updated_at_ms = now_ms();

            let mut batch = WriteBatch::new();
            for application in snapshot.query(&applications)? {
                batch.delete(application.path.clone());
            }
            batch.delete(role_doc.clone());
            batch.set(collaboration_doc.clone(), to_document_data(&collaboration)?);
            Ok((batch, ()))
        })
        .await
    }

    /// Moves a role to `status`, keeping the collaboration counters in step.
    /// Filling a role goes through [`Self::accept_application`].
    pub async fn update_role_status(
        &self,
        actor_id: &str,
        collaboration_id: &str,
        role_id: &str,
        status: RoleStatus,
    ) -> DomainResult<CollaborationRole> {
        let role_doc = role_path(collaboration_id, role_id)?;
        let (collaboration_doc, roles, reads) =
            collaboration_reads(collaboration_id, vec![role_doc.clone()])?;
        let actor = actor_id.to_string();

        let (role, previous) = transaction(self.store.as_ref(), reads, move |snapshot| {
            let (mut collaboration, roles) = read_collaboration(snapshot, &collaboration_doc, &roles)?;
            let mut role = read_role(snapshot, &role_doc)?;
            ensure_creator(&collaboration, &actor, "change role status")?;
            let previous = role.status;
            if previous == status {
                return Ok((WriteBatch::new(), (role, previous)));
            }
            if !role_transition_allowed(previous, status) {
                return Err(DomainError::InvalidStatus(format!(
                    "role cannot move from {} to {}",
                    previous.as_str(),
                    status.as_str()
                )));
            }

            let now = now_ms();
            role.status = status;
            role.updated_at_ms = now;
            match status {
                RoleStatus::Completed => role.completed_at_ms = Some(now),
                RoleStatus::Abandoned => {
                    if let Some(participant) = role.participant_id.take() {
                        collaboration.release_participant(&participant, &roles, &role.id);
                    }
                    role.filled_at_ms = None;
                }
                RoleStatus::Open | RoleStatus::Filled => {}
            }
            collaboration.apply_counter_deltas(previous, status);
            collaboration.schema_version = COLLABORATION_SCHEMA_VERSION;
            collaboration.updated_at_ms = now;

            let mut batch = WriteBatch::new();
            batch.set(role_doc.clone(), to_document_data(&role)?);
            batch.set(collaboration_doc.clone(), to_document_data(&collaboration)?);
            Ok((batch, (role, previous)))
        })
        .await?;

        if status == RoleStatus::Completed && previous != status {
            if let Some(participant) = role.participant_id.as_deref() {
                self.notifications
                    .notify_best_effort(
                        NotificationCreate::new(
                            participant,
                            NotificationType::RoleCompleted,
                            format!("Your role \"{}\" was marked completed", role.title),
                        )
                        .related(collaboration_id),
                    )
                    .await;
            }
        }
        Ok(role)
    }

    pub async fn submit_application(
        &self,
        actor_id: &str,
        collaboration_id: &str,
        role_id: &str,
        applicant_name: &str,
        message: Option<String>,
    ) -> DomainResult<CollaborationApplication> {
        let message = message
            .map(|message| message.trim().to_string())
            .filter(|message| !message.is_empty());
        if message
            .as_ref()
            .is_some_and(|message| message.chars().count() > MAX_MESSAGE_LEN)
        {
            return Err(DomainError::Validation(format!(
                "application message exceeds {MAX_MESSAGE_LEN} characters"
            )));
        }
        let collaboration_doc = collaboration_path(collaboration_id)?;
        let role_doc = role_path(collaboration_id, role_id)?;
        let application_doc = application_path(collaboration_id, role_id, actor_id)?;
        let reads = vec![
            collaboration_doc.clone(),
            role_doc.clone(),
            application_doc.clone(),
        ];
        let actor = actor_id.to_string();
        let applicant_name = applicant_name.trim().to_string();
        let collaboration_key = collaboration_id.to_string();
        let role_key = role_id.to_string();

        let (application, creator_id) = transaction(self.store.as_ref(), reads, move |snapshot| {
            let collaboration = decode_collaboration(snapshot.require(&collaboration_doc, "collaboration")?)?;
            let role = read_role(snapshot, &role_doc)?;
            if collaboration.creator_id == actor {
                return Err(DomainError::Validation(
                    "creators cannot apply to their own collaboration".into(),
                ));
            }
            if collaboration.status.is_terminal() || role.status != RoleStatus::Open {
                return Err(DomainError::InvalidStatus(format!(
                    "role is {}",
                    role.status.as_str()
                )));
            }
            if let Some(existing) = snapshot.get(&application_doc)? {
                let existing = decode_application(existing)?;
                if existing.status != ApplicationStatus::Rejected {
                    return Err(DomainError::Conflict(
                        "an application for this role already exists".into(),
                    ));
                }
            }

            let now = now_ms();
            let application = CollaborationApplication {
                id: actor.clone(),
                collaboration_id: collaboration_key,
                role_id: role_key,
                applicant_id: actor,
                applicant_name,
                message,
                status: ApplicationStatus::Pending,
                created_at_ms: now,
                updated_at_ms: now,
            };
            let mut batch = WriteBatch::new();
            batch.set(application_doc.clone(), to_document_data(&application)?);
            Ok((batch, (application, collaboration.creator_id)))
        })
        .await?;

        self.notifications
            .notify_best_effort(
                NotificationCreate::new(
                    &creator_id,
                    NotificationType::CollaborationApplication,
                    format!("{} applied to one of your roles", application.applicant_name),
                )
                .related(collaboration_id),
            )
            .await;
        Ok(application)
    }

    /// Accepts an application in one transaction. Accepting an already
    /// accepted application leaves counters and collaborators unchanged.
    pub async fn accept_application(
        &self,
        actor_id: &str,
        collaboration_id: &str,
        role_id: &str,
        applicant_id: &str,
    ) -> DomainResult<CollaborationApplication> {
        let role_doc = role_path(collaboration_id, role_id)?;
        let application_doc = application_path(collaboration_id, role_id, applicant_id)?;
        let (collaboration_doc, roles, reads) = collaboration_reads(
            collaboration_id,
            vec![role_doc.clone(), application_doc.clone()],
        )?;
        let actor = actor_id.to_string();
        let applicant = applicant_id.to_string();

        let (application, newly_filled) = transaction(self.store.as_ref(), reads, move |snapshot| {
            let (mut collaboration, _) = read_collaboration(snapshot, &collaboration_doc, &roles)?;
            let mut role = read_role(snapshot, &role_doc)?;
            let mut application = decode_application(snapshot.require(&application_doc, "application")?)?;
            ensure_creator(&collaboration, &actor, "accept applications")?;

            let already_filled = role.status == RoleStatus::Filled
                && role.participant_id.as_deref() == Some(applicant.as_str());
            if !already_filled {
                if collaboration.status.is_terminal() {
                    return Err(DomainError::InvalidStatus(format!(
                        "collaboration is {}",
                        collaboration.status.as_str()
                    )));
                }
                if application.status == ApplicationStatus::Rejected {
                    return Err(DomainError::InvalidStatus(
                        "application was already rejected".into(),
                    ));
                }
                if role.status != RoleStatus::Open {
                    return Err(DomainError::InvalidStatus(format!(
                        "role is {}",
                        role.status.as_str()
                    )));
                }
            }

            let now = now_ms();
            let mut batch = WriteBatch::new();
            application.status = ApplicationStatus::Accepted;
            application.updated_at_ms = now;
            batch.set(application_doc.clone(), to_document_data(&application)?);

            let joined = collaboration.add_collaborator(&applicant);
            if !already_filled {
                let previous = role.status;
                role.status = RoleStatus::Filled;
                role.participant_id = Some(applicant.clone());
                role.filled_at_ms = Some(now);
                role.updated_at_ms = now;
                batch.set(role_doc.clone(), to_document_data(&role)?);
                collaboration.apply_counter_deltas(previous, RoleStatus::Filled);
            }
            if joined || !already_filled {
                collaboration.schema_version = COLLABORATION_SCHEMA_VERSION;
                collaboration.updated_at_ms = now;
                batch.set(collaboration_doc.clone(), to_document_data(&collaboration)?);
            }
            if joined {
                batch.upsert(
                    social_stats_path(&applicant)?,
                    social_stats_delta(SocialCounter::Collaborations, 1),
                );
            }
            Ok((batch, (application, !already_filled)))
        })
        .await?;

        if newly_filled {
            self.notifications
                .notify_best_effort(
                    NotificationCreate::new(
                        applicant_id,
                        NotificationType::ApplicationAccepted,
                        "Your application was accepted",
                    )
                    .related(collaboration_id),
                )
                .await;
            self.telemetry
                .track(
                    TelemetryEvent::new("application_accepted")
                        .actor(actor_id)
                        .entity(collaboration_id)
                        .property("role_id", role_id),
                )
                .await;
        }
        Ok(application)
    }

    pub async fn reject_application(
        &self,
        actor_id: &str,
        collaboration_id: &str,
        role_id: &str,
        applicant_id: &str,
    ) -> DomainResult<CollaborationApplication> {
        let collaboration_doc = collaboration_path(collaboration_id)?;
        let application_doc = application_path(collaboration_id, role_id, applicant_id)?;
        let reads = vec![collaboration_doc.clone(), application_doc.clone()];
        let actor = actor_id.to_string();

        let application = transaction(self.store.as_ref(), reads, move |snapshot| {
            let collaboration = decode_collaboration(snapshot.require(&collaboration_doc, "collaboration")?)?;
            let mut application = decode_application(snapshot.require(&application_doc, "application")?)?;
            ensure_creator(&collaboration, &actor, "reject applications")?;
            if application.status != ApplicationStatus::Pending {
                return Err(DomainError::InvalidStatus(
                    "only pending applications can be rejected".into(),
                ));
            }
            application.status = ApplicationStatus::Rejected;
            application.updated_at_ms = now_ms();
            let mut batch = WriteBatch::new();
            batch.set(application_doc.clone(), to_document_data(&application)?);
            Ok((batch, application))
        })
        .await?;

        self.notifications
            .notify_best_effort(
                NotificationCreate::new(
                    applicant_id,
                    NotificationType::ApplicationRejected,
                    "Your application was not accepted",
                )
                .related(collaboration_id),
            )
            .await;
        Ok(application)
    }

    pub async fn list_applications(
        &self,
        actor_id: &str,
        collaboration_id: &str,
        role_id: &str,
    ) -> DomainResult<Vec<CollaborationApplication>> {
        let collaboration = self.get_collaboration(collaboration_id).await?;
        ensure_creator(&collaboration, actor_id, "list applications")?;
        let query = Query::new(applications_collection(collaboration_id, role_id)?)
            .order_by("createdAtMs", Direction::Ascending);
        self.store
            .query(&query)
            .await?
            .iter()
            .map(decode_application)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deltas_follow_status_changes() {
        assert_eq!(counter_deltas(RoleStatus::Open, RoleStatus::Filled), (1, 0));
        assert_eq!(counter_deltas(RoleStatus::Filled, RoleStatus::Completed), (-1, 1));
        assert_eq!(counter_deltas(RoleStatus::Filled, RoleStatus::Abandoned), (-1, 0));
        assert_eq!(counter_deltas(RoleStatus::Completed, RoleStatus::Open), (0, -1));
        assert_eq!(counter_deltas(RoleStatus::Open, RoleStatus::Open), (0, 0));
    }

    #[test]
    fn filling_is_not_a_direct_transition() {
        assert!(!role_transition_allowed(RoleStatus::Open, RoleStatus::Filled));
        assert!(!role_transition_allowed(RoleStatus::Completed, RoleStatus::Open));
        assert!(role_transition_allowed(RoleStatus::Filled, RoleStatus::Completed));
    }

    #[test]
    fn legacy_collaborations_are_upgraded() {
        let legacy = json!({
            "title": "Community garden",
            "creatorId": "u1",
            "status": "active",
            "skillsNeeded": ["Gardening", "gardening", "Design"],
            "participants": ["u1", "u2"],
            "createdAt": 10
        });
        let document = Document::new(
            collaboration_path("c1").expect("path"),
            legacy.as_object().cloned().expect("object"),
        );
        let collaboration = decode_collaboration(&document).expect("decode");
        assert_eq!(collaboration.id, "c1");
        assert_eq!(collaboration.status, CollaborationStatus::InProgress);
        assert_eq!(collaboration.skills_index, vec!["gardening".to_string(), "design".to_string()]);
        assert_eq!(collaboration.collaborator_ids, vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(collaboration.schema_version, COLLABORATION_SCHEMA_VERSION);
    }

    fn role(id: &str, status: RoleStatus, participant: Option<&str>) -> CollaborationRole {
        CollaborationRole {
            id: id.into(),
            collaboration_id: "c1".into(),
            title: id.into(),
            description: String::new(),
            required_skills: Vec::new(),
            preferred_skills: Vec::new(),
            status,
            participant_id: participant.map(str::to_string),
            filled_at_ms: None,
            completed_at_ms: None,
            created_at_ms: 1,
            updated_at_ms: 1,
        }
    }

    #[test]
    fn legacy_counters_come_from_roles() {
        let legacy = json!({ "title": "Garden", "creatorId": "u1", "createdAt": 10 });
        let document = Document::new(
            collaboration_path("c1").expect("path"),
            legacy.as_object().cloned().expect("object"),
        );
        let roles = vec![
            role("r1", RoleStatus::Filled, Some("u2")),
            role("r2", RoleStatus::Completed, Some("u3")),
            role("r3", RoleStatus::Open, None),
        ];
        let collaboration = decode_collaboration_with_roles(&document, &roles).expect("decode");
        assert_eq!(collaboration.role_count, 3);
        assert_eq!(collaboration.filled_role_count, 1);
        assert_eq!(collaboration.completed_role_count, 1);
    }

    #[test]
    fn participant_with_another_role_stays_a_collaborator() {
        let legacy = json!({ "title": "Garden", "creatorId": "u1", "participants": ["u1", "u2"] });
        let document = Document::new(
            collaboration_path("c1").expect("path"),
            legacy.as_object().cloned().expect("object"),
        );
        let mut collaboration = decode_collaboration(&document).expect("decode");
        let roles = vec![
            role("r1", RoleStatus::Filled, Some("u2")),
            role("r2", RoleStatus::Filled, Some("u2")),
        ];
        collaboration.release_participant("u2", &roles, "r1");
        assert_eq!(collaboration.collaborator_ids, vec!["u1".to_string(), "u2".to_string()]);
        collaboration.release_participant("u2", &roles[..1], "r1");
        assert_eq!(collaboration.collaborator_ids, vec!["u1".to_string()]);
        collaboration.release_participant("u1", &[], "r1");
        assert_eq!(collaboration.collaborator_ids, vec!["u1".to_string()]);
    }

    #[test]
    fn paths_nest_roles_and_applications() {
        let path = application_path("c1", "r1", "u9").expect("path");
        assert_eq!(path.as_str(), "collaborations/c1/roles/r1/applications/u9");
    }
}
