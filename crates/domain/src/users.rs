use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::config::ServiceConfig;
use crate::error::DomainError;
use crate::pagination::{FilteredPage, PageRequest, fetch_filtered_page, normalize_limit};
use crate::ports::documents::{
    CollectionPath, Direction, Document, DocumentData, DocumentPath, DocumentStore, Filter, Query,
    Updates, WriteBatch, merge_data, to_document_data,
};
use crate::util::{dedupe_and_trim, lowercase_index, now_ms};

const MAX_DISPLAY_NAME_LEN: usize = 100;
const MAX_BIO_LEN: usize = 1000;
const MAX_SKILLS: usize = 30;

pub fn users_collection() -> CollectionPath {
    CollectionPath::named("users")
}

pub fn social_stats_path(user_id: &str) -> DomainResult<DocumentPath> {
    CollectionPath::named("socialStats").doc(user_id)
}

/// Increments of one user's social counters, applied with an upsert.
pub fn social_stats_delta(field: SocialCounter, delta: i64) -> Updates {
    Updates::new()
        .increment(field.as_str(), delta)
        .server_timestamp("updatedAtMs")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocialCounter {
    Connections,
    Followers,
    Trades,
    Collaborations,
}

impl SocialCounter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connections => "connectionCount",
            Self::Followers => "followerCount",
            Self::Trades => "tradeCount",
            Self::Collaborations => "collaborationCount",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SocialStats {
    pub connection_count: i64,
    pub follower_count: i64,
    pub trade_count: i64,
    pub collaboration_count: i64,
    pub updated_at_ms: i64,
}

/// Profiles without a stored `public` flag are private; the listing query
/// filters on `public == true` and would never return them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub skills_index: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
}

pub fn decode_user(document: &Document) -> DomainResult<UserProfile> {
    let mut profile: UserProfile = document.decode()?;
    profile.id = document.id().to_string();
    if profile.skills_index.is_empty() {
        profile.skills_index = lowercase_index(profile.skills.iter().map(String::as_str));
    }
    Ok(profile)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub photo_url: Option<String>,
    pub bio: Option<String>,
    pub skills: Option<Vec<String>>,
    pub location: Option<String>,
    pub public: Option<bool>,
}

impl ProfileUpdate {
    fn validate(&self) -> DomainResult<()> {
        if let Some(name) = &self.display_name {
            let len = name.trim().chars().count();
            if len == 0 || len > MAX_DISPLAY_NAME_LEN {
                return Err(DomainError::Validation(format!(
                    "display name must be 1..={MAX_DISPLAY_NAME_LEN} characters"
                )));
            }
        }
        if self.bio.as_ref().is_some_and(|bio| bio.chars().count() > MAX_BIO_LEN) {
            return Err(DomainError::Validation(format!(
                "bio exceeds {MAX_BIO_LEN} characters"
            )));
        }
        if self.skills.as_ref().is_some_and(|skills| skills.len() > MAX_SKILLS) {
            return Err(DomainError::Validation(format!(
                "at most {MAX_SKILLS} skills are allowed"
            )));
        }
        Ok(())
    }

    fn into_patch(self, now: i64) -> DomainResult<DocumentData> {
        let mut patch = DocumentData::new();
        if let Some(name) = self.display_name {
            patch.insert("displayName".into(), name.trim().into());
        }
        if let Some(email) = self.email {
            patch.insert("email".into(), email.trim().into());
        }
        if let Some(photo_url) = self.photo_url {
            patch.insert("photoUrl".into(), photo_url.into());
        }
        if let Some(bio) = self.bio {
            patch.insert("bio".into(), bio.trim().into());
        }
        if let Some(skills) = self.skills {
            let skills = dedupe_and_trim(&skills);
            let index = lowercase_index(skills.iter().map(String::as_str));
            patch.insert("skills".into(), serde_json::to_value(skills)?);
            patch.insert("skillsIndex".into(), serde_json::to_value(index)?);
        }
        if let Some(location) = self.location {
            patch.insert("location".into(), location.trim().into());
        }
        if let Some(public) = self.public {
            patch.insert("public".into(), public.into());
        }
        patch.insert("updatedAtMs".into(), now.into());
        Ok(patch)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserFilters {
    pub skills: Vec<String>,
    pub location: Option<String>,
    pub search_term: Option<String>,
}

impl UserFilters {
    fn accepts(&self, profile: &UserProfile) -> bool {
        let wanted = lowercase_index(self.skills.iter().map(String::as_str));
        if !wanted.is_empty()
            && !wanted
                .iter()
                .any(|skill| profile.skills_index.contains(skill))
        {
            return false;
        }
        if let Some(location) = self.location.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            let needle = location.to_lowercase();
            if !profile
                .location
                .as_deref()
                .is_some_and(|value| value.to_lowercase().contains(&needle))
            {
                return false;
            }
        }
        if let Some(term) = self.search_term.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let needle = term.to_lowercase();
            let in_name = profile.display_name.to_lowercase().contains(&needle);
            let in_bio = profile
                .bio
                .as_deref()
                .is_some_and(|bio| bio.to_lowercase().contains(&needle));
            let in_skills = profile.skills_index.iter().any(|skill| skill.contains(&needle));
            if !(in_name || in_bio || in_skills) {
                return false;
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn DocumentStore>,
    config: ServiceConfig,
}

impl UserService {
    pub fn new(store: Arc<dyn DocumentStore>, config: ServiceConfig) -> Self {
        Self { store, config }
    }

    pub async fn get_user_profile(
        &self,
        viewer_id: Option<&str>,
        user_id: &str,
    ) -> DomainResult<UserProfile> {
        let document = self
            .store
            .get(&users_collection().doc(user_id)?)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("user {user_id}")))?;
        let profile = decode_user(&document)?;
        if !profile.public && viewer_id != Some(user_id) {
            return Err(DomainError::PermissionDenied(format!(
                "profile of {user_id} is private"
            )));
        }
        Ok(profile)
    }

    /// Public profiles ordered by display name; skill, location and free
    /// text filters are applied in memory.
    pub async fn get_all_users(
        &self,
        filters: UserFilters,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> DomainResult<FilteredPage<UserProfile>> {
        let limit = normalize_limit(limit, self.config.default_page_size, self.config.max_page_size);
        let query = Query::new(users_collection())
            .filter(Filter::eq("public", true))
            .order_by("displayName", Direction::Ascending);
        let request = PageRequest::new(limit)
            .after(cursor)
            .max_batches(self.config.search_max_batches);
        fetch_filtered_page(self.store.as_ref(), &query, &request, decode_user, |_, profile| {
            profile.public && filters.accepts(profile)
        })
        .await
    }

    /// Merges `update` into the caller's own profile, creating it on first
    /// save (a display name is then required).
    pub async fn save_user_profile(
        &self,
        actor_id: &str,
        user_id: &str,
        update: ProfileUpdate,
    ) -> DomainResult<UserProfile> {
        if actor_id != user_id {
            return Err(DomainError::PermissionDenied(
                "profiles can only be edited by their owner".into(),
            ));
        }
        update.validate()?;
        let path = users_collection().doc(user_id)?;
        let existing = self.store.get(&path).await?;
        let now = now_ms();

        match existing {
            Some(_) => {
                let patch = update.into_patch(now)?;
                let mut batch = WriteBatch::new();
                batch.merge(path.clone(), patch);
                self.store.commit(batch).await?;
            }
            None => {
                if update.display_name.is_none() {
                    return Err(DomainError::Validation(
                        "display name is required for a new profile".into(),
                    ));
                }
                let profile = UserProfile {
                    id: user_id.to_string(),
                    display_name: String::new(),
                    email: None,
                    photo_url: None,
                    bio: None,
                    skills: Vec::new(),
                    skills_index: Vec::new(),
                    location: None,
                    public: false,
                    created_at_ms: now,
                    updated_at_ms: now,
                };
                let mut data = to_document_data(&profile)?;
                merge_data(&mut data, &update.into_patch(now)?);
                self.store.set(&path, data).await?;
            }
        }

        let document = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("user {user_id}")))?;
        decode_user(&document)
    }

    pub async fn get_social_stats(&self, user_id: &str) -> DomainResult<SocialStats> {
        match self.store.get(&social_stats_path(user_id)?).await? {
            Some(document) => document.decode(),
            None => Ok(SocialStats::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryDocumentStore;

    fn service() -> UserService {
        UserService::new(Arc::new(InMemoryDocumentStore::new()), ServiceConfig::default())
    }

    fn profile(name: &str, public: bool, skills: &[&str]) -> ProfileUpdate {
        ProfileUpdate {
            display_name: Some(name.into()),
            skills: Some(skills.iter().map(|skill| skill.to_string()).collect()),
            public: Some(public),
            location: Some("Lisbon, PT".into()),
            ..ProfileUpdate::default()
        }
    }

    #[tokio::test]
    async fn private_profiles_are_visible_to_owner_only() {
        let users = service();
        users
            .save_user_profile("u1", "u1", profile("Ana", false, &["Rust"]))
            .await
            .expect("save");

        let own = users.get_user_profile(Some("u1"), "u1").await.expect("own");
        assert_eq!(own.display_name, "Ana");
        let err = users
            .get_user_profile(Some("u2"), "u1")
            .await
            .expect_err("private");
        assert_eq!(err.code(), "permission-denied");
        let err = users.get_user_profile(None, "missing").await.expect_err("missing");
        assert_eq!(err.code(), "not-found");
    }

    #[tokio::test]
    async fn listing_returns_only_public_matches() {
        let users = service();
        users
            .save_user_profile("u1", "u1", profile("Ana", true, &["Rust", "Design"]))
            .await
            .expect("u1");
        users
            .save_user_profile("u2", "u2", profile("Bo", false, &["Rust"]))
            .await
            .expect("u2");
        users
            .save_user_profile("u3", "u3", profile("Cy", true, &["Cooking"]))
            .await
            .expect("u3");

        let page = users
            .get_all_users(
                UserFilters {
                    skills: vec!["rust".into()],
                    location: Some("lisbon".into()),
                    ..UserFilters::default()
                },
                None,
                None,
            )
            .await
            .expect("list");
        let ids: Vec<&str> = page.items.iter().map(|user| user.id.as_str()).collect();
        assert_eq!(ids, vec!["u1"]);
    }

    #[tokio::test]
    async fn save_merges_and_rejects_other_editors() {
        let users = service();
        users
            .save_user_profile("u1", "u1", profile("Ana", true, &["Rust"]))
            .await
            .expect("create");
        let updated = users
            .save_user_profile(
                "u1",
                "u1",
                ProfileUpdate {
                    bio: Some("hello".into()),
                    ..ProfileUpdate::default()
                },
            )
            .await
            .expect("merge");
        assert_eq!(updated.display_name, "Ana");
        assert_eq!(updated.bio.as_deref(), Some("hello"));
        assert_eq!(updated.skills_index, vec!["rust".to_string()]);

        let err = users
            .save_user_profile("u2", "u1", ProfileUpdate::default())
            .await
            .expect_err("denied");
        assert_eq!(err.code(), "permission-denied");
    }

    #[tokio::test]
    async fn missing_stats_read_as_zero_and_upserts_accumulate() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let users = UserService::new(store.clone(), ServiceConfig::default());
        assert_eq!(users.get_social_stats("u1").await.expect("stats"), SocialStats::default());

        let mut batch = WriteBatch::new();
        batch.upsert(
            social_stats_path("u1").expect("path"),
            social_stats_delta(SocialCounter::Trades, 1),
        );
        batch.upsert(
            social_stats_path("u1").expect("path"),
            social_stats_delta(SocialCounter::Trades, 1),
        );
        store.commit(batch).await.expect("commit");
        assert_eq!(users.get_social_stats("u1").await.expect("stats").trade_count, 2);
    }
}
