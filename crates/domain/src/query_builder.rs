//! Server/client split of typed filters.
//!
//! The backend lacks composite indexes for some field pairs. When a plan
//! would combine such a pair, only the highest-priority constraint is sent
//! to the server and the remaining ones become a residual evaluated in
//! memory with the same [`Filter::matches`] predicate. Server filters and
//! residual together always accept exactly the documents that all supplied
//! filters accept.

use serde_json::Value;

use crate::collaborations::CollaborationStatus;
use crate::ports::documents::{
    CollectionPath, Cursor, Direction, Document, DocumentData, Filter, MAX_DISJUNCTION_VALUES, Query,
    matches_all,
};

/// Field pairs of `collaborations` without a composite index.
pub const COLLABORATION_INDEX_GAPS: &[(&str, &str)] = &[
    ("status", "category"),
    ("status", "timeCommitment"),
    ("category", "timeCommitment"),
];

/// Lower sorts first and wins the single server slot on simplification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterPriority {
    ExactMatch,
    Range,
    ArrayContainment,
    StringEquality,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    pub query: Query,
    pub residual: Vec<Filter>,
    pub simplified: bool,
}

impl QueryPlan {
    pub fn accepts(&self, data: &DocumentData) -> bool {
        matches_all(&self.residual, data)
    }

    pub fn accepts_document(&self, document: &Document) -> bool {
        self.accepts(&document.data)
    }

    /// Every constraint of the plan, wherever it is evaluated.
    pub fn all_filters(&self) -> Vec<Filter> {
        self.query
            .filters
            .iter()
            .chain(self.residual.iter())
            .cloned()
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct QueryBuilder {
    collection: CollectionPath,
    index_gaps: &'static [(&'static str, &'static str)],
    constraints: Vec<(FilterPriority, Filter)>,
    residual: Vec<Filter>,
    order_by: Option<(String, Direction)>,
    limit: Option<usize>,
    start_after: Option<Cursor>,
}

impl QueryBuilder {
    pub fn new(collection: CollectionPath, index_gaps: &'static [(&'static str, &'static str)]) -> Self {
        Self {
            collection,
            index_gaps,
            constraints: Vec::new(),
            residual: Vec::new(),
            order_by: None,
            limit: None,
            start_after: None,
        }
    }

    pub fn exact(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.constraints
            .push((FilterPriority::ExactMatch, Filter::eq(field, value)));
        self
    }

    pub fn range(mut self, filter: Filter) -> Self {
        self.constraints.push((FilterPriority::Range, filter));
        self
    }

    /// Matches documents whose array `field` holds any of `values`. Lists
    /// beyond the backend disjunction cap are always filtered in memory.
    pub fn contains_any(mut self, field: &str, values: Vec<Value>) -> Self {
        if values.is_empty() {
            return self;
        }
        let filter = match <[Value; 1]>::try_from(values) {
            Ok([value]) => Filter::array_contains(field, value),
            Err(values) => Filter::array_contains_any(field, values),
        };
        let oversized = filter
            .value
            .as_array()
            .is_some_and(|values| values.len() > MAX_DISJUNCTION_VALUES);
        if oversized {
            self.residual.push(filter);
        } else {
            self.constraints
                .push((FilterPriority::ArrayContainment, filter));
        }
        self
    }

    pub fn string_eq(mut self, field: &str, value: impl Into<String>) -> Self {
        self.constraints.push((
            FilterPriority::StringEquality,
            Filter::eq(field, value.into()),
        ));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }

    /// True when the constraints combine a field pair without an index.
    pub fn hits_index_gap(&self) -> bool {
        let has = |field: &str| self.constraints.iter().any(|(_, f)| f.field == field);
        self.index_gaps
            .iter()
            .any(|(first, second)| has(first) && has(second))
    }

    pub fn build(self) -> QueryPlan {
        let simplified = self.hits_index_gap();
        let mut constraints = self.constraints;
        constraints.sort_by_key(|(priority, _)| *priority);

        let mut residual = self.residual;
        let mut server = Vec::with_capacity(constraints.len());
        for (position, (_, filter)) in constraints.into_iter().enumerate() {
            if simplified && position > 0 {
                residual.push(filter);
            } else {
                server.push(filter);
            }
        }

        let mut query = Query::new(self.collection).start_after(self.start_after);
        query.filters = server;
        if let Some((field, direction)) = self.order_by {
            query = query.order_by(field, direction);
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }

        if simplified {
            tracing::debug!(
                collection = %query.collection,
                server_filters = query.filters.len(),
                residual_filters = residual.len(),
                "query simplified around missing composite index"
            );
        }

        QueryPlan {
            query,
            residual,
            simplified,
        }
    }
}

/// Typed collaboration listing filters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollaborationFilters {
    pub status: Option<CollaborationStatus>,
    pub category: Option<String>,
    pub creator_id: Option<String>,
    pub created_after_ms: Option<i64>,
    pub skills: Vec<String>,
    pub time_commitment: Option<String>,
    pub location_type: Option<String>,
}

pub struct CollaborationQueryBuilder {
    filters: CollaborationFilters,
    limit: Option<usize>,
    start_after: Option<Cursor>,
}

impl CollaborationQueryBuilder {
    pub fn new(filters: CollaborationFilters) -> Self {
        Self {
            filters,
            limit: None,
            start_after: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }

    pub fn build(self) -> QueryPlan {
        let filters = self.filters;
        let mut builder = QueryBuilder::new(
            crate::collaborations::collaborations_collection(),
            COLLABORATION_INDEX_GAPS,
        )
        .order_by("createdAtMs", Direction::Descending)
        .start_after(self.start_after);

        if let Some(status) = filters.status {
            builder = builder.exact("status", status.as_str());
        }
        if let Some(category) = filters.category {
            builder = builder.exact("category", category);
        }
        if let Some(creator_id) = filters.creator_id {
            builder = builder.exact("creatorId", creator_id);
        }
        if let Some(after) = filters.created_after_ms {
            builder = builder.range(Filter::ge("createdAtMs", after));
        }
        let skills: Vec<Value> = crate::util::lowercase_index(filters.skills.iter().map(String::as_str))
            .into_iter()
            .map(Value::from)
            .collect();
        builder = builder.contains_any("skillsIndex", skills);
        if let Some(time_commitment) = filters.time_commitment {
            builder = builder.string_eq("timeCommitment", time_commitment);
        }
        if let Some(location_type) = filters.location_type {
            builder = builder.string_eq("locationType", location_type);
        }
        if let Some(limit) = self.limit {
            builder = builder.limit(limit);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection() -> CollectionPath {
        CollectionPath::new("collaborations").expect("collection")
    }

    #[test]
    fn status_and_category_keep_only_status_on_server() {
        let plan = CollaborationQueryBuilder::new(CollaborationFilters {
            status: Some(CollaborationStatus::Open),
            category: Some("tech".into()),
            ..CollaborationFilters::default()
        })
        .build();

        assert!(plan.simplified);
        assert_eq!(plan.query.filters, vec![Filter::eq("status", "open")]);
        assert_eq!(plan.residual, vec![Filter::eq("category", "tech")]);
    }

    #[test]
    fn compatible_filters_stay_on_server() {
        let plan = CollaborationQueryBuilder::new(CollaborationFilters {
            status: Some(CollaborationStatus::Open),
            creator_id: Some("u1".into()),
            ..CollaborationFilters::default()
        })
        .build();

        assert!(!plan.simplified);
        assert_eq!(plan.query.filters.len(), 2);
        assert!(plan.residual.is_empty());
    }

    #[test]
    fn priority_decides_the_server_filter() {
        let plan = QueryBuilder::new(collection(), COLLABORATION_INDEX_GAPS)
            .string_eq("timeCommitment", "weekly")
            .contains_any("skillsIndex", vec![json!("rust"), json!("go")])
            .range(Filter::ge("createdAtMs", 10))
            .exact("category", "tech")
            .build();

        assert!(plan.simplified);
        assert_eq!(plan.query.filters, vec![Filter::eq("category", "tech")]);
        assert_eq!(plan.residual.len(), 3);
    }

    #[test]
    fn oversized_skill_lists_move_to_residual() {
        let skills = (0..11).map(|i| json!(format!("skill{i}"))).collect();
        let plan = QueryBuilder::new(collection(), &[])
            .contains_any("skillsIndex", skills)
            .build();

        assert!(plan.query.filters.is_empty());
        assert_eq!(plan.residual.len(), 1);
        assert!(plan.query.validate().is_ok());
    }

    #[test]
    fn single_skill_uses_array_contains() {
        let plan = QueryBuilder::new(collection(), &[])
            .contains_any("skillsIndex", vec![json!("rust")])
            .build();
        assert_eq!(
            plan.query.filters,
            vec![Filter::array_contains("skillsIndex", "rust")]
        );
    }

    #[test]
    fn residual_and_server_cover_all_filters() {
        let plan = CollaborationQueryBuilder::new(CollaborationFilters {
            status: Some(CollaborationStatus::Open),
            category: Some("tech".into()),
            time_commitment: Some("weekly".into()),
            skills: vec!["Rust".into()],
            ..CollaborationFilters::default()
        })
        .build();
        assert_eq!(plan.all_filters().len(), 4);
        let doc = json!({
            "status": "open",
            "category": "tech",
            "timeCommitment": "weekly",
            "skillsIndex": ["rust"]
        });
        let data = doc.as_object().cloned().expect("object");
        assert!(matches_all(&plan.query.filters, &data));
        assert!(plan.accepts(&data));
    }
}
