use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use crate::core::query::{Bound, FieldFilter, Filter, OrderBy, Query};
use crate::model::{DocumentKey, ResourcePath};

/// The part of a query the backend evaluates. Several queries (for example
/// limit-to-first and limit-to-last variants) can share one target.
#[derive(Clone, Debug)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
    canonical_id: String,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        let mut target = Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
            canonical_id: String::new(),
        };
        target.canonical_id = target.compute_canonical_id();
        target
    }

    /// Target for exactly one document, as used by limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Query::document(key).to_target()
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn field_filters(&self) -> Vec<&FieldFilter> {
        self.filters.iter().flat_map(Filter::flattened).collect()
    }

    pub fn canonical_id(&self) -> &str {
        &self.canonical_id
    }

    fn compute_canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        let filters: Vec<String> = self.filters.iter().map(Filter::canonical_id).collect();
        id.push_str("|f:");
        id.push_str(&filters.join(""));
        let order_by: Vec<String> = self.order_by.iter().map(OrderBy::canonical_id).collect();
        id.push_str("|ob:");
        id.push_str(&order_by.join(""));
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&start.canonical_id());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&end.canonical_id());
        }
        id
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id == other.canonical_id
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_id.hash(state);
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target({})", self.canonical_id)
    }
}
