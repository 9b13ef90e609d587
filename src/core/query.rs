use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::core::{Bound, Direction, Filter, OrderBy, Target};
use crate::model::{Document, FieldPath, ResourcePath};
use crate::util::assert::hard_assert;

/// Whether the limit keeps the first or the last matching documents. Limits
/// from the end are a client-side feature: the target sent to the backend is
/// the flipped query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    First,
    Last,
}

/// A query as the user issued it: a path plus optional collection group,
/// filters, explicit orderings, limit, and cursors.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub explicit_order_by: Vec<OrderBy>,
    pub filters: Vec<Filter>,
    pub limit: Option<i32>,
    pub limit_type: LimitType,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Query {
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(group: impl Into<String>) -> Self {
        Self {
            collection_group: Some(group.into()),
            ..Self::at_path(ResourcePath::root())
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Rewrites a collection group query into a plain collection query at a
    /// concrete parent path.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path()
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// A query matches all documents of its collection when it carries no
    /// constraint that could exclude or reorder anything. The query engine
    /// uses this to skip index lookups entirely.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].is_key_ordering()))
    }

    fn inequality_filter_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(|f| f.field_filters())
            .filter(|f| f.is_inequality())
            .filter_map(|f| f.field().cloned())
            .collect()
    }

    /// The full sort order: explicit orderings, then inequality fields not
    /// yet mentioned (in lexicographical order), then the key. Implicit
    /// clauses inherit the direction of the last explicit one.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = Vec::new();
        let mut covered: BTreeSet<FieldPath> = BTreeSet::new();
        for clause in &self.explicit_order_by {
            order_by.push(clause.clone());
            covered.insert(clause.field.clone());
        }
        let last_direction = self
            .explicit_order_by
            .last()
            .map(|clause| clause.dir)
            .unwrap_or(Direction::Ascending);
        for field in self.inequality_filter_fields() {
            if !covered.contains(&field) && !field.is_document_id() {
                covered.insert(field.clone());
                order_by.push(OrderBy::new(field, last_direction));
            }
        }
        if !covered.contains(&FieldPath::document_id()) {
            order_by.push(OrderBy::key_ordering(last_direction));
        }
        order_by
    }

    pub fn matches(&self, doc: &Document) -> bool {
        doc.is_found_document()
            && self.matches_path_and_collection_group(doc)
            && self.matches_order_by(doc)
            && self.matches_filters(doc)
            && self.matches_bounds(doc)
    }

    fn matches_path_and_collection_group(&self, doc: &Document) -> bool {
        let doc_path = doc.key().path();
        if let Some(group) = &self.collection_group {
            doc.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if self.path.is_document_path() {
            // Document queries match exactly one key.
            &self.path == doc_path
        } else {
            // Collection queries match direct children only.
            self.path.is_prefix_of(doc_path) && doc_path.len() == self.path.len() + 1
        }
    }

    /// A document must have a value for every sort field to show up in the
    /// results (ordering by a missing field is undefined).
    fn matches_order_by(&self, doc: &Document) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|clause| clause.is_key_ordering() || doc.field(&clause.field).is_some())
    }

    fn matches_filters(&self, doc: &Document) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc))
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start_at) = &self.start_at {
            if !start_at.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end_at) = &self.end_at {
            if !end_at.sorts_after_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Total order over matching documents. The normalized order always ends
    /// in the key clause, which makes the order total.
    pub fn compare_docs(&self, d1: &Document, d2: &Document) -> Ordering {
        let mut compared_on_key = false;
        for clause in self.normalized_order_by() {
            let ordering = clause.compare(d1, d2);
            if ordering != Ordering::Equal {
                return ordering;
            }
            compared_on_key |= clause.is_key_ordering();
        }
        hard_assert(compared_on_key, "Order by used that doesn't compare on the key field");
        Ordering::Equal
    }

    /// The cache/backend target for this query. A limit-to-last query maps to
    /// the flipped target; the caller reverses results afterwards.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by,
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|clause| OrderBy::new(clause.field, clause.dir.invert()))
                    .collect(),
                filters: self.filters.clone(),
                limit: self.limit,
                // The cursors swap roles once the ordering is flipped.
                start_at: self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), bound.inclusive)),
                end_at: self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), bound.inclusive)),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let suffix = match self.limit_type {
            LimitType::First => "|lt:f",
            LimitType::Last => "|lt:l",
        };
        format!("{}{}", self.to_target().canonical_id(), suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Operator;
    use crate::model::{DocumentKey, SnapshotVersion, Timestamp};
    use crate::value::{FirestoreValue, MapValue};

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, entries: &[(&str, FirestoreValue)]) -> Document {
        let mut data = MapValue::empty();
        for (name, value) in entries {
            data.set(&field(name), value.clone());
        }
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn cities() -> Query {
        Query::at_path(ResourcePath::from_string("cities").unwrap())
    }

    #[test]
    fn collection_query_matches_direct_children_only() {
        let query = cities();
        assert!(query.matches(&doc("cities/sf", &[])));
        assert!(!query.matches(&doc("cities/sf/areas/a", &[])));
        assert!(!query.matches(&doc("regions/west", &[])));
    }

    #[test]
    fn collection_group_query_matches_any_parent() {
        let query = Query::collection_group("areas");
        assert!(query.matches(&doc("cities/sf/areas/a", &[])));
        assert!(query.matches(&doc("areas/a", &[])));
        assert!(!query.matches(&doc("cities/sf", &[])));
    }

    #[test]
    fn implicit_key_ordering_is_appended() {
        let query = cities().with_order_by(OrderBy::new(field("population"), Direction::Descending));
        let order_by = query.normalized_order_by();
        assert_eq!(order_by.len(), 2);
        assert!(order_by[1].is_key_ordering());
        assert_eq!(order_by[1].dir, Direction::Descending);
    }

    #[test]
    fn inequality_field_is_ordered_implicitly() {
        let query = cities().with_filter(
            Filter::relation(
                field("population"),
                Operator::GreaterThan,
                FirestoreValue::from_integer(10),
            )
            .unwrap(),
        );
        let order_by = query.normalized_order_by();
        assert_eq!(order_by[0].field, field("population"));
        assert!(order_by[1].is_key_ordering());
    }

    #[test]
    fn order_by_requires_field_presence() {
        let query = cities().with_order_by(OrderBy::ascending(field("population")));
        assert!(query.matches(&doc("cities/sf", &[("population", FirestoreValue::from_integer(1))])));
        assert!(!query.matches(&doc("cities/sf", &[])));
    }

    #[test]
    fn matches_all_documents_detects_unfiltered_scans() {
        assert!(cities().matches_all_documents());
        assert!(cities()
            .with_order_by(OrderBy::key_ordering(Direction::Ascending))
            .matches_all_documents());
        assert!(!cities().with_limit_to_first(3).matches_all_documents());
        assert!(!cities()
            .with_filter(
                Filter::relation(field("a"), Operator::Equal, FirestoreValue::from_integer(1))
                    .unwrap()
            )
            .matches_all_documents());
    }

    #[test]
    fn comparator_orders_by_field_then_key() {
        let query = cities().with_order_by(OrderBy::ascending(field("population")));
        let small = doc("cities/z", &[("population", FirestoreValue::from_integer(1))]);
        let big = doc("cities/a", &[("population", FirestoreValue::from_integer(2))]);
        assert_eq!(query.compare_docs(&small, &big), Ordering::Less);
        let tie_a = doc("cities/a", &[("population", FirestoreValue::from_integer(1))]);
        assert_eq!(query.compare_docs(&tie_a, &small), Ordering::Less);
    }

    #[test]
    fn limit_to_last_flips_target_ordering() {
        let query = cities()
            .with_order_by(OrderBy::ascending(field("population")))
            .with_limit_to_last(2);
        let target = query.to_target();
        assert_eq!(target.order_by[0].dir, Direction::Descending);
        assert_eq!(target.order_by[1].dir, Direction::Descending);
    }

    #[test]
    fn canonical_id_distinguishes_limit_types() {
        let first = cities().with_limit_to_first(1);
        let last = cities().with_limit_to_last(1);
        assert_ne!(first.canonical_id(), last.canonical_id());
    }
}
