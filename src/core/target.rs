use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::core::{Bound, Filter, Operator, OrderBy};
use crate::model::{FieldIndex, FieldPath, ResourcePath};
use crate::value::{FirestoreValue, ValueKind};

/// The server-facing side of a query: what documents belong to it, without
/// client-side presentation concerns like the limit type. Targets with the
/// same canonical id share a target cache entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub filters: Vec<Filter>,
    pub limit: Option<i32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
            id.push(',');
        }
        id.push_str("|ob:");
        for order_by in &self.order_by {
            id.push_str(&order_by.canonical_id());
            id.push(',');
        }
        if let Some(limit) = self.limit {
            id.push_str("|l:");
            id.push_str(&limit.to_string());
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }

    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// The collection id the target reads from, for index lookups.
    pub fn collection_id(&self) -> Option<&str> {
        match &self.collection_group {
            Some(group) => Some(group.as_str()),
            None => self.path.last_segment(),
        }
    }

    /// All leaf filters constraining `field`.
    pub fn field_filters_for(&self, field: &FieldPath) -> Vec<&Filter> {
        self.filters
            .iter()
            .flat_map(|f| f.field_filters())
            .filter(|f| f.field() == Some(field))
            .collect()
    }

    /// One sub-target per disjunction term of the filter list. A target
    /// without composite filters is its own single sub-target.
    pub fn dnf_sub_targets(&self) -> Vec<Target> {
        if self.filters.is_empty()
            || !self
                .filters
                .iter()
                .any(|f| matches!(f, Filter::Composite(_)))
        {
            return vec![self.clone()];
        }
        Filter::and(self.filters.clone())
            .dnf_terms()
            .into_iter()
            .map(|term| {
                let filters = term.field_filters().into_iter().cloned().collect();
                Target {
                    filters,
                    ..self.clone()
                }
            })
            .collect()
    }

    /// The values an array segment of `index` must contain, one scan per
    /// value. `None` when no array filter constrains the segment.
    pub fn array_values(&self, index: &FieldIndex) -> Option<Vec<FirestoreValue>> {
        let segment = index.array_segment()?;
        for filter in self.field_filters_for(&segment.field_path) {
            match filter.operator() {
                Some(Operator::ArrayContains) => {
                    return filter.value().map(|value| vec![value]);
                }
                Some(Operator::ArrayContainsAny) => {
                    if let Some(value) = filter.value() {
                        if let ValueKind::Array(array) = value.kind() {
                            return Some(array.values().to_vec());
                        }
                    }
                }
                _ => continue,
            }
        }
        None
    }

    /// Values excluded by `!=`/`not-in` filters on the index's directional
    /// segments, keyed by field. The index scan splits its range around them.
    pub fn not_in_values(&self, index: &FieldIndex) -> Option<Vec<FirestoreValue>> {
        let mut values: BTreeMap<String, Vec<FirestoreValue>> = BTreeMap::new();
        for segment in index.directional_segments() {
            for filter in self.field_filters_for(&segment.field_path) {
                match filter.operator() {
                    Some(Operator::NotEqual) => {
                        if let Some(value) = filter.value() {
                            values.insert(segment.field_path.canonical_string(), vec![value]);
                        }
                    }
                    Some(Operator::NotIn) => {
                        if let Some(value) = filter.value() {
                            if let ValueKind::Array(array) = value.kind() {
                                values.insert(
                                    segment.field_path.canonical_string(),
                                    array.values().to_vec(),
                                );
                            }
                        }
                    }
                    _ => continue,
                }
            }
        }
        if values.is_empty() {
            None
        } else {
            Some(values.into_values().flatten().collect())
        }
    }

    /// The lowest index position a scan for this target must start at. Every
    /// directional segment contributes a value, so positions are always full
    /// width.
    pub fn lower_bound(&self, index: &FieldIndex) -> Bound {
        let mut position = Vec::new();
        let mut inclusive = true;
        for segment in index.directional_segments() {
            let (value, segment_inclusive) = match segment.kind {
                crate::model::IndexKind::Descending => {
                    self.descending_bound(&segment.field_path, self.start_at.as_ref())
                }
                _ => self.ascending_bound(&segment.field_path, self.start_at.as_ref()),
            };
            position.push(value);
            inclusive &= segment_inclusive;
        }
        Bound::new(position, inclusive)
    }

    /// The highest index position a scan for this target may reach.
    pub fn upper_bound(&self, index: &FieldIndex) -> Bound {
        let mut position = Vec::new();
        let mut inclusive = true;
        for segment in index.directional_segments() {
            let (value, segment_inclusive) = match segment.kind {
                crate::model::IndexKind::Descending => {
                    self.ascending_bound(&segment.field_path, self.end_at.as_ref())
                }
                _ => self.descending_bound(&segment.field_path, self.end_at.as_ref()),
            };
            position.push(value);
            inclusive &= segment_inclusive;
        }
        Bound::new(position, inclusive)
    }

    /// Greatest lower bound for `field` over the filters and the cursor.
    fn ascending_bound(
        &self,
        field: &FieldPath,
        cursor: Option<&Bound>,
    ) -> (FirestoreValue, bool) {
        let mut value = FirestoreValue::min_value();
        let mut inclusive = true;
        for filter in self.field_filters_for(field) {
            let Some(filter_value) = filter.value() else {
                continue;
            };
            let (candidate, candidate_inclusive) = match filter.operator() {
                Some(Operator::LessThan) | Some(Operator::LessThanOrEqual) => {
                    (filter_value.type_lower_bound(), true)
                }
                Some(Operator::Equal) | Some(Operator::In) | Some(Operator::GreaterThanOrEqual) => {
                    (filter_value, true)
                }
                Some(Operator::GreaterThan) => (filter_value, false),
                Some(Operator::NotEqual) | Some(Operator::NotIn) => {
                    (FirestoreValue::min_value(), true)
                }
                _ => continue,
            };
            if value.compare_to(&candidate) == Ordering::Less {
                value = candidate;
                inclusive = candidate_inclusive;
            }
        }
        if let Some(bound) = cursor {
            for (i, clause) in self.order_by.iter().enumerate() {
                if &clause.field == field {
                    if let Some(cursor_value) = bound.position.get(i) {
                        if value.compare_to(cursor_value) == Ordering::Less {
                            value = cursor_value.clone();
                            inclusive = bound.inclusive;
                        }
                    }
                    break;
                }
            }
        }
        (value, inclusive)
    }

    /// Least upper bound for `field` over the filters and the cursor.
    fn descending_bound(
        &self,
        field: &FieldPath,
        cursor: Option<&Bound>,
    ) -> (FirestoreValue, bool) {
        let mut value = FirestoreValue::max_value();
        let mut inclusive = true;
        for filter in self.field_filters_for(field) {
            let Some(filter_value) = filter.value() else {
                continue;
            };
            let (candidate, candidate_inclusive) = match filter.operator() {
                Some(Operator::GreaterThan) | Some(Operator::GreaterThanOrEqual) => {
                    (filter_value.type_upper_bound(), false)
                }
                Some(Operator::Equal) | Some(Operator::In) | Some(Operator::LessThanOrEqual) => {
                    (filter_value, true)
                }
                Some(Operator::LessThan) => (filter_value, false),
                Some(Operator::NotEqual) | Some(Operator::NotIn) => {
                    (FirestoreValue::max_value(), true)
                }
                _ => continue,
            };
            if value.compare_to(&candidate) == Ordering::Greater {
                value = candidate;
                inclusive = candidate_inclusive;
            }
        }
        if let Some(bound) = cursor {
            for (i, clause) in self.order_by.iter().enumerate() {
                if &clause.field == field {
                    if let Some(cursor_value) = bound.position.get(i) {
                        if value.compare_to(cursor_value) == Ordering::Greater {
                            value = cursor_value.clone();
                            inclusive = bound.inclusive;
                        }
                    }
                    break;
                }
            }
        }
        (value, inclusive)
    }

    /// Whether any leaf filter uses one of `operators`.
    pub fn contains_operator(&self, operators: &[Operator]) -> bool {
        self.filters.iter().flat_map(|f| f.field_filters()).any(|f| {
            f.operator()
                .map(|op| operators.contains(&op))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Direction;
    use crate::model::{IndexKind, IndexSegment, IndexState};

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn target_with_filters(filters: Vec<Filter>) -> Target {
        Target {
            path: ResourcePath::from_string("coll").unwrap(),
            collection_group: None,
            order_by: vec![
                OrderBy::ascending(field("a")),
                OrderBy::key_ordering(Direction::Ascending),
            ],
            filters,
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    fn index_on(path: &str, kind: IndexKind) -> FieldIndex {
        FieldIndex::new(
            1,
            "coll",
            vec![IndexSegment::new(field(path), kind)],
            IndexState::empty(),
        )
    }

    #[test]
    fn canonical_id_distinguishes_filters() {
        let without = target_with_filters(vec![]);
        let with = target_with_filters(vec![Filter::relation(
            field("a"),
            Operator::Equal,
            FirestoreValue::from_integer(1),
        )
        .unwrap()]);
        assert_ne!(without.canonical_id(), with.canonical_id());
    }

    #[test]
    fn equality_pins_both_bounds() {
        let target = target_with_filters(vec![Filter::relation(
            field("a"),
            Operator::Equal,
            FirestoreValue::from_integer(7),
        )
        .unwrap()]);
        let index = index_on("a", IndexKind::Ascending);
        let lower = target.lower_bound(&index);
        let upper = target.upper_bound(&index);
        assert_eq!(lower.position, vec![FirestoreValue::from_integer(7)]);
        assert!(lower.inclusive);
        assert_eq!(upper.position, vec![FirestoreValue::from_integer(7)]);
        assert!(upper.inclusive);
    }

    #[test]
    fn range_filter_keeps_full_width_positions() {
        let target = target_with_filters(vec![Filter::relation(
            field("a"),
            Operator::GreaterThan,
            FirestoreValue::from_integer(5),
        )
        .unwrap()]);
        let index = index_on("a", IndexKind::Ascending);
        let lower = target.lower_bound(&index);
        assert_eq!(lower.position.len(), 1);
        assert!(!lower.inclusive);
        let upper = target.upper_bound(&index);
        // Unconstrained above within the number type.
        assert_eq!(upper.position.len(), 1);
    }

    #[test]
    fn array_contains_yields_single_scan_value() {
        let target = target_with_filters(vec![Filter::relation(
            field("tags"),
            Operator::ArrayContains,
            FirestoreValue::from_string("x"),
        )
        .unwrap()]);
        let index = index_on("tags", IndexKind::ArrayContains);
        assert_eq!(
            target.array_values(&index),
            Some(vec![FirestoreValue::from_string("x")])
        );
    }

    #[test]
    fn array_contains_any_yields_one_scan_per_value() {
        let target = target_with_filters(vec![Filter::relation(
            field("tags"),
            Operator::ArrayContainsAny,
            FirestoreValue::from_array(vec![
                FirestoreValue::from_string("x"),
                FirestoreValue::from_string("y"),
            ]),
        )
        .unwrap()]);
        let index = index_on("tags", IndexKind::ArrayContains);
        assert_eq!(target.array_values(&index).unwrap().len(), 2);
    }

    #[test]
    fn not_in_values_collected_per_segment() {
        let target = target_with_filters(vec![Filter::relation(
            field("a"),
            Operator::NotIn,
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]),
        )
        .unwrap()]);
        let index = index_on("a", IndexKind::Ascending);
        assert_eq!(
            target.not_in_values(&index),
            Some(vec![FirestoreValue::from_integer(1)])
        );
    }

    #[test]
    fn dnf_sub_targets_split_or_filters() {
        let a =
            Filter::relation(field("a"), Operator::Equal, FirestoreValue::from_integer(1)).unwrap();
        let b =
            Filter::relation(field("b"), Operator::Equal, FirestoreValue::from_integer(2)).unwrap();
        let target = target_with_filters(vec![Filter::or(vec![a, b])]);
        let subs = target.dnf_sub_targets();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].filters.len(), 1);
    }
}
