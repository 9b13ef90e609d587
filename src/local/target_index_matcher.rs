use std::collections::BTreeSet;

use crate::core::{Direction, Filter, Operator, OrderBy, Target};
use crate::model::{FieldIndex, IndexKind, IndexSegment, IndexState, UNKNOWN_INDEX_ID};
use crate::util::assert::hard_assert;

/// Decides whether a field index can serve a target, and conversely which
/// index a target would need.
///
/// An index serves a target when its array segment is backed by an
/// array filter, a prefix of its directional segments is consumed by
/// equality filters, at most one following segment carries the target's
/// inequality (which must also head the ordering), and every remaining
/// segment lines up with the ordering clauses in sequence and direction.
pub struct TargetIndexMatcher {
    collection_id: String,
    equality_filters: Vec<Filter>,
    inequality_filter: Option<Filter>,
    order_bys: Vec<OrderBy>,
}

impl TargetIndexMatcher {
    pub fn new(target: &Target) -> Self {
        let mut equality_filters = Vec::new();
        let mut inequality_filter = None;
        for filter in target.filters.iter().flat_map(|f| f.field_filters()) {
            if filter.is_inequality() {
                if inequality_filter.is_none() {
                    inequality_filter = Some(filter.clone());
                }
            } else {
                equality_filters.push(filter.clone());
            }
        }
        Self {
            collection_id: target.collection_id().unwrap_or_default().to_string(),
            equality_filters,
            inequality_filter,
            order_bys: target.order_by.clone(),
        }
    }

    pub fn served_by_index(&self, index: &FieldIndex) -> bool {
        hard_assert(
            index.collection_group == self.collection_id,
            "Collection ids do not match",
        );

        if let Some(array_segment) = index.array_segment() {
            if !self.has_matching_equality_filter(array_segment) {
                return false;
            }
        }

        let segments: Vec<&IndexSegment> = index.directional_segments().collect();
        let mut segment_index = 0;
        let mut order_by_index = 0;

        // Equality filters may consume leading segments in any order.
        while segment_index < segments.len()
            && self.has_matching_equality_filter(segments[segment_index])
        {
            segment_index += 1;
        }
        if segment_index == segments.len() {
            return true;
        }

        if let Some(inequality) = &self.inequality_filter {
            let consumed_by_equality = segments[..segment_index]
                .iter()
                .any(|s| Some(&s.field_path) == inequality.field());
            if !consumed_by_equality {
                let segment = segments[segment_index];
                if !matches_filter(inequality, segment) {
                    return false;
                }
                match self.order_bys.get(order_by_index) {
                    Some(order_by) if matches_order_by(order_by, segment) => {}
                    _ => return false,
                }
                order_by_index += 1;
                segment_index += 1;
            }
        }

        // Whatever is left must mirror the ordering clauses one by one.
        while segment_index < segments.len() {
            let segment = segments[segment_index];
            match self.order_bys.get(order_by_index) {
                Some(order_by) if matches_order_by(order_by, segment) => {}
                _ => return false,
            }
            order_by_index += 1;
            segment_index += 1;
        }
        true
    }

    /// The smallest index that would fully serve the target.
    pub fn build_target_index(&self) -> FieldIndex {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut segments = Vec::new();

        for filter in self
            .equality_filters
            .iter()
            .chain(self.inequality_filter.iter())
        {
            let Some(field) = filter.field() else { continue };
            if field.is_document_id() {
                continue;
            }
            let is_array_op = matches!(
                filter.operator(),
                Some(Operator::ArrayContains) | Some(Operator::ArrayContainsAny)
            );
            if is_array_op {
                if !segments
                    .iter()
                    .any(|s: &IndexSegment| s.kind == IndexKind::ArrayContains)
                {
                    segments.push(IndexSegment::new(field.clone(), IndexKind::ArrayContains));
                }
            } else if seen.insert(field.canonical_string()) {
                segments.push(IndexSegment::new(field.clone(), IndexKind::Ascending));
            }
        }

        for order_by in &self.order_bys {
            if order_by.field.is_document_id() {
                continue;
            }
            if seen.insert(order_by.field.canonical_string()) {
                let kind = match order_by.dir {
                    Direction::Ascending => IndexKind::Ascending,
                    Direction::Descending => IndexKind::Descending,
                };
                segments.push(IndexSegment::new(order_by.field.clone(), kind));
            }
        }

        FieldIndex::new(
            UNKNOWN_INDEX_ID,
            self.collection_id.clone(),
            segments,
            IndexState::empty(),
        )
    }

    fn has_matching_equality_filter(&self, segment: &IndexSegment) -> bool {
        self.equality_filters
            .iter()
            .any(|filter| matches_filter(filter, segment))
    }
}

fn matches_filter(filter: &Filter, segment: &IndexSegment) -> bool {
    if filter.field() != Some(&segment.field_path) {
        return false;
    }
    let is_array_op = matches!(
        filter.operator(),
        Some(Operator::ArrayContains) | Some(Operator::ArrayContainsAny)
    );
    is_array_op == (segment.kind == IndexKind::ArrayContains)
}

fn matches_order_by(order_by: &OrderBy, segment: &IndexSegment) -> bool {
    if order_by.field != segment.field_path {
        return false;
    }
    matches!(
        (segment.kind, order_by.dir),
        (IndexKind::Ascending, Direction::Ascending)
            | (IndexKind::Descending, Direction::Descending)
    )
}
