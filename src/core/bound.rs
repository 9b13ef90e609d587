use std::cmp::Ordering;

use crate::core::OrderBy;
use crate::model::{Document, ResourcePath};
use crate::util::assert::{fail, hard_assert};
use crate::value::{FirestoreValue, ValueKind};

/// A cursor position in a query's sort order: one value per order-by clause
/// (a prefix is allowed), plus whether the position itself is included.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    fn compare_to_document(&self, order_by: &[OrderBy], doc: &Document) -> Ordering {
        hard_assert(
            self.position.len() <= order_by.len(),
            "Bound has more components than the query's order by",
        );
        for (component, clause) in self.position.iter().zip(order_by.iter()) {
            let comparison = if clause.is_key_ordering() {
                match component.kind() {
                    ValueKind::Reference(path) => match ResourcePath::from_string(path) {
                        Ok(ref_path) => ref_path.compare_to(doc.key().path()),
                        Err(_) => fail("Bound has a malformed reference value"),
                    },
                    _ => fail("Bound has a non-key value where the key path is being used."),
                }
            } else {
                let doc_value = doc.field(&clause.field).unwrap_or_else(|| {
                    fail("Field should exist since document matched the orderBy already.")
                });
                component.compare_to(doc_value)
            };
            let comparison = match clause.dir {
                crate::core::Direction::Ascending => comparison,
                crate::core::Direction::Descending => comparison.reverse(),
            };
            if comparison != Ordering::Equal {
                return comparison;
            }
        }
        Ordering::Equal
    }

    /// Whether the bound, used as a start position, admits `doc`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let comparison = self.compare_to_document(order_by, doc);
        if self.inclusive {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }

    /// Whether the bound, used as an end position, admits `doc`.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let comparison = self.compare_to_document(order_by, doc);
        if self.inclusive {
            comparison != Ordering::Less
        } else {
            comparison == Ordering::Greater
        }
    }

    pub fn canonical_id(&self) -> String {
        let mut id = String::from(if self.inclusive { "b:" } else { "a:" });
        for component in &self.position {
            id.push_str(&component.canonical_id());
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Direction;
    use crate::model::{DocumentKey, FieldPath, SnapshotVersion, Timestamp};
    use crate::value::MapValue;

    fn doc(path: &str, population: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("population").unwrap(),
            FirestoreValue::from_integer(population),
        );
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn population_order() -> Vec<OrderBy> {
        vec![
            OrderBy::ascending(FieldPath::from_dot_separated("population").unwrap()),
            OrderBy::key_ordering(Direction::Ascending),
        ]
    }

    #[test]
    fn inclusive_start_admits_equal_position() {
        let bound = Bound::new(vec![FirestoreValue::from_integer(10)], true);
        assert!(bound.sorts_before_document(&population_order(), &doc("cities/a", 10)));
        assert!(bound.sorts_before_document(&population_order(), &doc("cities/a", 11)));
        assert!(!bound.sorts_before_document(&population_order(), &doc("cities/a", 9)));
    }

    #[test]
    fn exclusive_start_skips_equal_position() {
        let bound = Bound::new(vec![FirestoreValue::from_integer(10)], false);
        assert!(!bound.sorts_before_document(&population_order(), &doc("cities/a", 10)));
        assert!(bound.sorts_before_document(&population_order(), &doc("cities/a", 11)));
    }

    #[test]
    fn end_bound_cuts_off_after_position() {
        let bound = Bound::new(vec![FirestoreValue::from_integer(10)], true);
        assert!(bound.sorts_after_document(&population_order(), &doc("cities/a", 10)));
        assert!(bound.sorts_after_document(&population_order(), &doc("cities/a", 9)));
        assert!(!bound.sorts_after_document(&population_order(), &doc("cities/a", 11)));
    }

    #[test]
    fn key_component_compares_reference() {
        let order = vec![OrderBy::key_ordering(Direction::Ascending)];
        let bound = Bound::new(vec![FirestoreValue::from_reference("cities/m")], false);
        assert!(bound.sorts_before_document(&order, &doc("cities/z", 1)));
        assert!(!bound.sorts_before_document(&order, &doc("cities/a", 1)));
    }
}
