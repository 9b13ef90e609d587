use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::error::{invalid_argument, FirestoreResult};
use crate::model::{Document, FieldPath};
use crate::value::{FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThanOrEqual,
    GreaterThan,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl Operator {
    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThanOrEqual => ">=",
            Operator::GreaterThan => ">",
            Operator::ArrayContains => "array-contains",
            Operator::In => "in",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::NotIn => "not-in",
        }
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-field comparison against a literal value.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: FirestoreValue,
}

/// Matches documents whose field is exactly null. Only equality makes sense
/// against null, so it gets its own variant.
#[derive(Clone, Debug, PartialEq)]
pub struct NullFilter {
    pub field: FieldPath,
}

/// Matches documents whose field is NaN; same reasoning as [`NullFilter`].
#[derive(Clone, Debug, PartialEq)]
pub struct NanFilter {
    pub field: FieldPath,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeOperator {
    And,
    Or,
}

/// A conjunction or disjunction of sub-filters.
#[derive(Clone, Debug, PartialEq)]
pub struct CompositeFilter {
    pub op: CompositeOperator,
    pub filters: Vec<Filter>,
}

/// The closed set of filters a query can carry.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Relation(RelationFilter),
    Null(NullFilter),
    Nan(NanFilter),
    Composite(CompositeFilter),
}

impl Filter {
    /// Builds a field filter, normalizing equality against null and NaN into
    /// their dedicated variants. Non-equality comparisons against null or NaN
    /// are meaningless and rejected.
    pub fn relation(
        field: FieldPath,
        op: Operator,
        value: FirestoreValue,
    ) -> FirestoreResult<Filter> {
        if value.is_null() {
            if op != Operator::Equal {
                return Err(invalid_argument(
                    "Invalid query. Null supports only equality comparisons.",
                ));
            }
            return Ok(Filter::Null(NullFilter { field }));
        }
        if value.is_nan() {
            if op != Operator::Equal {
                return Err(invalid_argument(
                    "Invalid query. NaN supports only equality comparisons.",
                ));
            }
            return Ok(Filter::Nan(NanFilter { field }));
        }
        if matches!(op, Operator::In | Operator::NotIn | Operator::ArrayContainsAny)
            && !value.is_array()
        {
            return Err(invalid_argument(format!(
                "Invalid query. '{op}' filters require an array value."
            )));
        }
        Ok(Filter::Relation(RelationFilter { field, op, value }))
    }

    pub fn and(filters: Vec<Filter>) -> Filter {
        Filter::Composite(CompositeFilter {
            op: CompositeOperator::And,
            filters,
        })
    }

    pub fn or(filters: Vec<Filter>) -> Filter {
        Filter::Composite(CompositeFilter {
            op: CompositeOperator::Or,
            filters,
        })
    }

    /// The field a leaf filter constrains; `None` for composites.
    pub fn field(&self) -> Option<&FieldPath> {
        match self {
            Filter::Relation(f) => Some(&f.field),
            Filter::Null(f) => Some(&f.field),
            Filter::Nan(f) => Some(&f.field),
            Filter::Composite(_) => None,
        }
    }

    /// The effective operator of a leaf filter; null and NaN filters are
    /// equality checks.
    pub fn operator(&self) -> Option<Operator> {
        match self {
            Filter::Relation(f) => Some(f.op),
            Filter::Null(_) | Filter::Nan(_) => Some(Operator::Equal),
            Filter::Composite(_) => None,
        }
    }

    /// The literal a leaf filter compares against.
    pub fn value(&self) -> Option<FirestoreValue> {
        match self {
            Filter::Relation(f) => Some(f.value.clone()),
            Filter::Null(_) => Some(FirestoreValue::null()),
            Filter::Nan(_) => Some(FirestoreValue::nan()),
            Filter::Composite(_) => None,
        }
    }

    pub fn is_inequality(&self) -> bool {
        match self {
            Filter::Relation(f) => f.op.is_inequality(),
            _ => false,
        }
    }

    /// All leaf filters in this filter tree, in order.
    pub fn field_filters(&self) -> Vec<&Filter> {
        match self {
            Filter::Composite(composite) => composite
                .filters
                .iter()
                .flat_map(|f| f.field_filters())
                .collect(),
            leaf => vec![leaf],
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Relation(filter) => filter.matches(doc),
            Filter::Null(filter) => doc
                .field(&filter.field)
                .map(FirestoreValue::is_null)
                .unwrap_or(false),
            Filter::Nan(filter) => doc
                .field(&filter.field)
                .map(FirestoreValue::is_nan)
                .unwrap_or(false),
            Filter::Composite(composite) => match composite.op {
                CompositeOperator::And => composite.filters.iter().all(|f| f.matches(doc)),
                CompositeOperator::Or => composite.filters.iter().any(|f| f.matches(doc)),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Relation(filter) => format!(
                "{}{}{}",
                filter.field.canonical_string(),
                filter.op,
                filter.value.canonical_id()
            ),
            Filter::Null(filter) => format!("{}==null", filter.field.canonical_string()),
            Filter::Nan(filter) => format!("{}==NaN", filter.field.canonical_string()),
            Filter::Composite(composite) => {
                let op = match composite.op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                let inner: Vec<String> =
                    composite.filters.iter().map(|f| f.canonical_id()).collect();
                format!("{}({})", op, inner.join(","))
            }
        }
    }

    /// Rewrites this filter into disjunctive normal form and returns the
    /// disjunction terms. Each term is either a leaf filter or a flat
    /// conjunction of leaves, so each can drive one index scan.
    pub fn dnf_terms(&self) -> Vec<Filter> {
        match self {
            Filter::Composite(composite) => match composite.op {
                CompositeOperator::Or => composite
                    .filters
                    .iter()
                    .flat_map(|f| f.dnf_terms())
                    .collect(),
                CompositeOperator::And => {
                    // Distribute the conjunction over each child's terms.
                    let mut terms: Vec<Vec<Filter>> = vec![Vec::new()];
                    for child in &composite.filters {
                        let child_terms = child.dnf_terms();
                        let mut next = Vec::with_capacity(terms.len() * child_terms.len());
                        for term in &terms {
                            for child_term in &child_terms {
                                let mut combined = term.clone();
                                match child_term {
                                    Filter::Composite(inner) => {
                                        combined.extend(inner.filters.iter().cloned())
                                    }
                                    leaf => combined.push(leaf.clone()),
                                }
                                next.push(combined);
                            }
                        }
                        terms = next;
                    }
                    terms
                        .into_iter()
                        .map(|mut leaves| {
                            if leaves.len() == 1 {
                                leaves.pop().expect("one leaf")
                            } else {
                                Filter::and(leaves)
                            }
                        })
                        .collect()
                }
            },
            leaf => vec![leaf.clone()],
        }
    }
}

impl RelationFilter {
    fn matches(&self, doc: &Document) -> bool {
        let Some(other) = doc.field(&self.field) else {
            return false;
        };
        match self.op {
            Operator::ArrayContains => match other.kind() {
                ValueKind::Array(array) => array.contains(&self.value),
                _ => false,
            },
            Operator::In => match self.value.kind() {
                ValueKind::Array(candidates) => candidates.contains(other),
                _ => false,
            },
            Operator::ArrayContainsAny => match (other.kind(), self.value.kind()) {
                (ValueKind::Array(values), ValueKind::Array(candidates)) => {
                    values.values().iter().any(|v| candidates.contains(v))
                }
                _ => false,
            },
            Operator::NotIn => {
                if other.is_null() {
                    return false;
                }
                match self.value.kind() {
                    ValueKind::Array(candidates) => !candidates.contains(other),
                    _ => false,
                }
            }
            Operator::NotEqual => {
                !other.is_null() && !other.is_nan() && other.compare_to(&self.value) != Ordering::Equal
            }
            // Only values of matching backend type order compare (so that a
            // range filter on numbers never matches a string).
            _ => {
                other.type_order() == self.value.type_order()
                    && self.matches_comparison(other.compare_to(&self.value))
            }
        }
    }

    fn matches_comparison(&self, comparison: Ordering) -> bool {
        match self.op {
            Operator::LessThan => comparison == Ordering::Less,
            Operator::LessThanOrEqual => comparison != Ordering::Greater,
            Operator::Equal => comparison == Ordering::Equal,
            Operator::GreaterThan => comparison == Ordering::Greater,
            Operator::GreaterThanOrEqual => comparison != Ordering::Less,
            op => crate::util::assert::fail(&format!("Unexpected comparison operator {op}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentKey, SnapshotVersion, Timestamp};
    use crate::value::MapValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(entries: &[(&str, FirestoreValue)]) -> Document {
        let mut data = MapValue::empty();
        for (path, value) in entries {
            data.set(&field(path), value.clone());
        }
        Document::new_found_document(
            DocumentKey::from_string("coll/doc").unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    #[test]
    fn equality_on_null_becomes_null_filter() {
        let filter = Filter::relation(field("x"), Operator::Equal, FirestoreValue::null()).unwrap();
        assert!(matches!(filter, Filter::Null(_)));
        assert!(filter.matches(&doc(&[("x", FirestoreValue::null())])));
        assert!(!filter.matches(&doc(&[("x", FirestoreValue::from_integer(1))])));
        assert!(!filter.matches(&doc(&[])));
    }

    #[test]
    fn inequality_on_null_is_rejected() {
        let err =
            Filter::relation(field("x"), Operator::GreaterThan, FirestoreValue::null()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn inequality_on_nan_is_rejected() {
        let err =
            Filter::relation(field("x"), Operator::LessThan, FirestoreValue::nan()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn nan_equality_matches_only_nan() {
        let filter = Filter::relation(field("x"), Operator::Equal, FirestoreValue::nan()).unwrap();
        assert!(filter.matches(&doc(&[("x", FirestoreValue::nan())])));
        assert!(!filter.matches(&doc(&[("x", FirestoreValue::from_double(1.0))])));
    }

    #[test]
    fn range_filters_ignore_other_types() {
        let filter = Filter::relation(
            field("x"),
            Operator::GreaterThan,
            FirestoreValue::from_integer(5),
        )
        .unwrap();
        assert!(filter.matches(&doc(&[("x", FirestoreValue::from_integer(6))])));
        // Strings sort after numbers but must not match a numeric range.
        assert!(!filter.matches(&doc(&[("x", FirestoreValue::from_string("z"))])));
    }

    #[test]
    fn array_contains_checks_membership() {
        let filter = Filter::relation(
            field("tags"),
            Operator::ArrayContains,
            FirestoreValue::from_string("a"),
        )
        .unwrap();
        let tags = FirestoreValue::from_array(vec![
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("b"),
        ]);
        assert!(filter.matches(&doc(&[("tags", tags)])));
        assert!(!filter.matches(&doc(&[("tags", FirestoreValue::from_string("a"))])));
    }

    #[test]
    fn in_filter_matches_any_listed_value() {
        let filter = Filter::relation(
            field("x"),
            Operator::In,
            FirestoreValue::from_array(vec![
                FirestoreValue::from_integer(1),
                FirestoreValue::from_integer(2),
            ]),
        )
        .unwrap();
        assert!(filter.matches(&doc(&[("x", FirestoreValue::from_integer(2))])));
        assert!(!filter.matches(&doc(&[("x", FirestoreValue::from_integer(3))])));
    }

    #[test]
    fn not_in_excludes_null_fields() {
        let filter = Filter::relation(
            field("x"),
            Operator::NotIn,
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]),
        )
        .unwrap();
        assert!(filter.matches(&doc(&[("x", FirestoreValue::from_integer(2))])));
        assert!(!filter.matches(&doc(&[("x", FirestoreValue::from_integer(1))])));
        assert!(!filter.matches(&doc(&[("x", FirestoreValue::null())])));
        assert!(!filter.matches(&doc(&[])));
    }

    #[test]
    fn composite_or_distributes_over_and() {
        // (a==1 OR b==2) AND c==3 has two disjunction terms.
        let a = Filter::relation(field("a"), Operator::Equal, FirestoreValue::from_integer(1))
            .unwrap();
        let b = Filter::relation(field("b"), Operator::Equal, FirestoreValue::from_integer(2))
            .unwrap();
        let c = Filter::relation(field("c"), Operator::Equal, FirestoreValue::from_integer(3))
            .unwrap();
        let filter = Filter::and(vec![Filter::or(vec![a, b]), c]);
        let terms = filter.dnf_terms();
        assert_eq!(terms.len(), 2);
        for term in &terms {
            assert_eq!(term.field_filters().len(), 2);
        }
    }

    #[test]
    fn composite_matching() {
        let a = Filter::relation(field("a"), Operator::Equal, FirestoreValue::from_integer(1))
            .unwrap();
        let b = Filter::relation(field("b"), Operator::Equal, FirestoreValue::from_integer(2))
            .unwrap();
        let or = Filter::or(vec![a.clone(), b.clone()]);
        assert!(or.matches(&doc(&[("a", FirestoreValue::from_integer(1))])));
        assert!(or.matches(&doc(&[("b", FirestoreValue::from_integer(2))])));
        let and = Filter::and(vec![a, b]);
        assert!(!and.matches(&doc(&[("a", FirestoreValue::from_integer(1))])));
    }
}
