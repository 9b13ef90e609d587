use std::cmp::Ordering;

use crate::model::{Document, FieldPath};
use crate::util::assert::fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn invert(&self) -> Direction {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }

    fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }
}

/// An ordering on a single field. Ordering by the key sentinel compares
/// document keys directly.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: FieldPath,
    pub dir: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, dir: Direction) -> Self {
        Self { field, dir }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn key_ordering(dir: Direction) -> Self {
        Self::new(FieldPath::document_id(), dir)
    }

    pub fn is_key_ordering(&self) -> bool {
        self.field.is_document_id()
    }

    pub fn compare(&self, d1: &Document, d2: &Document) -> Ordering {
        let ordering = if self.is_key_ordering() {
            d1.key().compare_to(d2.key())
        } else {
            match (d1.field(&self.field), d2.field(&self.field)) {
                (Some(v1), Some(v2)) => v1.compare_to(v2),
                _ => fail(format!(
                    "Trying to compare documents on fields that don't exist: {}",
                    self.field.canonical_string()
                )),
            }
        };
        self.dir.apply(ordering)
    }

    pub fn canonical_id(&self) -> String {
        format!("{}{}", self.field.canonical_string(), self.dir.as_str())
    }
}
