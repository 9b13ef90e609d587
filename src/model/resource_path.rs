use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, FirestoreResult};

/// A slash-delimited path to a document or collection, totally ordered by
/// segment-wise comparison.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments.into_iter().map(Into::into).collect();
        Self::new(segments)
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Ok(Self::root());
        }

        if path.contains("//") {
            return Err(invalid_argument("Found empty segment in resource path"));
        }

        Ok(Self::from_segments(
            path.split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| segment.to_string()),
        ))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(|s| s.as_str())
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut new_segments = self.segments.clone();
        new_segments.extend(segments.into_iter().map(Into::into));
        Self::new(new_segments)
    }

    pub fn pop_last(&self) -> Self {
        if self.segments.is_empty() {
            return Self::root();
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Self::new(segments)
    }

    pub fn pop_first(&self) -> Self {
        self.pop_first_n(1)
    }

    pub fn pop_first_n(&self, count: usize) -> Self {
        if count == 0 {
            return self.clone();
        }
        if count >= self.segments.len() {
            return Self::root();
        }
        Self::new(self.segments[count..].to_vec())
    }

    pub fn first_segment(&self) -> Option<&str> {
        self.segments.first().map(|s| s.as_str())
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.len() > other.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(l, r)| l == r)
    }

    /// Whether this path points at a document (even segment count).
    pub fn is_document_path(&self) -> bool {
        self.len() % 2 == 0
    }

    pub fn compare_to(&self, other: &Self) -> Ordering {
        for (l, r) in self.segments.iter().zip(other.segments.iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        self.len().cmp(&other.len())
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_to(other)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_path() {
        let path = ResourcePath::from_string("cities/sf/neighborhoods/downtown").unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.last_segment(), Some("downtown"));
        assert_eq!(path.canonical_string(), "cities/sf/neighborhoods/downtown");
    }

    #[test]
    fn handles_root_path() {
        let path = ResourcePath::from_string("").unwrap();
        assert!(path.is_empty());
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("cities//sf").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn orders_by_segments_then_length() {
        let a = ResourcePath::from_string("cities/sf").unwrap();
        let b = ResourcePath::from_string("cities/sf/areas").unwrap();
        let c = ResourcePath::from_string("cities/tok").unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn prefix_checks_are_segment_wise() {
        let foo = ResourcePath::from_string("foo").unwrap();
        let foobar = ResourcePath::from_string("foobar").unwrap();
        let foo_doc = ResourcePath::from_string("foo/doc").unwrap();
        assert!(foo.is_prefix_of(&foo_doc));
        assert!(!foo.is_prefix_of(&foobar));
    }
}
