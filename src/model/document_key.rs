use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, FirestoreResult};
use crate::model::ResourcePath;

/// Path to a document; always an even number of segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() < 2 || path.len() % 2 != 0 {
            return Err(invalid_argument(
                "Document keys must point to a document (even number of segments)",
            ));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let resource = ResourcePath::from_string(path)?;
        Self::from_path(resource)
    }

    pub fn from_segments<I, S>(segments: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_path(ResourcePath::from_segments(segments))
    }

    /// Smallest possible key; only useful as a scan boundary.
    pub(crate) fn empty() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.pop_last()
    }

    /// The identifier of the collection containing this document.
    pub fn collection_group(&self) -> &str {
        self.path
            .get(self.path.len() - 2)
            .expect("DocumentKey path always has a parent collection")
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path
            .last_segment()
            .expect("DocumentKey path always has id")
    }

    pub fn compare_to(&self, other: &Self) -> Ordering {
        self.path.compare_to(&other.path)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("cities").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn parses_valid_path() {
        let key = DocumentKey::from_string("cities/sf").unwrap();
        assert_eq!(key.id(), "sf");
        assert_eq!(key.collection_path().canonical_string(), "cities");
        assert_eq!(key.collection_group(), "cities");
    }

    #[test]
    fn orders_like_resource_paths() {
        let a = DocumentKey::from_string("cities/la").unwrap();
        let b = DocumentKey::from_string("cities/sf").unwrap();
        assert_eq!(a.compare_to(&b), Ordering::Less);
    }
}
