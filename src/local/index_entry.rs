use crate::model::DocumentKey;

/// One row of a field index: one per (index, array element, document).
/// Derived ordering gives the storage sort order `(index_id, array_value,
/// directional_value, document_key)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    pub index_id: i32,
    pub array_value: Vec<u8>,
    pub directional_value: Vec<u8>,
    pub document_key: DocumentKey,
}

impl IndexEntry {
    pub fn new(
        index_id: i32,
        array_value: Vec<u8>,
        directional_value: Vec<u8>,
        document_key: DocumentKey,
    ) -> Self {
        Self {
            index_id,
            array_value,
            directional_value,
            document_key,
        }
    }
}

/// The smallest byte string strictly greater than `value`: nothing sorts
/// between `value` and `value ++ [0]`. Used to turn inclusive bounds into
/// exclusive ones and to resume scans after an excluded point.
pub fn byte_successor(value: &[u8]) -> Vec<u8> {
    let mut successor = Vec::with_capacity(value.len() + 1);
    successor.extend_from_slice(value);
    successor.push(0);
    successor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn entries_order_by_index_then_bytes_then_key() {
        let mut entries = vec![
            IndexEntry::new(2, vec![], vec![0x01], key("c/a")),
            IndexEntry::new(1, vec![], vec![0x02], key("c/b")),
            IndexEntry::new(1, vec![], vec![0x01], key("c/b")),
            IndexEntry::new(1, vec![], vec![0x01], key("c/a")),
        ];
        entries.sort();
        assert_eq!(entries[0].document_key, key("c/a"));
        assert_eq!(entries[0].directional_value, vec![0x01]);
        assert_eq!(entries[1].document_key, key("c/b"));
        assert_eq!(entries[2].directional_value, vec![0x02]);
        assert_eq!(entries[3].index_id, 2);
    }

    #[test]
    fn successor_is_immediate() {
        let value = vec![0x10, 0xff];
        let successor = byte_successor(&value);
        assert!(value < successor);
        // No byte string sorts between a value and value ++ [0x00].
        assert_eq!(successor, vec![0x10, 0xff, 0x00]);
    }
}
