use crate::local::index_byte_encoder::DirectionalIndexByteEncoder;
use crate::value::{FirestoreValue, ValueKind};

// Type labels mirror the backend's storage format so that cross-type order
// matches value comparison. Gaps are left for types this client never
// stores.
const INDEX_TYPE_NULL: f64 = 5.0;
const INDEX_TYPE_BOOLEAN: f64 = 10.0;
const INDEX_TYPE_NAN: f64 = 13.0;
const INDEX_TYPE_NUMBER: f64 = 15.0;
const INDEX_TYPE_TIMESTAMP: f64 = 20.0;
const INDEX_TYPE_STRING: f64 = 25.0;
const INDEX_TYPE_BLOB: f64 = 30.0;
const INDEX_TYPE_REFERENCE: f64 = 37.0;
const INDEX_TYPE_GEOPOINT: f64 = 45.0;
const INDEX_TYPE_ARRAY: f64 = 50.0;
const INDEX_TYPE_MAP: f64 = 55.0;
const INDEX_TYPE_REFERENCE_SEGMENT: f64 = 60.0;

// Internal sentinel for unbounded upper positions; never stored.
const INDEX_TYPE_MAX: f64 = 9_007_199_254_740_991.0;

// Terminates every variable-length value. Must be smaller than all type
// labels so a shorter value sorts before its extensions.
const NOT_TRUNCATED: f64 = 2.0;

/// Writes `value` into `encoder` followed by the infinity marker that splits
/// consecutive index values.
pub fn write_index_value(value: &FirestoreValue, encoder: &mut DirectionalIndexByteEncoder<'_>) {
    write_index_value_aux(value, encoder);
    encoder.write_infinity();
}

fn write_index_value_aux(value: &FirestoreValue, encoder: &mut DirectionalIndexByteEncoder<'_>) {
    if value.is_max_value() {
        encoder.write_number(INDEX_TYPE_MAX);
        return;
    }
    match value.kind() {
        ValueKind::Null => encoder.write_number(INDEX_TYPE_NULL),
        ValueKind::Boolean(b) => {
            encoder.write_number(INDEX_TYPE_BOOLEAN);
            encoder.write_number(if *b { 1.0 } else { 0.0 });
        }
        ValueKind::Integer(i) => {
            encoder.write_number(INDEX_TYPE_NUMBER);
            encoder.write_number(*i as f64);
        }
        ValueKind::Double(d) => {
            if d.is_nan() {
                encoder.write_number(INDEX_TYPE_NAN);
            } else {
                encoder.write_number(INDEX_TYPE_NUMBER);
                // -0.0 and 0.0 index identically.
                encoder.write_number(if *d == 0.0 { 0.0 } else { *d });
            }
        }
        ValueKind::Timestamp(ts) => {
            encoder.write_number(INDEX_TYPE_TIMESTAMP);
            encoder.write_number(ts.seconds as f64);
            encoder.write_number(ts.nanos as f64);
        }
        ValueKind::String(s) => {
            encoder.write_number(INDEX_TYPE_STRING);
            encoder.write_string(s);
            encoder.write_number(NOT_TRUNCATED);
        }
        ValueKind::Bytes(b) => {
            encoder.write_number(INDEX_TYPE_BLOB);
            encoder.write_bytes(b.as_slice());
            encoder.write_number(NOT_TRUNCATED);
        }
        ValueKind::Reference(path) => {
            encoder.write_number(INDEX_TYPE_REFERENCE);
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                encoder.write_number(INDEX_TYPE_REFERENCE_SEGMENT);
                encoder.write_string(segment);
            }
        }
        ValueKind::GeoPoint(geo) => {
            encoder.write_number(INDEX_TYPE_GEOPOINT);
            encoder.write_number(geo.latitude);
            encoder.write_number(geo.longitude);
        }
        ValueKind::Array(array) => {
            encoder.write_number(INDEX_TYPE_ARRAY);
            for element in array.values() {
                write_index_value_aux(element, encoder);
            }
            encoder.write_number(NOT_TRUNCATED);
        }
        ValueKind::Map(map) => {
            encoder.write_number(INDEX_TYPE_MAP);
            for (key, field) in map.fields() {
                encoder.write_number(INDEX_TYPE_STRING);
                encoder.write_string(key);
                encoder.write_number(NOT_TRUNCATED);
                write_index_value_aux(field, encoder);
            }
            encoder.write_number(NOT_TRUNCATED);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::index_byte_encoder::IndexByteEncoder;
    use crate::model::{IndexKind, Timestamp};

    fn encode(value: &FirestoreValue, kind: IndexKind) -> Vec<u8> {
        let mut encoder = IndexByteEncoder::new();
        write_index_value(value, &mut encoder.for_kind(kind));
        encoder.encoded_bytes()
    }

    fn assert_ascending_order(values: &[FirestoreValue]) {
        for pair in values.windows(2) {
            assert!(
                encode(&pair[0], IndexKind::Ascending) < encode(&pair[1], IndexKind::Ascending),
                "expected {:?} to encode before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn cross_type_order_matches_value_comparison() {
        assert_ascending_order(&[
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_bool(true),
            FirestoreValue::nan(),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_double(1.5),
            FirestoreValue::from_integer(2),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_reference("coll/doc"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(Default::default()),
            FirestoreValue::max_value(),
        ]);
    }

    #[test]
    fn string_prefixes_sort_before_extensions() {
        assert_ascending_order(&[
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("ab"),
            FirestoreValue::from_string("b"),
        ]);
    }

    #[test]
    fn arrays_sort_elementwise_then_by_length() {
        assert_ascending_order(&[
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]),
            FirestoreValue::from_array(vec![
                FirestoreValue::from_integer(1),
                FirestoreValue::from_integer(2),
            ]),
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(2)]),
        ]);
    }

    #[test]
    fn descending_encoding_inverts_order() {
        let one = encode(&FirestoreValue::from_integer(1), IndexKind::Descending);
        let two = encode(&FirestoreValue::from_integer(2), IndexKind::Descending);
        assert!(two < one);
    }

    #[test]
    fn negative_zero_indexes_like_zero() {
        assert_eq!(
            encode(&FirestoreValue::from_double(-0.0), IndexKind::Ascending),
            encode(&FirestoreValue::from_double(0.0), IndexKind::Ascending)
        );
    }

    #[test]
    fn references_sort_by_segment() {
        assert_ascending_order(&[
            FirestoreValue::from_reference("coll/a"),
            FirestoreValue::from_reference("coll/a/sub/b"),
            FirestoreValue::from_reference("coll/b"),
        ]);
    }
}
