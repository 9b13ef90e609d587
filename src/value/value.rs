use std::cmp::Ordering;
use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::model::Timestamp;
use crate::value::{ArrayValue, BytesValue, GeoPoint, MapValue};

/// Relative order of backend value types. Values of different types compare by
/// type order alone; comparison filters are only valid between values of equal
/// type order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null,
    Boolean,
    Number,
    Timestamp,
    String,
    Blob,
    Reference,
    GeoPoint,
    Array,
    Map,
    /// Internal sentinel sorting after every real value; used only for
    /// unbounded upper index positions, never stored.
    Max,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FirestoreValue {
    kind: ValueKind,
}

const MAX_VALUE_TYPE_KEY: &str = "__type__";
const MAX_VALUE_TYPE: &str = "__max__";

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn nan() -> Self {
        Self::from_double(f64::NAN)
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    /// The largest possible value; an internal sentinel used as an unbounded
    /// upper index position.
    pub fn max_value() -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            MAX_VALUE_TYPE_KEY.to_string(),
            FirestoreValue::from_string(MAX_VALUE_TYPE),
        );
        Self::from_map(fields)
    }

    /// The smallest possible value, which is null.
    pub fn min_value() -> Self {
        Self::null()
    }

    pub fn is_max_value(&self) -> bool {
        match &self.kind {
            ValueKind::Map(map) => {
                map.fields().len() == 1
                    && map.fields().get(MAX_VALUE_TYPE_KEY)
                        == Some(&FirestoreValue::from_string(MAX_VALUE_TYPE))
            }
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(d) if d.is_nan())
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ValueKind::Array(_))
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut ValueKind {
        &mut self.kind
    }

    pub fn type_order(&self) -> TypeOrder {
        if self.is_max_value() {
            return TypeOrder::Max;
        }
        match &self.kind {
            ValueKind::Null => TypeOrder::Null,
            ValueKind::Boolean(_) => TypeOrder::Boolean,
            ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
            ValueKind::Timestamp(_) => TypeOrder::Timestamp,
            ValueKind::String(_) => TypeOrder::String,
            ValueKind::Bytes(_) => TypeOrder::Blob,
            ValueKind::Reference(_) => TypeOrder::Reference,
            ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
            ValueKind::Array(_) => TypeOrder::Array,
            ValueKind::Map(_) => TypeOrder::Map,
        }
    }

    /// Total order over all values: first by type order, then within the type.
    /// NaN sorts before every other number and equal to itself.
    pub fn compare_to(&self, other: &Self) -> Ordering {
        let left_order = self.type_order();
        let right_order = other.type_order();
        if left_order != right_order {
            return left_order.cmp(&right_order);
        }

        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
            (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
            (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
            (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
            (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
            (ValueKind::Reference(a), ValueKind::Reference(b)) => a.cmp(b),
            (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare_to(b),
            (ValueKind::Array(a), ValueKind::Array(b)) => Self::compare_arrays(a, b),
            (ValueKind::Map(a), ValueKind::Map(b)) => Self::compare_maps(a, b),
            _ => Self::compare_numbers(self.as_number(), other.as_number()),
        }
    }

    fn as_number(&self) -> f64 {
        match &self.kind {
            ValueKind::Integer(i) => *i as f64,
            ValueKind::Double(d) => *d,
            _ => unreachable!("as_number called on non-number value"),
        }
    }

    fn compare_numbers(left: f64, right: f64) -> Ordering {
        if left.is_nan() {
            if right.is_nan() {
                Ordering::Equal
            } else {
                Ordering::Less
            }
        } else if right.is_nan() {
            Ordering::Greater
        } else {
            left.partial_cmp(&right).unwrap_or(Ordering::Equal)
        }
    }

    fn compare_arrays(left: &ArrayValue, right: &ArrayValue) -> Ordering {
        for (l, r) in left.values().iter().zip(right.values().iter()) {
            match l.compare_to(r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        left.len().cmp(&right.len())
    }

    fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
        let mut left_iter = left.fields().iter();
        let mut right_iter = right.fields().iter();
        loop {
            match (left_iter.next(), right_iter.next()) {
                (Some((lk, lv)), Some((rk, rv))) => {
                    match lk.cmp(rk).then_with(|| lv.compare_to(rv)) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
                (None, None) => return Ordering::Equal,
            }
        }
    }

    /// The smallest value sharing this value's type order. Used when a range
    /// filter constrains only one side of an index segment.
    pub fn type_lower_bound(&self) -> FirestoreValue {
        match self.type_order() {
            TypeOrder::Null => FirestoreValue::null(),
            TypeOrder::Boolean => FirestoreValue::from_bool(false),
            TypeOrder::Number => FirestoreValue::nan(),
            TypeOrder::Timestamp => FirestoreValue::from_timestamp(Timestamp::new(i64::MIN, 0)),
            TypeOrder::String => FirestoreValue::from_string(""),
            TypeOrder::Blob => FirestoreValue::from_bytes(BytesValue::empty()),
            TypeOrder::Reference => FirestoreValue::from_reference(""),
            TypeOrder::GeoPoint => FirestoreValue::from_geo_point(GeoPoint::new(-90.0, -180.0)),
            TypeOrder::Array => FirestoreValue::from_array(Vec::new()),
            TypeOrder::Map => FirestoreValue::from_map(BTreeMap::new()),
            TypeOrder::Max => FirestoreValue::max_value(),
        }
    }

    /// The smallest value sorting after every value of this value's type
    /// order, i.e. the lower bound of the next type.
    pub fn type_upper_bound(&self) -> FirestoreValue {
        match self.type_order() {
            TypeOrder::Null => FirestoreValue::from_bool(false),
            TypeOrder::Boolean => FirestoreValue::nan(),
            TypeOrder::Number => FirestoreValue::from_timestamp(Timestamp::new(i64::MIN, 0)),
            TypeOrder::Timestamp => FirestoreValue::from_string(""),
            TypeOrder::String => FirestoreValue::from_bytes(BytesValue::empty()),
            TypeOrder::Blob => FirestoreValue::from_reference(""),
            TypeOrder::Reference => {
                FirestoreValue::from_geo_point(GeoPoint::new(-90.0, -180.0))
            }
            TypeOrder::GeoPoint => FirestoreValue::from_array(Vec::new()),
            TypeOrder::Array => FirestoreValue::from_map(BTreeMap::new()),
            TypeOrder::Map | TypeOrder::Max => FirestoreValue::max_value(),
        }
    }

    /// Stable textual form used to build target canonical ids.
    pub fn canonical_id(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(b) => b.to_string(),
            ValueKind::Integer(i) => i.to_string(),
            ValueKind::Double(d) => d.to_string(),
            ValueKind::Timestamp(t) => format!("time({},{})", t.seconds, t.nanos),
            ValueKind::String(s) => s.clone(),
            ValueKind::Bytes(b) => BASE64_STANDARD.encode(b.as_slice()),
            ValueKind::Reference(path) => path.clone(),
            ValueKind::GeoPoint(g) => format!("geo({},{})", g.latitude, g.longitude),
            ValueKind::Array(array) => {
                let inner: Vec<String> =
                    array.values().iter().map(|v| v.canonical_id()).collect();
                format!("[{}]", inner.join(","))
            }
            ValueKind::Map(map) => {
                let inner: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(k, v)| format!("{}:{}", k, v.canonical_id()))
                    .collect();
                format!("{{{}}}", inner.join(","))
            }
        }
    }
}
