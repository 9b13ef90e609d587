use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::FieldPath;
use crate::value::{FirestoreValue, ValueKind};

/// An ordered map of field name to value; document bodies are map values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a (possibly nested) field. Returns `None` when any step of the
    /// path is absent or a non-map intermediate value is hit.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let mut current = self;
        let (last, init) = path.segments().split_last()?;
        for segment in init {
            match current.fields.get(segment).map(FirestoreValue::kind) {
                Some(ValueKind::Map(map)) => current = map,
                _ => return None,
            }
        }
        current.fields.get(last)
    }

    /// Sets a (possibly nested) field, creating intermediate maps as needed.
    /// Non-map intermediate values are replaced.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let (last, init) = path
            .segments()
            .split_last()
            .expect("FieldPath always has at least one segment");
        let mut current = &mut self.fields;
        for segment in init {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));
            if !matches!(entry.kind(), ValueKind::Map(_)) {
                *entry = FirestoreValue::from_map(BTreeMap::new());
            }
            match entry.kind_mut() {
                ValueKind::Map(map) => current = map.fields_mut(),
                _ => unreachable!("entry was just replaced with a map"),
            }
        }
        current.insert(last.clone(), value);
    }

    /// Deletes a (possibly nested) field if present.
    pub fn delete(&mut self, path: &FieldPath) {
        let (last, init) = path
            .segments()
            .split_last()
            .expect("FieldPath always has at least one segment");
        let mut current = &mut self.fields;
        for segment in init {
            match current.get_mut(segment).map(FirestoreValue::kind_mut) {
                Some(ValueKind::Map(map)) => current = map.fields_mut(),
                _ => return,
            }
        }
        current.remove(last);
    }

    pub(crate) fn fields_mut(&mut self) -> &mut BTreeMap<String, FirestoreValue> {
        &mut self.fields
    }
}
