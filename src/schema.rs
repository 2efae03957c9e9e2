/// Output schema and per-source records
///
/// Algorithms extend a shared `Schema` at construction time and keep the typed
/// `Key`s they get back. Records are laid out against the schema and are
/// written through those keys only.
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{MeasError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    F64,
    I32,
    Flag,
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::F64 => "f64",
            FieldKind::I32 => "i32",
            FieldKind::Flag => "flag",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    F64(f64),
    I32(i32),
    Flag(bool),
    Unset,
}

/// Rust types that can be stored in a record field
pub trait FieldType: Copy + Send + Sync + 'static {
    const KIND: FieldKind;

    /// Value read back from a never-written field
    fn unset() -> Self;

    fn into_value(self) -> FieldValue;

    fn from_value(value: &FieldValue) -> Option<Self>;
}

impl FieldType for f64 {
    const KIND: FieldKind = FieldKind::F64;

    fn unset() -> Self {
        f64::NAN
    }

    fn into_value(self) -> FieldValue {
        FieldValue::F64(self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::F64(v) => Some(*v),
            _ => None,
        }
    }
}

impl FieldType for i32 {
    const KIND: FieldKind = FieldKind::I32;

    fn unset() -> Self {
        0
    }

    fn into_value(self) -> FieldValue {
        FieldValue::I32(self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::I32(v) => Some(*v),
            _ => None,
        }
    }
}

impl FieldType for bool {
    const KIND: FieldKind = FieldKind::Flag;

    fn unset() -> Self {
        false
    }

    fn into_value(self) -> FieldValue {
        FieldValue::Flag(self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Flag(v) => Some(*v),
            _ => None,
        }
    }
}

/// Typed handle to a schema field
#[derive(Debug)]
pub struct Key<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> Key<T> {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FieldDef {
    pub name: String,
    pub doc: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<FieldDef>,
    by_name: HashMap<String, usize>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field; names are unique across the whole schema
    pub fn add_field<T: FieldType>(&mut self, name: &str, doc: &str) -> Result<Key<T>> {
        if self.by_name.contains_key(name) {
            return Err(MeasError::DuplicateField(name.to_string()));
        }
        let index = self.fields.len();
        self.fields.push(FieldDef {
            name: name.to_string(),
            doc: doc.to_string(),
            kind: T::KIND,
        });
        self.by_name.insert(name.to_string(), index);
        Ok(Key {
            index,
            _marker: PhantomData,
        })
    }

    pub fn find<T: FieldType>(&self, name: &str) -> Result<Key<T>> {
        let index = *self.by_name.get(name).ok_or_else(|| MeasError::NotFound {
            registry: "schema",
            name: name.to_string(),
        })?;
        if self.fields[index].kind != T::KIND {
            return Err(MeasError::FieldTypeMismatch {
                name: name.to_string(),
                expected: T::KIND.name(),
            });
        }
        Ok(Key {
            index,
            _marker: PhantomData,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// One source: identifier, detection peak, and measured field values
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub id: u64,
    pub peak_x: i32,
    pub peak_y: i32,
    values: Vec<FieldValue>,
}

impl SourceRecord {
    pub fn new(schema: &Schema, id: u64, peak_x: i32, peak_y: i32) -> Self {
        Self {
            id,
            peak_x,
            peak_y,
            values: vec![FieldValue::Unset; schema.len()],
        }
    }

    pub fn get<T: FieldType>(&self, key: Key<T>) -> T {
        self.values
            .get(key.index)
            .and_then(T::from_value)
            .unwrap_or_else(T::unset)
    }

    pub fn set<T: FieldType>(&mut self, key: Key<T>, value: T) {
        if key.index >= self.values.len() {
            self.values.resize(key.index + 1, FieldValue::Unset);
        }
        self.values[key.index] = value.into_value();
    }

    pub fn is_set<T: FieldType>(&self, key: Key<T>) -> bool {
        !matches!(
            self.values.get(key.index),
            None | Some(FieldValue::Unset)
        )
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// JSON object of every written field, keyed by field name
    pub fn to_json(&self, schema: &Schema) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), serde_json::json!(self.id));
        map.insert("peak".to_string(), serde_json::json!([self.peak_x, self.peak_y]));
        for (field, value) in schema.fields().iter().zip(self.values.iter()) {
            let json = match value {
                FieldValue::F64(v) if v.is_finite() => serde_json::json!(v),
                FieldValue::F64(_) => serde_json::Value::Null,
                FieldValue::I32(v) => serde_json::json!(v),
                FieldValue::Flag(v) => serde_json::json!(v),
                FieldValue::Unset => continue,
            };
            map.insert(field.name.clone(), json);
        }
        serde_json::Value::Object(map)
    }
}

/// Records sharing one frozen schema
#[derive(Debug, Clone)]
pub struct SourceCatalog {
    schema: Arc<Schema>,
    records: Vec<SourceRecord>,
}

impl SourceCatalog {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            records: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn add_source(&mut self, id: u64, peak_x: i32, peak_y: i32) -> &mut SourceRecord {
        self.records
            .push(SourceRecord::new(&self.schema, id, peak_x, peak_y));
        let last = self.records.len() - 1;
        &mut self.records[last]
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [SourceRecord] {
        &mut self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
