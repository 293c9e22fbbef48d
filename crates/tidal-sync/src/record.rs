//! Entity records: the authoritative snapshot of one networked object.
//!
//! A record is a fixed header (`id`, `owner`, `type_name`) plus an ordered map
//! of named fields. Merge logic walks the field map explicitly and never
//! touches the header; typed game objects map themselves onto records through
//! the hand-written [`Replicated`] visitor.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::client::ClientId;

/// Field names reserved for the record header. Merge logic skips them even
/// if a payload carries a field with one of these names.
pub const HEADER_FIELDS: [&str; 3] = ["id", "owner", "type_name"];

/// Unique, immutable identity of a networked entity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Value of one replicated field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    /// Numeric value; the only kind that can interpolate.
    Number(f64),
    /// Free-form text.
    Text(String),
    /// Boolean flag.
    Flag(bool),
}

impl FieldValue {
    /// The numeric value, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The text value, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The flag value, if this is a flag.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Flag(b)
    }
}

/// Snapshot of one networked object's authoritative fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EntityRecord {
    id: EntityId,
    owner: ClientId,
    type_name: String,
    #[serde(default)]
    fields: BTreeMap<String, FieldValue>,
}

impl EntityRecord {
    /// Create a record with an empty field set.
    pub fn new(id: EntityId, owner: ClientId, type_name: impl Into<String>) -> Self {
        Self {
            id,
            owner,
            type_name: type_name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field assignment.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Entity identity.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Client allowed to mutate this record under normal rules.
    pub fn owner(&self) -> ClientId {
        self.owner
    }

    /// Consumer-facing type tag.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Look up a field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Look up a numeric field.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_number)
    }

    /// Assign a field, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Iterate fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate fields merge logic may touch (header names excluded).
    pub fn mutable_fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields().filter(|(name, _)| !HEADER_FIELDS.contains(name))
    }

    /// Number of fields, header excluded.
    pub fn field_count(&self) -> usize {
        self.mutable_fields().count()
    }
}

/// Explicit field visitor for typed game objects.
///
/// Implementors list their replicated fields by hand; there is no runtime
/// reflection. `visit_fields` must report every field `assign_field` accepts.
pub trait Replicated {
    /// Type tag written into [`EntityRecord::type_name`].
    fn type_name(&self) -> &'static str;

    /// Report every replicated field as `(name, value)`.
    fn visit_fields(&self, visit: &mut dyn FnMut(&'static str, FieldValue));

    /// Assign one field. Returns `false` when the name is not replicated or
    /// the value has the wrong kind.
    fn assign_field(&mut self, name: &str, value: &FieldValue) -> bool;

    /// Snapshot this object into a record.
    fn to_record(&self, id: EntityId, owner: ClientId) -> EntityRecord {
        let mut record = EntityRecord::new(id, owner, self.type_name());
        self.visit_fields(&mut |name: &'static str, value: FieldValue| record.set(name, value));
        record
    }

    /// Copy every matching field from `record` into this object.
    fn read_record(&mut self, record: &EntityRecord) {
        for (name, value) in record.mutable_fields() {
            self.assign_field(name, value);
        }
    }
}
