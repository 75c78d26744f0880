//! Server-owned records and partial updates.
//!
//! A [`Record`] is deliberately schemaless: an id plus whatever fields the
//! server sent. Typed views ([`Row`](crate::Row), [`AgentRule`](crate::AgentRule))
//! decode from it on demand. Versioning is implicit in `updated_at`; the client
//! never compares versions, it refetches.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::EntityId;

/// A server-owned record: stable id plus a mutable field map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: EntityId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter (mostly for tests and fixtures).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up a nested field, e.g. `record.get_path(&["data", "status"])`.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut value = self.fields.get(*first)?;
        for key in rest {
            value = value.as_object()?.get(*key)?;
        }
        Some(value)
    }

    /// Last-write timestamp as sent by the server, if any.
    pub fn updated_at(&self) -> Option<&str> {
        self.fields.get("updated_at").and_then(Value::as_str)
    }

    /// Apply a partial update in place.
    ///
    /// Each delta key replaces the field, except object-into-object, which
    /// merges one level deep so `{"data": {"status": "x"}}` only touches
    /// `data.status`. The `id` key is never overwritten.
    pub fn apply(&mut self, delta: &FieldDelta) {
        for (key, value) in delta.iter() {
            if key == "id" {
                continue;
            }
            match (self.fields.get_mut(key), value) {
                (Some(Value::Object(existing)), Value::Object(patch)) => {
                    for (k, v) in patch {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                _ => {
                    self.fields.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Decode into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::to_value(self).and_then(serde_json::from_value)
    }
}

/// A proposed partial update: field name → new value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldDelta(Map<String, Value>);

impl FieldDelta {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Set a top-level field.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Delta touching only the given cells of a row's `data` map.
    pub fn row_data<K, V, I>(cells: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let data: Map<String, Value> =
            cells.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self::new().set("data", Value::Object(data))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Map<String, Value>> for FieldDelta {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
