//! Typed views over cached records.
//!
//! The cache stores [`Record`]s; the rendering layer usually wants these.
//! Unknown fields are ignored, missing optional fields default.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::EntityId;
use crate::record::Record;

/// One spreadsheet row. Cell values are dynamic, keyed by column key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: EntityId,
    pub sheet_id: EntityId,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub row_order: f64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Row {
    /// Cell value as text, if the cell holds a string.
    pub fn cell(&self, column: &str) -> Option<&str> {
        self.data.get(column).and_then(Value::as_str)
    }
}

impl TryFrom<&Record> for Row {
    type Error = serde_json::Error;

    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        record.decode()
    }
}

/// An automation rule: when `trigger_column` becomes `trigger_value`, run
/// `action_type` with `action_config`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRule {
    pub id: EntityId,
    pub sheet_id: EntityId,
    pub trigger_column: String,
    pub trigger_value: String,
    pub action_type: String,
    #[serde(default)]
    pub action_config: Map<String, Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub created_at: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl TryFrom<&Record> for AgentRule {
    type Error = serde_json::Error;

    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        record.decode()
    }
}

/// A rule execution log line. Pushed on the sheet channel, never cached as
/// an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentLog {
    pub id: EntityId,
    pub rule_id: EntityId,
    #[serde(default)]
    pub row_id: Option<EntityId>,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "timestamp")]
    pub created_at: Option<String>,
}
