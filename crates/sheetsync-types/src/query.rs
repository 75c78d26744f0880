//! Cache keys.
//!
//! A [`QueryKey`] names one cached collection: "rows of sheet S", "rules of
//! sheet S", "sheets of workspace W", or the flat workspace list. Everything
//! under one key is replaced or patched together.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::EntityId;

/// Which kind of record a collection holds.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Collection {
    Workspaces,
    Sheets,
    Rows,
    #[strum(to_string = "agent_rules", serialize = "rules")]
    AgentRules,
}

/// Cache identity: a collection plus the parent it is scoped to.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryKey {
    pub collection: Collection,
    pub scope: Option<EntityId>,
}

impl QueryKey {
    pub fn workspaces() -> Self {
        Self {
            collection: Collection::Workspaces,
            scope: None,
        }
    }

    pub fn sheets(workspace_id: impl Into<EntityId>) -> Self {
        Self {
            collection: Collection::Sheets,
            scope: Some(workspace_id.into()),
        }
    }

    pub fn rows(sheet_id: impl Into<EntityId>) -> Self {
        Self {
            collection: Collection::Rows,
            scope: Some(sheet_id.into()),
        }
    }

    pub fn agent_rules(sheet_id: impl Into<EntityId>) -> Self {
        Self {
            collection: Collection::AgentRules,
            scope: Some(sheet_id.into()),
        }
    }

    /// Whether this key belongs to the given parent scope.
    pub fn in_scope(&self, scope: &EntityId) -> bool {
        self.scope.as_ref() == Some(scope)
    }

    /// Keys kept current by a sheet's push channel.
    pub fn for_sheet(sheet_id: &EntityId) -> [QueryKey; 2] {
        [QueryKey::rows(sheet_id.clone()), QueryKey::agent_rules(sheet_id.clone())]
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}/{}", self.collection, scope),
            None => write!(f, "{}", self.collection),
        }
    }
}
