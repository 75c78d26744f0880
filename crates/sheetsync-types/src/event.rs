//! Push notifications from a sheet's event channel.
//!
//! Wire format: one JSON object per message with an `event` discriminant.
//!
//! ```text
//! {"event": "row_created", "row": {...full row...}}
//! {"event": "row_updated", "row": {...full row...}}
//! {"event": "row_deleted", "row_id": "..."}      (or {"row": {"id": "..."}})
//! {"event": "agent_log",   "log": {...}}
//! ```
//!
//! Updates always carry the full row, never a delta, so applying one twice is
//! the same as applying it once.

use serde::Deserialize;
use strum::Display;
use thiserror::Error;

use crate::ids::EntityId;
use crate::record::Record;
use crate::views::AgentLog;

/// Failure to turn a channel message into a [`SheetEvent`].
#[derive(Error, Debug)]
pub enum EventParseError {
    #[error("malformed event payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("row_deleted event carries neither row_id nor row.id")]
    MissingDeletedId,
}

/// What a notification does to the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Log,
}

/// A typed change notification.
#[derive(Clone, Debug, PartialEq)]
pub enum SheetEvent {
    RowCreated { row: Record },
    RowUpdated { row: Record },
    RowDeleted { row_id: EntityId },
    AgentLog { log: AgentLog },
}

#[derive(Deserialize)]
struct IdOnly {
    id: EntityId,
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireEvent {
    RowCreated {
        row: Record,
    },
    RowUpdated {
        row: Record,
    },
    RowDeleted {
        #[serde(default)]
        row_id: Option<EntityId>,
        #[serde(default)]
        row: Option<IdOnly>,
    },
    AgentLog {
        log: AgentLog,
    },
}

impl SheetEvent {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, EventParseError> {
        let wire: WireEvent = serde_json::from_str(text)?;
        Ok(match wire {
            WireEvent::RowCreated { row } => SheetEvent::RowCreated { row },
            WireEvent::RowUpdated { row } => SheetEvent::RowUpdated { row },
            WireEvent::RowDeleted { row_id, row } => {
                let row_id = row_id
                    .or(row.map(|r| r.id))
                    .ok_or(EventParseError::MissingDeletedId)?;
                SheetEvent::RowDeleted { row_id }
            }
            WireEvent::AgentLog { log } => SheetEvent::AgentLog { log },
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            SheetEvent::RowCreated { .. } => EventKind::Created,
            SheetEvent::RowUpdated { .. } => EventKind::Updated,
            SheetEvent::RowDeleted { .. } => EventKind::Deleted,
            SheetEvent::AgentLog { .. } => EventKind::Log,
        }
    }

    /// The row this event touches, if it is an entity event.
    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            SheetEvent::RowCreated { row } | SheetEvent::RowUpdated { row } => Some(&row.id),
            SheetEvent::RowDeleted { row_id } => Some(row_id),
            SheetEvent::AgentLog { .. } => None,
        }
    }
}
