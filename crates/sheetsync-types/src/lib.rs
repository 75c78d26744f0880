//! Shared record, query and push-event types for sheetsync.
//!
//! A pure leaf crate: no I/O, no async. Everything the cache, the optimistic
//! coordinator and the event stream agree on lives here.
//!
//! # Overview
//!
//! ```text
//! Workspace (EntityId)
//!     └── Sheet (EntityId)          QueryKey::sheets(workspace)
//!           ├── Row (EntityId)      QueryKey::rows(sheet)
//!           └── AgentRule (EntityId) QueryKey::agent_rules(sheet)
//!                 └── AgentLog      push-only, never cached as an entity
//! ```
//!
//! # Key Types
//!
//! |-------------------|------------------------------------------------|
//! | Type              | Purpose                                        |
//! |-------------------|------------------------------------------------|
//! | [`EntityId`]      | Opaque server-assigned record identifier       |
//! | [`Record`]        | A server-owned record: id + field map          |
//! | [`FieldDelta`]    | Proposed partial update for one record         |
//! | [`QueryKey`]      | Cache key: collection + scope                  |
//! | [`SheetEvent`]    | Typed push notification from the sheet channel |
//! | [`Row`]           | Typed view of a row record                     |
//! | [`AgentRule`]     | Typed view of an automation rule record        |
//! | [`AgentLog`]      | Automation log entry (push side-channel)       |
//! |-------------------|------------------------------------------------|

pub mod event;
pub mod ids;
pub mod query;
pub mod record;
pub mod views;

pub use event::{EventKind, EventParseError, SheetEvent};
pub use ids::EntityId;
pub use query::{Collection, QueryKey};
pub use record::{FieldDelta, Record};
pub use views::{AgentLog, AgentRule, Row};
