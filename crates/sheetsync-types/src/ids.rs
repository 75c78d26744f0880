//! Opaque record identifiers.
//!
//! The server hands out UUIDs today, but the client never interprets them:
//! an [`EntityId`] is compared, hashed, and echoed back in URLs. Nothing else.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A server-assigned record identifier.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines only, never a lookup key.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_truncates_long_ids() {
        let id = EntityId::new("0f8e4c2a-1111-2222-3333-444455556666");
        assert_eq!(id.short(), "0f8e4c2a");
        assert_eq!(EntityId::new("r1").short(), "r1");
    }

    #[test]
    fn test_serde_is_transparent() {
        let id: EntityId = serde_json::from_str("\"row-7\"").unwrap();
        assert_eq!(id, EntityId::from("row-7"));
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"row-7\"");
    }
}
