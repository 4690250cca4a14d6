//! Conversation routing keys and local row identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A community (open group) room on a community server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommunityAddress {
    /// Base URL of the community server.
    pub server_url: String,
    /// Room token on that server.
    pub room: String,
}

impl CommunityAddress {
    /// Create a new community address.
    #[must_use]
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            room: room.into(),
        }
    }

    /// Key of the serial execution lane for everything touching this room.
    ///
    /// Every job that operates on a community must derive its lane key
    /// through this function so they stay mutually ordered.
    #[must_use]
    pub fn lane_key(&self) -> String {
        format!("{}.{}", self.server_url, self.room)
    }

    /// Parse the legacy `server.room` form, splitting on the last dot.
    #[must_use]
    pub fn from_legacy_id(id: &str) -> Option<Self> {
        let split = id.rfind('.')?;
        if split + 1 >= id.len() {
            return None;
        }
        Some(Self::new(&id[..split], &id[split + 1..]))
    }
}

impl fmt::Display for CommunityAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_url, self.room)
    }
}

/// Routing key that identifies a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Address {
    /// One-to-one conversation with an account.
    Contact(String),
    /// Closed group identified by its public key.
    Group(String),
    /// Community room.
    Community(CommunityAddress),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contact(id) => write!(f, "contact:{id}"),
            Self::Group(id) => write!(f, "group:{id}"),
            Self::Community(community) => write!(f, "community:{community}"),
        }
    }
}

/// Local identifier of a conversation (thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local identifier of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
