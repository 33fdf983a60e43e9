use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Numeric resource identifiers assigned by the REST backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one live workout lobby session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InvitationId(pub Uuid);

impl InvitationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvitationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvitationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of the managed pub/sub connection.
///
/// Transitions are monotonic within one connection attempt; only a
/// successful connect or a user-triggered manual reconnect leaves
/// `MaxRetriesReached`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    MaxRetriesReached,
}

/// The three pub/sub channel variants.  Private and presence channels
/// require an HTTP auth exchange before subscribing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    /// Full wire name for a channel of this kind:
    /// public channels are unprefixed, private channels carry `private-`,
    /// presence channels carry `presence-`.
    pub fn wire_name(&self, name: &str) -> String {
        match self {
            ChannelKind::Public => name.to_string(),
            ChannelKind::Private => format!("private-{name}"),
            ChannelKind::Presence => format!("presence-{name}"),
        }
    }

    /// Classify a full wire name back into its kind.
    pub fn from_wire_name(full: &str) -> ChannelKind {
        if full.starts_with("presence-") {
            ChannelKind::Presence
        } else if full.starts_with("private-") {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    /// Whether subscribing requires the broadcasting-auth exchange.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, ChannelKind::Public)
    }
}

/// One chat message inside a lobby, unique by `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LobbyChatMessage {
    pub message_id: u64,
    pub user_id: UserId,
    pub user_name: String,
    pub message: String,
    /// Unix epoch seconds.
    pub timestamp_seconds: i64,
    #[serde(default)]
    pub is_system_message: bool,
}

/// Snapshot of one lobby as returned by `fetch-lobby-state`.
///
/// `version` increases monotonically on the server; the polling fallback
/// uses it to detect change without diffing content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LobbyState {
    pub session_id: SessionId,
    pub version: u64,
    pub members: Vec<UserId>,
    pub chat: Vec<LobbyChatMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_wire_names() {
        assert_eq!(ChannelKind::Public.wire_name("leaderboard"), "leaderboard");
        assert_eq!(ChannelKind::Private.wire_name("group.7"), "private-group.7");
        assert_eq!(ChannelKind::Presence.wire_name("online"), "presence-online");
    }

    #[test]
    fn test_channel_kind_from_wire_name() {
        assert_eq!(
            ChannelKind::from_wire_name("presence-online"),
            ChannelKind::Presence
        );
        assert_eq!(
            ChannelKind::from_wire_name("private-group.7"),
            ChannelKind::Private
        );
        assert_eq!(
            ChannelKind::from_wire_name("leaderboard"),
            ChannelKind::Public
        );
    }

    #[test]
    fn test_auth_requirement() {
        assert!(!ChannelKind::Public.requires_auth());
        assert!(ChannelKind::Private.requires_auth());
        assert!(ChannelKind::Presence.requires_auth());
    }
}
