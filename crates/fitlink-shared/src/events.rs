//! Decoded real-time events.
//!
//! Every event name observed on a channel maps to exactly one tagged
//! variant, decoded once at the connection boundary.  Downstream components
//! (presence tracker, invitation queue, lobby store) only ever match on
//! variants; no dynamic shape checking happens past this point.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::invitation::{Invitation, WorkoutPayload};
use crate::types::{GroupId, InvitationId, LobbyChatMessage, SessionId, UserId};

/// One event delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    NotificationCreated { payload: Value },
    UnreadCountUpdated { count: u64 },
    /// A workout invitation for this user.  Both the per-user queued path
    /// and the legacy per-group broadcast fold into this variant; the queue
    /// is the single canonical consumer.
    WorkoutInvitation(Invitation),
    GroupMembersUpdated { group_id: GroupId, members: Vec<UserId> },
    GroupStatsUpdated { group_id: GroupId, stats: Value },
    LobbyChatMessage(LobbyChatMessage),
    /// Full membership payload of a presence channel, delivered on
    /// subscription success.  Always replaces the previous set.
    PresenceInitial { members: Vec<UserId> },
    PresenceJoined { user: UserId },
    PresenceLeft { user: UserId },
    /// An event name we do not handle.  Logged by the dispatcher, never an
    /// error: the backend adds event types faster than clients update.
    Unknown { event: String },
}

/// Wire shape of an invitation event payload.  `expires_at` arrives as
/// absolute Unix epoch seconds.
#[derive(Debug, Deserialize)]
struct InvitationWire {
    invitation_id: InvitationId,
    session_id: SessionId,
    group_id: GroupId,
    initiator_id: UserId,
    initiator_name: String,
    workout: WorkoutPayload,
    expires_at: i64,
}

impl InvitationWire {
    fn into_invitation(self, received_at: DateTime<Utc>) -> Option<Invitation> {
        let expires_at = Utc.timestamp_opt(self.expires_at, 0).single()?;
        Some(Invitation {
            invitation_id: self.invitation_id,
            session_id: self.session_id,
            group_id: self.group_id,
            initiator_id: self.initiator_id,
            initiator_name: self.initiator_name,
            workout: self.workout,
            expires_at,
            received_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GroupMembersWire {
    group_id: GroupId,
    #[serde(default)]
    members: Vec<UserId>,
}

impl RealtimeEvent {
    /// Decode an application event by name.  `received_at` stamps
    /// invitations so queue ordering reflects arrival.
    pub fn decode(event: &str, data: &Value, received_at: DateTime<Utc>) -> RealtimeEvent {
        match event {
            "notification.created" => RealtimeEvent::NotificationCreated {
                payload: data.clone(),
            },
            "unread.count.updated" => match data.get("count").and_then(Value::as_u64) {
                Some(count) => RealtimeEvent::UnreadCountUpdated { count },
                None => RealtimeEvent::Unknown {
                    event: event.to_string(),
                },
            },
            "UserWorkoutInvitation" | "GroupWorkoutInvitation" => {
                match serde_json::from_value::<InvitationWire>(data.clone())
                    .ok()
                    .and_then(|w| w.into_invitation(received_at))
                {
                    Some(invitation) => RealtimeEvent::WorkoutInvitation(invitation),
                    None => RealtimeEvent::Unknown {
                        event: event.to_string(),
                    },
                }
            }
            "group.members.updated" => {
                match serde_json::from_value::<GroupMembersWire>(data.clone()) {
                    Ok(wire) => RealtimeEvent::GroupMembersUpdated {
                        group_id: wire.group_id,
                        members: wire.members,
                    },
                    Err(_) => RealtimeEvent::Unknown {
                        event: event.to_string(),
                    },
                }
            }
            "group.stats.updated" => match data.get("group_id").and_then(Value::as_u64) {
                Some(group_id) => RealtimeEvent::GroupStatsUpdated {
                    group_id: GroupId(group_id),
                    stats: data.clone(),
                },
                None => RealtimeEvent::Unknown {
                    event: event.to_string(),
                },
            },
            "lobby.chat.message" => {
                match serde_json::from_value::<LobbyChatMessage>(data.clone()) {
                    Ok(message) => RealtimeEvent::LobbyChatMessage(message),
                    Err(_) => RealtimeEvent::Unknown {
                        event: event.to_string(),
                    },
                }
            }
            other => RealtimeEvent::Unknown {
                event: other.to_string(),
            },
        }
    }

    /// Decode the initial-members payload of a presence
    /// `subscription_succeeded` frame: `{"presence":{"ids":[...],...}}`.
    pub fn presence_initial(data: &Value) -> RealtimeEvent {
        let members = data
            .get("presence")
            .and_then(|p| p.get("ids"))
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(parse_user_id).collect())
            .unwrap_or_default();
        RealtimeEvent::PresenceInitial { members }
    }

    /// Decode a `member_added` / `member_removed` payload:
    /// `{"user_id":"42","user_info":{...}}`.
    pub fn presence_member(data: &Value, joined: bool) -> Option<RealtimeEvent> {
        let user = data.get("user_id").and_then(parse_user_id)?;
        Some(if joined {
            RealtimeEvent::PresenceJoined { user }
        } else {
            RealtimeEvent::PresenceLeft { user }
        })
    }
}

/// Presence payloads carry user ids as strings or numbers depending on the
/// broadcaster version.
fn parse_user_id(value: &Value) -> Option<UserId> {
    match value {
        Value::Number(n) => n.as_u64().map(UserId),
        Value::String(s) => s.parse().ok().map(UserId),
        _ => None,
    }
}
