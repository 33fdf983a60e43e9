//! Pusher-compatible wire frames.
//!
//! The broadcaster speaks the Pusher WebSocket protocol: every frame is a
//! JSON object `{ event, channel?, data }` where `data` is usually a
//! JSON-encoded *string* (double encoding is part of the protocol).  This
//! module owns all of that shape handling so the rest of the codebase only
//! ever sees typed frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// Frames sent from the client to the broadcaster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Subscribe to a channel.  `auth` carries the signature obtained from
    /// the broadcasting-auth endpoint for private/presence channels.
    Subscribe {
        channel: String,
        auth: Option<String>,
        channel_data: Option<String>,
    },
    Unsubscribe {
        channel: String,
    },
    Ping,
    Pong,
}

impl ClientFrame {
    /// Encode the frame as the JSON text payload of a WebSocket message.
    pub fn to_wire(&self) -> String {
        let value = match self {
            ClientFrame::Subscribe {
                channel,
                auth,
                channel_data,
            } => {
                let mut data = serde_json::Map::new();
                data.insert("channel".into(), Value::String(channel.clone()));
                if let Some(auth) = auth {
                    data.insert("auth".into(), Value::String(auth.clone()));
                }
                if let Some(cd) = channel_data {
                    data.insert("channel_data".into(), Value::String(cd.clone()));
                }
                serde_json::json!({ "event": "pusher:subscribe", "data": data })
            }
            ClientFrame::Unsubscribe { channel } => serde_json::json!({
                "event": "pusher:unsubscribe",
                "data": { "channel": channel },
            }),
            ClientFrame::Ping => serde_json::json!({ "event": "pusher:ping", "data": {} }),
            ClientFrame::Pong => serde_json::json!({ "event": "pusher:pong", "data": {} }),
        };
        value.to_string()
    }
}

/// Raw incoming frame before classification.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// A classified frame received from the broadcaster.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Handshake completed; the socket id authorizes channel subscriptions.
    ConnectionEstablished {
        socket_id: String,
        activity_timeout: u64,
    },
    /// A subscription was accepted.  On presence channels `data` carries the
    /// initial-members payload.
    SubscriptionSucceeded { channel: String, data: Value },
    /// A member joined a presence channel.
    MemberAdded { channel: String, member: Value },
    /// A member left a presence channel.
    MemberRemoved { channel: String, member: Value },
    /// Protocol-level error from the broadcaster.
    Error { code: Option<u64>, message: String },
    Pong,
    /// Protocol-level keepalive from the broadcaster; answered with a pong.
    Ping,
    /// An application event on a subscribed channel.
    Event {
        channel: Option<String>,
        event: String,
        data: Value,
    },
}

impl ServerFrame {
    /// Parse the text payload of a WebSocket message.
    pub fn parse(text: &str) -> Result<ServerFrame, TransportError> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("malformed frame: {e}")))?;

        let data = unwrap_data(raw.data);

        let frame = match raw.event.as_str() {
            "pusher:connection_established" => {
                let socket_id = data
                    .get("socket_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        TransportError::Protocol("connection_established without socket_id".into())
                    })?
                    .to_string();
                let activity_timeout = data
                    .get("activity_timeout")
                    .and_then(Value::as_u64)
                    .unwrap_or(120);
                ServerFrame::ConnectionEstablished {
                    socket_id,
                    activity_timeout,
                }
            }
            "pusher_internal:subscription_succeeded" => ServerFrame::SubscriptionSucceeded {
                channel: raw.channel.unwrap_or_default(),
                data,
            },
            "pusher_internal:member_added" => ServerFrame::MemberAdded {
                channel: raw.channel.unwrap_or_default(),
                member: data,
            },
            "pusher_internal:member_removed" => ServerFrame::MemberRemoved {
                channel: raw.channel.unwrap_or_default(),
                member: data,
            },
            "pusher:error" => ServerFrame::Error {
                code: data.get("code").and_then(Value::as_u64),
                message: data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "pusher:pong" => ServerFrame::Pong,
            "pusher:ping" => ServerFrame::Ping,
            _ => ServerFrame::Event {
                channel: raw.channel,
                event: raw.event,
                data,
            },
        };

        Ok(frame)
    }
}

/// The protocol frequently JSON-encodes `data` as a string.  Unwrap one
/// level of that encoding so callers always see a `Value`.
fn unwrap_data(data: Option<Value>) -> Value {
    match data {
        Some(Value::String(s)) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        Some(other) => other,
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame_encoding() {
        let frame = ClientFrame::Subscribe {
            channel: "private-group.7".into(),
            auth: Some("appkey:deadbeef".into()),
            channel_data: None,
        };
        let wire: Value = serde_json::from_str(&frame.to_wire()).unwrap();
        assert_eq!(wire["event"], "pusher:subscribe");
        assert_eq!(wire["data"]["channel"], "private-group.7");
        assert_eq!(wire["data"]["auth"], "appkey:deadbeef");
    }

    #[test]
    fn test_connection_established_double_encoded() {
        let text = r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"217.930\",\"activity_timeout\":120}"}"#;
        let frame = ServerFrame::parse(text).unwrap();
        assert_eq!(
            frame,
            ServerFrame::ConnectionEstablished {
                socket_id: "217.930".into(),
                activity_timeout: 120,
            }
        );
    }

    #[test]
    fn test_application_event() {
        let text = r#"{"event":"unread.count.updated","channel":"private-user.9","data":"{\"count\":3}"}"#;
        match ServerFrame::parse(text).unwrap() {
            ServerFrame::Event {
                channel,
                event,
                data,
            } => {
                assert_eq!(channel.as_deref(), Some("private-user.9"));
                assert_eq!(event, "unread.count.updated");
                assert_eq!(data["count"], 3);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_error_frame() {
        let text = r#"{"event":"pusher:error","data":{"code":4201,"message":"pong reply not received"}}"#;
        match ServerFrame::parse(text).unwrap() {
            ServerFrame::Error { code, message } => {
                assert_eq!(code, Some(4201));
                assert!(message.contains("pong"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frame_rejected() {
        assert!(ServerFrame::parse("not json").is_err());
    }
}
