//! Wire types for the EventSub WebSocket protocol.
//!
//! Every inbound frame is a JSON object with a `metadata` block and a
//! `payload` block. The `metadata.message_type` field selects how the
//! payload is read; [`InboundFrame::parse`] turns a text frame into a
//! closed enum so the session loop never touches raw JSON.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event categories the monitor can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    /// A chat message in the broadcaster's channel.
    #[serde(rename = "channel.chat.message")]
    ChatMessage,
    /// A new (first-time) subscription to the channel.
    #[serde(rename = "channel.subscribe")]
    ChannelSubscribe,
    /// A resubscription announced with a chat message.
    #[serde(rename = "channel.subscription.message")]
    SubscriptionMessage,
}

impl SubscriptionKind {
    /// All categories in registration order.
    pub const ALL: [SubscriptionKind; 3] = [
        SubscriptionKind::ChatMessage,
        SubscriptionKind::ChannelSubscribe,
        SubscriptionKind::SubscriptionMessage,
    ];

    /// The `subscription.type` string used on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatMessage => "channel.chat.message",
            Self::ChannelSubscribe => "channel.subscribe",
            Self::SubscriptionMessage => "channel.subscription.message",
        }
    }

    /// The subscription version requested at registration.
    #[must_use]
    pub fn version(self) -> &'static str {
        "1"
    }

    /// Looks up a category by its wire name.
    #[must_use]
    pub fn from_type(subscription_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == subscription_type)
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while reading a frame envelope.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The frame is not JSON or lacks the fields its message type requires.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The `metadata` block shared by every frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub message_timestamp: String,
    #[serde(default)]
    pub subscription_type: Option<String>,
    #[serde(default)]
    pub subscription_version: Option<String>,
}

/// Session details carried by welcome and reconnect frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub connected_at: Option<String>,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub reconnect_url: Option<String>,
}

/// The subscription a notification or revocation refers to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub condition: serde_json::Value,
    #[serde(default)]
    pub transport: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub cost: u32,
}

/// A notification: the subscription it belongs to plus the raw event body.
///
/// The event body stays untyped here; the dispatcher picks a decoder
/// from `subscription.subscription_type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Notification {
    pub subscription: SubscriptionInfo,
    #[serde(default)]
    pub event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    metadata: Metadata,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    session: SessionInfo,
}

#[derive(Debug, Deserialize)]
struct RevocationPayload {
    subscription: SubscriptionInfo,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `session_welcome`: first frame on a connection, carries the session id.
    Welcome(SessionInfo),
    /// `session_keepalive`: liveness only.
    Keepalive,
    /// `notification`: a subscribed event.
    Notification(Notification),
    /// `session_reconnect`: the server asks us to move to `reconnect_url`.
    Reconnect(SessionInfo),
    /// `revocation`: the server cancelled one of our subscriptions.
    Revocation(SubscriptionInfo),
    /// Any message type this client does not know about.
    Other(String),
}

impl InboundFrame {
    /// Parses a text frame.
    ///
    /// Unknown message types are returned as [`InboundFrame::Other`] rather
    /// than an error so that new server message types never break the loop.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Malformed`] if the text is not a JSON envelope,
    /// or a known message type is missing its required payload fields.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let envelope: Envelope = serde_json::from_str(text)?;

        let frame = match envelope.metadata.message_type.as_str() {
            "session_welcome" => {
                let payload: SessionPayload = serde_json::from_value(envelope.payload)?;
                Self::Welcome(payload.session)
            }
            "session_keepalive" => Self::Keepalive,
            "notification" => Self::Notification(serde_json::from_value(envelope.payload)?),
            "session_reconnect" => {
                let payload: SessionPayload = serde_json::from_value(envelope.payload)?;
                Self::Reconnect(payload.session)
            }
            "revocation" => {
                let payload: RevocationPayload = serde_json::from_value(envelope.payload)?;
                Self::Revocation(payload.subscription)
            }
            _ => Self::Other(envelope.metadata.message_type),
        };

        Ok(frame)
    }

    /// The wire name of this frame's message type.
    #[must_use]
    pub fn message_type(&self) -> &str {
        match self {
            Self::Welcome(_) => "session_welcome",
            Self::Keepalive => "session_keepalive",
            Self::Notification(_) => "notification",
            Self::Reconnect(_) => "session_reconnect",
            Self::Revocation(_) => "revocation",
            Self::Other(message_type) => message_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_welcome() {
        let text = json!({
            "metadata": {
                "message_id": "96a3f3b5-5dec-4eed-908e-e11ee657416c",
                "message_type": "session_welcome",
                "message_timestamp": "2023-07-19T14:56:51.634234626Z"
            },
            "payload": {
                "session": {
                    "id": "AQoQILE98gtqShGmLD7AM6yJThAB",
                    "status": "connected",
                    "connected_at": "2023-07-19T14:56:51.616329898Z",
                    "keepalive_timeout_seconds": 10,
                    "reconnect_url": null
                }
            }
        })
        .to_string();

        let frame = InboundFrame::parse(&text).unwrap();
        match frame {
            InboundFrame::Welcome(info) => {
                assert_eq!(info.id, "AQoQILE98gtqShGmLD7AM6yJThAB");
                assert_eq!(info.keepalive_timeout_seconds, Some(10));
                assert!(info.reconnect_url.is_none());
            }
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    #[test]
    fn parses_keepalive_with_empty_payload() {
        let text = r#"{"metadata":{"message_type":"session_keepalive"},"payload":{}}"#;
        assert_eq!(InboundFrame::parse(text).unwrap(), InboundFrame::Keepalive);
    }

    #[test]
    fn parses_notification_and_keeps_event_raw() {
        let text = json!({
            "metadata": {
                "message_type": "notification",
                "subscription_type": "channel.subscribe",
                "subscription_version": "1"
            },
            "payload": {
                "subscription": {"id": "s1", "type": "channel.subscribe", "version": "1"},
                "event": {"user_name": "alice"}
            }
        })
        .to_string();

        let InboundFrame::Notification(notification) = InboundFrame::parse(&text).unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(notification.subscription.subscription_type, "channel.subscribe");
        assert_eq!(notification.event["user_name"], "alice");
    }

    #[test]
    fn parses_reconnect_url() {
        let text = json!({
            "metadata": {"message_type": "session_reconnect"},
            "payload": {"session": {
                "id": "abc",
                "status": "reconnecting",
                "reconnect_url": "wss://eventsub.wss.twitch.tv/ws?id=abc"
            }}
        })
        .to_string();

        let InboundFrame::Reconnect(info) = InboundFrame::parse(&text).unwrap() else {
            panic!("expected reconnect");
        };
        assert_eq!(
            info.reconnect_url.as_deref(),
            Some("wss://eventsub.wss.twitch.tv/ws?id=abc")
        );
    }

    #[test]
    fn parses_revocation() {
        let text = json!({
            "metadata": {"message_type": "revocation"},
            "payload": {"subscription": {
                "id": "s9",
                "type": "channel.chat.message",
                "status": "authorization_revoked"
            }}
        })
        .to_string();

        let InboundFrame::Revocation(sub) = InboundFrame::parse(&text).unwrap() else {
            panic!("expected revocation");
        };
        assert_eq!(sub.status, "authorization_revoked");
    }

    #[test]
    fn unknown_message_type_is_not_an_error() {
        let text = r#"{"metadata":{"message_type":"session_mystery"},"payload":{"x":1}}"#;
        let frame = InboundFrame::parse(text).unwrap();
        assert_eq!(frame, InboundFrame::Other("session_mystery".to_string()));
        assert_eq!(frame.message_type(), "session_mystery");
    }

    #[test]
    fn welcome_without_session_is_malformed() {
        let text = r#"{"metadata":{"message_type":"session_welcome"},"payload":{}}"#;
        assert!(matches!(
            InboundFrame::parse(text),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(InboundFrame::parse("hello").is_err());
    }

    #[test]
    fn subscription_kind_round_trips_wire_names() {
        for kind in SubscriptionKind::ALL {
            assert_eq!(SubscriptionKind::from_type(kind.as_str()), Some(kind));
            assert_eq!(
                serde_json::to_string(&kind).unwrap(),
                format!("\"{}\"", kind.as_str())
            );
        }
        assert_eq!(SubscriptionKind::from_type("channel.follow"), None);
    }
}
