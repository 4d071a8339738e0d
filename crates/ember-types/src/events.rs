use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::PeerId;
use crate::topic::TopicKind;

/// Push events that change match/unread state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Notification {
    /// A peer sent a direct message
    Message {
        id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_at: Option<DateTime<Utc>>,
    },

    /// A mutual right swipe created a new match
    Match { id: PeerId },

    /// The peer unmatched
    Unmatch { id: PeerId },
}

impl Notification {
    pub fn peer_id(&self) -> PeerId {
        match self {
            Self::Message { id, .. } | Self::Match { id } | Self::Unmatch { id } => *id,
        }
    }
}

/// A direct message as delivered on a `message/{peer}/` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: PeerId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A decoded inbound frame. Which variant applies is decided by the topic.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Notification(Notification),
    Chat(ChatMessage),
    /// Frames on topics without a known schema.
    Raw(Value),
}

/// Decode one JSON text frame received on a channel of the given kind.
///
/// Frames on the swipe channel carry no `type`; it is implied to be `match`.
pub fn decode_frame(kind: TopicKind, text: &str) -> Result<InboundFrame, serde_json::Error> {
    match kind {
        TopicKind::Notifications => serde_json::from_str(text).map(InboundFrame::Notification),
        TopicKind::Swipe => {
            let mut value: Value = serde_json::from_str(text)?;
            if let Value::Object(map) = &mut value {
                map.entry("type").or_insert_with(|| Value::from("match"));
            }
            serde_json::from_value(value).map(InboundFrame::Notification)
        }
        TopicKind::Messages(_) => serde_json::from_str(text).map(InboundFrame::Chat),
        TopicKind::Other => serde_json::from_str(text).map(InboundFrame::Raw),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwipeDirection {
    Left,
    Right,
}

/// Frames sent FROM client TO server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    /// Direct message on a `message/{peer}/` channel
    Chat { text: String },

    /// Swipe decision on the `swipe/` channel
    Swipe { id: PeerId, direction: SwipeDirection },
}
