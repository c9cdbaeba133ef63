use serde::{Deserialize, Serialize};

use crate::api::MessageDocument;

/// Frames sent FROM client TO server over the conversation WebSocket.
///
/// A frame without a recognized `type` tag but with a `content` field is
/// treated as a plain message send; the session handles that fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Typing indicator for the conversation room.
    Typing,

    /// Delivery acknowledgement for a single message.
    Delivered { message_id: i64 },

    /// Read receipt: everything up to `last_read` has been read.
    Read { last_read: i64 },

    /// Edit a message the sender owns.
    Edit { message_id: i64, content: String },

    /// Soft-delete a message the sender owns.
    Delete { message_id: i64 },

    /// Toggle an emoji reaction.
    React { message_id: i64, emoji: String },

    /// Plain text message send.
    Content { content: String },
}

/// Events sent FROM server TO clients over the conversation WebSocket.
/// The `type` tag mirrors the inbound protocol so clients can dispatch on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// New message for the conversation room.
    Message { data: MessageDocument },

    /// Sidebar notification for the receiver's personal group: a new message
    /// arrived in a conversation they may not have open.
    Sidebar { data: MessageDocument },

    /// Someone in the room is typing.
    Typing { user: i64 },

    /// A message was delivered to `user`'s device.
    Delivered { user: i64, message_id: i64 },

    /// `user` has read everything up to `last_read`.
    Read { user: i64, last_read: i64 },

    /// A message was edited or soft-deleted; `data` is the full re-serialized
    /// document so clients update consistently.
    MessageUpdated { data: MessageDocument },

    /// A reaction was toggled.
    Reaction {
        message_id: i64,
        emoji: String,
        user: i64,
        action: ReactionAction,
    },

    /// A user came online or went offline.
    Presence { user: i64, online: bool },

    /// Full online-user snapshot, sent once to a newly joined connection.
    PresenceSync { users: Vec<i64> },

    /// A friend request arrived for this user.
    FriendRequest { from_user: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Added,
    Removed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_tags_round_trip() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"edit","message_id":7,"content":"fixed"}"#).unwrap();
        match frame {
            ClientFrame::Edit { message_id, content } => {
                assert_eq!(message_id, 7);
                assert_eq!(content, "fixed");
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let typing: ClientFrame = serde_json::from_str(r#"{"type":"typing"}"#).unwrap();
        assert!(matches!(typing, ClientFrame::Typing));
    }

    #[test]
    fn server_event_uses_snake_case_tags() {
        let event = ServerEvent::Reaction {
            message_id: 3,
            emoji: "👍".into(),
            user: 1,
            action: ReactionAction::Added,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "reaction");
        assert_eq!(json["action"], "added");

        let sync = ServerEvent::PresenceSync { users: vec![1, 2] };
        let json = serde_json::to_value(&sync).unwrap();
        assert_eq!(json["type"], "presence_sync");
        assert_eq!(json["users"], serde_json::json!([1, 2]));
    }
}
