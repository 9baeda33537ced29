use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, PresenceStatus, RoomId, UserId};

/// A chat message as held in the conversation list.
///
/// Deleted messages keep their slot: `deleted` is set and the content is
/// rewritten to a tombstone marker, so list indices stay stable for anything
/// referencing them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender: UserId,
    pub conversation: ConversationId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
}

/// An SDP session description exchanged during call negotiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An ICE candidate relayed between peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u32>,
}

/// Events pushed by the server over the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "new_message")]
    NewMessage(MessageRecord),

    #[serde(rename = "message_edited")]
    MessageEdited {
        id: MessageId,
        conversation: ConversationId,
        content: String,
    },

    #[serde(rename = "message_deleted")]
    MessageDeleted {
        id: MessageId,
        conversation: ConversationId,
    },

    #[serde(rename = "typing")]
    Typing {
        conversation: ConversationId,
        user: UserId,
    },

    #[serde(rename = "user_status_changed")]
    UserStatusChanged {
        user: UserId,
        status: PresenceStatus,
    },

    #[serde(rename = "call:incoming")]
    CallIncoming { room: RoomId, caller: UserId },

    #[serde(rename = "call:offer")]
    CallOffer {
        room: RoomId,
        description: SessionDescription,
    },

    #[serde(rename = "call:answer")]
    CallAnswer {
        room: RoomId,
        description: SessionDescription,
    },

    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate {
        room: RoomId,
        candidate: IceCandidate,
    },

    #[serde(rename = "call:accepted")]
    CallAccepted { room: RoomId },

    #[serde(rename = "call:rejected")]
    CallRejected { room: RoomId },

    #[serde(rename = "call:ended")]
    CallEnded { room: RoomId },

    /// Server reply to a heartbeat. Not required for health, used to keep
    /// local presence fresh.
    #[serde(rename = "pong")]
    Pong,
}

/// Discriminant of [`ServerEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    MessageEdited,
    MessageDeleted,
    Typing,
    UserStatusChanged,
    CallIncoming,
    CallOffer,
    CallAnswer,
    CallIceCandidate,
    CallAccepted,
    CallRejected,
    CallEnded,
    Pong,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::MessageEdited { .. } => EventKind::MessageEdited,
            Self::MessageDeleted { .. } => EventKind::MessageDeleted,
            Self::Typing { .. } => EventKind::Typing,
            Self::UserStatusChanged { .. } => EventKind::UserStatusChanged,
            Self::CallIncoming { .. } => EventKind::CallIncoming,
            Self::CallOffer { .. } => EventKind::CallOffer,
            Self::CallAnswer { .. } => EventKind::CallAnswer,
            Self::CallIceCandidate { .. } => EventKind::CallIceCandidate,
            Self::CallAccepted { .. } => EventKind::CallAccepted,
            Self::CallRejected { .. } => EventKind::CallRejected,
            Self::CallEnded { .. } => EventKind::CallEnded,
            Self::Pong => EventKind::Pong,
        }
    }
}

impl EventKind {
    /// Every kind, in declaration order. Used by consumers that subscribe to
    /// the full inbound stream.
    pub const ALL: [EventKind; 13] = [
        EventKind::NewMessage,
        EventKind::MessageEdited,
        EventKind::MessageDeleted,
        EventKind::Typing,
        EventKind::UserStatusChanged,
        EventKind::CallIncoming,
        EventKind::CallOffer,
        EventKind::CallAnswer,
        EventKind::CallIceCandidate,
        EventKind::CallAccepted,
        EventKind::CallRejected,
        EventKind::CallEnded,
        EventKind::Pong,
    ];
}

/// Events the client publishes over the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "heartbeat")]
    Heartbeat,

    #[serde(rename = "join_conversation")]
    JoinConversation { conversation: ConversationId },

    #[serde(rename = "leave_conversation")]
    LeaveConversation { conversation: ConversationId },

    #[serde(rename = "new_message")]
    SendMessage {
        conversation: ConversationId,
        content: String,
        created_at: DateTime<Utc>,
    },

    #[serde(rename = "typing")]
    Typing { conversation: ConversationId },

    #[serde(rename = "call:initiate")]
    CallInitiate { receiver: UserId },

    #[serde(rename = "call:offer")]
    CallOffer {
        room: RoomId,
        description: SessionDescription,
    },

    #[serde(rename = "call:answer")]
    CallAnswer {
        room: RoomId,
        description: SessionDescription,
    },

    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate {
        room: RoomId,
        candidate: IceCandidate,
    },

    #[serde(rename = "call:accepted")]
    CallAccept { room: RoomId },

    #[serde(rename = "call:rejected")]
    CallReject { room: RoomId },

    #[serde(rename = "call:ended")]
    CallEnd { room: RoomId },

    /// Best-effort teardown notification, flushed fire-and-forget on logout
    /// and page teardown.
    #[serde(rename = "logout")]
    Logout,
}

/// Synchronous server reply to an acked publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "ack", content = "data", rename_all = "snake_case")]
pub enum AckPayload {
    /// Generic success with no body.
    Ok,
    /// Reply to `call:initiate`: the server allocated a room.
    RoomAssigned { room: RoomId },
    /// Reply to `new_message`: the server-confirmed record.
    MessageStored(MessageRecord),
    /// The server refused the request.
    Error { message: String },
}

/// Frames the client writes to the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ClientFrame {
    Event { payload: ClientEvent },
    /// An acked publish; the server must reply with [`ServerFrame::Ack`]
    /// carrying the same correlation id.
    Request { ack_id: u64, payload: ClientEvent },
}

/// Frames the server writes to the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Event { payload: ServerEvent },
    Ack { ack_id: u64, payload: AckPayload },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerFrame {
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
