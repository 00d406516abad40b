use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable user identifier issued by the identity provider.
pub type Identity = String;
pub type GroupId = String;
pub type MessageId = String;
pub type CallId = String;
/// Process-unique id of one live connection.
pub type ConnectionId = u64;

/// Addressee of a chat message or typing signal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Peer(Identity),
    Group(GroupId),
}

impl Target {
    pub fn id(&self) -> &str {
        match self {
            Target::Peer(id) | Target::Group(id) => id,
        }
    }
}

/// Lifecycle of a message. Ordered: `Sent < Delivered < Read`.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    Sent,
    Delivered,
    Read,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::File => "file",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "video" => Ok(MessageType::Video),
            "audio" => Ok(MessageType::Audio),
            "file" => Ok(MessageType::File),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message as persisted and delivered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: Identity,
    pub target: Target,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    pub created_at_ms: u64,
    #[serde(default)]
    pub delivery_state: DeliveryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<MessageId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque session description produced by the browser's peer connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    Hangup,
    PeerDisconnected,
    NoAnswer,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallFailureReason {
    RecipientUnavailable,
    Busy,
    NoAnswer,
}

/// Client-to-relay events sent as JSON text frames.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Must be the first frame on a new connection.
    Admit {
        token: String,
    },
    WhoIsOnline,
    SendMessage {
        target: Target,
        content: String,
        #[serde(default)]
        message_type: MessageType,
        #[serde(default)]
        reply_to: Option<MessageId>,
        #[serde(default)]
        forwarded_from: Option<MessageId>,
        /// Echoed back in the matching `message_ack` so the client can reconcile.
        #[serde(default)]
        client_ref: Option<String>,
    },
    MarkDelivered {
        message_id: MessageId,
    },
    MarkRead {
        message_id: MessageId,
    },
    DeleteMessage {
        message_id: MessageId,
        #[serde(default)]
        hard: bool,
    },
    Typing {
        context: Target,
        is_typing: bool,
    },
    /// Group membership changed in the store; re-derive the group room.
    RefreshGroup {
        group_id: GroupId,
    },
    CallRequest {
        callee_id: Identity,
        offer: SessionDescription,
        kind: CallKind,
    },
    CallAccept {
        call_id: CallId,
        answer: SessionDescription,
    },
    CallReject {
        call_id: CallId,
    },
    EndCall {
        call_id: CallId,
    },
    IceCandidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
    /// Media is flowing on the client side.
    CallConnected {
        call_id: CallId,
    },
    Ping {
        timestamp_ms: u64,
    },
    Logout,
}

/// Relay-to-client events sent as JSON text frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Admitted {
        identity: Identity,
        connection_id: ConnectionId,
    },
    PresenceSnapshot {
        online: Vec<Identity>,
    },
    PresenceChanged {
        identity: Identity,
        online: bool,
    },
    MessageReceived {
        message: ChatMessage,
    },
    MessageAck {
        message_id: MessageId,
        delivery_state: DeliveryState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reader_id: Option<Identity>,
        at_ms: u64,
    },
    MessageDeleted {
        message_id: MessageId,
        hard: bool,
        deleted_by: Identity,
    },
    TypingChanged {
        actor_id: Identity,
        context: Target,
        is_typing: bool,
    },
    GroupUpdated {
        group_id: GroupId,
        participants: Vec<Identity>,
    },
    GroupRemoved {
        group_id: GroupId,
    },
    CallRinging {
        call_id: CallId,
        callee_id: Identity,
        kind: CallKind,
    },
    IncomingCall {
        call_id: CallId,
        caller_id: Identity,
        offer: SessionDescription,
        kind: CallKind,
    },
    CallAccepted {
        call_id: CallId,
        answer: SessionDescription,
    },
    /// Another device of the same callee accepted or declined the call.
    CallHandledElsewhere {
        call_id: CallId,
    },
    CallRejected {
        call_id: CallId,
    },
    CallActive {
        call_id: CallId,
    },
    CallEnded {
        call_id: CallId,
        reason: CallEndReason,
    },
    CallFailed {
        call_id: Option<CallId>,
        peer_id: Identity,
        reason: CallFailureReason,
    },
    IceCandidate {
        call_id: CallId,
        from_id: Identity,
        candidate: IceCandidate,
    },
    Pong {
        timestamp_ms: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthenticated,
    NotAdmitted,
    AlreadyAdmitted,
    AtCapacity,
    NotFound,
    Forbidden,
    EmptyContent,
    RecipientUnavailable,
    Busy,
    RateLimited,
    StoreUnavailable,
    ServerError,
}
