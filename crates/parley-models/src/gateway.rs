use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::attachment::MediaRef;
use crate::message::Message;
use crate::presence::PresencePayload;
use crate::{ConversationId, MessageId, UserId};

// Client -> Server event names
pub const EVENT_IDENTIFY: &str = "identify";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_SEND_MESSAGE: &str = "send-message";
pub const EVENT_TYPING: &str = "typing";
pub const EVENT_MARK_READ: &str = "mark-read";
pub const EVENT_JOIN_CONVERSATION: &str = "join-conversation";
pub const EVENT_LEAVE_CONVERSATION: &str = "leave-conversation";
pub const EVENT_CALL_OFFER: &str = "call-offer";
pub const EVENT_CALL_ANSWER: &str = "call-answer";
pub const EVENT_CALL_REJECT: &str = "call-reject";
pub const EVENT_ICE_CANDIDATE: &str = "ice-candidate";

/// Raw wire frame: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(with = "crate::id_str")]
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<MediaRef>,
    #[serde(default)]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(with = "crate::id_str")]
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    #[serde(with = "crate::id_str")]
    pub conversation_id: ConversationId,
    #[serde(default, with = "crate::id_str::vec")]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    #[serde(with = "crate::id_str")]
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    #[serde(with = "crate::id_str")]
    pub to_user_id: UserId,
    #[serde(default)]
    pub payload: Value,
}

/// Call-setup payload kinds accepted by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Reject,
}

impl SignalKind {
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            EVENT_CALL_OFFER => Some(Self::Offer),
            EVENT_CALL_ANSWER => Some(Self::Answer),
            EVENT_ICE_CANDIDATE => Some(Self::Candidate),
            EVENT_CALL_REJECT => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Every event a client may send after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Identify(IdentifyPayload),
    Heartbeat,
    SendMessage(SendMessagePayload),
    Typing(TypingPayload),
    MarkRead(MarkReadPayload),
    JoinConversation(ConversationRef),
    LeaveConversation(ConversationRef),
    Signal { kind: SignalKind, request: SignalRequest },
    /// Event name this server does not know. Ignored by the dispatcher.
    Unknown(String),
}

#[derive(Debug, Error)]
#[error("malformed '{event}' payload: {source}")]
pub struct DecodeError {
    pub event: String,
    #[source]
    pub source: serde_json::Error,
}

fn payload<T: serde::de::DeserializeOwned>(frame: &GatewayFrame) -> Result<T, DecodeError> {
    serde_json::from_value(frame.data.clone().unwrap_or(Value::Null)).map_err(|source| {
        DecodeError {
            event: frame.event.clone(),
            source,
        }
    })
}

impl InboundEvent {
    pub fn decode(frame: &GatewayFrame) -> Result<Self, DecodeError> {
        let event = match frame.event.as_str() {
            EVENT_IDENTIFY => Self::Identify(payload(frame)?),
            EVENT_HEARTBEAT => Self::Heartbeat,
            EVENT_SEND_MESSAGE => Self::SendMessage(payload(frame)?),
            EVENT_TYPING => Self::Typing(payload(frame)?),
            EVENT_MARK_READ => Self::MarkRead(payload(frame)?),
            EVENT_JOIN_CONVERSATION => Self::JoinConversation(payload(frame)?),
            EVENT_LEAVE_CONVERSATION => Self::LeaveConversation(payload(frame)?),
            name => match SignalKind::from_event(name) {
                Some(kind) => Self::Signal {
                    kind,
                    request: payload(frame)?,
                },
                None => Self::Unknown(name.to_string()),
            },
        };
        Ok(event)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Identify(_) => EVENT_IDENTIFY,
            Self::Heartbeat => EVENT_HEARTBEAT,
            Self::SendMessage(_) => EVENT_SEND_MESSAGE,
            Self::Typing(_) => EVENT_TYPING,
            Self::MarkRead(_) => EVENT_MARK_READ,
            Self::JoinConversation(_) => EVENT_JOIN_CONVERSATION,
            Self::LeaveConversation(_) => EVENT_LEAVE_CONVERSATION,
            Self::Signal { kind, .. } => match kind {
                SignalKind::Offer => EVENT_CALL_OFFER,
                SignalKind::Answer => EVENT_CALL_ANSWER,
                SignalKind::Candidate => EVENT_ICE_CANDIDATE,
                SignalKind::Reject => EVENT_CALL_REJECT,
            },
            Self::Unknown(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectReason {
    Validation,
    Authorization,
    Transient,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    #[serde(with = "crate::id_str")]
    pub user_id: UserId,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthErrorPayload {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTypingPayload {
    #[serde(with = "crate::id_str")]
    pub conversation_id: ConversationId,
    #[serde(with = "crate::id_str")]
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesReadPayload {
    #[serde(with = "crate::id_str")]
    pub conversation_id: ConversationId,
    #[serde(with = "crate::id_str")]
    pub user_id: UserId,
    #[serde(with = "crate::id_str::vec")]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAckPayload {
    #[serde(with = "crate::id_str")]
    pub conversation_id: ConversationId,
    pub marked: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(with = "crate::id_str")]
    pub from_user_id: UserId,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub event: String,
    pub reason: RejectReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedPayload {
    pub retry_after_ms: u64,
}

/// Every event the server pushes to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    Hello(HelloPayload),
    Ready(ReadyPayload),
    HeartbeatAck,
    AuthError(AuthErrorPayload),
    NewMessage(Message),
    UserTyping(UserTypingPayload),
    MessagesRead(MessagesReadPayload),
    ReadAck(ReadAckPayload),
    UserOnline(PresencePayload),
    UserOffline(PresencePayload),
    IncomingCall(SignalPayload),
    CallAccepted(SignalPayload),
    CallRejected(SignalPayload),
    IceCandidate(SignalPayload),
    Error(ErrorPayload),
    RateLimited(RateLimitedPayload),
}

impl OutboundEvent {
    /// Map a relayed signaling kind onto the event the target receives.
    pub fn signal(kind: SignalKind, payload: SignalPayload) -> Self {
        match kind {
            SignalKind::Offer => Self::IncomingCall(payload),
            SignalKind::Answer => Self::CallAccepted(payload),
            SignalKind::Reject => Self::CallRejected(payload),
            SignalKind::Candidate => Self::IceCandidate(payload),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Ready(_) => "ready",
            Self::HeartbeatAck => "heartbeat-ack",
            Self::AuthError(_) => "auth-error",
            Self::NewMessage(_) => "new-message",
            Self::UserTyping(_) => "user-typing",
            Self::MessagesRead(_) => "messages-read",
            Self::ReadAck(_) => "read-ack",
            Self::UserOnline(_) => "user-online",
            Self::UserOffline(_) => "user-offline",
            Self::IncomingCall(_) => "incoming-call",
            Self::CallAccepted(_) => "call-accepted",
            Self::CallRejected(_) => "call-rejected",
            Self::IceCandidate(_) => "ice-candidate",
            Self::Error(_) => "error",
            Self::RateLimited(_) => "rate-limited",
        }
    }
}
