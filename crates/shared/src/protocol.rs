use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{Attachment, AttachmentRef, CallMode, Message, MessageId, UserId},
    error::ParseError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalFrame {
    Offer {
        recipient: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<CallMode>,
        offer: SessionDescription,
    },
    Answer {
        recipient: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<UserId>,
        answer: SessionDescription,
    },
    IceCandidate {
        recipient: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<UserId>,
        candidate: IceCandidate,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileUpload {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundChat {
    pub recipient: UserId,
    pub text: Option<String>,
    pub file: Option<FileUpload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Chat(OutboundChat),
    Signal(SignalFrame),
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn recipient(&self) -> &UserId {
        match self {
            ClientFrame::Chat(chat) => &chat.recipient,
            ClientFrame::Signal(SignalFrame::Offer { recipient, .. })
            | ClientFrame::Signal(SignalFrame::Answer { recipient, .. })
            | ClientFrame::Signal(SignalFrame::IceCandidate { recipient, .. }) => recipient,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    PresenceSnapshot(Vec<PresenceEntry>),
    PresenceDeparture {
        user_id: UserId,
    },
    ChatMessage(Message),
    CallOffer {
        from: Option<UserId>,
        mode: Option<CallMode>,
        offer: SessionDescription,
    },
    CallAnswer {
        from: Option<UserId>,
        answer: SessionDescription,
    },
    IceCandidate {
        from: Option<UserId>,
        candidate: IceCandidate,
    },
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::PresenceSnapshot(_) => "presence_snapshot",
            InboundEvent::PresenceDeparture { .. } => "presence_departure",
            InboundEvent::ChatMessage(_) => "chat_message",
            InboundEvent::CallOffer { .. } => "call_offer",
            InboundEvent::CallAnswer { .. } => "call_answer",
            InboundEvent::IceCandidate { .. } => "ice_candidate",
        }
    }

    /// Classifies a raw text frame by its shape. Signaling frames carry a
    /// `type` tag; the other kinds are recognised by their keys.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(map) = value else {
            return Err(ParseError::NotAnObject);
        };

        if map.contains_key("type") {
            let frame: SignalFrame = serde_json::from_value(Value::Object(map))
                .map_err(|source| ParseError::Invalid {
                    kind: "signaling",
                    source,
                })?;
            return Ok(frame.into());
        }

        if let Some(online) = map.get("online") {
            let entries: Vec<PresenceEntry> = serde_json::from_value(online.clone())
                .map_err(|source| ParseError::Invalid {
                    kind: "presence snapshot",
                    source,
                })?;
            return Ok(InboundEvent::PresenceSnapshot(entries));
        }

        if map.contains_key("offline") {
            let user_id = map
                .get("offlineUserId")
                .cloned()
                .ok_or(ParseError::MissingField {
                    kind: "presence departure",
                    field: "offlineUserId",
                })?;
            let user_id: UserId =
                serde_json::from_value(user_id).map_err(|source| ParseError::Invalid {
                    kind: "presence departure",
                    source,
                })?;
            return Ok(InboundEvent::PresenceDeparture { user_id });
        }

        if map.contains_key("text") || map.contains_key("file") {
            return message_from_map(map).map(InboundEvent::ChatMessage);
        }

        Err(ParseError::UnrecognizedShape {
            keys: map.keys().cloned().collect::<Vec<_>>().join(","),
        })
    }
}

impl From<SignalFrame> for InboundEvent {
    fn from(frame: SignalFrame) -> Self {
        match frame {
            SignalFrame::Offer {
                sender,
                mode,
                offer,
                ..
            } => InboundEvent::CallOffer {
                from: sender,
                mode,
                offer,
            },
            SignalFrame::Answer { sender, answer, .. } => InboundEvent::CallAnswer {
                from: sender,
                answer,
            },
            SignalFrame::IceCandidate {
                sender, candidate, ..
            } => InboundEvent::IceCandidate {
                from: sender,
                candidate,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireFile {
    Stored(String),
    Inline { name: String, data: String },
}

#[derive(Debug, Deserialize)]
struct WireChatMessage {
    #[serde(default, alias = "_id")]
    id: Option<MessageId>,
    sender: UserId,
    recipient: UserId,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    file: Option<WireFile>,
    #[serde(default, rename = "createdAt")]
    created_at: Option<DateTime<Utc>>,
}

/// Decodes a chat message as pushed over the socket or returned by the
/// history endpoint. Frames without an id get a provisional one.
pub fn message_from_value(value: Value) -> Result<Message, ParseError> {
    match value {
        Value::Object(map) => message_from_map(map),
        _ => Err(ParseError::NotAnObject),
    }
}

fn message_from_map(mut map: Map<String, Value>) -> Result<Message, ParseError> {
    if map.contains_key("id") {
        map.remove("_id");
    }
    let wire: WireChatMessage =
        serde_json::from_value(Value::Object(map)).map_err(|source| ParseError::Invalid {
            kind: "chat message",
            source,
        })?;

    let attachment = wire.file.map(|file| match file {
        WireFile::Stored(name) => Attachment {
            reference: AttachmentRef::Stored(name.clone()),
            name,
        },
        WireFile::Inline { name, data } => Attachment {
            name,
            reference: AttachmentRef::Inline(data),
        },
    });

    Ok(Message {
        id: wire.id.unwrap_or_else(MessageId::provisional),
        sender: wire.sender,
        recipient: wire.recipient,
        text: wire.text.filter(|text| !text.is_empty()),
        attachment,
        created_at: wire.created_at,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    #[serde(alias = "_id")]
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: UserSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
