use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

const PROVISIONAL_PREFIX: &str = "local-";

impl MessageId {
    /// Id for a locally echoed message that the server has not persisted yet.
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: UserId,
    pub display_name: String,
    pub presence: Presence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    Audio,
    Video,
}

impl CallMode {
    /// Falls back to the media sections of an SDP body when the offer
    /// carries no explicit mode.
    pub fn infer_from_sdp(sdp: &str) -> Self {
        if sdp.lines().any(|line| line.trim_start().starts_with("m=video")) {
            CallMode::Video
        } else {
            CallMode::Audio
        }
    }

    pub fn wants_video(self) -> bool {
        matches!(self, CallMode::Video)
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallMode::Audio => f.write_str("audio"),
            CallMode::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentRef {
    /// Base64 payload that still has to travel over the socket.
    Inline(String),
    /// Filename under which the server persisted the upload.
    Stored(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub reference: AttachmentRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub recipient: UserId,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Message {
    /// The other side of the conversation as seen by `local_user`.
    pub fn counterpart(&self, local_user: &UserId) -> &UserId {
        if &self.sender == local_user {
            &self.recipient
        } else {
            &self.sender
        }
    }

    pub fn attachment_name(&self) -> Option<&str> {
        self.attachment.as_ref().map(|attachment| attachment.name.as_str())
    }

    /// Whether `other` looks like the server-confirmed copy of this message.
    pub fn same_content(&self, other: &Message) -> bool {
        self.sender == other.sender
            && self.recipient == other.recipient
            && self.text.as_deref().unwrap_or_default() == other.text.as_deref().unwrap_or_default()
            && match (&self.attachment, &other.attachment) {
                (None, None) => true,
                // The server renames uploads, so an inline upload matches any stored file.
                (Some(ours), Some(theirs)) => {
                    ours.name == theirs.name
                        || matches!(ours.reference, AttachmentRef::Inline(_))
                            != matches!(theirs.reference, AttachmentRef::Inline(_))
                }
                _ => false,
            }
    }
}
