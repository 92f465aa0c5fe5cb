use media::MediaError;
use shared::{
    domain::{MessageId, UserId},
    error::ParseError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    MediaAccess(#[from] MediaError),
    #[error("busy: call with {active} in progress, rejected offer from {offered_by}")]
    SignalingCollision { active: UserId, offered_by: UserId },
    #[error("a call with {active} is already in progress")]
    AlreadyActive { active: UserId },
    #[error("incoming offer has no sender and no contact is selected")]
    UnknownOfferer,
    #[error("signaling failed: {0}")]
    Signaling(#[from] ConnectionError),
    #[error("peer negotiation failed: {0}")]
    Negotiation(String),
    #[error("call ended before negotiation finished")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("invalid response payload: {0}")]
    InvalidPayload(#[from] ParseError),
    #[error("{0} is unavailable")]
    Unavailable(&'static str),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("no contact selected")]
    NoContactSelected,
    #[error("message has neither text nor attachment")]
    EmptyMessage,
    #[error("message {0} is not in the active conversation")]
    UnknownMessage(MessageId),
}
