use std::collections::HashMap;

use shared::{
    domain::{Contact, UserId},
    protocol::UserSummary,
};

use crate::{call::CallState, connection::ConnectionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub username: String,
}

impl From<UserSummary> for SessionIdentity {
    fn from(user: UserSummary) -> Self {
        Self {
            user_id: user.id,
            username: user.username,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub online: Vec<Contact>,
    pub offline: Vec<Contact>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    RosterUpdated(Roster),
    MessagesUpdated { contact: UserId },
    UnreadUpdated(HashMap<UserId, u32>),
    CallStateChanged(CallState),
    Error(String),
}
