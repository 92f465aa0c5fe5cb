pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod messages;
pub mod presence;
pub mod rest;
pub mod session;
pub mod types;

pub use call::{CallState, CallStateMachine, IncomingCall};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, FrameSink};
pub use error::{CallError, CollaboratorError, ConnectionError, SessionError};
pub use rest::{ChatBackend, HttpChatBackend, MissingChatBackend};
pub use session::{ChatSession, SessionCollaborators};
pub use types::{Roster, SessionEvent, SessionIdentity};
