use std::{collections::HashMap, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use media::{MediaDevices, MissingMediaDevices, MissingPeerConnector, PeerConnector};
use shared::{
    domain::{Attachment, AttachmentRef, CallMode, Message, MessageId, UserId},
    protocol::{ClientFrame, Credentials, FileUpload, InboundEvent, OutboundChat},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    call::{CallState, CallStateMachine},
    config::ClientSettings,
    connection::{ConnectionEvent, ConnectionManager, ConnectionState, CredentialSource},
    error::{CallError, ConnectionError, SessionError},
    messages::{AppendOutcome, MessageStore},
    presence::PresenceTracker,
    rest::{ChatBackend, HttpChatBackend},
    types::{Roster, SessionEvent, SessionIdentity},
};

pub struct SessionCollaborators {
    pub backend: Arc<dyn ChatBackend>,
    pub credentials: Option<Arc<dyn CredentialSource>>,
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
}

impl SessionCollaborators {
    /// Chat only: calls fail with a media error.
    pub fn without_media(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            credentials: None,
            devices: Arc::new(MissingMediaDevices),
            connector: Arc::new(MissingPeerConnector),
        }
    }
}

pub struct ChatSession {
    identity: SessionIdentity,
    backend: Arc<dyn ChatBackend>,
    connection: Arc<ConnectionManager>,
    calls: Arc<CallStateMachine>,
    presence: RwLock<PresenceTracker>,
    messages: RwLock<MessageStore>,
    events: broadcast::Sender<SessionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(
        identity: SessionIdentity,
        settings: &ClientSettings,
        collaborators: SessionCollaborators,
    ) -> Result<Arc<Self>, SessionError> {
        let connection = ConnectionManager::new(settings, collaborators.credentials)?;
        let calls = CallStateMachine::new(
            identity.user_id.clone(),
            connection.clone(),
            collaborators.devices,
            collaborators.connector,
            settings.ice_servers.clone(),
        );
        let (events, _) = broadcast::channel(settings.event_buffer.max(16));
        Ok(Arc::new(Self {
            presence: RwLock::new(PresenceTracker::new(identity.user_id.clone())),
            messages: RwLock::new(MessageStore::new(identity.user_id.clone())),
            identity,
            backend: collaborators.backend,
            connection,
            calls,
            events,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Authenticates over HTTP and builds a session whose transport reuses
    /// the resulting session cookie.
    pub async fn sign_in(
        settings: &ClientSettings,
        credentials: &Credentials,
        register: bool,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Arc<Self>, SessionError> {
        let base_url = settings
            .http_url()
            .map_err(|err| ConnectionError::InvalidUrl(err.to_string()))?;
        let backend = HttpChatBackend::new(base_url)?;
        let user = if register {
            backend.register(credentials).await?
        } else {
            backend.login(credentials).await?
        };
        info!(user_id = %user.id, username = %user.username, "session: signed in");

        let jar: Arc<dyn CredentialSource> = backend.cookie_jar();
        Self::new(
            SessionIdentity::from(user),
            settings,
            SessionCollaborators {
                backend: Arc::new(backend),
                credentials: Some(jar),
                devices,
                connector,
            },
        )
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn call_state(&self) -> CallState {
        self.calls.state()
    }

    pub async fn roster(&self) -> Roster {
        let presence = self.presence.read().await;
        Roster {
            online: presence.online(),
            offline: presence.offline(),
        }
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.read().await.messages()
    }

    pub async fn unread_counts(&self) -> HashMap<UserId, u32> {
        self.messages.read().await.unread_counts()
    }

    pub async fn selected_contact(&self) -> Option<UserId> {
        self.messages.read().await.selected().cloned()
    }

    /// Seeds the roster, starts routing inbound events and opens the transport.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        if let Err(err) = self.refresh_people().await {
            warn!("session: loading people failed: {err}");
            self.emit(SessionEvent::Error(err.to_string()));
        }

        {
            let mut tasks = self.tasks.lock().await;
            tasks.retain(|task| !task.is_finished());
            if tasks.is_empty() {
                tasks.push(self.spawn_dispatcher());
                tasks.push(self.spawn_call_watcher());
            }
        }

        self.connection.connect().await;
        info!(
            user_id = %self.identity.user_id,
            url = %self.connection.url(),
            "session: started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.calls.end_call().await;
        self.connection.disconnect().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(user_id = %self.identity.user_id, "session: shut down");
    }

    pub async fn logout(&self) -> Result<(), SessionError> {
        self.backend.logout().await?;
        self.shutdown().await;
        Ok(())
    }

    pub async fn refresh_people(&self) -> Result<(), SessionError> {
        let people = self.backend.people().await?;
        let changed = self.presence.write().await.seed_known(people);
        if changed {
            self.emit_roster().await;
        }
        Ok(())
    }

    /// Switches the active conversation and replaces its log with server
    /// history. A response for a selection that was superseded meanwhile is
    /// dropped.
    pub async fn select_contact(&self, contact: UserId) -> Result<(), SessionError> {
        let ticket = self.messages.write().await.select(contact.clone());
        self.emit_unread().await;
        self.emit(SessionEvent::MessagesUpdated {
            contact: contact.clone(),
        });

        let history = match self.backend.messages(&contact).await {
            Ok(history) => history,
            Err(err) => {
                warn!(contact_id = %contact, "session: loading history failed: {err}");
                self.emit(SessionEvent::Error(err.to_string()));
                return Err(err.into());
            }
        };
        let applied = self.messages.write().await.apply_history(&ticket, history);
        if applied {
            self.emit(SessionEvent::MessagesUpdated { contact });
        }
        Ok(())
    }

    pub async fn send_message(&self, text: &str) -> Result<(), SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let recipient = self.require_selection().await?;
        self.connection
            .send(ClientFrame::Chat(OutboundChat {
                recipient: recipient.clone(),
                text: Some(text.to_string()),
                file: None,
            }))
            .await?;
        self.echo(recipient, Some(text.to_string()), None).await;
        Ok(())
    }

    pub async fn send_file(&self, name: &str, bytes: &[u8]) -> Result<(), SessionError> {
        if name.trim().is_empty() || bytes.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let recipient = self.require_selection().await?;
        let data = STANDARD.encode(bytes);
        self.connection
            .send(ClientFrame::Chat(OutboundChat {
                recipient: recipient.clone(),
                text: None,
                file: Some(FileUpload {
                    name: name.to_string(),
                    data: data.clone(),
                }),
            }))
            .await?;
        let attachment = Attachment {
            name: name.to_string(),
            reference: AttachmentRef::Inline(data),
        };
        self.echo(recipient, None, Some(attachment)).await;
        Ok(())
    }

    pub async fn start_call(&self, mode: CallMode) -> Result<(), SessionError> {
        let peer = self.require_selection().await?;
        self.calls.start_call(peer, mode).await?;
        Ok(())
    }

    pub async fn end_call(&self) {
        self.calls.end_call().await;
    }

    /// Removes a message after the server acknowledged the deletion. On
    /// failure the local copy stays.
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), SessionError> {
        if !self.messages.read().await.contains(message_id) {
            return Err(SessionError::UnknownMessage(message_id.clone()));
        }
        if let Err(err) = self.backend.delete_message(message_id).await {
            warn!(message_id = %message_id, "session: deleting message failed: {err}");
            return Err(err.into());
        }
        let removed = self.messages.write().await.remove(message_id);
        if let Some(message) = removed {
            self.emit(SessionEvent::MessagesUpdated {
                contact: message.counterpart(&self.identity.user_id).clone(),
            });
        }
        Ok(())
    }

    pub async fn delete_contact(&self, contact: &UserId) -> Result<(), SessionError> {
        if let Err(err) = self.backend.delete_user(contact).await {
            warn!(contact_id = %contact, "session: deleting contact failed: {err}");
            return Err(err.into());
        }
        self.presence.write().await.remove(contact);
        self.messages.write().await.forget(contact);
        info!(contact_id = %contact, "session: contact deleted");
        self.emit_roster().await;
        self.emit_unread().await;
        self.emit(SessionEvent::MessagesUpdated {
            contact: contact.clone(),
        });
        Ok(())
    }

    async fn require_selection(&self) -> Result<UserId, SessionError> {
        self.selected_contact()
            .await
            .ok_or(SessionError::NoContactSelected)
    }

    async fn echo(
        &self,
        recipient: UserId,
        text: Option<String>,
        attachment: Option<Attachment>,
    ) {
        let message = Message {
            id: MessageId::provisional(),
            sender: self.identity.user_id.clone(),
            recipient: recipient.clone(),
            text,
            attachment,
            created_at: Some(Utc::now()),
        };
        self.messages.write().await.append(message);
        self.emit(SessionEvent::MessagesUpdated { contact: recipient });
    }

    fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.connection.subscribe();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::StateChanged(state)) => {
                        session.emit(SessionEvent::ConnectionStateChanged(state));
                    }
                    Ok(ConnectionEvent::Inbound(event)) => session.handle_inbound(event).await,
                    Ok(ConnectionEvent::Malformed { reason }) => {
                        debug!("session: ignoring malformed frame: {reason}");
                    }
                    Err(RecvError::Lagged(skipped)) => session.resync(skipped).await,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_call_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut state = self.calls.watch_state();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = state.borrow_and_update().clone();
                session.emit(SessionEvent::CallStateChanged(current));
            }
        })
    }

    async fn handle_inbound(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::PresenceSnapshot(entries) => {
                let changed = self.presence.write().await.apply_snapshot(entries);
                if changed {
                    self.emit_roster().await;
                }
            }
            InboundEvent::PresenceDeparture { user_id } => {
                let changed = self.presence.write().await.apply_departure(&user_id);
                if changed {
                    self.emit_roster().await;
                }
            }
            InboundEvent::ChatMessage(message) => {
                let contact = message.counterpart(&self.identity.user_id).clone();
                let from_peer = message.sender != self.identity.user_id;
                let outcome = self.messages.write().await.record(message);
                match outcome {
                    AppendOutcome::Inserted => {
                        self.emit(SessionEvent::MessagesUpdated { contact });
                        if from_peer {
                            self.emit_unread().await;
                        }
                    }
                    AppendOutcome::Confirmed => {
                        self.emit(SessionEvent::MessagesUpdated { contact });
                    }
                    AppendOutcome::Duplicate => {
                        debug!(contact_id = %contact, "session: duplicate message dropped");
                    }
                }
            }
            InboundEvent::CallOffer { from, mode, offer } => {
                let from = match from {
                    Some(from) => Some(from),
                    None => self.selected_contact().await,
                };
                let Some(from) = from else {
                    warn!("session: dropping offer without sender");
                    self.emit(SessionEvent::Error(CallError::UnknownOfferer.to_string()));
                    return;
                };
                // The slot is claimed before the next frame is dispatched so
                // trailing candidates find the call.
                let call = match self.calls.begin_incoming(from, mode, offer).await {
                    Ok(call) => call,
                    Err(err) => {
                        self.emit(SessionEvent::Error(err.to_string()));
                        return;
                    }
                };
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = session.calls.answer_incoming(call).await {
                        session.emit(SessionEvent::Error(err.to_string()));
                    }
                });
            }
            InboundEvent::CallAnswer { from, answer } => {
                if let Err(err) = self.calls.handle_answer(from, answer).await {
                    self.emit(SessionEvent::Error(err.to_string()));
                }
            }
            InboundEvent::IceCandidate { from, candidate } => {
                if let Err(err) = self.calls.handle_ice_candidate(from, candidate).await {
                    self.emit(SessionEvent::Error(err.to_string()));
                }
            }
        }
    }

    /// Dropped transport events may include chat or presence updates, so the
    /// directory and the open conversation are fetched again.
    async fn resync(&self, skipped: u64) {
        warn!(skipped, "session: dispatcher lagged behind transport; resynchronizing");
        self.emit(SessionEvent::Error(format!(
            "missed {skipped} realtime events; reloading contacts and history"
        )));
        if let Err(err) = self.refresh_people().await {
            warn!("session: reloading people failed: {err}");
            self.emit(SessionEvent::Error(err.to_string()));
        }
        if let Some(contact) = self.selected_contact().await {
            // Failures are already reported as events.
            let _ = self.select_contact(contact).await;
        }
    }

    async fn emit_roster(&self) {
        let roster = self.roster().await;
        self.emit(SessionEvent::RosterUpdated(roster));
    }

    async fn emit_unread(&self) {
        let unread = self.unread_counts().await;
        self.emit(SessionEvent::UnreadUpdated(unread));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
