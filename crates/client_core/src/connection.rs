//! Single realtime transport to the messaging server with indefinite reconnect.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientFrame, InboundEvent};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::COOKIE, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{ClientSettings, ReconnectPolicy},
    error::ConnectionError,
};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Inbound(InboundEvent),
    Malformed { reason: String },
}

/// Outbound half of the transport as seen by components that only signal.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: ClientFrame) -> Result<(), ConnectionError>;
}

/// Supplies the ambient credential attached to the upgrade request.
pub trait CredentialSource: Send + Sync {
    fn cookie_header(&self, url: &Url) -> Option<String>;
}

impl CredentialSource for reqwest::cookie::Jar {
    fn cookie_header(&self, url: &Url) -> Option<String> {
        reqwest::cookie::CookieStore::cookies(self, url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }
}

pub struct ConnectionManager {
    url: Url,
    credential_url: Option<Url>,
    credentials: Option<Arc<dyn CredentialSource>>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    wants_connected: watch::Sender<bool>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        settings: &ClientSettings,
        credentials: Option<Arc<dyn CredentialSource>>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let url = settings.websocket_url()?;
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (wants_connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(settings.event_buffer.max(16));
        Ok(Arc::new(Self {
            url,
            credential_url: settings.http_url().ok(),
            credentials,
            policy: settings.reconnect_policy(),
            state,
            wants_connected,
            outbound: Mutex::new(None),
            runner: Mutex::new(None),
            events,
        }))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Starts the background connect/reconnect loop. No-op while it already runs.
    pub async fn connect(self: &Arc<Self>) {
        let mut runner = self.runner.lock().await;
        if runner.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        self.wants_connected.send_replace(true);
        let manager = Arc::clone(self);
        *runner = Some(tokio::spawn(async move { manager.run().await }));
    }

    /// Stops the loop for good: cancels pending reconnect delays, closes the
    /// socket and returns to `Idle`. A concurrent `connect` waits until the
    /// old loop has stopped.
    pub async fn disconnect(&self) {
        let mut runner = self.runner.lock().await;
        self.wants_connected.send_replace(false);
        if let Some(mut handle) = runner.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle)
                .await
                .is_err()
            {
                warn!(url = %self.url, "ws: loop did not stop in time; aborting");
                handle.abort();
            }
        }
        self.outbound.lock().await.take();
        self.set_state(ConnectionState::Idle);
        info!(url = %self.url, "ws: disconnected");
    }

    pub async fn send(&self, frame: ClientFrame) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Open {
            return Err(ConnectionError::NotConnected);
        }
        let payload = frame.to_json()?;
        let guard = self.outbound.lock().await;
        let tx = guard.as_ref().ok_or(ConnectionError::NotConnected)?;
        tx.send(Message::Text(payload))
            .map_err(|_| ConnectionError::NotConnected)?;
        debug!(recipient = %frame.recipient(), "ws: frame queued");
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut wants = self.wants_connected.subscribe();
        let mut attempt: u32 = 0;

        while *wants.borrow_and_update() {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                result = self.open_socket() => result,
                _ = wait_for_disconnect(&mut wants) => break,
            };

            match connected {
                Ok(stream) => {
                    attempt = 0;
                    info!(url = %self.url, "ws: connected");
                    self.pump(stream, &mut wants).await;
                }
                Err(err) => {
                    warn!(url = %self.url, attempt, "ws: connect failed: {err}");
                }
            }

            self.set_state(ConnectionState::Closed);
            if !*wants.borrow() {
                break;
            }

            let delay = self.policy.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            info!(
                url = %self.url,
                delay_ms = delay.as_millis() as u64,
                "ws: disconnected; scheduling reconnect"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_disconnect(&mut wants) => break,
            }
        }

        self.set_state(ConnectionState::Idle);
    }

    async fn open_socket(&self) -> Result<WsStream, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectionError::InvalidUrl(err.to_string()))?;
        if let Some(cookie) = self.cookie_header() {
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    request.headers_mut().insert(COOKIE, value);
                }
                Err(err) => warn!("ws: skipping unusable cookie header: {err}"),
            }
        }
        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| ConnectionError::Transport(err.to_string()))?;
        Ok(stream)
    }

    fn cookie_header(&self) -> Option<String> {
        let credentials = self.credentials.as_ref()?;
        let url = self.credential_url.as_ref()?;
        credentials.cookie_header(url)
    }

    async fn pump(&self, stream: WsStream, wants: &mut watch::Receiver<bool>) {
        let (mut writer, mut reader) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().await = Some(tx);
        self.set_state(ConnectionState::Open);

        loop {
            tokio::select! {
                inbound = reader.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.dispatch_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "ws: server closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("ws: receive failed: {err}");
                        break;
                    }
                    None => {
                        info!("ws: stream ended");
                        break;
                    }
                },
                outbound = rx.recv() => match outbound {
                    Some(message) => {
                        if let Err(err) = writer.send(message).await {
                            warn!("ws: send failed: {err}");
                            break;
                        }
                    }
                    None => break,
                },
                _ = wait_for_disconnect(wants) => {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        self.outbound.lock().await.take();
    }

    fn dispatch_text(&self, text: &str) {
        match InboundEvent::parse(text) {
            Ok(event) => {
                debug!(kind = event.kind(), "ws: inbound frame");
                let _ = self.events.send(ConnectionEvent::Inbound(event));
            }
            Err(err) => {
                warn!("ws: dropping malformed frame: {err}");
                let _ = self.events.send(ConnectionEvent::Malformed {
                    reason: err.to_string(),
                });
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = ?next, "ws: state changed");
            let _ = self.events.send(ConnectionEvent::StateChanged(next));
        }
    }
}

#[async_trait]
impl FrameSink for ConnectionManager {
    async fn send(&self, frame: ClientFrame) -> Result<(), ConnectionError> {
        ConnectionManager::send(self, frame).await
    }
}

async fn wait_for_disconnect(wants: &mut watch::Receiver<bool>) {
    while *wants.borrow_and_update() {
        if wants.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
