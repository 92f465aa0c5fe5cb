use super::*;
use std::{sync::Mutex as StdMutex, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::{
    domain::Contact,
    protocol::{IceCandidate, PresenceEntry, SessionDescription, UserSummary},
};
use tokio::{net::TcpListener, sync::mpsc};

use crate::error::CollaboratorError;

#[derive(Default)]
struct FakeBackend {
    people: Vec<UserSummary>,
    history: HashMap<UserId, Vec<Message>>,
    refuse: bool,
    calls: StdMutex<Vec<String>>,
}

impl FakeBackend {
    fn record(&self, call: String) {
        self.calls.lock().expect("backend lock").push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("backend lock").clone()
    }

    fn outcome(&self) -> Result<(), CollaboratorError> {
        if self.refuse {
            Err(CollaboratorError::Rejected("not allowed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn profile(&self) -> Result<UserSummary, CollaboratorError> {
        Ok(person("me", "Me"))
    }

    async fn login(&self, credentials: &Credentials) -> Result<UserSummary, CollaboratorError> {
        Ok(person("me", &credentials.username))
    }

    async fn register(&self, credentials: &Credentials) -> Result<UserSummary, CollaboratorError> {
        Ok(person("me", &credentials.username))
    }

    async fn logout(&self) -> Result<(), CollaboratorError> {
        self.record("logout".to_string());
        Ok(())
    }

    async fn people(&self) -> Result<Vec<UserSummary>, CollaboratorError> {
        Ok(self.people.clone())
    }

    async fn messages(&self, contact: &UserId) -> Result<Vec<Message>, CollaboratorError> {
        self.record(format!("history {contact}"));
        Ok(self.history.get(contact).cloned().unwrap_or_default())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), CollaboratorError> {
        self.record(format!("delete message {message_id}"));
        self.outcome()
    }

    async fn delete_user(&self, user_id: &UserId) -> Result<(), CollaboratorError> {
        self.record(format!("delete user {user_id}"));
        self.outcome()
    }
}

fn person(id: &str, name: &str) -> UserSummary {
    UserSummary {
        id: UserId::from(id),
        username: name.to_string(),
    }
}

fn chat(id: &str, sender: &str, recipient: &str, text: &str) -> Message {
    Message {
        id: MessageId::from(id),
        sender: UserId::from(sender),
        recipient: UserId::from(recipient),
        text: Some(text.to_string()),
        attachment: None,
        created_at: None,
    }
}

fn identity() -> SessionIdentity {
    SessionIdentity {
        user_id: UserId::from("me"),
        username: "Me".to_string(),
    }
}

fn settings_for(server_url: &str) -> ClientSettings {
    ClientSettings {
        server_url: server_url.to_string(),
        reconnect_delay_ms: 50,
        reconnect_max_delay_ms: 50,
        ..ClientSettings::default()
    }
}

fn offline_session(backend: Arc<FakeBackend>) -> Arc<ChatSession> {
    ChatSession::new(
        identity(),
        &settings_for("http://127.0.0.1:9"),
        SessionCollaborators::without_media(backend),
    )
    .expect("session")
}

#[derive(Clone)]
struct WsState {
    script: Arc<Vec<String>>,
    received: mpsc::UnboundedSender<String>,
    cookies: Arc<StdMutex<Vec<String>>>,
}

async fn ws_route(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<WsState>,
) -> Response {
    if let Some(cookie) = headers.get(header::COOKIE) {
        state
            .cookies
            .lock()
            .expect("cookies lock")
            .push(cookie.to_str().unwrap_or_default().to_string());
    }
    ws.on_upgrade(move |socket| serve_socket(state, socket))
}

async fn serve_socket(state: WsState, mut socket: WebSocket) {
    for frame in state.script.iter() {
        if socket.send(WsMessage::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            let _ = state.received.send(text);
        }
    }
}

async fn login_route(Json(body): Json<serde_json::Value>) -> Response {
    if body["password"] != "secret" {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (
        [(header::SET_COOKIE, "token=session-1; Path=/")],
        Json(json!({ "user": { "_id": "me", "username": body["username"] } })),
    )
        .into_response()
}

struct ChatServer {
    url: String,
    received: mpsc::UnboundedReceiver<String>,
    cookies: Arc<StdMutex<Vec<String>>>,
}

async fn spawn_chat_server(script: Vec<String>) -> ChatServer {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (received_tx, received_rx) = mpsc::unbounded_channel();
    let cookies = Arc::new(StdMutex::new(Vec::new()));
    let state = WsState {
        script: Arc::new(script),
        received: received_tx,
        cookies: cookies.clone(),
    };
    let app = Router::new()
        .route("/", get(ws_route))
        .route("/login", post(login_route))
        .route("/people", get(|| async { Json(json!([])) }))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    ChatServer {
        url: format!("http://{addr}"),
        received: received_rx,
        cookies,
    }
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("session event");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event observed")
}

async fn wait_until_open(session: &ChatSession) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.connection_state() != ConnectionState::Open {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection open");
}

fn names(contacts: &[Contact]) -> Vec<String> {
    contacts.iter().map(|c| c.display_name.clone()).collect()
}

#[tokio::test]
async fn start_seeds_roster_and_applies_presence_snapshots() {
    let server = spawn_chat_server(vec![json!({
        "online": [
            { "userId": "a", "username": "Alice" },
            { "userId": "me", "username": "Me" },
        ]
    })
    .to_string()])
    .await;
    let backend = Arc::new(FakeBackend {
        people: vec![person("a", "Alice"), person("c", "Carol")],
        ..FakeBackend::default()
    });
    let session = ChatSession::new(
        identity(),
        &settings_for(&server.url),
        SessionCollaborators::without_media(backend),
    )
    .expect("session");
    let mut events = session.subscribe_events();

    session.start().await.expect("start");

    let event = wait_for_event(&mut events, |event| {
        matches!(event, SessionEvent::RosterUpdated(roster) if !roster.online.is_empty())
    })
    .await;
    let SessionEvent::RosterUpdated(roster) = event else {
        panic!("expected roster update");
    };
    assert_eq!(names(&roster.online), vec!["Alice"]);
    assert_eq!(names(&roster.offline), vec!["Carol"]);

    session.shutdown().await;
    assert_eq!(session.connection_state(), ConnectionState::Idle);
}

#[tokio::test]
async fn sent_messages_are_echoed_after_transmission() {
    let mut server = spawn_chat_server(Vec::new()).await;
    let backend = Arc::new(FakeBackend::default());
    let session = ChatSession::new(
        identity(),
        &settings_for(&server.url),
        SessionCollaborators::without_media(backend),
    )
    .expect("session");
    session.start().await.expect("start");
    wait_until_open(&session).await;

    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");
    session.send_message("hello").await.expect("send");

    let frame = tokio::time::timeout(Duration::from_secs(5), server.received.recv())
        .await
        .expect("timely")
        .expect("frame");
    let frame: serde_json::Value = serde_json::from_str(&frame).expect("json");
    assert_eq!(frame["recipient"], "b");
    assert_eq!(frame["text"], "hello");

    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].id.is_provisional());
    assert_eq!(messages[0].sender, UserId::from("me"));

    session.shutdown().await;
}

#[tokio::test]
async fn sending_requires_selection_and_content() {
    let session = offline_session(Arc::new(FakeBackend::default()));

    assert!(matches!(
        session.send_message("hi").await,
        Err(SessionError::NoContactSelected)
    ));
    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");
    assert!(matches!(
        session.send_message("   ").await,
        Err(SessionError::EmptyMessage)
    ));
    assert!(matches!(
        session.send_file("empty.txt", &[]).await,
        Err(SessionError::EmptyMessage)
    ));
}

#[tokio::test]
async fn sending_while_disconnected_fails_without_echo() {
    let session = offline_session(Arc::new(FakeBackend::default()));
    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");

    let err = session.send_message("hello").await.expect_err("offline");
    assert!(matches!(
        err,
        SessionError::Connection(ConnectionError::NotConnected)
    ));
    assert!(session.messages().await.is_empty());
}

#[tokio::test]
async fn selecting_a_contact_loads_history_and_clears_unread() {
    let backend = Arc::new(FakeBackend {
        history: HashMap::from([(
            UserId::from("b"),
            vec![chat("h1", "b", "me", "earlier"), chat("h2", "me", "b", "reply")],
        )]),
        ..FakeBackend::default()
    });
    let session = offline_session(backend.clone());
    session
        .handle_inbound(InboundEvent::ChatMessage(chat("n1", "b", "me", "ping")))
        .await;
    assert_eq!(session.unread_counts().await.get(&UserId::from("b")), Some(&1));

    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");

    assert!(session.unread_counts().await.is_empty());
    let texts: Vec<String> = session
        .messages()
        .await
        .into_iter()
        .filter_map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["earlier", "reply"]);
    assert_eq!(backend.calls(), vec!["history b".to_string()]);
}

#[tokio::test]
async fn inbound_messages_count_unread_only_for_other_contacts() {
    let session = offline_session(Arc::new(FakeBackend::default()));
    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");
    let mut events = session.subscribe_events();

    session
        .handle_inbound(InboundEvent::ChatMessage(chat("1", "b", "me", "from b")))
        .await;
    session
        .handle_inbound(InboundEvent::ChatMessage(chat("2", "c", "me", "from c")))
        .await;
    session
        .handle_inbound(InboundEvent::ChatMessage(chat("2", "c", "me", "from c")))
        .await;

    assert_eq!(
        session.unread_counts().await,
        HashMap::from([(UserId::from("c"), 1)])
    );
    assert_eq!(session.messages().await.len(), 1);
    wait_for_event(&mut events, |event| {
        matches!(event, SessionEvent::UnreadUpdated(counts) if counts.contains_key(&UserId::from("c")))
    })
    .await;
}

#[tokio::test]
async fn server_copy_replaces_optimistic_echo() {
    let session = offline_session(Arc::new(FakeBackend::default()));
    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");
    session
        .echo(UserId::from("b"), Some("hello".to_string()), None)
        .await;

    session
        .handle_inbound(InboundEvent::ChatMessage(chat("srv-9", "me", "b", "hello")))
        .await;

    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId::from("srv-9"));
}

#[tokio::test]
async fn failed_deletion_keeps_the_message() {
    let backend = Arc::new(FakeBackend {
        refuse: true,
        ..FakeBackend::default()
    });
    let session = offline_session(backend.clone());
    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");
    session
        .handle_inbound(InboundEvent::ChatMessage(chat("m1", "b", "me", "keep me")))
        .await;

    let err = session
        .delete_message(&MessageId::from("m1"))
        .await
        .expect_err("refused");
    assert!(matches!(
        err,
        SessionError::Collaborator(CollaboratorError::Rejected(_))
    ));
    assert_eq!(session.messages().await.len(), 1);

    let err = session
        .delete_message(&MessageId::from("nope"))
        .await
        .expect_err("unknown");
    assert!(matches!(err, SessionError::UnknownMessage(_)));
    assert_eq!(backend.calls().len(), 2);
}

#[tokio::test]
async fn acknowledged_deletion_removes_the_message() {
    let session = offline_session(Arc::new(FakeBackend::default()));
    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");
    session
        .handle_inbound(InboundEvent::ChatMessage(chat("m1", "b", "me", "bye")))
        .await;

    session
        .delete_message(&MessageId::from("m1"))
        .await
        .expect("deleted");
    assert!(session.messages().await.is_empty());
}

#[tokio::test]
async fn deleting_a_contact_forgets_presence_and_conversation() {
    let backend = Arc::new(FakeBackend {
        people: vec![person("b", "Bob")],
        ..FakeBackend::default()
    });
    let session = offline_session(backend.clone());
    session.refresh_people().await.expect("people");
    session
        .handle_inbound(InboundEvent::PresenceSnapshot(vec![PresenceEntry {
            user_id: UserId::from("b"),
            username: "Bob".to_string(),
        }]))
        .await;
    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");
    session
        .handle_inbound(InboundEvent::ChatMessage(chat("m1", "b", "me", "hi")))
        .await;

    session
        .delete_contact(&UserId::from("b"))
        .await
        .expect("deleted");

    assert_eq!(session.roster().await, Roster::default());
    assert!(session.selected_contact().await.is_none());
    assert!(session.messages().await.is_empty());
    assert!(backend.calls().contains(&"delete user b".to_string()));
}

#[tokio::test]
async fn departures_move_contacts_offline() {
    let session = offline_session(Arc::new(FakeBackend::default()));
    session
        .handle_inbound(InboundEvent::PresenceSnapshot(vec![PresenceEntry {
            user_id: UserId::from("a"),
            username: "Alice".to_string(),
        }]))
        .await;
    session
        .handle_inbound(InboundEvent::PresenceDeparture {
            user_id: UserId::from("a"),
        })
        .await;

    let roster = session.roster().await;
    assert!(roster.online.is_empty());
    assert_eq!(names(&roster.offline), vec!["Alice"]);
}

#[tokio::test]
async fn offers_without_sender_go_to_the_selected_contact() {
    let session = offline_session(Arc::new(FakeBackend::default()));
    let mut events = session.subscribe_events();
    let offer = SessionDescription::offer("v=0\r\nm=audio 9\r\n");

    session
        .handle_inbound(InboundEvent::CallOffer {
            from: None,
            mode: None,
            offer: offer.clone(),
        })
        .await;
    wait_for_event(&mut events, |event| {
        matches!(event, SessionEvent::Error(reason) if reason == &CallError::UnknownOfferer.to_string())
    })
    .await;

    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");
    session
        .handle_inbound(InboundEvent::CallOffer {
            from: None,
            mode: None,
            offer,
        })
        .await;
    wait_for_event(&mut events, |event| {
        matches!(event, SessionEvent::Error(reason) if reason.contains("no capture backend"))
    })
    .await;
    assert!(session.call_state().is_idle());
}

#[tokio::test]
async fn start_call_without_media_reports_and_stays_idle() {
    let session = offline_session(Arc::new(FakeBackend::default()));
    assert!(matches!(
        session.start_call(CallMode::Audio).await,
        Err(SessionError::NoContactSelected)
    ));

    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");
    let err = session
        .start_call(CallMode::Video)
        .await
        .expect_err("no media");
    assert!(matches!(
        err,
        SessionError::Call(CallError::MediaAccess(_))
    ));
    assert!(session.call_state().is_idle());

    session.end_call().await;
    assert!(session.call_state().is_idle());
}

#[tokio::test]
async fn logout_signs_out_and_stops_the_transport() {
    let server = spawn_chat_server(Vec::new()).await;
    let backend = Arc::new(FakeBackend::default());
    let session = ChatSession::new(
        identity(),
        &settings_for(&server.url),
        SessionCollaborators::without_media(backend.clone()),
    )
    .expect("session");
    session.start().await.expect("start");
    wait_until_open(&session).await;

    session.logout().await.expect("logout");

    assert_eq!(backend.calls(), vec!["logout".to_string()]);
    assert_eq!(session.connection_state(), ConnectionState::Idle);
}

#[tokio::test]
async fn sign_in_shares_the_session_cookie_with_the_transport() {
    let server = spawn_chat_server(Vec::new()).await;
    let credentials = Credentials {
        username: "alice".to_string(),
        password: "secret".to_string(),
    };

    let session = ChatSession::sign_in(
        &settings_for(&server.url),
        &credentials,
        false,
        Arc::new(MissingMediaDevices),
        Arc::new(MissingPeerConnector),
    )
    .await
    .expect("signed in");
    assert_eq!(session.identity().user_id, UserId::from("me"));
    assert_eq!(session.identity().username, "alice");

    session.start().await.expect("start");
    wait_until_open(&session).await;
    assert_eq!(
        server.cookies.lock().expect("cookies lock").clone(),
        vec!["token=session-1".to_string()]
    );

    session.shutdown().await;
}

struct SilentStream;

impl media::MediaStream for SilentStream {
    fn id(&self) -> String {
        "local".to_string()
    }

    fn track_kinds(&self) -> Vec<media::TrackKind> {
        vec![media::TrackKind::Audio]
    }

    fn stop(&self) {}
}

struct ReadyDevices;

#[async_trait]
impl MediaDevices for ReadyDevices {
    async fn acquire(
        &self,
        _constraints: media::MediaConstraints,
    ) -> Result<Arc<dyn media::MediaStream>, media::MediaError> {
        Ok(Arc::new(SilentStream))
    }
}

struct LoopbackPeer {
    events: broadcast::Sender<media::PeerEvent>,
    candidates: StdMutex<Vec<String>>,
}

#[async_trait]
impl media::PeerSession for LoopbackPeer {
    async fn add_local_stream(&self, _stream: Arc<dyn media::MediaStream>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0\r\nm=audio 9\r\n"))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0\r\nm=audio 9\r\n"))
    }

    async fn set_local_description(&self, _description: SessionDescription) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _description: SessionDescription,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        self.candidates
            .lock()
            .expect("peer lock")
            .push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<media::PeerEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
struct LoopbackConnector {
    sessions: StdMutex<Vec<Arc<LoopbackPeer>>>,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        _config: media::PeerConfig,
    ) -> anyhow::Result<Arc<dyn media::PeerSession>> {
        let (events, _) = broadcast::channel(8);
        let peer = Arc::new(LoopbackPeer {
            events,
            candidates: StdMutex::new(Vec::new()),
        });
        self.sessions
            .lock()
            .expect("connector lock")
            .push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[tokio::test]
async fn candidate_right_behind_an_offer_is_applied_once_answered() {
    let mut server = spawn_chat_server(Vec::new()).await;
    let connector = Arc::new(LoopbackConnector::default());
    let session = ChatSession::new(
        identity(),
        &settings_for(&server.url),
        SessionCollaborators {
            backend: Arc::new(FakeBackend::default()),
            credentials: None,
            devices: Arc::new(ReadyDevices),
            connector: connector.clone(),
        },
    )
    .expect("session");
    session.start().await.expect("start");
    wait_until_open(&session).await;

    session
        .handle_inbound(InboundEvent::CallOffer {
            from: Some(UserId::from("peer")),
            mode: Some(CallMode::Audio),
            offer: SessionDescription::offer("v=0\r\nm=audio 9\r\n"),
        })
        .await;
    session
        .handle_inbound(InboundEvent::IceCandidate {
            from: Some(UserId::from("peer")),
            candidate: IceCandidate {
                candidate: "candidate:trailing".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            },
        })
        .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while !matches!(session.call_state(), CallState::Connected { .. }) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("call connected");

    let sessions = connector.sessions.lock().expect("connector lock").clone();
    assert_eq!(sessions.len(), 1);
    assert_eq!(
        sessions[0].candidates.lock().expect("peer lock").clone(),
        vec!["candidate:trailing".to_string()]
    );

    let answer = tokio::time::timeout(Duration::from_secs(5), server.received.recv())
        .await
        .expect("timely")
        .expect("answer frame");
    let value: serde_json::Value = serde_json::from_str(&answer).expect("json");
    assert_eq!(value["type"], "answer");
    assert_eq!(value["recipient"], "peer");

    session.shutdown().await;
}

#[tokio::test]
async fn lagging_dispatcher_reports_and_reloads_the_open_conversation() {
    let backend = Arc::new(FakeBackend {
        people: vec![person("b", "Bob")],
        history: HashMap::from([(
            UserId::from("b"),
            vec![chat("h1", "b", "me", "missed while lagging")],
        )]),
        ..FakeBackend::default()
    });
    let session = offline_session(backend.clone());
    session
        .select_contact(UserId::from("b"))
        .await
        .expect("select");
    let mut events = session.subscribe_events();

    session.resync(40).await;

    wait_for_event(&mut events, |event| {
        matches!(event, SessionEvent::Error(reason) if reason.contains("missed 40"))
    })
    .await;
    assert_eq!(
        backend.calls(),
        vec!["history b".to_string(), "history b".to_string()]
    );
    assert_eq!(session.messages().await[0].id, MessageId::from("h1"));
    assert_eq!(names(&session.roster().await.offline), vec!["Bob"]);
}
