use std::sync::Arc;

use media::{
    MediaConstraints, MediaDevices, MediaStream, PeerConfig, PeerConnector, PeerEvent,
    PeerSession,
};
use shared::{
    domain::{CallMode, UserId},
    protocol::{ClientFrame, IceCandidate, SessionDescription, SignalFrame},
};
use tokio::{
    sync::{broadcast::error::RecvError, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{connection::FrameSink, error::CallError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Waiting for local capture devices before an outgoing offer.
    Requesting { peer: UserId, mode: CallMode },
    Offering {
        peer: UserId,
        mode: CallMode,
        incoming: bool,
    },
    Connected { peer: UserId, mode: CallMode },
}

impl CallState {
    pub fn peer(&self) -> Option<&UserId> {
        match self {
            CallState::Idle => None,
            CallState::Requesting { peer, .. }
            | CallState::Offering { peer, .. }
            | CallState::Connected { peer, .. } => Some(peer),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle)
    }
}

struct ActiveCall {
    generation: u64,
    peer: UserId,
    mode: CallMode,
    local_stream: Option<Arc<dyn MediaStream>>,
    remote_stream: Option<Arc<dyn MediaStream>>,
    session: Option<Arc<dyn PeerSession>>,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    /// False until our offer or answer is on the wire.
    signaled: bool,
    unsent_candidates: Vec<IceCandidate>,
    events_task: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(generation: u64, peer: UserId, mode: CallMode) -> Self {
        Self {
            generation,
            peer,
            mode,
            local_stream: None,
            remote_stream: None,
            session: None,
            remote_applied: false,
            pending_candidates: Vec::new(),
            signaled: false,
            unsent_candidates: Vec::new(),
            events_task: None,
        }
    }

    async fn release(self) {
        if let Some(task) = self.events_task {
            task.abort();
        }
        if let Some(stream) = self.local_stream {
            stream.stop();
        }
        if let Some(stream) = self.remote_stream {
            stream.stop();
        }
        if let Some(session) = self.session {
            if let Err(err) = session.close().await {
                warn!(peer_id = %self.peer, "call: closing peer session failed: {err:#}");
            }
        }
    }
}

/// An offer that holds the call slot but has not been answered yet.
#[derive(Debug)]
pub struct IncomingCall {
    generation: u64,
    peer: UserId,
    mode: CallMode,
    offer: SessionDescription,
}

impl IncomingCall {
    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }
}

#[derive(Default)]
struct CallInner {
    generation: u64,
    active: Option<ActiveCall>,
}

impl CallInner {
    fn current(&mut self, generation: u64) -> Option<&mut ActiveCall> {
        self.active
            .as_mut()
            .filter(|active| active.generation == generation)
    }
}

/// One-to-one call negotiation. Each call attempt carries a generation; an
/// attempt that resumes after `end_call` finds its generation gone and
/// releases whatever it acquired.
pub struct CallStateMachine {
    local_user: UserId,
    signaling: Arc<dyn FrameSink>,
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    peer_config: PeerConfig,
    state: watch::Sender<CallState>,
    inner: Mutex<CallInner>,
}

impl CallStateMachine {
    pub fn new(
        local_user: UserId,
        signaling: Arc<dyn FrameSink>,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        ice_servers: Vec<String>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(CallState::Idle);
        Arc::new(Self {
            local_user,
            signaling,
            devices,
            connector,
            peer_config: PeerConfig { ice_servers },
            state,
            inner: Mutex::new(CallInner::default()),
        })
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    pub async fn local_stream(&self) -> Option<Arc<dyn MediaStream>> {
        let inner = self.inner.lock().await;
        inner.active.as_ref()?.local_stream.clone()
    }

    pub async fn remote_stream(&self) -> Option<Arc<dyn MediaStream>> {
        let inner = self.inner.lock().await;
        inner.active.as_ref()?.remote_stream.clone()
    }

    pub async fn start_call(
        self: &Arc<Self>,
        peer: UserId,
        mode: CallMode,
    ) -> Result<(), CallError> {
        let generation = {
            let mut inner = self.inner.lock().await;
            if let Some(active) = &inner.active {
                return Err(CallError::AlreadyActive {
                    active: active.peer.clone(),
                });
            }
            inner.generation += 1;
            let generation = inner.generation;
            inner.active = Some(ActiveCall::new(generation, peer.clone(), mode));
            self.set_state(CallState::Requesting {
                peer: peer.clone(),
                mode,
            });
            generation
        };
        info!(peer_id = %peer, %mode, "call: starting outgoing call");

        match self.negotiate_outgoing(generation, &peer, mode).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(peer_id = %peer, "call: outgoing call failed: {err}");
                self.abandon(generation).await;
                Err(err)
            }
        }
    }

    async fn negotiate_outgoing(
        self: &Arc<Self>,
        generation: u64,
        peer: &UserId,
        mode: CallMode,
    ) -> Result<(), CallError> {
        let stream = self
            .devices
            .acquire(MediaConstraints::for_mode(mode))
            .await?;
        self.adopt_local_stream(generation, &stream).await?;
        let session = self.open_session(generation).await?;

        session
            .add_local_stream(stream)
            .await
            .map_err(negotiation)?;
        let offer = session.create_offer().await.map_err(negotiation)?;
        session
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;

        // Answers are only accepted while Offering.
        self.transition(
            generation,
            CallState::Offering {
                peer: peer.clone(),
                mode,
                incoming: false,
            },
        )
        .await?;
        self.signaling
            .send(ClientFrame::Signal(SignalFrame::Offer {
                recipient: peer.clone(),
                sender: Some(self.local_user.clone()),
                mode: Some(mode),
                offer,
            }))
            .await?;
        info!(peer_id = %peer, "call: offer sent");
        self.release_local_candidates(generation).await
    }

    /// Callee path. Rejects with a collision while any call is in progress.
    pub async fn handle_offer(
        self: &Arc<Self>,
        from: UserId,
        mode: Option<CallMode>,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        let call = self.begin_incoming(from, mode, offer).await?;
        self.answer_incoming(call).await
    }

    /// Claims the call slot for an offer without waiting on media, so
    /// candidates that follow the offer are buffered rather than dropped.
    pub async fn begin_incoming(
        &self,
        from: UserId,
        mode: Option<CallMode>,
        offer: SessionDescription,
    ) -> Result<IncomingCall, CallError> {
        let mode = mode.unwrap_or_else(|| CallMode::infer_from_sdp(&offer.sdp));
        let generation = {
            let mut inner = self.inner.lock().await;
            if let Some(active) = &inner.active {
                warn!(
                    active_peer = %active.peer,
                    offered_by = %from,
                    "call: rejecting offer while busy"
                );
                return Err(CallError::SignalingCollision {
                    active: active.peer.clone(),
                    offered_by: from,
                });
            }
            inner.generation += 1;
            let generation = inner.generation;
            inner.active = Some(ActiveCall::new(generation, from.clone(), mode));
            self.set_state(CallState::Offering {
                peer: from.clone(),
                mode,
                incoming: true,
            });
            generation
        };
        info!(peer_id = %from, %mode, "call: incoming offer");
        Ok(IncomingCall {
            generation,
            peer: from,
            mode,
            offer,
        })
    }

    /// Acquires media and answers an offer claimed by [`Self::begin_incoming`].
    pub async fn answer_incoming(self: &Arc<Self>, call: IncomingCall) -> Result<(), CallError> {
        let IncomingCall {
            generation,
            peer,
            mode,
            offer,
        } = call;
        match self.negotiate_incoming(generation, &peer, mode, offer).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(peer_id = %peer, "call: answering offer failed: {err}");
                self.abandon(generation).await;
                Err(err)
            }
        }
    }

    async fn negotiate_incoming(
        self: &Arc<Self>,
        generation: u64,
        from: &UserId,
        mode: CallMode,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        let stream = self
            .devices
            .acquire(MediaConstraints::for_mode(mode))
            .await?;
        self.adopt_local_stream(generation, &stream).await?;
        let session = self.open_session(generation).await?;

        session
            .add_local_stream(stream)
            .await
            .map_err(negotiation)?;
        session
            .set_remote_description(offer)
            .await
            .map_err(negotiation)?;
        self.flush_candidates(generation, &session).await?;

        let answer = session.create_answer().await.map_err(negotiation)?;
        session
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;

        self.ensure_current(generation).await?;
        self.signaling
            .send(ClientFrame::Signal(SignalFrame::Answer {
                recipient: from.clone(),
                sender: Some(self.local_user.clone()),
                answer,
            }))
            .await?;
        self.release_local_candidates(generation).await?;

        self.transition(
            generation,
            CallState::Connected {
                peer: from.clone(),
                mode,
            },
        )
        .await?;
        info!(peer_id = %from, "call: answered");
        Ok(())
    }

    /// Caller path. Answers outside an outgoing offer, or from anyone but the
    /// callee, are ignored.
    pub async fn handle_answer(
        &self,
        from: Option<UserId>,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        let target = {
            let inner = self.inner.lock().await;
            let awaiting = matches!(
                *self.state.borrow(),
                CallState::Offering {
                    incoming: false,
                    ..
                }
            );
            match inner.active.as_ref() {
                Some(active)
                    if awaiting
                        && !active.remote_applied
                        && from.as_ref().map_or(true, |sender| sender == &active.peer) =>
                {
                    active.session.clone().map(|session| {
                        (active.generation, active.peer.clone(), active.mode, session)
                    })
                }
                _ => None,
            }
        };
        let Some((generation, peer, mode, session)) = target else {
            warn!(sender = ?from, "call: ignoring unexpected answer");
            return Ok(());
        };

        if let Err(err) = session.set_remote_description(answer).await {
            let err = negotiation(err);
            warn!(peer_id = %peer, "call: applying answer failed: {err}");
            self.abandon(generation).await;
            return Err(err);
        }
        self.flush_candidates(generation, &session).await?;
        self.transition(
            generation,
            CallState::Connected {
                peer: peer.clone(),
                mode,
            },
        )
        .await?;
        info!(peer_id = %peer, "call: connected");
        Ok(())
    }

    /// Adds a remote candidate, buffering it until the remote description is
    /// in place. Without a call the candidate is dropped.
    pub async fn handle_ice_candidate(
        &self,
        from: Option<UserId>,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        let session = {
            let mut inner = self.inner.lock().await;
            let Some(active) = inner.active.as_mut() else {
                debug!(sender = ?from, "call: ignoring candidate without a call");
                return Ok(());
            };
            if from.as_ref().is_some_and(|sender| sender != &active.peer) {
                warn!(
                    sender = ?from,
                    peer_id = %active.peer,
                    "call: ignoring candidate from another party"
                );
                return Ok(());
            }
            match (&active.session, active.remote_applied) {
                (Some(session), true) => Arc::clone(session),
                _ => {
                    active.pending_candidates.push(candidate);
                    debug!(
                        buffered = active.pending_candidates.len(),
                        "call: buffering remote candidate"
                    );
                    return Ok(());
                }
            }
        };
        session
            .add_ice_candidate(candidate)
            .await
            .map_err(negotiation)
    }

    /// Releases media and the peer session. Safe to call in any state.
    pub async fn end_call(&self) {
        let active = {
            let mut inner = self.inner.lock().await;
            let active = inner.active.take();
            self.set_state(CallState::Idle);
            active
        };
        if let Some(active) = active {
            let peer = active.peer.clone();
            active.release().await;
            info!(peer_id = %peer, "call: ended");
        }
    }

    async fn abandon(&self, generation: u64) {
        let active = {
            let mut inner = self.inner.lock().await;
            if inner.current(generation).is_none() {
                return;
            }
            self.set_state(CallState::Idle);
            inner.active.take()
        };
        if let Some(active) = active {
            active.release().await;
        }
    }

    async fn adopt_local_stream(
        &self,
        generation: u64,
        stream: &Arc<dyn MediaStream>,
    ) -> Result<(), CallError> {
        let adopted = {
            let mut inner = self.inner.lock().await;
            match inner.current(generation) {
                Some(active) => {
                    active.local_stream = Some(Arc::clone(&stream));
                    true
                }
                None => false,
            }
        };
        if adopted {
            return Ok(());
        }
        stream.stop();
        Err(CallError::Cancelled)
    }

    async fn open_session(
        self: &Arc<Self>,
        generation: u64,
    ) -> Result<Arc<dyn PeerSession>, CallError> {
        let session = self
            .connector
            .connect(self.peer_config.clone())
            .await
            .map_err(negotiation)?;
        let events = self.spawn_peer_events(generation, &session);

        let unclaimed = {
            let mut inner = self.inner.lock().await;
            match inner.current(generation) {
                Some(active) => {
                    active.session = Some(Arc::clone(&session));
                    active.events_task = Some(events);
                    None
                }
                None => Some(events),
            }
        };
        let Some(events) = unclaimed else {
            return Ok(session);
        };
        events.abort();
        if let Err(err) = session.close().await {
            warn!("call: closing cancelled peer session failed: {err:#}");
        }
        Err(CallError::Cancelled)
    }

    fn spawn_peer_events(
        self: &Arc<Self>,
        generation: u64,
        session: &Arc<dyn PeerSession>,
    ) -> JoinHandle<()> {
        let mut events = session.subscribe_events();
        let machine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PeerEvent::LocalCandidate(candidate)) => {
                        machine.forward_local_candidate(generation, candidate).await;
                    }
                    Ok(PeerEvent::RemoteStream(stream)) => {
                        machine.adopt_remote_stream(generation, stream).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "call: peer events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn forward_local_candidate(&self, generation: u64, candidate: IceCandidate) {
        let peer = {
            let mut inner = self.inner.lock().await;
            let Some(active) = inner.current(generation) else {
                return;
            };
            if !active.signaled {
                active.unsent_candidates.push(candidate);
                debug!(
                    held = active.unsent_candidates.len(),
                    "call: holding local candidate until description is sent"
                );
                return;
            }
            active.peer.clone()
        };
        self.send_local_candidate(&peer, candidate).await;
    }

    async fn send_local_candidate(&self, peer: &UserId, candidate: IceCandidate) {
        let frame = ClientFrame::Signal(SignalFrame::IceCandidate {
            recipient: peer.clone(),
            sender: Some(self.local_user.clone()),
            candidate,
        });
        if let Err(err) = self.signaling.send(frame).await {
            warn!(peer_id = %peer, "call: sending local candidate failed: {err}");
        }
    }

    /// Marks the local description as sent and signals the candidates
    /// gathered before it.
    async fn release_local_candidates(&self, generation: u64) -> Result<(), CallError> {
        let (peer, held) = {
            let mut inner = self.inner.lock().await;
            let active = inner.current(generation).ok_or(CallError::Cancelled)?;
            active.signaled = true;
            (
                active.peer.clone(),
                std::mem::take(&mut active.unsent_candidates),
            )
        };
        for candidate in held {
            self.send_local_candidate(&peer, candidate).await;
        }
        Ok(())
    }

    async fn adopt_remote_stream(&self, generation: u64, stream: Arc<dyn MediaStream>) {
        let mut inner = self.inner.lock().await;
        match inner.current(generation) {
            Some(active) => {
                debug!(stream_id = %stream.id(), "call: remote stream attached");
                if let Some(previous) = active.remote_stream.replace(stream) {
                    previous.stop();
                }
            }
            None => stream.stop(),
        }
    }

    async fn flush_candidates(
        &self,
        generation: u64,
        session: &Arc<dyn PeerSession>,
    ) -> Result<(), CallError> {
        let pending = {
            let mut inner = self.inner.lock().await;
            let active = inner.current(generation).ok_or(CallError::Cancelled)?;
            active.remote_applied = true;
            std::mem::take(&mut active.pending_candidates)
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "call: applying buffered candidates");
        }
        for candidate in pending {
            if let Err(err) = session.add_ice_candidate(candidate).await {
                warn!("call: buffered candidate rejected: {err:#}");
            }
        }
        Ok(())
    }

    async fn ensure_current(&self, generation: u64) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        inner
            .current(generation)
            .map(|_| ())
            .ok_or(CallError::Cancelled)
    }

    async fn transition(&self, generation: u64, next: CallState) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.current(generation).is_none() {
            return Err(CallError::Cancelled);
        }
        self.set_state(next);
        Ok(())
    }

    fn set_state(&self, next: CallState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = ?self.state.borrow(), "call: state changed");
        }
    }
}

fn negotiation(err: anyhow::Error) -> CallError {
    CallError::Negotiation(format!("{err:#}"))
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
