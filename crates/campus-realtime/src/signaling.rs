//! Peer-to-peer voice call negotiation.
//!
//! One call session per process, driven by the state machine
//! `idle → initiating → ringing → active → idle`. The media stack is an
//! injected capability (see [`crate::media`]): the engine acquires audio,
//! builds the peer connection, exchanges SDP through the channel and relays
//! ICE candidates, but never touches codecs or devices itself.
//!
//! Every continuation that resumes after an await re-checks the call epoch:
//! a reset (end, reject, failure, timeout) invalidates in-flight transitions,
//! which must release whatever they acquired and bail. Resource release runs
//! on every exit path in a fixed order: peer connection, local audio, remote
//! sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use campus_shared::error::SignalingError;
use campus_shared::protocol::{
    AckPayload, ClientEvent, IceCandidate, SessionDescription,
};
use campus_shared::types::{RoomId, UserId};

use crate::config::RealtimeConfig;
use crate::connection::ConnectionManager;
use crate::media::{AudioSource, MediaGateway, PeerConnectionHandle, PeerEvent, RemoteAudioSink};

const UPDATE_BUFFER: usize = 32;
const PEER_EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Initiating,
    Ringing,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub room: RoomId,
    pub caller: UserId,
    pub receiver: UserId,
    pub direction: CallDirection,
}

/// Observer snapshot of the call machine.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub session: Option<CallSession>,
    /// Error attached to idle after a failed attempt; distinct from a
    /// normal call-ended state.
    pub last_error: Option<String>,
}

/// Call lifecycle updates for the UI.
#[derive(Debug, Clone)]
pub enum CallUpdate {
    Ringing {
        room: RoomId,
        peer: UserId,
        direction: CallDirection,
    },
    Connected {
        room: RoomId,
    },
    /// Normal teardown: local end, local reject or remote hangup.
    Ended {
        room: RoomId,
    },
    /// The remote peer declined our call.
    Rejected {
        room: RoomId,
    },
    /// A ring went unanswered past the configured timeout.
    TimedOut {
        room: RoomId,
    },
    /// The attempt failed; dismissible error state.
    Failed {
        room: Option<RoomId>,
        reason: String,
    },
}

struct EngineState {
    phase: CallPhase,
    session: Option<CallSession>,
    /// Offer held on the receiver side until the user accepts.
    pending_offer: Option<SessionDescription>,
    /// Remote candidates that arrived before the remote description was set.
    queued_candidates: Vec<IceCandidate>,
    /// Local candidates gathered before the server assigned a room.
    pending_local_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    /// Bumped on every reset; in-flight continuations compare against it.
    epoch: u64,
    last_error: Option<String>,
}

impl EngineState {
    fn reset(&mut self, error: Option<String>) {
        self.phase = CallPhase::Idle;
        self.session = None;
        self.pending_offer = None;
        self.queued_candidates.clear();
        self.pending_local_candidates.clear();
        self.remote_description_set = false;
        self.epoch += 1;
        self.last_error = error;
    }

    fn room_matches(&self, room: &RoomId) -> bool {
        self.session.as_ref().is_some_and(|s| s.room == *room)
    }
}

#[derive(Default)]
struct CallResources {
    peer: Option<Arc<dyn PeerConnectionHandle>>,
    audio: Option<Arc<dyn AudioSource>>,
    remote_sink: Option<Arc<dyn RemoteAudioSink>>,
}

pub struct CallSignalingEngine {
    gateway: Arc<dyn MediaGateway>,
    connection: Arc<ConnectionManager>,
    state: Mutex<EngineState>,
    resources: Mutex<CallResources>,
    self_id: Mutex<Option<UserId>>,
    updates_tx: mpsc::Sender<CallUpdate>,
    ring_timeout: Duration,
}

impl CallSignalingEngine {
    pub fn new(
        gateway: Arc<dyn MediaGateway>,
        connection: Arc<ConnectionManager>,
        config: &RealtimeConfig,
    ) -> (Arc<Self>, mpsc::Receiver<CallUpdate>) {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let engine = Arc::new(Self {
            gateway,
            connection,
            state: Mutex::new(EngineState {
                phase: CallPhase::Idle,
                session: None,
                pending_offer: None,
                queued_candidates: Vec::new(),
                pending_local_candidates: Vec::new(),
                remote_description_set: false,
                epoch: 0,
                last_error: None,
            }),
            resources: Mutex::new(CallResources::default()),
            self_id: Mutex::new(None),
            updates_tx,
            ring_timeout: config.ring_timeout,
        });
        (engine, updates_rx)
    }

    pub fn bind_self(&self, user: UserId) {
        *self.self_id.lock().expect("self lock") = Some(user);
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let state = self.state.lock().expect("state lock");
        CallSnapshot {
            phase: state.phase,
            session: state.session.clone(),
            last_error: state.last_error.clone(),
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.state.lock().expect("state lock").phase
    }

    /// Start an outgoing call: acquire audio, build the peer connection,
    /// create the offer, have the server allocate a room, then ring.
    pub async fn initiate(self: &Arc<Self>, receiver: UserId) -> Result<RoomId, SignalingError> {
        let caller = self
            .self_user()
            .ok_or_else(|| SignalingError::PeerSetup("no local user bound".into()))?;

        let epoch = {
            let mut state = self.state.lock().expect("state lock");
            if state.phase != CallPhase::Idle {
                return Err(SignalingError::CallInProgress);
            }
            state.phase = CallPhase::Initiating;
            state.last_error = None;
            state.epoch
        };

        info!(receiver = %receiver.short(), "Initiating call");

        let audio = match self.gateway.acquire_audio().await {
            Ok(audio) => audio,
            Err(e) => return self.fail_call(None, e).await,
        };
        self.resources.lock().expect("resource lock").audio = Some(audio);
        self.guard_or_release(epoch).await?;

        let (event_tx, event_rx) = mpsc::channel(PEER_EVENT_BUFFER);
        let peer = match self.gateway.create_peer_connection(event_tx).await {
            Ok(peer) => peer,
            Err(e) => return self.fail_call(None, e).await,
        };
        self.resources.lock().expect("resource lock").peer = Some(peer.clone());
        self.spawn_peer_events(event_rx);
        self.guard_or_release(epoch).await?;

        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return self.fail_call(None, e).await,
        };
        if let Err(e) = peer.set_local_description(offer.clone()).await {
            return self.fail_call(None, e).await;
        }
        self.guard_or_release(epoch).await?;

        // The server allocates the room in its synchronous reply; nothing
        // asynchronous flows for this call before then.
        let room = match self
            .connection
            .request(ClientEvent::CallInitiate {
                receiver: receiver.clone(),
            })
            .await
        {
            Ok(AckPayload::RoomAssigned { room }) => room,
            Ok(AckPayload::Error { message }) => {
                return self.fail_call(None, SignalingError::RoomAllocation(message)).await;
            }
            Ok(other) => {
                return self
                    .fail_call(
                        None,
                        SignalingError::RoomAllocation(format!("unexpected ack: {other:?}")),
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .fail_call(None, SignalingError::RoomAllocation(e.to_string()))
                    .await;
            }
        };
        self.guard_or_release(epoch).await?;

        {
            let mut state = self.state.lock().expect("state lock");
            state.session = Some(CallSession {
                room: room.clone(),
                caller,
                receiver: receiver.clone(),
                direction: CallDirection::Outgoing,
            });
            state.phase = CallPhase::Ringing;
        }

        // Transmit the held offer scoped to the allocated room, then any
        // candidates gathered while the room was unknown.
        if let Err(e) = self
            .connection
            .publish(ClientEvent::CallOffer {
                room: room.clone(),
                description: offer,
            })
            .await
        {
            return self
                .fail_call(Some(room), SignalingError::RoomAllocation(e.to_string()))
                .await;
        }
        self.flush_pending_candidates(&room).await;

        self.spawn_ring_timeout(room.clone(), epoch);
        self.emit(CallUpdate::Ringing {
            room: room.clone(),
            peer: receiver,
            direction: CallDirection::Outgoing,
        })
        .await;

        Ok(room)
    }

    /// An incoming ring. The offer stays pending and no resources are
    /// acquired until the user accepts; a busy line auto-rejects.
    pub async fn handle_incoming(self: &Arc<Self>, room: RoomId, caller: UserId) {
        let Some(receiver) = self.self_user() else {
            warn!(%room, "Incoming call before login, ignoring");
            return;
        };

        let epoch = {
            let mut state = self.state.lock().expect("state lock");
            if state.phase != CallPhase::Idle {
                None
            } else {
                state.session = Some(CallSession {
                    room: room.clone(),
                    caller: caller.clone(),
                    receiver,
                    direction: CallDirection::Incoming,
                });
                state.phase = CallPhase::Ringing;
                state.last_error = None;
                Some(state.epoch)
            }
        };
        let epoch = match epoch {
            Some(epoch) => epoch,
            None => {
                warn!(%room, "Busy, auto-rejecting incoming call");
                if let Err(e) = self
                    .connection
                    .publish(ClientEvent::CallReject { room: room.clone() })
                    .await
                {
                    debug!(%room, error = %e, "Busy-reject publish failed");
                }
                return;
            }
        };

        info!(caller = %caller.short(), %room, "Incoming call");
        self.spawn_ring_timeout(room.clone(), epoch);
        self.emit(CallUpdate::Ringing {
            room,
            peer: caller,
            direction: CallDirection::Incoming,
        })
        .await;
    }

    /// Hold the caller's offer until accept; stale rooms are ignored.
    pub fn handle_offer(&self, room: &RoomId, description: SessionDescription) {
        let mut state = self.state.lock().expect("state lock");
        if state.phase == CallPhase::Ringing && state.room_matches(room) {
            state.pending_offer = Some(description);
        } else {
            debug!(%room, "Offer for a stale room ignored");
        }
    }

    /// Accept an incoming ring: acquire audio, build the peer connection,
    /// apply the held offer, answer. A missing pending offer means accept
    /// raced ahead of offer delivery — that fails loudly instead of
    /// producing a half-initialized call.
    pub async fn accept(self: &Arc<Self>, room: RoomId) -> Result<(), SignalingError> {
        let (epoch, offer) = {
            let mut state = self.state.lock().expect("state lock");
            let ringing_here = state.phase == CallPhase::Ringing
                && state.room_matches(&room)
                && state
                    .session
                    .as_ref()
                    .is_some_and(|s| s.direction == CallDirection::Incoming);
            if !ringing_here {
                warn!(%room, "Accept for a stale or already-resolved room ignored");
                return Ok(());
            }
            match state.pending_offer.take() {
                Some(offer) => (state.epoch, offer),
                None => {
                    drop(state);
                    return self
                        .fail_call(Some(room), SignalingError::MissingPendingOffer)
                        .await;
                }
            }
        };

        let audio = match self.gateway.acquire_audio().await {
            Ok(audio) => audio,
            Err(e) => return self.fail_call(Some(room), e).await,
        };
        self.resources.lock().expect("resource lock").audio = Some(audio);
        self.guard_or_release(epoch).await?;

        let (event_tx, event_rx) = mpsc::channel(PEER_EVENT_BUFFER);
        let peer = match self.gateway.create_peer_connection(event_tx).await {
            Ok(peer) => peer,
            Err(e) => return self.fail_call(Some(room), e).await,
        };
        self.resources.lock().expect("resource lock").peer = Some(peer.clone());
        self.spawn_peer_events(event_rx);
        self.guard_or_release(epoch).await?;

        if let Err(e) = peer.set_remote_description(offer).await {
            return self.fail_call(Some(room), e).await;
        }
        self.mark_remote_description_set();
        self.drain_queued_candidates(peer.as_ref()).await;

        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return self.fail_call(Some(room), e).await,
        };
        if let Err(e) = peer.set_local_description(answer.clone()).await {
            return self.fail_call(Some(room), e).await;
        }
        if let Err(e) = self
            .connection
            .publish(ClientEvent::CallAnswer {
                room: room.clone(),
                description: answer,
            })
            .await
        {
            return self
                .fail_call(Some(room), SignalingError::PeerSetup(e.to_string()))
                .await;
        }
        self.guard_or_release(epoch).await?;

        {
            let mut state = self.state.lock().expect("state lock");
            state.phase = CallPhase::Active;
        }
        info!(%room, "Call active");
        self.emit(CallUpdate::Connected { room }).await;
        Ok(())
    }

    /// Caller side: the receiver accepted, their answer becomes our remote
    /// description and the call is active.
    pub async fn handle_answer(self: &Arc<Self>, room: RoomId, description: SessionDescription) {
        let epoch = {
            let state = self.state.lock().expect("state lock");
            let ringing_out = state.phase == CallPhase::Ringing
                && state.room_matches(&room)
                && state
                    .session
                    .as_ref()
                    .is_some_and(|s| s.direction == CallDirection::Outgoing);
            if !ringing_out {
                debug!(%room, "Answer for a stale room ignored");
                return;
            }
            state.epoch
        };

        let Some(peer) = self.resources.lock().expect("resource lock").peer.clone() else {
            warn!(%room, "Answer arrived with no peer connection");
            return;
        };

        if let Err(e) = peer.set_remote_description(description).await {
            let _ = self.fail_call::<()>(Some(room), e).await;
            return;
        }
        self.mark_remote_description_set();
        self.drain_queued_candidates(peer.as_ref()).await;

        {
            let mut state = self.state.lock().expect("state lock");
            if state.epoch != epoch || !state.room_matches(&room) {
                debug!(%room, "Call reset while applying answer");
                return;
            }
            state.phase = CallPhase::Active;
        }
        info!(%room, "Call active");
        self.emit(CallUpdate::Connected { room }).await;
    }

    /// Informational on the caller side; the answer event carries the state
    /// transition.
    pub fn handle_accepted(&self, room: &RoomId) {
        debug!(%room, "Peer accepted the call");
    }

    /// Decline a ringing call. From idle or for a stale room this is a
    /// no-op — no crash, no resource release.
    pub async fn reject(self: &Arc<Self>, room: RoomId) -> Result<(), SignalingError> {
        {
            let mut state = self.state.lock().expect("state lock");
            if state.phase != CallPhase::Ringing || !state.room_matches(&room) {
                debug!(%room, "Reject outside a matching ring is a no-op");
                return Ok(());
            }
            state.reset(None);
        }

        if let Err(e) = self
            .connection
            .publish(ClientEvent::CallReject { room: room.clone() })
            .await
        {
            warn!(%room, error = %e, "Reject notification failed");
        }

        // The receiver acquired nothing while ringing; this only matters if
        // an outgoing ring is being torn down through reject.
        let resources = self.take_resources();
        release_resources(resources).await;
        self.emit(CallUpdate::Ended { room }).await;
        Ok(())
    }

    /// Hang up. Notifies the peer when a room is still known and releases
    /// resources exactly once, even if called twice in succession.
    pub async fn end(self: &Arc<Self>) {
        let room = {
            let mut state = self.state.lock().expect("state lock");
            if state.phase == CallPhase::Idle {
                debug!("End with no call in progress");
                return;
            }
            let room = state.session.as_ref().map(|s| s.room.clone());
            state.reset(None);
            room
        };

        if let Some(room) = &room {
            if let Err(e) = self
                .connection
                .publish(ClientEvent::CallEnd { room: room.clone() })
                .await
            {
                debug!(%room, error = %e, "End notification failed");
            }
        }

        let resources = self.take_resources();
        release_resources(resources).await;

        if let Some(room) = room {
            info!(%room, "Call ended locally");
            self.emit(CallUpdate::Ended { room }).await;
        }
    }

    /// Remote hangup. Duplicate or stale-room notifications are ignored
    /// rather than re-entering cleanup.
    pub async fn handle_remote_ended(self: &Arc<Self>, room: RoomId) {
        if !self.reset_if_current(&room) {
            debug!(%room, "Ended for a stale room ignored");
            return;
        }
        let resources = self.take_resources();
        release_resources(resources).await;
        info!(%room, "Call ended by peer");
        self.emit(CallUpdate::Ended { room }).await;
    }

    /// The remote peer declined our call.
    pub async fn handle_remote_rejected(self: &Arc<Self>, room: RoomId) {
        if !self.reset_if_current(&room) {
            debug!(%room, "Rejected for a stale room ignored");
            return;
        }
        let resources = self.take_resources();
        release_resources(resources).await;
        info!(%room, "Call rejected by peer");
        self.emit(CallUpdate::Rejected { room }).await;
    }

    /// Apply a relayed remote candidate, queueing it if it outran the
    /// remote description.
    pub async fn handle_candidate(&self, room: RoomId, candidate: IceCandidate) {
        let peer = {
            let mut state = self.state.lock().expect("state lock");
            if !state.room_matches(&room) {
                debug!(%room, "Candidate for a stale room dropped");
                return;
            }
            if !state.remote_description_set {
                state.queued_candidates.push(candidate);
                return;
            }
            self.resources.lock().expect("resource lock").peer.clone()
        };

        match peer {
            Some(peer) => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!(%room, error = %e, "Failed to apply remote candidate");
                }
            }
            None => {
                // Tolerate: the candidate beat the peer connection.
                let mut state = self.state.lock().expect("state lock");
                if state.room_matches(&room) {
                    state.queued_candidates.push(candidate);
                }
            }
        }
    }

    /// Mute or unmute the local track. Only valid while active; flips the
    /// enabled flag without renegotiation.
    pub fn set_muted(&self, muted: bool) -> Result<(), SignalingError> {
        if self.phase() != CallPhase::Active {
            return Err(SignalingError::NotInCall);
        }
        let audio = self
            .resources
            .lock()
            .expect("resource lock")
            .audio
            .clone()
            .ok_or(SignalingError::NotInCall)?;
        audio.set_enabled(!muted);
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn self_user(&self) -> Option<UserId> {
        self.self_id.lock().expect("self lock").clone()
    }

    fn mark_remote_description_set(&self) {
        self.state.lock().expect("state lock").remote_description_set = true;
    }

    /// Reset to idle if `room` is the live session's room. Returns whether
    /// the reset happened.
    fn reset_if_current(&self, room: &RoomId) -> bool {
        let mut state = self.state.lock().expect("state lock");
        if state.phase == CallPhase::Idle || !state.room_matches(room) {
            return false;
        }
        state.reset(None);
        true
    }

    fn take_resources(&self) -> CallResources {
        std::mem::take(&mut *self.resources.lock().expect("resource lock"))
    }

    /// Abort the attempt: reset to idle with the error attached, release
    /// everything, notify the peer if a room is known, surface the error.
    async fn fail_call<T>(
        self: &Arc<Self>,
        room: Option<RoomId>,
        error: SignalingError,
    ) -> Result<T, SignalingError> {
        warn!(error = %error, "Call attempt failed");
        {
            let mut state = self.state.lock().expect("state lock");
            state.reset(Some(error.to_string()));
        }
        let resources = self.take_resources();
        release_resources(resources).await;

        if let Some(room) = &room {
            if let Err(e) = self
                .connection
                .publish(ClientEvent::CallEnd { room: room.clone() })
                .await
            {
                debug!(%room, error = %e, "Failure teardown notification failed");
            }
        }

        self.emit(CallUpdate::Failed {
            room,
            reason: error.to_string(),
        })
        .await;
        Err(error)
    }

    /// Continuation guard: if the call was reset while we were suspended,
    /// release anything registered since the reset and bail.
    async fn guard_or_release(&self, epoch: u64) -> Result<(), SignalingError> {
        if self.state.lock().expect("state lock").epoch == epoch {
            return Ok(());
        }
        let resources = self.take_resources();
        release_resources(resources).await;
        Err(SignalingError::Cancelled)
    }

    async fn drain_queued_candidates(&self, peer: &dyn PeerConnectionHandle) {
        let queued: Vec<IceCandidate> = {
            let mut state = self.state.lock().expect("state lock");
            state.queued_candidates.drain(..).collect()
        };
        for candidate in queued {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(error = %e, "Failed to apply queued candidate");
            }
        }
    }

    /// Relay one locally gathered candidate, reading the room at send time.
    async fn relay_candidate(&self, candidate: IceCandidate) {
        let room = {
            let mut state = self.state.lock().expect("state lock");
            match state.session.as_ref().map(|s| s.room.clone()) {
                Some(room) => room,
                None => {
                    // Gathered before the server assigned a room; flushed
                    // once the offer goes out.
                    state.pending_local_candidates.push(candidate);
                    return;
                }
            }
        };
        if let Err(e) = self
            .connection
            .publish(ClientEvent::CallIceCandidate { room, candidate })
            .await
        {
            debug!(error = %e, "Candidate relay failed");
        }
    }

    async fn flush_pending_candidates(&self, room: &RoomId) {
        let pending: Vec<IceCandidate> = {
            let mut state = self.state.lock().expect("state lock");
            state.pending_local_candidates.drain(..).collect()
        };
        for candidate in pending {
            if let Err(e) = self
                .connection
                .publish(ClientEvent::CallIceCandidate {
                    room: room.clone(),
                    candidate,
                })
                .await
            {
                debug!(error = %e, "Pending candidate relay failed");
            }
        }
    }

    fn spawn_peer_events(self: &Arc<Self>, mut events: mpsc::Receiver<PeerEvent>) {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::IceCandidate(candidate) => {
                        engine.relay_candidate(candidate).await;
                    }
                    PeerEvent::RemoteTrack(sink) => {
                        engine.resources.lock().expect("resource lock").remote_sink = Some(sink);
                    }
                }
            }
        });
    }

    fn spawn_ring_timeout(self: &Arc<Self>, room: RoomId, epoch: u64) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(engine.ring_timeout).await;
            engine.handle_ring_timeout(room, epoch).await;
        });
    }

    async fn handle_ring_timeout(self: &Arc<Self>, room: RoomId, epoch: u64) {
        {
            let mut state = self.state.lock().expect("state lock");
            if state.epoch != epoch
                || state.phase != CallPhase::Ringing
                || !state.room_matches(&room)
            {
                return;
            }
            state.reset(Some("ring timed out".into()));
        }
        warn!(%room, "Ring timed out, tearing down");

        if let Err(e) = self
            .connection
            .publish(ClientEvent::CallEnd { room: room.clone() })
            .await
        {
            debug!(%room, error = %e, "Timeout teardown notification failed");
        }
        let resources = self.take_resources();
        release_resources(resources).await;
        self.emit(CallUpdate::TimedOut { room }).await;
    }

    async fn emit(&self, update: CallUpdate) {
        if self.updates_tx.send(update).await.is_err() {
            debug!("No call update observer");
        }
    }
}

/// Unconditional ordered release: peer connection, local audio, remote sink.
async fn release_resources(resources: CallResources) {
    if let Some(peer) = resources.peer {
        peer.close().await;
    }
    if let Some(audio) = resources.audio {
        audio.stop();
    }
    if let Some(sink) = resources.remote_sink {
        sink.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{settle, ScriptedMedia, ScriptedSink, ScriptedTransport};
    use campus_shared::protocol::{ClientFrame, SdpKind};
    use campus_shared::types::AuthToken;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        engine: Arc<CallSignalingEngine>,
        updates: mpsc::Receiver<CallUpdate>,
        transport: Arc<ScriptedTransport>,
        media: Arc<ScriptedMedia>,
    }

    async fn harness() -> Harness {
        let transport = ScriptedTransport::new();
        let (connection, _notif) =
            ConnectionManager::new(transport.clone(), RealtimeConfig::default());
        connection.connect(&AuthToken::new("jwt")).await.unwrap();

        let media = ScriptedMedia::new();
        let (engine, updates) =
            CallSignalingEngine::new(media.clone(), connection, &RealtimeConfig::default());
        engine.bind_self(UserId::new("self"));

        Harness {
            engine,
            updates,
            transport,
            media,
        }
    }

    fn offer() -> SessionDescription {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 remote-offer".into(),
        }
    }

    fn answer() -> SessionDescription {
        SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 remote-answer".into(),
        }
    }

    fn sent_call_events(transport: &ScriptedTransport) -> Vec<ClientEvent> {
        transport
            .sent_frames()
            .into_iter()
            .map(|frame| match frame {
                ClientFrame::Event { payload } => payload,
                ClientFrame::Request { payload, .. } => payload,
            })
            .filter(|event| {
                matches!(
                    event,
                    ClientEvent::CallInitiate { .. }
                        | ClientEvent::CallOffer { .. }
                        | ClientEvent::CallAnswer { .. }
                        | ClientEvent::CallIceCandidate { .. }
                        | ClientEvent::CallAccept { .. }
                        | ClientEvent::CallReject { .. }
                        | ClientEvent::CallEnd { .. }
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_initiate_rings_with_allocated_room() {
        let mut h = harness().await;

        let room = h.engine.initiate(UserId::new("u2")).await.unwrap();
        assert_eq!(room, RoomId::new("room-1"));
        assert_eq!(h.engine.phase(), CallPhase::Ringing);
        assert_eq!(h.media.acquire_count(), 1);

        settle().await;
        let events = sent_call_events(&h.transport);
        assert!(matches!(events[0], ClientEvent::CallInitiate { .. }));
        assert!(matches!(
            &events[1],
            ClientEvent::CallOffer { room, .. } if *room == RoomId::new("room-1")
        ));

        match h.updates.recv().await.unwrap() {
            CallUpdate::Ringing {
                direction: CallDirection::Outgoing,
                ..
            } => {}
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initiate_denied_microphone_resets_to_idle() {
        let h = harness().await;
        h.media.deny_audio.store(true, Ordering::SeqCst);

        let err = h.engine.initiate(UserId::new("u2")).await.unwrap_err();
        assert!(matches!(err, SignalingError::MediaDenied(_)));
        assert_eq!(h.engine.phase(), CallPhase::Idle);
        assert!(h.engine.snapshot().last_error.is_some());
        assert!(h.media.peers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_call_is_refused() {
        let h = harness().await;
        h.engine.initiate(UserId::new("u2")).await.unwrap();

        let err = h.engine.initiate(UserId::new("u3")).await.unwrap_err();
        assert!(matches!(err, SignalingError::CallInProgress));
    }

    #[tokio::test]
    async fn test_incoming_holds_offer_until_accept() {
        let mut h = harness().await;
        let room = RoomId::new("r-inc");

        h.engine
            .handle_incoming(room.clone(), UserId::new("u-caller"))
            .await;
        h.engine.handle_offer(&room, offer());

        // Ringing acquires nothing.
        assert_eq!(h.engine.phase(), CallPhase::Ringing);
        assert_eq!(h.media.acquire_count(), 0);

        h.engine.accept(room.clone()).await.unwrap();
        assert_eq!(h.engine.phase(), CallPhase::Active);
        assert_eq!(h.media.acquire_count(), 1);

        let peer = h.media.last_peer();
        let applied = peer.remote_description.lock().unwrap().clone().unwrap();
        assert_eq!(applied.sdp, "v=0 remote-offer");

        settle().await;
        let events = sent_call_events(&h.transport);
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::CallAnswer { room: r, .. } if *r == room)));

        // Ringing then Connected.
        assert!(matches!(
            h.updates.recv().await.unwrap(),
            CallUpdate::Ringing { .. }
        ));
        assert!(matches!(
            h.updates.recv().await.unwrap(),
            CallUpdate::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn test_accept_without_pending_offer_fails_loudly() {
        let h = harness().await;
        let room = RoomId::new("r-inc");
        h.engine
            .handle_incoming(room.clone(), UserId::new("u-caller"))
            .await;

        let err = h.engine.accept(room).await.unwrap_err();
        assert!(matches!(err, SignalingError::MissingPendingOffer));
        assert_eq!(h.engine.phase(), CallPhase::Idle);
        assert_eq!(h.media.acquire_count(), 0);
    }

    #[tokio::test]
    async fn test_reject_from_idle_is_noop() {
        let h = harness().await;
        h.engine.reject(RoomId::new("r-unknown")).await.unwrap();
        assert_eq!(h.engine.phase(), CallPhase::Idle);
        assert!(sent_call_events(&h.transport).is_empty());
    }

    #[tokio::test]
    async fn test_reject_discards_pending_offer_and_notifies() {
        let h = harness().await;
        let room = RoomId::new("r-inc");
        h.engine
            .handle_incoming(room.clone(), UserId::new("u-caller"))
            .await;
        h.engine.handle_offer(&room, offer());

        h.engine.reject(room.clone()).await.unwrap();
        assert_eq!(h.engine.phase(), CallPhase::Idle);
        settle().await;
        assert!(sent_call_events(&h.transport)
            .iter()
            .any(|e| matches!(e, ClientEvent::CallReject { room: r } if *r == room)));

        // Nothing was acquired, nothing to release.
        assert_eq!(h.media.acquire_count(), 0);
    }

    #[tokio::test]
    async fn test_answer_activates_outgoing_call() {
        let h = harness().await;
        let room = h.engine.initiate(UserId::new("u2")).await.unwrap();

        h.engine.handle_answer(room.clone(), answer()).await;
        assert_eq!(h.engine.phase(), CallPhase::Active);

        let peer = h.media.last_peer();
        let applied = peer.remote_description.lock().unwrap().clone().unwrap();
        assert_eq!(applied.sdp, "v=0 remote-answer");
    }

    #[tokio::test]
    async fn test_double_end_releases_exactly_once() {
        let h = harness().await;
        let room = h.engine.initiate(UserId::new("u2")).await.unwrap();
        h.engine.handle_answer(room, answer()).await;

        let peer = h.media.last_peer();
        let track = h.media.last_track();

        h.engine.end().await;
        h.engine.end().await;

        assert_eq!(h.engine.phase(), CallPhase::Idle);
        assert_eq!(peer.close_count.load(Ordering::SeqCst), 1);
        assert!(track.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stale_room_teardown_events_are_ignored() {
        let h = harness().await;
        let room = h.engine.initiate(UserId::new("u2")).await.unwrap();

        h.engine
            .handle_remote_ended(RoomId::new("r-other"))
            .await;
        assert_eq!(h.engine.phase(), CallPhase::Ringing);

        h.engine.handle_remote_ended(room.clone()).await;
        assert_eq!(h.engine.phase(), CallPhase::Idle);
        let peer = h.media.last_peer();
        assert_eq!(peer.close_count.load(Ordering::SeqCst), 1);

        // Duplicate notification: no second cleanup.
        h.engine.handle_remote_ended(room).await;
        assert_eq!(peer.close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_early_candidates_queue_until_remote_description() {
        let h = harness().await;
        let room = RoomId::new("r-inc");
        h.engine
            .handle_incoming(room.clone(), UserId::new("u-caller"))
            .await;
        h.engine.handle_offer(&room, offer());

        let early = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        h.engine.handle_candidate(room.clone(), early.clone()).await;

        h.engine.accept(room).await.unwrap();

        let peer = h.media.last_peer();
        let applied = peer.candidates.lock().unwrap().clone();
        assert_eq!(applied, vec![early]);
    }

    #[tokio::test]
    async fn test_mute_requires_active_call() {
        let h = harness().await;
        assert!(matches!(
            h.engine.set_muted(true),
            Err(SignalingError::NotInCall)
        ));

        let room = RoomId::new("r-inc");
        h.engine
            .handle_incoming(room.clone(), UserId::new("u-caller"))
            .await;
        h.engine.handle_offer(&room, offer());
        h.engine.accept(room).await.unwrap();

        h.engine.set_muted(true).unwrap();
        assert!(!h.media.last_track().enabled());
        h.engine.set_muted(false).unwrap();
        assert!(h.media.last_track().enabled());
    }

    #[tokio::test]
    async fn test_remote_sink_released_on_end() {
        let h = harness().await;
        let room = RoomId::new("r-inc");
        h.engine
            .handle_incoming(room.clone(), UserId::new("u-caller"))
            .await;
        h.engine.handle_offer(&room, offer());
        h.engine.accept(room).await.unwrap();

        let sink = Arc::new(ScriptedSink {
            closed: AtomicBool::new(false),
        });
        h.media
            .last_peer()
            .events
            .send(PeerEvent::RemoteTrack(sink.clone()))
            .await
            .unwrap();
        settle().await;

        h.engine.end().await;
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_busy_line_auto_rejects_second_ring() {
        let h = harness().await;
        let room = h.engine.initiate(UserId::new("u2")).await.unwrap();

        h.engine
            .handle_incoming(RoomId::new("r-second"), UserId::new("u3"))
            .await;
        settle().await;

        assert_eq!(h.engine.phase(), CallPhase::Ringing);
        assert!(h.engine.snapshot().session.unwrap().room == room);
        assert!(sent_call_events(&h.transport).iter().any(
            |e| matches!(e, ClientEvent::CallReject { room } if *room == RoomId::new("r-second"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ring_times_out() {
        let mut h = harness().await;
        let room = h.engine.initiate(UserId::new("u2")).await.unwrap();
        assert!(matches!(
            h.updates.recv().await.unwrap(),
            CallUpdate::Ringing { .. }
        ));

        tokio::time::advance(RealtimeConfig::default().ring_timeout + Duration::from_secs(1)).await;

        loop {
            match h.updates.recv().await.unwrap() {
                CallUpdate::TimedOut { room: r } => {
                    assert_eq!(r, room);
                    break;
                }
                other => panic!("unexpected update: {other:?}"),
            }
        }
        assert_eq!(h.engine.phase(), CallPhase::Idle);
        assert_eq!(
            h.media.last_peer().close_count.load(Ordering::SeqCst),
            1
        );
        assert!(h.media.last_track().stopped.load(Ordering::SeqCst));
    }
}
