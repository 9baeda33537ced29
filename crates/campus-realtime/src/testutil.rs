//! Scripted in-memory doubles shared by the crate's tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use campus_shared::error::{ConnectionError, NetworkError, SignalingError};
use campus_shared::protocol::{
    AckPayload, ClientEvent, ClientFrame, IceCandidate, MessageRecord, SdpKind, ServerEvent,
    ServerFrame, SessionDescription,
};
use campus_shared::types::{AuthToken, ConversationId, MessageId, PresenceStatus, RoomId, UserId};

use crate::media::{AudioSource, MediaGateway, PeerConnectionHandle, PeerEvent, RemoteAudioSink};
use crate::presence::PresenceApi;
use crate::sync::ChatApi;
use crate::transport::{ChannelTransport, TransportLink};

/// Transport double: records outbound frames, auto-acks requests the way the
/// server would, and lets tests inject inbound events or kill the link.
pub(crate) struct ScriptedTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    opens: AtomicUsize,
    /// Open attempts beyond this count fail. `usize::MAX` = always succeed.
    max_opens: usize,
    sent: Mutex<Vec<ClientFrame>>,
    server_tx: Mutex<Option<mpsc::Sender<ServerFrame>>>,
    msg_seq: AtomicUsize,
    ack_error: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Self::with_max_opens(usize::MAX)
    }

    pub fn with_max_opens(max_opens: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(TransportInner {
                opens: AtomicUsize::new(0),
                max_opens,
                sent: Mutex::new(Vec::new()),
                server_tx: Mutex::new(None),
                msg_seq: AtomicUsize::new(0),
                ack_error: AtomicBool::new(false),
            }),
        })
    }

    /// Make every subsequent acked request fail with a server error.
    pub fn fail_acks(&self) {
        self.inner.ack_error.store(true, Ordering::SeqCst);
    }

    /// Total `open()` calls, including failed ones.
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.inner.sent.lock().unwrap().clone()
    }

    /// Inject a server-pushed event into the current link.
    pub async fn push_event(&self, event: ServerEvent) {
        let tx = self
            .inner
            .server_tx
            .lock()
            .unwrap()
            .clone()
            .expect("no link open");
        tx.send(ServerFrame::Event { payload: event })
            .await
            .expect("link receiver gone");
    }

    /// Kill the current link; the manager observes an unexpected disconnect.
    pub fn drop_link(&self) {
        *self.inner.server_tx.lock().unwrap() = None;
    }
}

impl TransportInner {
    fn ack_for(&self, event: &ClientEvent) -> AckPayload {
        if self.ack_error.load(Ordering::SeqCst) {
            return AckPayload::Error {
                message: "scripted server error".into(),
            };
        }
        match event {
            ClientEvent::CallInitiate { .. } => AckPayload::RoomAssigned {
                room: RoomId::new("room-1"),
            },
            ClientEvent::SendMessage {
                conversation,
                content,
                created_at,
            } => {
                let seq = self.msg_seq.fetch_add(1, Ordering::SeqCst) + 1;
                AckPayload::MessageStored(MessageRecord {
                    id: MessageId::new(format!("srv-{seq}")),
                    sender: UserId::new("self"),
                    conversation: conversation.clone(),
                    content: content.clone(),
                    created_at: *created_at,
                    edited: false,
                    deleted: false,
                })
            }
            _ => AckPayload::Ok,
        }
    }
}

#[async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn open(&self, _token: &AuthToken) -> Result<TransportLink, ConnectionError> {
        let attempt = self.inner.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.inner.max_opens {
            return Err(ConnectionError::Rejected("scripted failure".into()));
        }

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(64);
        let (in_tx, in_rx) = mpsc::channel::<ServerFrame>(64);
        *self.inner.server_tx.lock().unwrap() = Some(in_tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                inner.sent.lock().unwrap().push(frame.clone());
                if let ClientFrame::Request { ack_id, payload } = frame {
                    let ack = inner.ack_for(&payload);
                    let tx = inner.server_tx.lock().unwrap().clone();
                    if let Some(tx) = tx {
                        let _ = tx
                            .send(ServerFrame::Ack {
                                ack_id,
                                payload: ack,
                            })
                            .await;
                    }
                }
            }
        });

        Ok(TransportLink {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

/// Yield enough times for spawned tasks on the test runtime to settle.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Chat API double with no data behind it.
pub(crate) struct NullChatApi;

#[async_trait]
impl ChatApi for NullChatApi {
    async fn fetch_history(
        &self,
        _conversation: &ConversationId,
    ) -> Result<Vec<MessageRecord>, NetworkError> {
        Ok(Vec::new())
    }

    async fn fetch_pinned(
        &self,
        _conversation: &ConversationId,
    ) -> Result<Vec<MessageRecord>, NetworkError> {
        Ok(Vec::new())
    }

    async fn mark_read(&self, _conversation: &ConversationId) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn set_pinned(&self, _message: &MessageId, _pinned: bool) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn edit_message(
        &self,
        _message: &MessageId,
        _content: &str,
    ) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn delete_message(&self, _message: &MessageId) -> Result<(), NetworkError> {
        Ok(())
    }
}

/// Presence API double that fails loudly if anything actually hits the
/// network; use it where every lookup must be a cache hit.
pub(crate) struct NullPresenceApi;

#[async_trait]
impl PresenceApi for NullPresenceApi {
    async fn fetch_status(&self, _user: &UserId) -> Result<PresenceStatus, NetworkError> {
        Err(NetworkError::RequestFailed("unexpected network trip".into()))
    }

    async fn fetch_status_batch(
        &self,
        _users: &[UserId],
    ) -> Result<Vec<PresenceStatus>, NetworkError> {
        Err(NetworkError::RequestFailed("unexpected network trip".into()))
    }
}

// ---------------------------------------------------------------------------
// Media doubles
// ---------------------------------------------------------------------------

pub(crate) struct ScriptedTrack {
    enabled: AtomicBool,
    pub stopped: AtomicBool,
}

impl AudioSource for ScriptedTrack {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct ScriptedPeer {
    pub close_count: AtomicUsize,
    pub remote_description: Mutex<Option<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub events: mpsc::Sender<PeerEvent>,
}

#[async_trait]
impl PeerConnectionHandle for ScriptedPeer {
    async fn create_offer(&self) -> Result<SessionDescription, SignalingError> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 scripted-offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, SignalingError> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 scripted-answer".into(),
        })
    }

    async fn set_local_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), SignalingError> {
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), SignalingError> {
        *self.remote_description.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct ScriptedSink {
    pub closed: AtomicBool,
}

impl RemoteAudioSink for ScriptedSink {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Media gateway double: counts acquisitions, optionally denies the
/// microphone, and exposes every handed-out track and peer for inspection.
pub(crate) struct ScriptedMedia {
    pub deny_audio: AtomicBool,
    pub tracks: Mutex<Vec<Arc<ScriptedTrack>>>,
    pub peers: Mutex<Vec<Arc<ScriptedPeer>>>,
}

impl ScriptedMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny_audio: AtomicBool::new(false),
            tracks: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn acquire_count(&self) -> usize {
        self.tracks.lock().unwrap().len()
    }

    pub fn last_peer(&self) -> Arc<ScriptedPeer> {
        self.peers
            .lock()
            .unwrap()
            .last()
            .expect("no peer built")
            .clone()
    }

    pub fn last_track(&self) -> Arc<ScriptedTrack> {
        self.tracks
            .lock()
            .unwrap()
            .last()
            .expect("no track acquired")
            .clone()
    }
}

#[async_trait]
impl MediaGateway for ScriptedMedia {
    async fn acquire_audio(&self) -> Result<Arc<dyn AudioSource>, SignalingError> {
        if self.deny_audio.load(Ordering::SeqCst) {
            return Err(SignalingError::MediaDenied("scripted denial".into()));
        }
        let track = Arc::new(ScriptedTrack {
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        self.tracks.lock().unwrap().push(track.clone());
        Ok(track)
    }

    async fn create_peer_connection(
        &self,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionHandle>, SignalingError> {
        let peer = Arc::new(ScriptedPeer {
            close_count: AtomicUsize::new(0),
            remote_description: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            events,
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}
