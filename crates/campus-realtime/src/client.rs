//! Client facade: wires the channel session, router, presence, message and
//! call subsystems together and drives the notification loop that keeps
//! them coherent across reconnects. The UI consumes the [`ClientUpdate`]
//! stream and reads state snapshots reactively.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use campus_shared::error::{CampusError, ConnectionError, NetworkError, SignalingError};
use campus_shared::protocol::{ClientEvent, EventKind, MessageRecord};
use campus_shared::types::{
    AuthToken, ConnectionState, ConversationId, MessageId, PresenceStatus, RoomId, UserId,
};

use crate::config::RealtimeConfig;
use crate::connection::{ChannelNotification, ConnectionManager};
use crate::media::MediaGateway;
use crate::presence::{PresenceApi, PresenceTracker};
use crate::router::{ActiveContext, EventRouter};
use crate::signaling::{CallSignalingEngine, CallSnapshot, CallUpdate};
use crate::sync::{ChatApi, MessageSynchronizer};
use crate::transport::ChannelTransport;

const UPDATE_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Updates the UI observes.
#[derive(Debug, Clone)]
pub enum ClientUpdate {
    Connected,
    Reconnected,
    ChannelDown,
    MessageReceived {
        message: MessageRecord,
        in_scope: bool,
    },
    MessageEdited {
        id: MessageId,
        conversation: ConversationId,
    },
    MessageDeleted {
        id: MessageId,
        conversation: ConversationId,
    },
    Typing {
        conversation: ConversationId,
        user: UserId,
    },
    PresenceChanged {
        user: UserId,
        status: PresenceStatus,
    },
    Call(CallUpdate),
}

/// Install the default tracing subscriber for binaries embedding the core.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("campus_realtime=debug,campus_shared=info,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

pub struct RealtimeClient {
    connection: Arc<ConnectionManager>,
    presence: Arc<PresenceTracker>,
    messages: Arc<MessageSynchronizer>,
    calls: Arc<CallSignalingEngine>,
    context: ActiveContext,
}

impl RealtimeClient {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        chat_api: Arc<dyn ChatApi>,
        presence_api: Arc<dyn PresenceApi>,
        media: Arc<dyn MediaGateway>,
        config: RealtimeConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ClientUpdate>) {
        let (connection, notif_rx) = ConnectionManager::new(transport, config.clone());
        let context = ActiveContext::new();
        let presence = Arc::new(PresenceTracker::new(presence_api));
        let messages = Arc::new(MessageSynchronizer::new(
            chat_api,
            connection.clone(),
            context.clone(),
        ));
        let (calls, call_updates_rx) =
            CallSignalingEngine::new(media, connection.clone(), &config);

        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);

        let router = Arc::new(EventRouter::new(
            context.clone(),
            presence.clone(),
            messages.clone(),
            calls.clone(),
            updates_tx.clone(),
        ));

        // One subscription feed covering every inbound kind; the router
        // demultiplexes from there.
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        for kind in EventKind::ALL {
            connection.subscribe(kind, events_tx.clone());
        }

        let client = Arc::new(Self {
            connection,
            presence,
            messages,
            calls,
            context,
        });

        client.spawn_event_loop(router, events_rx);
        client.spawn_call_update_loop(call_updates_rx, updates_tx.clone());
        client.spawn_notification_loop(notif_rx, updates_tx);

        (client, updates_rx)
    }

    /// Establish the channel session for a logged-in user. Idempotent like
    /// the underlying connect; the self presence entry is online as soon as
    /// this returns, no server round trip involved.
    pub async fn login(&self, user: UserId, token: &AuthToken) -> Result<(), ConnectionError> {
        self.presence.bind_self(user.clone());
        self.messages.bind_self(user.clone());
        self.calls.bind_self(user);
        self.connection.connect(token).await
    }

    /// Tear the session down: hang up any live call, flush the logout
    /// notification best-effort, keep caches for the process lifetime.
    pub async fn logout(&self) {
        self.calls.end().await;
        if let Some(previous) = self.context.get() {
            let _ = self
                .connection
                .publish(ClientEvent::LeaveConversation {
                    conversation: previous,
                })
                .await;
        }
        self.context.clear();
        self.connection.shutdown();
        info!("Logged out");
    }

    /// Switch the active conversation: join its scope on the channel, then
    /// load history and pinned messages.
    pub async fn open_conversation(
        &self,
        conversation: &ConversationId,
    ) -> Result<(), CampusError> {
        if let Some(previous) = self.context.get() {
            if previous != *conversation {
                let _ = self
                    .connection
                    .publish(ClientEvent::LeaveConversation {
                        conversation: previous,
                    })
                    .await;
            }
        }
        self.connection
            .publish(ClientEvent::JoinConversation {
                conversation: conversation.clone(),
            })
            .await
            .map_err(CampusError::from)?;
        self.messages
            .load_conversation(conversation)
            .await
            .map_err(CampusError::from)
    }

    pub async fn send_message(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<Option<MessageRecord>, CampusError> {
        self.messages.send(conversation, content).await
    }

    pub async fn send_typing(&self) -> Result<(), ConnectionError> {
        let Some(conversation) = self.context.get() else {
            return Ok(());
        };
        self.connection
            .publish(ClientEvent::Typing { conversation })
            .await
    }

    pub async fn edit_message(&self, id: &MessageId, content: &str) -> Result<(), NetworkError> {
        self.messages.edit(id, content).await
    }

    pub async fn delete_message(&self, id: &MessageId) -> Result<(), NetworkError> {
        self.messages.delete(id).await
    }

    pub async fn pin_message(&self, id: &MessageId) -> Result<(), CampusError> {
        self.messages.set_pinned(id, true).await
    }

    pub async fn unpin_message(&self, id: &MessageId) -> Result<(), CampusError> {
        self.messages.set_pinned(id, false).await
    }

    pub async fn peer_status(&self, user: &UserId) -> PresenceStatus {
        self.presence.status(user).await
    }

    pub async fn peer_status_batch(&self, users: &[UserId]) -> Vec<(UserId, PresenceStatus)> {
        self.presence.batch_status(users).await
    }

    pub async fn start_call(&self, receiver: UserId) -> Result<RoomId, SignalingError> {
        self.calls.initiate(receiver).await
    }

    pub async fn accept_call(&self, room: RoomId) -> Result<(), SignalingError> {
        self.calls.accept(room).await
    }

    pub async fn reject_call(&self, room: RoomId) -> Result<(), SignalingError> {
        self.calls.reject(room).await
    }

    pub async fn end_call(&self) {
        self.calls.end().await
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), SignalingError> {
        self.calls.set_muted(muted)
    }

    /// The tab regained visibility; refresh the self presence entry.
    pub fn visibility_regained(&self) {
        self.presence.mark_self_online();
    }

    pub fn messages_snapshot(&self) -> Vec<MessageRecord> {
        self.messages.messages()
    }

    pub fn pinned_snapshot(&self) -> Vec<MessageRecord> {
        self.messages.pinned()
    }

    pub fn call_snapshot(&self) -> CallSnapshot {
        self.calls.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.context.get()
    }

    // -- background loops ---------------------------------------------------

    fn spawn_event_loop(
        self: &Arc<Self>,
        router: Arc<EventRouter>,
        mut events_rx: mpsc::Receiver<campus_shared::protocol::ServerEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                router.route(event).await;
            }
            debug!("Inbound event loop ended");
        });
    }

    fn spawn_call_update_loop(
        self: &Arc<Self>,
        mut call_updates_rx: mpsc::Receiver<CallUpdate>,
        updates_tx: mpsc::Sender<ClientUpdate>,
    ) {
        tokio::spawn(async move {
            while let Some(update) = call_updates_rx.recv().await {
                if updates_tx.send(ClientUpdate::Call(update)).await.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_notification_loop(
        self: &Arc<Self>,
        mut notif_rx: mpsc::Receiver<ChannelNotification>,
        updates_tx: mpsc::Sender<ClientUpdate>,
    ) {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(notification) = notif_rx.recv().await {
                match notification {
                    ChannelNotification::Connected => {
                        client.presence.mark_self_online();
                        let _ = updates_tx.send(ClientUpdate::Connected).await;
                    }

                    ChannelNotification::HeartbeatTick => {
                        client.presence.mark_self_online();
                    }

                    ChannelNotification::ConnectionLost => {
                        debug!("Channel lost, reconnect in progress");
                    }

                    ChannelNotification::Reconnected => {
                        client.presence.mark_self_online();
                        client.rehydrate_after_reconnect().await;
                        let _ = updates_tx.send(ClientUpdate::Reconnected).await;
                    }

                    ChannelNotification::Down => {
                        warn!("Channel session is down");
                        let _ = updates_tx.send(ClientUpdate::ChannelDown).await;
                    }
                }
            }
            debug!("Channel notification loop ended");
        });
    }

    /// Join-scoped state does not survive a reconnect: rejoin the active
    /// conversation and reload it.
    async fn rehydrate_after_reconnect(&self) {
        let Some(conversation) = self.context.get() else {
            return;
        };
        if let Err(e) = self
            .connection
            .publish(ClientEvent::JoinConversation {
                conversation: conversation.clone(),
            })
            .await
        {
            warn!(%conversation, error = %e, "Rejoin after reconnect failed");
            return;
        }
        if let Err(e) = self.messages.load_conversation(&conversation).await {
            warn!(%conversation, error = %e, "Reload after reconnect failed");
        }
    }
}
