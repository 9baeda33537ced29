//! Channel session management with the tokio mpsc command/notification pattern.
//!
//! One persistent, authenticated session per process. The run loop lives in a
//! dedicated task and multiplexes outbound commands, inbound frames and the
//! heartbeat timer; external code talks to it through typed channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use campus_shared::error::ConnectionError;
use campus_shared::protocol::{
    AckPayload, ClientEvent, ClientFrame, EventKind, ServerEvent, ServerFrame,
};
use campus_shared::types::{AuthToken, ConnectionState};

use crate::config::RealtimeConfig;
use crate::transport::{ChannelTransport, TransportLink};

const NOTIFICATION_BUFFER: usize = 32;
const COMMAND_BUFFER: usize = 64;

/// Commands sent *into* the run loop.
enum ChannelCommand {
    /// Fire-and-forget publish.
    Publish(ClientEvent),
    /// Acked publish; the reply carries the server's synchronous response.
    Request {
        event: ClientEvent,
        reply: oneshot::Sender<Result<AckPayload, ConnectionError>>,
    },
    /// Stop the run loop.
    Shutdown,
}

/// Session lifecycle notifications for upper layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotification {
    /// The initial connect succeeded.
    Connected,
    /// A liveness frame was just emitted.
    HeartbeatTick,
    /// The link dropped unexpectedly; reconnection is in progress.
    ConnectionLost,
    /// Reconnection succeeded. Upper layers must re-hydrate join-scoped
    /// state (rejoin the active conversation context).
    Reconnected,
    /// Reconnection attempts are exhausted; the session is gone.
    Down,
}

/// Handle to an event-kind subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type SubscriberMap = HashMap<EventKind, Vec<(SubscriptionId, mpsc::Sender<ServerEvent>)>>;

struct SessionShared {
    state: ConnectionState,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Owns the single persistent channel to the server.
pub struct ConnectionManager {
    transport: Arc<dyn ChannelTransport>,
    config: RealtimeConfig,
    shared: Arc<Mutex<SessionShared>>,
    subscribers: Arc<Mutex<SubscriberMap>>,
    cmd_tx: Mutex<Option<mpsc::Sender<ChannelCommand>>>,
    notif_tx: mpsc::Sender<ChannelNotification>,
    next_sub_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        config: RealtimeConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ChannelNotification>) {
        let (notif_tx, notif_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let manager = Arc::new(Self {
            transport,
            config,
            shared: Arc::new(Mutex::new(SessionShared {
                state: ConnectionState::Disconnected,
                last_heartbeat: None,
            })),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            cmd_tx: Mutex::new(None),
            notif_tx,
            next_sub_id: AtomicU64::new(1),
        });
        (manager, notif_rx)
    }

    /// Open the channel session. Idempotent: a live (or in-progress) session
    /// is reused, never duplicated.
    pub async fn connect(&self, token: &AuthToken) -> Result<(), ConnectionError> {
        if token.is_empty() {
            return Err(ConnectionError::MissingCredential);
        }

        {
            let mut shared = self.shared.lock().expect("session lock");
            match shared.state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    debug!("Channel session already live, reusing");
                    return Ok(());
                }
                ConnectionState::Disconnected => shared.state = ConnectionState::Connecting,
            }
        }

        let link = match self.transport.open(token).await {
            Ok(link) => link,
            Err(e) => {
                self.shared.lock().expect("session lock").state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        *self.cmd_tx.lock().expect("command lock") = Some(cmd_tx);
        self.shared.lock().expect("session lock").state = ConnectionState::Connected;

        info!("Channel session established");
        let _ = self.notif_tx.send(ChannelNotification::Connected).await;

        tokio::spawn(run_loop(
            self.transport.clone(),
            token.clone(),
            link,
            cmd_rx,
            self.shared.clone(),
            self.subscribers.clone(),
            self.notif_tx.clone(),
            self.config.clone(),
        ));

        Ok(())
    }

    /// Fire-and-forget publish.
    pub async fn publish(&self, event: ClientEvent) -> Result<(), ConnectionError> {
        let tx = self.command_sender()?;
        tx.send(ChannelCommand::Publish(event))
            .await
            .map_err(|_| ConnectionError::ChannelClosed)
    }

    /// Publish and wait for the server's synchronous reply.
    pub async fn request(&self, event: ClientEvent) -> Result<AckPayload, ConnectionError> {
        let tx = self.command_sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(ChannelCommand::Request {
            event,
            reply: reply_tx,
        })
        .await
        .map_err(|_| ConnectionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ConnectionError::ChannelClosed)?
    }

    /// Register a subscriber for one inbound event kind. Multiple subscribers
    /// per kind are allowed; each gets its own copy, delivery order across
    /// subscribers is unspecified.
    pub fn subscribe(&self, kind: EventKind, sender: mpsc::Sender<ServerEvent>) -> SubscriptionId {
        let id = SubscriptionId(self.next_sub_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .entry(kind)
            .or_default()
            .push((id, sender));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscribers.lock().expect("subscriber lock");
        for entries in subs.values_mut() {
            entries.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().expect("session lock").state
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().expect("session lock").last_heartbeat
    }

    /// Best-effort teardown: flush a logout frame without blocking, then stop
    /// the run loop. Safe to call on an already-dead session.
    pub fn shutdown(&self) {
        let tx = self.cmd_tx.lock().expect("command lock").take();
        if let Some(tx) = tx {
            let _ = tx.try_send(ChannelCommand::Publish(ClientEvent::Logout));
            let _ = tx.try_send(ChannelCommand::Shutdown);
        }
        self.shared.lock().expect("session lock").state = ConnectionState::Disconnected;
        info!("Channel session shut down");
    }

    fn command_sender(&self) -> Result<mpsc::Sender<ChannelCommand>, ConnectionError> {
        self.cmd_tx
            .lock()
            .expect("command lock")
            .clone()
            .ok_or(ConnectionError::NotConnected)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    transport: Arc<dyn ChannelTransport>,
    token: AuthToken,
    mut link: TransportLink,
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
    shared: Arc<Mutex<SessionShared>>,
    subscribers: Arc<Mutex<SubscriberMap>>,
    notif_tx: mpsc::Sender<ChannelNotification>,
    config: RealtimeConfig,
) {
    let mut pending_acks: HashMap<u64, oneshot::Sender<Result<AckPayload, ConnectionError>>> =
        HashMap::new();
    let mut next_ack_id: u64 = 1;

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ChannelCommand::Publish(event)) => {
                    if link.tx.send(ClientFrame::Event { payload: event }).await.is_err() {
                        debug!("Publish on a closing link dropped");
                    }
                }
                Some(ChannelCommand::Request { event, reply }) => {
                    let ack_id = next_ack_id;
                    next_ack_id += 1;
                    let frame = ClientFrame::Request { ack_id, payload: event };
                    if link.tx.send(frame).await.is_err() {
                        let _ = reply.send(Err(ConnectionError::ChannelClosed));
                    } else {
                        pending_acks.insert(ack_id, reply);
                    }
                }
                Some(ChannelCommand::Shutdown) | None => break,
            },

            frame = link.rx.recv() => match frame {
                Some(ServerFrame::Ack { ack_id, payload }) => {
                    match pending_acks.remove(&ack_id) {
                        Some(reply) => { let _ = reply.send(Ok(payload)); }
                        None => debug!(ack_id, "Ack with no pending request"),
                    }
                }
                Some(ServerFrame::Event { payload }) => {
                    if matches!(payload, ServerEvent::Pong) {
                        shared.lock().expect("session lock").last_heartbeat = Some(Utc::now());
                    }
                    dispatch(&subscribers, payload);
                }
                None => {
                    warn!("Channel link lost, starting reconnect");
                    for (_, reply) in pending_acks.drain() {
                        let _ = reply.send(Err(ConnectionError::ChannelClosed));
                    }
                    let _ = notif_tx.send(ChannelNotification::ConnectionLost).await;

                    match reconnect(transport.as_ref(), &token, &config).await {
                        Some(new_link) => {
                            link = new_link;
                            let _ = notif_tx.send(ChannelNotification::Reconnected).await;
                        }
                        None => {
                            shared.lock().expect("session lock").state =
                                ConnectionState::Disconnected;
                            let _ = notif_tx.send(ChannelNotification::Down).await;
                            break;
                        }
                    }
                }
            },

            _ = heartbeat.tick() => {
                // Fire-and-forget: the reciprocal pong is not required for
                // the connection to be considered healthy.
                let _ = link.tx.try_send(ClientFrame::Event { payload: ClientEvent::Heartbeat });
                shared.lock().expect("session lock").last_heartbeat = Some(Utc::now());
                let _ = notif_tx.send(ChannelNotification::HeartbeatTick).await;
            }
        }
    }

    debug!("Channel run loop ended");
}

/// Bounded, fixed-delay reconnection. Returns `None` once attempts are
/// exhausted; there is no unbounded retry.
async fn reconnect(
    transport: &dyn ChannelTransport,
    token: &AuthToken,
    config: &RealtimeConfig,
) -> Option<TransportLink> {
    for attempt in 1..=config.reconnect_max_attempts {
        tokio::time::sleep(config.reconnect_delay).await;
        match transport.open(token).await {
            Ok(link) => {
                info!(attempt, "Channel reconnected");
                return Some(link);
            }
            Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
        }
    }
    warn!(
        attempts = config.reconnect_max_attempts,
        "Reconnect attempts exhausted, giving up"
    );
    None
}

/// Forward one inbound event to every subscriber of its kind, dropping
/// subscribers whose receiver is gone.
fn dispatch(subscribers: &Arc<Mutex<SubscriberMap>>, event: ServerEvent) {
    let mut subs = subscribers.lock().expect("subscriber lock");
    let Some(entries) = subs.get_mut(&event.kind()) else {
        return;
    };
    entries.retain(|(id, sender)| match sender.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(subscription = id.0, kind = ?event.kind(), "Subscriber lagging, event dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}
