//! Inbound event demultiplexing.
//!
//! Every inbound event carries a scope (peer, room or global). The router
//! forwards each event to the subsystem owning its type, annotated with
//! whether it falls inside the currently active conversation. Scope is read
//! through [`ActiveContext`] — a live cell consulted at route time — never
//! through a value captured when a listener was registered; handlers set up
//! at mount time would otherwise act on a stale snapshot after every
//! conversation switch.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use campus_shared::protocol::ServerEvent;
use campus_shared::types::ConversationId;

use crate::client::ClientUpdate;
use crate::presence::PresenceTracker;
use crate::signaling::CallSignalingEngine;
use crate::sync::MessageSynchronizer;

/// The currently viewed conversation, shared as a live mutable cell.
///
/// Continuations that resume after a suspension point must call
/// [`ActiveContext::matches`] at the moment they mutate state, not before.
#[derive(Clone, Default)]
pub struct ActiveContext {
    inner: Arc<RwLock<Option<ConversationId>>>,
}

impl ActiveContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, conversation: ConversationId) {
        *self.inner.write().expect("context lock") = Some(conversation);
    }

    pub fn clear(&self) {
        *self.inner.write().expect("context lock") = None;
    }

    pub fn get(&self) -> Option<ConversationId> {
        self.inner.read().expect("context lock").clone()
    }

    pub fn matches(&self, conversation: &ConversationId) -> bool {
        self.inner
            .read()
            .expect("context lock")
            .as_ref()
            .is_some_and(|active| active == conversation)
    }
}

pub struct EventRouter {
    context: ActiveContext,
    presence: Arc<PresenceTracker>,
    messages: Arc<MessageSynchronizer>,
    calls: Arc<CallSignalingEngine>,
    updates_tx: mpsc::Sender<ClientUpdate>,
}

impl EventRouter {
    pub fn new(
        context: ActiveContext,
        presence: Arc<PresenceTracker>,
        messages: Arc<MessageSynchronizer>,
        calls: Arc<CallSignalingEngine>,
        updates_tx: mpsc::Sender<ClientUpdate>,
    ) -> Self {
        Self {
            context,
            presence,
            messages,
            calls,
            updates_tx,
        }
    }

    /// Dispatch one inbound event to its owner. The match is exhaustive so a
    /// new event kind cannot be silently dropped.
    pub async fn route(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(record) => {
                let in_scope = self.context.matches(&record.conversation);
                self.messages.apply_inbound(record.clone(), in_scope);
                self.emit(ClientUpdate::MessageReceived {
                    message: record,
                    in_scope,
                })
                .await;
            }

            ServerEvent::MessageEdited {
                id,
                conversation,
                content,
            } => {
                let in_scope = self.context.matches(&conversation);
                self.messages.apply_edited(&id, &content, in_scope);
                self.emit(ClientUpdate::MessageEdited { id, conversation }).await;
            }

            ServerEvent::MessageDeleted { id, conversation } => {
                let in_scope = self.context.matches(&conversation);
                // Applied even out of scope: a pinned copy of the deleted
                // message must be invalidated wherever it is cached.
                self.messages.apply_deleted(&id, in_scope);
                self.emit(ClientUpdate::MessageDeleted { id, conversation }).await;
            }

            ServerEvent::Typing { conversation, user } => {
                if self.context.matches(&conversation) {
                    self.emit(ClientUpdate::Typing { conversation, user }).await;
                } else {
                    debug!(%conversation, "Typing outside active scope dropped");
                }
            }

            ServerEvent::UserStatusChanged { user, status } => {
                self.presence.apply_push(user.clone(), status);
                self.emit(ClientUpdate::PresenceChanged { user, status }).await;
            }

            ServerEvent::CallIncoming { room, caller } => {
                self.calls.handle_incoming(room, caller).await;
            }

            ServerEvent::CallOffer { room, description } => {
                self.calls.handle_offer(&room, description);
            }

            ServerEvent::CallAnswer { room, description } => {
                self.calls.handle_answer(room, description).await;
            }

            ServerEvent::CallIceCandidate { room, candidate } => {
                self.calls.handle_candidate(room, candidate).await;
            }

            ServerEvent::CallAccepted { room } => {
                self.calls.handle_accepted(&room);
            }

            ServerEvent::CallRejected { room } => {
                self.calls.handle_remote_rejected(room).await;
            }

            ServerEvent::CallEnded { room } => {
                self.calls.handle_remote_ended(room).await;
            }

            // Liveness is recorded by the connection manager.
            ServerEvent::Pong => {}
        }
    }

    async fn emit(&self, update: ClientUpdate) {
        if self.updates_tx.send(update).await.is_err() {
            debug!("No client update observer");
        }
    }
}
