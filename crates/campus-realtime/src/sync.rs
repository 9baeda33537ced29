//! Conversation state synchronization.
//!
//! Holds the currently loaded conversation: the timestamp-ordered message
//! list and the pinned subset. Sends are optimistic — a placeholder record
//! with a local id is visible immediately and is atomically swapped for the
//! server-confirmed record on ack. Every write-back that follows an await
//! re-checks the live active context, so stale continuations from a rapid
//! conversation switch never touch the list.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use campus_shared::constants::{MAX_MESSAGE_LENGTH, TOMBSTONE_CONTENT};
use campus_shared::error::{CampusError, ConnectionError, NetworkError, StateConflictError};
use campus_shared::protocol::{AckPayload, ClientEvent, MessageRecord};
use campus_shared::types::{ConversationId, MessageId, UserId};

use crate::connection::ConnectionManager;
use crate::router::ActiveContext;

/// Request/response operations on the remote chat API.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_history(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<MessageRecord>, NetworkError>;

    async fn fetch_pinned(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<MessageRecord>, NetworkError>;

    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), NetworkError>;

    async fn set_pinned(&self, message: &MessageId, pinned: bool) -> Result<(), NetworkError>;

    async fn edit_message(&self, message: &MessageId, content: &str)
        -> Result<(), NetworkError>;

    async fn delete_message(&self, message: &MessageId) -> Result<(), NetworkError>;
}

#[derive(Default)]
struct ConversationStore {
    messages: Vec<MessageRecord>,
    pinned: Vec<MessageRecord>,
}

pub struct MessageSynchronizer {
    api: Arc<dyn ChatApi>,
    connection: Arc<ConnectionManager>,
    context: ActiveContext,
    store: Mutex<ConversationStore>,
    self_id: Mutex<Option<UserId>>,
}

impl MessageSynchronizer {
    pub fn new(
        api: Arc<dyn ChatApi>,
        connection: Arc<ConnectionManager>,
        context: ActiveContext,
    ) -> Self {
        Self {
            api,
            connection,
            context,
            store: Mutex::new(ConversationStore::default()),
            self_id: Mutex::new(None),
        }
    }

    pub fn bind_self(&self, user: UserId) {
        *self.self_id.lock().expect("self lock") = Some(user);
    }

    /// Snapshot of the loaded conversation, sorted ascending by `created_at`.
    pub fn messages(&self) -> Vec<MessageRecord> {
        self.store.lock().expect("store lock").messages.clone()
    }

    pub fn pinned(&self) -> Vec<MessageRecord> {
        self.store.lock().expect("store lock").pinned.clone()
    }

    /// Switch to a conversation: reset the list, fetch history and the
    /// pinned subset, mark it read. Safe under rapid context switches — a
    /// load whose target is no longer the active context at write time is
    /// discarded.
    pub async fn load_conversation(
        &self,
        conversation: &ConversationId,
    ) -> Result<(), NetworkError> {
        self.context.set(conversation.clone());
        {
            let mut store = self.store.lock().expect("store lock");
            store.messages.clear();
            store.pinned.clear();
        }

        let mut history = self.api.fetch_history(conversation).await?;
        history.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        {
            let mut store = self.store.lock().expect("store lock");
            if !self.context.matches(conversation) {
                debug!(%conversation, "Discarding stale history load");
                return Ok(());
            }
            store.messages = history;
        }

        let pinned = self.api.fetch_pinned(conversation).await?;
        {
            let mut store = self.store.lock().expect("store lock");
            if !self.context.matches(conversation) {
                debug!(%conversation, "Discarding stale pinned load");
                return Ok(());
            }
            store.pinned = pinned;
        }

        if let Err(e) = self.api.mark_read(conversation).await {
            warn!(%conversation, error = %e, "Mark-as-read failed");
        }
        Ok(())
    }

    /// Optimistically send a message. Whitespace-only content is a no-op
    /// (`Ok(None)`). On ack the placeholder is swapped for the confirmed
    /// record in one state transition; on failure it is removed and the
    /// error re-thrown for the caller to surface.
    pub async fn send(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<Option<MessageRecord>, CampusError> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }
        if content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(NetworkError::RequestFailed("message exceeds maximum length".into()).into());
        }

        let sender = self
            .self_id
            .lock()
            .expect("self lock")
            .clone()
            .ok_or(ConnectionError::NotConnected)?;

        let local = MessageRecord {
            id: MessageId::local(),
            sender,
            conversation: conversation.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            edited: false,
            deleted: false,
        };

        {
            let mut store = self.store.lock().expect("store lock");
            if self.context.matches(conversation) {
                insert_sorted(&mut store.messages, local.clone());
            }
        }

        let result = self
            .connection
            .request(ClientEvent::SendMessage {
                conversation: conversation.clone(),
                content: content.to_string(),
                created_at: local.created_at,
            })
            .await;

        match result {
            Ok(AckPayload::MessageStored(confirmed)) => {
                let mut store = self.store.lock().expect("store lock");
                // Single transition under one lock: no frame where both or
                // neither record exist.
                store.messages.retain(|m| m.id != local.id);
                if store.messages.iter().any(|m| m.id == confirmed.id) {
                    debug!(
                        id = %confirmed.id,
                        "{}",
                        StateConflictError::DuplicateReconciliation(confirmed.id.clone())
                    );
                } else if self.context.matches(conversation) {
                    insert_sorted(&mut store.messages, confirmed.clone());
                }
                Ok(Some(confirmed))
            }
            Ok(AckPayload::Error { message }) => {
                self.remove_message(&local.id);
                Err(NetworkError::RequestFailed(message).into())
            }
            Ok(other) => {
                self.remove_message(&local.id);
                Err(NetworkError::RequestFailed(format!("unexpected ack: {other:?}")).into())
            }
            Err(e) => {
                self.remove_message(&local.id);
                Err(e.into())
            }
        }
    }

    /// Apply a server-pushed message. Duplicate deliveries (retransmission
    /// or double subscription) are ignored by id.
    pub fn apply_inbound(&self, record: MessageRecord, in_scope: bool) {
        if !in_scope {
            debug!(conversation = %record.conversation, "Inbound message outside active scope");
            return;
        }
        let mut store = self.store.lock().expect("store lock");
        if store.messages.iter().any(|m| m.id == record.id) {
            debug!(id = %record.id, "Duplicate inbound message ignored");
            return;
        }
        insert_sorted(&mut store.messages, record);
    }

    /// Apply a server-pushed edit in place. Unknown ids (outside the loaded
    /// window) are ignored.
    pub fn apply_edited(&self, id: &MessageId, content: &str, in_scope: bool) {
        let mut store = self.store.lock().expect("store lock");
        if in_scope {
            if let Some(message) = store.messages.iter_mut().find(|m| m.id == *id) {
                message.content = content.to_string();
                message.edited = true;
            }
        }
        if let Some(pinned) = store.pinned.iter_mut().find(|m| m.id == *id) {
            pinned.content = content.to_string();
            pinned.edited = true;
        }
    }

    /// Apply a server-pushed delete: the record keeps its slot and id but
    /// carries the tombstone content. A pinned copy is invalidated even when
    /// the event is outside the active scope.
    pub fn apply_deleted(&self, id: &MessageId, in_scope: bool) {
        let mut store = self.store.lock().expect("store lock");
        if in_scope {
            if let Some(message) = store.messages.iter_mut().find(|m| m.id == *id) {
                message.content = TOMBSTONE_CONTENT.to_string();
                message.deleted = true;
            }
        }
        let before = store.pinned.len();
        store.pinned.retain(|m| m.id != *id);
        if store.pinned.len() != before {
            debug!(%id, "Pinned cache entry invalidated by delete");
        }
    }

    /// Pin or unpin, then unconditionally refetch the pinned subset — its
    /// server-side ordering metadata cannot be derived locally.
    pub async fn set_pinned(&self, id: &MessageId, pinned: bool) -> Result<(), CampusError> {
        let conversation = self
            .context
            .get()
            .ok_or(StateConflictError::NoActiveConversation)?;

        self.api
            .set_pinned(id, pinned)
            .await
            .map_err(CampusError::from)?;

        let fresh = self
            .api
            .fetch_pinned(&conversation)
            .await
            .map_err(CampusError::from)?;
        let mut store = self.store.lock().expect("store lock");
        if self.context.matches(&conversation) {
            store.pinned = fresh;
        }
        Ok(())
    }

    /// Request an edit. The local record mutates when the server echoes the
    /// `message_edited` event back through the channel.
    pub async fn edit(&self, id: &MessageId, content: &str) -> Result<(), NetworkError> {
        self.api.edit_message(id, content).await
    }

    /// Request a delete; the tombstone lands via the echoed event.
    pub async fn delete(&self, id: &MessageId) -> Result<(), NetworkError> {
        self.api.delete_message(id).await
    }

    fn remove_message(&self, id: &MessageId) {
        let mut store = self.store.lock().expect("store lock");
        store.messages.retain(|m| m.id != *id);
    }
}

/// Insert keeping the list sorted ascending by `created_at`. Stable for
/// equal timestamps: the new record lands after existing ones.
fn insert_sorted(messages: &mut Vec<MessageRecord>, record: MessageRecord) {
    let at = messages.partition_point(|m| m.created_at <= record.created_at);
    messages.insert(at, record);
}
