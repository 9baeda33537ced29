use thiserror::Error;

use crate::types::{MessageId, RoomId};

#[derive(Error, Debug)]
pub enum CampusError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("State conflict: {0}")]
    StateConflict(#[from] StateConflictError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel handshake and session failures. Surfaced to the caller; retried
/// only through the bounded reconnect policy, never indefinitely.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("No credential available")]
    MissingCredential,

    #[error("Server rejected the connection: {0}")]
    Rejected(String),

    #[error("Channel is not connected")]
    NotConnected,

    #[error("Channel closed while a request was in flight")]
    ChannelClosed,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// A single request/response round trip failed. Transient: the caller
/// decides whether to retry or surface it; no global retry.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out")]
    Timeout,
}

/// Call negotiation failures. Always drive the call machine back to idle
/// with every acquired resource released.
#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Media acquisition denied: {0}")]
    MediaDenied(String),

    #[error("Peer connection setup failed: {0}")]
    PeerSetup(String),

    #[error("No pending offer held at accept time")]
    MissingPendingOffer,

    #[error("Room allocation failed: {0}")]
    RoomAllocation(String),

    #[error("A call is already in progress")]
    CallInProgress,

    #[error("Operation not valid outside an active call")]
    NotInCall,

    #[error("Call attempt superseded before it could complete")]
    Cancelled,
}

/// Conflicting updates that are logged and ignored rather than applied;
/// they must never corrupt existing state.
#[derive(Error, Debug, Clone)]
pub enum StateConflictError {
    #[error("Event for stale room {0} ignored")]
    StaleRoom(RoomId),

    #[error("Duplicate reconciliation for message {0}")]
    DuplicateReconciliation(MessageId),

    #[error("No active conversation")]
    NoActiveConversation,
}
