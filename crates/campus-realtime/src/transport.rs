//! The seam between the realtime core and the physical channel.
//!
//! [`ConnectionManager`](crate::connection::ConnectionManager) drives any
//! transport implementing [`ChannelTransport`]. Production uses the
//! WebSocket transport in [`crate::ws`]; tests use an in-memory scripted
//! double.

use async_trait::async_trait;
use tokio::sync::mpsc;

use campus_shared::error::ConnectionError;
use campus_shared::protocol::{ClientFrame, ServerFrame};
use campus_shared::types::AuthToken;

/// A live, authenticated link to the server.
///
/// Outbound frames go into `tx`; inbound frames arrive on `rx`. The server
/// side closing the connection is observed as `rx` yielding `None`.
pub struct TransportLink {
    pub tx: mpsc::Sender<ClientFrame>,
    pub rx: mpsc::Receiver<ServerFrame>,
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Open and authenticate one channel session.
    ///
    /// Called again by the reconnect loop after an unexpected disconnect;
    /// every call must produce a fresh link.
    async fn open(&self, token: &AuthToken) -> Result<TransportLink, ConnectionError>;
}
