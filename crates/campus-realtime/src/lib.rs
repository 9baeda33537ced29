// Real-time client core: channel session, event routing, presence,
// message synchronization and call signaling.

pub mod client;
pub mod config;
pub mod connection;
pub mod media;
pub mod presence;
pub mod router;
pub mod signaling;
pub mod sync;
pub mod transport;
pub mod ws;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::{init_tracing, ClientUpdate, RealtimeClient};
pub use config::RealtimeConfig;
pub use connection::{ChannelNotification, ConnectionManager, SubscriptionId};
pub use media::{AudioSource, MediaGateway, PeerConnectionHandle, PeerEvent, RemoteAudioSink};
pub use presence::{PresenceApi, PresenceTracker};
pub use router::{ActiveContext, EventRouter};
pub use signaling::{
    CallDirection, CallPhase, CallSession, CallSignalingEngine, CallSnapshot, CallUpdate,
};
pub use sync::{ChatApi, MessageSynchronizer};
pub use transport::{ChannelTransport, TransportLink};
pub use ws::WebSocketTransport;
