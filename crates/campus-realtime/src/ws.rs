//! WebSocket implementation of [`ChannelTransport`].
//!
//! Frames are JSON text messages. The bearer token is carried as a query
//! parameter on the upgrade request, so the server authenticates the session
//! before the first frame flows.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use campus_shared::error::ConnectionError;
use campus_shared::protocol::{ClientFrame, ServerFrame};
use campus_shared::types::AuthToken;

use crate::transport::{ChannelTransport, TransportLink};

const FRAME_BUFFER: usize = 64;

pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn open(&self, token: &AuthToken) -> Result<TransportLink, ConnectionError> {
        let url = format!("{}?token={}", self.url, token.as_str());

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectionError::Rejected(e.to_string()))?;

        info!(url = %self.url, "Channel socket opened");

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(FRAME_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<ServerFrame>(FRAME_BUFFER);

        // Outbound pump: typed frames -> JSON text messages.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Dropping unserializable outbound frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    debug!(error = %e, "Outbound socket write failed");
                    break;
                }
            }
        });

        // Inbound pump: JSON text messages -> typed frames. Dropping `in_tx`
        // when the read side ends is what surfaces the disconnect upstream.
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(txt)) => match ServerFrame::from_json(&txt) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Ignoring unparsable inbound frame");
                        }
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Server closed the channel socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Channel socket read failed");
                        break;
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
