//! WebSocket transport to the relay.
//!
//! Pumps an outbound channel of [`CollabMessage`]s onto the socket and
//! delivers inbound frames as decoded messages. Malformed frames are logged
//! and dropped; they never reach the session.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::{CollabError, CollabMessage, Result};

/// A live connection to the relay
pub struct RelayConnection {
    /// Messages pushed here go to the relay
    pub outbound: mpsc::UnboundedSender<CollabMessage>,
    /// Decoded messages from the relay arrive here
    pub inbound: mpsc::UnboundedReceiver<CollabMessage>,
}

impl RelayConnection {
    /// Connect to a relay endpoint, e.g. `ws://127.0.0.1:8080/ws`.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| CollabError::Transport(e.to_string()))?;
        info!("connected to relay at {}", url);

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<CollabMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            error!("relay send failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => error!("failed to encode outbound message: {}", e),
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<CollabMessage>(&text) {
                            Ok(message) => {
                                if in_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("dropping malformed relay frame: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("relay closed the connection");
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(other) => debug!("ignoring non-text relay frame: {:?}", other),
                    Err(e) => {
                        error!("relay receive failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
