use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use super::PeerError;

/// Frame-level handle to one live peer socket.
///
/// The dialer owns the pump tasks behind these channels; dropping both
/// ends tears the underlying connection down.
pub struct PeerSocket {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens transports to robots by peer identity. The channel redials
/// through this seam on every reconnect attempt.
#[async_trait]
pub trait PeerDialer: Send + Sync {
    async fn dial(&self, peer_id: &str) -> Result<PeerSocket, PeerError>;
}

/// Production dialer: one WebSocket per robot, addressed by peer id.
pub struct WebSocketDialer {
    base_url: String,
}

impl WebSocketDialer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn peer_url(&self, peer_id: &str) -> String {
        let mut url = self.base_url.trim_end_matches('/').to_string();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            url = format!("ws://{url}");
        }
        // avoid IPv6 resolution surprises on local setups
        if url.contains("localhost") {
            url = url.replace("localhost", "127.0.0.1");
        }
        format!("{url}/{peer_id}")
    }
}

#[async_trait]
impl PeerDialer for WebSocketDialer {
    async fn dial(&self, peer_id: &str) -> Result<PeerSocket, PeerError> {
        let url = self.peer_url(peer_id);
        debug!(%url, "dialing peer");
        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|err| PeerError::Connect(err.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        // some robot firmwares send JSON in binary frames
                        if let Ok(text) = String::from_utf8(data) {
                            if inbound_tx.send(text).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(PeerSocket {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
