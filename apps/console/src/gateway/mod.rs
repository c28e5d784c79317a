use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use helm_proto::codec::{CodecConfig, Decoder, encode};
use helm_proto::envelope::{Envelope, new_correlation_id};
use helm_proto::{command, commands};

pub mod config;

pub use config::{GatewayConfig, GatewayRole};

const MESSAGE_BUFFER: usize = 256;

/// Lifecycle of the gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway connect failed: {0}")]
    Connect(String),
    #[error("authorization timed out")]
    AuthTimeout,
    #[error("authorization denied: {0}")]
    AuthDenied(String),
    #[error("gateway protocol error: {0}")]
    Protocol(String),
    #[error("gateway channel closed")]
    Closed,
    #[error("bearer token unavailable: {0}")]
    Token(String),
}

/// Source of the bearer token presented in the authorize handshake.
pub trait TokenStore: Send + Sync {
    fn bearer_token(&self) -> Result<String, GatewayError>;
}

/// Fixed token, for tests and tooling.
pub struct StaticTokenStore(pub String);

impl TokenStore for StaticTokenStore {
    fn bearer_token(&self) -> Result<String, GatewayError> {
        Ok(self.0.clone())
    }
}

/// Connection to the shared relay.
///
/// Authenticates immediately after the transport opens and refuses to
/// hand the channel out unless the relay answered `OK` within the auth
/// window. No automatic retry: an authorization failure is fatal for the
/// attempt and surfaced to the caller.
#[derive(Debug)]
pub struct GatewayChannel {
    role: GatewayRole,
    codec: CodecConfig,
    outbound: mpsc::UnboundedSender<String>,
    messages_tx: broadcast::Sender<Envelope>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayChannel {
    /// Open the transport and run the authorize handshake.
    pub async fn connect(
        config: GatewayConfig,
        tokens: &dyn TokenStore,
    ) -> Result<Self, GatewayError> {
        let token = tokens.bearer_token()?;
        let url = config.build_url();
        info!(%url, role = config.role.as_str(), "connecting to gateway");
        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|err| GatewayError::Connect(err.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let codec = CodecConfig::default();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (messages_tx, _) = broadcast::channel(MESSAGE_BUFFER);
        let state_tx = Arc::new(watch::channel(ConnectionState::Connecting).0);

        let send_task = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let pump_messages = messages_tx.clone();
        let pump_outbound = outbound_tx.clone();
        let pump_state = Arc::clone(&state_tx);
        let recv_task = tokio::spawn(async move {
            let mut decoder = Decoder::new();
            while let Some(msg) = ws_receiver.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                match decoder.decode(&text) {
                    Ok(outcome) => {
                        if let Some(ack) = outcome.ack {
                            match encode(&ack, &codec) {
                                Ok(frames) => {
                                    for frame in frames {
                                        let _ = pump_outbound.send(frame);
                                    }
                                }
                                Err(err) => {
                                    warn!(error = %err, "failed to encode continuation ack");
                                }
                            }
                        }
                        if let Some(message) = outcome.message {
                            debug!(command = %message.command, "gateway message");
                            let _ = pump_messages.send(message);
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "protocol violation on gateway channel");
                    }
                }
            }
            // only an unrequested drop lands here while still Open
            if *pump_state.borrow() == ConnectionState::Open {
                pump_state.send_replace(ConnectionState::Closed);
                warn!("gateway connection dropped");
            }
        });

        let channel = Self {
            role: config.role,
            codec,
            outbound: outbound_tx,
            messages_tx,
            state_tx,
            tasks: Mutex::new(vec![send_task, recv_task]),
        };

        match channel.handshake(&config, &token).await {
            Ok(()) => {
                channel.state_tx.send_replace(ConnectionState::Open);
                info!("gateway authorized");
                Ok(channel)
            }
            Err(err) => {
                channel.state_tx.send_replace(ConnectionState::Failed);
                channel.abort_tasks();
                Err(err)
            }
        }
    }

    async fn handshake(&self, config: &GatewayConfig, token: &str) -> Result<(), GatewayError> {
        let correlation_id = new_correlation_id();
        let mut responses = self.messages_tx.subscribe();
        let authorize = commands::gateway::authorize(&config.realm, token, config.role.as_str())
            .with_correlation_id(correlation_id.clone());
        for frame in encode(&authorize, &self.codec)
            .map_err(|err| GatewayError::Protocol(err.to_string()))?
        {
            self.outbound
                .send(frame)
                .map_err(|_| GatewayError::Closed)?;
        }

        let response = tokio::time::timeout(config.auth_timeout, async {
            loop {
                match responses.recv().await {
                    Ok(message)
                        if message.command == command::RESULT
                            && message.correlation_id.as_deref()
                                == Some(correlation_id.as_str()) =>
                    {
                        return Some(message);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;

        match response {
            Err(_) => Err(GatewayError::AuthTimeout),
            Ok(None) => Err(GatewayError::Closed),
            Ok(Some(message)) => match message.get_str("result") {
                Some("OK") => Ok(()),
                other => Err(GatewayError::AuthDenied(
                    other.unwrap_or("no result").to_string(),
                )),
            },
        }
    }

    pub fn role(&self) -> GatewayRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Decoded inbound frames: telemetry, images, command responses.
    pub fn messages(&self) -> broadcast::Receiver<Envelope> {
        self.messages_tx.subscribe()
    }

    /// Send one command envelope, stamping a fresh correlation id when the
    /// caller supplied none. Returns the correlation id actually used.
    pub fn dispatch(&self, mut envelope: Envelope) -> Result<String, GatewayError> {
        if self.state() != ConnectionState::Open {
            return Err(GatewayError::Closed);
        }
        let correlation_id = envelope
            .correlation_id
            .take()
            .unwrap_or_else(new_correlation_id);
        envelope.correlation_id = Some(correlation_id.clone());
        for frame in
            encode(&envelope, &self.codec).map_err(|err| GatewayError::Protocol(err.to_string()))?
        {
            self.outbound
                .send(frame)
                .map_err(|_| GatewayError::Closed)?;
        }
        Ok(correlation_id)
    }

    pub fn subscribe(&self, topics: &[String], robot_id: &str) -> Result<String, GatewayError> {
        self.dispatch(commands::gateway::subscribe(topics, robot_id))
    }

    pub fn unsubscribe(&self, topics: &[String], robot_id: &str) -> Result<String, GatewayError> {
        self.dispatch(commands::gateway::unsubscribe(topics, robot_id))
    }

    /// Ask the relay to replay the last cached value for a topic, so the
    /// UI has data immediately after subscribing.
    pub fn republish(&self, topic: &str, robot_id: &str) -> Result<String, GatewayError> {
        self.dispatch(commands::gateway::republish(topic, robot_id))
    }

    pub fn set_topic_config(
        &self,
        topic: &str,
        robot_id: &str,
        topic_config: &commands::gateway::TopicConfig,
    ) -> Result<String, GatewayError> {
        self.dispatch(commands::gateway::set_topic_config(
            topic,
            robot_id,
            topic_config,
        ))
    }

    /// Dispatch an action command to a named robot. Fire-and-forget; the
    /// returned id lets callers correlate a response on the message
    /// listener if they care.
    pub fn execute_action_command(
        &self,
        robot_id: &str,
        payload: Value,
        id: Option<String>,
    ) -> Result<String, GatewayError> {
        let id = id.unwrap_or_else(new_correlation_id);
        let envelope = commands::gateway::action_command(robot_id, payload)
            .field("id", id.clone())
            .with_correlation_id(id);
        self.dispatch(envelope)
    }

    /// Robot-role publication of one topic value.
    pub fn publish(&self, topic: &str, robot_id: &str, data: Value) -> Result<String, GatewayError> {
        if self.role != GatewayRole::Robot {
            warn!(topic, "publishing from a non-robot gateway role");
        }
        self.dispatch(commands::gateway::publish(topic, robot_id, data))
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Explicit teardown of the relay connection.
    pub fn close(&self) {
        self.state_tx.send_replace(ConnectionState::Closing);
        self.abort_tasks();
        self.state_tx.send_replace(ConnectionState::Closed);
        info!("gateway channel closed");
    }
}

impl Drop for GatewayChannel {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
