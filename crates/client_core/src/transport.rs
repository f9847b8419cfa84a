use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::header::AUTHORIZATION, Message},
};
use tracing::{debug, info, warn};

use shared::domain::UserId;

use crate::error::ConnectionError;

/// Fixed retry delay after a lost broker link.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub user_id: UserId,
    pub access_token: String,
}

/// One multiplexed frame. Inbound, `topic` names the subscription channel
/// the server routed it to; outbound, it names the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub topic: String,
    pub body: Value,
}

/// A live bidirectional link to the broker. Dropping either half tears the
/// link down.
pub struct BrokerLink {
    pub outbound: mpsc::UnboundedSender<WireFrame>,
    pub inbound: mpsc::UnboundedReceiver<WireFrame>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(&self, identity: &ClientIdentity) -> Result<BrokerLink, ConnectionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Default)]
struct TransportState {
    subscriptions: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
    outbound: Option<mpsc::UnboundedSender<WireFrame>>,
    pump: Option<JoinHandle<()>>,
    shutdown: bool,
}

/// Owns the single broker channel: connect, automatic reconnect with a
/// fixed delay, topic subscriptions, fire-and-forget publish.
///
/// Subscriptions are not durable: both an explicit `disconnect` and an
/// automatic reconnect drop every registered handler, and the owning
/// component must subscribe again.
pub struct BrokerTransport {
    connector: Arc<dyn BrokerConnector>,
    state: Mutex<TransportState>,
    status: broadcast::Sender<ConnectionState>,
}

impl BrokerTransport {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Arc<Self> {
        let (status, _) = broadcast::channel(32);
        Arc::new(Self {
            connector,
            state: Mutex::new(TransportState::default()),
            status,
        })
    }

    /// Establishes the channel. The first handshake failure is surfaced to
    /// the caller; once connected, lost links are retried internally.
    pub async fn connect(
        self: &Arc<Self>,
        identity: ClientIdentity,
    ) -> Result<(), ConnectionError> {
        if identity.access_token.is_empty() {
            return Err(ConnectionError::MissingCredentials("access token"));
        }

        let link = self.connector.open(&identity).await?;
        let mut state = self.state.lock().await;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        state.shutdown = false;
        state.outbound = Some(link.outbound);
        let transport = Arc::clone(self);
        state.pump = Some(tokio::spawn(transport.run_pump(identity, link.inbound)));
        drop(state);

        let _ = self.status.send(ConnectionState::Connected);
        Ok(())
    }

    async fn run_pump(
        self: Arc<Self>,
        identity: ClientIdentity,
        mut inbound: mpsc::UnboundedReceiver<WireFrame>,
    ) {
        loop {
            while let Some(frame) = inbound.recv().await {
                self.dispatch(frame).await;
            }

            {
                let mut state = self.state.lock().await;
                state.outbound = None;
                // A fresh link means a fresh server-side session; stale
                // handlers must not outlive it.
                state.subscriptions.clear();
                if state.shutdown {
                    return;
                }
            }
            let _ = self.status.send(ConnectionState::Reconnecting);
            warn!(user_id = %identity.user_id, "broker link lost, reconnecting");

            loop {
                tokio::time::sleep(RECONNECT_DELAY).await;
                if self.state.lock().await.shutdown {
                    return;
                }
                match self.connector.open(&identity).await {
                    Ok(link) => {
                        self.state.lock().await.outbound = Some(link.outbound);
                        inbound = link.inbound;
                        info!(user_id = %identity.user_id, "broker link re-established");
                        let _ = self.status.send(ConnectionState::Connected);
                        break;
                    }
                    Err(err) => warn!("broker reconnect attempt failed: {err}"),
                }
            }
        }
    }

    async fn dispatch(&self, frame: WireFrame) {
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(&frame.topic) {
            Some(handlers) => {
                handlers.retain(|handler| handler.send(frame.body.clone()).is_ok());
            }
            None => debug!(topic = %frame.topic, "frame for topic with no subscribers"),
        }
    }

    /// Registers a handler for a topic. Duplicate subscriptions to the same
    /// topic are independent: each receives every frame.
    pub async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .await
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Fire-and-forget send. Delivery is the server's responsibility; a
    /// publish while disconnected is dropped with a warning.
    pub async fn publish(&self, destination: &str, body: Value) {
        let state = self.state.lock().await;
        match &state.outbound {
            Some(outbound) => {
                let frame = WireFrame {
                    topic: destination.to_string(),
                    body,
                };
                if outbound.send(frame).is_err() {
                    warn!(destination, "publish dropped: broker link closed");
                }
            }
            None => warn!(destination, "publish dropped: broker not connected"),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.outbound.is_some()
    }

    pub fn status_stream(&self) -> broadcast::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    /// Tears down the channel and discards all subscriptions. Idempotent.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.shutdown = true;
        state.outbound = None;
        state.subscriptions.clear();
        if let Some(pump) = state.pump.take() {
            pump.abort();
            drop(state);
            let _ = self.status.send(ConnectionState::Disconnected);
        }
    }
}

/// Production connector: a websocket carrying JSON text frames, with the
/// bearer token presented during the handshake.
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl BrokerConnector for WsConnector {
    async fn open(&self, identity: &ClientIdentity) -> Result<BrokerLink, ConnectionError> {
        url::Url::parse(&self.endpoint).map_err(|err| ConnectionError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason: err.to_string(),
        })?;

        let mut request = self.endpoint.as_str().into_client_request().map_err(|err| {
            ConnectionError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: err.to_string(),
            }
        })?;
        let bearer = format!("Bearer {}", identity.access_token)
            .parse()
            .map_err(|_| ConnectionError::MissingCredentials("access token"))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| ConnectionError::Handshake(err.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<WireFrame>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode outbound frame: {err}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<WireFrame>(&text) {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("invalid broker frame: {err}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(BrokerLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
