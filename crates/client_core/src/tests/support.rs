//! In-memory broker doubles shared by the unit tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex as StdMutex,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::ConnectionError,
    transport::{BrokerConnector, BrokerLink, ClientIdentity, WireFrame},
};

/// The broker side of one opened link: frames the client published, and a
/// sender that injects frames toward the client.
pub struct ServerEnd {
    pub to_client: mpsc::UnboundedSender<WireFrame>,
    pub from_client: mpsc::UnboundedReceiver<WireFrame>,
}

/// Connector that hands out channel-backed links and records every opened
/// link so tests can drive both directions.
#[derive(Default)]
pub struct ChannelConnector {
    opened: StdMutex<Vec<ServerEnd>>,
    opens: AtomicUsize,
    fail_next: StdMutex<bool>,
}

impl ChannelConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_open(&self) {
        *self.fail_next.lock().unwrap() = true;
    }

    /// Successful opens so far. Counted separately from the link vec, which
    /// `latest_end` consumes.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Takes ownership of the server side of the most recent link.
    pub fn latest_end(&self) -> ServerEnd {
        self.opened.lock().unwrap().pop().expect("no link opened")
    }
}

#[async_trait]
impl BrokerConnector for ChannelConnector {
    async fn open(&self, _identity: &ClientIdentity) -> Result<BrokerLink, ConnectionError> {
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
            return Err(ConnectionError::Handshake("scripted failure".to_string()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.opened.lock().unwrap().push(ServerEnd {
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(BrokerLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

pub fn identity(user_id: &str) -> ClientIdentity {
    ClientIdentity {
        user_id: user_id.into(),
        access_token: "token".to_string(),
    }
}

/// Lets spawned routing tasks drain their channels on the current-thread
/// runtime.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
