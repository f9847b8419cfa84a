pub mod call;
pub mod codec;
#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod testsupport;
pub mod error;
pub mod rest;
pub mod store;
pub mod sync;
pub mod transport;

use std::sync::Arc;

use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use shared::domain::{CallType, ConversationId, GroupId, MessageId, MessageKind, UserId};
use shared::protocol::CallFrameKind;

use crate::{
    call::{CallEngine, MediaSource, PeerConnector},
    error::CallError,
    rest::ChatApi,
    store::{Conversation, ConversationStore, Message},
    sync::SyncController,
    transport::{BrokerConnector, BrokerTransport, ClientIdentity, ConnectionState},
};

/// Everything the frontend reacts to, fanned out on one broadcast channel.
#[derive(Clone)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    MessageReceived {
        conversation: ConversationId,
        message: Message,
    },
    ConversationListChanged,
    IncomingCall {
        from: UserId,
        sender_name: Option<String>,
        call_type: CallType,
    },
    CallStateChanged(CallStateKind),
    /// Advisory peer signal (ringing, busy, reconnect) with no state change.
    CallNotice(CallFrameKind),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStateKind {
    Idle,
    Outgoing,
    Incoming,
    Connected,
    Ended,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_id: UserId,
    pub display_name: String,
    pub access_token: String,
}

/// Top-level session facade. Owns the transport, the sync controller and
/// the call engine; every collaborator is injected so frontends and tests
/// choose their own broker, backend and media implementations.
pub struct ChatSession {
    transport: Arc<BrokerTransport>,
    sync: Arc<SyncController>,
    calls: Arc<CallEngine>,
    store: Arc<Mutex<ConversationStore>>,
    identity: ClientIdentity,
    events: broadcast::Sender<SessionEvent>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn BrokerConnector>,
        api: Arc<dyn ChatApi>,
        media: Arc<dyn MediaSource>,
        peers: Arc<dyn PeerConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let transport = BrokerTransport::new(connector);
        let store = Arc::new(Mutex::new(ConversationStore::new()));
        let sync = SyncController::new(
            Arc::clone(&transport),
            api,
            Arc::clone(&store),
            config.user_id.clone(),
            events.clone(),
        );
        let calls = CallEngine::new(
            media,
            peers,
            Arc::clone(&transport),
            config.user_id.clone(),
            config.display_name,
            events.clone(),
        );
        Arc::new(Self {
            transport,
            sync,
            calls,
            store,
            identity: ClientIdentity {
                user_id: config.user_id,
                access_token: config.access_token,
            },
            events,
            watcher: Mutex::new(None),
        })
    }

    /// Connects the broker channel and loads initial state. The status
    /// watcher re-attaches every per-user queue after each reconnect, since
    /// the transport drops subscriptions with the link.
    pub async fn connect(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut status = self.transport.status_stream();
        let session = Arc::clone(self);
        let watcher = tokio::spawn(async move {
            loop {
                match status.recv().await {
                    Ok(state) => {
                        let _ = session
                            .events
                            .send(SessionEvent::ConnectionStateChanged(state));
                        if state == ConnectionState::Connected {
                            session.sync.reattach_after_reconnect().await;
                            session.calls.attach_call_queue().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "connection status watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.watcher.lock().await = Some(watcher);

        self.transport.connect(self.identity.clone()).await?;
        self.sync.bootstrap().await?;
        info!(user_id = %self.identity.user_id, "session connected");
        Ok(())
    }

    /// Tears the session down and forgets all local state.
    pub async fn logout(self: &Arc<Self>) {
        self.calls.end_call().await;
        self.transport.disconnect().await;
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.abort();
        }
        self.sync.reset().await;
        self.store.lock().await.clear();
        info!(user_id = %self.identity.user_id, "session closed");
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    pub async fn select_conversation(self: &Arc<Self>, conversation_id: ConversationId) {
        self.sync.select_conversation(conversation_id).await;
    }

    pub async fn send_direct(&self, peer_id: &UserId, content: String) -> MessageId {
        self.sync.send_direct(peer_id, content).await
    }

    pub async fn send_group(
        &self,
        group_id: &GroupId,
        content: String,
        kind: MessageKind,
    ) -> MessageId {
        self.sync.send_group(group_id, content, kind).await
    }

    pub async fn create_group(
        self: &Arc<Self>,
        name: String,
        description: String,
        members: Vec<UserId>,
    ) -> anyhow::Result<GroupId> {
        self.sync.create_group(name, description, members).await
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.sync.conversations().await
    }

    pub async fn total_unread(&self) -> u32 {
        self.sync.total_unread().await
    }

    pub async fn initiate_call(
        self: &Arc<Self>,
        remote: UserId,
        call_type: CallType,
    ) -> Result<(), CallError> {
        self.calls.initiate_call(remote, call_type).await
    }

    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        self.calls.accept_call().await
    }

    pub async fn reject_call(self: &Arc<Self>) -> Result<(), CallError> {
        self.calls.reject_call().await
    }

    pub async fn end_call(self: &Arc<Self>) {
        self.calls.end_call().await
    }

    pub async fn toggle_mute(&self) -> bool {
        self.calls.toggle_mute().await
    }

    pub async fn toggle_video(&self) -> bool {
        self.calls.toggle_video().await
    }

    pub async fn call_state(&self) -> CallStateKind {
        self.calls.state().await
    }
}

pub use error::{HistoryFetchError, MalformedFrameError};
pub use transport::WsConnector;
