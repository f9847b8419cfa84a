use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::{
    domain::{ConversationId, GroupId, MessageId, MessageKind, UserId},
    protocol::{
        direct_room_id, group_topic, room_topic, user_chat_queue, user_group_queue, ChatFrame,
        GroupCreatedFrame, GroupFrame,
    },
};

use crate::{
    codec::{self, OutboundIntent},
    error::HistoryFetchError,
    rest::{ChatApi, ChatListEntry, CreateGroupRequest, GroupListEntry},
    store::{AppendOutcome, Contact, Conversation, ConversationSeed, ConversationStore, LastMessage, Message},
    transport::BrokerTransport,
    SessionEvent,
};

#[derive(Default)]
struct SyncState {
    /// Monotonic token per conversation; a history fetch only applies if
    /// the token has not moved while the fetch was in flight.
    fetch_generations: HashMap<ConversationId, u64>,
    /// Ids of optimistically appended messages whose broker echo has not
    /// come back yet.
    pending_sends: HashSet<MessageId>,
    /// Topics this controller holds live subscriptions for. Cleared on
    /// reconnect, since the transport drops all handlers with the link.
    subscribed: HashSet<ConversationId>,
}

/// Keeps the conversation store consistent with the broker and the REST
/// backend: bootstrap, live message routing, history fetches, sends.
pub struct SyncController {
    transport: Arc<BrokerTransport>,
    api: Arc<dyn ChatApi>,
    store: Arc<Mutex<ConversationStore>>,
    user_id: UserId,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SyncController {
    pub fn new(
        transport: Arc<BrokerTransport>,
        api: Arc<dyn ChatApi>,
        store: Arc<Mutex<ConversationStore>>,
        user_id: UserId,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            api,
            store,
            user_id,
            inner: Mutex::new(SyncState::default()),
            events,
        })
    }

    /// Initial state load. The contact list is required; the chat and group
    /// overviews are best-effort and degrade to an empty list.
    pub async fn bootstrap(self: &Arc<Self>) -> anyhow::Result<()> {
        let users = self.api.get_users().await?;
        let contacts: Vec<Contact> = users
            .into_iter()
            .filter(|user| user.id != self.user_id)
            .map(|user| Contact {
                id: user.id,
                name: user.name,
            })
            .collect();

        let chat_lists = match self.api.get_chat_lists(&self.user_id).await {
            Ok(lists) => lists,
            Err(err) => {
                warn!("chat overview fetch failed, starting empty: {err:#}");
                HashMap::new()
            }
        };
        let group_list = match self.api.get_group_list(&self.user_id).await {
            Ok(list) => list,
            Err(err) => {
                warn!("group overview fetch failed, starting empty: {err:#}");
                Vec::new()
            }
        };

        let mut seeds = Vec::new();
        for (peer_id, entry) in chat_lists {
            let Some(contact) = contacts.iter().find(|c| c.id == peer_id) else {
                debug!(peer = %peer_id, "chat overview entry for unknown user, skipping");
                continue;
            };
            seeds.push(direct_seed(contact, entry));
        }
        for entry in &group_list {
            seeds.push(group_seed(entry));
        }

        {
            let mut store = self.store.lock().await;
            store.set_contacts(contacts);
            store.upsert_from_snapshot(seeds);
        }

        for entry in group_list {
            self.subscribe_group(entry.group_id).await;
        }
        let _ = self.events.send(SessionEvent::ConversationListChanged);
        info!(user_id = %self.user_id, "conversation state bootstrapped");
        Ok(())
    }

    /// Subscribes the per-user queues and spawns their routing tasks. Must
    /// run again after every reconnect.
    pub async fn attach_user_queues(self: &Arc<Self>) {
        let mut chat_rx = self.transport.subscribe(&user_chat_queue(&self.user_id)).await;
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let topic = user_chat_queue(&controller.user_id);
            while let Some(body) = chat_rx.recv().await {
                match codec::decode_chat(&topic, body) {
                    Ok(frame) => controller.handle_inbound_direct(frame).await,
                    Err(err) => warn!("{err}"),
                }
            }
        });

        let mut group_rx = self
            .transport
            .subscribe(&user_group_queue(&self.user_id))
            .await;
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let topic = user_group_queue(&controller.user_id);
            while let Some(body) = group_rx.recv().await {
                match codec::decode_group_created(&topic, body) {
                    Ok(frame) => controller.handle_group_created(frame).await,
                    Err(err) => warn!("{err}"),
                }
            }
        });
    }

    /// Drops the local record of live subscriptions after the transport
    /// lost its link, then re-subscribes every known group topic.
    pub async fn reattach_after_reconnect(self: &Arc<Self>) {
        let groups: Vec<GroupId> = {
            self.inner.lock().await.subscribed.clear();
            let store = self.store.lock().await;
            store
                .conversations()
                .iter()
                .filter_map(|conversation| match &conversation.id {
                    ConversationId::Group(group_id) => Some(group_id.clone()),
                    ConversationId::Direct(_) => None,
                })
                .collect()
        };
        self.attach_user_queues().await;
        for group_id in groups {
            self.subscribe_group(group_id).await;
        }
    }

    /// Opens a conversation: marks it active and read, clears the server
    /// side notification counter, and loads history the first time. A
    /// failed history fetch degrades the conversation to live-only.
    pub async fn select_conversation(self: &Arc<Self>, conversation_id: ConversationId) {
        let needs_history = {
            let mut store = self.store.lock().await;
            // Opening a chat straight from the contact list: no conversation
            // exists yet, so seed one from the directory entry.
            if store.conversation(&conversation_id).is_none() {
                if let ConversationId::Direct(peer_id) = &conversation_id {
                    if let Some(contact) = store.contact(peer_id).cloned() {
                        store.insert_conversation(ConversationSeed {
                            id: conversation_id.clone(),
                            name: contact.name,
                            participants: vec![contact.id],
                            last_message: None,
                            unread_count: 0,
                        });
                    }
                }
            }
            store.set_active(Some(conversation_id.clone()));
            store
                .conversation(&conversation_id)
                .map(|c| !c.history_loaded)
                .unwrap_or(true)
        };
        let _ = self.events.send(SessionEvent::ConversationListChanged);

        match &conversation_id {
            ConversationId::Direct(peer_id) => {
                if let Err(err) = self
                    .api
                    .clear_chat_notification(&self.user_id, peer_id)
                    .await
                {
                    warn!(peer = %peer_id, "notification clear failed: {err:#}");
                }
            }
            ConversationId::Group(group_id) => {
                if let Err(err) = self
                    .api
                    .clear_group_notification(group_id, &self.user_id)
                    .await
                {
                    warn!(group = %group_id, "notification clear failed: {err:#}");
                }
            }
        }

        // History must settle before the room subscription goes live.
        if needs_history {
            self.load_history(conversation_id.clone()).await;
        }
        match conversation_id {
            ConversationId::Direct(peer_id) => self.subscribe_direct_room(peer_id).await,
            ConversationId::Group(group_id) => self.subscribe_group(group_id).await,
        }
    }

    async fn load_history(self: &Arc<Self>, conversation_id: ConversationId) {
        let generation = {
            let mut inner = self.inner.lock().await;
            let counter = inner
                .fetch_generations
                .entry(conversation_id.clone())
                .or_insert(0);
            *counter += 1;
            *counter
        };

        let fetched = match &conversation_id {
            ConversationId::Direct(peer_id) => self
                .api
                .get_chat_history(&self.user_id, peer_id)
                .await
                .map(|records| {
                    records
                        .into_iter()
                        .map(|record| Message {
                            id: record.id,
                            sender_id: record.sender_id,
                            content: record.message,
                            timestamp: record.timestamp,
                            kind: record.kind,
                        })
                        .collect::<Vec<_>>()
                }),
            ConversationId::Group(group_id) => self
                .api
                .get_group_history(group_id, &self.user_id)
                .await
                .map(|records| {
                    records
                        .into_iter()
                        .map(|record| Message {
                            id: record.id,
                            sender_id: record.sender_id,
                            content: record.message,
                            timestamp: record.time.unwrap_or_else(Utc::now),
                            kind: record.kind,
                        })
                        .collect::<Vec<_>>()
                }),
        };

        let history = match fetched {
            Ok(history) => history,
            Err(source) => {
                let err = HistoryFetchError {
                    conversation: conversation_id.to_string(),
                    source,
                };
                warn!("{err}, staying live-only");
                let _ = self.events.send(SessionEvent::Error(err.to_string()));
                return;
            }
        };

        {
            let inner = self.inner.lock().await;
            if inner.fetch_generations.get(&conversation_id) != Some(&generation) {
                debug!(conversation = %conversation_id, "discarding stale history fetch");
                return;
            }
        }
        self.store
            .lock()
            .await
            .replace_history(&conversation_id, history);
        let _ = self.events.send(SessionEvent::ConversationListChanged);
    }

    async fn subscribe_direct_room(self: &Arc<Self>, peer_id: UserId) {
        let conversation_id = ConversationId::Direct(peer_id.clone());
        if !self.inner.lock().await.subscribed.insert(conversation_id) {
            return;
        }
        let topic = room_topic(&direct_room_id(&self.user_id, &peer_id));
        let mut rx = self.transport.subscribe(&topic).await;
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                match codec::decode_chat(&topic, body) {
                    Ok(frame) => controller.handle_inbound_direct(frame).await,
                    Err(err) => warn!("{err}"),
                }
            }
        });
    }

    async fn subscribe_group(self: &Arc<Self>, group_id: GroupId) {
        let conversation_id = ConversationId::Group(group_id.clone());
        if !self.inner.lock().await.subscribed.insert(conversation_id) {
            return;
        }
        let topic = group_topic(&group_id);
        let mut rx = self.transport.subscribe(&topic).await;
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                match codec::decode_group(&topic, body) {
                    Ok(frame) => controller.handle_inbound_group(frame).await,
                    Err(err) => warn!("{err}"),
                }
            }
        });
    }

    async fn handle_inbound_direct(self: &Arc<Self>, frame: ChatFrame) {
        if frame.sender_id == self.user_id {
            self.consume_echo(frame.id.as_ref()).await;
            return;
        }
        let conversation_id = ConversationId::Direct(frame.sender_id.clone());
        let message = Message {
            id: frame.id.unwrap_or_else(fresh_message_id),
            sender_id: frame.sender_id,
            content: frame.message,
            timestamp: Utc::now(),
            kind: MessageKind::Text,
        };
        self.deliver(conversation_id, message).await;
    }

    async fn handle_inbound_group(self: &Arc<Self>, frame: GroupFrame) {
        if frame.sender_id == self.user_id {
            self.consume_echo(frame.id.as_ref()).await;
            return;
        }
        let conversation_id = ConversationId::Group(frame.group_id.clone());
        let message = Message {
            id: frame.id.unwrap_or_else(fresh_message_id),
            sender_id: frame.sender_id,
            content: frame.message,
            timestamp: frame.time.unwrap_or_else(Utc::now),
            kind: frame.kind,
        };
        self.deliver(conversation_id, message).await;
    }

    /// A frame from ourselves is the broker echoing a send back. The
    /// optimistic copy is already in the store, so the echo is dropped
    /// whether or not the id is still in the pending set.
    async fn consume_echo(&self, id: Option<&MessageId>) {
        let mut inner = self.inner.lock().await;
        match id {
            Some(id) if inner.pending_sends.remove(id) => {
                debug!(message = %id, "send confirmed by broker echo")
            }
            _ => debug!("dropping unmatched self-sent frame"),
        }
    }

    async fn deliver(&self, conversation_id: ConversationId, message: Message) {
        let outcome = self
            .store
            .lock()
            .await
            .append_message(&conversation_id, message.clone());
        match outcome {
            AppendOutcome::Appended => {
                let _ = self.events.send(SessionEvent::MessageReceived {
                    conversation: conversation_id,
                    message,
                });
                let _ = self.events.send(SessionEvent::ConversationListChanged);
            }
            AppendOutcome::Duplicate => {
                debug!(conversation = %conversation_id, "duplicate delivery dropped")
            }
            AppendOutcome::UnknownSender => {
                warn!(conversation = %conversation_id, "message for unknown conversation dropped")
            }
        }
    }

    async fn handle_group_created(self: &Arc<Self>, frame: GroupCreatedFrame) {
        info!(group = %frame.group_id, name = %frame.group_name, "added to group");
        self.store.lock().await.insert_conversation(ConversationSeed {
            id: ConversationId::Group(frame.group_id.clone()),
            name: frame.group_name,
            participants: frame.members_id,
            last_message: None,
            unread_count: 0,
        });
        self.subscribe_group(frame.group_id).await;
        let _ = self.events.send(SessionEvent::ConversationListChanged);
    }

    /// Optimistic send: the message lands in the store immediately under a
    /// client-generated id, and the broker echo is matched against that id.
    pub async fn send_direct(&self, peer_id: &UserId, content: String) -> MessageId {
        let id = fresh_message_id();
        let message = Message {
            id: id.clone(),
            sender_id: self.user_id.clone(),
            content: content.clone(),
            timestamp: Utc::now(),
            kind: MessageKind::Text,
        };
        self.store
            .lock()
            .await
            .append_message(&ConversationId::Direct(peer_id.clone()), message);
        self.inner.lock().await.pending_sends.insert(id.clone());

        let frame = ChatFrame {
            id: Some(id.clone()),
            room_id: direct_room_id(&self.user_id, peer_id),
            sender_id: self.user_id.clone(),
            receiver_id: peer_id.clone(),
            message: content,
        };
        self.publish(OutboundIntent::SendChat(frame)).await;
        let _ = self.events.send(SessionEvent::ConversationListChanged);
        id
    }

    pub async fn send_group(
        &self,
        group_id: &GroupId,
        content: String,
        kind: MessageKind,
    ) -> MessageId {
        let id = fresh_message_id();
        let now = Utc::now();
        let message = Message {
            id: id.clone(),
            sender_id: self.user_id.clone(),
            content: content.clone(),
            timestamp: now,
            kind,
        };
        self.store
            .lock()
            .await
            .append_message(&ConversationId::Group(group_id.clone()), message);
        self.inner.lock().await.pending_sends.insert(id.clone());

        let frame = GroupFrame {
            id: Some(id.clone()),
            group_id: group_id.clone(),
            sender_id: self.user_id.clone(),
            message: content,
            time: Some(now),
            kind,
        };
        self.publish(OutboundIntent::SendGroupMessage(frame)).await;
        let _ = self.events.send(SessionEvent::ConversationListChanged);
        id
    }

    pub async fn create_group(
        self: &Arc<Self>,
        name: String,
        description: String,
        members: Vec<UserId>,
    ) -> anyhow::Result<GroupId> {
        let request = CreateGroupRequest {
            group_name: name,
            group_description: description,
            created_by: self.user_id.clone(),
            members_id: members,
        };
        let summary = self.api.create_group(&request).await?;
        self.store.lock().await.insert_conversation(ConversationSeed {
            id: ConversationId::Group(summary.group_id.clone()),
            name: summary.group_name,
            participants: summary.members_id,
            last_message: None,
            unread_count: 0,
        });
        self.subscribe_group(summary.group_id.clone()).await;
        let _ = self.events.send(SessionEvent::ConversationListChanged);
        Ok(summary.group_id)
    }

    /// Forgets all in-flight bookkeeping. Used on logout.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.fetch_generations.clear();
        inner.pending_sends.clear();
        inner.subscribed.clear();
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.store.lock().await.conversations().to_vec()
    }

    pub async fn total_unread(&self) -> u32 {
        self.store.lock().await.total_unread()
    }

    async fn publish(&self, intent: OutboundIntent) {
        match codec::encode_outbound(&intent) {
            Ok(frame) => self.transport.publish(&frame.topic, frame.body).await,
            Err(err) => warn!("failed to encode outbound frame: {err}"),
        }
    }
}

fn fresh_message_id() -> MessageId {
    MessageId(Uuid::new_v4().to_string())
}

fn direct_seed(contact: &Contact, entry: ChatListEntry) -> ConversationSeed {
    ConversationSeed {
        id: ConversationId::Direct(contact.id.clone()),
        name: contact.name.clone(),
        participants: vec![contact.id.clone()],
        last_message: entry.last_msg.map(|content| LastMessage {
            content,
            timestamp: entry.timestamp,
        }),
        unread_count: entry.unread_count,
    }
}

fn group_seed(entry: &GroupListEntry) -> ConversationSeed {
    ConversationSeed {
        id: ConversationId::Group(entry.group_id.clone()),
        name: entry.group_name.clone(),
        participants: entry.members_id.clone(),
        last_message: entry.last_msg.clone().map(|content| LastMessage {
            content,
            timestamp: entry.timestamp,
        }),
        unread_count: entry.unread_count,
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
