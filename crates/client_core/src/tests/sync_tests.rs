use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use super::*;
use crate::{
    rest::{ApiUser, ChatMessageRecord, GroupMessageRecord, GroupSummary},
    testsupport::{identity, settle, ChannelConnector},
    transport::WireFrame,
};
fn ts(at: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(at, 0).unwrap()
}

enum HistoryBehavior {
    Ok(Vec<ChatMessageRecord>),
    Delayed(Duration, Vec<ChatMessageRecord>),
    Fail,
}

#[derive(Default)]
struct MockApi {
    users: Vec<(String, String)>,
    chat_lists: HashMap<UserId, ChatListEntry>,
    groups: Vec<GroupListEntry>,
    history_script: StdMutex<Vec<HistoryBehavior>>,
    history_calls: AtomicUsize,
}

impl MockApi {
    fn record(id: &str, sender: &str, message: &str, at: i64) -> ChatMessageRecord {
        ChatMessageRecord {
            id: MessageId::from(id),
            sender_id: UserId::from(sender),
            message: message.to_string(),
            timestamp: ts(at),
            kind: MessageKind::default(),
        }
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn get_users(&self) -> anyhow::Result<Vec<ApiUser>> {
        Ok(self
            .users
            .iter()
            .map(|(id, name)| ApiUser {
                id: UserId::from(id.as_str()),
                name: name.clone(),
            })
            .collect())
    }

    async fn get_chat_lists(
        &self,
        _user_id: &UserId,
    ) -> anyhow::Result<HashMap<UserId, ChatListEntry>> {
        Ok(self
            .chat_lists
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    ChatListEntry {
                        last_msg: entry.last_msg.clone(),
                        unread_count: entry.unread_count,
                        timestamp: entry.timestamp,
                    },
                )
            })
            .collect())
    }

    async fn get_chat_history(
        &self,
        _sender_id: &UserId,
        _receiver_id: &UserId,
    ) -> anyhow::Result<Vec<ChatMessageRecord>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = {
            let mut script = self.history_script.lock().unwrap();
            if script.is_empty() {
                return Ok(Vec::new());
            }
            script.remove(0)
        };
        match behavior {
            HistoryBehavior::Ok(records) => Ok(records),
            HistoryBehavior::Delayed(delay, records) => {
                tokio::time::sleep(delay).await;
                Ok(records)
            }
            HistoryBehavior::Fail => Err(anyhow!("backend unavailable")),
        }
    }

    async fn get_group_list(&self, _user_id: &UserId) -> anyhow::Result<Vec<GroupListEntry>> {
        Ok(self
            .groups
            .iter()
            .map(|entry| GroupListEntry {
                group_id: entry.group_id.clone(),
                group_name: entry.group_name.clone(),
                members_id: entry.members_id.clone(),
                last_msg: entry.last_msg.clone(),
                unread_count: entry.unread_count,
                timestamp: entry.timestamp,
            })
            .collect())
    }

    async fn get_group_history(
        &self,
        _group_id: &GroupId,
        _user_id: &UserId,
    ) -> anyhow::Result<Vec<GroupMessageRecord>> {
        Ok(Vec::new())
    }

    async fn create_group(&self, request: &CreateGroupRequest) -> anyhow::Result<GroupSummary> {
        Ok(GroupSummary {
            group_id: GroupId::from("g-new"),
            group_name: request.group_name.clone(),
            members_id: request.members_id.clone(),
        })
    }

    async fn clear_group_notification(
        &self,
        _group_id: &GroupId,
        _user_id: &UserId,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clear_chat_notification(
        &self,
        _sender_id: &UserId,
        _receiver_id: &UserId,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Harness {
    controller: std::sync::Arc<SyncController>,
    connector: std::sync::Arc<ChannelConnector>,
    transport: std::sync::Arc<BrokerTransport>,
    store: std::sync::Arc<tokio::sync::Mutex<ConversationStore>>,
    events: broadcast::Receiver<SessionEvent>,
    api: std::sync::Arc<MockApi>,
}

async fn harness(api: MockApi) -> Harness {
    let connector = ChannelConnector::new();
    let transport = BrokerTransport::new(connector.clone());
    transport.connect(identity("u-1")).await.unwrap();
    let store = std::sync::Arc::new(tokio::sync::Mutex::new(ConversationStore::new()));
    let (events_tx, events) = broadcast::channel(64);
    let api = std::sync::Arc::new(api);
    let controller = SyncController::new(
        transport.clone(),
        api.clone(),
        store.clone(),
        UserId::from("u-1"),
        events_tx,
    );
    controller.attach_user_queues().await;
    Harness {
        controller,
        connector,
        transport,
        store,
        events,
        api,
    }
}

fn two_contacts() -> MockApi {
    MockApi {
        users: vec![
            ("u-1".to_string(), "Me".to_string()),
            ("u-2".to_string(), "Amira".to_string()),
            ("u-3".to_string(), "Bo".to_string()),
        ],
        ..MockApi::default()
    }
}

fn chat_body(id: &str, sender: &str, receiver: &str, message: &str) -> serde_json::Value {
    json!({
        "id": id,
        "roomId": format!("{receiver}_{sender}"),
        "senderId": sender,
        "receiverId": receiver,
        "message": message
    })
}

#[tokio::test]
async fn bootstrap_seeds_conversations_from_overviews() {
    let mut api = two_contacts();
    api.chat_lists.insert(
        UserId::from("u-2"),
        ChatListEntry {
            last_msg: Some("hi".to_string()),
            unread_count: 2,
            timestamp: Some(ts(100)),
        },
    );
    api.groups.push(GroupListEntry {
        group_id: GroupId::from("g-1"),
        group_name: "team".to_string(),
        members_id: vec![UserId::from("u-1"), UserId::from("u-2")],
        last_msg: None,
        unread_count: 0,
        timestamp: None,
    });
    let h = harness(api).await;

    h.controller.bootstrap().await.unwrap();

    let store = h.store.lock().await;
    assert_eq!(store.conversations().len(), 2);
    let amira = store
        .conversation(&ConversationId::Direct(UserId::from("u-2")))
        .unwrap();
    assert_eq!(amira.name, "Amira");
    assert_eq!(amira.unread_count, 2);
    // Our own entry never becomes a contact.
    assert!(store.contact(&UserId::from("u-1")).is_none());
    assert!(store.contact(&UserId::from("u-3")).is_some());
}

#[tokio::test]
async fn live_direct_message_bumps_unread_and_moves_front() {
    let h = harness(two_contacts()).await;
    h.controller.bootstrap().await.unwrap();
    let server = h.connector.latest_end();

    server
        .to_client
        .send(WireFrame {
            topic: "/user/u-1/queue/chat".to_string(),
            body: chat_body("m1", "u-3", "u-1", "hi"),
        })
        .unwrap();
    settle().await;

    let store = h.store.lock().await;
    let front = &store.conversations()[0];
    assert_eq!(front.id, ConversationId::Direct(UserId::from("u-3")));
    assert_eq!(front.unread_count, 1);
    assert_eq!(front.messages[0].content, "hi");
}

#[tokio::test]
async fn broker_echo_of_own_send_is_not_duplicated() {
    let mut h = harness(two_contacts()).await;
    h.controller.bootstrap().await.unwrap();
    let mut server = h.connector.latest_end();

    let id = h
        .controller
        .send_direct(&UserId::from("u-2"), "hello".to_string())
        .await;
    let published = server.from_client.recv().await.unwrap();
    assert_eq!(published.topic, "/app/send.chat");
    assert_eq!(published.body["id"], id.as_str());

    // Server echoes the frame back on the sender's own queue.
    server
        .to_client
        .send(WireFrame {
            topic: "/user/u-1/queue/chat".to_string(),
            body: published.body,
        })
        .unwrap();
    settle().await;

    let store = h.store.lock().await;
    let conversation = store
        .conversation(&ConversationId::Direct(UserId::from("u-2")))
        .unwrap();
    assert_eq!(conversation.messages.len(), 1);
    drop(store);
    while let Ok(event) = h.events.try_recv() {
        assert!(!matches!(event, SessionEvent::MessageReceived { .. }));
    }
}

#[tokio::test]
async fn unmatched_self_frame_is_dropped() {
    let h = harness(two_contacts()).await;
    h.controller.bootstrap().await.unwrap();
    let server = h.connector.latest_end();

    server
        .to_client
        .send(WireFrame {
            topic: "/user/u-1/queue/chat".to_string(),
            body: chat_body("m-other-device", "u-1", "u-2", "from elsewhere"),
        })
        .unwrap();
    settle().await;

    let store = h.store.lock().await;
    assert!(store
        .conversation(&ConversationId::Direct(UserId::from("u-2")))
        .is_none());
}

#[tokio::test]
async fn history_is_fetched_once_per_conversation() {
    let mut api = two_contacts();
    api.history_script = StdMutex::new(vec![HistoryBehavior::Ok(vec![
        MockApi::record("m1", "u-2", "one", 100),
        MockApi::record("m2", "u-1", "two", 200),
    ])]);
    let h = harness(api).await;
    h.controller.bootstrap().await.unwrap();

    let conversation = ConversationId::Direct(UserId::from("u-2"));
    // First open creates the conversation lazily via a live message.
    h.store.lock().await.append_message(
        &conversation,
        Message {
            id: MessageId::from("m3"),
            sender_id: UserId::from("u-2"),
            content: "three".to_string(),
            timestamp: ts(300),
            kind: MessageKind::default(),
        },
    );

    h.controller.select_conversation(conversation.clone()).await;
    h.controller.select_conversation(conversation.clone()).await;

    assert_eq!(h.api.history_calls.load(Ordering::SeqCst), 1);
    let store = h.store.lock().await;
    let conversation = store.conversation(&conversation).unwrap();
    assert!(conversation.history_loaded);
    let ids: Vec<_> = conversation
        .messages
        .iter()
        .map(|m| m.id.as_str().to_string())
        .collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn selecting_a_contact_without_a_conversation_creates_and_fetches() {
    let mut api = two_contacts();
    api.history_script = StdMutex::new(vec![HistoryBehavior::Ok(vec![MockApi::record(
        "m1", "u-3", "old hello", 100,
    )])]);
    let h = harness(api).await;
    h.controller.bootstrap().await.unwrap();

    // Bo never chatted with us before; opening from the contact list must
    // still fetch and land the history somewhere.
    let conversation = ConversationId::Direct(UserId::from("u-3"));
    h.controller.select_conversation(conversation.clone()).await;

    assert_eq!(h.api.history_calls.load(Ordering::SeqCst), 1);
    let store = h.store.lock().await;
    let opened = store.conversation(&conversation).unwrap();
    assert_eq!(opened.name, "Bo");
    assert!(opened.history_loaded);
    assert_eq!(opened.messages[0].content, "old hello");
}

#[tokio::test]
async fn history_failure_degrades_to_live_only() {
    let mut api = two_contacts();
    api.chat_lists.insert(
        UserId::from("u-2"),
        ChatListEntry {
            last_msg: Some("hi".to_string()),
            unread_count: 0,
            timestamp: Some(ts(100)),
        },
    );
    api.history_script = StdMutex::new(vec![HistoryBehavior::Fail]);
    let mut h = harness(api).await;
    h.controller.bootstrap().await.unwrap();

    let conversation = ConversationId::Direct(UserId::from("u-2"));
    h.controller.select_conversation(conversation.clone()).await;

    let store = h.store.lock().await;
    let degraded = store.conversation(&conversation).unwrap();
    assert!(!degraded.history_loaded);
    drop(store);
    let mut saw_error = false;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, SessionEvent::Error(_)) {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test(start_paused = true)]
async fn stale_history_fetch_is_discarded() {
    let mut api = two_contacts();
    api.chat_lists.insert(
        UserId::from("u-2"),
        ChatListEntry {
            last_msg: None,
            unread_count: 0,
            timestamp: None,
        },
    );
    api.history_script = StdMutex::new(vec![
        HistoryBehavior::Delayed(
            Duration::from_millis(50),
            vec![MockApi::record("stale", "u-2", "old page", 100)],
        ),
        HistoryBehavior::Ok(vec![MockApi::record("fresh", "u-2", "new page", 200)]),
    ]);
    let h = harness(api).await;
    h.controller.bootstrap().await.unwrap();

    let conversation = ConversationId::Direct(UserId::from("u-2"));
    tokio::join!(
        h.controller.select_conversation(conversation.clone()),
        h.controller.select_conversation(conversation.clone()),
    );

    let store = h.store.lock().await;
    let ids: Vec<_> = store
        .conversation(&conversation)
        .unwrap()
        .messages
        .iter()
        .map(|m| m.id.as_str().to_string())
        .collect();
    assert_eq!(ids, vec!["fresh"]);
}

#[tokio::test]
async fn group_created_notice_inserts_and_subscribes() {
    let h = harness(two_contacts()).await;
    h.controller.bootstrap().await.unwrap();
    let server = h.connector.latest_end();

    server
        .to_client
        .send(WireFrame {
            topic: "/user/u-1/queue/group".to_string(),
            body: json!({
                "groupId": "g-9",
                "groupName": "launch",
                "createdBy": "u-2",
                "membersId": ["u-1", "u-2"]
            }),
        })
        .unwrap();
    settle().await;

    server
        .to_client
        .send(WireFrame {
            topic: "/topic/group/g-9".to_string(),
            body: json!({
                "id": "gm1",
                "groupId": "g-9",
                "senderId": "u-2",
                "message": "we are live"
            }),
        })
        .unwrap();
    settle().await;

    let store = h.store.lock().await;
    let group = store
        .conversation(&ConversationId::Group(GroupId::from("g-9")))
        .unwrap();
    assert_eq!(group.name, "launch");
    assert_eq!(group.unread_count, 1);
    assert_eq!(group.messages[0].content, "we are live");
}

#[tokio::test]
async fn reconnect_reasserts_user_queues_and_group_topics() {
    let mut api = two_contacts();
    api.groups.push(GroupListEntry {
        group_id: GroupId::from("g-1"),
        group_name: "team".to_string(),
        members_id: Vec::new(),
        last_msg: None,
        unread_count: 0,
        timestamp: None,
    });
    let h = harness(api).await;
    h.controller.bootstrap().await.unwrap();

    // Simulate the transport dropping its handler table with the link.
    h.transport.disconnect().await;
    h.transport.connect(identity("u-1")).await.unwrap();
    h.controller.reattach_after_reconnect().await;
    let server = h.connector.latest_end();

    server
        .to_client
        .send(WireFrame {
            topic: "/topic/group/g-1".to_string(),
            body: json!({
                "id": "gm2",
                "groupId": "g-1",
                "senderId": "u-2",
                "message": "back again"
            }),
        })
        .unwrap();
    server
        .to_client
        .send(WireFrame {
            topic: "/user/u-1/queue/chat".to_string(),
            body: chat_body("m9", "u-2", "u-1", "still here"),
        })
        .unwrap();
    settle().await;

    let store = h.store.lock().await;
    assert_eq!(
        store
            .conversation(&ConversationId::Group(GroupId::from("g-1")))
            .unwrap()
            .messages
            .len(),
        1
    );
    assert_eq!(
        store
            .conversation(&ConversationId::Direct(UserId::from("u-2")))
            .unwrap()
            .messages
            .len(),
        1
    );
}

#[tokio::test]
async fn create_group_inserts_and_emits() {
    let mut h = harness(two_contacts()).await;
    h.controller.bootstrap().await.unwrap();

    let group_id = h
        .controller
        .create_group(
            "launch".to_string(),
            "ship it".to_string(),
            vec![UserId::from("u-2")],
        )
        .await
        .unwrap();

    assert_eq!(group_id, GroupId::from("g-new"));
    let store = h.store.lock().await;
    assert!(store
        .conversation(&ConversationId::Group(group_id.clone()))
        .is_some());
    drop(store);
    let mut saw_list_change = false;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, SessionEvent::ConversationListChanged) {
            saw_list_change = true;
        }
    }
    assert!(saw_list_change);
}
