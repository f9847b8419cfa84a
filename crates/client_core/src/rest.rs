use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use shared::domain::{GroupId, MessageId, MessageKind, UserId};

/// Backend REST surface used for bootstrap and history. Everything here is
/// fallible and slow-path; the live message flow never touches it.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn get_users(&self) -> Result<Vec<ApiUser>>;
    async fn get_chat_lists(&self, user_id: &UserId) -> Result<HashMap<UserId, ChatListEntry>>;
    async fn get_chat_history(
        &self,
        sender_id: &UserId,
        receiver_id: &UserId,
    ) -> Result<Vec<ChatMessageRecord>>;
    async fn get_group_list(&self, user_id: &UserId) -> Result<Vec<GroupListEntry>>;
    async fn get_group_history(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Vec<GroupMessageRecord>>;
    async fn create_group(&self, request: &CreateGroupRequest) -> Result<GroupSummary>;
    async fn clear_group_notification(&self, group_id: &GroupId, user_id: &UserId) -> Result<()>;
    async fn clear_chat_notification(
        &self,
        sender_id: &UserId,
        receiver_id: &UserId,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUser {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRecord {
    pub id: MessageId,
    pub sender_id: UserId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
}

/// One row of the direct-chat overview, keyed by the peer's user id.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatListEntry {
    #[serde(rename = "lastMsg")]
    pub last_msg: Option<String>,
    #[serde(rename = "unreadcount", default)]
    pub unread_count: u32,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupListEntry {
    pub group_id: GroupId,
    pub group_name: String,
    #[serde(default)]
    pub members_id: Vec<UserId>,
    #[serde(default)]
    pub last_msg: Option<String>,
    #[serde(rename = "unreadcount", default)]
    pub unread_count: u32,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessageRecord {
    pub id: MessageId,
    pub sender_id: UserId,
    pub message: String,
    /// The backend stores a nullable time column; `None` for legacy rows.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub group_name: String,
    pub group_description: String,
    pub created_by: UserId,
    pub members_id: Vec<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    #[serde(alias = "id")]
    pub group_id: GroupId,
    pub group_name: String,
    #[serde(default)]
    pub members_id: Vec<UserId>,
}

/// Standard response envelope wrapped around every backend payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    data: Option<T>,
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T> {
    if !envelope.status {
        let reason = envelope
            .message
            .or(envelope.error_type)
            .unwrap_or_else(|| "no reason given".to_string());
        return Err(anyhow!("backend rejected request: {reason}"));
    }
    envelope
        .data
        .ok_or_else(|| anyhow!("backend response missing data payload"))
}

#[derive(Debug, Deserialize)]
struct UsersPayload {
    user: Vec<ApiUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatListPayload {
    chat_list: HashMap<UserId, ChatListEntry>,
}

#[derive(Debug, Deserialize)]
struct ChatHistoryPayload {
    messages: Vec<ChatMessageRecord>,
}

#[derive(Debug, Deserialize)]
struct GroupListPayload {
    #[serde(rename = "groupsDet")]
    groups: Vec<GroupListEntry>,
}

/// Real backend client. Bearer token on every request; non-2xx statuses
/// and envelope-level failures both surface as errors.
pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            access_token: access_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let envelope = self
            .http
            .get(self.url(path))
            .query(query)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .with_context(|| format!("GET {path}"))?
            .error_for_status()
            .with_context(|| format!("GET {path}"))?
            .json::<Envelope<T>>()
            .await
            .with_context(|| format!("GET {path}: invalid response body"))?;
        unwrap_envelope(envelope)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn get_users(&self) -> Result<Vec<ApiUser>> {
        let payload: UsersPayload = self.get_json("/user/getAllUsers", &[]).await?;
        Ok(payload.user)
    }

    async fn get_chat_lists(&self, user_id: &UserId) -> Result<HashMap<UserId, ChatListEntry>> {
        let path = format!("/chat/getChatLists/{user_id}");
        let payload: ChatListPayload = self.get_json(&path, &[]).await?;
        Ok(payload.chat_list)
    }

    async fn get_chat_history(
        &self,
        sender_id: &UserId,
        receiver_id: &UserId,
    ) -> Result<Vec<ChatMessageRecord>> {
        let payload: ChatHistoryPayload = self
            .get_json(
                "/chat/get.chats",
                &[
                    ("senderId", sender_id.as_str()),
                    ("receiverId", receiver_id.as_str()),
                ],
            )
            .await?;
        Ok(payload.messages)
    }

    async fn get_group_list(&self, user_id: &UserId) -> Result<Vec<GroupListEntry>> {
        let path = format!("/groupchat/getGroupList/{user_id}");
        let payload: GroupListPayload = self.get_json(&path, &[]).await?;
        Ok(payload.groups)
    }

    async fn get_group_history(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Vec<GroupMessageRecord>> {
        // Unlike the other endpoints, `data` here is the record array itself.
        let path = format!("/groupchat/getMessages/{group_id}");
        self.get_json(&path, &[("userId", user_id.as_str())]).await
    }

    async fn create_group(&self, request: &CreateGroupRequest) -> Result<GroupSummary> {
        let envelope = self
            .http
            .post(self.url("/group/create"))
            .bearer_auth(&self.access_token)
            .json(request)
            .send()
            .await
            .context("POST /group/create")?
            .error_for_status()
            .context("POST /group/create")?
            .json::<Envelope<GroupSummary>>()
            .await
            .context("POST /group/create: invalid response body")?;
        unwrap_envelope(envelope)
    }

    async fn clear_group_notification(&self, group_id: &GroupId, user_id: &UserId) -> Result<()> {
        self.http
            .post(self.url("/groupchat/clearNotification"))
            .query(&[
                ("groupId", group_id.as_str()),
                ("onlineUser", user_id.as_str()),
            ])
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("POST /groupchat/clearNotification")?
            .error_for_status()
            .context("POST /groupchat/clearNotification")?;
        Ok(())
    }

    async fn clear_chat_notification(
        &self,
        sender_id: &UserId,
        receiver_id: &UserId,
    ) -> Result<()> {
        self.http
            .put(self.url("/chat/clearOnlineNotification"))
            .query(&[
                ("senderId", sender_id.as_str()),
                ("receiverId", receiver_id.as_str()),
            ])
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("PUT /chat/clearOnlineNotification")?
            .error_for_status()
            .context("PUT /chat/clearOnlineNotification")?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
