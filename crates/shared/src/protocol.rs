use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CallType, GroupId, MessageId, MessageKind, RoomId, UserId};

/// Outbound destinations, one per intent.
pub const SEND_CHAT: &str = "/app/send.chat";
pub const SEND_GROUP_MESSAGE: &str = "/app/send.groupMessage";
pub const CALL_OFFER: &str = "/app/call.offer";
pub const CALL_ANSWER: &str = "/app/call.answer";
pub const CALL_CANDIDATE: &str = "/app/call.candidate";
pub const CALL_EVENT: &str = "/app/call.event";

/// Per-user inbound queue for direct chat delivery.
pub fn user_chat_queue(user_id: &UserId) -> String {
    format!("/user/{user_id}/queue/chat")
}

/// Per-user inbound queue for call signaling.
pub fn user_call_queue(user_id: &UserId) -> String {
    format!("/user/{user_id}/queue/call")
}

/// Per-user inbound queue for group-created notices.
pub fn user_group_queue(user_id: &UserId) -> String {
    format!("/user/{user_id}/queue/group")
}

/// Room-scoped fan-out topic for a direct conversation.
pub fn room_topic(room_id: &RoomId) -> String {
    format!("/topic/room/{room_id}")
}

/// Room-scoped fan-out topic for a group conversation.
pub fn group_topic(group_id: &GroupId) -> String {
    format!("/topic/group/{group_id}")
}

/// Deterministic room id for a direct chat pair. The backend keys direct
/// rooms by the sorted user-id pair; both ends derive the same id.
pub fn direct_room_id(a: &UserId, b: &UserId) -> RoomId {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    RoomId(format!("{first}_{second}"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCreatedFrame {
    pub group_id: GroupId,
    pub group_name: String,
    pub created_by: UserId,
    #[serde(default)]
    pub members_id: Vec<UserId>,
}

/// SDP description as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u32>,
}

/// Wire-level call signal discriminator. Inbound frames may use the legacy
/// long-form spellings; outbound frames always use the short forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallFrameKind {
    #[serde(alias = "call-offer")]
    Offer,
    #[serde(alias = "call-answer")]
    Answer,
    #[serde(alias = "ice-candidate")]
    Candidate,
    #[serde(alias = "call-end")]
    Hangup,
    Reject,
    Ringing,
    Busy,
    #[serde(alias = "call-reconnect", alias = "reconnect-answer")]
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    #[serde(rename = "type")]
    pub kind: CallFrameKind,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,
}

impl CallFrame {
    /// Bare event frame (hangup/reject/ringing/busy/reconnect).
    pub fn event(kind: CallFrameKind, from: UserId, to: UserId) -> Self {
        Self {
            kind,
            from_user_id: from,
            to_user_id: to,
            sender_name: None,
            offer: None,
            answer: None,
            candidate: None,
            call_type: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_room_id_is_order_independent() {
        let a = UserId::from("u-42");
        let b = UserId::from("u-7");
        assert_eq!(direct_room_id(&a, &b), direct_room_id(&b, &a));
        assert_eq!(direct_room_id(&a, &b), RoomId::from("u-42_u-7"));
    }

    #[test]
    fn chat_frame_round_trips_backend_field_names() {
        let json = serde_json::json!({
            "id": "m1",
            "roomId": "u-1_u-2",
            "senderId": "u-1",
            "receiverId": "u-2",
            "message": "hi"
        });
        let frame: ChatFrame = serde_json::from_value(json).expect("decode");
        assert_eq!(frame.sender_id, UserId::from("u-1"));
        let value = serde_json::to_value(&frame).expect("encode");
        assert_eq!(value["roomId"], "u-1_u-2");
    }

    #[test]
    fn call_frame_kind_accepts_legacy_spellings() {
        for (raw, expected) in [
            ("\"call-offer\"", CallFrameKind::Offer),
            ("\"offer\"", CallFrameKind::Offer),
            ("\"ice-candidate\"", CallFrameKind::Candidate),
            ("\"call-end\"", CallFrameKind::Hangup),
            ("\"hangup\"", CallFrameKind::Hangup),
        ] {
            let kind: CallFrameKind = serde_json::from_str(raw).expect(raw);
            assert_eq!(kind, expected);
        }
    }

    #[test]
    fn group_frame_defaults_kind_to_text() {
        let json = serde_json::json!({
            "groupId": "g-1",
            "senderId": "u-1",
            "message": "hello group"
        });
        let frame: GroupFrame = serde_json::from_value(json).expect("decode");
        assert_eq!(frame.kind, MessageKind::Text);
        assert!(frame.time.is_none());
    }
}
