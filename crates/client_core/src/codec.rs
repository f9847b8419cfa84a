use serde_json::Value;
use tracing::warn;

use shared::protocol::{
    CallFrame, CallFrameKind, ChatFrame, GroupCreatedFrame, GroupFrame, CALL_ANSWER,
    CALL_CANDIDATE, CALL_EVENT, CALL_OFFER, SEND_CHAT, SEND_GROUP_MESSAGE,
};

use crate::{error::MalformedFrameError, transport::WireFrame};

/// Call signals after normalization. `Hangup` and `Reject` collapse into
/// `End` on the way in; the distinction only matters outbound.
#[derive(Debug, Clone, PartialEq)]
pub enum CallSignal {
    Offer(CallFrame),
    Answer(CallFrame),
    Candidate(CallFrame),
    End(CallFrame),
    Ringing(CallFrame),
    Busy(CallFrame),
    Reconnect(CallFrame),
}

impl CallSignal {
    pub fn frame(&self) -> &CallFrame {
        match self {
            CallSignal::Offer(frame)
            | CallSignal::Answer(frame)
            | CallSignal::Candidate(frame)
            | CallSignal::End(frame)
            | CallSignal::Ringing(frame)
            | CallSignal::Busy(frame)
            | CallSignal::Reconnect(frame) => frame,
        }
    }
}

pub fn decode_chat(topic: &str, body: Value) -> Result<ChatFrame, MalformedFrameError> {
    serde_json::from_value(body).map_err(|err| MalformedFrameError::new(topic, err.to_string()))
}

pub fn decode_group(topic: &str, body: Value) -> Result<GroupFrame, MalformedFrameError> {
    serde_json::from_value(body).map_err(|err| MalformedFrameError::new(topic, err.to_string()))
}

pub fn decode_group_created(
    topic: &str,
    body: Value,
) -> Result<GroupCreatedFrame, MalformedFrameError> {
    serde_json::from_value(body).map_err(|err| MalformedFrameError::new(topic, err.to_string()))
}

/// Decodes a call-queue frame. An unknown `type` string is not an error:
/// the frame is dropped so newer server signal kinds never break older
/// clients.
pub fn decode_call(topic: &str, body: Value) -> Result<Option<CallSignal>, MalformedFrameError> {
    let kind_field = body
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| MalformedFrameError::new(topic, "missing type field"))?;

    let kind: CallFrameKind = match serde_json::from_value(Value::String(kind_field.to_string())) {
        Ok(kind) => kind,
        Err(_) => {
            warn!(topic, kind = kind_field, "dropping call frame of unknown type");
            return Ok(None);
        }
    };

    let frame: CallFrame = serde_json::from_value(body)
        .map_err(|err| MalformedFrameError::new(topic, err.to_string()))?;

    let signal = match kind {
        CallFrameKind::Offer => CallSignal::Offer(frame),
        CallFrameKind::Answer => CallSignal::Answer(frame),
        CallFrameKind::Candidate => CallSignal::Candidate(frame),
        CallFrameKind::Hangup | CallFrameKind::Reject => CallSignal::End(frame),
        CallFrameKind::Ringing => CallSignal::Ringing(frame),
        CallFrameKind::Busy => CallSignal::Busy(frame),
        CallFrameKind::Reconnect => CallSignal::Reconnect(frame),
    };
    Ok(Some(signal))
}

/// What the client wants to say, before it is bound to a destination.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundIntent {
    SendChat(ChatFrame),
    SendGroupMessage(GroupFrame),
    CallOffer(CallFrame),
    CallAnswer(CallFrame),
    CallCandidate(CallFrame),
    CallEvent(CallFrame),
}

/// Binds an intent to its destination and serializes the payload.
pub fn encode_outbound(intent: &OutboundIntent) -> Result<WireFrame, serde_json::Error> {
    let (destination, body) = match intent {
        OutboundIntent::SendChat(frame) => (SEND_CHAT, serde_json::to_value(frame)?),
        OutboundIntent::SendGroupMessage(frame) => {
            (SEND_GROUP_MESSAGE, serde_json::to_value(frame)?)
        }
        OutboundIntent::CallOffer(frame) => (CALL_OFFER, serde_json::to_value(frame)?),
        OutboundIntent::CallAnswer(frame) => (CALL_ANSWER, serde_json::to_value(frame)?),
        OutboundIntent::CallCandidate(frame) => (CALL_CANDIDATE, serde_json::to_value(frame)?),
        OutboundIntent::CallEvent(frame) => (CALL_EVENT, serde_json::to_value(frame)?),
    };
    Ok(WireFrame {
        topic: destination.to_string(),
        body,
    })
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod tests;
