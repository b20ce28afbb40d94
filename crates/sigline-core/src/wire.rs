//! Framing for the signaling channel: inbound event frames and the
//! acknowledgment written back for each of them.

use serde::Serialize;
use serde_json::Value;

use crate::errors::SignalError;

/// An inbound event waiting for the next batching tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    /// The whole decoded frame.
    pub payload: Value,
    /// `data.eventType`, when the frame carries one.
    pub event_type: Option<String>,
}

impl PendingMessage {
    pub fn is_call_event(&self, prefix: &str) -> bool {
        self.event_type
            .as_deref()
            .is_some_and(|event_type| event_type.starts_with(prefix))
    }
}

/// `{"type":"ack","messageId":"..."}`. Field names are fixed by the backend.
#[derive(Debug, Serialize)]
pub struct AckFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "messageId")]
    message_id: &'a str,
}

impl<'a> AckFrame<'a> {
    pub fn new(message_id: &'a str) -> Self {
        Self {
            kind: "ack",
            message_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SignalError> {
        serde_json::to_vec(self).map_err(|e| SignalError::MalformedEvent(e.to_string()))
    }
}

/// Decode a binary frame into its message id and the pending message.
///
/// A frame that is not JSON or lacks a string `id` cannot be acknowledged
/// and is rejected as a whole.
pub fn decode_frame(bytes: &[u8]) -> Result<(String, PendingMessage), SignalError> {
    let payload: Value =
        serde_json::from_slice(bytes).map_err(|e| SignalError::MalformedEvent(e.to_string()))?;
    let id = payload["id"]
        .as_str()
        .ok_or_else(|| SignalError::MalformedEvent("frame has no string id".into()))?
        .to_string();
    let event_type = payload["data"]["eventType"].as_str().map(str::to_string);
    Ok((id, PendingMessage { payload, event_type }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ack_frame_field_names_are_exact() {
        let bytes = AckFrame::new("msg-42").encode().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"type":"ack","messageId":"msg-42"}"#
        );
    }

    #[test]
    fn decode_extracts_id_and_event_type() {
        let frame = json!({
            "id": "abc",
            "data": { "eventType": "locus.participant_joined", "locus": {} }
        });
        let (id, message) = decode_frame(frame.to_string().as_bytes()).unwrap();
        assert_eq!(id, "abc");
        assert_eq!(message.event_type.as_deref(), Some("locus.participant_joined"));
        assert!(message.is_call_event("locus"));
        assert_eq!(message.payload["data"]["locus"], json!({}));
    }

    #[test]
    fn decode_accepts_frames_without_event_type() {
        let (id, message) = decode_frame(br#"{"id":"x","data":{}}"#).unwrap();
        assert_eq!(id, "x");
        assert!(message.event_type.is_none());
        assert!(!message.is_call_event("locus"));
    }

    #[test]
    fn decode_rejects_garbage_and_missing_id() {
        assert!(matches!(
            decode_frame(b"\x00\x01not json"),
            Err(SignalError::MalformedEvent(_))
        ));
        assert!(matches!(
            decode_frame(br#"{"data":{"eventType":"locus.x"}}"#),
            Err(SignalError::MalformedEvent(_))
        ));
        assert!(matches!(
            decode_frame(br#"{"id":17}"#),
            Err(SignalError::MalformedEvent(_))
        ));
    }

    #[test]
    fn other_prefixes_are_not_call_events() {
        let (_, message) =
            decode_frame(br#"{"id":"1","data":{"eventType":"conversation.activity"}}"#).unwrap();
        assert!(!message.is_call_event("locus"));
    }
}
