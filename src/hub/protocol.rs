//! Hub JSON protocol.
//!
//! Wire format: UTF-8 JSON records, each terminated by the record separator
//! `0x1E`. A transport chunk may carry several records or a partial one.
//! The first exchange is the handshake:
//!
//! ```text
//! client: {"protocol":"json","version":1}<RS>
//! server: {}<RS>                     (or {"error":"..."}<RS>)
//! ```
//!
//! After that every record is a message with a numeric `type`.

use crate::error::{ChannelError, Result};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record separator terminating every JSON record
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Protocol name sent in the handshake
pub const PROTOCOL_NAME: &str = "json";

/// Protocol version sent in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of one buffered record (1MB)
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
    Ack = 8,
    Sequence = 9,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Invocation),
            2 => Some(Self::StreamItem),
            3 => Some(Self::Completion),
            4 => Some(Self::StreamInvocation),
            5 => Some(Self::CancelInvocation),
            6 => Some(Self::Ping),
            7 => Some(Self::Close),
            8 => Some(Self::Ack),
            9 => Some(Self::Sequence),
            _ => None,
        }
    }
}

/// Decoded hub message
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Valid message the client has no use for (stream items, acks, ...)
    Ignored(MessageType),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingInvocation<'a> {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    invocation_id: Option<&'a str>,
    target: &'a str,
    arguments: &'a [Value],
}

#[derive(Serialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

impl HubMessage {
    /// Decode one record (without its separator)
    pub fn decode(record: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(record)
            .map_err(|e| ChannelError::Protocol(format!("Invalid hub message: {}", e)))?;
        let kind = MessageType::from_u8(raw.kind)
            .ok_or_else(|| ChannelError::Protocol(format!("Unknown message type {}", raw.kind)))?;

        match kind {
            MessageType::Invocation => {
                let target = raw.target.ok_or_else(|| {
                    ChannelError::Protocol("Invocation without target".to_string())
                })?;
                Ok(HubMessage::Invocation {
                    invocation_id: raw.invocation_id,
                    target,
                    arguments: raw.arguments,
                })
            }
            MessageType::Completion => {
                let invocation_id = raw.invocation_id.ok_or_else(|| {
                    ChannelError::Protocol("Completion without invocationId".to_string())
                })?;
                Ok(HubMessage::Completion {
                    invocation_id,
                    result: raw.result,
                    error: raw.error,
                })
            }
            MessageType::Ping => Ok(HubMessage::Ping),
            MessageType::Close => Ok(HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect,
            }),
            other => Ok(HubMessage::Ignored(other)),
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

fn terminate(mut json: String) -> String {
    json.push(RECORD_SEPARATOR as char);
    json
}

/// `{"protocol":"json","version":1}<RS>`
pub fn encode_handshake() -> String {
    let request = HandshakeRequest {
        protocol: PROTOCOL_NAME,
        version: PROTOCOL_VERSION,
    };
    // Serializing two plain fields cannot fail
    terminate(serde_json::to_string(&request).unwrap_or_default())
}

/// Non-blocking invocation (no invocation id, no completion expected)
pub fn encode_invocation(target: &str, arguments: &[Value]) -> Result<String> {
    let message = OutgoingInvocation {
        kind: MessageType::Invocation as u8,
        invocation_id: None,
        target,
        arguments,
    };
    Ok(terminate(serde_json::to_string(&message)?))
}

/// `{"type":6}<RS>`
pub fn encode_ping() -> String {
    terminate(format!("{{\"type\":{}}}", MessageType::Ping as u8))
}

/// Validate the server's handshake response record
pub fn parse_handshake_response(record: &str) -> Result<()> {
    let response: HandshakeResponse = serde_json::from_str(record)
        .map_err(|e| ChannelError::Handshake(format!("Malformed handshake response: {}", e)))?;
    match response.error {
        Some(error) => Err(ChannelError::Handshake(error)),
        None => Ok(()),
    }
}

// =============================================================================
// Record framing
// =============================================================================

/// Accumulates transport chunks and yields complete records.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    buf: BytesMut,
    /// Bytes already searched for a separator
    scanned: usize,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete record, if one is buffered.
    ///
    /// Fails when a record exceeds [`MAX_RECORD_SIZE`], whether or not its
    /// separator has arrived, or is not valid UTF-8. An oversized record is
    /// discarded.
    pub fn next_record(&mut self) -> Result<Option<String>> {
        let found = self.buf[self.scanned..]
            .iter()
            .position(|b| *b == RECORD_SEPARATOR)
            .map(|offset| self.scanned + offset);

        match found {
            Some(end) => {
                self.scanned = 0;
                let record = self.buf.split_to(end);
                self.buf.advance(1);
                if end > MAX_RECORD_SIZE {
                    return Err(oversized(end));
                }
                let text = String::from_utf8(record.to_vec())
                    .map_err(|_| ChannelError::Protocol("Record is not valid UTF-8".to_string()))?;
                Ok(Some(text))
            }
            None if self.buf.len() > MAX_RECORD_SIZE => {
                let len = self.buf.len();
                self.buf.clear();
                self.scanned = 0;
                Err(oversized(len))
            }
            None => {
                self.scanned = self.buf.len();
                Ok(None)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

fn oversized(len: usize) -> ChannelError {
    ChannelError::Protocol(format!(
        "Record size {} exceeds maximum allowed size {}",
        len, MAX_RECORD_SIZE
    ))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_encoding() {
        let hs = encode_handshake();
        assert!(hs.ends_with('\u{1e}'));
        let value: Value = serde_json::from_str(hs.trim_end_matches('\u{1e}')).unwrap();
        assert_eq!(value, json!({"protocol": "json", "version": 1}));
    }

    #[test]
    fn test_handshake_response() {
        assert!(parse_handshake_response("{}").is_ok());
        let err = parse_handshake_response(r#"{"error":"Requested protocol 'json' is not available."}"#)
            .unwrap_err();
        assert!(matches!(err, ChannelError::Handshake(msg) if msg.contains("not available")));
        assert!(parse_handshake_response("nope").is_err());
    }

    #[test]
    fn test_decode_invocation() {
        let record = r#"{"type":1,"target":"ReceiveNotification","arguments":[{"title":"t"}]}"#;
        match HubMessage::decode(record).unwrap() {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                assert_eq!(invocation_id, None);
                assert_eq!(target, "ReceiveNotification");
                assert_eq!(arguments, vec![json!({"title": "t"})]);
            }
            other => panic!("Expected Invocation, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_control_messages() {
        assert_eq!(HubMessage::decode(r#"{"type":6}"#).unwrap(), HubMessage::Ping);
        assert_eq!(
            HubMessage::decode(r#"{"type":7,"error":"shutdown","allowReconnect":true}"#).unwrap(),
            HubMessage::Close {
                error: Some("shutdown".to_string()),
                allow_reconnect: true
            }
        );
        assert_eq!(
            HubMessage::decode(r#"{"type":7}"#).unwrap(),
            HubMessage::Close {
                error: None,
                allow_reconnect: false
            }
        );
        assert_eq!(
            HubMessage::decode(r#"{"type":2,"invocationId":"1","item":3}"#).unwrap(),
            HubMessage::Ignored(MessageType::StreamItem)
        );
    }

    #[test]
    fn test_decode_rejects_invalid() {
        assert!(HubMessage::decode(r#"{"type":42}"#).is_err());
        assert!(HubMessage::decode(r#"{"type":1,"arguments":[]}"#).is_err());
        assert!(HubMessage::decode(r#"{"type":3}"#).is_err());
        assert!(HubMessage::decode("[]").is_err());
    }

    #[test]
    fn test_encode_invocation() {
        let frame = encode_invocation("SendTestNotification", &[]).unwrap();
        let value: Value = serde_json::from_str(frame.trim_end_matches('\u{1e}')).unwrap();
        assert_eq!(
            value,
            json!({"type": 1, "target": "SendTestNotification", "arguments": []})
        );
        assert_eq!(encode_ping(), "{\"type\":6}\u{1e}");
    }

    #[test]
    fn test_record_buffer_partial_chunks() {
        let mut buffer = RecordBuffer::new();
        buffer.extend(b"{\"type\":");
        assert_eq!(buffer.next_record().unwrap(), None);

        buffer.extend(b"6}\x1e{\"type\":7}\x1e{\"ty");
        assert_eq!(buffer.next_record().unwrap().as_deref(), Some("{\"type\":6}"));
        assert_eq!(buffer.next_record().unwrap().as_deref(), Some("{\"type\":7}"));
        assert_eq!(buffer.next_record().unwrap(), None);
        assert_eq!(buffer.len(), 5);

        buffer.extend(b"pe\":6}\x1e");
        assert_eq!(buffer.next_record().unwrap().as_deref(), Some("{\"type\":6}"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_record_buffer_size_limit() {
        let mut buffer = RecordBuffer::new();
        buffer.extend(&vec![b'a'; MAX_RECORD_SIZE + 1]);
        assert!(buffer.next_record().is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_record_buffer_rejects_complete_oversized_record() {
        let mut buffer = RecordBuffer::new();
        let mut chunk = vec![b'a'; MAX_RECORD_SIZE + 1];
        chunk.push(RECORD_SEPARATOR);
        chunk.extend_from_slice(b"{\"type\":6}\x1e");
        buffer.extend(&chunk);

        assert!(buffer.next_record().is_err());
        assert_eq!(buffer.next_record().unwrap().as_deref(), Some("{\"type\":6}"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_record_buffer_resumes_scan_across_chunks() {
        let mut buffer = RecordBuffer::new();
        buffer.extend(b"{\"type\"");
        assert_eq!(buffer.next_record().unwrap(), None);
        buffer.extend(b":6");
        assert_eq!(buffer.next_record().unwrap(), None);
        buffer.extend(b"}\x1e{\"type\":7}\x1e");
        assert_eq!(buffer.next_record().unwrap().as_deref(), Some("{\"type\":6}"));
        assert_eq!(buffer.next_record().unwrap().as_deref(), Some("{\"type\":7}"));
        assert_eq!(buffer.next_record().unwrap(), None);
    }
}
