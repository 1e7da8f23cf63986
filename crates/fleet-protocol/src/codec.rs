//! JSON text codec for protocol messages

use crate::error::ProtocolError;
use crate::message::Message;

/// Maximum size of a single encoded message (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Largest frame the WebSocket layer will buffer (16 MiB)
///
/// Frames between [`MAX_MESSAGE_SIZE`] and this bound reach [`decode`] and are
/// dropped as protocol errors. Only frames past it fail the connection.
pub const MAX_FRAME_SIZE: usize = 16 * MAX_MESSAGE_SIZE;

/// Encode a message as a JSON text frame
pub fn encode(message: &Message) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(message)?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(text)
}

/// Decode a JSON text frame into a message
pub fn decode(text: &str) -> Result<Message, ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_json::from_str(text)?)
}

/// Decode a binary frame, which must hold UTF-8 JSON
pub fn decode_bytes(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidEncoding)?;
    decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentId;

    #[test]
    fn test_codec_pong() {
        let msg = Message::Pong {
            agent_id: AgentId::new("A1"),
        };
        let text = encode(&msg).unwrap();
        assert_eq!(decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_decode_unknown_type() {
        let result = decode(r#"{"type":"reboot_now"}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_not_json() {
        assert!(matches!(decode("hello"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_oversized() {
        let text = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            decode(&text),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_oversized_reports_size() {
        let msg = Message::Command(crate::message::CommandRequest {
            command_id: crate::ids::CommandId::new("c1"),
            command: serde_json::Value::String("x".repeat(MAX_MESSAGE_SIZE)),
        });
        match encode(&msg) {
            Err(ProtocolError::MessageTooLarge { size, max }) => {
                assert!(size > MAX_MESSAGE_SIZE);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("expected MessageTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_bytes_rejects_invalid_utf8() {
        assert!(matches!(
            decode_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::InvalidEncoding)
        ));
        assert_eq!(decode_bytes(br#"{"type":"ping"}"#).unwrap(), Message::Ping);
    }
}
