//! Replication wire protocol.
//!
//! ```text
//! [1 byte  message type]          0 = ConnectionAccepted, 1 = ClientDetails, 2 = DataPayload
//! [32 bytes type tag]             NUL-padded UTF-8 origin type name (ClientDetails / DataPayload)
//! [variable-length UTF-8 text]    JSON snapshot, at most 1024 bytes
//! ```
//!
//! `ConnectionAccepted` carries only a 2-byte little-endian client id after
//! the type byte.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Width of the fixed-length type tag.
pub const TYPE_TAG_LEN: usize = 32;

/// Largest encoded snapshot text a message may carry.
pub const MAX_PAYLOAD_TEXT: usize = 1024;

/// Leading byte of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Host → peer: your client id.
    ConnectionAccepted = 0,
    /// Identity announcement or roster forward.
    ClientDetails = 1,
    /// Entity change request.
    DataPayload = 2,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(Self::ConnectionAccepted),
            1 => Ok(Self::ClientDetails),
            2 => Ok(Self::DataPayload),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Identity assignment from the host.
    ConnectionAccepted {
        /// Assigned client id.
        client_id: u16,
    },
    /// A client's `{id, name}` record.
    ClientDetails {
        /// Origin type name.
        tag: String,
        /// Encoded client.
        text: String,
    },
    /// An entity change request.
    DataPayload {
        /// Origin type name (the record's type).
        tag: String,
        /// Encoded change envelope.
        text: String,
    },
}

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Zero-length buffer.
    #[error("empty message")]
    Empty,

    /// Leading byte names no known message.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Buffer ends before the fixed-size header does.
    #[error("truncated message: need {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes present.
        actual: usize,
    },

    /// Type name does not fit the fixed tag.
    #[error("type tag is {0} bytes, limit is {TYPE_TAG_LEN}")]
    TagTooLong(usize),

    /// Snapshot text exceeds [`MAX_PAYLOAD_TEXT`].
    #[error("payload text is {size} bytes, limit is {max}")]
    PayloadTooLarge {
        /// Encoded size.
        size: usize,
        /// Limit.
        max: usize,
    },

    /// Tag or text is not valid UTF-8.
    #[error("invalid UTF-8 in message")]
    InvalidUtf8,

    /// The message has no snapshot text.
    #[error("{0:?} carries no snapshot text")]
    NoText(MessageType),

    /// The snapshot codec failed.
    #[error("snapshot codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl WireMessage {
    /// Message type byte for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectionAccepted { .. } => MessageType::ConnectionAccepted,
            Self::ClientDetails { .. } => MessageType::ClientDetails,
            Self::DataPayload { .. } => MessageType::DataPayload,
        }
    }

    /// Build a `ClientDetails` message from any serializable client record.
    pub fn client_details<T: Serialize>(tag: &str, value: &T) -> Result<Self, ProtocolError> {
        let (tag, text) = encode_snapshot(tag, value)?;
        Ok(Self::ClientDetails { tag, text })
    }

    /// Build a `DataPayload` message from any serializable snapshot.
    pub fn data_payload<T: Serialize>(tag: &str, value: &T) -> Result<Self, ProtocolError> {
        let (tag, text) = encode_snapshot(tag, value)?;
        Ok(Self::DataPayload { tag, text })
    }

    /// Origin type tag, when the message has one.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::ConnectionAccepted { .. } => None,
            Self::ClientDetails { tag, .. } | Self::DataPayload { tag, .. } => Some(tag),
        }
    }

    /// Decode the snapshot text.
    pub fn parse_text<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        match self {
            Self::ConnectionAccepted { .. } => Err(ProtocolError::NoText(self.message_type())),
            Self::ClientDetails { text, .. } | Self::DataPayload { text, .. } => {
                Ok(serde_json::from_str(text)?)
            }
        }
    }
}

fn encode_snapshot<T: Serialize>(tag: &str, value: &T) -> Result<(String, String), ProtocolError> {
    check_tag(tag)?;
    let text = serde_json::to_string(value)?;
    check_text(&text)?;
    Ok((tag.to_string(), text))
}

fn check_tag(tag: &str) -> Result<(), ProtocolError> {
    if tag.len() > TYPE_TAG_LEN {
        return Err(ProtocolError::TagTooLong(tag.len()));
    }
    Ok(())
}

fn check_text(text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_PAYLOAD_TEXT {
        return Err(ProtocolError::PayloadTooLarge {
            size: text.len(),
            max: MAX_PAYLOAD_TEXT,
        });
    }
    Ok(())
}

/// Serialize a message into its wire bytes.
pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, ProtocolError> {
    match msg {
        WireMessage::ConnectionAccepted { client_id } => {
            let mut out = Vec::with_capacity(3);
            out.push(MessageType::ConnectionAccepted as u8);
            out.extend_from_slice(&client_id.to_le_bytes());
            Ok(out)
        }
        WireMessage::ClientDetails { tag, text } | WireMessage::DataPayload { tag, text } => {
            check_tag(tag)?;
            check_text(text)?;
            let mut out = Vec::with_capacity(1 + TYPE_TAG_LEN + text.len());
            out.push(msg.message_type() as u8);
            let mut tag_bytes = [0u8; TYPE_TAG_LEN];
            tag_bytes[..tag.len()].copy_from_slice(tag.as_bytes());
            out.extend_from_slice(&tag_bytes);
            out.extend_from_slice(text.as_bytes());
            Ok(out)
        }
    }
}

/// Parse wire bytes into a message.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, ProtocolError> {
    let (&first, rest) = bytes.split_first().ok_or(ProtocolError::Empty)?;
    let message_type = MessageType::try_from(first)?;

    if message_type == MessageType::ConnectionAccepted {
        if rest.len() < 2 {
            return Err(ProtocolError::Truncated {
                expected: 3,
                actual: bytes.len(),
            });
        }
        return Ok(WireMessage::ConnectionAccepted {
            client_id: u16::from_le_bytes([rest[0], rest[1]]),
        });
    }

    if rest.len() < TYPE_TAG_LEN {
        return Err(ProtocolError::Truncated {
            expected: 1 + TYPE_TAG_LEN,
            actual: bytes.len(),
        });
    }
    let (tag_bytes, text_bytes) = rest.split_at(TYPE_TAG_LEN);
    let tag_end = tag_bytes.iter().position(|&b| b == 0).unwrap_or(TYPE_TAG_LEN);
    let tag = std::str::from_utf8(&tag_bytes[..tag_end])
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_string();
    let text = std::str::from_utf8(text_bytes)
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_string();
    check_text(&text)?;

    Ok(match message_type {
        MessageType::ClientDetails => WireMessage::ClientDetails { tag, text },
        _ => WireMessage::DataPayload { tag, text },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Probe {
        id: u16,
        name: String,
    }

    #[test]
    fn test_connection_accepted_layout() {
        let bytes = encode(&WireMessage::ConnectionAccepted { client_id: 14 }).unwrap();
        assert_eq!(bytes, vec![0, 14, 0]);
        assert_eq!(
            decode(&bytes).unwrap(),
            WireMessage::ConnectionAccepted { client_id: 14 }
        );
    }

    #[test]
    fn test_details_layout_has_padded_tag() {
        let probe = Probe {
            id: 14,
            name: "Nova".to_string(),
        };
        let msg = WireMessage::client_details("Client", &probe).unwrap();
        let bytes = encode(&msg).unwrap();

        assert_eq!(bytes[0], MessageType::ClientDetails as u8);
        assert_eq!(&bytes[1..7], b"Client");
        assert!(bytes[7..1 + TYPE_TAG_LEN].iter().all(|&b| b == 0));
        assert_eq!(&bytes[1 + TYPE_TAG_LEN..], br#"{"id":14,"name":"Nova"}"#);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.tag(), Some("Client"));
        assert_eq!(decoded.parse_text::<Probe>().unwrap(), probe);
    }

    #[test]
    fn test_oversized_text_is_rejected() {
        let probe = Probe {
            id: 1,
            name: "x".repeat(MAX_PAYLOAD_TEXT),
        };
        let result = WireMessage::data_payload("Probe", &probe);
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { max: MAX_PAYLOAD_TEXT, .. })
        ));
    }

    #[test]
    fn test_long_tag_is_rejected() {
        let result = WireMessage::data_payload(&"T".repeat(TYPE_TAG_LEN + 1), &1u8);
        assert!(matches!(result, Err(ProtocolError::TagTooLong(33))));
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(decode(&[]), Err(ProtocolError::Empty)));
        assert!(matches!(decode(&[7]), Err(ProtocolError::UnknownMessageType(7))));
        assert!(matches!(decode(&[0, 1]), Err(ProtocolError::Truncated { .. })));
        assert!(matches!(decode(&[2, b'a']), Err(ProtocolError::Truncated { .. })));

        let mut bad_text = vec![2u8];
        bad_text.extend_from_slice(&[0u8; TYPE_TAG_LEN]);
        bad_text.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(decode(&bad_text), Err(ProtocolError::InvalidUtf8)));
    }

    #[test]
    fn test_accepted_has_no_text() {
        let msg = WireMessage::ConnectionAccepted { client_id: 1 };
        assert!(matches!(
            msg.parse_text::<Probe>(),
            Err(ProtocolError::NoText(MessageType::ConnectionAccepted))
        ));
    }
}
