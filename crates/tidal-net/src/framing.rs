//! Length-prefixed framing for stream transports.
//!
//! Every frame on the wire is:
//!
//! ```text
//! +-------------------+-----------+--------------------+
//! | length (4 bytes)  | channel   |   payload          |
//! | u32 little-endian | (1 byte)  |   (length bytes)   |
//! +-------------------+-----------+--------------------+
//! ```
//!
//! The length counts payload bytes only. The channel byte carries the
//! [`DeliveryMode`] the sender asked for, so the receiving side can report it.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::transport::DeliveryMode;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 4 KiB, comfortably
    /// above the largest replication message.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 4096,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel the payload was sent on.
    pub mode: DeliveryMode,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The channel byte names no known delivery mode.
    #[error("unknown channel {0}")]
    UnknownChannel(u8),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read a single frame from the stream.
///
/// Returns [`FrameError::ConnectionClosed`] if the peer closes the connection
/// before the frame is complete.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Frame, FrameError> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await.map_err(eof_as_closed)?;

    let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }
    let mode = DeliveryMode::from_channel(header[4]).ok_or(FrameError::UnknownChannel(header[4]))?;

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    }

    Ok(Frame { mode, payload })
}

/// Write a single frame to the stream and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = frame.payload.len() as u32;
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    let mut header = [0u8; 5];
    header[..4].copy_from_slice(&len.to_le_bytes());
    header[4] = frame.mode.channel();

    writer.write_all(&header).await?;
    if !frame.payload.is_empty() {
        writer.write_all(&frame.payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn reliable(payload: &[u8]) -> Frame {
        Frame {
            mode: DeliveryMode::ReliableOrdered,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_frames_keep_order_and_channel() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();
        let sequenced = Frame {
            mode: DeliveryMode::Sequenced,
            payload: b"state".to_vec(),
        };

        write_frame(&mut client, &reliable(b"hello"), &config).await.unwrap();
        write_frame(&mut client, &sequenced, &config).await.unwrap();

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), reliable(b"hello"));
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), sequenced);
    }

    #[tokio::test]
    async fn test_partial_read_resumes_correctly() {
        let (mut client, mut server) = duplex(8);
        let config = FrameConfig::default();
        let frame = reliable(b"this message is larger than the buffer");

        let expected = frame.clone();
        let write_config = config.clone();
        let write_task = tokio::spawn(async move {
            write_frame(&mut client, &frame, &write_config).await.unwrap();
        });

        let received = read_frame(&mut server, &config).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_both_ways() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        let result = write_frame(&mut client, &reliable(&[0u8; 64]), &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));

        client.write_all(&1024u32.to_le_bytes()).await.unwrap();
        client.write_all(&[0]).await.unwrap();
        client.flush().await.unwrap();
        let result = read_frame(&mut server, &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { size: 1024, max: 16 })));
    }

    #[tokio::test]
    async fn test_unknown_channel_rejected() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&0u32.to_le_bytes()).await.unwrap();
        client.write_all(&[9]).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::UnknownChannel(9))));
    }

    #[tokio::test]
    async fn test_zero_length_frame_handled() {
        let (mut client, mut server) = duplex(64);
        let config = FrameConfig::default();
        write_frame(&mut client, &reliable(&[]), &config).await.unwrap();
        assert!(read_frame(&mut server, &config).await.unwrap().payload.is_empty());
    }

    #[tokio::test]
    async fn test_connection_closed_during_header_read() {
        let (client, mut server) = duplex(64);
        drop(client);
        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }
}
