// Message framing shared by the platform pipe implementations.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Delimiter terminating every message in both directions.
pub const DELIMITER: u8 = b'\n';

/// Transport result for a complete message.
pub const RESULT_OK: i32 = 0;

/// Transport result for a message truncated to the buffer capacity
/// (mirrors Win32 `ERROR_MORE_DATA`).
pub const RESULT_MORE_DATA: i32 = 234;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to create channel '{name}': {source}")]
    ChannelCreation {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Waiting for peer failed: {0}")]
    Accept(#[source] std::io::Error),
    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("Read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("Peer disconnected")]
    PeerDisconnected,
    #[error("No peer has connected to the channel")]
    NotAccepted,
    #[error("Channel is closed")]
    Closed,
}

impl TransportError {
    /// True for failures caused by the peer going away mid-exchange.
    pub fn is_peer_loss(&self) -> bool {
        matches!(
            self,
            TransportError::Write(_) | TransportError::Read(_) | TransportError::PeerDisconnected
        )
    }
}

/// One message read from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// `RESULT_OK` or `RESULT_MORE_DATA`.
    pub result_code: i32,
    /// Raw bytes, delimiter included when one was received.
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_complete(&self) -> bool {
        self.result_code == RESULT_OK
    }

    /// Decode the payload as UTF-8 and strip trailing whitespace.
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        let text = String::from_utf8(self.payload.clone())?;
        Ok(text.trim_end().to_string())
    }
}

/// Encode a text message with its trailing delimiter.
pub fn encode_message(message: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(message.len() + 1);
    bytes.extend_from_slice(message.as_bytes());
    bytes.push(DELIMITER);
    bytes
}

/// Write one delimited message and flush it.
pub(crate) async fn write_frame<W>(writer: &mut W, message: &str) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(message);
    writer.write_all(&bytes).await.map_err(TransportError::Write)?;
    writer.flush().await.map_err(TransportError::Write)?;
    Ok(())
}

/// Read until one delimited message is available.
///
/// Bytes after the delimiter stay in `pending` for the next call. A message
/// longer than `capacity` is returned truncated with `RESULT_MORE_DATA`.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    pending: &mut Vec<u8>,
    capacity: usize,
) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let capacity = capacity.max(1);
    let mut chunk = vec![0u8; capacity];

    loop {
        match pending.iter().position(|b| *b == DELIMITER) {
            Some(pos) if pos < capacity => {
                let payload: Vec<u8> = pending.drain(..=pos).collect();
                return Ok(Frame {
                    result_code: RESULT_OK,
                    payload,
                });
            }
            _ => {}
        }

        if pending.len() >= capacity {
            let payload: Vec<u8> = pending.drain(..capacity).collect();
            return Ok(Frame {
                result_code: RESULT_MORE_DATA,
                payload,
            });
        }

        let read = reader.read(&mut chunk).await.map_err(TransportError::Read)?;
        if read == 0 {
            if pending.is_empty() {
                return Err(TransportError::PeerDisconnected);
            }
            // Peer closed after an undelimited final message.
            return Ok(Frame {
                result_code: RESULT_OK,
                payload: std::mem::take(pending),
            });
        }

        pending.extend_from_slice(&chunk[..read]);
    }
}
