//! Error types for the wearable proxy protocol.

use std::time::Duration;

use thiserror::Error;

use crate::types::PacketType;

/// Codec errors.
///
/// [`ProtocolError::IncompleteFrame`] only means "wait for more bytes";
/// every other decode error means the stream is out of sync.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not enough bytes are available yet.
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Tag byte does not name any packet.
    #[error("Unknown packet type: 0x{0:02X}")]
    UnknownPacketType(u8),

    /// Packet is valid but travels in the other direction.
    #[error("Unexpected {0:?} packet for this direction")]
    UnexpectedDirection(PacketType),

    /// Payload fields could not be decoded.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Payload is longer than its fields.
    #[error("{packet:?} payload has {extra} trailing bytes")]
    TrailingBytes { packet: PacketType, extra: usize },

    /// Payload does not fit the length field.
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    /// Destination buffer cannot hold the encoded frame.
    #[error("Buffer full: need {needed} bytes, {available} available")]
    BufferFull { needed: usize, available: usize },
}

impl ProtocolError {
    /// Returns true if more bytes could complete the frame.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::IncompleteFrame { .. })
    }

    /// Returns true if the stream can no longer be framed.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownPacketType(_)
                | ProtocolError::UnexpectedDirection(_)
                | ProtocolError::InvalidPayload(_)
                | ProtocolError::TrailingBytes { .. }
        )
    }
}

/// Server-side errors. None of them stop the server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Reading from or writing to the client failed.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A write did not complete within the network timeout.
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Receive buffer filled up without a decodable frame.
    #[error("Receive buffer exhausted ({capacity} bytes)")]
    BufferExhausted { capacity: usize },

    /// The device provider reported a failure.
    #[error("Device operation failed: {0}")]
    DeviceOperationFailed(String),

    /// A reply could not be encoded.
    #[error("Failed to encode packet: {0}")]
    Encode(#[from] ProtocolError),
}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        ServerError::ConnectionLost(value.to_string())
    }
}
