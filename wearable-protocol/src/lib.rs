//! Wire protocol for the wearable sensor proxy.
//!
//! This crate defines the binary protocol spoken between the proxy server,
//! which owns the wearable device, and a remote client that drives it.
//!
//! # Frame Format
//!
//! ```text
//! +--------+-----------+------------------+
//! | Tag    | Length    |     Payload      |
//! | u8     | u16 LE    |    (variable)    |
//! +--------+-----------+------------------+
//! | 1 byte | 2 bytes   |  Length bytes    |
//! ```
//!
//! Client-to-server tags are `0x01..=0x0A`; server-to-client tags have the
//! high bit set. The stream carries no other framing, so a bad tag means the
//! reader has lost sync.
//!
//! # Example
//!
//! ```rust
//! use wearable_protocol::{decode_inbound, encode, Packet};
//!
//! let mut buf = [0u8; 64];
//! let mut cursor = 0;
//! encode(&Packet::SetRssiFilter(-60), &mut buf, &mut cursor).unwrap();
//! encode(&Packet::Ping, &mut buf, &mut cursor).unwrap();
//!
//! let (first, consumed) = decode_inbound(&buf[..cursor]).unwrap();
//! assert_eq!(first, Packet::SetRssiFilter(-60));
//! let (second, _) = decode_inbound(&buf[consumed..cursor]).unwrap();
//! assert_eq!(second, Packet::Ping);
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    decode, decode_header, decode_inbound, decode_outbound, encode, encode_packet, encoded_len,
    FrameHeader,
};
pub use error::{ProtocolError, ServerError};
pub use types::{
    ConnectionState, Device, DeviceConfig, GestureId, Packet, PacketType, ProductId,
    SensorAccuracy, SensorFrame, SensorQuaternion, SensorVector, HEADER_SIZE, MAX_PAYLOAD_SIZE,
    SENSOR_FRAME_PACKET_SIZE, SENSOR_FRAME_PAYLOAD_SIZE,
};
