//! Codec for encoding and decoding protocol packets.
//!
//! Frame format:
//! ```text
//! +--------+-----------+------------------+
//! | Tag    | Length    |     Payload      |
//! | u8     | u16 LE    |    (variable)    |
//! +--------+-----------+------------------+
//! | 1 byte | 2 bytes   |  Length bytes    |
//! ```
//!
//! Encoding writes straight into a caller-owned buffer at a cursor so the
//! server can reuse one transmit buffer for its whole lifetime. Decoding
//! reads from a slice that ends at the last received byte and never looks
//! past it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// Frame header information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub packet_type: PacketType,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Header plus payload.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len
    }
}

/// Number of bytes `packet` occupies on the wire, header included.
pub fn encoded_len(packet: &Packet) -> usize {
    HEADER_SIZE + payload_len(packet)
}

fn payload_len(packet: &Packet) -> usize {
    match packet {
        Packet::KeepAlive
        | Packet::DisconnectFromDevice
        | Packet::StartSearch
        | Packet::StopSearch
        | Packet::QueryConnectionStatus
        | Packet::QueryConfigStatus
        | Packet::Ping
        | Packet::PingResponse => 0,
        Packet::SetConfig(config) | Packet::ConfigStatus(config) => 2 + config.len(),
        Packet::ConnectToDevice { uid } => 2 + uid.len(),
        Packet::SetRssiFilter(_) => 4,
        Packet::ConnectionStatus { device, .. } => 1 + device_len(device),
        Packet::DeviceList(devices) => 2 + devices.iter().map(device_len).sum::<usize>(),
        Packet::SensorFrame(_) => SENSOR_FRAME_PAYLOAD_SIZE,
    }
}

fn device_len(device: &Device) -> usize {
    2 + device.uid.len() + 2 + device.name.len() + 2
}

/// Encode `packet` into `buf` at `cursor`, advancing the cursor.
///
/// Returns the number of bytes written. On error nothing is written and the
/// cursor is left where it was.
pub fn encode(packet: &Packet, buf: &mut [u8], cursor: &mut usize) -> Result<usize, ProtocolError> {
    let payload_len = payload_len(packet);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
    }

    let frame_len = HEADER_SIZE + payload_len;
    let available = buf.len().saturating_sub(*cursor);
    if frame_len > available {
        return Err(ProtocolError::BufferFull {
            needed: frame_len,
            available,
        });
    }

    let mut out = &mut buf[*cursor..*cursor + frame_len];
    out.put_u8(packet.packet_type().into());
    out.put_u16_le(payload_len as u16);
    encode_payload(&mut out, packet);
    debug_assert!(out.is_empty());

    *cursor += frame_len;
    Ok(frame_len)
}

/// Encode a packet into a freshly allocated frame.
pub fn encode_packet(packet: &Packet) -> Result<Bytes, ProtocolError> {
    let mut frame = BytesMut::zeroed(encoded_len(packet));
    let mut cursor = 0;
    encode(packet, &mut frame, &mut cursor)?;
    Ok(frame.freeze())
}

fn encode_payload(buf: &mut impl BufMut, packet: &Packet) {
    match packet {
        Packet::KeepAlive
        | Packet::DisconnectFromDevice
        | Packet::StartSearch
        | Packet::StopSearch
        | Packet::QueryConnectionStatus
        | Packet::QueryConfigStatus
        | Packet::Ping
        | Packet::PingResponse => {
            // Empty payload
        }
        Packet::SetConfig(config) | Packet::ConfigStatus(config) => {
            encode_blob(buf, config.as_bytes());
        }
        Packet::ConnectToDevice { uid } => {
            encode_string(buf, uid);
        }
        Packet::SetRssiFilter(value) => {
            buf.put_i32_le(*value);
        }
        Packet::ConnectionStatus { state, device } => {
            buf.put_u8(*state as u8);
            encode_device(buf, device);
        }
        Packet::DeviceList(devices) => {
            buf.put_u16_le(devices.len() as u16);
            for device in devices {
                encode_device(buf, device);
            }
        }
        Packet::SensorFrame(frame) => {
            buf.put_f32_le(frame.timestamp);
            buf.put_f32_le(frame.delta_time);
            encode_vector(buf, &frame.acceleration);
            encode_vector(buf, &frame.angular_velocity);
            encode_quaternion(buf, &frame.rotation);
            buf.put_u8(frame.gesture.into());
        }
    }
}

fn encode_string(buf: &mut impl BufMut, s: &str) {
    encode_blob(buf, s.as_bytes());
}

fn encode_blob(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn encode_device(buf: &mut impl BufMut, device: &Device) {
    encode_string(buf, &device.uid);
    encode_string(buf, &device.name);
    buf.put_u16_le(device.product_id.into());
}

fn encode_vector(buf: &mut impl BufMut, v: &SensorVector) {
    buf.put_f32_le(v.x);
    buf.put_f32_le(v.y);
    buf.put_f32_le(v.z);
    buf.put_u8(v.accuracy.into());
}

fn encode_quaternion(buf: &mut impl BufMut, q: &SensorQuaternion) {
    buf.put_f32_le(q.x);
    buf.put_f32_le(q.y);
    buf.put_f32_le(q.z);
    buf.put_f32_le(q.w);
    buf.put_f32_le(q.measurement_uncertainty);
}

/// Try to decode a frame header from the buffer.
///
/// Returns `Ok(None)` if fewer than [`HEADER_SIZE`] bytes are available. An
/// unknown tag is reported as soon as the first byte is present.
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };
    let packet_type = PacketType::try_from(tag).map_err(ProtocolError::UnknownPacketType)?;

    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let payload_len = u16::from_le_bytes([buf[1], buf[2]]) as usize;

    Ok(Some(FrameHeader {
        packet_type,
        payload_len,
    }))
}

/// Decode one packet of either direction from the start of `buf`.
///
/// Returns the packet and the number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<(Packet, usize), ProtocolError> {
    decode_with(buf, |_| true)
}

/// Decode one client-to-server packet. Server-to-client tags are malformed
/// on this side of the connection.
pub fn decode_inbound(buf: &[u8]) -> Result<(Packet, usize), ProtocolError> {
    decode_with(buf, PacketType::is_inbound)
}

/// Decode one server-to-client packet.
pub fn decode_outbound(buf: &[u8]) -> Result<(Packet, usize), ProtocolError> {
    decode_with(buf, PacketType::is_outbound)
}

fn decode_with(
    buf: &[u8],
    accept: impl Fn(PacketType) -> bool,
) -> Result<(Packet, usize), ProtocolError> {
    if let Some(&tag) = buf.first() {
        let packet_type = PacketType::try_from(tag).map_err(ProtocolError::UnknownPacketType)?;
        if !accept(packet_type) {
            return Err(ProtocolError::UnexpectedDirection(packet_type));
        }
    }

    let header = decode_header(buf)?.ok_or(ProtocolError::IncompleteFrame {
        expected: HEADER_SIZE,
        actual: buf.len(),
    })?;

    let frame_len = header.frame_len();
    if buf.len() < frame_len {
        return Err(ProtocolError::IncompleteFrame {
            expected: frame_len,
            actual: buf.len(),
        });
    }

    let mut payload = &buf[HEADER_SIZE..frame_len];
    let packet = decode_payload(header.packet_type, &mut payload)?;
    if !payload.is_empty() {
        return Err(ProtocolError::TrailingBytes {
            packet: header.packet_type,
            extra: payload.len(),
        });
    }

    Ok((packet, frame_len))
}

fn decode_payload(packet_type: PacketType, payload: &mut &[u8]) -> Result<Packet, ProtocolError> {
    let packet = match packet_type {
        PacketType::KeepAlive => Packet::KeepAlive,
        PacketType::SetConfig => Packet::SetConfig(DeviceConfig::new(decode_blob(payload)?)),
        PacketType::ConnectToDevice => Packet::ConnectToDevice {
            uid: decode_string(payload)?,
        },
        PacketType::DisconnectFromDevice => Packet::DisconnectFromDevice,
        PacketType::StartSearch => Packet::StartSearch,
        PacketType::StopSearch => Packet::StopSearch,
        PacketType::QueryConnectionStatus => Packet::QueryConnectionStatus,
        PacketType::QueryConfigStatus => Packet::QueryConfigStatus,
        PacketType::SetRssiFilter => {
            ensure_remaining(payload, 4)?;
            Packet::SetRssiFilter(payload.get_i32_le())
        }
        PacketType::Ping => Packet::Ping,
        PacketType::ConnectionStatus => {
            ensure_remaining(payload, 1)?;
            let raw = payload.get_u8();
            let state = ConnectionState::try_from(raw).map_err(|v| {
                ProtocolError::InvalidPayload(format!("unknown connection state {}", v))
            })?;
            let device = decode_device(payload)?;
            Packet::ConnectionStatus { state, device }
        }
        PacketType::ConfigStatus => Packet::ConfigStatus(DeviceConfig::new(decode_blob(payload)?)),
        PacketType::DeviceList => {
            ensure_remaining(payload, 2)?;
            let count = payload.get_u16_le() as usize;
            // Each device needs at least 6 bytes, so a bogus count cannot
            // drive a huge allocation.
            let mut devices = Vec::with_capacity(count.min(payload.remaining() / 6));
            for _ in 0..count {
                devices.push(decode_device(payload)?);
            }
            Packet::DeviceList(devices)
        }
        PacketType::SensorFrame => {
            ensure_remaining(payload, SENSOR_FRAME_PAYLOAD_SIZE)?;
            let timestamp = payload.get_f32_le();
            let delta_time = payload.get_f32_le();
            let acceleration = decode_vector(payload);
            let angular_velocity = decode_vector(payload);
            let rotation = decode_quaternion(payload);
            let gesture = GestureId::from(payload.get_u8());
            Packet::SensorFrame(SensorFrame {
                timestamp,
                delta_time,
                acceleration,
                angular_velocity,
                rotation,
                gesture,
            })
        }
        PacketType::PingResponse => Packet::PingResponse,
    };
    Ok(packet)
}

/// Payload fields must fit inside the frame; running short is malformed,
/// not incomplete, because the frame length has already been satisfied.
fn ensure_remaining(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::InvalidPayload(format!(
            "field needs {} bytes, {} left in frame",
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn decode_blob(buf: &mut &[u8]) -> Result<Bytes, ProtocolError> {
    ensure_remaining(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    ensure_remaining(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

fn decode_string(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    let bytes = decode_blob(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

fn decode_device(buf: &mut &[u8]) -> Result<Device, ProtocolError> {
    let uid = decode_string(buf)?;
    let name = decode_string(buf)?;
    ensure_remaining(buf, 2)?;
    let product_id = ProductId::from(buf.get_u16_le());
    Ok(Device {
        uid,
        name,
        product_id,
    })
}

fn decode_vector(buf: &mut &[u8]) -> SensorVector {
    SensorVector {
        x: buf.get_f32_le(),
        y: buf.get_f32_le(),
        z: buf.get_f32_le(),
        accuracy: SensorAccuracy::from(buf.get_u8()),
    }
}

fn decode_quaternion(buf: &mut &[u8]) -> SensorQuaternion {
    SensorQuaternion {
        x: buf.get_f32_le(),
        y: buf.get_f32_le(),
        z: buf.get_f32_le(),
        w: buf.get_f32_le(),
        measurement_uncertainty: buf.get_f32_le(),
    }
}
