//! Packet and record definitions for the wearable proxy protocol.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Frame header size: 1 (tag) + 2 (payload length) = 3 bytes.
pub const HEADER_SIZE: usize = 3;

/// Maximum payload size representable by the length field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Encoded payload size of a [`SensorFrame`].
pub const SENSOR_FRAME_PAYLOAD_SIZE: usize = 4 + 4 + SENSOR_VECTOR_SIZE * 2 + SENSOR_QUATERNION_SIZE + 1;

/// Encoded size of a complete sensor frame packet.
pub const SENSOR_FRAME_PACKET_SIZE: usize = HEADER_SIZE + SENSOR_FRAME_PAYLOAD_SIZE;

pub(crate) const SENSOR_VECTOR_SIZE: usize = 4 * 3 + 1;
pub(crate) const SENSOR_QUATERNION_SIZE: usize = 4 * 5;

/// Packet type identifiers.
///
/// Client-to-server commands live in `0x01..=0x0A`, server-to-client
/// packets have the high bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    // Client -> server
    /// Keep the connection open; no reply.
    KeepAlive = 0x01,
    /// Replace the device configuration.
    SetConfig = 0x02,
    /// Connect to a device by uid.
    ConnectToDevice = 0x03,
    /// Disconnect from the current device.
    DisconnectFromDevice = 0x04,
    /// Start searching for devices.
    StartSearch = 0x05,
    /// Stop searching for devices.
    StopSearch = 0x06,
    /// Ask for the current connection status.
    QueryConnectionStatus = 0x07,
    /// Ask for the current device configuration.
    QueryConfigStatus = 0x08,
    /// Change the RSSI filter used during search.
    SetRssiFilter = 0x09,
    /// Latency probe.
    Ping = 0x0A,

    // Server -> client
    /// Device connection state.
    ConnectionStatus = 0x81,
    /// Cached device configuration.
    ConfigStatus = 0x82,
    /// Search results.
    DeviceList = 0x83,
    /// One sensor sample.
    SensorFrame = 0x84,
    /// Reply to [`PacketType::Ping`].
    PingResponse = 0x85,
}

impl PacketType {
    /// Returns true for packets sent from the client to the server.
    pub fn is_inbound(self) -> bool {
        (self as u8) & 0x80 == 0
    }

    /// Returns true for packets sent from the server to the client.
    pub fn is_outbound(self) -> bool {
        !self.is_inbound()
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(PacketType::KeepAlive),
            0x02 => Ok(PacketType::SetConfig),
            0x03 => Ok(PacketType::ConnectToDevice),
            0x04 => Ok(PacketType::DisconnectFromDevice),
            0x05 => Ok(PacketType::StartSearch),
            0x06 => Ok(PacketType::StopSearch),
            0x07 => Ok(PacketType::QueryConnectionStatus),
            0x08 => Ok(PacketType::QueryConfigStatus),
            0x09 => Ok(PacketType::SetRssiFilter),
            0x0A => Ok(PacketType::Ping),
            0x81 => Ok(PacketType::ConnectionStatus),
            0x82 => Ok(PacketType::ConfigStatus),
            0x83 => Ok(PacketType::DeviceList),
            0x84 => Ok(PacketType::SensorFrame),
            0x85 => Ok(PacketType::PingResponse),
            _ => Err(value),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value as u8
    }
}

/// Hardware product family of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProductId {
    #[default]
    Undefined,
    Frames,
    QuietComfort35Two,
    NoiseCancellingHeadphones700,
}

impl From<u16> for ProductId {
    fn from(value: u16) -> Self {
        match value {
            0x402C => ProductId::Frames,
            0x4020 => ProductId::QuietComfort35Two,
            0x4024 => ProductId::NoiseCancellingHeadphones700,
            _ => ProductId::Undefined,
        }
    }
}

impl From<ProductId> for u16 {
    fn from(value: ProductId) -> Self {
        match value {
            ProductId::Undefined => 0x0000,
            ProductId::Frames => 0x402C,
            ProductId::QuietComfort35Two => 0x4020,
            ProductId::NoiseCancellingHeadphones700 => 0x4024,
        }
    }
}

/// A physical sensor device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Device {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub product_id: ProductId,
}

impl Device {
    /// The "no device" sentinel.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A device known only by its uid.
    pub fn with_uid(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uid.is_empty() && self.name.is_empty()
    }
}

/// Device connection state as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

impl TryFrom<u8> for ConnectionState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(ConnectionState::Disconnected),
            1 => Ok(ConnectionState::Connecting),
            2 => Ok(ConnectionState::Connected),
            3 => Ok(ConnectionState::Failed),
            _ => Err(value),
        }
    }
}

/// Opaque device configuration.
///
/// The server never looks inside; the bytes travel verbatim between the
/// client and the device provider. An empty blob means every sensor and
/// gesture is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DeviceConfig(Bytes);

impl DeviceConfig {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Configuration with all sensors and gestures turned off.
    pub fn disabled() -> Self {
        Self(Bytes::new())
    }

    pub fn is_disabled(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for DeviceConfig {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

/// Reported accuracy of a vector sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SensorAccuracy {
    #[default]
    Unreliable,
    Low,
    Medium,
    High,
}

impl From<u8> for SensorAccuracy {
    fn from(value: u8) -> Self {
        match value {
            1 => SensorAccuracy::Low,
            2 => SensorAccuracy::Medium,
            3 => SensorAccuracy::High,
            _ => SensorAccuracy::Unreliable,
        }
    }
}

impl From<SensorAccuracy> for u8 {
    fn from(value: SensorAccuracy) -> Self {
        match value {
            SensorAccuracy::Unreliable => 0,
            SensorAccuracy::Low => 1,
            SensorAccuracy::Medium => 2,
            SensorAccuracy::High => 3,
        }
    }
}

/// Three-axis reading (acceleration in m/s^2, angular velocity in rad/s).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorVector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub accuracy: SensorAccuracy,
}

/// Orientation as a unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorQuaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
    /// Estimated error in radians.
    pub measurement_uncertainty: f32,
}

impl Default for SensorQuaternion {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
            measurement_uncertainty: 0.0,
        }
    }
}

/// Gesture detected during a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GestureId {
    #[default]
    None,
    DoubleTap,
    HeadNod,
    HeadShake,
    /// A gesture this build does not know by name.
    Unknown(u8),
}

impl From<u8> for GestureId {
    fn from(value: u8) -> Self {
        match value {
            0 => GestureId::None,
            1 => GestureId::DoubleTap,
            2 => GestureId::HeadNod,
            3 => GestureId::HeadShake,
            other => GestureId::Unknown(other),
        }
    }
}

impl From<GestureId> for u8 {
    fn from(value: GestureId) -> Self {
        match value {
            GestureId::None => 0,
            GestureId::DoubleTap => 1,
            GestureId::HeadNod => 2,
            GestureId::HeadShake => 3,
            GestureId::Unknown(other) => other,
        }
    }
}

/// One sensor sample from the device.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorFrame {
    /// Device time of the sample in seconds.
    pub timestamp: f32,
    /// Seconds since the previous sample.
    pub delta_time: f32,
    pub acceleration: SensorVector,
    pub angular_velocity: SensorVector,
    pub rotation: SensorQuaternion,
    pub gesture: GestureId,
}

/// A protocol packet in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // Client -> server
    KeepAlive,
    SetConfig(DeviceConfig),
    ConnectToDevice { uid: String },
    DisconnectFromDevice,
    StartSearch,
    StopSearch,
    QueryConnectionStatus,
    QueryConfigStatus,
    SetRssiFilter(i32),
    Ping,

    // Server -> client
    ConnectionStatus { state: ConnectionState, device: Device },
    ConfigStatus(DeviceConfig),
    DeviceList(Vec<Device>),
    SensorFrame(SensorFrame),
    PingResponse,
}

impl Packet {
    /// Get the packet type of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::KeepAlive => PacketType::KeepAlive,
            Packet::SetConfig(_) => PacketType::SetConfig,
            Packet::ConnectToDevice { .. } => PacketType::ConnectToDevice,
            Packet::DisconnectFromDevice => PacketType::DisconnectFromDevice,
            Packet::StartSearch => PacketType::StartSearch,
            Packet::StopSearch => PacketType::StopSearch,
            Packet::QueryConnectionStatus => PacketType::QueryConnectionStatus,
            Packet::QueryConfigStatus => PacketType::QueryConfigStatus,
            Packet::SetRssiFilter(_) => PacketType::SetRssiFilter,
            Packet::Ping => PacketType::Ping,
            Packet::ConnectionStatus { .. } => PacketType::ConnectionStatus,
            Packet::ConfigStatus(_) => PacketType::ConfigStatus,
            Packet::DeviceList(_) => PacketType::DeviceList,
            Packet::SensorFrame(_) => PacketType::SensorFrame,
            Packet::PingResponse => PacketType::PingResponse,
        }
    }
}
