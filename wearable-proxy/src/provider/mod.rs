//! Device provider abstraction.
//!
//! The proxy never talks to hardware itself. Everything it knows about the
//! wearable comes through a [`DeviceProvider`]: direct queries for the
//! current state, and a broadcast channel of [`ProviderEvent`]s for things
//! that happen asynchronously (connection progress, search results).

pub mod simulated;

use std::time::Duration;

use tokio::sync::broadcast;
use wearable_protocol::{ConnectionState, Device, DeviceConfig, SensorFrame};

pub use simulated::{SimulatedProvider, SimulatorConfig};

/// Capacity of provider event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Sensors, gestures and update rates the application intends to use.
///
/// Carried as a device configuration blob so the provider can match
/// devices that support it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppIntentProfile(pub DeviceConfig);

/// Parameters for a device search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub profile: AppIntentProfile,
    /// Only report devices that are currently advertising.
    pub active_only: bool,
    /// Zero searches until stopped.
    pub timeout: Duration,
}

/// Asynchronous notifications from the device side.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// The device connection moved to a new state.
    StatusChanged {
        state: ConnectionState,
        device: Device,
    },
    /// A connection attempt did not succeed.
    ConnectionFailed { device: Device, reason: String },
    /// A search could not be run.
    SearchFailed { reason: String },
    /// A search produced results.
    DevicesFound(Vec<Device>),
}

/// Owner of the physical device connection.
///
/// Commands are fire-and-forget; their outcome arrives later as a
/// [`ProviderEvent`] on the channel returned by [`subscribe`](Self::subscribe).
pub trait DeviceProvider {
    /// The device currently connected, if any.
    fn connected_device(&self) -> Option<Device>;

    /// Last configuration applied to the device.
    fn cached_config(&self) -> DeviceConfig;

    fn set_config(&mut self, config: DeviceConfig);

    fn connect(&mut self, device: Device);

    fn disconnect(&mut self);

    fn search(&mut self, request: SearchRequest);

    fn stop_search(&mut self);

    /// Minimum signal strength for search results, in dBm.
    fn set_rssi_filter(&mut self, rssi: i32);

    fn app_intent_profile(&self) -> AppIntentProfile;

    /// Move every sensor frame produced since the last call into `frames`,
    /// oldest first.
    fn drain_sensor_frames(&mut self, frames: &mut Vec<SensorFrame>);

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;
}
