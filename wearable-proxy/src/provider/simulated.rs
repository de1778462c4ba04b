//! Simulated wearable for running the proxy without hardware.
//!
//! Advertises a fixed list of devices, answers connects immediately and,
//! once connected with sensors enabled, produces frames of a head turning
//! slowly about the vertical axis.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast;
use wearable_protocol::{
    ConnectionState, Device, DeviceConfig, GestureId, ProductId, SensorAccuracy, SensorFrame,
    SensorQuaternion, SensorVector,
};

use super::{AppIntentProfile, DeviceProvider, ProviderEvent, SearchRequest, EVENT_CHANNEL_CAPACITY};

/// Standard gravity in m/s^2.
const GRAVITY: f32 = 9.806_65;

/// Yaw rate of the simulated head, rad/s.
const YAW_RATE: f32 = 0.5;

/// Frames older than this are dropped instead of replayed in a burst.
const MAX_FRAMES_PER_DRAIN: usize = 32;

/// Every Nth frame carries a head nod.
const GESTURE_INTERVAL: u64 = 250;

/// Accepted sample rates, Hz. Zero turns frame generation off.
const MIN_SAMPLE_RATE_HZ: f32 = 0.1;
const MAX_SAMPLE_RATE_HZ: f32 = 1000.0;

fn default_sample_rate() -> f32 {
    50.0
}

fn default_rssi() -> i32 {
    -50
}

/// `[simulator]` section of the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorConfig {
    /// Frames per second while connected.
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f32,
    #[serde(default = "default_devices")]
    pub devices: Vec<SimulatedDevice>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: default_sample_rate(),
            devices: default_devices(),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SimulatorConfigError {
    #[error("Sample rate {0} Hz out of range (0, or 0.1 to 1000)")]
    SampleRateOutOfRange(f32),
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<(), SimulatorConfigError> {
        let rate = self.sample_rate_hz;
        if rate == 0.0 || (MIN_SAMPLE_RATE_HZ..=MAX_SAMPLE_RATE_HZ).contains(&rate) {
            Ok(())
        } else {
            Err(SimulatorConfigError::SampleRateOutOfRange(rate))
        }
    }
}

/// A device the simulator pretends to see.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedDevice {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub product_id: ProductId,
    /// Signal strength reported during search, dBm.
    #[serde(default = "default_rssi")]
    pub rssi: i32,
}

impl SimulatedDevice {
    fn device(&self) -> Device {
        Device {
            uid: self.uid.clone(),
            name: self.name.clone(),
            product_id: self.product_id,
        }
    }
}

fn default_devices() -> Vec<SimulatedDevice> {
    vec![SimulatedDevice {
        uid: "SIM-0001".to_string(),
        name: "Simulated Frames".to_string(),
        product_id: ProductId::Frames,
        rssi: default_rssi(),
    }]
}

pub struct SimulatedProvider {
    config: SimulatorConfig,
    events: broadcast::Sender<ProviderEvent>,
    connected: Option<Device>,
    device_config: DeviceConfig,
    rssi_filter: i32,
    searching: bool,
    /// Time the last emitted frame was due.
    last_sample: Option<Instant>,
    /// Seconds of device time since connect.
    device_time: f32,
    sample_count: u64,
}

impl SimulatedProvider {
    pub fn new(config: SimulatorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            events,
            connected: None,
            device_config: DeviceConfig::disabled(),
            rssi_filter: i32::MIN,
            searching: false,
            last_sample: None,
            device_time: 0.0,
            sample_count: 0,
        }
    }

    pub fn is_searching(&self) -> bool {
        self.searching
    }

    fn emit(&self, event: ProviderEvent) {
        // No subscribers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }

    /// `None` when the rate yields no usable period.
    fn sample_period(&self) -> Option<Duration> {
        if self.config.sample_rate_hz <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f32(1.0 / self.config.sample_rate_hz)
            .ok()
            .filter(|period| !period.is_zero())
    }

    fn next_frame(&mut self, delta_time: f32) -> SensorFrame {
        self.device_time += delta_time;
        self.sample_count += 1;

        let half_yaw = (self.device_time * YAW_RATE) / 2.0;
        let gesture = if self.sample_count % GESTURE_INTERVAL == 0 {
            GestureId::HeadNod
        } else {
            GestureId::None
        };

        SensorFrame {
            timestamp: self.device_time,
            delta_time,
            acceleration: SensorVector {
                x: 0.0,
                y: 0.0,
                z: GRAVITY,
                accuracy: SensorAccuracy::High,
            },
            angular_velocity: SensorVector {
                x: 0.0,
                y: 0.0,
                z: YAW_RATE,
                accuracy: SensorAccuracy::High,
            },
            rotation: SensorQuaternion {
                x: 0.0,
                y: 0.0,
                z: half_yaw.sin(),
                w: half_yaw.cos(),
                measurement_uncertainty: 0.02,
            },
            gesture,
        }
    }

    /// Produce every frame due between the last sample and `now`.
    fn generate_until(&mut self, now: Instant, frames: &mut Vec<SensorFrame>) {
        let Some(period) = self.sample_period() else {
            return;
        };
        let last = *self.last_sample.get_or_insert(now);
        let elapsed = now.saturating_duration_since(last);
        let due = (elapsed.as_secs_f64() / period.as_secs_f64()) as usize;
        if due == 0 {
            return;
        }

        let emitted = due.min(MAX_FRAMES_PER_DRAIN);
        if emitted < due {
            debug!("Simulator skipping {} stale frames", due - emitted);
            self.device_time += period.as_secs_f32() * (due - emitted) as f32;
            self.last_sample = Some(now);
        } else {
            self.last_sample = Some(last + period * due as u32);
        }

        let delta_time = period.as_secs_f32();
        for _ in 0..emitted {
            let frame = self.next_frame(delta_time);
            frames.push(frame);
        }
    }
}

impl DeviceProvider for SimulatedProvider {
    fn connected_device(&self) -> Option<Device> {
        self.connected.clone()
    }

    fn cached_config(&self) -> DeviceConfig {
        self.device_config.clone()
    }

    fn set_config(&mut self, config: DeviceConfig) {
        debug!("Simulator config set ({} bytes)", config.len());
        self.device_config = config;
        self.last_sample = None;
    }

    fn connect(&mut self, device: Device) {
        let Some(known) = self
            .config
            .devices
            .iter()
            .find(|d| d.uid == device.uid)
            .map(SimulatedDevice::device)
        else {
            warn!("Simulator has no device with uid {:?}", device.uid);
            self.emit(ProviderEvent::ConnectionFailed {
                device,
                reason: "unknown device".to_string(),
            });
            return;
        };

        if let Some(previous) = self.connected.take() {
            self.emit(ProviderEvent::StatusChanged {
                state: ConnectionState::Disconnected,
                device: previous,
            });
        }

        self.emit(ProviderEvent::StatusChanged {
            state: ConnectionState::Connecting,
            device: known.clone(),
        });

        info!("Simulator connected to {} ({})", known.name, known.uid);
        self.connected = Some(known.clone());
        self.searching = false;
        self.last_sample = None;
        self.device_time = 0.0;
        self.sample_count = 0;

        self.emit(ProviderEvent::StatusChanged {
            state: ConnectionState::Connected,
            device: known,
        });
    }

    fn disconnect(&mut self) {
        if let Some(device) = self.connected.take() {
            info!("Simulator disconnected from {}", device.uid);
            self.emit(ProviderEvent::StatusChanged {
                state: ConnectionState::Disconnected,
                device,
            });
        }
    }

    fn search(&mut self, request: SearchRequest) {
        debug!(
            "Simulator search (active_only={}, timeout={:?})",
            request.active_only, request.timeout
        );

        if self.config.devices.is_empty() {
            self.emit(ProviderEvent::SearchFailed {
                reason: "no devices configured".to_string(),
            });
            return;
        }

        self.searching = true;
        let found = self
            .config
            .devices
            .iter()
            .filter(|d| d.rssi >= self.rssi_filter)
            .map(SimulatedDevice::device)
            .collect();
        self.emit(ProviderEvent::DevicesFound(found));
    }

    fn stop_search(&mut self) {
        if self.is_searching() {
            debug!("Simulator search stopped");
        }
        self.searching = false;
    }

    fn set_rssi_filter(&mut self, rssi: i32) {
        self.rssi_filter = rssi;
    }

    fn app_intent_profile(&self) -> AppIntentProfile {
        AppIntentProfile(self.device_config.clone())
    }

    fn drain_sensor_frames(&mut self, frames: &mut Vec<SensorFrame>) {
        if self.connected.is_none() || self.device_config.is_disabled() {
            self.last_sample = None;
            return;
        }
        self.generate_until(Instant::now(), frames);
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}
