//! Sensor frame forwarding.

use log::warn;
use wearable_protocol::Packet;

use crate::provider::DeviceProvider;
use crate::server::ProxyServer;

impl<P: DeviceProvider> ProxyServer<P> {
    /// Send every frame the provider produced since the last tick.
    ///
    /// All frames go out in a single write. Frames that do not fit in the
    /// transmit buffer are dropped.
    pub(super) async fn pump_telemetry(&mut self) {
        self.frames.clear();
        self.provider.drain_sensor_frames(&mut self.frames);
        if self.frames.is_empty() {
            return;
        }

        self.transmit.reset();
        let mut encoded = 0;
        for frame in &self.frames {
            match self.transmit.encode(&Packet::SensorFrame(*frame)) {
                Ok(_) => encoded += 1,
                Err(e) => {
                    warn!(
                        "Dropping {} of {} sensor frames: {}",
                        self.frames.len() - encoded,
                        self.frames.len(),
                        e
                    );
                    break;
                }
            }
        }

        if encoded > 0 {
            self.send_transmit_buffer().await;
        }
    }
}
