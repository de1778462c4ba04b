//! Client command handling.

use std::time::Duration;

use log::{debug, trace, warn};
use wearable_protocol::{Device, Packet};

use crate::provider::{DeviceProvider, SearchRequest};
use crate::server::ProxyServer;

impl<P: DeviceProvider> ProxyServer<P> {
    /// Act on one decoded client packet.
    pub(super) async fn dispatch(&mut self, packet: Packet) {
        let client_id = self.client.as_ref().map_or(0, |c| c.id);
        trace!("[Client {}] Received {:?}", client_id, packet.packet_type());

        match packet {
            Packet::KeepAlive => {}

            Packet::SetConfig(config) => {
                debug!("[Client {}] SetConfig ({} bytes)", client_id, config.len());
                self.provider.set_config(config);
                let cached = self.provider.cached_config();
                self.send_packet(&Packet::ConfigStatus(cached)).await;
            }

            Packet::ConnectToDevice { uid } => {
                debug!("[Client {}] ConnectToDevice {:?}", client_id, uid);
                self.provider.connect(Device::with_uid(uid));
            }

            Packet::DisconnectFromDevice => {
                if self.provider.connected_device().is_some() {
                    debug!("[Client {}] DisconnectFromDevice", client_id);
                    self.provider.disconnect();
                }
            }

            Packet::StartSearch => {
                debug!("[Client {}] StartSearch", client_id);
                let request = SearchRequest {
                    profile: self.provider.app_intent_profile(),
                    active_only: false,
                    timeout: Duration::ZERO,
                };
                self.provider.search(request);
            }

            Packet::StopSearch => {
                debug!("[Client {}] StopSearch", client_id);
                self.provider.stop_search();
            }

            Packet::QueryConnectionStatus => {
                let status = self.connection_status();
                self.send_packet(&status).await;
            }

            Packet::QueryConfigStatus => {
                let config = self.provider.cached_config();
                self.send_packet(&Packet::ConfigStatus(config)).await;
            }

            Packet::SetRssiFilter(rssi) => {
                debug!("[Client {}] SetRssiFilter {}", client_id, rssi);
                self.provider.set_rssi_filter(rssi);
            }

            Packet::Ping => {
                self.send_packet(&Packet::PingResponse).await;
            }

            // The reassembler only yields client packets.
            other => {
                warn!(
                    "[Client {}] Ignoring {:?} from client",
                    client_id,
                    other.packet_type()
                );
            }
        }
    }
}
