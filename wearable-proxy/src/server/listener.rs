//! Single-client TCP server.

use std::fmt::Display;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use wearable_protocol::{
    ConnectionState, Device, DeviceConfig, Packet, SensorFrame, ServerError,
    SENSOR_FRAME_PACKET_SIZE,
};

use crate::provider::{DeviceProvider, ProviderEvent};
use crate::server::buffer::{ReceiveBuffer, TransmitBuffer};

/// Default port the proxy listens on.
pub const DEFAULT_PORT: u16 = 38010;

/// Smallest receive buffer that still holds useful commands.
pub const MIN_RECEIVE_BUFFER_SIZE: usize = 64;

/// Smallest transmit buffer that holds the welcome packets.
pub const MIN_TRANSMIT_BUFFER_SIZE: usize = 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// How often the server polls the client and pumps telemetry.
    pub tick_interval: Duration,
    /// Limit for a single outbound write.
    pub write_timeout: Duration,
    pub receive_buffer_size: usize,
    pub transmit_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            tick_interval: Duration::from_millis(16),
            write_timeout: Duration::from_millis(500),
            receive_buffer_size: 4 * 1024,
            transmit_buffer_size: 64 * 1024,
        }
    }
}

/// Rejected server configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Receive buffer of {0} bytes is too small (min: 64)")]
    ReceiveBufferTooSmall(usize),
    #[error("Transmit buffer of {0} bytes is too small (min: 1024)")]
    TransmitBufferTooSmall(usize),
    #[error("Tick interval must be non-zero")]
    ZeroTickInterval,
    #[error("Write timeout must be non-zero")]
    ZeroWriteTimeout,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receive_buffer_size < MIN_RECEIVE_BUFFER_SIZE {
            return Err(ConfigError::ReceiveBufferTooSmall(self.receive_buffer_size));
        }
        if self.transmit_buffer_size < MIN_TRANSMIT_BUFFER_SIZE {
            return Err(ConfigError::TransmitBufferTooSmall(
                self.transmit_buffer_size,
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::ZeroWriteTimeout);
        }
        Ok(())
    }

    /// Most sensor frames a single telemetry write can carry.
    pub fn frames_per_write(&self) -> usize {
        self.transmit_buffer_size / SENSOR_FRAME_PACKET_SIZE
    }
}

/// The connected client.
pub(super) struct ClientSlot {
    pub(super) id: u64,
    pub(super) addr: SocketAddr,
    pub(super) stream: TcpStream,
    pub(super) writes: u64,
    pub(super) bytes_sent: u64,
}

impl ClientSlot {
    /// Write all of `data` or fail within `limit`.
    async fn write(&mut self, data: &[u8], limit: Duration) -> Result<(), ServerError> {
        match tokio::time::timeout(limit, self.stream.write_all(data)).await {
            Ok(result) => result?,
            Err(_) => return Err(ServerError::WriteTimeout(limit)),
        }
        self.writes += 1;
        self.bytes_sent += data.len() as u64;
        Ok(())
    }
}

/// Proxy between one TCP client and a device provider.
///
/// All work happens on the task that drives [`run`](Self::run) (or calls
/// [`tick`](Self::tick) directly), so packet handling, provider events and
/// telemetry never interleave.
pub struct ProxyServer<P: DeviceProvider> {
    pub(super) config: ServerConfig,
    pub(super) provider: P,
    listener: Option<TcpListener>,
    pub(super) client: Option<ClientSlot>,
    pub(super) receive: ReceiveBuffer,
    pub(super) transmit: TransmitBuffer,
    /// Scratch space for frames drained from the provider.
    pub(super) frames: Vec<SensorFrame>,
    client_count: u64,
}

impl<P: DeviceProvider> ProxyServer<P> {
    pub fn new(config: ServerConfig, provider: P) -> Self {
        let receive = ReceiveBuffer::new(config.receive_buffer_size);
        let transmit = TransmitBuffer::new(config.transmit_buffer_size);
        let frames = Vec::with_capacity(config.frames_per_write());
        Self {
            config,
            provider,
            listener: None,
            client: None,
            receive,
            transmit,
            frames,
            client_count: 0,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[cfg(test)]
    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    /// Number of connected clients, 0 or 1.
    pub fn connected_clients(&self) -> usize {
        usize::from(self.client.is_some())
    }

    /// Bound address while running. Useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind the listener. A running server is stopped first.
    pub async fn start(&mut self) -> io::Result<()> {
        if self.is_running() {
            self.stop();
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.listener = Some(listener);
        if let Some(addr) = self.local_addr() {
            info!("Server listening on {}", addr);
        }
        self.receive.clear();
        self.transmit.reset();
        Ok(())
    }

    /// Close the client and the listener.
    ///
    /// A connected device has its sensors disabled and is then
    /// disconnected. Does nothing when already stopped.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }

        self.drop_client("server stopping");
        self.listener = None;
        info!("Server stopped");

        if let Some(device) = self.provider.connected_device() {
            info!("Disabling and disconnecting {}", device.uid);
            self.provider.set_config(DeviceConfig::disabled());
            self.provider.disconnect();
        }
    }

    /// Run until `shutdown` resolves, then stop.
    pub async fn run<F>(&mut self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;

        let mut events = self.provider.subscribe();
        let mut events_open = true;
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(
                        "Shutdown requested ({} client connected)",
                        self.connected_clients()
                    );
                    break;
                }
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.handle_provider_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} device events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Device event channel closed");
                        events_open = false;
                    }
                },
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.stop();
        Ok(())
    }

    /// One pass of the server loop: accept, read and dispatch, telemetry.
    pub async fn tick(&mut self) {
        if !self.is_running() {
            return;
        }

        self.accept_pending().await;
        if self.client.is_none() {
            return;
        }

        self.drain_inbound().await;
        if self.client.is_none() {
            return;
        }

        self.pump_telemetry().await;
    }

    /// Forward a provider notification to the client.
    pub async fn handle_provider_event(&mut self, event: ProviderEvent) {
        let packet = match event {
            ProviderEvent::StatusChanged { state, device } => {
                debug!("Device {} is now {:?}", device.uid, state);
                Packet::ConnectionStatus { state, device }
            }
            ProviderEvent::ConnectionFailed { device, reason } => {
                warn!(
                    "{}",
                    ServerError::DeviceOperationFailed(format!(
                        "connect to {:?}: {}",
                        device.uid, reason
                    ))
                );
                Packet::ConnectionStatus {
                    state: ConnectionState::Failed,
                    device: Device::empty(),
                }
            }
            ProviderEvent::SearchFailed { reason } => {
                warn!(
                    "{}",
                    ServerError::DeviceOperationFailed(format!("search: {}", reason))
                );
                Packet::ConnectionStatus {
                    state: ConnectionState::Failed,
                    device: Device::empty(),
                }
            }
            ProviderEvent::DevicesFound(devices) => {
                debug!("Search found {} devices", devices.len());
                Packet::DeviceList(devices)
            }
        };

        self.send_packet(&packet).await;
    }

    async fn accept_pending(&mut self) {
        if self.client.is_some() {
            return;
        }
        let Some(listener) = &self.listener else {
            return;
        };

        let accepted = listener.accept().now_or_never();
        match accepted {
            None => {}
            Some(Ok((stream, addr))) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }

                self.client_count += 1;
                let id = self.client_count;
                info!("[Client {}] Connected from {}", id, addr);

                self.client = Some(ClientSlot {
                    id,
                    addr,
                    stream,
                    writes: 0,
                    bytes_sent: 0,
                });
                self.receive.clear();
                self.transmit.reset();
                self.send_welcome().await;
            }
            Some(Err(e)) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }

    /// Current connection status and config in one write.
    async fn send_welcome(&mut self) {
        let status = self.connection_status();
        let config = Packet::ConfigStatus(self.provider.cached_config());

        self.transmit.reset();
        for packet in [&status, &config] {
            if let Err(e) = self.transmit.encode(packet) {
                error!("{}", ServerError::from(e));
                return;
            }
        }
        self.send_transmit_buffer().await;
    }

    /// Read everything available and dispatch complete packets.
    async fn drain_inbound(&mut self) {
        loop {
            let Some(client) = self.client.as_mut() else {
                return;
            };
            let spare = self.receive.spare_capacity();

            match client.stream.try_read(spare) {
                Ok(0) => {
                    self.drop_client("closed by peer");
                    return;
                }
                Ok(n) => {
                    self.receive.commit(n);
                    while let Some(packet) = self.receive.next_packet() {
                        self.dispatch(packet).await;
                        if self.client.is_none() {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.drop_client(ServerError::from(e));
                    return;
                }
            }
        }
    }

    pub(super) fn connection_status(&self) -> Packet {
        match self.provider.connected_device() {
            Some(device) => Packet::ConnectionStatus {
                state: ConnectionState::Connected,
                device,
            },
            None => Packet::ConnectionStatus {
                state: ConnectionState::Disconnected,
                device: Device::empty(),
            },
        }
    }

    /// Encode one packet and send it on its own.
    pub(super) async fn send_packet(&mut self, packet: &Packet) {
        self.transmit.reset();
        if let Err(e) = self.transmit.encode(packet) {
            error!("{}", ServerError::from(e));
            return;
        }
        self.send_transmit_buffer().await;
    }

    /// Write the transmit buffer to the client in one call.
    ///
    /// Any failure, including a timeout, closes the client.
    pub(super) async fn send_transmit_buffer(&mut self) {
        if self.transmit.is_empty() {
            return;
        }
        let Some(client) = self.client.as_mut() else {
            warn!(
                "No client connected, dropping {} outbound bytes",
                self.transmit.len()
            );
            return;
        };

        let result = client
            .write(self.transmit.as_slice(), self.config.write_timeout)
            .await;
        if let Err(e) = result {
            self.drop_client(e);
        }
    }

    /// Close the client connection, if any.
    pub(super) fn drop_client(&mut self, reason: impl Display) {
        if let Some(client) = self.client.take() {
            info!(
                "[Client {}] Disconnected from {}: {} ({} bytes in {} writes)",
                client.id, client.addr, reason, client.bytes_sent, client.writes
            );
            if !self.receive.is_empty() {
                debug!(
                    "[Client {}] {} unread bytes dropped",
                    client.id,
                    self.receive.len()
                );
            }
            if self.receive.malformed_count() > 0 || self.receive.overflow_count() > 0 {
                info!(
                    "[Client {}] {} malformed frames ({} bytes discarded), {} buffer overflows",
                    client.id,
                    self.receive.malformed_count(),
                    self.receive.discarded_bytes(),
                    self.receive.overflow_count()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{test_server, wait_for, ProviderCall, RecordingProvider, TestClient};
    use wearable_protocol::encode_packet;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.frames_per_write(), 65536 / 58);
    }

    #[test]
    fn test_config_validation() {
        let config = ServerConfig {
            receive_buffer_size: 8,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ReceiveBufferTooSmall(8)));

        let config = ServerConfig {
            transmit_buffer_size: 100,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TransmitBufferTooSmall(100))
        );

        let config = ServerConfig {
            tick_interval: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroTickInterval));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut server = test_server(RecordingProvider::default()).await;
        assert!(server.is_running());
        assert!(server.local_addr().is_some());
        assert_eq!(server.connected_clients(), 0);

        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());

        // Ticking a stopped server is a no-op.
        server.tick().await;
    }

    #[tokio::test]
    async fn test_restart_rebinds() {
        let mut server = test_server(RecordingProvider::default()).await;
        let mut client = TestClient::connect(&server).await;
        client.recv_ticking(&mut server).await;
        assert_eq!(server.connected_clients(), 1);

        server.start().await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.connected_clients(), 0);
    }

    #[tokio::test]
    async fn test_welcome_sequence() {
        let provider = RecordingProvider {
            config: DeviceConfig::from(vec![0x10, 0x20, 0x30]),
            ..RecordingProvider::default()
        };
        let mut server = test_server(provider).await;
        let mut client = TestClient::connect(&server).await;

        assert_eq!(
            client.recv_ticking(&mut server).await,
            Packet::ConnectionStatus {
                state: ConnectionState::Disconnected,
                device: Device::empty(),
            }
        );
        assert_eq!(
            client.recv_ticking(&mut server).await,
            Packet::ConfigStatus(DeviceConfig::from(vec![0x10, 0x20, 0x30]))
        );
        assert_eq!(server.connected_clients(), 1);
        assert_eq!(server.client.as_ref().map(|c| c.writes), Some(1));
    }

    #[tokio::test]
    async fn test_welcome_reports_connected_device() {
        let device = Device {
            uid: "4C:87:5D:12:AB:01".to_string(),
            name: "Frames Alto".to_string(),
            product_id: wearable_protocol::ProductId::Frames,
        };
        let provider = RecordingProvider {
            connected: Some(device.clone()),
            ..RecordingProvider::default()
        };
        let mut server = test_server(provider).await;
        let mut client = TestClient::connect(&server).await;

        assert_eq!(
            client.recv_ticking(&mut server).await,
            Packet::ConnectionStatus {
                state: ConnectionState::Connected,
                device,
            }
        );
    }

    #[tokio::test]
    async fn test_query_status_round_trip() {
        let mut server = test_server(RecordingProvider::default()).await;
        let mut client = TestClient::connect(&server).await;
        client.skip_welcome(&mut server).await;

        client.send(&Packet::QueryConnectionStatus).await;
        assert_eq!(
            client.recv_ticking(&mut server).await,
            Packet::ConnectionStatus {
                state: ConnectionState::Disconnected,
                device: Device::empty(),
            }
        );
    }

    #[tokio::test]
    async fn test_split_packet_across_reads() {
        let mut server = test_server(RecordingProvider::default()).await;
        let mut client = TestClient::connect(&server).await;
        client.skip_welcome(&mut server).await;

        let bytes = encode_packet(&Packet::SetRssiFilter(-65)).unwrap();
        client.send_raw(&bytes[..2]).await;
        for _ in 0..5 {
            server.tick().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(server.provider().calls.is_empty());

        client.send_raw(&bytes[2..]).await;
        wait_for(&mut server, |s| !s.provider().calls.is_empty()).await;
        assert_eq!(server.provider().calls, vec![ProviderCall::SetRssiFilter(-65)]);
    }

    #[tokio::test]
    async fn test_malformed_then_recovers() {
        let mut server = test_server(RecordingProvider::default()).await;
        let mut client = TestClient::connect(&server).await;
        client.skip_welcome(&mut server).await;

        client.send_raw(&[0x42, 0x00, 0x00]).await;
        wait_for(&mut server, |s| s.receive.malformed_count() == 1).await;
        assert_eq!(server.connected_clients(), 1);

        client.send(&Packet::Ping).await;
        assert_eq!(client.recv_ticking(&mut server).await, Packet::PingResponse);
    }

    #[tokio::test]
    async fn test_single_client_slot() {
        let mut server = test_server(RecordingProvider::default()).await;
        let mut first = TestClient::connect(&server).await;
        first.skip_welcome(&mut server).await;

        // The second client waits in the accept backlog.
        let mut second = TestClient::connect(&server).await;
        for _ in 0..10 {
            server.tick().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.connected_clients(), 1);
        assert!(second.try_recv(Duration::from_millis(50)).await.is_none());

        first.send(&Packet::Ping).await;
        assert_eq!(first.recv_ticking(&mut server).await, Packet::PingResponse);

        drop(first);
        wait_for(&mut server, |s| s.client.as_ref().map(|c| c.id) == Some(2)).await;
        assert!(matches!(
            second.recv_ticking(&mut server).await,
            Packet::ConnectionStatus { .. }
        ));
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let mut server = test_server(RecordingProvider::default()).await;
        let mut client = TestClient::connect(&server).await;
        client.skip_welcome(&mut server).await;

        // Half a frame, then the peer goes away.
        client.send_raw(&[0x03, 0x10]).await;
        drop(client);
        wait_for(&mut server, |s| s.connected_clients() == 0).await;

        let mut client = TestClient::connect(&server).await;
        assert!(matches!(
            client.recv_ticking(&mut server).await,
            Packet::ConnectionStatus { .. }
        ));
        assert!(matches!(
            client.recv_ticking(&mut server).await,
            Packet::ConfigStatus(_)
        ));

        // The stale half frame from the first client is gone.
        client.send(&Packet::Ping).await;
        assert_eq!(client.recv_ticking(&mut server).await, Packet::PingResponse);
    }

    #[tokio::test]
    async fn test_reconnect_after_connection_reset() {
        let mut server = test_server(RecordingProvider::default()).await;
        let mut client = TestClient::connect(&server).await;
        client.skip_welcome(&mut server).await;

        client.send_raw(&[0x42, 0x00, 0x00]).await;
        wait_for(&mut server, |s| s.receive.malformed_count() == 1).await;

        client.reset();
        wait_for(&mut server, |s| s.connected_clients() == 0).await;
        assert!(server.is_running());

        let mut client = TestClient::connect(&server).await;
        assert!(matches!(
            client.recv_ticking(&mut server).await,
            Packet::ConnectionStatus { .. }
        ));
        assert!(matches!(
            client.recv_ticking(&mut server).await,
            Packet::ConfigStatus(_)
        ));
        assert_eq!(server.receive.malformed_count(), 0);

        client.send(&Packet::Ping).await;
        assert_eq!(client.recv_ticking(&mut server).await, Packet::PingResponse);
    }

    #[tokio::test]
    async fn test_provider_events_forwarded() {
        let mut server = test_server(RecordingProvider::default()).await;
        let mut client = TestClient::connect(&server).await;
        client.skip_welcome(&mut server).await;

        let device = Device::with_uid("AA:BB");
        server
            .handle_provider_event(ProviderEvent::StatusChanged {
                state: ConnectionState::Connecting,
                device: device.clone(),
            })
            .await;
        assert_eq!(
            client.recv_ticking(&mut server).await,
            Packet::ConnectionStatus {
                state: ConnectionState::Connecting,
                device: device.clone(),
            }
        );

        server
            .handle_provider_event(ProviderEvent::ConnectionFailed {
                device,
                reason: "timeout".to_string(),
            })
            .await;
        assert_eq!(
            client.recv_ticking(&mut server).await,
            Packet::ConnectionStatus {
                state: ConnectionState::Failed,
                device: Device::empty(),
            }
        );

        server
            .handle_provider_event(ProviderEvent::SearchFailed {
                reason: "radio off".to_string(),
            })
            .await;
        assert!(matches!(
            client.recv_ticking(&mut server).await,
            Packet::ConnectionStatus {
                state: ConnectionState::Failed,
                ..
            }
        ));

        let found = vec![Device::with_uid("A"), Device::with_uid("B")];
        server
            .handle_provider_event(ProviderEvent::DevicesFound(found.clone()))
            .await;
        assert_eq!(
            client.recv_ticking(&mut server).await,
            Packet::DeviceList(found)
        );
    }

    #[tokio::test]
    async fn test_event_without_client_is_dropped() {
        let mut server = test_server(RecordingProvider::default()).await;
        server
            .handle_provider_event(ProviderEvent::DevicesFound(vec![Device::with_uid("A")]))
            .await;
        assert_eq!(server.connected_clients(), 0);
    }

    #[tokio::test]
    async fn test_stop_disables_and_disconnects_device() {
        let provider = RecordingProvider {
            connected: Some(Device::with_uid("AA:BB")),
            ..RecordingProvider::default()
        };
        let mut server = test_server(provider).await;
        let mut client = TestClient::connect(&server).await;
        client.skip_welcome(&mut server).await;

        server.stop();
        assert_eq!(server.connected_clients(), 0);
        assert!(client.is_closed().await);
        assert_eq!(
            server.provider().calls,
            vec![
                ProviderCall::SetConfig(DeviceConfig::disabled()),
                ProviderCall::Disconnect,
            ]
        );

        server.stop();
        assert_eq!(server.provider().calls.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_without_device() {
        let mut server = test_server(RecordingProvider::default()).await;
        server.stop();
        assert!(server.provider().calls.is_empty());
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            tick_interval: Duration::from_millis(5),
            ..ServerConfig::default()
        };
        let mut server = ProxyServer::new(config, RecordingProvider::default());
        let events = server.provider().events.clone();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
            server
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = events.send(ProviderEvent::DevicesFound(Vec::new()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();

        let server = handle.await.unwrap();
        assert!(!server.is_running());
    }
}
