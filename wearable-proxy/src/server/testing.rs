//! Test doubles for driving a server over real sockets.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use wearable_protocol::{
    decode_outbound, encode_packet, Device, DeviceConfig, Packet, SensorFrame,
};

use crate::provider::{
    AppIntentProfile, DeviceProvider, ProviderEvent, SearchRequest, EVENT_CHANNEL_CAPACITY,
};
use crate::server::{ProxyServer, ServerConfig};

const DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    SetConfig(DeviceConfig),
    Connect(Device),
    Disconnect,
    Search(SearchRequest),
    StopSearch,
    SetRssiFilter(i32),
}

/// Provider that records every command and never changes state on its own.
pub struct RecordingProvider {
    pub connected: Option<Device>,
    pub config: DeviceConfig,
    pub profile: AppIntentProfile,
    pub calls: Vec<ProviderCall>,
    /// Handed out by the next `drain_sensor_frames`.
    pub pending: Vec<SensorFrame>,
    pub events: broadcast::Sender<ProviderEvent>,
}

impl Default for RecordingProvider {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connected: None,
            config: DeviceConfig::disabled(),
            profile: AppIntentProfile::default(),
            calls: Vec::new(),
            pending: Vec::new(),
            events,
        }
    }
}

impl DeviceProvider for RecordingProvider {
    fn connected_device(&self) -> Option<Device> {
        self.connected.clone()
    }

    fn cached_config(&self) -> DeviceConfig {
        self.config.clone()
    }

    fn set_config(&mut self, config: DeviceConfig) {
        self.calls.push(ProviderCall::SetConfig(config.clone()));
        self.config = config;
    }

    fn connect(&mut self, device: Device) {
        self.calls.push(ProviderCall::Connect(device));
    }

    fn disconnect(&mut self) {
        self.calls.push(ProviderCall::Disconnect);
    }

    fn search(&mut self, request: SearchRequest) {
        self.calls.push(ProviderCall::Search(request));
    }

    fn stop_search(&mut self) {
        self.calls.push(ProviderCall::StopSearch);
    }

    fn set_rssi_filter(&mut self, rssi: i32) {
        self.calls.push(ProviderCall::SetRssiFilter(rssi));
    }

    fn app_intent_profile(&self) -> AppIntentProfile {
        self.profile.clone()
    }

    fn drain_sensor_frames(&mut self, frames: &mut Vec<SensorFrame>) {
        frames.append(&mut self.pending);
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

/// A started server on an ephemeral loopback port.
pub async fn test_server<P: DeviceProvider>(provider: P) -> ProxyServer<P> {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    };
    let mut server = ProxyServer::new(config, provider);
    server.start().await.unwrap();
    server
}

/// Tick the server until `done` holds.
pub async fn wait_for<P, F>(server: &mut ProxyServer<P>, mut done: F)
where
    P: DeviceProvider,
    F: FnMut(&ProxyServer<P>) -> bool,
{
    let deadline = Instant::now() + DEADLINE;
    while !done(server) {
        assert!(Instant::now() < deadline, "timed out waiting for server");
        server.tick().await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub struct TestClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TestClient {
    pub async fn connect<P: DeviceProvider>(server: &ProxyServer<P>) -> Self {
        let addr = server.local_addr().expect("server is not running");
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, packet: &Packet) {
        let bytes = encode_packet(packet).unwrap();
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    fn try_decode(&mut self) -> Option<Packet> {
        match decode_outbound(&self.buf) {
            Ok((packet, consumed)) => {
                self.buf.drain(..consumed);
                Some(packet)
            }
            Err(e) if e.is_incomplete() => None,
            Err(e) => panic!("server sent a malformed packet: {}", e),
        }
    }

    /// Read for up to `wait`. Returns false if nothing arrived.
    async fn fill(&mut self, wait: Duration) -> bool {
        let mut chunk = [0u8; 4096];
        match tokio::time::timeout(wait, self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) => panic!("server closed the connection"),
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
            Ok(Err(e)) => panic!("client read failed: {}", e),
            Err(_) => false,
        }
    }

    /// Next packet, ticking the server while waiting for it.
    pub async fn recv_ticking<P: DeviceProvider>(&mut self, server: &mut ProxyServer<P>) -> Packet {
        let deadline = Instant::now() + DEADLINE;
        loop {
            if let Some(packet) = self.try_decode() {
                return packet;
            }
            assert!(Instant::now() < deadline, "timed out waiting for packet");
            server.tick().await;
            self.fill(Duration::from_millis(5)).await;
        }
    }

    /// Next packet without ticking anything.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Packet> {
        if let Some(packet) = self.try_decode() {
            return Some(packet);
        }
        if self.fill(wait).await {
            self.try_decode()
        } else {
            None
        }
    }

    /// Consume the connection status and config sent on accept.
    pub async fn skip_welcome<P: DeviceProvider>(&mut self, server: &mut ProxyServer<P>) {
        assert!(matches!(
            self.recv_ticking(server).await,
            Packet::ConnectionStatus { .. }
        ));
        assert!(matches!(
            self.recv_ticking(server).await,
            Packet::ConfigStatus(_)
        ));
    }

    /// Abort the connection with a TCP reset instead of a clean close.
    pub fn reset(self) {
        #[allow(deprecated)]
        self.stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(self.stream);
    }

    /// Whether the server has closed this connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut chunk = [0u8; 256];
        match tokio::time::timeout(Duration::from_millis(50), self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&chunk[..n]);
                false
            }
            Err(_) => false,
        }
    }
}
