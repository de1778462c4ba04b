//! Proxy server: connection management, packet dispatch and telemetry.

pub mod buffer;
mod dispatch;
pub mod listener;
mod telemetry;
#[cfg(test)]
pub(crate) mod testing;

pub use listener::{ProxyServer, ServerConfig};
