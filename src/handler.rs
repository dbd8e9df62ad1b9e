//! Upper-layer handler traits and their registration slots.
//!
//! Handlers implement the actual proxying decision for each flow; the
//! bridge only hands them connection objects. All three slots must be
//! filled before the virtual interface starts delivering packets;
//! re-registering while connections exist has undefined effect on them.

use crate::error::Result;
use crate::tcp::TcpConn;
use crate::udp::UdpConn;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Handles TCP connections coming from the virtual interface.
#[async_trait]
pub trait TcpHandler: Send + Sync {
    /// Take ownership of proxying `conn` toward `target` for the
    /// connection's lifetime. An error means the handler declined and the
    /// bridge closes the connection.
    async fn handle(&self, conn: Arc<TcpConn>, target: SocketAddr) -> Result<()>;
}

/// Handles UDP flows coming from the virtual interface.
#[async_trait]
pub trait UdpHandler: Send + Sync {
    /// Establish any upstream session for the flow. Called once per flow;
    /// `target` may be `None`, meaning the first packet's destination is
    /// accepted implicitly.
    async fn connect(&self, conn: Arc<UdpConn>, target: Option<SocketAddr>) -> Result<()>;

    /// Called once per inbound datagram after the flow is connected.
    async fn receive_to(&self, conn: &Arc<UdpConn>, data: &[u8], addr: SocketAddr) -> Result<()>;
}

/// Resolves hostnames for embedders; never invoked by the adapters.
#[async_trait]
pub trait DnsHandler: Send + Sync {
    async fn resolve_ip(&self, host: &str) -> Result<IpAddr>;
}

/// Single-slot registration points for the three handlers.
///
/// Writes are last-one-wins and expected to happen during single-threaded
/// startup, before any connection exists; adapters only read afterwards.
/// This is an explicit configuration object handed to the bridge rather
/// than ambient global state, so tests can run with independent sets.
#[derive(Default)]
pub struct Handlers {
    tcp: RwLock<Option<Arc<dyn TcpHandler>>>,
    udp: RwLock<Option<Arc<dyn UdpHandler>>>,
    dns: RwLock<Option<Arc<dyn DnsHandler>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tcp(&self, handler: Arc<dyn TcpHandler>) {
        *self.tcp.write() = Some(handler);
    }

    pub fn register_udp(&self, handler: Arc<dyn UdpHandler>) {
        *self.udp.write() = Some(handler);
    }

    pub fn register_dns(&self, handler: Arc<dyn DnsHandler>) {
        *self.dns.write() = Some(handler);
    }

    pub fn tcp(&self) -> Option<Arc<dyn TcpHandler>> {
        self.tcp.read().clone()
    }

    pub fn udp(&self) -> Option<Arc<dyn UdpHandler>> {
        self.udp.read().clone()
    }

    pub fn dns(&self) -> Option<Arc<dyn DnsHandler>> {
        self.dns.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    struct Resolver(IpAddr);

    #[async_trait]
    impl DnsHandler for Resolver {
        async fn resolve_ip(&self, _host: &str) -> Result<IpAddr> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn registration_is_last_write_wins() {
        let handlers = Handlers::new();
        assert!(handlers.dns().is_none());

        handlers.register_dns(Arc::new(Resolver("1.1.1.1".parse().unwrap())));
        handlers.register_dns(Arc::new(Resolver("8.8.8.8".parse().unwrap())));

        let dns = handlers.dns().expect("dns handler registered");
        let ip = dns.resolve_ip("example.com").await.unwrap();
        assert_eq!(ip, "8.8.8.8".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn empty_slots_read_as_none() {
        let handlers = Handlers::new();
        assert!(handlers.tcp().is_none());
        assert!(handlers.udp().is_none());

        // The bridge surfaces a missing slot as a typed error.
        let err = handlers.tcp().ok_or(BridgeError::NoHandler("TCP")).err();
        assert!(matches!(err, Some(BridgeError::NoHandler("TCP"))));
    }
}
