//! Bridge orchestration: turns the stack engine's native events into
//! adapter calls and hands established flows to the registered handlers.
//!
//! Inbound: packet -> stack engine -> [`Bridge::handle_udp_packet`] /
//! [`Bridge::handle_tcp_flow`] -> registry lookup or adapter creation ->
//! handler. Outbound: handler -> adapter write -> engine send primitive ->
//! virtual interface.

use crate::engine::{FlowHandle, StackEngine};
use crate::error::{BridgeError, Result};
use crate::handler::Handlers;
use crate::pool::{BufferPool, RecyclingPool};
use crate::registry::ConnectionRegistry;
use crate::tcp::TcpConn;
use crate::udp::UdpConn;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Capacity of the per-flow early-datagram queue. Large enough for a
    /// burst of simultaneous lookups on one flow (dual-stack DNS fires at
    /// least two); overflow drops the newest datagram.
    pub early_queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            early_queue_capacity: 64,
        }
    }
}

/// Bridge statistics.
#[derive(Debug, Default)]
pub struct BridgeStats {
    udp_flows: AtomicU64,
    tcp_flows: AtomicU64,
    udp_datagrams: AtomicU64,
    delivery_failures: AtomicU64,
}

impl BridgeStats {
    pub fn udp_flows(&self) -> u64 {
        self.udp_flows.load(Ordering::Relaxed)
    }

    pub fn tcp_flows(&self) -> u64 {
        self.tcp_flows.load(Ordering::Relaxed)
    }

    pub fn udp_datagrams(&self) -> u64 {
        self.udp_datagrams.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }
}

/// The bridge between a [`StackEngine`] and the registered [`Handlers`].
pub struct Bridge {
    engine: Arc<dyn StackEngine>,
    handlers: Arc<Handlers>,
    pool: Arc<dyn BufferPool>,
    udp_conns: Arc<ConnectionRegistry<UdpConn>>,
    tcp_conns: Arc<ConnectionRegistry<TcpConn>>,
    config: BridgeConfig,
    stats: BridgeStats,
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn handlers(&self) -> &Arc<Handlers> {
        &self.handlers
    }

    pub fn active_udp_flows(&self) -> usize {
        self.udp_conns.len()
    }

    pub fn active_tcp_flows(&self) -> usize {
        self.tcp_conns.len()
    }

    pub fn udp_conn(&self, local: &SocketAddr) -> Option<Arc<UdpConn>> {
        self.udp_conns.get(local)
    }

    pub fn tcp_conn(&self, local: &SocketAddr) -> Option<Arc<TcpConn>> {
        self.tcp_conns.get(local)
    }

    /// Inbound datagram event. `src` is the TUN-side sender (the flow key),
    /// `dst` the destination the packet was addressed to. The payload is
    /// only borrowed for this call; the adapter copies it if it must be
    /// retained. Must not block: unknown flows are registered and their
    /// handshake runs on its own task while the datagram is buffered.
    pub async fn handle_udp_packet(
        &self,
        flow: FlowHandle,
        src: SocketAddr,
        dst: SocketAddr,
        payload: &[u8],
    ) -> Result<()> {
        self.stats.udp_datagrams.fetch_add(1, Ordering::Relaxed);

        let conn = match self.udp_conns.get(&src) {
            Some(conn) => conn,
            None => {
                let handler = self.handlers.udp().ok_or(BridgeError::NoHandler("UDP"))?;
                self.stats.udp_flows.fetch_add(1, Ordering::Relaxed);
                UdpConn::open(
                    flow,
                    src,
                    Some(dst),
                    self.engine.clone(),
                    handler,
                    self.pool.clone(),
                    self.udp_conns.clone(),
                    self.config.early_queue_capacity,
                )
            }
        };

        conn.receive(payload, dst).await.inspect_err(|err| {
            if matches!(err, BridgeError::DeliveryFailed(_)) {
                self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
            }
        })
    }

    /// New established TCP flow from the engine. The registered handler
    /// takes over on its own task; if it declines, the adapter is closed
    /// and the engine resource released.
    pub fn handle_tcp_flow(
        &self,
        flow: FlowHandle,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Result<Arc<TcpConn>> {
        let handler = self.handlers.tcp().ok_or(BridgeError::NoHandler("TCP"))?;
        let conn = TcpConn::open(
            flow,
            src,
            dst,
            self.engine.clone(),
            self.tcp_conns.clone(),
        );
        self.stats.tcp_flows.fetch_add(1, Ordering::Relaxed);

        let task_conn = conn.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.handle(task_conn.clone(), dst).await {
                warn!(
                    "TCP handler declined {} -> {}: {}",
                    task_conn.local_addr(),
                    dst,
                    err
                );
                let _ = task_conn.close();
            }
        });

        Ok(conn)
    }

    /// Inbound stream data for an established TCP flow.
    pub fn handle_tcp_data(&self, src: SocketAddr, payload: &[u8]) -> Result<()> {
        match self.tcp_conns.get(&src) {
            Some(conn) => {
                conn.push_data(payload);
                Ok(())
            }
            None => Err(BridgeError::Closed),
        }
    }

    /// Engine-side teardown of a TCP flow (remote close or reset).
    pub fn handle_tcp_closed(&self, src: SocketAddr) {
        if let Some(conn) = self.tcp_conns.get(&src) {
            let _ = conn.close();
        }
    }
}

/// Builds a [`Bridge`]; the stack engine and handler set are required,
/// the buffer pool defaults to [`RecyclingPool`].
pub struct BridgeBuilder {
    engine: Option<Arc<dyn StackEngine>>,
    handlers: Option<Arc<Handlers>>,
    pool: Arc<dyn BufferPool>,
    config: BridgeConfig,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self {
            engine: None,
            handlers: None,
            pool: Arc::new(RecyclingPool::new()),
            config: BridgeConfig::default(),
        }
    }

    pub fn engine(mut self, engine: Arc<dyn StackEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn handlers(mut self, handlers: Arc<Handlers>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Replace the packet-path allocator.
    pub fn pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn early_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.early_queue_capacity = capacity;
        self
    }

    /// Initializes the engine (exactly once, before any packet delivery)
    /// and assembles the bridge.
    pub fn build(self) -> Result<Bridge> {
        let engine = self
            .engine
            .ok_or(BridgeError::Config("a stack engine is required"))?;
        let handlers = self
            .handlers
            .ok_or(BridgeError::Config("a handler set is required"))?;
        engine.init()?;

        Ok(Bridge {
            engine,
            handlers,
            pool: self.pool,
            udp_conns: Arc::new(ConnectionRegistry::new()),
            tcp_conns: Arc::new(ConnectionRegistry::new()),
            config: self.config,
            stats: BridgeStats::default(),
        })
    }
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{TcpHandler, UdpHandler};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time;

    #[derive(Default)]
    struct MockEngine {
        inited: AtomicUsize,
        released: AtomicUsize,
    }

    impl StackEngine for MockEngine {
        fn init(&self) -> Result<()> {
            self.inited.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn send_to(
            &self,
            _flow: FlowHandle,
            _local: SocketAddr,
            _remote: SocketAddr,
            _data: &[u8],
        ) -> Result<()> {
            Ok(())
        }

        fn send(&self, _flow: FlowHandle, data: &[u8]) -> Result<usize> {
            Ok(data.len())
        }

        fn release(&self, _flow: FlowHandle) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct EchoUdpHandler {
        received: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl UdpHandler for EchoUdpHandler {
        async fn connect(&self, _conn: Arc<UdpConn>, _target: Option<SocketAddr>) -> Result<()> {
            Ok(())
        }

        async fn receive_to(
            &self,
            conn: &Arc<UdpConn>,
            data: &[u8],
            addr: SocketAddr,
        ) -> Result<()> {
            self.received.lock().push(data.to_vec());
            conn.write_from(data, addr)?;
            Ok(())
        }
    }

    struct DecliningTcpHandler;

    #[async_trait]
    impl TcpHandler for DecliningTcpHandler {
        async fn handle(&self, _conn: Arc<TcpConn>, _target: SocketAddr) -> Result<()> {
            Err(BridgeError::HandshakeFailed("no route".into()))
        }
    }

    struct AcceptingTcpHandler;

    #[async_trait]
    impl TcpHandler for AcceptingTcpHandler {
        async fn handle(&self, _conn: Arc<TcpConn>, _target: SocketAddr) -> Result<()> {
            Ok(())
        }
    }

    fn src() -> SocketAddr {
        "10.0.0.2:5000".parse().unwrap()
    }

    fn dst() -> SocketAddr {
        "1.1.1.1:53".parse().unwrap()
    }

    fn bridge_with(
        engine: Arc<MockEngine>,
        handlers: Arc<Handlers>,
    ) -> Bridge {
        Bridge::builder()
            .engine(engine)
            .handlers(handlers)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn build_requires_engine_and_handlers() {
        assert!(matches!(
            Bridge::builder().build(),
            Err(BridgeError::Config(_))
        ));

        let engine = Arc::new(MockEngine::default());
        let bridge = bridge_with(engine.clone(), Arc::new(Handlers::new()));
        assert_eq!(engine.inited.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.active_udp_flows(), 0);
    }

    #[tokio::test]
    async fn udp_packet_without_handler_is_rejected() {
        let bridge = bridge_with(Arc::new(MockEngine::default()), Arc::new(Handlers::new()));
        let err = bridge
            .handle_udp_packet(FlowHandle(1), src(), dst(), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoHandler("UDP")));
    }

    #[tokio::test(start_paused = true)]
    async fn udp_packet_creates_flow_and_delivers() {
        let handlers = Arc::new(Handlers::new());
        let udp = Arc::new(EchoUdpHandler::default());
        handlers.register_udp(udp.clone());
        let bridge = bridge_with(Arc::new(MockEngine::default()), handlers);

        bridge
            .handle_udp_packet(FlowHandle(1), src(), dst(), b"query")
            .await
            .unwrap();
        assert_eq!(bridge.active_udp_flows(), 1);
        assert_eq!(bridge.stats().udp_flows(), 1);

        // Buffered while connecting, delivered once the handshake finishes.
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(udp.received.lock().as_slice(), &[b"query".to_vec()]);

        // Second datagram reuses the registered flow.
        bridge
            .handle_udp_packet(FlowHandle(1), src(), dst(), b"again")
            .await
            .unwrap();
        assert_eq!(bridge.stats().udp_flows(), 1);
        assert_eq!(bridge.stats().udp_datagrams(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn declined_tcp_flow_is_closed() {
        let engine = Arc::new(MockEngine::default());
        let handlers = Arc::new(Handlers::new());
        handlers.register_tcp(Arc::new(DecliningTcpHandler));
        let bridge = bridge_with(engine.clone(), handlers);

        let conn = bridge
            .handle_tcp_flow(FlowHandle(2), src(), dst())
            .unwrap();
        time::sleep(Duration::from_millis(1)).await;

        assert!(conn.is_closed());
        assert_eq!(bridge.active_tcp_flows(), 0);
        assert_eq!(engine.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_tcp_flow_receives_data() {
        let handlers = Arc::new(Handlers::new());
        handlers.register_tcp(Arc::new(AcceptingTcpHandler));
        let bridge = bridge_with(Arc::new(MockEngine::default()), handlers);

        let conn = bridge
            .handle_tcp_flow(FlowHandle(2), src(), dst())
            .unwrap();
        time::sleep(Duration::from_millis(1)).await;
        assert!(!conn.is_closed());

        bridge.handle_tcp_data(src(), b"payload").unwrap();
        assert_eq!(conn.download_bytes(), 7);

        bridge.handle_tcp_closed(src());
        assert!(conn.is_closed());
        assert!(matches!(
            bridge.handle_tcp_data(src(), b"late"),
            Err(BridgeError::Closed)
        ));
    }
}
