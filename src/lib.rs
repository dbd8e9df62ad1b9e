//! tunbridge
//!
//! Bridges a user-space TCP/IP stack engine (lwIP-style: packet reassembly,
//! routing, checksums handled externally) to pluggable upper-layer
//! connection handlers that implement the actual proxying decision for each
//! flow.
//!
//! This crate provides:
//! - Per-flow connection adapters that turn the engine's single-threaded
//!   callback events into safe, concurrent, handler-facing objects
//! - Early-datagram buffering for flows whose handler is still connecting
//! - A single resettable deadline per flow that forces teardown on expiry
//! - A replaceable buffer pool that keeps the hot packet path off the
//!   allocator
//! - Single-slot registration for one TCP, one UDP and one DNS handler
//!
//! The engine's dispatch context must never block: every entry point on
//! this side either returns immediately or hands work to its own task.
//! Handlers, by contrast, run on spawned tasks and may block freely.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use tunbridge::{Bridge, FlowHandle, Handlers, Result, StackEngine, UdpConn, UdpHandler};
//!
//! struct Engine; // wraps the real stack engine's send/free primitives
//!
//! impl StackEngine for Engine {
//!     fn send_to(&self, _: FlowHandle, _: SocketAddr, _: SocketAddr, _: &[u8]) -> Result<()> {
//!         Ok(())
//!     }
//!     fn send(&self, _: FlowHandle, data: &[u8]) -> Result<usize> {
//!         Ok(data.len())
//!     }
//!     fn release(&self, _: FlowHandle) {}
//! }
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl UdpHandler for Echo {
//!     async fn connect(&self, _conn: Arc<UdpConn>, _target: Option<SocketAddr>) -> Result<()> {
//!         Ok(())
//!     }
//!     async fn receive_to(&self, conn: &Arc<UdpConn>, data: &[u8], addr: SocketAddr) -> Result<()> {
//!         conn.write_from(data, addr)?;
//!         Ok(())
//!     }
//! }
//!
//! async fn run() -> Result<()> {
//!     // Handlers must be in place before packet delivery begins.
//!     let handlers = Arc::new(Handlers::new());
//!     handlers.register_udp(Arc::new(Echo));
//!
//!     let bridge = Bridge::builder()
//!         .engine(Arc::new(Engine))
//!         .handlers(handlers)
//!         .build()?;
//!
//!     // Driven by the engine's inbound callbacks:
//!     let src: SocketAddr = "10.0.0.2:5000".parse().unwrap();
//!     let dst: SocketAddr = "1.1.1.1:53".parse().unwrap();
//!     bridge.handle_udp_packet(FlowHandle(1), src, dst, b"query").await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
mod deadline;
pub mod engine;
pub mod error;
pub mod handler;
pub mod pool;
pub mod registry;
pub mod tcp;
pub mod udp;

// Re-exports
pub use bridge::{Bridge, BridgeBuilder, BridgeConfig, BridgeStats};
pub use engine::{FlowHandle, StackEngine};
pub use error::{BridgeError, Result};
pub use handler::{DnsHandler, Handlers, TcpHandler, UdpHandler};
pub use pool::{BufferPool, RecyclingPool, POOL_BUF_SIZE};
pub use registry::ConnectionRegistry;
pub use tcp::{TcpConn, TcpStream};
pub use udp::{ConnState, UdpConn};
