//! TCP connection adapter.
//!
//! TCP mechanics (segmentation, retransmission, windows) live in the stack
//! engine; by the time a flow reaches this crate it is already established.
//! The adapter buffers inbound stream data for the handler and turns handler
//! writes into engine calls. [`TcpStream`] wraps an adapter in
//! `AsyncRead`/`AsyncWrite` so handlers can treat the flow as a socket.

use crate::deadline::Deadline;
use crate::engine::{FlowHandle, StackEngine};
use crate::error::{BridgeError, Result};
use crate::registry::ConnectionRegistry;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tracing::{debug, trace};

struct TcpConnInner {
    /// Data received from the engine, waiting to be read by the handler.
    recv_buffer: BytesMut,
    read_waker: Option<Waker>,
    closed: bool,
    deadline: Option<Deadline>,
    download_bytes: u64,
    upload_bytes: u64,
}

/// One established TCP flow between the virtual interface and a handler.
pub struct TcpConn {
    flow: FlowHandle,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    engine: Arc<dyn StackEngine>,
    registry: Arc<ConnectionRegistry<TcpConn>>,
    inner: Mutex<TcpConnInner>,
}

impl TcpConn {
    pub(crate) fn open(
        flow: FlowHandle,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        engine: Arc<dyn StackEngine>,
        registry: Arc<ConnectionRegistry<TcpConn>>,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            flow,
            local_addr,
            remote_addr,
            engine,
            registry: registry.clone(),
            inner: Mutex::new(TcpConnInner {
                recv_buffer: BytesMut::new(),
                read_waker: None,
                closed: false,
                deadline: None,
                download_bytes: 0,
                upload_bytes: 0,
            }),
        });
        registry.insert(local_addr, conn.clone());
        debug!(
            "TCP flow created: {} -> {} ({})",
            local_addr, remote_addr, flow
        );
        conn
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn download_bytes(&self) -> u64 {
        self.inner.lock().download_bytes
    }

    pub fn upload_bytes(&self) -> u64 {
        self.inner.lock().upload_bytes
    }

    /// Inbound stream data from the engine. Data arriving after close is
    /// dropped; the flow's resources are already on their way out.
    pub(crate) fn push_data(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.closed {
            trace!("dropping {} bytes for closed {}", data.len(), self.local_addr);
            return;
        }
        inner.recv_buffer.extend_from_slice(data);
        inner.download_bytes += data.len() as u64;
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
    }

    /// Handler-issued write toward the virtual interface. The payload is
    /// borrowed by the engine only for the duration of the call.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(BridgeError::Closed);
            }
            inner.upload_bytes += data.len() as u64;
        }
        self.engine.send(self.flow, data)
    }

    /// Arm or reschedule the single deadline timer; expiry closes the
    /// adapter. Read and write deadlines share this one timer.
    pub fn set_deadline(self: &Arc<Self>, at: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        match &inner.deadline {
            Some(timer) => timer.reset(at),
            None => {
                let weak = Arc::downgrade(self);
                inner.deadline = Some(Deadline::arm(at, move || {
                    if let Some(conn) = weak.upgrade() {
                        trace!("deadline expired for {}", conn.local_addr);
                        let _ = conn.close();
                    }
                }));
            }
        }
        Ok(())
    }

    pub fn set_read_deadline(self: &Arc<Self>, at: Instant) -> Result<()> {
        self.set_deadline(at)
    }

    pub fn set_write_deadline(self: &Arc<Self>, at: Instant) -> Result<()> {
        self.set_deadline(at)
    }

    /// Idempotent teardown: wakes pending readers, removes the registry
    /// entry and releases the native flow resource exactly once.
    pub fn close(&self) -> Result<()> {
        let deadline = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            if let Some(waker) = inner.read_waker.take() {
                waker.wake();
            }
            inner.deadline.take()
        };
        drop(deadline);
        self.registry.remove(&self.local_addr);
        self.engine.release(self.flow);
        debug!("TCP flow closed: {}", self.local_addr);
        Ok(())
    }
}

/// `AsyncRead`/`AsyncWrite` view of a [`TcpConn`] for handlers.
pub struct TcpStream {
    conn: Arc<TcpConn>,
}

impl TcpStream {
    pub fn new(conn: Arc<TcpConn>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<TcpConn> {
        &self.conn
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut inner = self.conn.inner.lock();

        if !inner.recv_buffer.is_empty() {
            let len = std::cmp::min(buf.remaining(), inner.recv_buffer.len());
            buf.put_slice(&inner.recv_buffer.split_to(len));
            return Poll::Ready(Ok(()));
        }

        if inner.closed {
            return Poll::Ready(Ok(())); // EOF
        }

        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.conn.write(buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(BridgeError::Closed) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection closed",
            ))),
            Err(err) => Poll::Ready(Err(std::io::Error::other(err))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let _ = self.conn.close();
        Poll::Ready(Ok(()))
    }
}
