//! UDP connection adapter: the per-flow state machine between the stack
//! engine's callbacks and the registered [`UdpHandler`].
//!
//! Each adapter starts `Connecting` while a spawned task runs the handler's
//! `connect`. Datagrams arriving in that window are copied into a bounded
//! FIFO and delivered, in arrival order, the moment the handshake succeeds;
//! inbound traffic keeps queueing until that drain finishes, so the early
//! batch is never overtaken. Applications commonly fire several
//! near-simultaneous queries on a fresh flow (A and AAAA lookups on the
//! same socket), so buffering them avoids the multi-second retry delay
//! losing them would cause.

use crate::deadline::Deadline;
use crate::engine::{FlowHandle, StackEngine};
use crate::error::{BridgeError, Result};
use crate::handler::UdpHandler;
use crate::pool::BufferPool;
use crate::registry::ConnectionRegistry;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Closed,
}

struct EarlyPacket {
    data: BytesMut,
    addr: SocketAddr,
}

struct UdpConnInner {
    state: ConnState,
    /// Set between handshake success and the moment the pending queue has
    /// fully drained. Writes are already allowed, inbound datagrams keep
    /// queueing so the early batch stays ahead of them.
    draining: bool,
    pending: VecDeque<EarlyPacket>,
    early_drops: u64,
    deadline: Option<Deadline>,
}

/// One logical UDP flow between the virtual interface and a handler.
pub struct UdpConn {
    flow: FlowHandle,
    local_addr: SocketAddr,
    engine: Arc<dyn StackEngine>,
    handler: Arc<dyn UdpHandler>,
    pool: Arc<dyn BufferPool>,
    registry: Arc<ConnectionRegistry<UdpConn>>,
    queue_capacity: usize,
    inner: Mutex<UdpConnInner>,
}

impl UdpConn {
    /// Register a new adapter for `local_addr` and kick off the handler's
    /// connect step on its own task.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        flow: FlowHandle,
        local_addr: SocketAddr,
        target: Option<SocketAddr>,
        engine: Arc<dyn StackEngine>,
        handler: Arc<dyn UdpHandler>,
        pool: Arc<dyn BufferPool>,
        registry: Arc<ConnectionRegistry<UdpConn>>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            flow,
            local_addr,
            engine,
            handler,
            pool,
            registry: registry.clone(),
            queue_capacity,
            inner: Mutex::new(UdpConnInner {
                state: ConnState::Connecting,
                draining: false,
                pending: VecDeque::with_capacity(queue_capacity),
                early_drops: 0,
                deadline: None,
            }),
        });
        registry.insert(local_addr, conn.clone());
        debug!("UDP flow created: {} ({})", local_addr, flow);

        let task_conn = conn.clone();
        tokio::spawn(async move {
            match task_conn.handler.connect(task_conn.clone(), target).await {
                Ok(()) => task_conn.drain_and_connect().await,
                Err(err) => {
                    warn!("UDP handshake failed for {}: {}", task_conn.local_addr, err);
                    let _ = task_conn.close();
                }
            }
        });

        conn
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    /// Early datagrams dropped because the pending queue was full.
    pub fn early_drops(&self) -> u64 {
        self.inner.lock().early_drops
    }

    fn check_state(&self) -> Result<()> {
        match self.inner.lock().state {
            ConnState::Connected => Ok(()),
            ConnState::Connecting => Err(BridgeError::NotConnected),
            ConnState::Closed => Err(BridgeError::Closed),
        }
    }

    /// While the handshake or its drain is still in flight, copy the
    /// datagram into the pending queue. Returns true if the datagram was
    /// consumed, including the case where a full queue swallowed it: the
    /// deliverer never sees an error for an overflow drop, only the
    /// counter moves.
    fn enqueue_early(&self, data: &[u8], addr: SocketAddr) -> bool {
        let mut inner = self.inner.lock();
        let buffering = inner.state == ConnState::Connecting
            || (inner.state == ConnState::Connected && inner.draining);
        if !buffering {
            return false;
        }
        if inner.pending.len() >= self.queue_capacity {
            inner.early_drops += 1;
            trace!(
                "early queue full for {}, dropping {} byte datagram",
                self.local_addr,
                data.len()
            );
            return true;
        }
        let mut buf = self.pool.acquire(data.len());
        buf.extend_from_slice(data);
        inner.pending.push_back(EarlyPacket { data: buf, addr });
        true
    }

    /// Flip to `Connected`, then deliver everything buffered while the
    /// handshake ran. Handler writes are accepted from this point on (the
    /// handler sees drained datagrams and may answer them immediately), but
    /// inbound datagrams keep queueing until the drain finishes, so the
    /// early batch is always delivered ahead of post-connection traffic.
    /// Datagrams that slip in during a pass are picked up by the next one.
    async fn drain_and_connect(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnState::Closed {
                let leftover: Vec<_> = inner.pending.drain(..).collect();
                drop(inner);
                for pkt in leftover {
                    self.pool.release(pkt.data);
                }
                return;
            }
            inner.state = ConnState::Connected;
            inner.draining = true;
            debug!("UDP flow connected: {}", self.local_addr);
        }

        loop {
            let (batch, closed) = {
                let mut inner = self.inner.lock();
                if inner.state == ConnState::Closed {
                    (inner.pending.drain(..).collect::<Vec<_>>(), true)
                } else if inner.pending.is_empty() {
                    inner.draining = false;
                    (Vec::new(), false)
                } else {
                    (inner.pending.drain(..).collect::<Vec<_>>(), false)
                }
            };

            if closed {
                for pkt in batch {
                    self.pool.release(pkt.data);
                }
                return;
            }
            if batch.is_empty() {
                return;
            }

            let mut batch = batch.into_iter();
            while let Some(pkt) = batch.next() {
                let res = self.handler.receive_to(self, &pkt.data, pkt.addr).await;
                self.pool.release(pkt.data);
                if let Err(err) = res {
                    // Drop the rest of this pass, not the adapter.
                    trace!("early delivery failed for {}: {}", self.local_addr, err);
                    for rest in batch {
                        self.pool.release(rest.data);
                    }
                    break;
                }
            }
        }
    }

    /// Inbound datagram from the stack engine, addressed to `addr`.
    ///
    /// While `Connecting` this is fire-and-forget into the pending queue.
    /// Once `Connected` it forwards synchronously to the handler; a handler
    /// error surfaces as [`BridgeError::DeliveryFailed`], which the native
    /// callback boundary treats as a dropped packet, not a dead flow.
    pub async fn receive(self: &Arc<Self>, data: &[u8], addr: SocketAddr) -> Result<()> {
        if self.enqueue_early(data, addr) {
            return Ok(());
        }
        self.check_state()?;
        self.handler
            .receive_to(self, data, addr)
            .await
            .map_err(|err| BridgeError::DeliveryFailed(err.to_string()))
    }

    /// Handler-issued write back toward the virtual interface, sourced from
    /// the adapter's local endpoint and addressed from `addr`. The payload
    /// is borrowed by the engine only for the duration of the call.
    pub fn write_from(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.check_state()?;
        self.engine.send_to(self.flow, self.local_addr, addr, data)?;
        Ok(data.len())
    }

    /// Arm or reschedule the single deadline timer; expiry closes the
    /// adapter. At most one live timer exists per adapter.
    pub fn set_deadline(self: &Arc<Self>, at: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == ConnState::Closed {
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

    /// Read and write deadlines are aliases of the one adapter deadline.
    pub fn set_read_deadline(self: &Arc<Self>, at: Instant) -> Result<()> {
        self.set_deadline(at)
    }

    pub fn set_write_deadline(self: &Arc<Self>, at: Instant) -> Result<()> {
        self.set_deadline(at)
    }

    /// Tear the flow down. Idempotent; concurrent receive/write calls
    /// observe `Closed` and fail cleanly. The registry entry and the native
    /// flow resource are released exactly once.
    pub fn close(&self) -> Result<()> {
        let (pending, deadline) = {
            let mut inner = self.inner.lock();
            if inner.state == ConnState::Closed {
                return Ok(());
            }
            inner.state = ConnState::Closed;
            (
                inner.pending.drain(..).collect::<Vec<_>>(),
                inner.deadline.take(),
            )
        };
        drop(deadline);
        for pkt in pending {
            self.pool.release(pkt.data);
        }
        self.registry.remove(&self.local_addr);
        self.engine.release(self.flow);
        debug!("UDP flow closed: {}", self.local_addr);
        Ok(())
    }
}
