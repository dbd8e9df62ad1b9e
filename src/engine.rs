//! Boundary with the external user-space TCP/IP stack engine.
//!
//! The engine performs the actual packet processing (reassembly, checksums,
//! retransmission); this crate only drives its send primitives and releases
//! its per-flow resources. The native side never holds a managed reference,
//! only an opaque [`FlowHandle`] that the registry maps back to an adapter.

use crate::error::Result;
use std::net::SocketAddr;

/// Opaque reference to a native, engine-owned per-flow resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHandle(pub u64);

impl std::fmt::Display for FlowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// Outbound face of the stack engine.
///
/// Payload slices handed to `send_to`/`send` are bounded-lifetime borrows:
/// the engine must copy anything it needs before returning and must not
/// retain the slice past the call.
pub trait StackEngine: Send + Sync {
    /// Initialize engine modules. Called exactly once, before any packet
    /// is injected.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Send a datagram toward the virtual interface, sourced from `local`
    /// and addressed to `remote`.
    fn send_to(
        &self,
        flow: FlowHandle,
        local: SocketAddr,
        remote: SocketAddr,
        data: &[u8],
    ) -> Result<()>;

    /// Write stream data on an established TCP flow, returning the number
    /// of bytes the engine accepted.
    fn send(&self, flow: FlowHandle, data: &[u8]) -> Result<usize>;

    /// Release the engine's per-flow resource. Invoked exactly once per
    /// flow, from the owning adapter's close path.
    fn release(&self, flow: FlowHandle);
}
