//! Packet diversion layer.
//!
//! The engine talks to the kernel diversion driver through the
//! [`PacketDivert`] trait: a blocking receive, a re-injecting send, and a
//! shutdown that doubles as the cancellation mechanism for a blocked
//! receive. Two implementations exist:
//!
//! - `windivert_backend.rs`: the WinDivert driver (Windows only)
//! - `sim.rs`: an in-process simulated handle backed by channels, used by
//!   the test suite and by hosts running without the driver
//!
//! The OS handle closes when the last reference to an implementation drops,
//! so no worker can ever observe a closed handle.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub mod sim;

#[cfg(windows)]
mod windivert_backend;
#[cfg(windows)]
pub use windivert_backend::WinDivertHandle;

/// Largest IP packet the diversion driver can hand us.
pub const MAX_PACKET_SIZE: usize = 65_535;

/// Errors surfaced by a diversion handle.
#[derive(Debug, Error)]
pub enum DivertError {
    /// The handle was shut down. This is the expected cancellation result
    /// for a blocked receive during engine stop, not a fault.
    #[error("diversion handle shut down")]
    Shutdown,

    #[error("diversion I/O error: {0}")]
    Io(String),
}

/// Opaque routing descriptor captured with each packet and required for
/// re-injection.
pub struct DivertAddress {
    repr: AddressRepr,
}

enum AddressRepr {
    #[cfg(windows)]
    Network(windivert::address::WinDivertAddress<windivert::layer::NetworkLayer>),
    Sim { outbound: bool },
}

impl DivertAddress {
    #[cfg(windows)]
    pub(crate) fn network(
        address: windivert::address::WinDivertAddress<windivert::layer::NetworkLayer>,
    ) -> Self {
        Self {
            repr: AddressRepr::Network(address),
        }
    }

    /// Routing descriptor for the simulated handle.
    pub fn sim(outbound: bool) -> Self {
        Self {
            repr: AddressRepr::Sim { outbound },
        }
    }

    /// Direction flag of the captured packet.
    pub fn outbound(&self) -> bool {
        match &self.repr {
            #[cfg(windows)]
            AddressRepr::Network(address) => address.outbound(),
            AddressRepr::Sim { outbound } => *outbound,
        }
    }

    #[cfg(windows)]
    pub(crate) fn into_network(
        self,
    ) -> Option<windivert::address::WinDivertAddress<windivert::layer::NetworkLayer>> {
        match self.repr {
            AddressRepr::Network(address) => Some(address),
            AddressRepr::Sim { .. } => None,
        }
    }
}

impl fmt::Debug for DivertAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            #[cfg(windows)]
            AddressRepr::Network(_) => f.write_str("DivertAddress::Network"),
            AddressRepr::Sim { outbound } => f
                .debug_struct("DivertAddress::Sim")
                .field("outbound", outbound)
                .finish(),
        }
    }
}

/// One intercepted packet: owned payload bytes plus the routing descriptor
/// needed to put it back on the wire.
#[derive(Debug)]
pub struct CapturedPacket {
    pub data: Vec<u8>,
    pub address: DivertAddress,
}

/// A kernel (or simulated) packet diversion handle.
///
/// All operations are callable from any thread. `recv` blocks until a packet
/// arrives or [`shutdown`](PacketDivert::shutdown) is called; `send` consumes
/// the packet, releasing the payload whatever the outcome.
pub trait PacketDivert: Send + Sync {
    /// Block until the next packet is captured. `scratch` must be at least
    /// [`MAX_PACKET_SIZE`] bytes; the returned packet owns a copy of the
    /// received bytes.
    fn recv(&self, scratch: &mut [u8]) -> Result<CapturedPacket, DivertError>;

    /// Re-inject a previously captured packet.
    fn send(&self, packet: CapturedPacket) -> Result<(), DivertError>;

    /// Shut down both directions, waking any blocked `recv`. Idempotent;
    /// errors are ignored.
    fn shutdown(&self);
}

/// Factory the engine controller uses to open its handle on start. Tests
/// substitute a simulated opener here.
pub type DivertOpener =
    Box<dyn Fn() -> Result<Arc<dyn PacketDivert>, DivertError> + Send + Sync>;

/// Open a diversion handle capturing all traffic at the network layer.
#[cfg(windows)]
pub fn open_network(filter: &str, priority: i16) -> Result<Arc<dyn PacketDivert>, DivertError> {
    Ok(Arc::new(WinDivertHandle::open(filter, priority)?))
}

/// Open a diversion handle capturing all traffic at the network layer.
///
/// Always fails off Windows: only the simulated handle exists there.
#[cfg(not(windows))]
pub fn open_network(_filter: &str, _priority: i16) -> Result<Arc<dyn PacketDivert>, DivertError> {
    Err(DivertError::Io(
        "packet diversion requires the WinDivert driver (Windows only)".into(),
    ))
}
