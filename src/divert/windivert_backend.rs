//! WinDivert-backed diversion handle.
//!
//! Wraps one `WinDivert` network-layer handle for shared use by the capture
//! and release workers. Opening requires administrator rights and the driver
//! service; both failure modes surface through [`DivertError::Io`] so the
//! controller can attach user guidance.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use windivert::layer::NetworkLayer;
use windivert::packet::WinDivertPacket;
use windivert::prelude::*;

use super::{CapturedPacket, DivertAddress, DivertError, PacketDivert};

pub struct WinDivertHandle {
    handle: UnsafeCell<WinDivert<NetworkLayer>>,
    shut_down: AtomicBool,
}

// SAFETY: WinDivert documents recv/send/shutdown as thread-safe on a single
// handle; the wrapper's `&mut` receivers are stricter than the driver
// requires. Shutdown is serialized through `shut_down`, and close only
// happens in `drop` with exclusive ownership.
unsafe impl Send for WinDivertHandle {}
unsafe impl Sync for WinDivertHandle {}

impl WinDivertHandle {
    /// Open the driver with the given filter at the network layer.
    pub fn open(filter: &str, priority: i16) -> Result<Self, DivertError> {
        let handle = WinDivert::network(filter, priority, WinDivertFlags::new())
            .map_err(|e| DivertError::Io(e.to_string()))?;
        log::info!("WinDivert handle opened with filter {:?}", filter);
        Ok(Self {
            handle: UnsafeCell::new(handle),
            shut_down: AtomicBool::new(false),
        })
    }

    fn handle(&self) -> &WinDivert<NetworkLayer> {
        // SAFETY: shared access; see the Sync impl above.
        unsafe { &*self.handle.get() }
    }
}

impl PacketDivert for WinDivertHandle {
    fn recv(&self, scratch: &mut [u8]) -> Result<CapturedPacket, DivertError> {
        match self.handle().recv(Some(scratch)) {
            Ok(packet) => Ok(CapturedPacket {
                data: packet.data.to_vec(),
                address: DivertAddress::network(packet.address),
            }),
            Err(_) if self.shut_down.load(Ordering::Acquire) => Err(DivertError::Shutdown),
            Err(e) => Err(DivertError::Io(e.to_string())),
        }
    }

    fn send(&self, packet: CapturedPacket) -> Result<(), DivertError> {
        let CapturedPacket { data, address } = packet;
        let address = address
            .into_network()
            .ok_or_else(|| DivertError::Io("simulated address on a driver handle".into()))?;

        // SAFETY: `data` holds exactly the bytes captured for `address`.
        let mut outgoing = unsafe { WinDivertPacket::<NetworkLayer>::new(data) };
        outgoing.address = address;

        match self.handle().send(&outgoing) {
            Ok(_) => Ok(()),
            Err(_) if self.shut_down.load(Ordering::Acquire) => Err(DivertError::Shutdown),
            Err(e) => Err(DivertError::Io(e.to_string())),
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: see the Sync impl; the driver accepts shutdown concurrently
        // with a blocked recv, and this path runs at most once.
        let handle = unsafe { &mut *self.handle.get() };
        if let Err(e) = handle.shutdown(WinDivertShutdownMode::Both) {
            log::debug!("WinDivert shutdown: {}", e);
        }
    }
}

impl Drop for WinDivertHandle {
    fn drop(&mut self) {
        if let Err(e) = self.handle.get_mut().close(CloseAction::Nothing) {
            log::debug!("WinDivert close: {}", e);
        }
    }
}
