//! In-process simulated diversion handle.
//!
//! [`SimDivert`] implements [`PacketDivert`] over channels instead of the
//! kernel driver: a [`SimHarness`] injects captured packets on one side and
//! observes re-injected packets (with send timestamps) on the other. The
//! harness can also script send failures. This is the seed for the
//! end-to-end tests and works on any platform.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::timing::{self, Tick};

use super::{CapturedPacket, DivertAddress, DivertError, DivertOpener, PacketDivert};

/// A packet the simulated handle re-injected.
#[derive(Debug)]
pub struct SentPacket {
    pub data: Vec<u8>,
    pub outbound: bool,
    /// Tick at which the send happened.
    pub at: Tick,
}

pub struct SimDivert {
    packets_rx: Receiver<CapturedPacket>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
    sent_tx: Sender<SentPacket>,
    open: AtomicBool,
    failing_sends: AtomicU32,
    failing_recvs: AtomicU32,
}

impl PacketDivert for SimDivert {
    fn recv(&self, _scratch: &mut [u8]) -> Result<CapturedPacket, DivertError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(DivertError::Shutdown);
        }
        if self
            .failing_recvs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DivertError::Io("injected recv failure".into()));
        }
        crossbeam_channel::select! {
            recv(self.packets_rx) -> packet => packet.map_err(|_| DivertError::Shutdown),
            recv(self.shutdown_rx) -> _ => Err(DivertError::Shutdown),
        }
    }

    fn send(&self, packet: CapturedPacket) -> Result<(), DivertError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(DivertError::Shutdown);
        }
        if self
            .failing_sends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DivertError::Io("injected send failure".into()));
        }

        let record = SentPacket {
            outbound: packet.address.outbound(),
            data: packet.data,
            at: timing::now(),
        };
        self.sent_tx.send(record).map_err(|_| DivertError::Shutdown)
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.shutdown_tx.send(());
        }
    }
}

/// Test-side controller for one [`SimDivert`] handle.
pub struct SimHarness {
    divert: Arc<SimDivert>,
    inject_tx: Sender<CapturedPacket>,
    sent_rx: Receiver<SentPacket>,
}

impl SimHarness {
    pub fn new() -> Self {
        let (inject_tx, packets_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        let (sent_tx, sent_rx) = unbounded();

        let divert = Arc::new(SimDivert {
            packets_rx,
            shutdown_tx,
            shutdown_rx,
            sent_tx,
            open: AtomicBool::new(true),
            failing_sends: AtomicU32::new(0),
            failing_recvs: AtomicU32::new(0),
        });

        Self {
            divert,
            inject_tx,
            sent_rx,
        }
    }

    /// The diversion-handle side, for handing to an engine.
    pub fn divert(&self) -> Arc<SimDivert> {
        Arc::clone(&self.divert)
    }

    /// An opener that always yields this harness's handle.
    pub fn opener(&self) -> DivertOpener {
        let divert = self.divert();
        Box::new(move || Ok(divert.clone() as Arc<dyn PacketDivert>))
    }

    /// An opener that creates a fresh harness per open (one engine start =
    /// one handle, as with the real driver). Each created harness is handed
    /// back through the returned receiver.
    pub fn factory() -> (DivertOpener, Receiver<SimHarness>) {
        let (harness_tx, harness_rx) = unbounded();
        let opener: DivertOpener = Box::new(move || {
            let harness = SimHarness::new();
            let divert = harness.divert();
            let _ = harness_tx.send(harness);
            Ok(divert as Arc<dyn PacketDivert>)
        });
        (opener, harness_rx)
    }

    /// Feed one captured packet to the handle. Ignored after shutdown.
    pub fn inject(&self, payload: &[u8], outbound: bool) {
        let _ = self.inject_tx.send(CapturedPacket {
            data: payload.to_vec(),
            address: DivertAddress::sim(outbound),
        });
    }

    /// Wait for the next re-injected packet.
    pub fn recv_sent(&self, timeout: Duration) -> Option<SentPacket> {
        self.sent_rx.recv_timeout(timeout).ok()
    }

    /// Make the next `n` sends fail with an I/O error.
    pub fn fail_next_sends(&self, n: u32) {
        self.divert.failing_sends.store(n, Ordering::Release);
    }

    /// Make the next `n` receives fail with an I/O error. The failure fires
    /// on the next `recv` call, not on one already blocked.
    pub fn fail_next_recvs(&self, n: u32) {
        self.divert.failing_recvs.store(n, Ordering::Release);
    }
}

impl Default for SimHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn injected_packets_are_received() {
        let harness = SimHarness::new();
        harness.inject(&[1, 2, 3], true);

        let mut scratch = [0u8; 16];
        let packet = harness.divert().recv(&mut scratch).unwrap();
        assert_eq!(packet.data, vec![1, 2, 3]);
        assert!(packet.address.outbound());
    }

    #[test]
    fn shutdown_unblocks_a_pending_recv() {
        let harness = SimHarness::new();
        let divert = harness.divert();

        let waiter = thread::spawn(move || {
            let mut scratch = [0u8; 16];
            divert.recv(&mut scratch)
        });

        thread::sleep(Duration::from_millis(20));
        harness.divert().shutdown();

        match waiter.join().unwrap() {
            Err(DivertError::Shutdown) => {}
            other => panic!("expected shutdown, got {:?}", other),
        }
    }

    #[test]
    fn sends_fail_while_scripted_then_recover() {
        let harness = SimHarness::new();
        let divert = harness.divert();
        harness.fail_next_sends(2);

        for _ in 0..2 {
            let packet = CapturedPacket {
                data: vec![0xAA],
                address: DivertAddress::sim(false),
            };
            assert!(matches!(divert.send(packet), Err(DivertError::Io(_))));
        }

        let packet = CapturedPacket {
            data: vec![0xBB],
            address: DivertAddress::sim(false),
        };
        divert.send(packet).unwrap();
        let sent = harness.recv_sent(Duration::from_millis(100)).unwrap();
        assert_eq!(sent.data, vec![0xBB]);
        assert!(!sent.outbound);
    }

    #[test]
    fn send_after_shutdown_reports_shutdown() {
        let harness = SimHarness::new();
        let divert = harness.divert();
        divert.shutdown();

        let packet = CapturedPacket {
            data: vec![1],
            address: DivertAddress::sim(true),
        };
        assert!(matches!(divert.send(packet), Err(DivertError::Shutdown)));
    }
}
