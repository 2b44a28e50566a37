//! Capture worker: drains the diversion handle into the delay buffer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::DelayBuffer;
use crate::divert::{DivertError, PacketDivert, MAX_PACKET_SIZE};
use crate::events::EventDispatcher;
use crate::timing;

use super::{set_time_critical_priority, EngineStats};

/// Worker loop. Blocks in `recv`; the handle shutdown issued by the
/// controller is what breaks that block during stop. A receive failure
/// while the engine is still running is reported once and ends the loop —
/// the controller does not auto-restart capture.
pub(super) fn run(
    divert: Arc<dyn PacketDivert>,
    running: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
    buffer: Arc<DelayBuffer>,
    events: Arc<EventDispatcher>,
    stats: Arc<EngineStats>,
) {
    set_time_critical_priority();
    log::debug!("capture worker started");

    let mut scratch = vec![0u8; MAX_PACKET_SIZE];

    while running.load(Ordering::Acquire) {
        let packet = match divert.recv(&mut scratch) {
            Ok(packet) => packet,
            Err(DivertError::Shutdown) => break,
            Err(DivertError::Io(e)) => {
                if running.load(Ordering::Acquire) {
                    events.error(&format!("Packet capture failed: {}", e));
                }
                break;
            }
        };

        if packet.data.is_empty() {
            continue;
        }

        // Each packet picks up the delay in force at its own capture time.
        let delay = delay_ms.load(Ordering::Relaxed);
        if delay == 0 {
            // Fast path: straight back on the wire, no queueing.
            match divert.send(packet) {
                Ok(()) => {
                    stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::debug!("fast-path send dropped: {}", e);
                }
            }
            continue;
        }

        let release_at = timing::now() + timing::ms_to_ticks(delay as f64);
        buffer.enqueue(packet, release_at);
    }

    log::debug!("capture worker stopped");
}
