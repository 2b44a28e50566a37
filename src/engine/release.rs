//! Release worker: re-injects packets as their deadlines expire.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::buffer::DelayBuffer;
use crate::divert::{DivertError, PacketDivert};
use crate::events::EventDispatcher;
use crate::timing;

use super::{set_time_critical_priority, EngineStats};

/// Within this many milliseconds of the head deadline the worker commits to
/// a precise spin-down. Further out it naps in 1 ms slices and re-reads the
/// head, so a packet captured under a freshly lowered delay can overtake a
/// long sleep.
const SPIN_DOWN_WINDOW_MS: f64 = 2.0;

/// Worker loop. Never self-terminates on send failures; only the running
/// flag ends it. Send errors past `report_limit` consecutive ones are
/// counted but not reported, and the counter resets on any success.
pub(super) fn run(
    divert: Arc<dyn PacketDivert>,
    running: Arc<AtomicBool>,
    buffer: Arc<DelayBuffer>,
    events: Arc<EventDispatcher>,
    stats: Arc<EngineStats>,
    report_limit: Arc<AtomicU32>,
) {
    set_time_critical_priority();
    log::debug!("release worker started");

    let mut consecutive_errors: u32 = 0;

    while running.load(Ordering::Acquire) {
        let release_at = match buffer.next_release_at() {
            Some(tick) => tick,
            None => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
        };

        let delta = release_at - timing::now();
        if delta > 0 {
            let delta_ms = timing::ticks_to_ms(delta);
            if delta_ms > SPIN_DOWN_WINDOW_MS {
                thread::sleep(Duration::from_millis(1));
            } else {
                timing::precise_sleep(delta_ms);
            }
            continue;
        }

        // Due. The controller's clear can race the dequeue; just loop.
        let Some(delayed) = buffer.dequeue() else {
            continue;
        };

        match divert.send(delayed.packet) {
            Ok(()) => {
                stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                consecutive_errors = 0;
            }
            Err(DivertError::Shutdown) => {
                // Stop already in progress; the payload is dropped.
            }
            Err(DivertError::Io(e)) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                if consecutive_errors <= report_limit.load(Ordering::Relaxed) {
                    events.error(&format!("Packet re-injection failed: {}", e));
                } else {
                    log::debug!(
                        "packet re-injection failed ({} consecutive): {}",
                        consecutive_errors,
                        e
                    );
                }
            }
        }
    }

    log::debug!("release worker stopped");
}
