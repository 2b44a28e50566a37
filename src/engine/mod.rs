//! Delay engine controller.
//!
//! Owns the diversion handle, the delay buffer, and the two workers:
//!
//! - capture.rs: blocking receive -> timestamp -> enqueue (or zero-delay
//!   fast path)
//! - release.rs: deadline pacing -> re-injection
//!
//! The controller transitions between Idle and Running under a single state
//! mutex; the hot-path fields (running flag, delay, queue depth, sent
//! count) are separately atomic so observers never contend with a stop in
//! progress. The handle is shared as `Arc<dyn PacketDivert>` and the OS
//! handle closes when the last reference drops, which pins every I/O
//! completion inside the handle's lifetime.

mod capture;
mod release;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::DelayBuffer;
use crate::divert::{self, DivertOpener, PacketDivert};
use crate::error::EngineError;
use crate::events::{EngineEvents, EventDispatcher};
use crate::timing;

/// Capture-everything filter handed to the diversion driver.
const FILTER_ALL: &str = "true";

/// Upper bound of the supported delay range, in milliseconds.
pub const MAX_DELAY_MS: u64 = 1_000;

/// Default number of consecutive send failures reported before going quiet.
pub const DEFAULT_SEND_ERROR_REPORT_LIMIT: u32 = 3;

/// First join window for a stopping worker.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Retry join window before the worker is detached.
const JOIN_RETRY_TIMEOUT: Duration = Duration::from_secs(2);

/// Monotonic counters shared with the workers.
#[derive(Default)]
pub(crate) struct EngineStats {
    pub packets_sent: AtomicU64,
}

/// Raise the current thread to the highest process-schedulable priority to
/// keep preemption jitter off the packet path.
#[cfg(windows)]
pub(crate) fn set_time_critical_priority() {
    use windows::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
    };

    unsafe {
        let _ = SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL);
    }
}

/// Raise the current thread to the highest process-schedulable priority.
///
/// No-op off Windows; elevated scheduling classes need privileges there.
#[cfg(not(windows))]
pub(crate) fn set_time_critical_priority() {}

/// Join a worker with a timeout using a polling approach. Returns `false`
/// when the worker had to be detached.
fn join_with_timeout(handle: JoinHandle<()>, name: &str) -> bool {
    const POLL: Duration = Duration::from_millis(10);

    for (window, last) in [(JOIN_TIMEOUT, false), (JOIN_RETRY_TIMEOUT, true)] {
        let deadline = Instant::now() + window;
        loop {
            if handle.is_finished() {
                let _ = handle.join();
                log::debug!("{} worker joined", name);
                return true;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL);
        }
        if !last {
            log::warn!("{} worker did not exit within {:?}, retrying", name, window);
        }
    }

    log::error!(
        "{} worker did not exit within the retry window - detaching thread to prevent a hang",
        name
    );
    std::mem::forget(handle);
    false
}

#[derive(Default)]
struct EngineState {
    divert: Option<Arc<dyn PacketDivert>>,
    capture: Option<JoinHandle<()>>,
    release: Option<JoinHandle<()>>,
}

impl EngineState {
    fn is_idle(&self) -> bool {
        self.divert.is_none() && self.capture.is_none() && self.release.is_none()
    }
}

/// Transparent packet delay engine.
///
/// `start` opens the diversion handle and spawns the worker pair; `stop`
/// unwinds in the reverse order and is idempotent. Both are callable from
/// any thread. `delay_ms` is a per-packet hold time in `0..=`
/// [`MAX_DELAY_MS`]; range enforcement is the caller's contract (the C API
/// validates at its boundary).
pub struct DelayEngine {
    state: Mutex<EngineState>,
    running: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
    buffer: Arc<DelayBuffer>,
    events: Arc<EventDispatcher>,
    stats: Arc<EngineStats>,
    send_error_report_limit: Arc<AtomicU32>,
    opener: DivertOpener,
}

impl DelayEngine {
    /// Engine over the real diversion driver.
    pub fn new(events: Arc<dyn EngineEvents>) -> Self {
        Self::with_opener(events, Box::new(|| divert::open_network(FILTER_ALL, 0)))
    }

    /// Engine over a caller-supplied handle factory (tests, simulated
    /// transports).
    pub fn with_opener(events: Arc<dyn EngineEvents>, opener: DivertOpener) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            running: Arc::new(AtomicBool::new(false)),
            delay_ms: Arc::new(AtomicU64::new(0)),
            buffer: Arc::new(DelayBuffer::new()),
            events: Arc::new(EventDispatcher::new(events)),
            stats: Arc::new(EngineStats::default()),
            send_error_report_limit: Arc::new(AtomicU32::new(DEFAULT_SEND_ERROR_REPORT_LIMIT)),
            opener,
        }
    }

    /// Start capturing and delaying traffic.
    pub fn start(&self, delay_ms: u64) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.is_idle() {
            return Err(EngineError::AlreadyRunning);
        }

        self.delay_ms.store(delay_ms, Ordering::Relaxed);
        timing::raise_timer_resolution();

        let divert = match (self.opener)() {
            Ok(divert) => divert,
            Err(e) => {
                timing::lower_timer_resolution();
                let msg = format!(
                    "Failed to open the packet diversion handle: {}. \
                     Run the host as administrator and make sure the WinDivert driver \
                     is installed and not held by another process.",
                    e
                );
                self.events.error(&msg);
                return Err(EngineError::Driver(msg));
            }
        };

        state.divert = Some(Arc::clone(&divert));
        self.buffer.clear();
        self.running.store(true, Ordering::Release);

        match self.spawn_capture(Arc::clone(&divert)) {
            Ok(handle) => state.capture = Some(handle),
            Err(e) => {
                self.events
                    .error(&format!("Failed to spawn the capture worker: {}", e));
                self.stop_locked(&mut state);
                return Err(EngineError::Internal(e.to_string()));
            }
        }
        match self.spawn_release(divert) {
            Ok(handle) => state.release = Some(handle),
            Err(e) => {
                self.events
                    .error(&format!("Failed to spawn the release worker: {}", e));
                self.stop_locked(&mut state);
                return Err(EngineError::Internal(e.to_string()));
            }
        }

        self.events
            .status(&format!("Engine started with {}ms delay.", delay_ms));
        Ok(())
    }

    /// Stop the engine, join the workers, and release every queued packet.
    /// Silent no-op when idle; returns only once teardown is complete.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        self.stop_locked(&mut state);
    }

    fn stop_locked(&self, state: &mut EngineState) {
        if state.is_idle() {
            return;
        }

        self.running.store(false, Ordering::Release);

        // The handle shutdown is what unblocks a capture receive; plain
        // thread signalling cannot.
        if let Some(divert) = &state.divert {
            divert.shutdown();
        }

        if let Some(handle) = state.capture.take() {
            join_with_timeout(handle, "capture");
        }
        if let Some(handle) = state.release.take() {
            join_with_timeout(handle, "release");
        }

        // Dropping the controller's reference closes the OS handle once the
        // workers have dropped theirs. A detached worker keeps it alive
        // rather than racing a close.
        state.divert = None;

        self.buffer.clear();
        timing::lower_timer_resolution();
        self.events.status("Engine stopped.");
    }

    /// Change the hold time for packets captured from now on. Packets
    /// already queued keep their original deadline. No restart involved.
    pub fn update_delay(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::Relaxed);
        self.events
            .status(&format!("Delay updated to {}ms.", delay_ms));
    }

    /// Cap on consecutive send-failure reports between successes.
    pub fn set_send_error_report_limit(&self, limit: u32) {
        self.send_error_report_limit.store(limit, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Currently configured hold time in milliseconds.
    pub fn current_delay(&self) -> u64 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    /// Packets waiting in the delay buffer. Lock-free; suitable for UI
    /// polling.
    pub fn queued_packets(&self) -> usize {
        self.buffer.len()
    }

    /// Total packets re-injected since the engine was created.
    pub fn packets_sent(&self) -> u64 {
        self.stats.packets_sent.load(Ordering::Relaxed)
    }

    fn spawn_capture(&self, divert: Arc<dyn PacketDivert>) -> std::io::Result<JoinHandle<()>> {
        let running = Arc::clone(&self.running);
        let delay_ms = Arc::clone(&self.delay_ms);
        let buffer = Arc::clone(&self.buffer);
        let events = Arc::clone(&self.events);
        let stats = Arc::clone(&self.stats);

        thread::Builder::new()
            .name("packetlag-capture".into())
            .spawn(move || {
                let fatal_events = Arc::clone(&events);
                let result = panic::catch_unwind(AssertUnwindSafe(move || {
                    capture::run(divert, running, delay_ms, buffer, events, stats);
                }));
                if result.is_err() {
                    fatal_events.error("Capture thread terminated by an unexpected panic.");
                }
            })
    }

    fn spawn_release(&self, divert: Arc<dyn PacketDivert>) -> std::io::Result<JoinHandle<()>> {
        let running = Arc::clone(&self.running);
        let buffer = Arc::clone(&self.buffer);
        let events = Arc::clone(&self.events);
        let stats = Arc::clone(&self.stats);
        let report_limit = Arc::clone(&self.send_error_report_limit);

        thread::Builder::new()
            .name("packetlag-release".into())
            .spawn(move || {
                let fatal_events = Arc::clone(&events);
                let result = panic::catch_unwind(AssertUnwindSafe(move || {
                    release::run(divert, running, buffer, events, stats, report_limit);
                }));
                if result.is_err() {
                    fatal_events.error("Release thread terminated by an unexpected panic.");
                }
            })
    }
}

impl Drop for DelayEngine {
    fn drop(&mut self) {
        // Observers may already be gone; stop quietly.
        self.events.dispose();
        self.stop();
    }
}
