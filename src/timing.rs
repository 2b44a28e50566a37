//! High-resolution timing services for the delay engine.
//!
//! All scheduling arithmetic runs on [`Tick`]s, the platform's monotonic
//! performance counter. Milliseconds are only an input/output unit. The
//! module also owns the process-wide multimedia timer resolution (1 ms
//! granularity while the engine runs) and the hybrid sleep-then-spin
//! primitive the release worker paces itself with.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;

/// Monotonic counter in platform-native units. Strictly non-decreasing per
/// process; frequency via [`tick_frequency`].
pub type Tick = i64;

/// Coarse-sleep slack in milliseconds. `precise_sleep` hands everything but
/// this margin to the OS sleep and spins the rest; 1.5 ms covers the
/// worst-case sleep overshoot at 1 ms timer granularity.
const COARSE_SLEEP_SLACK_MS: f64 = 1.5;

static TICK_FREQUENCY: Lazy<Tick> = Lazy::new(query_tick_frequency);

#[cfg(windows)]
fn query_tick_frequency() -> Tick {
    use windows::Win32::System::Performance::QueryPerformanceFrequency;

    let mut freq: i64 = 0;
    unsafe {
        let _ = QueryPerformanceFrequency(&mut freq);
    }
    freq.max(1)
}

#[cfg(not(windows))]
fn query_tick_frequency() -> Tick {
    // Ticks are nanoseconds since process start off Windows.
    1_000_000_000
}

/// Ticks per second of the monotonic clock.
pub fn tick_frequency() -> Tick {
    *TICK_FREQUENCY
}

/// Current monotonic timestamp.
#[cfg(windows)]
pub fn now() -> Tick {
    use windows::Win32::System::Performance::QueryPerformanceCounter;

    let mut ticks: i64 = 0;
    unsafe {
        let _ = QueryPerformanceCounter(&mut ticks);
    }
    ticks
}

/// Current monotonic timestamp.
#[cfg(not(windows))]
pub fn now() -> Tick {
    use std::time::Instant;

    static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
    PROCESS_EPOCH.elapsed().as_nanos() as Tick
}

/// Convert a millisecond duration to ticks, rounded to the nearest tick.
pub fn ms_to_ticks(ms: f64) -> Tick {
    (ms * tick_frequency() as f64 / 1_000.0).round() as Tick
}

/// Convert a tick count to milliseconds.
pub fn ticks_to_ms(ticks: Tick) -> f64 {
    ticks as f64 * 1_000.0 / tick_frequency() as f64
}

// ── Multimedia timer resolution ─────────────────────────────────────────────

static RESOLUTION_HOLDS: AtomicUsize = AtomicUsize::new(0);

/// Request 1 ms OS timer granularity. Process-wide and reference-counted:
/// the first hold raises the resolution, further holds are free. Every
/// raise must be paired with [`lower_timer_resolution`].
pub fn raise_timer_resolution() {
    if RESOLUTION_HOLDS.fetch_add(1, Ordering::SeqCst) == 0 {
        begin_timer_period();
        log::debug!("multimedia timer resolution raised to 1ms");
    }
}

/// Release one hold on the 1 ms timer granularity; the last release
/// restores the system default. Unmatched releases are ignored.
pub fn lower_timer_resolution() {
    let mut holds = RESOLUTION_HOLDS.load(Ordering::SeqCst);
    loop {
        if holds == 0 {
            return;
        }
        match RESOLUTION_HOLDS.compare_exchange(
            holds,
            holds - 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break,
            Err(actual) => holds = actual,
        }
    }
    if holds == 1 {
        end_timer_period();
        log::debug!("multimedia timer resolution restored");
    }
}

#[cfg(windows)]
fn begin_timer_period() {
    use windows::Win32::Media::timeBeginPeriod;

    unsafe {
        let _ = timeBeginPeriod(1);
    }
}

#[cfg(not(windows))]
fn begin_timer_period() {}

#[cfg(windows)]
fn end_timer_period() {
    use windows::Win32::Media::timeEndPeriod;

    unsafe {
        let _ = timeEndPeriod(1);
    }
}

#[cfg(not(windows))]
fn end_timer_period() {}

// ── Precise sleep ───────────────────────────────────────────────────────────

/// Sleep for `ms` milliseconds with sub-millisecond accuracy.
///
/// Hybrid discipline: for waits over 2 ms the bulk is handed to the OS
/// coarse sleep (minus [`COARSE_SLEEP_SLACK_MS`] of slack), then the
/// remainder is spun down against the monotonic clock with hardware spin
/// hints. Coarse sleep alone drifts by up to a full timer tick; pure spin
/// burns a core. Returns immediately for zero or negative input.
pub fn precise_sleep(ms: f64) {
    if ms <= 0.0 {
        return;
    }

    let target = now() + ms_to_ticks(ms);

    if ms > 2.0 {
        thread::sleep(Duration::from_secs_f64((ms - COARSE_SLEEP_SLACK_MS) / 1_000.0));
    }

    while now() < target {
        std::hint::spin_loop();
    }
}
