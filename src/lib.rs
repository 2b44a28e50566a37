//! PacketLag SDK — transparent packet delay engine.
//!
//! Intercepts every IP packet entering or leaving the host through a kernel
//! diversion driver (WinDivert), holds each one for a configurable number
//! of milliseconds, and re-injects it in original order with minimum
//! jitter.
//!
//! Rust hosts use [`DelayEngine`] directly. GUI hosts (C#, C++, Python)
//! consume the `extern "C"` surface below via `cdylib`: `packetlag_init`,
//! `packetlag_start(delay_ms)`, `packetlag_stop`, observable getters, and
//! status/error callback registration. `build.rs` emits the matching C
//! header to `include/packetlag.h`.

mod buffer;
mod callbacks;
pub mod divert;
mod engine;
mod error;
mod events;
pub mod timing;

use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use callbacks::{register_error_callback, register_status_callback, ErrorCallback, StatusCallback};
pub use engine::{DelayEngine, DEFAULT_SEND_ERROR_REPORT_LIMIT, MAX_DELAY_MS};
pub use error::EngineError;
use error::{
    clear_error, last_error_code, set_engine_error, take_last_error, ERROR_NOT_INITIALIZED,
    SUCCESS,
};
pub use events::{EngineEvents, NullEvents};

// ── Global SDK state ────────────────────────────────────────────────────────

struct SdkState {
    engine: Arc<DelayEngine>,
}

static SDK: Lazy<Mutex<Option<SdkState>>> = Lazy::new(|| Mutex::new(None));

/// Bridges engine events onto the registered C callbacks.
struct ForwardingEvents;

impl EngineEvents for ForwardingEvents {
    fn on_status(&self, message: &str) {
        callbacks::fire_status(message);
    }
    fn on_error(&self, message: &str) {
        callbacks::fire_error(message);
    }
}

/// Convenience: run `body` against the engine while holding the SDK lock.
/// Returns `ERROR_NOT_INITIALIZED` (and sets the last-error) when the SDK
/// has not been initialised yet.
fn with_engine<F, R>(body: F) -> R
where
    F: FnOnce(&DelayEngine) -> R,
    R: From<i32>,
{
    let guard = SDK.lock();
    match guard.as_ref() {
        Some(state) => body(&state.engine),
        None => {
            set_engine_error(&EngineError::NotInitialized);
            R::from(ERROR_NOT_INITIALIZED)
        }
    }
}

/// Allocate a C string on the heap. Caller frees via `packetlag_free_string`.
fn to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn validate_delay(delay_ms: u32) -> Result<u64, EngineError> {
    let delay_ms = u64::from(delay_ms);
    if delay_ms > MAX_DELAY_MS {
        return Err(EngineError::InvalidParam(format!(
            "delay_ms must be in 0..={}, got {}",
            MAX_DELAY_MS, delay_ms
        )));
    }
    Ok(delay_ms)
}

// ═══════════════════════════════════════════════════════════════════════════
//  Core
// ═══════════════════════════════════════════════════════════════════════════

/// Initialise the SDK: create the logger and the (idle) engine.
/// Returns 0 on success.
#[no_mangle]
pub extern "C" fn packetlag_init() -> i32 {
    clear_error();

    let mut guard = SDK.lock();
    if guard.is_some() {
        return SUCCESS; // already initialised
    }

    // Initialise logger (ignore errors if already set)
    let _ = env_logger::try_init();

    log::info!("PacketLag SDK v{} initialising", env!("CARGO_PKG_VERSION"));

    *guard = Some(SdkState {
        engine: Arc::new(DelayEngine::new(Arc::new(ForwardingEvents))),
    });

    SUCCESS
}

/// Tear down the SDK: stop the engine if running, drop all state.
#[no_mangle]
pub extern "C" fn packetlag_cleanup() {
    clear_error();

    let mut guard = SDK.lock();
    if let Some(state) = guard.take() {
        state.engine.stop();
        log::info!("PacketLag SDK cleaned up");
    }
}

/// Return the SDK version string. Caller must free with
/// `packetlag_free_string`.
#[no_mangle]
pub extern "C" fn packetlag_version() -> *mut c_char {
    to_c_string(env!("CARGO_PKG_VERSION"))
}

/// Free a string previously returned by the SDK.
#[no_mangle]
pub unsafe extern "C" fn packetlag_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Engine control
// ═══════════════════════════════════════════════════════════════════════════

/// Start delaying traffic by `delay_ms` milliseconds (0..=1000).
/// Returns 0 on success, negative on error.
#[no_mangle]
pub extern "C" fn packetlag_start(delay_ms: u32) -> i32 {
    clear_error();

    let delay_ms = match validate_delay(delay_ms) {
        Ok(v) => v,
        Err(e) => {
            set_engine_error(&e);
            return e.code();
        }
    };

    with_engine(|engine| match engine.start(delay_ms) {
        Ok(()) => SUCCESS,
        Err(e) => {
            set_engine_error(&e);
            e.code()
        }
    })
}

/// Stop the engine and release every queued packet. No-op when idle.
#[no_mangle]
pub extern "C" fn packetlag_stop() -> i32 {
    clear_error();

    with_engine(|engine| {
        engine.stop();
        SUCCESS
    })
}

/// Change the delay applied to packets captured from now on (0..=1000).
/// Already-queued packets keep their original deadline.
#[no_mangle]
pub extern "C" fn packetlag_update_delay(delay_ms: u32) -> i32 {
    clear_error();

    let delay_ms = match validate_delay(delay_ms) {
        Ok(v) => v,
        Err(e) => {
            set_engine_error(&e);
            return e.code();
        }
    };

    with_engine(|engine| {
        engine.update_delay(delay_ms);
        SUCCESS
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  Observables
// ═══════════════════════════════════════════════════════════════════════════

/// Whether the engine is running. Returns 1 or 0.
#[no_mangle]
pub extern "C" fn packetlag_is_running() -> i32 {
    let guard = SDK.lock();
    match guard.as_ref() {
        Some(state) if state.engine.is_running() => 1,
        _ => 0,
    }
}

/// Currently configured delay in milliseconds, or a negative error code.
#[no_mangle]
pub extern "C" fn packetlag_current_delay() -> i64 {
    with_engine(|engine| engine.current_delay() as i64)
}

/// Number of packets waiting in the delay buffer, or a negative error code.
/// Cheap; intended for ~10 Hz UI polling.
#[no_mangle]
pub extern "C" fn packetlag_queued_packets() -> i64 {
    with_engine(|engine| engine.queued_packets() as i64)
}

/// Total packets re-injected since initialisation, or a negative error code.
#[no_mangle]
pub extern "C" fn packetlag_packets_sent() -> i64 {
    with_engine(|engine| engine.packets_sent() as i64)
}

// ═══════════════════════════════════════════════════════════════════════════
//  Callbacks
// ═══════════════════════════════════════════════════════════════════════════

/// Register a callback for engine status lines.
///
/// Signature: `fn(message: *const c_char, user_context: *mut c_void)`
#[no_mangle]
pub extern "C" fn packetlag_on_status(cb: StatusCallback, ctx: *mut c_void) {
    register_status_callback(cb, ctx);
}

/// Register a callback for engine error reports.
///
/// Signature: `fn(message: *const c_char, user_context: *mut c_void)`
#[no_mangle]
pub extern "C" fn packetlag_on_error(cb: ErrorCallback, ctx: *mut c_void) {
    register_error_callback(cb, ctx);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════════

/// Get the last error message. Returns null if no error.
/// Caller must free the returned string.
#[no_mangle]
pub extern "C" fn packetlag_get_last_error() -> *mut c_char {
    match take_last_error() {
        Some(msg) => to_c_string(&msg),
        None => ptr::null_mut(),
    }
}

/// Get the last error code. Returns 0 (`SUCCESS`) if no error.
#[no_mangle]
pub extern "C" fn packetlag_get_last_error_code() -> i32 {
    last_error_code()
}

/// Clear the stored error state.
#[no_mangle]
pub extern "C" fn packetlag_clear_error() {
    clear_error();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERROR_INVALID_PARAM;

    // One test for the whole FFI lifecycle: the SDK cell is process-global,
    // so interleaving multiple tests against it would race.
    #[test]
    fn ffi_lifecycle_against_global_state() {
        let _guard = crate::error::GLOBAL_STATE_TEST_LOCK.lock();

        // Observables before init report not-initialised.
        assert_eq!(packetlag_queued_packets(), i64::from(ERROR_NOT_INITIALIZED));
        assert_eq!(packetlag_is_running(), 0);

        assert_eq!(packetlag_init(), SUCCESS);
        assert_eq!(packetlag_init(), SUCCESS); // idempotent

        // Out-of-range delay is rejected at the boundary.
        assert_eq!(packetlag_update_delay(1_001), ERROR_INVALID_PARAM);
        assert_eq!(packetlag_get_last_error_code(), ERROR_INVALID_PARAM);
        let msg = packetlag_get_last_error();
        assert!(!msg.is_null());
        unsafe { packetlag_free_string(msg) };

        // In-range delay is stored even while idle.
        assert_eq!(packetlag_update_delay(250), SUCCESS);
        assert_eq!(packetlag_current_delay(), 250);
        assert_eq!(packetlag_queued_packets(), 0);

        // Stop while idle is a silent no-op.
        assert_eq!(packetlag_stop(), SUCCESS);

        let version = packetlag_version();
        assert!(!version.is_null());
        unsafe { packetlag_free_string(version) };

        packetlag_cleanup();
        assert_eq!(packetlag_is_running(), 0);
        packetlag_cleanup(); // idempotent
    }
}
