//! C-callable callback registry for engine status and error reports.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::CString;
use std::os::raw::{c_char, c_void};

// ── Callback type aliases ───────────────────────────────────────────────────

/// `fn(message: *const c_char, user_context: *mut c_void)`
pub type StatusCallback = Option<unsafe extern "C" fn(*const c_char, *mut c_void)>;

/// `fn(message: *const c_char, user_context: *mut c_void)`
pub type ErrorCallback = Option<unsafe extern "C" fn(*const c_char, *mut c_void)>;

// ── Send + Sync wrapper for raw pointers ────────────────────────────────────

/// Wrapper so that raw user-context pointers can be stored in a `Mutex`.
/// The caller is responsible for thread-safety of the pointed-to data.
#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl Default for SendPtr {
    fn default() -> Self {
        SendPtr(std::ptr::null_mut())
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CallbackRegistry {
    status_cb: StatusCallback,
    status_ctx: SendPtr,

    error_cb: ErrorCallback,
    error_ctx: SendPtr,
}

static CALLBACKS: Lazy<Mutex<CallbackRegistry>> =
    Lazy::new(|| Mutex::new(CallbackRegistry::default()));

// ── Registration ────────────────────────────────────────────────────────────

pub fn register_status_callback(cb: StatusCallback, ctx: *mut c_void) {
    let mut reg = CALLBACKS.lock();
    reg.status_cb = cb;
    reg.status_ctx = SendPtr(ctx);
}

pub fn register_error_callback(cb: ErrorCallback, ctx: *mut c_void) {
    let mut reg = CALLBACKS.lock();
    reg.error_cb = cb;
    reg.error_ctx = SendPtr(ctx);
}

// ── Invocation helpers ──────────────────────────────────────────────────────

/// Notify the host application of an engine status change.
pub fn fire_status(msg: &str) {
    let reg = CALLBACKS.lock();
    if let Some(cb) = reg.status_cb {
        let ctx = reg.status_ctx.0;
        // Drop lock before calling into foreign code to avoid deadlocks.
        drop(reg);
        if let Ok(c_msg) = CString::new(msg) {
            unsafe { cb(c_msg.as_ptr(), ctx) };
        }
    }
}

/// Notify the host application of an engine error.
pub fn fire_error(msg: &str) {
    let reg = CALLBACKS.lock();
    if let Some(cb) = reg.error_cb {
        let ctx = reg.error_ctx.0;
        drop(reg);
        if let Ok(c_msg) = CString::new(msg) {
            unsafe { cb(c_msg.as_ptr(), ctx) };
        }
    }
}
