//! Engine error types, FFI error codes, and last-error storage.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

// ── Error codes (stable C API contract) ─────────────────────────────────────

pub const SUCCESS: i32 = 0;
pub const ERROR_INVALID_PARAM: i32 = -1;
pub const ERROR_NOT_INITIALIZED: i32 = -2;
pub const ERROR_ALREADY_RUNNING: i32 = -3;
pub const ERROR_DRIVER: i32 = -4;
pub const ERROR_INTERNAL: i32 = -5;

// ── EngineError enum ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Packet diversion error: {0}")]
    Driver(String),

    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Not initialized")]
    NotInitialized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Map this error to its integer error code for the C API.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::Driver(_) => ERROR_DRIVER,
            EngineError::AlreadyRunning => ERROR_ALREADY_RUNNING,
            EngineError::InvalidParam(_) => ERROR_INVALID_PARAM,
            EngineError::NotInitialized => ERROR_NOT_INITIALIZED,
            EngineError::Internal(_) => ERROR_INTERNAL,
        }
    }
}

// ── Last-error storage ──────────────────────────────────────────────────────

static LAST_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));
static LAST_ERROR_CODE: Lazy<Mutex<i32>> = Lazy::new(|| Mutex::new(SUCCESS));

/// Store an `EngineError`, recording both the message and code.
pub fn set_engine_error(err: &EngineError) {
    *LAST_ERROR_CODE.lock() = err.code();
    *LAST_ERROR.lock() = Some(err.to_string());
}

/// Clear the stored error.
pub fn clear_error() {
    *LAST_ERROR.lock() = None;
    *LAST_ERROR_CODE.lock() = SUCCESS;
}

/// Take the last error message, leaving `None` behind.
pub fn take_last_error() -> Option<String> {
    LAST_ERROR.lock().take()
}

/// Return the last error code without clearing it.
pub fn last_error_code() -> i32 {
    *LAST_ERROR_CODE.lock()
}

/// Serializes tests that touch the process-global error cell.
#[cfg(test)]
pub(crate) static GLOBAL_STATE_TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_variants() {
        assert_eq!(EngineError::Driver("x".into()).code(), ERROR_DRIVER);
        assert_eq!(EngineError::AlreadyRunning.code(), ERROR_ALREADY_RUNNING);
        assert_eq!(
            EngineError::InvalidParam("x".into()).code(),
            ERROR_INVALID_PARAM
        );
        assert_eq!(EngineError::NotInitialized.code(), ERROR_NOT_INITIALIZED);
        assert_eq!(EngineError::Internal("x".into()).code(), ERROR_INTERNAL);
    }

    #[test]
    fn last_error_round_trip() {
        let _guard = GLOBAL_STATE_TEST_LOCK.lock();

        set_engine_error(&EngineError::AlreadyRunning);
        assert_eq!(last_error_code(), ERROR_ALREADY_RUNNING);
        assert_eq!(take_last_error().as_deref(), Some("Engine already running"));
        assert!(take_last_error().is_none());

        clear_error();
        assert_eq!(last_error_code(), SUCCESS);
    }
}
